use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use remora_common::protocol::{
    BlobSessionRef, Command, ControllerInfo, Endpoint, Nonce, Param, ParamValue, RemoraError,
    Request, Response, Result, ScmErrorKind, ServiceInfo, SessionControlMessage, SlotKind, Status,
};
use remora_common::session::{
    BlobAttachment, BlobSource, Envelope, LinkSink, ScmSink, SessionRegistry,
};
use remora_common::transport::{link, tcp, BoxedSocket, FrameSink, FrameSource};
use remora_common::{negotiator_for, Converter, Negotiator, Role, TransportConfig};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::RemoteService;

/// One argument of a call: a plain value or a blob to stream.
#[derive(Debug)]
pub enum Arg {
    Value(serde_json::Value),
    Blob(BlobSource),
}

impl Arg {
    /// Converts any serializable value into an argument.
    pub fn value<T: serde::Serialize + ?Sized>(value: &T) -> Result<Self> {
        Ok(Arg::Value(serde_json::to_value(value)?))
    }
}

impl From<serde_json::Value> for Arg {
    fn from(value: serde_json::Value) -> Self {
        Arg::Value(value)
    }
}

impl From<BlobSource> for Arg {
    fn from(source: BlobSource) -> Self {
        Arg::Blob(source)
    }
}

/// Callers waiting for a response, keyed by nonce.
#[derive(Default)]
struct PendingTable {
    waiters: Mutex<HashMap<Nonce, oneshot::Sender<Response>>>,
}

impl PendingTable {
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Nonce, oneshot::Sender<Response>>> {
        match self.waiters.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn insert(&self, nonce: Nonce) -> oneshot::Receiver<Response> {
        let (tx, rx) = oneshot::channel();
        self.lock().insert(nonce, tx);
        rx
    }

    fn remove(&self, nonce: Nonce) {
        self.lock().remove(&nonce);
    }

    /// Hands `response` to its caller. A response nobody is waiting for is
    /// given back.
    fn deliver(&self, response: Response) -> Option<Response> {
        let waiter = self.lock().remove(&response.nonce);
        match waiter {
            // the caller may have given up already
            Some(tx) => tx.send(response).err(),
            None => {
                tracing::debug!("no caller waiting for nonce {}", response.nonce);
                Some(response)
            }
        }
    }

    /// Wakes every waiter with a `CHANNEL_CLOSED` response.
    fn flush_closed(&self) {
        let waiters: Vec<_> = self.lock().drain().collect();
        if !waiters.is_empty() {
            tracing::debug!("flushing {} pending requests as closed", waiters.len());
        }
        for (nonce, tx) in waiters {
            let _ = tx.send(Response::closed().with_nonce(nonce));
        }
    }
}

/// Removes a pending entry on every exit path of a request.
struct PendingGuard<'a> {
    pending: &'a PendingTable,
    nonce: Nonce,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(self.nonce);
    }
}

/// Tells the server to drop the blob announced by a response whose caller
/// is gone. Until then its sender would sit idle waiting for an `ACK`.
fn decline_download(sink: &Arc<LinkSink>, converter: Converter, response: Response) {
    if !(response.is_successful && response.has_session_switch) {
        return;
    }
    let nonce = response.nonce;
    let reference: BlobSessionRef = match converter.resolve(response.body) {
        Ok(reference) => reference,
        Err(e) => {
            tracing::debug!("abandoned response {} has no usable session reference: {}", nonce, e);
            return;
        }
    };

    tracing::debug!("declining blob session {} of abandoned request {}", reference.key, nonce);
    let sink = sink.clone();
    tokio::spawn(async move {
        let scm = SessionControlMessage::err(
            reference.key.clone(),
            ScmErrorKind::Aborted,
            "caller stopped waiting for the response",
        );
        if let Err(e) = sink.send_scm(scm, None).await {
            tracing::debug!("could not decline blob session {}: {}", reference.key, e);
        }
    });
}

/// A negotiated physical connection and its reader task.
struct Link {
    sink: Arc<FrameSink>,
    pending: Arc<PendingTable>,
    sessions: SessionRegistry,
    valid: Arc<AtomicBool>,
    reader: JoinHandle<()>,
}

impl Link {
    fn start(socket: BoxedSocket, converter: Converter, config: &TransportConfig) -> Self {
        let (source, sink) = link::split(socket, converter, config.max_frame_size);
        let sink = Arc::new(sink);
        let pending = Arc::new(PendingTable::default());
        let sessions = SessionRegistry::new(config.chunk_size);
        let valid = Arc::new(AtomicBool::new(true));

        let reader = tokio::spawn(read_loop(
            source,
            sink.clone(),
            converter,
            ReaderExit {
                valid: valid.clone(),
                pending: pending.clone(),
                sessions: sessions.clone(),
            },
        ));

        Self {
            sink,
            pending,
            sessions,
            valid,
            reader,
        }
    }

    fn is_valid(&self) -> bool {
        self.valid.load(Ordering::SeqCst) && !self.sink.is_poisoned()
    }

    fn session_sink(&self) -> Arc<LinkSink> {
        LinkSink::new(self.sink.clone(), Envelope::Request)
    }

    async fn shutdown(&self) {
        self.valid.store(false, Ordering::SeqCst);
        self.reader.abort();
        self.pending.flush_closed();
        self.sessions.abort_all();
        if tokio::time::timeout(Duration::from_secs(1), self.sink.shutdown())
            .await
            .is_err()
        {
            tracing::debug!("write half busy, dropping it without shutdown");
        }
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        self.reader.abort();
        self.sessions.abort_all();
    }
}

/// Marks the link dead and wakes everyone waiting on it. Runs however the
/// reader ends: end of stream, a read error, abort or panic.
struct ReaderExit {
    valid: Arc<AtomicBool>,
    pending: Arc<PendingTable>,
    sessions: SessionRegistry,
}

impl Drop for ReaderExit {
    fn drop(&mut self) {
        self.valid.store(false, Ordering::SeqCst);
        self.pending.flush_closed();
        self.sessions.abort_all();
    }
}

/// Background reader: one per physical connection.
///
/// Also stops once the write half is poisoned: a torn request frame leaves
/// the server unable to parse anything after it.
async fn read_loop(mut source: FrameSource, sink: Arc<FrameSink>, converter: Converter, exit: ReaderExit) {
    let pending = exit.pending.clone();
    let sessions = exit.sessions.clone();
    let scm_sink = LinkSink::new(sink.clone(), Envelope::Request);

    loop {
        let next = tokio::select! {
            next = source.recv::<Response>() => next,
            _ = sink.closed() => {
                tracing::warn!("write half failed, dropping connection");
                break;
            }
        };

        match next {
            Ok(Some(mut response)) => {
                if let Some(scm) = response.scm.take() {
                    let chunk = if scm.command == Command::Chunk {
                        match source.recv_chunk().await {
                            Ok(chunk) => Some(chunk),
                            Err(e) => {
                                tracing::warn!("failed to read chunk frame: {}", e);
                                break;
                            }
                        }
                    } else {
                        None
                    };
                    sessions.route(scm, chunk).await;
                    continue;
                }
                tracing::debug!("response for nonce {} ({})", response.nonce, response.code);
                if let Some(orphan) = pending.deliver(response) {
                    decline_download(&scm_sink, converter, orphan);
                }
            }
            Ok(None) => {
                tracing::debug!("connection closed by server");
                break;
            }
            Err(e) => {
                tracing::warn!("connection read failed: {}", e);
                break;
            }
        }
    }
    drop(exit);
}

/// Client side of one service connection.
///
/// Many tasks may call [`request`](Self::request) concurrently; every call is
/// matched to its response by nonce. [`open`](Self::open) and
/// [`close`](Self::close) are counted: only the first open connects and
/// negotiates, only the last close disconnects.
///
/// # Example
///
/// ```no_run
/// use remora_client::{Arg, ServiceProxy};
/// use remora_common::{Endpoint, ServiceInfo};
/// use serde_json::json;
/// use std::time::Duration;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let service = ServiceInfo::new("echo", "1.0");
/// let proxy = ServiceProxy::new("127.0.0.1:7000", service)?;
/// proxy.open().await?;
///
/// let echo = Endpoint::builder("Echo", "echo").param("string").returns("string").build()?;
/// let response = proxy
///     .request(&echo, Duration::from_secs(1), vec![Arg::Value(json!("hello"))])
///     .await?;
/// assert_eq!(response.body, json!("hello"));
///
/// proxy.close(false).await;
/// # Ok(())
/// # }
/// ```
pub struct ServiceProxy {
    address: String,
    service: ServiceInfo,
    config: TransportConfig,
    converter: Converter,
    negotiator: Box<dyn Negotiator>,
    next_nonce: AtomicU64,
    opens: tokio::sync::Mutex<usize>,
    link: Mutex<Option<Arc<Link>>>,
}

impl ServiceProxy {
    pub fn new(address: impl Into<String>, service: ServiceInfo) -> Result<Self> {
        Self::with_config(address, service, TransportConfig::default())
    }

    pub fn with_config(
        address: impl Into<String>,
        service: ServiceInfo,
        config: TransportConfig,
    ) -> Result<Self> {
        config.validate()?;
        let converter = Converter::from_name(&service.converter)?;
        let negotiator = negotiator_for(&service.negotiator)?;
        Ok(Self {
            address: address.into(),
            service,
            config,
            converter,
            negotiator,
            next_nonce: AtomicU64::new(1),
            opens: tokio::sync::Mutex::new(0),
            link: Mutex::new(None),
        })
    }

    /// Builds a proxy from a discovered service whose hint is its address.
    pub fn from_service(service: ServiceInfo, config: TransportConfig) -> Result<Self> {
        let address = service
            .hint()
            .ok_or_else(|| {
                RemoraError::InvalidConfig(format!("service '{}' has no address hint", service.name))
            })?
            .to_string();
        Self::with_config(address, service, config)
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn service(&self) -> &ServiceInfo {
        &self.service
    }

    pub fn provides(&self, controller: &ControllerInfo) -> bool {
        self.service.provides(controller)
    }

    fn current(&self) -> Option<Arc<Link>> {
        match self.link.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn replace(&self, link: Option<Arc<Link>>) -> Option<Arc<Link>> {
        let mut guard = match self.link.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        std::mem::replace(&mut *guard, link)
    }

    pub fn is_open(&self) -> bool {
        self.current().map(|link| link.is_valid()).unwrap_or(false)
    }

    /// Opens the connection, or joins an already open one.
    ///
    /// A connection whose reader has died is reconnected.
    pub async fn open(&self) -> Result<()> {
        let mut opens = self.opens.lock().await;
        if *opens > 0 && self.is_open() {
            *opens += 1;
            return Ok(());
        }

        if let Some(stale) = self.replace(None) {
            stale.shutdown().await;
        }

        tracing::debug!("connecting to {} for service '{}'", self.address, self.service.name);
        let stream = tcp::connect(&self.address, self.config.connect_timeout).await?;
        let socket = self
            .negotiator
            .handshake(
                Box::new(stream),
                &self.service,
                &self.converter,
                Role::Client,
                &self.config,
            )
            .await?;

        self.replace(Some(Arc::new(Link::start(socket, self.converter, &self.config))));
        *opens += 1;
        tracing::info!("connected to {} (service '{}')", self.address, self.service.name);
        Ok(())
    }

    /// Releases one open. The connection is torn down when the count reaches
    /// zero, or at once when `force` is set.
    pub async fn close(&self, force: bool) {
        let mut opens = self.opens.lock().await;
        if *opens == 0 {
            return;
        }
        *opens = if force { 0 } else { *opens - 1 };
        if *opens > 0 {
            return;
        }

        if let Some(link) = self.replace(None) {
            link.shutdown().await;
            tracing::info!("closed connection to {}", self.address);
        }
    }

    fn build_request(&self, endpoint: &Endpoint, args: Vec<Arg>) -> Result<(Request, Option<BlobSource>)> {
        let specs = endpoint.params();
        if specs.len() != args.len() {
            return Err(RemoraError::InvalidRequest(format!(
                "endpoint {}.{} takes {} arguments, got {}",
                endpoint.controller(),
                endpoint.method(),
                specs.len(),
                args.len()
            )));
        }

        let mut params = Vec::with_capacity(args.len());
        let mut blob = None;
        for (spec, arg) in specs.iter().zip(args) {
            let value = match (spec.kind, arg) {
                (SlotKind::Value, Arg::Value(value)) => ParamValue::Value(value),
                (SlotKind::Blob, Arg::Blob(source)) => {
                    blob = Some(source);
                    ParamValue::Blob
                }
                (kind, _) => {
                    return Err(RemoraError::InvalidRequest(format!(
                        "argument {} of {}.{} must be a {:?} slot",
                        spec.order,
                        endpoint.controller(),
                        endpoint.method(),
                        kind
                    )))
                }
            };
            params.push(Param {
                order: spec.order,
                type_name: spec.type_name.clone(),
                value,
            });
        }
        Ok((Request::new(endpoint.unique(), params), blob))
    }

    /// Calls `endpoint` and waits up to `timeout` for its response. The
    /// bound covers sending the request and waiting for the answer.
    ///
    /// Transport trouble comes back as an error response (`TIMEOUT`,
    /// `CHANNEL_CLOSED`), never as `Err`. `Err` is reserved for misuse: a
    /// connection that is not open, or arguments that do not fit the
    /// endpoint.
    pub async fn request(&self, endpoint: &Endpoint, timeout: Duration, args: Vec<Arg>) -> Result<Response> {
        let link = self
            .current()
            .filter(|link| link.is_valid())
            .ok_or(RemoraError::ClosedChannel)?;

        let deadline = tokio::time::Instant::now() + timeout;
        let (mut request, blob) = self.build_request(endpoint, args)?;
        let streaming = blob.is_some();
        if let Some(source) = blob {
            request.session = Some(link.sessions.start_sender(source, link.session_sink())?);
        }

        let nonce = self.next_nonce.fetch_add(1, Ordering::Relaxed);
        request.nonce = nonce;
        let mut rx = link.pending.insert(nonce);
        let _guard = PendingGuard {
            pending: &link.pending,
            nonce,
        };

        tracing::debug!("request {} -> {}", nonce, endpoint.unique());
        let timeout_ms = timeout.as_millis() as u64;
        // chunked uploads routinely outlast the call timeout
        let write_bound = if streaming {
            None
        } else {
            Some(deadline.saturating_duration_since(tokio::time::Instant::now()))
        };
        if let Err(e) = link.sink.send(&request, write_bound).await {
            if let Some(session) = &request.session {
                link.sessions.abort(&session.key);
            }
            tracing::debug!("request {} failed to send: {}", nonce, e);
            return Ok(match e {
                RemoraError::Timeout(_) => Response::timeout(timeout_ms),
                other => Response::error(other.status(), other.to_string()),
            }
            .with_nonce(nonce));
        }

        let mut response = match tokio::time::timeout_at(deadline, &mut rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => Response::closed(),
            Err(_) => {
                tracing::debug!("request {} timed out after {}ms", nonce, timeout_ms);
                // a response that slipped in as the deadline fired is not read
                rx.close();
                if let Ok(late) = rx.try_recv() {
                    decline_download(&link.session_sink(), self.converter, late);
                }
                Response::timeout(timeout_ms)
            }
        }
        .with_nonce(nonce);

        if response.is_successful && response.has_session_switch {
            response = self.attach_download(&link, response).await;
        }
        Ok(response)
    }

    /// Starts receiving the blob announced by `response`.
    async fn attach_download(&self, link: &Link, mut response: Response) -> Response {
        let nonce = response.nonce;
        let reference: BlobSessionRef = match self.converter.resolve(response.body.clone()) {
            Ok(reference) => reference,
            Err(e) => {
                return Response::error(
                    Status::InternalServerError,
                    format!("malformed blob session reference: {}", e),
                )
                .with_nonce(nonce)
            }
        };

        match link.sessions.start_receiver(&reference, link.session_sink()).await {
            Ok(reader) => {
                response.blob = Some(BlobAttachment::Incoming(reader));
                response
            }
            Err(e) => Response::error(e.status(), e.to_string()).with_nonce(nonce),
        }
    }

    /// Round trip of the built-in `__ping` endpoint.
    pub async fn ping(&self, timeout: Duration) -> Result<Duration> {
        let started = Instant::now();
        let response = self.request(&Endpoint::ping(), timeout, Vec::new()).await?;
        match response.status() {
            Some(Status::Ok) => Ok(started.elapsed()),
            Some(Status::Timeout) => Err(RemoraError::Timeout(timeout.as_millis() as u64)),
            Some(Status::ChannelClosed) => Err(RemoraError::ClosedChannel),
            _ => Err(RemoraError::InvalidResponse(format!(
                "ping answered {}: {}",
                response.code, response.body
            ))),
        }
    }
}

impl std::fmt::Debug for ServiceProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceProxy")
            .field("address", &self.address)
            .field("service", &self.service.name)
            .field("open", &self.is_open())
            .finish()
    }
}

#[async_trait]
impl RemoteService for ServiceProxy {
    async fn request(&self, endpoint: &Endpoint, timeout: Duration, args: Vec<Arg>) -> Result<Response> {
        ServiceProxy::request(self, endpoint, timeout, args).await
    }

    fn converter(&self) -> Converter {
        self.converter
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn echo() -> Endpoint {
        Endpoint::builder("Echo", "echo")
            .param("string")
            .returns("string")
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_request_on_unopened_proxy_fails() {
        let proxy = ServiceProxy::new("127.0.0.1:1", ServiceInfo::new("echo", "1.0")).unwrap();
        let result = proxy
            .request(&echo(), Duration::from_millis(100), vec![Arg::Value(json!("x"))])
            .await;
        assert!(matches!(result, Err(RemoraError::ClosedChannel)));
    }

    #[tokio::test]
    async fn test_open_unreachable_fails() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let proxy = ServiceProxy::new(addr, ServiceInfo::new("echo", "1.0")).unwrap();
        assert!(matches!(proxy.open().await, Err(RemoraError::Connection(_))));
        assert!(!proxy.is_open());
    }

    #[test]
    fn test_argument_shape_is_checked() {
        let proxy = ServiceProxy::new("127.0.0.1:1", ServiceInfo::new("echo", "1.0")).unwrap();

        let missing = proxy.build_request(&echo(), Vec::new());
        assert!(matches!(missing, Err(RemoraError::InvalidRequest(_))));

        let blob_in_value_slot = proxy.build_request(
            &echo(),
            vec![Arg::Blob(BlobSource::from_bytes("text/plain", vec![1]))],
        );
        assert!(matches!(blob_in_value_slot, Err(RemoraError::InvalidRequest(_))));

        let (request, blob) = proxy.build_request(&echo(), vec![json!("hi").into()]).unwrap();
        assert_eq!(request.endpoint, echo().unique());
        assert_eq!(request.params[0].type_name, "string");
        assert!(blob.is_none());
    }

    #[test]
    fn test_unknown_converter_rejected() {
        let service = ServiceInfo::new("echo", "1.0").with_converter("bson");
        assert!(matches!(
            ServiceProxy::new("127.0.0.1:1", service),
            Err(RemoraError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_from_service_needs_hint() {
        let service = ServiceInfo::new("echo", "1.0");
        assert!(ServiceProxy::from_service(service.clone(), TransportConfig::default()).is_err());

        let mut service = service;
        service.set_hint("127.0.0.1:9").unwrap();
        let proxy = ServiceProxy::from_service(service, TransportConfig::default()).unwrap();
        assert_eq!(proxy.address(), "127.0.0.1:9");
    }

    #[test]
    fn test_pending_table_flush_wakes_waiters() {
        let table = PendingTable::default();
        let mut first = table.insert(1);
        let mut second = table.insert(2);

        table.flush_closed();
        assert_eq!(first.try_recv().unwrap().code, 510);
        assert_eq!(second.try_recv().unwrap().nonce, 2);
    }

    #[test]
    fn test_pending_guard_removes_entry() {
        let table = PendingTable::default();
        let _rx = table.insert(5);
        {
            let _guard = PendingGuard {
                pending: &table,
                nonce: 5,
            };
        }
        assert!(table.lock().is_empty());
    }
}
