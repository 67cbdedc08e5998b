//! Server dispatcher.
//!
//! The adapter accepts TCP connections, runs the server side of the
//! handshake, then reads requests until the peer goes away. Every request is
//! handled in its own task, so a slow handler never holds up the reader or
//! other requests on the same connection.
//!
//! # Connection Lifecycle
//!
//! 1. Accept, then negotiate with the service's [`Negotiator`]; a failed
//!    handshake drops only that connection
//! 2. Read records in order:
//!    - session control messages go to the connection's [`SessionRegistry`]
//!    - a request announcing a blob starts a receiver first; the handler reads
//!      the blob through `Request::take_blob_reader`
//!    - `__ping` is answered here
//!    - everything else goes to the [`ServiceRegistry`]
//! 3. On end of stream or a read error, cancel in-flight handlers and end all
//!    blob sessions of the connection

use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};

use futures::FutureExt;
use remora_common::protocol::{
    Command, RemoraError, Request, Response, Result, ServiceInfo, PING_ENDPOINT,
};
use remora_common::session::{BlobAttachment, Envelope, LinkSink, SessionRegistry};
use remora_common::transport::{link, FrameSink};
use remora_common::{negotiator_for, Converter, Negotiator, Role, TransportConfig};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinHandle, JoinSet};

use crate::registry::ServiceRegistry;

/// State shared by the accept loop and every connection task.
struct Shared {
    registry: ServiceRegistry,
    config: TransportConfig,
    converter: Converter,
    negotiator: Box<dyn Negotiator>,
}

struct Listening {
    local_addr: SocketAddr,
    accept: JoinHandle<()>,
}

/// Serves one [`ServiceRegistry`] over TCP.
///
/// # Example
///
/// ```no_run
/// use remora_common::ServiceInfo;
/// use remora_server::{ServiceAdapter, ServiceRegistry};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let registry = ServiceRegistry::new(ServiceInfo::new("echo", "1.0"));
/// let adapter = ServiceAdapter::new(registry)?;
/// let hint = adapter.listen("127.0.0.1:0").await?;
/// println!("serving on {}", hint);
/// adapter.close().await;
/// # Ok(())
/// # }
/// ```
pub struct ServiceAdapter {
    shared: Arc<Shared>,
    listening: Mutex<Option<Listening>>,
}

impl ServiceAdapter {
    pub fn new(registry: ServiceRegistry) -> Result<Self> {
        Self::with_config(registry, TransportConfig::default())
    }

    pub fn with_config(registry: ServiceRegistry, config: TransportConfig) -> Result<Self> {
        config.validate()?;
        let converter = Converter::from_name(&registry.service().converter)?;
        let negotiator = negotiator_for(&registry.service().negotiator)?;
        Ok(Self {
            shared: Arc::new(Shared {
                registry,
                config,
                converter,
                negotiator,
            }),
            listening: Mutex::new(None),
        })
    }

    fn state(&self) -> std::sync::MutexGuard<'_, Option<Listening>> {
        match self.listening.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Binds `bind_addr` and starts accepting. Returns the connectivity hint
    /// to publish: the bound address.
    pub async fn listen(&self, bind_addr: &str) -> Result<String> {
        if self.state().is_some() {
            return Err(RemoraError::InvalidConfig(
                "adapter is already listening".to_string(),
            ));
        }

        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|e| RemoraError::Connection(format!("Failed to bind to {}: {}", bind_addr, e)))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| RemoraError::Connection(format!("Failed to get local addr: {}", e)))?;

        let accept = tokio::spawn(accept_loop(listener, self.shared.clone()));
        let mut state = self.state();
        if state.is_some() {
            accept.abort();
            return Err(RemoraError::InvalidConfig(
                "adapter is already listening".to_string(),
            ));
        }
        *state = Some(Listening { local_addr, accept });

        tracing::info!(
            "service '{}' listening on {}",
            self.shared.registry.service().name,
            local_addr
        );
        Ok(local_addr.to_string())
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.state().as_ref().map(|l| l.local_addr)
    }

    /// The served descriptor with its connectivity hint filled in, ready to
    /// publish. `None` until [`listen`](Self::listen) succeeded.
    pub fn advertised(&self) -> Option<ServiceInfo> {
        let addr = self.local_addr()?;
        let mut service = self.shared.registry.service().clone();
        service.set_hint(addr.to_string()).ok()?;
        Some(service)
    }

    /// Stops accepting and cancels every connection and in-flight handler.
    pub async fn close(&self) {
        let Some(listening) = self.state().take() else {
            return;
        };
        listening.accept.abort();
        // the accept task owns the listener and the connection tasks
        let _ = listening.accept.await;
        tracing::info!("stopped listening on {}", listening.local_addr);
    }
}

impl Drop for ServiceAdapter {
    fn drop(&mut self) {
        if let Some(listening) = self.state().take() {
            listening.accept.abort();
        }
    }
}

async fn accept_loop(listener: TcpListener, shared: Arc<Shared>) {
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tracing::debug!("connection established from {}", peer);
                    connections.spawn(serve_connection(stream, peer, shared.clone()));
                }
                Err(e) => tracing::warn!("failed to accept connection: {}", e),
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }
}

/// Ends the blob sessions of a connection however its task exits.
struct SessionsGuard(SessionRegistry);

impl Drop for SessionsGuard {
    fn drop(&mut self) {
        self.0.abort_all();
    }
}

async fn serve_connection(stream: TcpStream, peer: SocketAddr, shared: Arc<Shared>) {
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!("failed to set TCP_NODELAY for {}: {}", peer, e);
    }

    let socket = match shared
        .negotiator
        .handshake(
            Box::new(stream),
            shared.registry.service(),
            &shared.converter,
            Role::Server,
            &shared.config,
        )
        .await
    {
        Ok(socket) => socket,
        Err(e) => {
            tracing::warn!("handshake with {} failed: {}", peer, e);
            return;
        }
    };

    let (mut source, sink) = link::split(socket, shared.converter, shared.config.max_frame_size);
    let sink = Arc::new(sink);
    let sessions = SessionRegistry::new(shared.config.chunk_size);
    let _guard = SessionsGuard(sessions.clone());
    let scm_sink = LinkSink::new(sink.clone(), Envelope::Response);
    let mut handlers = JoinSet::new();

    loop {
        while handlers.try_join_next().is_some() {}

        let mut request = match source.recv::<Request>().await {
            Ok(Some(request)) => request,
            Ok(None) => {
                tracing::debug!("connection from {} closed by peer", peer);
                break;
            }
            Err(RemoraError::Serialization(e)) => {
                tracing::warn!("undecodable request from {}: {}", peer, e);
                respond(&sink, Response::bad_request(e.to_string())).await;
                continue;
            }
            Err(e) => {
                tracing::warn!("connection from {} failed: {}", peer, e);
                break;
            }
        };

        if let Some(scm) = request.scm.take() {
            let chunk = if scm.command == Command::Chunk {
                match source.recv_chunk().await {
                    Ok(chunk) => Some(chunk),
                    Err(e) => {
                        tracing::warn!("failed to read chunk frame from {}: {}", peer, e);
                        break;
                    }
                }
            } else {
                None
            };
            sessions.route(scm, chunk).await;
            continue;
        }

        if let Some(reference) = request.session.clone() {
            match sessions.start_receiver(&reference, scm_sink.clone()).await {
                Ok(reader) => request.blob = Some(BlobAttachment::Incoming(reader)),
                Err(e) => {
                    let response = Response::error(e.status(), e.to_string()).with_nonce(request.nonce);
                    respond(&sink, response).await;
                    continue;
                }
            }
        }

        handlers.spawn(handle_request(
            request,
            shared.clone(),
            sink.clone(),
            sessions.clone(),
            scm_sink.clone(),
        ));
    }

    handlers.abort_all();
    sink.shutdown().await;
}

async fn respond(sink: &FrameSink, response: Response) {
    if let Err(e) = sink.send(&response, None).await {
        tracing::debug!("failed to send response {}: {}", response.nonce, e);
    }
}

async fn handle_request(
    request: Request,
    shared: Arc<Shared>,
    sink: Arc<FrameSink>,
    sessions: SessionRegistry,
    scm_sink: Arc<LinkSink>,
) {
    let nonce = request.nonce;
    tracing::debug!("request {} -> {}", nonce, request.endpoint);

    let response = if request.endpoint == PING_ENDPOINT {
        Response::success(serde_json::Value::Null)
    } else {
        match AssertUnwindSafe(shared.registry.dispatch(request))
            .catch_unwind()
            .await
        {
            Ok(response) => response,
            Err(_) => {
                tracing::error!("handler for request {} panicked", nonce);
                Response::internal_error("handler panicked")
            }
        }
    };
    let mut response = response.with_nonce(nonce);

    let mut streaming = None;
    match response.blob.take() {
        Some(BlobAttachment::Outgoing(source)) => {
            let started = sessions
                .start_sender(source, scm_sink)
                .and_then(|reference| {
                    let body = shared.converter.to_generic(&reference)?;
                    Ok((reference, body))
                });
            match started {
                Ok((reference, body)) => {
                    response.body = body;
                    response.has_session_switch = true;
                    streaming = Some(reference.key);
                }
                Err(e) => {
                    tracing::error!("failed to start blob for request {}: {}", nonce, e);
                    response = Response::error(e.status(), e.to_string()).with_nonce(nonce);
                }
            }
        }
        Some(BlobAttachment::Incoming(_)) => {
            tracing::warn!("response {} carries an incoming blob, dropped", nonce);
        }
        None => {}
    }

    if let Err(e) = sink.send(&response, None).await {
        tracing::debug!("failed to send response {}: {}", nonce, e);
        if let Some(key) = streaming {
            sessions.abort(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::handler_fn;
    use remora_common::protocol::{ControllerInfo, Endpoint};

    fn service() -> ServiceInfo {
        ServiceInfo::new("echo", "1.0").with_controller(ControllerInfo::new("Echo", "1"))
    }

    #[tokio::test]
    async fn test_listen_returns_bound_address() {
        let adapter = ServiceAdapter::new(ServiceRegistry::new(service())).unwrap();
        let hint = adapter.listen("127.0.0.1:0").await.unwrap();
        assert_eq!(Some(hint.clone()), adapter.local_addr().map(|a| a.to_string()));
        assert_ne!(hint, "127.0.0.1:0");

        let advertised = adapter.advertised().unwrap();
        assert_eq!(advertised.hint(), Some(hint.as_str()));
        assert_eq!(advertised.fingerprint(), service().fingerprint());
        adapter.close().await;
    }

    #[tokio::test]
    async fn test_listen_twice_rejected() {
        let adapter = ServiceAdapter::new(ServiceRegistry::new(service())).unwrap();
        adapter.listen("127.0.0.1:0").await.unwrap();
        assert!(adapter.listen("127.0.0.1:0").await.is_err());
        adapter.close().await;
    }

    #[tokio::test]
    async fn test_close_releases_port() {
        let adapter = ServiceAdapter::new(ServiceRegistry::new(service())).unwrap();
        let hint = adapter.listen("127.0.0.1:0").await.unwrap();
        adapter.close().await;
        assert!(adapter.local_addr().is_none());

        let rebound = TcpListener::bind(&hint).await;
        assert!(rebound.is_ok());
    }

    #[tokio::test]
    async fn test_panicking_handler_becomes_internal_error() {
        let boom = Endpoint::builder("Echo", "boom").build().unwrap();
        let mut registry = ServiceRegistry::new(service());
        registry
            .register(
                boom.clone(),
                handler_fn(|request| async move {
                    if request.params.is_empty() {
                        panic!("handler bug");
                    }
                    Ok(Response::success(serde_json::Value::Null))
                }),
            )
            .unwrap();
        let shared = Arc::new(Shared {
            registry,
            config: TransportConfig::default(),
            converter: Converter::new(),
            negotiator: negotiator_for("plain").unwrap(),
        });

        let (client, server) = tokio::io::duplex(64 * 1024);
        let (mut source, _client_sink) = link::split(Box::new(client), Converter::new(), 1024 * 1024);
        let (_server_source, sink) = link::split(Box::new(server), Converter::new(), 1024 * 1024);
        let sink = Arc::new(sink);
        let sessions = SessionRegistry::new(1024);
        let scm_sink = LinkSink::new(sink.clone(), Envelope::Response);

        handle_request(
            Request::new(boom.unique(), Vec::new()).with_nonce(3),
            shared,
            sink,
            sessions,
            scm_sink,
        )
        .await;

        let response: Response = source.recv().await.unwrap().unwrap();
        assert_eq!(response.nonce, 3);
        assert_eq!(response.code, 500);
    }

    #[test]
    fn test_unknown_negotiator_rejected() {
        let registry = ServiceRegistry::new(service().with_negotiator("tls"));
        assert!(matches!(
            ServiceAdapter::new(registry),
            Err(RemoraError::InvalidConfig(_))
        ));
    }
}
