use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::task::JoinHandle;

use super::source::{BlobWriter, ErrorCallback, Producer};
use super::{BlobSession, ScmSink, Teardown};
use crate::protocol::{Command, CommandPayload, RemoraError, ScmErrorKind, SessionControlMessage};

/// Sending role: idle until `ACK`, then streams the producer's bytes.
pub(crate) struct SenderSession {
    key: String,
    sink: Arc<dyn ScmSink>,
    chunk_size: usize,
    teardown: Teardown,
    on_error: Arc<Mutex<Option<ErrorCallback>>>,
    state: Mutex<SenderState>,
}

#[derive(Default)]
struct SenderState {
    producer: Option<Producer>,
    writer: Option<BlobWriter>,
    task: Option<JoinHandle<()>>,
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn report(on_error: &Mutex<Option<ErrorCallback>>, error: RemoraError) {
    let callback = lock(on_error).take();
    if let Some(callback) = callback {
        callback(error);
    }
}

impl SenderSession {
    pub(crate) fn new(
        key: String,
        producer: Producer,
        on_error: Option<ErrorCallback>,
        sink: Arc<dyn ScmSink>,
        chunk_size: usize,
        teardown: Teardown,
    ) -> Self {
        Self {
            key,
            sink,
            chunk_size,
            teardown,
            on_error: Arc::new(Mutex::new(on_error)),
            state: Mutex::new(SenderState {
                producer: Some(producer),
                ..Default::default()
            }),
        }
    }

    fn start(&self) {
        let mut state = lock(&self.state);
        let Some(producer) = state.producer.take() else {
            tracing::warn!("duplicate ACK for blob session {}", self.key);
            return;
        };

        let writer = BlobWriter::new(self.key.clone(), self.sink.clone(), self.chunk_size);
        state.writer = Some(writer.clone());

        let key = self.key.clone();
        let sink = self.sink.clone();
        let teardown = self.teardown.clone();
        let on_error = self.on_error.clone();
        tracing::debug!("blob session {} acknowledged, producing", key);

        state.task = Some(tokio::spawn(async move {
            match producer(writer.clone()).await {
                Ok(()) => {
                    if let Err(e) = writer.close().await {
                        tracing::warn!("blob session {} failed to close: {}", key, e);
                    }
                }
                Err(e) => {
                    tracing::warn!("blob producer for session {} failed: {}", key, e);
                    writer.poison().await;
                    let scm = SessionControlMessage::err(key.clone(), ScmErrorKind::Producer, e.to_string());
                    if let Err(e) = sink.send_scm(scm, None).await {
                        tracing::debug!("could not report producer failure for {}: {}", key, e);
                    }
                    report(&on_error, e);
                }
            }
            teardown.fire();
        }));
    }

    /// Ends the session, handing `error` to the source's callback.
    fn fail(&self, error: RemoraError) -> Option<BlobWriter> {
        let writer = {
            let mut state = lock(&self.state);
            if let Some(task) = state.task.take() {
                task.abort();
            }
            state.producer = None;
            state.writer.take()
        };
        report(&self.on_error, error);
        writer
    }
}

#[async_trait]
impl BlobSession for SenderSession {
    fn key(&self) -> &str {
        &self.key
    }

    async fn on_scm(&self, scm: SessionControlMessage, _chunk: Option<Vec<u8>>) {
        match (scm.command, scm.param) {
            (Command::Ack, _) => self.start(),
            (Command::Err, payload) => {
                let (kind, message) = match payload {
                    CommandPayload::Error { kind, message } => (kind, message),
                    _ => (ScmErrorKind::Aborted, "peer reported an error".to_string()),
                };
                let writer = self.fail(RemoraError::session(kind, message.clone()));
                if let Some(writer) = writer {
                    tracing::warn!(
                        "peer failed blob session {} ({}: {}), last chunks sent: {:?}",
                        self.key,
                        kind,
                        message,
                        writer.recent_chunks().await
                    );
                } else {
                    tracing::warn!("peer failed blob session {} ({}: {})", self.key, kind, message);
                }
                self.teardown.fire();
            }
            (command, _) => {
                let error = RemoraError::NotSupported(format!("{:?} on sending session", command));
                tracing::warn!("blob session {}: {}", self.key, error);
            }
        }
    }

    fn abort(&self) {
        self.fail(RemoraError::ClosedChannel);
    }
}
