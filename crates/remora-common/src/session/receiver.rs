use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{BlobSession, ScmSink, Teardown};
use crate::protocol::{
    ChunkType, Command, CommandPayload, RemoraError, Result, ScmErrorKind, SessionControlMessage,
    CHUNK_DELIMITER,
};

type ChunkSender = mpsc::UnboundedSender<Result<Vec<u8>>>;

/// Counters kept by the receiving side of a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferStats {
    pub chunks: u64,
    pub bytes: u64,
    pub saw_last: bool,
    pub resets: u32,
}

/// Receiving role: sends `ACK` on open, then pipes chunks to a [`BlobReader`].
pub(crate) struct ReceiverSession {
    key: String,
    sink: Arc<dyn ScmSink>,
    teardown: Teardown,
    pipe: Mutex<Option<ChunkSender>>,
    stats: Arc<Mutex<TransferStats>>,
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl ReceiverSession {
    pub(crate) fn new(
        key: String,
        mime: String,
        sink: Arc<dyn ScmSink>,
        teardown: Teardown,
    ) -> (Self, BlobReader) {
        // unbounded: the connection read loop never waits on a slow reader
        let (tx, rx) = mpsc::unbounded_channel();
        let stats = Arc::new(Mutex::new(TransferStats::default()));
        let session = Self {
            key: key.clone(),
            sink,
            teardown,
            pipe: Mutex::new(Some(tx)),
            stats: stats.clone(),
        };
        let reader = BlobReader {
            key,
            mime,
            rx,
            stats,
        };
        (session, reader)
    }

    /// Asks the peer for the first chunk.
    pub(crate) async fn open(&self) -> Result<()> {
        self.sink
            .send_scm(SessionControlMessage::ack(self.key.clone()), None)
            .await
    }

    fn push(&self, item: Result<Vec<u8>>) {
        if let Some(tx) = lock(&self.pipe).as_ref() {
            // the reader may already be gone
            let _ = tx.send(item);
        }
    }

    /// Leaves the registry, then ends the reader's stream.
    fn finish(&self, error: Option<RemoraError>) {
        self.teardown.fire();
        let tx = lock(&self.pipe).take();
        if let (Some(tx), Some(error)) = (tx, error) {
            let _ = tx.send(Err(error));
        }
    }

    /// Fails the session locally and tells the peer why.
    async fn violation(&self, kind: ScmErrorKind, message: String) {
        tracing::warn!("blob session {} protocol violation ({}): {}", self.key, kind, message);
        let scm = SessionControlMessage::err(self.key.clone(), kind, message.clone());
        self.finish(Some(RemoraError::session(kind, message)));
        if let Err(e) = self.sink.send_scm(scm, None).await {
            tracing::debug!("could not report violation on {}: {}", self.key, e);
        }
    }

    fn accept_chunk(&self, scm: &SessionControlMessage, raw: Option<Vec<u8>>) -> std::result::Result<(), (ScmErrorKind, String)> {
        let header = scm
            .chunk_header()
            .ok_or((ScmErrorKind::UnexpectedCommand, "CHUNK without header".to_string()))?;
        let mut data = raw.ok_or((ScmErrorKind::InvalidSize, "CHUNK without data frame".to_string()))?;

        // sizeInBytes comes off the wire; compare without adding to it
        if data.len().checked_sub(CHUNK_DELIMITER.len()) != Some(header.size_in_bytes) {
            return Err((
                ScmErrorKind::InvalidSize,
                format!(
                    "chunk {} carries {} bytes, header announces {}",
                    header.sequence,
                    data.len(),
                    header.size_in_bytes
                ),
            ));
        }
        if data[header.size_in_bytes..] != CHUNK_DELIMITER {
            return Err((
                ScmErrorKind::InvalidDelimiter,
                format!("chunk {} is not terminated by CRLF", header.sequence),
            ));
        }
        data.truncate(header.size_in_bytes);

        {
            let mut stats = lock(&self.stats);
            if stats.saw_last {
                return Err((
                    ScmErrorKind::UnexpectedCommand,
                    format!("chunk {} after the last chunk", header.sequence),
                ));
            }
            stats.chunks += 1;
            stats.bytes += data.len() as u64;
            stats.saw_last = header.chunk_type == ChunkType::Last;
        }

        if !data.is_empty() {
            self.push(Ok(data));
        }
        Ok(())
    }
}

#[async_trait]
impl BlobSession for ReceiverSession {
    fn key(&self) -> &str {
        &self.key
    }

    async fn on_scm(&self, scm: SessionControlMessage, chunk: Option<Vec<u8>>) {
        match scm.command {
            Command::Chunk => {
                if let Err((kind, message)) = self.accept_chunk(&scm, chunk) {
                    self.violation(kind, message).await;
                }
            }
            Command::Reset => {
                let complete = {
                    let mut stats = lock(&self.stats);
                    stats.resets += 1;
                    stats.saw_last
                };
                tracing::debug!("blob session {} reset by peer", self.key);
                let error = (!complete).then(|| {
                    RemoraError::session(ScmErrorKind::Aborted, "session reset before the last chunk")
                });
                self.finish(error);
            }
            Command::Err => {
                let (kind, message) = match scm.param {
                    CommandPayload::Error { kind, message } => (kind, message),
                    _ => (ScmErrorKind::Aborted, "peer reported an error".to_string()),
                };
                tracing::warn!("peer failed blob session {} ({}: {})", self.key, kind, message);
                self.finish(Some(RemoraError::session(kind, message)));
            }
            Command::Ack => {
                let error = RemoraError::NotSupported("ACK on receiving session".to_string());
                tracing::warn!("blob session {}: {}", self.key, error);
            }
        }
    }

    fn abort(&self) {
        let tx = lock(&self.pipe).take();
        if let Some(tx) = tx {
            let _ = tx.send(Err(RemoraError::ClosedChannel));
        }
    }
}

/// Receiving end of a blob.
///
/// Chunks arrive in order; `next_chunk` yields `None` once the sender reset
/// the session after its last chunk. Session failures (a peer `ERR`, a bad
/// chunk, the connection closing) surface as errors.
#[derive(Debug)]
pub struct BlobReader {
    key: String,
    mime: String,
    rx: mpsc::UnboundedReceiver<Result<Vec<u8>>>,
    stats: Arc<Mutex<TransferStats>>,
}

impl BlobReader {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn mime(&self) -> &str {
        &self.mime
    }

    pub async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>> {
        self.rx.recv().await.transpose()
    }

    pub async fn read_to_end(&mut self) -> Result<Vec<u8>> {
        let mut data = Vec::new();
        while let Some(chunk) = self.next_chunk().await? {
            data.extend_from_slice(&chunk);
        }
        Ok(data)
    }

    pub fn stats(&self) -> TransferStats {
        *lock(&self.stats)
    }
}
