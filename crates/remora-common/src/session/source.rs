//! Producing side of a blob: [`BlobSource`] and the [`BlobWriter`] it fills.

use std::fmt;
use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::Arc;

use futures::future::BoxFuture;
use lru::LruCache;
use tokio::sync::Mutex;

use super::ScmSink;
use crate::protocol::{
    ChunkHeader, ChunkType, RemoraError, Result, SessionControlMessage,
};

/// Chunks remembered per session for diagnostics.
pub const SEQUENCE_CACHE_CAPACITY: usize = 64;

pub(crate) type Producer = Box<dyn FnOnce(BlobWriter) -> BoxFuture<'static, Result<()>> + Send>;
pub(crate) type ErrorCallback = Box<dyn FnOnce(RemoraError) + Send>;

/// A blob waiting to be streamed to the peer.
///
/// The producer runs once the peer acknowledges the session. It writes bytes
/// through the [`BlobWriter`] it is handed; the writer is closed for it when
/// the producer returns `Ok`.
///
/// # Example
///
/// ```
/// use remora_common::session::BlobSource;
///
/// let source = BlobSource::new("text/plain", |writer| async move {
///     for line in ["a\n", "b\n", "c\n"] {
///         writer.write(line.as_bytes()).await?;
///     }
///     Ok(())
/// });
/// assert_eq!(source.mime(), "text/plain");
/// ```
pub struct BlobSource {
    mime: String,
    // mutex keeps `BlobSource: Sync`
    parts: std::sync::Mutex<(Producer, Option<ErrorCallback>)>,
}

impl BlobSource {
    pub fn new<F, Fut>(mime: impl Into<String>, produce: F) -> Self
    where
        F: FnOnce(BlobWriter) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let producer: Producer = Box::new(move |writer| Box::pin(produce(writer)));
        Self {
            mime: mime.into(),
            parts: std::sync::Mutex::new((producer, None)),
        }
    }

    /// A source streaming an in-memory buffer.
    pub fn from_bytes(mime: impl Into<String>, data: Vec<u8>) -> Self {
        Self::new(mime, move |writer| async move { writer.write(&data).await })
    }

    /// Callback run when the transfer fails: the peer reported `ERR`, the
    /// producer failed, or the connection went away first.
    pub fn on_error<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(RemoraError) + Send + 'static,
    {
        self.parts_mut().1 = Some(Box::new(callback));
        self
    }

    pub fn mime(&self) -> &str {
        &self.mime
    }

    fn parts_mut(&mut self) -> &mut (Producer, Option<ErrorCallback>) {
        match self.parts.get_mut() {
            Ok(parts) => parts,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub(crate) fn into_parts(self) -> (String, Producer, Option<ErrorCallback>) {
        let (producer, on_error) = match self.parts.into_inner() {
            Ok(parts) => parts,
            Err(poisoned) => poisoned.into_inner(),
        };
        (self.mime, producer, on_error)
    }
}

impl fmt::Debug for BlobSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlobSource")
            .field("mime", &self.mime)
            .finish_non_exhaustive()
    }
}

/// Buffered writer that cuts a blob into fixed-size `CHUNK` messages.
///
/// A full buffer is sent as `CONTINUE` only once more bytes arrive, so the
/// final chunk of a transfer is always the one marked `LAST`.
#[derive(Clone)]
pub struct BlobWriter {
    inner: Arc<Mutex<WriterState>>,
}

struct WriterState {
    key: String,
    sink: Arc<dyn ScmSink>,
    buffer: Vec<u8>,
    chunk_size: usize,
    sequence: u64,
    closed: bool,
    history: LruCache<u64, usize>,
}

impl BlobWriter {
    pub(crate) fn new(key: String, sink: Arc<dyn ScmSink>, chunk_size: usize) -> Self {
        let capacity = NonZeroUsize::new(SEQUENCE_CACHE_CAPACITY).unwrap_or(NonZeroUsize::MIN);
        let chunk_size = chunk_size.max(1);
        Self {
            inner: Arc::new(Mutex::new(WriterState {
                key,
                sink,
                buffer: Vec::with_capacity(chunk_size),
                chunk_size,
                sequence: 0,
                closed: false,
                history: LruCache::new(capacity),
            })),
        }
    }

    pub async fn write(&self, data: &[u8]) -> Result<()> {
        let mut state = self.inner.lock().await;
        if state.closed {
            return Err(RemoraError::NotSupported(format!(
                "write on closed blob session {}",
                state.key
            )));
        }

        let mut rest = data;
        while !rest.is_empty() {
            if state.buffer.len() == state.chunk_size {
                state.flush(ChunkType::Continue).await?;
            }
            let room = state.chunk_size - state.buffer.len();
            let take = room.min(rest.len());
            state.buffer.extend_from_slice(&rest[..take]);
            rest = &rest[take..];
        }
        Ok(())
    }

    /// Sends the buffered tail as `LAST`, then `RESET`. Closing twice is a
    /// no-op.
    pub async fn close(&self) -> Result<()> {
        let mut state = self.inner.lock().await;
        if state.closed {
            return Ok(());
        }
        state.closed = true;
        state.flush(ChunkType::Last).await?;

        let reset = SessionControlMessage::reset(state.key.clone());
        state.sink.send_scm(reset, None).await?;
        tracing::debug!("blob session {} closed after {} chunks", state.key, state.sequence);
        Ok(())
    }

    /// Most recently sent `(sequence, size)` pairs, newest first.
    pub async fn recent_chunks(&self) -> Vec<(u64, usize)> {
        let state = self.inner.lock().await;
        state.history.iter().map(|(seq, size)| (*seq, *size)).collect()
    }

    /// Marks the writer closed without sending anything.
    pub(crate) async fn poison(&self) {
        self.inner.lock().await.closed = true;
    }
}

impl fmt::Debug for BlobWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlobWriter").finish_non_exhaustive()
    }
}

impl WriterState {
    async fn flush(&mut self, chunk_type: ChunkType) -> Result<()> {
        let header = ChunkHeader {
            sequence: self.sequence,
            size_in_bytes: self.buffer.len(),
            chunk_type,
        };
        let scm = SessionControlMessage::chunk(self.key.clone(), header);
        self.sink.send_scm(scm, Some(&self.buffer)).await?;

        self.history.put(self.sequence, self.buffer.len());
        self.sequence += 1;
        self.buffer.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Command;
    use crate::session::testing::RecordingSink;

    #[tokio::test]
    async fn test_full_buffer_waits_for_more_data() {
        let sink = RecordingSink::new();
        let writer = BlobWriter::new("k".to_string(), sink.clone(), 4);

        writer.write(b"abcd").await.unwrap();
        assert!(sink.messages().is_empty());

        writer.write(b"e").await.unwrap();
        let sent = sink.messages();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1.as_deref(), Some(&b"abcd"[..]));
    }

    #[tokio::test]
    async fn test_close_sends_last_then_reset() {
        let sink = RecordingSink::new();
        let writer = BlobWriter::new("k".to_string(), sink.clone(), 4);

        writer.write(b"abcdefgh").await.unwrap();
        writer.close().await.unwrap();
        writer.close().await.unwrap();

        let sent = sink.messages();
        assert_eq!(sent.len(), 3);
        let types: Vec<_> = sent
            .iter()
            .filter_map(|(scm, _)| scm.chunk_header().map(|h| h.chunk_type))
            .collect();
        assert_eq!(types, vec![ChunkType::Continue, ChunkType::Last]);
        assert_eq!(sent[2].0.command, Command::Reset);
    }

    #[tokio::test]
    async fn test_empty_blob_sends_empty_last_chunk() {
        let sink = RecordingSink::new();
        let writer = BlobWriter::new("k".to_string(), sink.clone(), 4);
        writer.close().await.unwrap();

        let sent = sink.messages();
        assert_eq!(sent.len(), 2);
        let header = sent[0].0.chunk_header().unwrap();
        assert_eq!(header.size_in_bytes, 0);
        assert_eq!(header.chunk_type, ChunkType::Last);
    }

    #[tokio::test]
    async fn test_write_after_close_is_not_supported() {
        let sink = RecordingSink::new();
        let writer = BlobWriter::new("k".to_string(), sink, 4);
        writer.close().await.unwrap();
        assert!(matches!(
            writer.write(b"late").await,
            Err(RemoraError::NotSupported(_))
        ));
    }

    #[tokio::test]
    async fn test_recent_chunks_are_bounded() {
        let sink = RecordingSink::new();
        let writer = BlobWriter::new("k".to_string(), sink, 1);

        let data = vec![7u8; SEQUENCE_CACHE_CAPACITY + 10];
        writer.write(&data).await.unwrap();
        writer.close().await.unwrap();

        let recent = writer.recent_chunks().await;
        assert_eq!(recent.len(), SEQUENCE_CACHE_CAPACITY);
        assert_eq!(recent[0].0, (SEQUENCE_CACHE_CAPACITY + 9) as u64);
    }
}
