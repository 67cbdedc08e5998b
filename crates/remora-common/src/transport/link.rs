//! Split framed halves of a negotiated socket.
//!
//! A connection has exactly one [`FrameSource`] (owned by its reader task)
//! and one [`FrameSink`] shared by every writer. The sink's mutex is the
//! per-connection write lock: one record, or one `CHUNK` record plus its raw
//! data frame, is written per hold.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{Mutex, Notify};

use crate::protocol::error::{RemoraError, Result};
use crate::transport::codec::{bounded, Converter};
use crate::transport::tcp::{read_frame, write_chunk_frame};

/// Duplex byte stream a connection runs over.
pub trait Socket: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Socket for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

pub type BoxedSocket = Box<dyn Socket>;

/// Splits a socket into its framed read and write halves.
pub fn split(socket: BoxedSocket, converter: Converter, max_frame_size: usize) -> (FrameSource, FrameSink) {
    let (reader, writer) = tokio::io::split(socket);
    (
        FrameSource {
            reader,
            converter,
            max_frame_size,
        },
        FrameSink {
            writer: Mutex::new(writer),
            converter,
            poisoned: AtomicBool::new(false),
            closed: Notify::new(),
        },
    )
}

pub struct FrameSource {
    reader: ReadHalf<BoxedSocket>,
    converter: Converter,
    max_frame_size: usize,
}

impl FrameSource {
    /// Reads the next record, `Ok(None)` once the peer has closed the stream.
    pub async fn recv<T: DeserializeOwned>(&mut self) -> Result<Option<T>> {
        self.converter
            .read(&mut self.reader, self.max_frame_size, None)
            .await
    }

    /// Reads the raw data frame that follows a `CHUNK` record.
    pub async fn recv_chunk(&mut self) -> Result<Vec<u8>> {
        read_frame(&mut self.reader, self.max_frame_size)
            .await?
            .ok_or(RemoraError::ClosedChannel)
    }
}

pub struct FrameSink {
    writer: Mutex<WriteHalf<BoxedSocket>>,
    converter: Converter,
    poisoned: AtomicBool,
    closed: Notify,
}

impl FrameSink {
    pub fn converter(&self) -> &Converter {
        &self.converter
    }

    /// Writes one record. The bound covers waiting for the write lock and
    /// the write itself.
    ///
    /// A timeout or I/O error after the frame started going out leaves a torn
    /// frame on the stream, so the sink refuses every later write.
    pub async fn send<T>(&self, value: &T, timeout: Option<Duration>) -> Result<()>
    where
        T: Serialize + Sync + ?Sized,
    {
        self.check()?;
        let encoded = self.converter.encode(value)?;
        let started = AtomicBool::new(false);

        let result = bounded(timeout, async {
            let mut writer = self.writer.lock().await;
            started.store(true, Ordering::SeqCst);
            crate::transport::tcp::write_frame(&mut *writer, &encoded).await
        })
        .await;

        if let Err(e) = &result {
            if started.load(Ordering::SeqCst) {
                tracing::warn!("write failed mid-frame ({}), refusing further writes", e);
                self.poison();
            }
        }
        result
    }

    /// Writes a record followed by a raw chunk frame under one lock hold.
    pub async fn send_with_chunk<T>(&self, value: &T, chunk: &[u8]) -> Result<()>
    where
        T: Serialize + Sync + ?Sized,
    {
        self.check()?;
        let encoded = self.converter.encode(value)?;
        let mut writer = self.writer.lock().await;
        let result = match crate::transport::tcp::write_frame(&mut *writer, &encoded).await {
            Ok(()) => write_chunk_frame(&mut *writer, chunk).await,
            Err(e) => Err(e),
        };
        if let Err(e) = &result {
            tracing::warn!("chunk write failed ({}), refusing further writes", e);
            self.poison();
        }
        result
    }

    /// Whether the sink has stopped accepting writes.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::SeqCst)
    }

    /// Resolves once the sink stops accepting writes.
    pub async fn closed(&self) {
        loop {
            let notified = self.closed.notified();
            if self.is_poisoned() {
                return;
            }
            notified.await;
        }
    }

    fn poison(&self) {
        self.poisoned.store(true, Ordering::SeqCst);
        self.closed.notify_waiters();
    }

    /// Shuts the write side down; the peer's reader sees end of stream.
    pub async fn shutdown(&self) {
        self.poison();
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            tracing::debug!("shutdown of write half failed: {}", e);
        }
    }

    fn check(&self) -> Result<()> {
        if self.is_poisoned() {
            Err(RemoraError::ClosedChannel)
        } else {
            Ok(())
        }
    }
}
