//! Blob sessions: chunked byte streams multiplexed on an RPC connection.
//!
//! A session is bound to one request/response exchange. The side holding a
//! [`BlobSource`] registers a sender and announces its [`BlobSessionRef`];
//! the other side registers a receiver, which answers `ACK`. The sender then
//! streams `CHUNK` messages (`CONTINUE`..., `LAST`) and finishes with `RESET`.
//!
//! ```text
//! sender                         receiver
//!   |  <-------- ACK ------------  |  open()
//!   |  --- CHUNK #0 CONTINUE --->  |
//!   |  --- CHUNK #n LAST ------->  |
//!   |  --- RESET --------------->  |  reader sees end of stream
//! ```
//!
//! Control messages travel in the `scm` field of a `Request` (client to
//! server) or a `Response` (server to client); [`LinkSink`] picks the envelope.

mod receiver;
mod registry;
mod sender;
mod source;

pub use receiver::{BlobReader, TransferStats};
pub use registry::SessionRegistry;
pub use source::{BlobSource, BlobWriter, SEQUENCE_CACHE_CAPACITY};

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use serde::Serialize;

use crate::protocol::{Request, Response, Result, SessionControlMessage};
use crate::transport::FrameSink;
use registry::RegistryInner;

/// Where a session writes its control messages.
///
/// `chunk` is the raw data of a `CHUNK` message; it must be written right
/// after the message, with nothing in between.
#[async_trait]
pub trait ScmSink: Send + Sync {
    async fn send_scm(&self, scm: SessionControlMessage, chunk: Option<&[u8]>) -> Result<()>;
}

/// A live session as seen by the registry.
#[async_trait]
pub(crate) trait BlobSession: Send + Sync {
    fn key(&self) -> &str;

    async fn on_scm(&self, scm: SessionControlMessage, chunk: Option<Vec<u8>>);

    /// The connection is going away.
    fn abort(&self);
}

/// Removes a session from its registry when it ends.
#[derive(Clone)]
pub(crate) struct Teardown {
    registry: Weak<RegistryInner>,
    key: String,
}

impl Teardown {
    pub(crate) fn fire(&self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(&self.key);
        }
    }
}

/// Live side of the blob bound to a request or response.
#[derive(Debug)]
pub enum BlobAttachment {
    Incoming(BlobReader),
    Outgoing(BlobSource),
}

/// Record type that carries control messages in one direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Envelope {
    Request,
    Response,
}

/// [`ScmSink`] writing to a connection's shared write half.
pub struct LinkSink {
    link: Arc<FrameSink>,
    envelope: Envelope,
}

impl LinkSink {
    pub fn new(link: Arc<FrameSink>, envelope: Envelope) -> Arc<Self> {
        Arc::new(Self { link, envelope })
    }

    async fn put<T: Serialize + Sync>(&self, record: &T, chunk: Option<&[u8]>) -> Result<()> {
        match chunk {
            Some(data) => self.link.send_with_chunk(record, data).await,
            None => self.link.send(record, None).await,
        }
    }
}

#[async_trait]
impl ScmSink for LinkSink {
    async fn send_scm(&self, scm: SessionControlMessage, chunk: Option<&[u8]>) -> Result<()> {
        match self.envelope {
            Envelope::Request => self.put(&Request::control(scm), chunk).await,
            Envelope::Response => self.put(&Response::control(scm), chunk).await,
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::LoopbackSink;
    use super::*;

    async fn transfer(size: usize, chunk_size: usize) -> (Vec<u8>, Vec<u8>, TransferStats) {
        let sending = SessionRegistry::new(chunk_size);
        let receiving = SessionRegistry::new(chunk_size);
        let to_receiver = Arc::new(LoopbackSink {
            peer: receiving.clone(),
        });
        let to_sender = Arc::new(LoopbackSink {
            peer: sending.clone(),
        });

        let payload: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
        let source = BlobSource::from_bytes("application/octet-stream", payload.clone());
        let reference = sending.start_sender(source, to_receiver).unwrap();

        let mut reader = receiving.start_receiver(&reference, to_sender).await.unwrap();
        let received = reader.read_to_end().await.unwrap();
        (payload, received, reader.stats())
    }

    #[tokio::test]
    async fn test_round_trip_empty() {
        let (sent, received, stats) = transfer(0, 16).await;
        assert_eq!(sent, received);
        assert_eq!(stats.chunks, 1);
        assert_eq!(stats.resets, 1);
        assert!(stats.saw_last);
    }

    #[tokio::test]
    async fn test_round_trip_exactly_one_chunk() {
        let (sent, received, stats) = transfer(16, 16).await;
        assert_eq!(sent, received);
        assert_eq!(stats.chunks, 1);
        assert_eq!(stats.resets, 1);
    }

    #[tokio::test]
    async fn test_round_trip_many_chunks_with_tail() {
        let (sent, received, stats) = transfer(16 * 9 + 5, 16).await;
        assert_eq!(sent, received);
        assert_eq!(stats.chunks, 10);
        assert_eq!(stats.bytes, 16 * 9 + 5);
        assert_eq!(stats.resets, 1);
        assert!(stats.saw_last);
    }

    #[tokio::test]
    async fn test_registries_empty_after_transfer() {
        let sending = SessionRegistry::new(8);
        let receiving = SessionRegistry::new(8);
        let source = BlobSource::from_bytes("text/plain", b"some bytes to move".to_vec());
        let reference = sending
            .start_sender(
                source,
                Arc::new(LoopbackSink {
                    peer: receiving.clone(),
                }),
            )
            .unwrap();
        let mut reader = receiving
            .start_receiver(
                &reference,
                Arc::new(LoopbackSink {
                    peer: sending.clone(),
                }),
            )
            .await
            .unwrap();

        assert_eq!(reader.read_to_end().await.unwrap(), b"some bytes to move".to_vec());
        assert!(receiving.is_empty());
        for _ in 0..100 {
            if sending.is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }
        assert!(sending.is_empty());
    }
}
