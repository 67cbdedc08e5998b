//! Remora Transport Layer
//!
//! This module moves protocol records over a byte stream.
//!
//! # Architecture
//!
//! - **Converter**: typed value <-> bytes, selected by `ServiceInfo.converter`
//! - **Framing**: `[4-byte length prefix as u32 big-endian] + [encoded data]`
//! - **Link**: a negotiated socket split into one reader and one locked writer
//!
//! A `CHUNK` session control record is followed by one raw frame holding
//! `data ++ "\r\n"`, written under the same lock hold.
//!
//! # Message Size Limits
//!
//! Frames larger than the configured maximum (100 MB by default) are rejected
//! before any buffer is allocated.
//!
//! # Example
//!
//! ```no_run
//! use remora_common::transport::{link, tcp, Converter};
//! use remora_common::protocol::Request;
//! use std::time::Duration;
//!
//! # #[tokio::main]
//! # async fn main() -> remora_common::Result<()> {
//! let stream = tcp::connect("127.0.0.1:7000", Duration::from_secs(5)).await?;
//! let (_source, sink) = link::split(Box::new(stream), Converter::new(), 1024 * 1024);
//! sink.send(&Request::new("echo", Vec::new()).with_nonce(1), None).await?;
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod link;
pub mod tcp;

pub use codec::{bounded, Converter, JsonCodec};
pub use link::{BoxedSocket, FrameSink, FrameSource, Socket};
