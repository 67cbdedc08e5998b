//! Remora Common Types and Transport
//!
//! This crate provides the protocol records, framing, handshake and blob
//! session machinery shared by the Remora client and server.
//!
//! # Overview
//!
//! Remora is a remote method invocation runtime. A server exposes a service
//! over TCP; a client opens a proxy, negotiates the service descriptor once,
//! then issues many concurrent calls over the one connection, each matched to
//! its response by a nonce. Payloads too large for a single record travel as
//! blob sessions: fixed-size chunks multiplexed on the same stream.
//!
//! # Architecture
//!
//! - **Transport**: TCP, one connection per proxy
//! - **Serialization**: JSON, behind the [`Converter`] enum
//! - **Message Format**: `[4-byte length prefix as u32 big-endian] + [JSON data]`
//! - **Max Message Size**: 100 MB by default (prevents memory exhaustion)
//!
//! # Components
//!
//! - [`protocol`] - Request/Response records, status codes, errors, service descriptors
//! - [`transport`] - converter, framing and the split connection halves
//! - [`negotiator`] - the one-shot handshake
//! - [`session`] - chunked blob transfer
//! - [`config`] - transport settings
//!
//! # Example
//!
//! ```
//! use remora_common::{Response, Status};
//! use serde_json::json;
//!
//! let response = Response::success(json!({"result": 42})).with_nonce(7);
//! assert_eq!(response.status(), Some(Status::Ok));
//! ```

pub mod config;
pub mod negotiator;
pub mod protocol;
pub mod session;
pub mod transport;

pub use config::TransportConfig;
pub use negotiator::{negotiator_for, Negotiator, PlainNegotiator, Role};
pub use protocol::*;
pub use session::{BlobAttachment, BlobReader, BlobSource, BlobWriter, SessionRegistry};
pub use transport::Converter;
