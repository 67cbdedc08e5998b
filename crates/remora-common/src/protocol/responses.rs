//! Response records.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::error::Result;
use super::requests::{Nonce, CONTROL_NONCE};
use super::scm::SessionControlMessage;
use super::status::{Status, StatusCode};
use crate::session::{BlobAttachment, BlobReader, BlobSource};

/// An RPC response, matched to its request by `nonce`.
///
/// # Response Flow
///
/// 1. The dispatcher decodes a `Request` and invokes the handler
/// 2. The handler returns a `Response` (success or error)
/// 3. The dispatcher copies the request nonce and writes the response back
/// 4. The client's reader task hands it to the caller awaiting that nonce
///
/// When `has_session_switch` is set, `body` is a
/// [`BlobSessionRef`](super::BlobSessionRef) and the payload follows as a blob
/// session. `blob` holds the live side of that session and is never
/// serialized.
///
/// # Example
///
/// ```
/// use remora_common::protocol::{Response, Status};
/// use serde_json::json;
///
/// let ok = Response::success(json!("hello"));
/// assert!(ok.is_successful);
/// assert_eq!(ok.code, 200);
///
/// let missing = Response::error(Status::NotFound, "no such endpoint");
/// assert!(!missing.is_successful);
/// assert_eq!(missing.code, 404);
/// ```
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    pub body: serde_json::Value,
    pub code: StatusCode,
    pub is_successful: bool,
    pub has_session_switch: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scm: Option<SessionControlMessage>,
    pub nonce: Nonce,
    #[serde(skip)]
    pub blob: Option<BlobAttachment>,
}

impl Response {
    /// Creates a successful response.
    pub fn success(body: serde_json::Value) -> Self {
        Response {
            body,
            code: Status::Ok.code(),
            is_successful: true,
            has_session_switch: false,
            scm: None,
            nonce: CONTROL_NONCE,
            blob: None,
        }
    }

    /// Creates a successful response that streams `source` back as a blob.
    ///
    /// The dispatcher assigns the session key and fills `body` when it writes
    /// the response.
    pub fn with_blob(source: BlobSource) -> Self {
        let mut response = Response::success(serde_json::Value::Null);
        response.has_session_switch = true;
        response.blob = Some(BlobAttachment::Outgoing(source));
        response
    }

    /// Creates an error response with a textual body.
    pub fn error(status: Status, message: impl Into<String>) -> Self {
        Response {
            body: serde_json::Value::String(message.into()),
            code: status.code(),
            is_successful: false,
            has_session_switch: false,
            scm: None,
            nonce: CONTROL_NONCE,
            blob: None,
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Response::error(Status::BadRequest, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Response::error(Status::NotFound, message)
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Response::error(Status::InternalServerError, message)
    }

    pub fn timeout(timeout_ms: u64) -> Self {
        Response::error(
            Status::Timeout,
            format!("no response within {}ms", timeout_ms),
        )
    }

    pub fn closed() -> Self {
        Response::error(Status::ChannelClosed, "channel closed")
    }

    /// A record carrying only a session control message.
    pub fn control(scm: SessionControlMessage) -> Self {
        let mut response = Response::success(serde_json::Value::Null);
        response.scm = Some(scm);
        response
    }

    pub fn with_nonce(mut self, nonce: Nonce) -> Self {
        self.nonce = nonce;
        self
    }

    pub fn status(&self) -> Option<Status> {
        Status::from_code(self.code)
    }

    pub fn is_control(&self) -> bool {
        self.scm.is_some()
    }

    /// Decodes the body into `T`.
    pub fn body_as<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.body.clone())?)
    }

    /// Takes the reader of a blob handed back by the server.
    pub fn take_blob_reader(&mut self) -> Option<BlobReader> {
        match self.blob.take() {
            Some(BlobAttachment::Incoming(reader)) => Some(reader),
            other => {
                self.blob = other;
                None
            }
        }
    }
}
