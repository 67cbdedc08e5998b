use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::error::{RemoraError, Result};
use super::scm::SessionControlMessage;
use crate::session::{BlobAttachment, BlobReader};

/// Per-connection correlation number assigned by the caller.
pub type Nonce = u64;

/// Nonce used by session control records, which are never correlated.
pub const CONTROL_NONCE: Nonce = 0;

/// Value of one parameter slot: a plain value or the blob marker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamValue {
    Value(serde_json::Value),
    Blob,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Param {
    pub order: usize,
    #[serde(rename = "type")]
    pub type_name: String,
    pub value: ParamValue,
}

/// Wire reference to a blob session: its key and a mime hint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobSessionRef {
    pub key: String,
    pub mime: String,
}

/// A call on an endpoint, or a session control record when `scm` is set.
///
/// `blob` is the live attachment of the session named by `session`; it never
/// travels on the wire. On the receiving side the dispatcher fills it with a
/// [`BlobReader`] before the handler sees the request.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    pub endpoint: String,
    pub params: Vec<Param>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<BlobSessionRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scm: Option<SessionControlMessage>,
    pub nonce: Nonce,
    #[serde(skip)]
    pub blob: Option<BlobAttachment>,
}

impl Request {
    pub fn new(endpoint: impl Into<String>, params: Vec<Param>) -> Self {
        Request {
            endpoint: endpoint.into(),
            params,
            session: None,
            scm: None,
            nonce: CONTROL_NONCE,
            blob: None,
        }
    }

    /// A record carrying only a session control message.
    pub fn control(scm: SessionControlMessage) -> Self {
        Request {
            endpoint: String::new(),
            params: Vec::new(),
            session: None,
            scm: Some(scm),
            nonce: CONTROL_NONCE,
            blob: None,
        }
    }

    pub fn with_nonce(mut self, nonce: Nonce) -> Self {
        self.nonce = nonce;
        self
    }

    pub fn is_control(&self) -> bool {
        self.scm.is_some()
    }

    pub fn param(&self, order: usize) -> Option<&Param> {
        self.params.iter().find(|p| p.order == order)
    }

    /// Decodes the plain value at `order` into `T`.
    pub fn arg<T: DeserializeOwned>(&self, order: usize) -> Result<T> {
        match self.param(order).map(|p| &p.value) {
            Some(ParamValue::Value(value)) => Ok(serde_json::from_value(value.clone())?),
            Some(ParamValue::Blob) => Err(RemoraError::InvalidRequest(format!(
                "parameter {} is a blob slot",
                order
            ))),
            None => Err(RemoraError::InvalidRequest(format!(
                "missing parameter {}",
                order
            ))),
        }
    }

    /// Takes the reader of an incoming blob parameter.
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
