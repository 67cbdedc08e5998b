//! Endpoint descriptors.
//!
//! An [`Endpoint`] is built once, at registration time, and is read-only
//! afterwards. Both sides of a connection must build it from the same
//! signature so that the unique key matches.

use serde::{Deserialize, Serialize};

use super::error::{RemoraError, Result};
use super::sha256_hex;

/// Key of the dispatcher's built-in round-trip probe.
pub const PING_ENDPOINT: &str = "__ping";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotKind {
    Value,
    Blob,
}

/// One ordered parameter slot of an endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamSpec {
    pub order: usize,
    pub type_name: String,
    pub kind: SlotKind,
}

/// Unwrapped return shape of an endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReturnShape {
    Unit,
    Value(String),
    Blob,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    unique: String,
    controller: String,
    method: String,
    params: Vec<ParamSpec>,
    returns: ReturnShape,
}

impl Endpoint {
    pub fn builder(controller: impl Into<String>, method: impl Into<String>) -> EndpointBuilder {
        EndpointBuilder {
            controller: controller.into(),
            method: method.into(),
            params: Vec::new(),
            returns: ReturnShape::Unit,
        }
    }

    /// The dispatcher's built-in probe endpoint.
    pub fn ping() -> Self {
        Self {
            unique: PING_ENDPOINT.to_string(),
            controller: String::new(),
            method: PING_ENDPOINT.to_string(),
            params: Vec::new(),
            returns: ReturnShape::Unit,
        }
    }

    pub fn unique(&self) -> &str {
        &self.unique
    }

    pub fn controller(&self) -> &str {
        &self.controller
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn params(&self) -> &[ParamSpec] {
        &self.params
    }

    pub fn returns(&self) -> &ReturnShape {
        &self.returns
    }

    /// Position of the blob parameter, if the endpoint takes one.
    pub fn blob_slot(&self) -> Option<usize> {
        self.params
            .iter()
            .find(|p| p.kind == SlotKind::Blob)
            .map(|p| p.order)
    }

    pub fn returns_blob(&self) -> bool {
        self.returns == ReturnShape::Blob
    }
}

pub struct EndpointBuilder {
    controller: String,
    method: String,
    params: Vec<ParamSpec>,
    returns: ReturnShape,
}

impl EndpointBuilder {
    pub fn param(mut self, type_name: impl Into<String>) -> Self {
        self.push(type_name.into(), SlotKind::Value);
        self
    }

    pub fn blob_param(mut self) -> Self {
        self.push("blob".to_string(), SlotKind::Blob);
        self
    }

    pub fn returns(mut self, type_name: impl Into<String>) -> Self {
        self.returns = ReturnShape::Value(type_name.into());
        self
    }

    pub fn returns_blob(mut self) -> Self {
        self.returns = ReturnShape::Blob;
        self
    }

    fn push(&mut self, type_name: String, kind: SlotKind) {
        let order = self.params.len();
        self.params.push(ParamSpec {
            order,
            type_name,
            kind,
        });
    }

    /// Validates the signature and derives the endpoint key.
    ///
    /// At most one blob slot is allowed across the parameters and the return
    /// value.
    pub fn build(self) -> Result<Endpoint> {
        if self.method.is_empty() {
            return Err(RemoraError::InvalidEndpoint("method name is empty".to_string()));
        }

        let blob_params = self
            .params
            .iter()
            .filter(|p| p.kind == SlotKind::Blob)
            .count();
        let blob_slots = blob_params + usize::from(self.returns == ReturnShape::Blob);
        if blob_slots > 1 {
            return Err(RemoraError::InvalidEndpoint(format!(
                "{}/{} declares {} blob slots, at most one is allowed",
                self.controller, self.method, blob_slots
            )));
        }

        let signature = self.signature();
        Ok(Endpoint {
            unique: sha256_hex(signature.as_bytes()),
            controller: self.controller,
            method: self.method,
            params: self.params,
            returns: self.returns,
        })
    }

    fn signature(&self) -> String {
        let params: Vec<&str> = self.params.iter().map(|p| p.type_name.as_str()).collect();
        let returns = match &self.returns {
            ReturnShape::Unit => "()",
            ReturnShape::Value(type_name) => type_name.as_str(),
            ReturnShape::Blob => "blob",
        };
        format!(
            "{}/{}({})->{}",
            self.controller,
            self.method,
            params.join(","),
            returns
        )
    }
}
