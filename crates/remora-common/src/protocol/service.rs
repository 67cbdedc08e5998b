//! Service descriptors exchanged during the handshake.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};

use super::error::{RemoraError, Result};
use super::sha256_hex;

/// A controller (interface) exposed by a service, identified by its stub.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ControllerInfo {
    pub version: String,
    pub stub: String,
}

impl ControllerInfo {
    pub fn new(stub: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            stub: stub.into(),
        }
    }
}

/// Description of a service, used as the handshake credential.
///
/// Equality, hashing and [`fingerprint`](Self::fingerprint) are structural over
/// every field except the proxy factory hint, which is a locally filled
/// connectivity hint and differs between peers.
///
/// # Example
///
/// ```
/// use remora_common::protocol::{ControllerInfo, ServiceInfo};
///
/// let service = ServiceInfo::new("echo", "1.0")
///     .with_provider("acme")
///     .with_controller(ControllerInfo::new("EchoController", "1"));
///
/// assert!(service.provides(&ControllerInfo::new("EchoController", "1")));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub name: String,
    pub provider: String,
    pub version: String,
    pub adapter: String,
    pub negotiator: String,
    pub converter: String,
    pub params: BTreeMap<String, String>,
    pub controllers: Vec<ControllerInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    proxy_factory_hint: Option<String>,
}

#[derive(Serialize, Hash, PartialEq)]
struct Structural<'a> {
    name: &'a str,
    provider: &'a str,
    version: &'a str,
    adapter: &'a str,
    negotiator: &'a str,
    converter: &'a str,
    params: &'a BTreeMap<String, String>,
    controllers: &'a [ControllerInfo],
}

impl ServiceInfo {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            provider: String::new(),
            version: version.into(),
            adapter: "tcp".to_string(),
            negotiator: "plain".to_string(),
            converter: "json".to_string(),
            params: BTreeMap::new(),
            controllers: Vec::new(),
            proxy_factory_hint: None,
        }
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = provider.into();
        self
    }

    pub fn with_adapter(mut self, adapter: impl Into<String>) -> Self {
        self.adapter = adapter.into();
        self
    }

    pub fn with_negotiator(mut self, negotiator: impl Into<String>) -> Self {
        self.negotiator = negotiator.into();
        self
    }

    pub fn with_converter(mut self, converter: impl Into<String>) -> Self {
        self.converter = converter.into();
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn with_controller(mut self, controller: ControllerInfo) -> Self {
        self.controllers.push(controller);
        self
    }

    /// Connectivity hint filled in after discovery.
    pub fn hint(&self) -> Option<&str> {
        self.proxy_factory_hint.as_deref()
    }

    /// Sets the connectivity hint. The hint may be set only once.
    pub fn set_hint(&mut self, hint: impl Into<String>) -> Result<()> {
        if self.proxy_factory_hint.is_some() {
            return Err(RemoraError::InvalidConfig(format!(
                "hint for service '{}' is already set",
                self.name
            )));
        }
        self.proxy_factory_hint = Some(hint.into());
        Ok(())
    }

    pub fn provides(&self, controller: &ControllerInfo) -> bool {
        self.controllers.contains(controller)
    }

    fn structural(&self) -> Structural<'_> {
        Structural {
            name: &self.name,
            provider: &self.provider,
            version: &self.version,
            adapter: &self.adapter,
            negotiator: &self.negotiator,
            converter: &self.converter,
            params: &self.params,
            controllers: &self.controllers,
        }
    }

    /// Hex SHA-256 of the structural fields, stable across processes.
    pub fn fingerprint(&self) -> String {
        // serializing a borrowed struct of strings and a BTreeMap cannot fail
        let canonical = serde_json::to_vec(&self.structural()).unwrap_or_default();
        sha256_hex(&canonical)
    }
}

impl PartialEq for ServiceInfo {
    fn eq(&self, other: &Self) -> bool {
        self.structural() == other.structural()
    }
}

impl Eq for ServiceInfo {}

impl Hash for ServiceInfo {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.structural().hash(state);
    }
}
