//! One-shot connection handshake.
//!
//! The client writes its [`ServiceInfo`] and reads back a [`Response`]; the
//! server compares fingerprints and answers `200` or `400`. A failed
//! handshake is terminal for that connection attempt.

use async_trait::async_trait;

use crate::config::TransportConfig;
use crate::protocol::{RemoraError, Response, Result, ServiceInfo};
use crate::transport::{BoxedSocket, Converter};

/// Which end of the connection is negotiating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// Handshake run before a connection carries RPC traffic.
///
/// The socket is passed by value so an implementation can return a wrapped
/// (for example, encrypted) stream in its place.
#[async_trait]
pub trait Negotiator: Send + Sync {
    fn name(&self) -> &'static str;

    async fn handshake(
        &self,
        socket: BoxedSocket,
        service: &ServiceInfo,
        converter: &Converter,
        role: Role,
        config: &TransportConfig,
    ) -> Result<BoxedSocket>;
}

/// Looks up the negotiator named by `ServiceInfo.negotiator`.
pub fn negotiator_for(name: &str) -> Result<Box<dyn Negotiator>> {
    match name {
        "plain" => Ok(Box::new(PlainNegotiator)),
        other => Err(RemoraError::InvalidConfig(format!(
            "unknown negotiator '{}'",
            other
        ))),
    }
}

/// Plaintext descriptor exchange with no transport upgrade.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainNegotiator;

impl PlainNegotiator {
    async fn client_side(
        mut socket: BoxedSocket,
        service: &ServiceInfo,
        converter: &Converter,
        config: &TransportConfig,
    ) -> Result<BoxedSocket> {
        let timeout = Some(config.handshake_timeout);
        converter.write(&mut socket, service, timeout).await?;

        let response: Response = converter
            .read(&mut socket, config.max_frame_size, timeout)
            .await?
            .ok_or(RemoraError::ClosedChannel)?;

        if !response.is_successful {
            return Err(RemoraError::HandshakeFailed(format!(
                "server rejected service '{}' ({}): {}",
                service.name, response.code, response.body
            )));
        }
        Ok(socket)
    }

    async fn server_side(
        mut socket: BoxedSocket,
        service: &ServiceInfo,
        converter: &Converter,
        config: &TransportConfig,
    ) -> Result<BoxedSocket> {
        let timeout = Some(config.handshake_timeout);
        let remote: ServiceInfo = converter
            .read(&mut socket, config.max_frame_size, timeout)
            .await?
            .ok_or(RemoraError::ClosedChannel)?;

        let local_fingerprint = service.fingerprint();
        if remote.fingerprint() != local_fingerprint {
            let response = Response::bad_request(format!(
                "service mismatch: expected '{}' {}",
                service.name, service.version
            ));
            converter.write(&mut socket, &response, timeout).await?;
            return Err(RemoraError::HandshakeFailed(format!(
                "peer offered '{}' {}, expected '{}' {}",
                remote.name, remote.version, service.name, service.version
            )));
        }

        let response = Response::success(serde_json::Value::String(local_fingerprint));
        converter.write(&mut socket, &response, timeout).await?;
        Ok(socket)
    }
}

#[async_trait]
impl Negotiator for PlainNegotiator {
    fn name(&self) -> &'static str {
        "plain"
    }

    async fn handshake(
        &self,
        socket: BoxedSocket,
        service: &ServiceInfo,
        converter: &Converter,
        role: Role,
        config: &TransportConfig,
    ) -> Result<BoxedSocket> {
        let result = match role {
            Role::Client => Self::client_side(socket, service, converter, config).await,
            Role::Server => Self::server_side(socket, service, converter, config).await,
        };

        result.map_err(|e| match e {
            RemoraError::HandshakeFailed(_) => e,
            other => RemoraError::HandshakeFailed(other.to_string()),
        })
    }
}
