//! Remora Client
//!
//! Proxies for calling remote Remora services.
//!
//! - [`ServiceProxy`] owns one negotiated connection and multiplexes
//!   concurrent calls over it.
//! - [`PooledServiceProxy`] spreads calls over several proxies of the same
//!   service, ranked by probed latency or load.
//!
//! Both implement [`RemoteService`]; [`RemoteServiceExt::call`] adds typed
//! result decoding on top.

pub mod connection;
pub mod policy;
pub mod pool;
pub mod qos;

use std::time::Duration;

use async_trait::async_trait;
use remora_common::protocol::{Endpoint, RemoraError, Response, Result, Status};
use remora_common::Converter;
use serde::de::DeserializeOwned;

pub use connection::{Arg, ServiceProxy};
pub use policy::{DropPolicy, PrioritizePolicy};
pub use pool::{PoolConfig, PooledServiceProxy};
pub use qos::{Qos, QosSnapshot};

/// Anything that can carry a call to a remote endpoint.
#[async_trait]
pub trait RemoteService: Send + Sync {
    /// Sends one call and returns the raw response.
    async fn request(&self, endpoint: &Endpoint, timeout: Duration, args: Vec<Arg>) -> Result<Response>;

    /// Converter negotiated for the service.
    fn converter(&self) -> Converter;
}

/// Typed calls over any [`RemoteService`].
#[async_trait]
pub trait RemoteServiceExt: RemoteService {
    /// Calls `endpoint` and decodes a successful body into `T`.
    ///
    /// Unsuccessful responses become errors: `TIMEOUT` maps to
    /// [`RemoraError::Timeout`], `CHANNEL_CLOSED` to
    /// [`RemoraError::ClosedChannel`], anything else to
    /// [`RemoraError::InvalidResponse`] with the response text.
    async fn call<T: DeserializeOwned + Send>(
        &self,
        endpoint: &Endpoint,
        timeout: Duration,
        args: Vec<Arg>,
    ) -> Result<T> {
        let response = self.request(endpoint, timeout, args).await?;
        if !response.is_successful {
            return Err(match response.status() {
                Some(Status::Timeout) => RemoraError::Timeout(timeout.as_millis() as u64),
                Some(Status::ChannelClosed) => RemoraError::ClosedChannel,
                _ => RemoraError::InvalidResponse(format!("{}: {}", response.code, response.body)),
            });
        }
        self.converter().resolve(response.body)
    }
}

impl<S: RemoteService + ?Sized> RemoteServiceExt for S {}
