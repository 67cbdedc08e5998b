//! Static endpoint table of a service.
//!
//! Handlers are registered once at startup under the endpoint's unique key.
//! The dispatcher looks the key of each incoming request up here; unknown
//! keys are answered with `404 Not Found`.
//!
//! # Example
//!
//! ```
//! use remora_common::{Endpoint, Response, ServiceInfo};
//! use remora_server::{handler_fn, ServiceRegistry};
//!
//! let echo = Endpoint::builder("Echo", "echo").param("string").returns("string").build().unwrap();
//!
//! let mut registry = ServiceRegistry::new(ServiceInfo::new("echo", "1.0"));
//! registry
//!     .register(echo, handler_fn(|request| async move {
//!         let text: String = request.arg(0)?;
//!         Ok(Response::success(text.into()))
//!     }))
//!     .unwrap();
//! assert_eq!(registry.endpoints().len(), 1);
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use remora_common::protocol::{Endpoint, RemoraError, Request, Response, Result, ServiceInfo};

/// Server-side implementation of one endpoint.
///
/// An `Err` is answered with `500 Internal Server Error` carrying the error
/// text; the connection stays up.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, request: Request) -> Result<Response>;
}

/// [`Handler`] backed by an async closure. Build it with [`handler_fn`].
pub struct HandlerFn<F> {
    f: F,
}

/// Wraps `f` as a [`Handler`].
pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Response>> + Send + 'static,
{
    HandlerFn { f }
}

#[async_trait]
impl<F, Fut> Handler for HandlerFn<F>
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Response>> + Send + 'static,
{
    async fn handle(&self, request: Request) -> Result<Response> {
        (self.f)(request).await
    }
}

struct Registration {
    endpoint: Endpoint,
    handler: Arc<dyn Handler>,
}

/// Endpoint key to handler table of one service.
pub struct ServiceRegistry {
    service: ServiceInfo,
    table: HashMap<String, Registration>,
}

impl ServiceRegistry {
    pub fn new(service: ServiceInfo) -> Self {
        Self {
            service,
            table: HashMap::new(),
        }
    }

    pub fn service(&self) -> &ServiceInfo {
        &self.service
    }

    /// Adds `endpoint`. A second registration of the same key is rejected.
    pub fn register<H: Handler + 'static>(&mut self, endpoint: Endpoint, handler: H) -> Result<()> {
        let key = endpoint.unique().to_string();
        if self.table.contains_key(&key) {
            return Err(RemoraError::InvalidEndpoint(format!(
                "{}.{} is already registered",
                endpoint.controller(),
                endpoint.method()
            )));
        }
        tracing::debug!(
            "registered {}.{} as {}",
            endpoint.controller(),
            endpoint.method(),
            key
        );
        self.table.insert(
            key,
            Registration {
                endpoint,
                handler: Arc::new(handler),
            },
        );
        Ok(())
    }

    /// Every registered endpoint, in no particular order.
    pub fn endpoints(&self) -> Vec<&Endpoint> {
        self.table.values().map(|r| &r.endpoint).collect()
    }

    pub fn lookup(&self, key: &str) -> Option<&Endpoint> {
        self.table.get(key).map(|r| &r.endpoint)
    }

    /// Runs the handler registered for `request.endpoint`.
    ///
    /// The returned response does not carry the request nonce yet.
    pub async fn dispatch(&self, request: Request) -> Response {
        let Some(registration) = self.table.get(&request.endpoint) else {
            tracing::debug!("no endpoint registered under {}", request.endpoint);
            return Response::not_found(format!("unknown endpoint {}", request.endpoint));
        };

        let expected = registration.endpoint.params().len();
        if request.params.len() != expected {
            return Response::bad_request(format!(
                "{}.{} takes {} arguments, got {}",
                registration.endpoint.controller(),
                registration.endpoint.method(),
                expected,
                request.params.len()
            ));
        }

        match registration.handler.handle(request).await {
            Ok(response) => response,
            Err(e) => {
                tracing::error!(
                    "handler {}.{} failed: {}",
                    registration.endpoint.controller(),
                    registration.endpoint.method(),
                    e
                );
                Response::internal_error(e.to_string())
            }
        }
    }
}

impl std::fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("service", &self.service.name)
            .field("endpoints", &self.table.len())
            .finish()
    }
}
