//! Remora Server
//!
//! This crate serves a Remora service: [`ServiceRegistry`] maps endpoint keys
//! to handlers, and [`ServiceAdapter`] accepts connections, negotiates them
//! and dispatches their requests to the registry.

pub mod adapter;
pub mod registry;

pub use adapter::ServiceAdapter;
pub use registry::{handler_fn, Handler, HandlerFn, ServiceRegistry};
