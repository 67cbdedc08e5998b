//! Shared fixtures: a real `ServiceAdapter` on a loopback port.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use remora_common::protocol::{ControllerInfo, Endpoint, Response, ServiceInfo};
use remora_common::session::BlobSource;
use remora_common::TransportConfig;
use remora_server::{handler_fn, ServiceAdapter, ServiceRegistry};
use serde_json::json;

pub fn service() -> ServiceInfo {
    ServiceInfo::new("test-service", "1.0")
        .with_provider("tests")
        .with_controller(ControllerInfo::new("Test", "1"))
}

pub fn echo() -> Endpoint {
    Endpoint::builder("Test", "echo")
        .param("string")
        .returns("string")
        .build()
        .unwrap()
}

/// Sleeps for the given milliseconds, then answers with them.
pub fn sleep() -> Endpoint {
    Endpoint::builder("Test", "sleep")
        .param("u64")
        .returns("u64")
        .build()
        .unwrap()
}

pub fn upload() -> Endpoint {
    Endpoint::builder("Test", "upload")
        .blob_param()
        .returns("u64")
        .build()
        .unwrap()
}

pub fn download() -> Endpoint {
    Endpoint::builder("Test", "download")
        .param("u64")
        .returns_blob()
        .build()
        .unwrap()
}

/// Waits the given milliseconds, then answers with a 1 KiB blob.
pub fn slow_download() -> Endpoint {
    Endpoint::builder("Test", "slow_download")
        .param("u64")
        .returns_blob()
        .build()
        .unwrap()
}

pub fn fail() -> Endpoint {
    Endpoint::builder("Test", "fail").build().unwrap()
}

pub fn payload(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i % 253) as u8).collect()
}

/// A running test server.
pub struct TestServer {
    pub adapter: ServiceAdapter,
    pub addr: String,
    pub calls: Arc<AtomicUsize>,
    /// Outgoing blobs that ended in an error before being fully sent.
    pub failed_blobs: Arc<AtomicUsize>,
}

impl TestServer {
    pub async fn start() -> Self {
        Self::start_with(service(), TransportConfig::default()).await
    }

    pub async fn start_with(service: ServiceInfo, config: TransportConfig) -> Self {
        let calls = Arc::new(AtomicUsize::new(0));
        let failed_blobs = Arc::new(AtomicUsize::new(0));
        let mut registry = ServiceRegistry::new(service);

        let counter = calls.clone();
        registry
            .register(
                echo(),
                handler_fn(move |request| {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        let text: String = request.arg(0)?;
                        Ok(Response::success(json!(text)))
                    }
                }),
            )
            .unwrap();

        registry
            .register(
                sleep(),
                handler_fn(|request| async move {
                    let ms: u64 = request.arg(0)?;
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                    Ok(Response::success(json!(ms)))
                }),
            )
            .unwrap();

        registry
            .register(
                upload(),
                handler_fn(|mut request| async move {
                    let mut reader = request.take_blob_reader().ok_or_else(|| {
                        remora_common::RemoraError::InvalidRequest("no blob".to_string())
                    })?;
                    let data = reader.read_to_end().await?;
                    let stats = reader.stats();
                    Ok(Response::success(json!({
                        "bytes": data.len(),
                        "chunks": stats.chunks,
                        "matches": data == payload(data.len()),
                    })))
                }),
            )
            .unwrap();

        registry
            .register(
                download(),
                handler_fn(|request| async move {
                    let size: u64 = request.arg(0)?;
                    Ok(Response::with_blob(BlobSource::from_bytes(
                        "application/octet-stream",
                        payload(size as usize),
                    )))
                }),
            )
            .unwrap();

        let failures = failed_blobs.clone();
        registry
            .register(
                slow_download(),
                handler_fn(move |request| {
                    let failures = failures.clone();
                    async move {
                        let ms: u64 = request.arg(0)?;
                        tokio::time::sleep(Duration::from_millis(ms)).await;
                        let source = BlobSource::from_bytes("application/octet-stream", payload(1024))
                            .on_error(move |_| {
                                failures.fetch_add(1, Ordering::SeqCst);
                            });
                        Ok(Response::with_blob(source))
                    }
                }),
            )
            .unwrap();

        registry
            .register(
                fail(),
                handler_fn(|_| async {
                    Err::<Response, _>(remora_common::RemoraError::InvalidRequest(
                        "always fails".to_string(),
                    ))
                }),
            )
            .unwrap();

        let adapter = ServiceAdapter::with_config(registry, config).unwrap();
        let addr = adapter.listen("127.0.0.1:0").await.unwrap();
        Self {
            adapter,
            addr,
            calls,
            failed_blobs,
        }
    }
}
