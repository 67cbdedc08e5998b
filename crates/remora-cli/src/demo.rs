// Copyright 2025 Remora Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The demo service served by `remora serve`.
//!
//! | method     | parameters   | returns               |
//! |------------|--------------|-----------------------|
//! | `echo`     | `string`     | the same string       |
//! | `upload`   | blob         | number of bytes read  |
//! | `download` | `u64` size   | blob of `size` bytes  |

use remora_common::protocol::{ControllerInfo, Endpoint, RemoraError, Response, Result, ServiceInfo};
use remora_common::session::BlobSource;
use remora_server::{handler_fn, ServiceRegistry};
use serde_json::json;

pub const SERVICE_NAME: &str = "remora-demo";
pub const SERVICE_VERSION: &str = "1.0";
pub const CONTROLLER: &str = "Demo";

/// Largest blob `download` will produce.
pub const MAX_DOWNLOAD: u64 = 64 * 1024 * 1024;

pub fn service() -> ServiceInfo {
    ServiceInfo::new(SERVICE_NAME, SERVICE_VERSION)
        .with_provider("remora")
        .with_controller(ControllerInfo::new(CONTROLLER, "1"))
}

pub fn echo() -> Result<Endpoint> {
    Endpoint::builder(CONTROLLER, "echo")
        .param("string")
        .returns("string")
        .build()
}

pub fn upload() -> Result<Endpoint> {
    Endpoint::builder(CONTROLLER, "upload")
        .blob_param()
        .returns("u64")
        .build()
}

pub fn download() -> Result<Endpoint> {
    Endpoint::builder(CONTROLLER, "download")
        .param("u64")
        .returns_blob()
        .build()
}

/// Looks a demo method up by name.
pub fn endpoint(method: &str) -> Result<Endpoint> {
    match method {
        "echo" => echo(),
        "upload" => upload(),
        "download" => download(),
        other => Err(RemoraError::InvalidEndpoint(format!(
            "the demo service has no method '{}'",
            other
        ))),
    }
}

/// Deterministic content of a `download` blob.
pub fn pattern(size: u64) -> Vec<u8> {
    (0..size).map(|i| (i % 251) as u8).collect()
}

pub fn registry() -> Result<ServiceRegistry> {
    let mut registry = ServiceRegistry::new(service());

    registry.register(
        echo()?,
        handler_fn(|request| async move {
            let text: String = request.arg(0)?;
            Ok(Response::success(json!(text)))
        }),
    )?;

    registry.register(
        upload()?,
        handler_fn(|mut request| async move {
            let mut reader = request.take_blob_reader().ok_or_else(|| {
                RemoraError::InvalidRequest("upload expects a blob".to_string())
            })?;
            let data = reader.read_to_end().await?;
            tracing::info!("upload received {} bytes", data.len());
            Ok(Response::success(json!(data.len())))
        }),
    )?;

    registry.register(
        download()?,
        handler_fn(|request| async move {
            let size: u64 = request.arg(0)?;
            if size > MAX_DOWNLOAD {
                return Ok(Response::bad_request(format!(
                    "download size {} exceeds {}",
                    size, MAX_DOWNLOAD
                )));
            }
            let source = BlobSource::from_bytes("application/octet-stream", pattern(size))
                .on_error(|e| tracing::warn!("download stream failed: {}", e));
            Ok(Response::with_blob(source))
        }),
    )?;

    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_has_every_method() {
        let registry = registry().unwrap();
        assert_eq!(registry.endpoints().len(), 3);
        for method in ["echo", "upload", "download"] {
            let endpoint = endpoint(method).unwrap();
            assert!(registry.lookup(endpoint.unique()).is_some());
        }
    }

    #[test]
    fn test_unknown_method() {
        assert!(matches!(endpoint("nope"), Err(RemoraError::InvalidEndpoint(_))));
    }

    #[test]
    fn test_pattern() {
        let data = pattern(300);
        assert_eq!(data.len(), 300);
        assert_eq!(data[251], 0);
        assert_eq!(data[252], 1);
    }
}
