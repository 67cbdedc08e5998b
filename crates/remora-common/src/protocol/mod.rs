pub mod endpoint;
pub mod error;
pub mod requests;
pub mod responses;
pub mod scm;
pub mod service;
pub mod status;

#[cfg(test)]
mod tests;

pub use endpoint::{Endpoint, EndpointBuilder, ParamSpec, ReturnShape, SlotKind, PING_ENDPOINT};
pub use error::{RemoraError, Result};
pub use requests::{BlobSessionRef, Nonce, Param, ParamValue, Request, CONTROL_NONCE};
pub use responses::Response;
pub use scm::{
    ChunkHeader, ChunkType, Command, CommandPayload, ScmErrorKind, SessionControlMessage,
    CHUNK_DELIMITER,
};
pub use service::{ControllerInfo, ServiceInfo};
pub use status::{Status, StatusCode};

use sha2::{Digest, Sha256};

/// Lowercase hex SHA-256 of `data`.
pub(crate) fn sha256_hex(data: &[u8]) -> String {
    Sha256::digest(data)
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}
