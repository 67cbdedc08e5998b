//! Transport configuration.

use std::time::Duration;

use crate::protocol::error::{RemoraError, Result};
use crate::protocol::CHUNK_DELIMITER;

/// Default blob chunk size (64 KiB).
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Default maximum frame size (100 MB), prevents memory exhaustion.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 100 * 1024 * 1024;

/// Settings shared by proxies and adapters.
///
/// # Default Configuration
///
/// - `chunk_size`: 64 KiB
/// - `max_frame_size`: 100 MB
/// - `connect_timeout`: 5 seconds
/// - `handshake_timeout`: 5 seconds
///
/// # Example
///
/// ```
/// use remora_common::config::TransportConfig;
/// use std::time::Duration;
///
/// let config = TransportConfig::default()
///     .with_chunk_size(16 * 1024)
///     .with_connect_timeout(Duration::from_secs(1));
/// assert_eq!(config.chunk_size, 16 * 1024);
/// ```
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Size of the blob sender's accumulation buffer
    pub chunk_size: usize,
    /// Largest frame accepted from a peer
    pub max_frame_size: usize,
    /// Bound on establishing the TCP connection
    pub connect_timeout: Duration,
    /// Bound on each read or write of the handshake
    pub handshake_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            connect_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(5),
        }
    }
}

impl TransportConfig {
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Defaults overridden by `REMORA_*` environment variables.
    ///
    /// Reads `REMORA_CHUNK_SIZE`, `REMORA_MAX_FRAME_SIZE`,
    /// `REMORA_CONNECT_TIMEOUT_MS` and `REMORA_HANDSHAKE_TIMEOUT_MS`.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(value) = parse_var(&lookup, "REMORA_CHUNK_SIZE")? {
            config.chunk_size = to_size("REMORA_CHUNK_SIZE", value)?;
        }
        if let Some(value) = parse_var(&lookup, "REMORA_MAX_FRAME_SIZE")? {
            config.max_frame_size = to_size("REMORA_MAX_FRAME_SIZE", value)?;
        }
        if let Some(value) = parse_var(&lookup, "REMORA_CONNECT_TIMEOUT_MS")? {
            config.connect_timeout = Duration::from_millis(value);
        }
        if let Some(value) = parse_var(&lookup, "REMORA_HANDSHAKE_TIMEOUT_MS")? {
            config.handshake_timeout = Duration::from_millis(value);
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(RemoraError::InvalidConfig("chunk_size must be positive".to_string()));
        }
        // a chunk frame carries the data plus the delimiter
        let chunk_frame = self.chunk_size.checked_add(CHUNK_DELIMITER.len());
        if chunk_frame.map_or(true, |size| size > self.max_frame_size) {
            return Err(RemoraError::InvalidConfig(format!(
                "chunk_size {} does not fit in max_frame_size {}",
                self.chunk_size, self.max_frame_size
            )));
        }
        Ok(())
    }
}

fn to_size(name: &str, value: u64) -> Result<usize> {
    usize::try_from(value)
        .map_err(|_| RemoraError::InvalidConfig(format!("{}={} does not fit in memory", name, value)))
}

fn parse_var(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<u64>> {
    match lookup(name) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|e| RemoraError::InvalidConfig(format!("{}='{}': {}", name, raw, e))),
    }
}
