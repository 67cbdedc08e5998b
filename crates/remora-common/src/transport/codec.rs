use std::future::Future;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::protocol::error::{RemoraError, Result};
use crate::transport::tcp::{read_frame, write_frame};

/// Converter between typed values and frames on a byte stream.
///
/// Currently only JSON is supported, but the enum allows for future
/// extensibility (e.g., MessagePack, CBOR, etc.). The variant is selected by
/// the `converter` field of the service descriptor.
///
/// # Example
///
/// ```
/// use remora_common::transport::Converter;
/// use serde_json::json;
///
/// let converter = Converter::from_name("json").unwrap();
/// let generic = converter.to_generic(&vec![1u8, 2, 3]).unwrap();
/// assert_eq!(generic, json!([1, 2, 3]));
///
/// let typed: Vec<u8> = converter.resolve(generic).unwrap();
/// assert_eq!(typed, vec![1, 2, 3]);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Converter {
    /// JSON codec (currently the only supported format)
    Json(JsonCodec),
}

impl Converter {
    pub fn new() -> Self {
        Converter::Json(JsonCodec)
    }

    /// Selects a converter by its service descriptor name.
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "json" => Ok(Converter::Json(JsonCodec)),
            other => Err(RemoraError::InvalidConfig(format!(
                "unknown converter '{}'",
                other
            ))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Converter::Json(_) => "json",
        }
    }

    pub fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>> {
        match self {
            Converter::Json(_) => JsonCodec::encode(value),
        }
    }

    pub fn decode<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T> {
        match self {
            Converter::Json(_) => JsonCodec::decode(data),
        }
    }

    /// Converts a typed value into its generic (map/list) form.
    pub fn to_generic<T: Serialize + ?Sized>(&self, value: &T) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(value)?)
    }

    /// Rebuilds a typed value from its generically decoded form.
    pub fn resolve<T: DeserializeOwned>(&self, value: serde_json::Value) -> Result<T> {
        Ok(serde_json::from_value(value)?)
    }

    /// Reads one framed value, `Ok(None)` on a clean end of stream.
    pub async fn read<T, R>(
        &self,
        reader: &mut R,
        max_frame_size: usize,
        timeout: Option<Duration>,
    ) -> Result<Option<T>>
    where
        T: DeserializeOwned,
        R: AsyncRead + Unpin + ?Sized,
    {
        let frame = bounded(timeout, read_frame(reader, max_frame_size)).await?;
        frame.map(|data| self.decode(&data)).transpose()
    }

    /// Writes one framed value.
    pub async fn write<T, W>(&self, writer: &mut W, value: &T, timeout: Option<Duration>) -> Result<()>
    where
        T: Serialize + ?Sized,
        W: AsyncWrite + Unpin + ?Sized,
    {
        let encoded = self.encode(value)?;
        bounded(timeout, write_frame(writer, &encoded)).await
    }
}

impl Default for Converter {
    fn default() -> Self {
        Self::new()
    }
}

/// Runs `fut`, failing with `Timeout` once `timeout` elapses.
pub async fn bounded<T, F>(timeout: Option<Duration>, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match timeout {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| RemoraError::Timeout(limit.as_millis() as u64))?,
        None => fut.await,
    }
}

/// JSON codec for encoding/decoding frames
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JsonCodec;

impl JsonCodec {
    pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(value)?)
    }

    pub fn decode<T: DeserializeOwned>(data: &[u8]) -> Result<T> {
        Ok(serde_json::from_slice(data)?)
    }
}
