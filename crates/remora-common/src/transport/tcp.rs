use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::protocol::error::{RemoraError, Result};
use crate::protocol::CHUNK_DELIMITER;

/// Connects to a remote endpoint.
///
/// This resolves the address (which may resolve to multiple addresses) and
/// attempts to connect to each until one succeeds, bounding every attempt by
/// `timeout`.
///
/// # Example
///
/// ```no_run
/// use remora_common::transport::tcp::connect;
/// use std::time::Duration;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let stream = connect("127.0.0.1:7000", Duration::from_secs(5)).await?;
/// # Ok(())
/// # }
/// ```
pub async fn connect(addr: &str, timeout: Duration) -> Result<TcpStream> {
    let socket_addrs = tokio::net::lookup_host(addr)
        .await
        .map_err(|e| RemoraError::Connection(format!("Invalid address '{}': {}", addr, e)))?;

    // Try each resolved address until one succeeds
    let mut last_err = None;
    for socket_addr in socket_addrs {
        match tokio::time::timeout(timeout, TcpStream::connect(socket_addr)).await {
            Ok(Ok(stream)) => {
                stream.set_nodelay(true).map_err(|e| {
                    RemoraError::Connection(format!("Failed to set TCP_NODELAY: {}", e))
                })?;
                return Ok(stream);
            }
            Ok(Err(e)) => last_err = Some(e.to_string()),
            Err(_) => last_err = Some(format!("timed out after {}ms", timeout.as_millis())),
        }
    }

    Err(RemoraError::Connection(format!(
        "Failed to connect to {}: {}",
        addr,
        last_err.unwrap_or_else(|| "no address resolved".to_string())
    )))
}

/// Writes one frame.
///
/// Wire format: `[4-byte length as u32 big-endian] + [data]`
pub async fn write_frame<W>(writer: &mut W, data: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let len = u32::try_from(data.len()).map_err(|_| RemoraError::FrameTooLarge {
        size: data.len(),
        max: u32::MAX as usize,
    })?;

    writer
        .write_all(&len.to_be_bytes())
        .await
        .map_err(|e| map_io_error(e, "writing length prefix"))?;
    writer
        .write_all(data)
        .await
        .map_err(|e| map_io_error(e, "writing data"))?;
    writer
        .flush()
        .await
        .map_err(|e| map_io_error(e, "flushing stream"))?;

    Ok(())
}

/// Writes the raw frame that follows a `CHUNK` record: `data ++ "\r\n"`.
pub async fn write_chunk_frame<W>(writer: &mut W, data: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut framed = Vec::with_capacity(data.len() + CHUNK_DELIMITER.len());
    framed.extend_from_slice(data);
    framed.extend_from_slice(&CHUNK_DELIMITER);
    write_frame(writer, &framed).await
}

/// Reads one frame.
///
/// Returns `Ok(None)` when the peer closed the stream on a frame boundary.
///
/// # Errors
///
/// Returns an error if:
/// - The stream ends in the middle of a frame
/// - The frame exceeds `max_frame_size`
pub async fn read_frame<R>(reader: &mut R, max_frame_size: usize) -> Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(map_io_error(e, "reading length prefix")),
    }

    let len = u32::from_be_bytes(len_buf) as usize;

    // Validate length to prevent allocation of excessively large buffers
    if len > max_frame_size {
        return Err(RemoraError::FrameTooLarge {
            size: len,
            max: max_frame_size,
        });
    }

    let mut buf = vec![0u8; len];
    reader
        .read_exact(&mut buf)
        .await
        .map_err(|e| map_io_error(e, "reading data"))?;

    Ok(Some(buf))
}

/// Map IO errors to appropriate RemoraError variants
///
/// - Timeouts/would block -> `Timeout`
/// - Connection loss and truncated frames -> `ClosedChannel`
/// - Other IO errors -> `Io`
fn map_io_error(err: std::io::Error, context: &str) -> RemoraError {
    match err.kind() {
        std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => RemoraError::Timeout(0),
        std::io::ErrorKind::ConnectionReset
        | std::io::ErrorKind::ConnectionAborted
        | std::io::ErrorKind::BrokenPipe
        | std::io::ErrorKind::NotConnected
        | std::io::ErrorKind::UnexpectedEof => {
            tracing::debug!("{}: connection lost ({})", context, err);
            RemoraError::ClosedChannel
        }
        _ => RemoraError::Io(err),
    }
}
