//! Length-prefixed framing shared by both transports.
//!
//! ```text
//! [u32 BE: len][UTF-8 JSON bytes of len]
//! ```
//!
//! A zero-length frame carries no payload and is used as a heartbeat.

use crate::config::TransportConfig;
use crate::error::{FailurePhase, HubError};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Read a length-prefixed frame.
///
/// Returns `None` on clean EOF before a length prefix. EOF inside a payload is
/// an `UnexpectedEof` error; an oversized length is `InvalidData`.
pub async fn read_frame<R: AsyncReadExt + Unpin>(
    reader: &mut R,
) -> std::io::Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let len = u32::from_be_bytes(len_buf) as usize;

    if len > TransportConfig::MAX_FRAME_SIZE {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!(
                "frame size {} exceeds maximum {}",
                len,
                TransportConfig::MAX_FRAME_SIZE
            ),
        ));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    Ok(Some(payload))
}

/// Write a length-prefixed frame.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    payload: &[u8],
) -> std::io::Result<()> {
    if payload.len() > TransportConfig::MAX_FRAME_SIZE {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!(
                "frame size {} exceeds maximum {}",
                payload.len(),
                TransportConfig::MAX_FRAME_SIZE
            ),
        ));
    }
    let len = payload.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Classify a framing I/O error against a peer.
pub fn frame_error(err: std::io::Error, endpoint: &str, phase: FailurePhase) -> HubError {
    if err.kind() == std::io::ErrorKind::InvalidData {
        HubError::protocol(format!("{}: {}", endpoint, err))
    } else {
        HubError::from_io(err, endpoint, phase)
    }
}
