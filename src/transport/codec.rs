//! Newline-delimited JSON framing.
//!
//! One JSON document per line. Frames longer than the configured limit are
//! rejected before they are parsed.

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::TransportError;

/// Default frame limit; artifacts travel base64-encoded inside a frame.
pub const MAX_FRAME_BYTES: usize = 256 * 1024 * 1024;

/// Read one frame. Returns `None` on a clean end of stream.
pub async fn read_frame<R, T>(reader: &mut R, max_bytes: usize) -> Result<Option<T>, TransportError>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    let mut buf = Vec::new();
    let limit = max_bytes as u64 + 1;
    let n = (&mut *reader).take(limit).read_until(b'\n', &mut buf).await?;
    if n == 0 {
        return Ok(None);
    }
    if buf.last() != Some(&b'\n') {
        if buf.len() > max_bytes {
            return Err(TransportError::FrameTooLarge { limit: max_bytes });
        }
        return Err(TransportError::Protocol("connection closed mid-frame".to_string()));
    }
    buf.pop();
    if buf.last() == Some(&b'\r') {
        buf.pop();
    }
    Ok(Some(serde_json::from_slice(&buf)?))
}

/// Write one frame and flush it.
pub async fn write_frame<W, T>(writer: &mut W, frame: &T) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut line = serde_json::to_vec(frame)?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use tokio::io::BufReader;

    #[tokio::test]
    async fn test_frames_are_line_delimited() {
        let mut out = Vec::new();
        write_frame(&mut out, &json!({"a": 1})).await.unwrap();
        write_frame(&mut out, &json!({"b": "two"})).await.unwrap();
        assert_eq!(out.iter().filter(|b| **b == b'\n').count(), 2);

        let mut reader = BufReader::new(&out[..]);
        let first: Value = read_frame(&mut reader, 1024).await.unwrap().unwrap();
        let second: Value = read_frame(&mut reader, 1024).await.unwrap().unwrap();
        assert_eq!(first["a"], 1);
        assert_eq!(second["b"], "two");
        assert!(read_frame::<_, Value>(&mut reader, 1024).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let line = format!("\"{}\"\n", "x".repeat(64));
        let mut reader = BufReader::new(line.as_bytes());
        let err = read_frame::<_, Value>(&mut reader, 16).await.unwrap_err();
        assert!(matches!(err, TransportError::FrameTooLarge { limit: 16 }));
    }

    #[tokio::test]
    async fn test_truncated_frame_is_protocol_error() {
        let mut reader = BufReader::new(&b"{\"a\":"[..]);
        let err = read_frame::<_, Value>(&mut reader, 1024).await.unwrap_err();
        assert!(matches!(err, TransportError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_crlf_tolerated() {
        let mut reader = BufReader::new(&b"{\"a\":1}\r\n"[..]);
        let value: Value = read_frame(&mut reader, 1024).await.unwrap().unwrap();
        assert_eq!(value["a"], 1);
    }
}
