// Multipart framing over a byte stream
//
// A message is a sequence of frames. Each frame is
// `[flags: u8][len: u32 BE][len bytes]`; bit 0 of `flags` says more frames
// of the same message follow.

use crate::error::{FramecastError, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const FLAG_MORE: u8 = 1;
pub const MAX_FRAME_LEN: usize = 256 * 1024 * 1024;
pub const MAX_PARTS: usize = 16;

pub async fn write_multipart<W, P>(writer: &mut W, parts: &[P]) -> Result<()>
where
    W: AsyncWrite + Unpin,
    P: AsRef<[u8]>,
{
    if parts.is_empty() {
        return Err(FramecastError::protocol("cannot send an empty message"));
    }
    let last = parts.len() - 1;
    for (i, part) in parts.iter().enumerate() {
        let bytes = part.as_ref();
        if bytes.len() > MAX_FRAME_LEN {
            return Err(FramecastError::protocol(format!(
                "frame of {} bytes exceeds the {} byte limit",
                bytes.len(),
                MAX_FRAME_LEN
            )));
        }
        let flags = if i < last { FLAG_MORE } else { 0 };
        writer.write_u8(flags).await.map_err(transport)?;
        writer
            .write_u32(bytes.len() as u32)
            .await
            .map_err(transport)?;
        writer.write_all(bytes).await.map_err(transport)?;
    }
    writer.flush().await.map_err(transport)?;
    Ok(())
}

/// Reads one message. `None` when the peer closed the stream between
/// messages.
pub async fn read_multipart<R>(reader: &mut R) -> Result<Option<Vec<Vec<u8>>>>
where
    R: AsyncRead + Unpin,
{
    let mut parts = Vec::new();
    loop {
        let flags = match reader.read_u8().await {
            Ok(flags) => flags,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof && parts.is_empty() => {
                return Ok(None)
            }
            Err(e) => return Err(transport(e)),
        };
        let len = reader.read_u32().await.map_err(transport)? as usize;
        if len > MAX_FRAME_LEN {
            return Err(FramecastError::protocol(format!(
                "incoming frame of {} bytes exceeds the {} byte limit",
                len, MAX_FRAME_LEN
            )));
        }
        let mut bytes = vec![0u8; len];
        reader.read_exact(&mut bytes).await.map_err(transport)?;
        parts.push(bytes);

        if flags & FLAG_MORE == 0 {
            return Ok(Some(parts));
        }
        if parts.len() >= MAX_PARTS {
            return Err(FramecastError::protocol("too many frames in one message"));
        }
    }
}

fn transport(e: std::io::Error) -> FramecastError {
    FramecastError::transport(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_multipart_round_trip() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_multipart(&mut a, &[b"{\"type\":\"GET_STATUS\"}".as_slice(), b"payload".as_slice()])
            .await
            .unwrap();
        write_multipart(&mut a, &[b"second"]).await.unwrap();
        drop(a);

        let first = read_multipart(&mut b).await.unwrap().unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(first[1], b"payload");
        let second = read_multipart(&mut b).await.unwrap().unwrap();
        assert_eq!(second, vec![b"second".to_vec()]);
        assert!(read_multipart(&mut b).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_truncated_frame_is_transport_error() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&[0, 0, 0, 0, 10, b'x']).await.unwrap();
        drop(a);
        let err = read_multipart(&mut b).await.unwrap_err();
        assert!(matches!(err, FramecastError::Transport(_)));
    }

    #[tokio::test]
    async fn test_oversized_frame_is_protocol_error() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&[0, 0xff, 0xff, 0xff, 0xff]).await.unwrap();
        let err = read_multipart(&mut b).await.unwrap_err();
        assert!(matches!(err, FramecastError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_empty_message_rejected() {
        let (mut a, _b) = tokio::io::duplex(64);
        let parts: [&[u8]; 0] = [];
        assert!(write_multipart(&mut a, &parts).await.is_err());
    }
}
