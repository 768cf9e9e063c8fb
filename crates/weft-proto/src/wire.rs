//! Framed wire codec.
//!
//! Every record on a peer stream is a frame:
//!
//! ```text
//! [len: u32 le] [body: len bytes of serde_json]
//! ```
//!
//! The body is self-describing, so the same codec carries handshake fields
//! (a name, a flag) and full message records. Frames are bounded; a peer
//! announcing an oversized frame is treated as a protocol error and the
//! connection is dropped by the caller.

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on a single frame body.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Errors produced by the frame codec.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    /// The underlying stream failed or closed mid-frame.
    #[error("stream error: {0}")]
    Io(#[from] std::io::Error),

    /// The frame body did not decode to the expected record.
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// The frame length prefix exceeded [`MAX_FRAME_LEN`].
    #[error("frame of {0} bytes exceeds limit")]
    Oversize(usize),
}

/// Write one framed record to `writer`.
pub async fn write_frame<W, T>(writer: &mut W, value: &T) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
    T: Serialize + ?Sized,
{
    let body = serde_json::to_vec(value)?;
    if body.len() > MAX_FRAME_LEN {
        return Err(WireError::Oversize(body.len()));
    }
    writer.write_all(&(body.len() as u32).to_le_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one framed record from `reader`.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<T, WireError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(WireError::Oversize(len));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(serde_json::from_slice(&body)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Message, Payload};

    #[tokio::test]
    async fn frames_round_trip() {
        let (mut a, mut b) = tokio::io::duplex(4096);

        let m = Message::unicast("alpha", "omega", 3, 5, b"payload".to_vec());
        write_frame(&mut a, &m).await.unwrap();
        let back: Message = read_frame(&mut b).await.unwrap();
        assert_eq!(m, back);
    }

    #[tokio::test]
    async fn handshake_fields_share_the_codec() {
        let (mut a, mut b) = tokio::io::duplex(256);

        write_frame(&mut a, "alpha").await.unwrap();
        write_frame(&mut a, &true).await.unwrap();

        let name: String = read_frame(&mut b).await.unwrap();
        let solicited: bool = read_frame(&mut b).await.unwrap();
        assert_eq!(name, "alpha");
        assert!(solicited);
    }

    #[tokio::test]
    async fn multiple_frames_stay_delimited() {
        let (mut a, mut b) = tokio::io::duplex(4096);

        for i in 0..10u64 {
            let m = Message::broadcast("n", i, 2, vec![i as u8; i as usize]);
            write_frame(&mut a, &m).await.unwrap();
        }
        for i in 0..10u64 {
            let m: Message = read_frame(&mut b).await.unwrap();
            assert_eq!(m.id, i);
            assert_eq!(m.payload, Payload::Broadcast(vec![i as u8; i as usize]));
        }
    }

    #[tokio::test]
    async fn oversized_length_prefix_is_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);

        let len = (MAX_FRAME_LEN as u32 + 1).to_le_bytes();
        tokio::io::AsyncWriteExt::write_all(&mut a, &len).await.unwrap();

        let err = read_frame::<_, Message>(&mut b).await.unwrap_err();
        assert!(matches!(err, WireError::Oversize(_)));
    }

    #[tokio::test]
    async fn truncated_stream_reports_io_error() {
        let (mut a, mut b) = tokio::io::duplex(64);

        tokio::io::AsyncWriteExt::write_all(&mut a, &8u32.to_le_bytes())
            .await
            .unwrap();
        tokio::io::AsyncWriteExt::write_all(&mut a, b"abc").await.unwrap();
        drop(a);

        let err = read_frame::<_, Message>(&mut b).await.unwrap_err();
        assert!(matches!(err, WireError::Io(_)));
    }
}
