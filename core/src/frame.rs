//! Length-prefixed framing used on every encrypted socket.
//!
//! ```text
//! [0..4):   u32 little-endian payload length N
//! [4..4+N): payload bytes (one encoded Message)
//! ```
//!
//! Readers pass the largest payload they accept; a prefix above it fails
//! before anything is allocated.

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const LENGTH_PREFIX_SIZE: usize = 4;

#[derive(Debug, Error)]
pub enum FrameError {
    /// Stream ended cleanly between two frames.
    #[error("stream closed")]
    Closed,

    /// Stream ended after `read` of `expected` bytes had started.
    #[error("stream ended mid-frame ({read} of {expected} bytes)")]
    Truncated { read: usize, expected: usize },

    #[error("frame of {size} bytes exceeds the {max} byte limit")]
    TooLarge { size: usize, max: usize },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Prepends the little-endian length of `payload`.
pub fn encode(payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(LENGTH_PREFIX_SIZE + payload.len());
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(payload);
    buf
}

/// Reads one frame of at most `max_len` payload bytes and returns the payload.
///
/// Partial reads are completed by reading again; a `read` that returns zero
/// bytes is terminal.
pub async fn read_frame<R>(reader: &mut R, max_len: usize) -> Result<Vec<u8>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; LENGTH_PREFIX_SIZE];
    let got = read_full(reader, &mut len_buf).await?;
    if got == 0 {
        return Err(FrameError::Closed);
    }
    if got < LENGTH_PREFIX_SIZE {
        return Err(FrameError::Truncated {
            read: got,
            expected: LENGTH_PREFIX_SIZE,
        });
    }

    let size = u32::from_le_bytes(len_buf) as usize;
    if size > max_len {
        return Err(FrameError::TooLarge { size, max: max_len });
    }
    let mut payload = vec![0u8; size];
    let got = read_full(reader, &mut payload).await?;
    if got < size {
        return Err(FrameError::Truncated {
            read: got,
            expected: size,
        });
    }
    Ok(payload)
}

/// Writes `payload` as one frame and flushes.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&encode(payload)).await?;
    writer.flush().await
}

// Returns the number of bytes read, which is less than `buf.len()` only on EOF.
async fn read_full<R>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tokio::io::AsyncWriteExt;

    const LIMIT: usize = 1024 * 1024;

    #[test]
    fn test_encode_prefix_is_little_endian() {
        let framed = encode(b"abc");
        assert_eq!(&framed[..4], &[3, 0, 0, 0]);
        assert_eq!(&framed[4..], b"abc");

        let empty = encode(&[]);
        assert_eq!(empty, vec![0, 0, 0, 0]);
    }

    #[tokio::test]
    async fn test_read_frame_empty_and_large_payloads() {
        let large: Vec<u8> = (0..70_000u32).map(|i| (i % 251) as u8).collect();
        let mut wire = encode(&[]);
        wire.extend(encode(&large));

        let mut cursor = Cursor::new(wire);
        assert!(read_frame(&mut cursor, LIMIT).await.unwrap().is_empty());
        assert_eq!(read_frame(&mut cursor, LIMIT).await.unwrap(), large);
        assert!(matches!(
            read_frame(&mut cursor, LIMIT).await,
            Err(FrameError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_read_frame_one_byte_at_a_time() {
        let wire = encode(b"partial reads are fine");
        let (mut client, mut server) = tokio::io::duplex(1);

        let writer = tokio::spawn(async move {
            for byte in wire {
                client.write_all(&[byte]).await.unwrap();
            }
        });

        let payload = read_frame(&mut server, LIMIT).await.unwrap();
        assert_eq!(payload, b"partial reads are fine");
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_eof_inside_frame_is_truncated() {
        let mut wire = encode(b"hello world");
        wire.truncate(8);
        let mut cursor = Cursor::new(wire);
        match read_frame(&mut cursor, LIMIT).await {
            Err(FrameError::Truncated { read, expected }) => {
                assert_eq!(read, 4);
                assert_eq!(expected, 11);
            }
            other => panic!("unexpected result: {:?}", other),
        }

        let mut short_prefix = Cursor::new(vec![5u8, 0]);
        assert!(matches!(
            read_frame(&mut short_prefix, LIMIT).await,
            Err(FrameError::Truncated { read: 2, expected: 4 })
        ));
    }

    #[tokio::test]
    async fn test_write_frame_round_trip() {
        let (mut a, mut b) = tokio::io::duplex(64);
        write_frame(&mut a, b"ping").await.unwrap();
        assert_eq!(read_frame(&mut b, LIMIT).await.unwrap(), b"ping");
    }

    #[tokio::test]
    async fn test_oversized_prefix_is_rejected_before_reading_payload() {
        let mut wire = (3u32 << 30).to_le_bytes().to_vec();
        wire.push(1);
        let mut cursor = Cursor::new(wire);
        match read_frame(&mut cursor, LIMIT).await {
            Err(FrameError::TooLarge { size, max }) => {
                assert_eq!(size, 3 << 30);
                assert_eq!(max, LIMIT);
            }
            other => panic!("unexpected result: {:?}", other),
        }
        // The payload byte was never consumed.
        assert_eq!(cursor.position(), 4);

        let mut exact = Cursor::new(encode(&[7u8; 16]));
        assert_eq!(read_frame(&mut exact, 16).await.unwrap(), vec![7u8; 16]);
    }
}
