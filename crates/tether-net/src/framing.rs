//! Length-prefixed framing for the reliable stream.
//!
//! Every packet on the stream is a length-prefixed frame:
//!
//! ```text
//! +-------------------+--------------------+
//! | length (4 bytes)  |   payload          |
//! | u32 little-endian |   (length bytes)   |
//! +-------------------+--------------------+
//! ```
//!
//! The length does **not** include the 4 prefix bytes themselves. A stream that
//! ends cleanly between frames is a closed connection. A stream that ends inside
//! a frame is [`FrameError::Truncated`]: the reader has lost its position and the
//! connection cannot be resynchronized.

use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Configuration for the framing layer.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Maximum allowed payload size in bytes. Default: 1 MB.
    pub max_payload_size: u32,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_payload_size: 1_048_576,
        }
    }
}

/// Errors that can occur during framing operations.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The payload size exceeds the configured maximum.
    #[error("payload size {size} exceeds maximum {max}")]
    PayloadTooLarge {
        /// The declared payload size.
        size: u32,
        /// The configured maximum.
        max: u32,
    },

    /// The peer closed the stream on a frame boundary.
    #[error("connection closed")]
    ConnectionClosed,

    /// The stream ended partway through a frame.
    #[error("short read: expected {expected} bytes, stream ended after {received}")]
    Truncated {
        /// Bytes the frame header declared (or 4 for the header itself).
        expected: usize,
        /// Bytes actually received before end of stream.
        received: usize,
    },

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Fill `buf` from the stream, returning how many bytes arrived before EOF.
async fn read_until_full<R: AsyncReadExt + Unpin>(
    reader: &mut R,
    buf: &mut [u8],
) -> Result<usize, std::io::Error> {
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

/// Read a single length-prefixed frame from the stream.
///
/// Returns the payload bytes. Blocks until the full frame is available.
pub async fn read_frame<R: AsyncReadExt + Unpin>(
    reader: &mut R,
    config: &FrameConfig,
) -> Result<Vec<u8>, FrameError> {
    let mut len_buf = [0u8; 4];
    match read_until_full(reader, &mut len_buf).await? {
        4 => {}
        0 => return Err(FrameError::ConnectionClosed),
        received => {
            return Err(FrameError::Truncated {
                expected: 4,
                received,
            });
        }
    }

    let payload_len = u32::from_le_bytes(len_buf);

    if payload_len > config.max_payload_size {
        return Err(FrameError::PayloadTooLarge {
            size: payload_len,
            max: config.max_payload_size,
        });
    }

    let mut payload = vec![0u8; payload_len as usize];
    let received = read_until_full(reader, &mut payload).await?;
    if received < payload.len() {
        return Err(FrameError::Truncated {
            expected: payload.len(),
            received,
        });
    }

    Ok(payload)
}

/// Write a single length-prefixed frame to the stream.
///
/// Callers sharing a stream must serialize calls; see [`crate::peer::FrameSink`].
pub async fn write_frame<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    payload: &[u8],
    config: &FrameConfig,
) -> Result<(), FrameError> {
    let len = u32::try_from(payload.len()).unwrap_or(u32::MAX);
    if len > config.max_payload_size {
        return Err(FrameError::PayloadTooLarge {
            size: len,
            max: config.max_payload_size,
        });
    }

    writer.write_all(&len.to_le_bytes()).await?;
    if !payload.is_empty() {
        writer.write_all(payload).await?;
    }
    writer.flush().await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    fn default_config() -> FrameConfig {
        FrameConfig::default()
    }

    #[tokio::test]
    async fn test_single_frame_roundtrip() {
        let (mut client, mut server) = duplex(8192);
        let config = default_config();
        let payload = b"spawn packet bytes";

        write_frame(&mut client, payload, &config).await.unwrap();
        let received = read_frame(&mut server, &config).await.unwrap();
        assert_eq!(received, payload);
    }

    #[tokio::test]
    async fn test_partial_read_resumes_correctly() {
        // duplex with a tiny buffer forces partial writes/reads
        let (mut client, mut server) = duplex(8);
        let config = default_config();
        let payload = b"this frame is larger than the pipe buffer";

        let write_config = config.clone();
        let write_task = tokio::spawn(async move {
            write_frame(&mut client, payload, &write_config)
                .await
                .unwrap();
        });

        let received = read_frame(&mut server, &config).await.unwrap();
        write_task.await.unwrap();
        assert_eq!(received, payload);
    }

    #[tokio::test]
    async fn test_short_payload_is_truncated_error() {
        let (mut client, mut server) = duplex(8192);
        let config = default_config();

        client.write_all(&100u32.to_le_bytes()).await.unwrap();
        client.write_all(&[7u8; 40]).await.unwrap();
        drop(client);

        let result = read_frame(&mut server, &config).await;
        assert!(
            matches!(
                result,
                Err(FrameError::Truncated {
                    expected: 100,
                    received: 40
                })
            ),
            "short read must surface as a framing error, got {result:?}"
        );
    }

    #[tokio::test]
    async fn test_short_header_is_truncated_error() {
        let (mut client, mut server) = duplex(8192);
        client.write_all(&[1, 0]).await.unwrap();
        drop(client);

        let result = read_frame(&mut server, &default_config()).await;
        assert!(matches!(
            result,
            Err(FrameError::Truncated {
                expected: 4,
                received: 2
            })
        ));
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected_on_read() {
        let (mut client, mut server) = duplex(8192);
        let config = FrameConfig {
            max_payload_size: 16,
        };

        client.write_all(&1024u32.to_le_bytes()).await.unwrap();
        client.flush().await.unwrap();

        let result = read_frame(&mut server, &config).await;
        assert!(
            matches!(result, Err(FrameError::PayloadTooLarge { .. })),
            "Should reject oversized frame"
        );
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected_on_write() {
        let (mut client, _server) = duplex(8192);
        let config = FrameConfig {
            max_payload_size: 16,
        };

        let result = write_frame(&mut client, &[0u8; 1024], &config).await;
        assert!(matches!(result, Err(FrameError::PayloadTooLarge { .. })));
    }

    #[tokio::test]
    async fn test_back_to_back_frames_dont_merge() {
        let (mut client, mut server) = duplex(8192);
        let config = default_config();

        write_frame(&mut client, b"aaa", &config).await.unwrap();
        write_frame(&mut client, &[], &config).await.unwrap();
        write_frame(&mut client, b"bbb", &config).await.unwrap();

        assert_eq!(read_frame(&mut server, &config).await.unwrap(), b"aaa");
        assert!(read_frame(&mut server, &config).await.unwrap().is_empty());
        assert_eq!(read_frame(&mut server, &config).await.unwrap(), b"bbb");
    }

    #[tokio::test]
    async fn test_connection_closed_between_frames() {
        let (client, mut server) = duplex(8192);
        drop(client);

        let result = read_frame(&mut server, &default_config()).await;
        assert!(
            matches!(result, Err(FrameError::ConnectionClosed)),
            "Should detect closed connection"
        );
    }

    #[tokio::test]
    async fn test_length_prefix_is_little_endian() {
        let (mut client, mut server) = duplex(8192);

        client.write_all(&5u32.to_le_bytes()).await.unwrap();
        client.write_all(b"hello").await.unwrap();
        client.flush().await.unwrap();

        let received = read_frame(&mut server, &default_config()).await.unwrap();
        assert_eq!(received, b"hello");
    }
}
