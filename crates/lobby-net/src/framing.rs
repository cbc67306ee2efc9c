//! Newline-delimited JSON framing for TCP streams.
//!
//! Every message on the wire is one JSON document terminated by `\n`:
//!
//! ```text
//! {"Command":"ping"}\n
//! {"Command":"enter-lobby","UserId":7,"Username":"kim"}\r\n
//! ```
//!
//! A trailing `\r` is tolerated, blank lines are skipped (clients use them
//! as keepalive padding), and a final unterminated line at end-of-stream is
//! still delivered. Lines longer than [`FrameConfig::max_frame_size`] are
//! discarded up to their newline and reported as
//! [`FrameError::FrameTooLarge`]; the reader stays usable afterwards.

use std::sync::Arc;

use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};

/// Configuration for the framing layer.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Maximum allowed line length in bytes, terminator excluded. Default: 64 KiB.
    pub max_frame_size: usize,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_frame_size: 64 * 1024,
        }
    }
}

/// Errors that can occur while reading frames.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The line exceeded the configured maximum and was skipped.
    #[error("frame of at least {size} bytes exceeds maximum {max}")]
    FrameTooLarge {
        /// Bytes seen before the frame was abandoned.
        size: usize,
        /// The configured maximum.
        max: usize,
    },

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FrameError {
    /// Whether the stream can keep being read after this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, FrameError::FrameTooLarge { .. })
    }
}

/// Buffered reader that yields one frame per newline-terminated line.
pub struct FrameReader<R> {
    reader: BufReader<R>,
    line: Vec<u8>,
    config: FrameConfig,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Wrap a byte stream.
    pub fn new(reader: R, config: FrameConfig) -> Self {
        Self {
            reader: BufReader::new(reader),
            line: Vec::new(),
            config,
        }
    }

    /// Read the next non-blank frame.
    ///
    /// Returns `Ok(None)` at end-of-stream.
    pub async fn next_frame(&mut self) -> Result<Option<Vec<u8>>, FrameError> {
        let max = self.config.max_frame_size;
        // Room for the payload plus "\r\n".
        let limit = max as u64 + 2;

        loop {
            self.line.clear();
            let n = (&mut self.reader)
                .take(limit)
                .read_until(b'\n', &mut self.line)
                .await?;
            if n == 0 {
                return Ok(None);
            }

            if self.line.last() == Some(&b'\n') {
                self.line.pop();
                if self.line.last() == Some(&b'\r') {
                    self.line.pop();
                }
            } else if n as u64 >= limit {
                let skipped = self.discard_line().await?;
                return Err(FrameError::FrameTooLarge {
                    size: n + skipped,
                    max,
                });
            }

            let frame = self.line.trim_ascii();
            if frame.is_empty() {
                continue;
            }
            if frame.len() > max {
                return Err(FrameError::FrameTooLarge {
                    size: frame.len(),
                    max,
                });
            }
            return Ok(Some(frame.to_vec()));
        }
    }

    /// Skip input up to and including the next newline.
    async fn discard_line(&mut self) -> Result<usize, FrameError> {
        let mut skipped = 0;
        loop {
            let (consumed, found) = {
                let buf = self.reader.fill_buf().await?;
                if buf.is_empty() {
                    return Ok(skipped);
                }
                match buf.iter().position(|b| *b == b'\n') {
                    Some(pos) => (pos + 1, true),
                    None => (buf.len(), false),
                }
            };
            self.reader.consume(consumed);
            skipped += consumed;
            if found {
                return Ok(skipped);
            }
        }
    }
}

/// A fully encoded outbound frame, shared between every recipient of a
/// broadcast.
pub type EncodedFrame = Arc<[u8]>;

/// Serialize a message as one JSON line, newline included.
pub fn encode_frame<T: Serialize>(message: &T) -> Result<EncodedFrame, serde_json::Error> {
    let mut bytes = serde_json::to_vec(message)?;
    bytes.push(b'\n');
    Ok(bytes.into())
}

/// Write an already encoded frame and flush.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    frame: &[u8],
) -> std::io::Result<()> {
    writer.write_all(frame).await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    fn reader_for(
        bytes: &'static [u8],
        config: FrameConfig,
    ) -> FrameReader<tokio::io::DuplexStream> {
        let (mut client, server) = duplex(8192);
        tokio::spawn(async move {
            client.write_all(bytes).await.unwrap();
        });
        FrameReader::new(server, config)
    }

    #[tokio::test]
    async fn test_lines_become_frames_in_order() {
        let mut reader = reader_for(
            b"{\"Command\":\"ping\"}\n{\"Command\":\"logout\"}\n",
            FrameConfig::default(),
        );
        assert_eq!(
            reader.next_frame().await.unwrap().unwrap(),
            b"{\"Command\":\"ping\"}"
        );
        assert_eq!(
            reader.next_frame().await.unwrap().unwrap(),
            b"{\"Command\":\"logout\"}"
        );
        assert!(reader.next_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_crlf_and_blank_lines() {
        let mut reader = reader_for(b"\n\r\n  \n{\"a\":1}\r\n", FrameConfig::default());
        assert_eq!(reader.next_frame().await.unwrap().unwrap(), b"{\"a\":1}");
        assert!(reader.next_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unterminated_final_line_is_delivered() {
        let mut reader = reader_for(b"{\"a\":1}\n{\"b\":2}", FrameConfig::default());
        assert_eq!(reader.next_frame().await.unwrap().unwrap(), b"{\"a\":1}");
        assert_eq!(reader.next_frame().await.unwrap().unwrap(), b"{\"b\":2}");
        assert!(reader.next_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_partial_writes_are_reassembled() {
        let (mut client, server) = duplex(4);
        let write_task = tokio::spawn(async move {
            for chunk in [&b"{\"Comm"[..], b"and\":", b"\"ping\"}", b"\n"] {
                client.write_all(chunk).await.unwrap();
            }
        });

        let mut reader = FrameReader::new(server, FrameConfig::default());
        let frame = reader.next_frame().await.unwrap().unwrap();
        write_task.await.unwrap();
        assert_eq!(frame, b"{\"Command\":\"ping\"}");
    }

    #[tokio::test]
    async fn test_oversized_line_is_skipped_and_reader_recovers() {
        let config = FrameConfig { max_frame_size: 8 };
        let mut reader = reader_for(b"0123456789abcdefghij\n{\"ok\":1}\n", config);

        let err = reader.next_frame().await.unwrap_err();
        assert!(matches!(err, FrameError::FrameTooLarge { max: 8, .. }));
        assert!(err.is_recoverable());

        assert_eq!(reader.next_frame().await.unwrap().unwrap(), b"{\"ok\":1}");
    }

    #[tokio::test]
    async fn test_line_one_byte_over_limit_rejected() {
        let config = FrameConfig { max_frame_size: 4 };
        let mut reader = reader_for(b"12345\nabcd\n", config);
        assert!(matches!(
            reader.next_frame().await,
            Err(FrameError::FrameTooLarge { .. })
        ));
        assert_eq!(reader.next_frame().await.unwrap().unwrap(), b"abcd");
    }

    #[tokio::test]
    async fn test_closed_stream_yields_none() {
        let (client, server) = duplex(64);
        drop(client);
        let mut reader = FrameReader::new(server, FrameConfig::default());
        assert!(reader.next_frame().await.unwrap().is_none());
    }

    #[test]
    fn test_encode_frame_appends_newline() {
        let frame = encode_frame(&serde_json::json!({"Command": "pong"})).unwrap();
        assert_eq!(&frame[..], b"{\"Command\":\"pong\"}\n");
    }

    #[tokio::test]
    async fn test_written_frames_read_back() {
        let (mut client, server) = duplex(8192);
        let first = encode_frame(&serde_json::json!({"n": 1})).unwrap();
        let second = encode_frame(&serde_json::json!({"n": 2})).unwrap();
        write_frame(&mut client, &first).await.unwrap();
        write_frame(&mut client, &second).await.unwrap();
        drop(client);

        let mut reader = FrameReader::new(server, FrameConfig::default());
        assert_eq!(reader.next_frame().await.unwrap().unwrap(), b"{\"n\":1}");
        assert_eq!(reader.next_frame().await.unwrap().unwrap(), b"{\"n\":2}");
    }
}
