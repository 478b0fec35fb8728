//! Newline-delimited framing for JSON-RPC over byte streams.
//!
//! One JSON document per line. Blank lines are skipped. A line longer than
//! the frame limit is discarded as it streams in and reported as
//! [`Error::FrameTooLarge`]; the reader stays usable afterwards.

use futures::StreamExt;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::bytes::BytesMut;
use tokio_util::codec::{Decoder, FramedRead, LinesCodec, LinesCodecError};

use crate::error::{Error, Result};

/// Maximum size of a single frame (50MB).
/// Sized for base64 audio arguments, matching the HTTP body limit.
pub const MAX_FRAME_SIZE: usize = 50 * 1024 * 1024;

enum Line {
    Text(String),
    Oversized,
    NotUtf8,
}

struct LineDecoder {
    lines: LinesCodec,
}

impl LineDecoder {
    fn lift(result: std::result::Result<Option<String>, LinesCodecError>) -> Result<Option<Line>> {
        match result {
            Ok(line) => Ok(line.map(Line::Text)),
            Err(LinesCodecError::MaxLineLengthExceeded) => Ok(Some(Line::Oversized)),
            // Decoding does no I/O of its own; this is the UTF-8 check.
            Err(LinesCodecError::Io(_)) => Ok(Some(Line::NotUtf8)),
        }
    }
}

impl Decoder for LineDecoder {
    type Item = Line;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Line>> {
        Self::lift(self.lines.decode(buf))
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Line>> {
        Self::lift(self.lines.decode_eof(buf))
    }
}

/// Reads newline-delimited frames from a byte stream.
pub struct FrameReader<R> {
    frames: FramedRead<R, LineDecoder>,
    max: usize,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self::with_max_frame_size(reader, MAX_FRAME_SIZE)
    }

    pub fn with_max_frame_size(reader: R, max: usize) -> Self {
        let decoder = LineDecoder {
            lines: LinesCodec::new_with_max_length(max),
        };
        Self {
            frames: FramedRead::new(reader, decoder),
            max,
        }
    }

    /// Read the next non-empty frame. Returns `None` at end of stream.
    ///
    /// `FrameTooLarge` and `InvalidFrame` are per-line: the offending line
    /// has been dropped and the next call reads the line after it.
    pub async fn next_frame(&mut self) -> Result<Option<String>> {
        loop {
            match self.frames.next().await.transpose()? {
                None => return Ok(None),
                Some(Line::Oversized) => return Err(Error::FrameTooLarge { max: self.max }),
                Some(Line::NotUtf8) => {
                    return Err(Error::InvalidFrame("line is not valid UTF-8".to_string()));
                }
                Some(Line::Text(line)) => {
                    let trimmed = line.trim();
                    if !trimmed.is_empty() {
                        return Ok(Some(trimmed.to_string()));
                    }
                }
            }
        }
    }
}

/// Serialize `message` as one line and flush.
pub async fn write_frame<W, T>(writer: &mut W, message: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut json = serde_json::to_vec(message)?;
    json.push(b'\n');
    writer.write_all(&json).await?;
    writer.flush().await?;
    Ok(())
}
