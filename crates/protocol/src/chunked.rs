//! Chunked transfer encoding: a streaming decoder and the matching writers.
//!
//! Frames are `<hex size>\r\n<payload>\r\n`; a zero size ends the body.
//! Chunk extensions and trailers are not supported.

use tokio::io::{AsyncBufRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::head::{Line, read_line};
use crate::{MAX_CHUNK_SIZE, MAX_LINE_LEN, WireError};

// ---------------------------------------------------------------------------
// Decoder
// ---------------------------------------------------------------------------

/// Decodes a chunked body into plain payload bytes, one chunk at a time.
///
/// The current chunk and read cursor survive across calls, so callers may
/// read with any buffer size.
pub struct ChunkDecoder<R> {
    reader: R,
    chunk: Vec<u8>,
    pos: usize,
    finished: bool,
    max_chunk_size: usize,
    chunks_read: u64,
}

impl<R: AsyncBufRead + Unpin> ChunkDecoder<R> {
    pub fn new(reader: R) -> Self {
        Self::with_max_chunk_size(reader, MAX_CHUNK_SIZE)
    }

    /// Creates a decoder that rejects chunks larger than `max_chunk_size`.
    pub fn with_max_chunk_size(reader: R, max_chunk_size: usize) -> Self {
        Self {
            reader,
            chunk: Vec::new(),
            pos: 0,
            finished: false,
            max_chunk_size,
            chunks_read: 0,
        }
    }

    /// Reads decoded bytes into `buf`. Returns 0 once the terminating
    /// zero-size chunk has been consumed, and on every call after that.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, WireError> {
        if buf.is_empty() {
            return Ok(0);
        }
        while self.pos == self.chunk.len() {
            if self.finished {
                return Ok(0);
            }
            self.next_chunk().await?;
        }
        let n = buf.len().min(self.chunk.len() - self.pos);
        buf[..n].copy_from_slice(&self.chunk[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }

    /// Whether the terminating chunk has been seen.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Number of non-empty chunks decoded so far.
    pub fn chunks_read(&self) -> u64 {
        self.chunks_read
    }

    pub fn into_inner(self) -> R {
        self.reader
    }

    async fn next_chunk(&mut self) -> Result<(), WireError> {
        let size = self.read_size().await?;
        self.chunk.clear();
        self.pos = 0;

        if size == 0 {
            self.finished = true;
            return match read_line(&mut self.reader, MAX_LINE_LEN).await? {
                Line::Complete(line) if line.is_empty() => Ok(()),
                Line::Eof => Ok(()),
                _ => Err(WireError::Framing(
                    "unexpected data after terminating chunk".into(),
                )),
            };
        }

        if size > self.max_chunk_size {
            return Err(WireError::Framing(format!(
                "chunk of {size} bytes exceeds limit of {}",
                self.max_chunk_size
            )));
        }

        self.chunk.resize(size, 0);
        let mut filled = 0;
        while filled < size {
            let n = self.reader.read(&mut self.chunk[filled..]).await?;
            if n == 0 {
                self.chunk.clear();
                return Err(WireError::Framing(format!(
                    "chunk truncated: declared {size} bytes, read {filled}"
                )));
            }
            filled += n;
        }

        match read_line(&mut self.reader, MAX_LINE_LEN).await? {
            Line::Complete(line) if line.is_empty() => {}
            _ => {
                self.chunk.clear();
                return Err(WireError::Framing(format!(
                    "chunk of {size} bytes not followed by CRLF"
                )));
            }
        }
        self.chunks_read += 1;
        Ok(())
    }

    async fn read_size(&mut self) -> Result<usize, WireError> {
        let line = match read_line(&mut self.reader, MAX_LINE_LEN).await? {
            Line::Complete(line) => line,
            Line::Partial(_) | Line::Eof => {
                return Err(WireError::Framing(
                    "chunked body ended before terminating chunk".into(),
                ));
            }
            Line::TooLong => {
                return Err(WireError::Framing("invalid chunk marker: too long".into()));
            }
        };
        parse_chunk_size(&line)
    }
}

fn parse_chunk_size(line: &[u8]) -> Result<usize, WireError> {
    let text = std::str::from_utf8(line).unwrap_or_default().trim();
    let invalid = || {
        WireError::Framing(format!(
            "invalid chunk marker: {:?}",
            String::from_utf8_lossy(line)
        ))
    };
    if text.is_empty() || !text.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(invalid());
    }
    usize::from_str_radix(text, 16).map_err(|_| invalid())
}

// ---------------------------------------------------------------------------
// Encoder
// ---------------------------------------------------------------------------

/// Writes one chunk frame. Empty input writes nothing, since a zero-size
/// frame would end the body.
pub async fn write_chunk<W: AsyncWrite + Unpin>(
    writer: &mut W,
    data: &[u8],
) -> std::io::Result<()> {
    if data.is_empty() {
        return Ok(());
    }
    writer
        .write_all(format!("{:x}\r\n", data.len()).as_bytes())
        .await?;
    writer.write_all(data).await?;
    writer.write_all(b"\r\n").await
}

/// Writes the terminating zero-size chunk.
pub async fn write_last_chunk<W: AsyncWrite + Unpin>(writer: &mut W) -> std::io::Result<()> {
    writer.write_all(b"0\r\n\r\n").await
}

/// Encodes `data` into frames of at most `chunk_size` bytes plus terminator.
pub fn encode_chunked(data: &[u8], chunk_size: usize) -> Vec<u8> {
    let chunk_size = chunk_size.max(1);
    let mut out = Vec::with_capacity(data.len() + data.len() / chunk_size * 8 + 8);
    for frame in data.chunks(chunk_size) {
        out.extend_from_slice(format!("{:x}\r\n", frame.len()).as_bytes());
        out.extend_from_slice(frame);
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"0\r\n\r\n");
    out
}
