//! Handle to a completed transfer and its one-shot consuming reader.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use tracing::{debug, warn};

/// A fully received body, persisted in its cache file.
///
/// Opening the body consumes the handle: the returned reader deletes the
/// cache file once it reaches end-of-data or is dropped, so the bytes are
/// handed to exactly one consumer.
#[derive(Debug)]
pub struct CachedBody {
    unique_id: String,
    path: PathBuf,
    len: u64,
    compressed: bool,
}

impl CachedBody {
    pub(crate) fn new(unique_id: String, path: PathBuf, len: u64, compressed: bool) -> Self {
        Self {
            unique_id,
            path,
            len,
            compressed,
        }
    }

    pub fn unique_id(&self) -> &str {
        &self.unique_id
    }

    /// Location of the cache file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stored length in bytes (compressed length for gzip bodies).
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether the sender declared `Content-Encoding: gzip`.
    pub fn is_compressed(&self) -> bool {
        self.compressed
    }

    /// Opens the stored bytes as they were received.
    pub fn open(self) -> std::io::Result<ConsumingReader> {
        let file = File::open(&self.path)?;
        Ok(ConsumingReader {
            file: Some(file),
            path: self.path,
        })
    }

    /// Opens the body, transparently gunzipping compressed transfers.
    pub fn into_reader(self) -> std::io::Result<Box<dyn Read + Send>> {
        let compressed = self.compressed;
        let reader = self.open()?;
        if compressed {
            Ok(Box::new(GzDecoder::new(reader)))
        } else {
            Ok(Box::new(reader))
        }
    }

    /// Deletes the cache file without reading it.
    pub fn discard(self) -> std::io::Result<()> {
        std::fs::remove_file(&self.path)
    }
}

/// Reader over a cache file that deletes the file when exhausted or dropped.
#[derive(Debug)]
pub struct ConsumingReader {
    file: Option<File>,
    path: PathBuf,
}

impl ConsumingReader {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the backing file has already been deleted.
    pub fn is_consumed(&self) -> bool {
        self.file.is_none()
    }

    fn finish(&mut self) {
        if self.file.take().is_none() {
            return;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "cache file consumed"),
            Err(e) => warn!(path = %self.path.display(), error = %e, "failed to delete cache file"),
        }
    }
}

impl Read for ConsumingReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let Some(file) = self.file.as_mut() else {
            return Ok(0);
        };
        let n = file.read(buf)?;
        if n == 0 && !buf.is_empty() {
            self.finish();
        }
        Ok(n)
    }
}

impl Drop for ConsumingReader {
    fn drop(&mut self) {
        self.finish();
    }
}
