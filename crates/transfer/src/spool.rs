//! Gzip spool for compressed sends.
//!
//! Offsets exchanged with the receiver count bytes on the wire, so a
//! resumed compressed send must seek into exactly the same compressed
//! stream. The source is compressed once into a temporary file and every
//! attempt reads from that file.

use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use flate2::Compression;
use flate2::write::GzEncoder;
use tempfile::NamedTempFile;
use tracing::debug;

use crate::IO_BUFFER_SIZE;

/// Gzip-compressed copy of a source file. Deleted when the last clone drops.
#[derive(Debug, Clone)]
pub struct CompressedSpool {
    file: Arc<NamedTempFile>,
    source: PathBuf,
    len: u64,
}

impl CompressedSpool {
    /// Compresses `source` into a new temporary file.
    pub async fn create(source: &Path) -> std::io::Result<Self> {
        let source = source.to_path_buf();
        tokio::task::spawn_blocking(move || Self::create_blocking(source))
            .await
            .map_err(std::io::Error::other)?
    }

    fn create_blocking(source: PathBuf) -> std::io::Result<Self> {
        let input = std::fs::File::open(&source)?;
        let mut reader = BufReader::with_capacity(IO_BUFFER_SIZE, input);
        let tmp = NamedTempFile::new()?;
        let mut encoder = GzEncoder::new(
            BufWriter::with_capacity(IO_BUFFER_SIZE, tmp),
            Compression::default(),
        );
        std::io::copy(&mut reader, &mut encoder)?;
        let tmp = encoder
            .finish()?
            .into_inner()
            .map_err(|e| e.into_error())?;
        let len = tmp.as_file().metadata()?.len();
        debug!(source = %source.display(), compressed = len, "spooled compressed body");
        Ok(Self {
            file: Arc::new(tmp),
            source,
            len,
        })
    }

    /// Path of the compressed bytes.
    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// The file that was compressed.
    pub fn source(&self) -> &Path {
        &self.source
    }

    /// Compressed length in bytes.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}
