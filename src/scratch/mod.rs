//! Scratch store
//!
//! Model artifacts and metrics move through flat per-task temporary files
//! named `<uuid>.bin` / `<uuid>.json`. Downloads stream into a
//! [`ScratchWriter`] frame by frame; uploads stream out of a [`ChunkReader`]
//! in fixed-size chunks. Files are minted under a fresh correlation id and
//! removed unconditionally when the task finishes.

use std::io;
use std::path::{Path, PathBuf};

use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, warn};
use uuid::Uuid;

/// Default transfer chunk size: 1 MiB.
pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;

/// Mint a fresh correlation id (hyphenated UUID v4).
///
/// Uniqueness is probabilistic only; ids are never coordinated with the
/// server.
pub fn mint_id() -> String {
    Uuid::new_v4().to_string()
}

/// Scratch path for a model artifact.
pub fn model_path(dir: &Path, id: &str) -> PathBuf {
    dir.join(format!("{id}.bin"))
}

/// Scratch path for a metrics / prediction JSON document.
pub fn json_path(dir: &Path, id: &str) -> PathBuf {
    dir.join(format!("{id}.json"))
}

/// Remove a scratch file, logging but never failing on absence.
pub async fn remove(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "Removed scratch file"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "Scratch file already absent");
        }
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove scratch file"),
    }
}

/// Appends inbound stream frames to a file opened for binary write.
pub struct ScratchWriter {
    file: File,
    path: PathBuf,
    written: u64,
}

impl ScratchWriter {
    /// Create (truncate) the file at `path` for binary writing.
    pub async fn create(path: &Path) -> io::Result<Self> {
        let file = File::create(path).await?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
            written: 0,
        })
    }

    /// Append one frame of bytes.
    pub async fn append(&mut self, data: &[u8]) -> io::Result<()> {
        self.file.write_all(data).await?;
        self.written += data.len() as u64;
        Ok(())
    }

    /// Flush and close, returning the total number of bytes written.
    pub async fn finish(mut self) -> io::Result<u64> {
        self.file.flush().await?;
        Ok(self.written)
    }

    /// Path this writer appends to.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes written so far.
    pub fn written(&self) -> u64 {
        self.written
    }
}

/// One outbound chunk. Only the final chunk of a file carries
/// `is_last = true`, and that chunk is always empty: the end-of-model
/// marker is a frame of its own, distinct from the last data frame and
/// from the transport end of stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub data: Vec<u8>,
    pub is_last: bool,
}

/// Iterates a file in fixed-size chunks for upload.
pub struct ChunkReader {
    file: BufReader<File>,
    chunk_size: usize,
    finished: bool,
}

impl ChunkReader {
    /// Open `path` for chunked reading. A zero `chunk_size` is clamped to 1.
    pub async fn open(path: &Path, chunk_size: usize) -> io::Result<Self> {
        let file = File::open(path).await?;
        Ok(Self {
            file: BufReader::new(file),
            chunk_size: chunk_size.max(1),
            finished: false,
        })
    }

    /// Next chunk, or `None` once the trailing empty `is_last` chunk has
    /// been yielded.
    pub async fn next_chunk(&mut self) -> io::Result<Option<Chunk>> {
        if self.finished {
            return Ok(None);
        }

        let mut buf = vec![0u8; self.chunk_size];
        let mut filled = 0;
        while filled < self.chunk_size {
            let n = self.file.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }

        if filled == 0 {
            self.finished = true;
            return Ok(Some(Chunk {
                data: Vec::new(),
                is_last: true,
            }));
        }

        buf.truncate(filled);
        Ok(Some(Chunk {
            data: buf,
            is_last: false,
        }))
    }
}
