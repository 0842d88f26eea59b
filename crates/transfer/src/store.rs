//! On-disk chunk storage.
//!
//! Every chunk lives next to its siblings under the chunk directory, named
//! by [`naming::encode`]. Logical names may carry a relative directory, in
//! which case the chunks live in the matching sub-directory.

use std::collections::BTreeMap;
use std::io;
use std::path::{Component, Path, PathBuf};

use tokio::fs;
use tokio::io::{AsyncRead, AsyncWriteExt, BufWriter};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::naming;
use crate::{TransferError, validate_logical_name};

/// A chunk file found on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredChunk {
    /// Storage name (file name only).
    pub name: String,
    /// Full path of the chunk file.
    pub path: PathBuf,
}

/// Chunk directory manager.
#[derive(Debug, Clone)]
pub struct ChunkStore {
    root: PathBuf,
}

impl ChunkStore {
    /// Creates a store rooted at `root`. The directory is created lazily.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Returns the chunk directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Splits a logical name into the directory holding its chunks and the
    /// base name used for encoding.
    fn locate(&self, logical: &str) -> Result<(PathBuf, String), TransferError> {
        validate_logical_name(logical)?;

        let path = Path::new(logical);
        let base = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| TransferError::InvalidPath(format!("no file name in {logical}")))?;
        let dir = match path.parent() {
            Some(parent) => self.root.join(parent),
            None => self.root.clone(),
        };
        Ok((dir, base.to_string()))
    }

    /// Full path of chunk `part` of `logical`.
    pub fn chunk_path(&self, logical: &str, part: u32) -> Result<PathBuf, TransferError> {
        let (dir, base) = self.locate(logical)?;
        Ok(dir.join(naming::encode(&base, part)?))
    }

    /// Opens chunk `part` of `logical` for a new upload attempt.
    ///
    /// The file is truncated, so bytes left behind by an earlier failed
    /// attempt are never merged. `buffer_hint` sizes the write buffer.
    pub async fn begin(
        &self,
        logical: &str,
        part: u32,
        buffer_hint: usize,
    ) -> Result<ChunkSink, TransferError> {
        let path = self.chunk_path(logical, part)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let file = fs::File::create(&path).await?;
        debug!(path = %path.display(), "chunk file opened");

        Ok(ChunkSink {
            writer: BufWriter::with_capacity(buffer_hint.max(1), file),
            path,
            written: 0,
        })
    }

    /// Writes a whole chunk from `reader` in one go.
    ///
    /// Returns the number of bytes stored.
    pub async fn write<R>(
        &self,
        logical: &str,
        part: u32,
        reader: &mut R,
        buffer_hint: usize,
    ) -> Result<u64, TransferError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut sink = self.begin(logical, part, buffer_hint).await?;
        if let Err(e) = sink.append_from(reader).await {
            sink.discard().await;
            return Err(e);
        }
        sink.finish().await
    }

    /// Lists every chunk file belonging to `logical`, in no particular order.
    pub async fn list_chunks(&self, logical: &str) -> Result<Vec<StoredChunk>, TransferError> {
        let (dir, base) = self.locate(logical)?;
        let prefix = naming::chunk_prefix(&base);

        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut chunks = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if !name.starts_with(&prefix) {
                continue;
            }
            if entry.file_type().await?.is_dir() {
                continue;
            }
            chunks.push(StoredChunk {
                name,
                path: entry.path(),
            });
        }
        Ok(chunks)
    }

    /// Removes a chunk file. Returns `false` if it was already gone.
    pub async fn delete(&self, path: &Path) -> Result<bool, TransferError> {
        match fs::remove_file(path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Deletes every chunk of `logical`. Returns how many files were removed.
    pub async fn purge(&self, logical: &str) -> Result<usize, TransferError> {
        let mut removed = 0;
        for chunk in self.list_chunks(logical).await? {
            if self.delete(&chunk.path).await? {
                removed += 1;
            }
        }
        debug!(logical, removed, "purged chunks");
        Ok(removed)
    }

    /// Groups every decodable chunk under the chunk directory by logical name.
    pub async fn pending(&self) -> Result<BTreeMap<String, Vec<u32>>, TransferError> {
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || scan_pending(&root))
            .await
            .map_err(|e| TransferError::Io(io::Error::other(e)))
    }
}

fn scan_pending(root: &Path) -> BTreeMap<String, Vec<u32>> {
    let mut pending: BTreeMap<String, Vec<u32>> = BTreeMap::new();
    if !root.is_dir() {
        return pending;
    }

    for entry in WalkDir::new(root).min_depth(1) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("skipping unreadable entry: {e}");
                continue;
            }
        };
        if entry.file_type().is_dir() {
            continue;
        }
        let Some(name) = entry.file_name().to_str() else {
            continue;
        };
        let Ok(chunk) = naming::decode(name) else {
            continue;
        };

        let rel_dir = entry
            .path()
            .parent()
            .and_then(|p| p.strip_prefix(root).ok())
            .unwrap_or_else(|| Path::new(""));
        pending
            .entry(join_logical(rel_dir, &chunk.base))
            .or_default()
            .push(chunk.part);
    }

    for parts in pending.values_mut() {
        parts.sort_unstable();
        parts.dedup();
    }
    pending
}

/// Rebuilds a `/`-separated logical name from a relative directory and base.
fn join_logical(dir: &Path, base: &str) -> String {
    let mut segments: Vec<String> = dir
        .components()
        .filter_map(|c| match c {
            Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();
    segments.push(base.to_string());
    segments.join("/")
}

// ---------------------------------------------------------------------------
// ChunkSink
// ---------------------------------------------------------------------------

/// An open chunk file for one upload attempt.
///
/// Multiple `append` calls accumulate; [`finish`](Self::finish) flushes and
/// syncs so the chunk is durable before any merge reads it.
pub struct ChunkSink {
    writer: BufWriter<fs::File>,
    path: PathBuf,
    written: u64,
}

impl ChunkSink {
    /// Appends raw bytes.
    pub async fn append(&mut self, bytes: &[u8]) -> Result<(), TransferError> {
        self.writer.write_all(bytes).await?;
        self.written += bytes.len() as u64;
        Ok(())
    }

    /// Appends everything `reader` yields until EOF.
    pub async fn append_from<R>(&mut self, reader: &mut R) -> Result<u64, TransferError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let n = tokio::io::copy(reader, &mut self.writer).await?;
        self.written += n;
        Ok(n)
    }

    /// Bytes written so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Path of the chunk file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flushes and syncs the chunk. Returns the total bytes written.
    pub async fn finish(mut self) -> Result<u64, TransferError> {
        self.writer.flush().await?;
        self.writer.get_ref().sync_all().await?;
        debug!(path = %self.path.display(), bytes = self.written, "chunk file stored");
        Ok(self.written)
    }

    /// Drops a half-written chunk from disk.
    pub async fn discard(self) {
        let path = self.path;
        drop(self.writer);
        if let Err(e) = fs::remove_file(&path).await {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(path = %path.display(), "failed to remove partial chunk: {e}");
            }
        }
    }
}
