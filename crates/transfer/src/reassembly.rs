//! Merges the chunks of a logical file into the final artifact.
//!
//! One invocation walks `Discovering → Sorting → Writing → CleaningUp → Done`
//! and ends in `Done` or `Failed`. Mutual exclusion per logical name is the
//! caller's job (see [`MergeRegistry`](crate::MergeRegistry)).

use std::collections::BTreeMap;
use std::fmt;
use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::checksum::MergeDigest;
use crate::naming;
use crate::store::{ChunkStore, StoredChunk};
use crate::{RetryPolicy, TransferError, canonical_logical_name};

/// Read buffer used while copying a chunk into the destination (256 KiB).
pub const COPY_BUFFER_SIZE: usize = 256 * 1024;

/// Merge state, logged on every transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergePhase {
    Discovering,
    Sorting,
    Writing,
    CleaningUp,
    Done,
    Failed,
}

impl fmt::Display for MergePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Discovering => "discovering",
            Self::Sorting => "sorting",
            Self::Writing => "writing",
            Self::CleaningUp => "cleaning_up",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Engine tuning.
#[derive(Debug, Clone, Default)]
pub struct MergeOptions {
    pub retry: RetryPolicy,
    /// Refuse to merge unless parts `1..=expected_chunks` are all present.
    pub require_complete: bool,
}

/// What to merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeTarget {
    pub logical_name: String,
    /// Chunk count announced by the client, if known.
    pub expected_chunks: Option<u32>,
    /// Size of the whole file announced by the client, if known.
    pub expected_total: Option<u64>,
}

impl MergeTarget {
    pub fn new(logical_name: impl Into<String>) -> Self {
        Self {
            logical_name: logical_name.into(),
            expected_chunks: None,
            expected_total: None,
        }
    }

    pub fn with_expected_chunks(mut self, chunks: u32) -> Self {
        self.expected_chunks = (chunks > 0).then_some(chunks);
        self
    }

    pub fn with_expected_total(mut self, total: u64) -> Self {
        self.expected_total = (total > 0).then_some(total);
        self
    }
}

/// A decoded chunk ready to be merged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartFile {
    pub part: u32,
    pub path: PathBuf,
}

/// Result of a completed merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeReport {
    pub logical_name: String,
    pub destination: PathBuf,
    /// Part numbers in the order they were written.
    pub parts: Vec<u32>,
    pub bytes_written: u64,
    /// Hex SHA-256 of the merged file, computed while it was written.
    pub sha256: String,
    pub chunks_removed: usize,
    pub cleanup_failures: usize,
    /// Announced total when it differs from `bytes_written`.
    pub size_mismatch: Option<u64>,
}

/// Outcome of [`ReassemblyEngine::merge`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    /// No chunk files were found; nothing was written.
    NothingToMerge,
    Merged(MergeReport),
}

/// Concatenates chunks in part-number order.
#[derive(Debug, Clone)]
pub struct ReassemblyEngine {
    store: Arc<ChunkStore>,
    output_root: PathBuf,
    options: MergeOptions,
}

impl ReassemblyEngine {
    /// Creates an engine writing merged files under `output_root`.
    pub fn new(
        store: Arc<ChunkStore>,
        output_root: impl Into<PathBuf>,
        options: MergeOptions,
    ) -> Self {
        Self {
            store,
            output_root: output_root.into(),
            options,
        }
    }

    pub fn store(&self) -> &Arc<ChunkStore> {
        &self.store
    }

    pub fn options(&self) -> &MergeOptions {
        &self.options
    }

    /// Where the merged file for `logical` is written.
    pub fn destination_path(&self, logical: &str) -> Result<PathBuf, TransferError> {
        Ok(self.output_root.join(canonical_logical_name(logical)?))
    }

    /// Runs one merge of `target`.
    ///
    /// On failure the partial destination is removed and chunk files are
    /// kept, so the merge can be run again.
    pub async fn merge(
        &self,
        target: &MergeTarget,
        cancel: &CancellationToken,
    ) -> Result<MergeOutcome, TransferError> {
        let result = self.run(target, cancel).await;
        if let Err(e) = &result {
            error!(
                logical = %target.logical_name,
                phase = %MergePhase::Failed,
                "merge failed: {e}"
            );
        }
        result
    }

    async fn run(
        &self,
        target: &MergeTarget,
        cancel: &CancellationToken,
    ) -> Result<MergeOutcome, TransferError> {
        let logical = canonical_logical_name(&target.logical_name)?;
        let logical = logical.as_str();
        let destination = self.destination_path(logical)?;

        enter(logical, MergePhase::Discovering);
        let found = self.store.list_chunks(logical).await?;
        if found.is_empty() {
            debug!(logical, "no chunks found, nothing to merge");
            enter(logical, MergePhase::Done);
            return Ok(MergeOutcome::NothingToMerge);
        }

        enter(logical, MergePhase::Sorting);
        let parts = sort_parts(found);
        if parts.is_empty() {
            debug!(logical, "no decodable chunks, nothing to merge");
            enter(logical, MergePhase::Done);
            return Ok(MergeOutcome::NothingToMerge);
        }
        if self.options.require_complete
            && let Some(expected) = target.expected_chunks
        {
            let missing = missing_parts(&parts, expected);
            if !missing.is_empty() {
                return Err(TransferError::Incomplete {
                    logical: logical.to_string(),
                    missing,
                });
            }
        }

        enter(logical, MergePhase::Writing);
        let written = self
            .write_destination(logical, &destination, &parts, cancel)
            .await;
        let digest = match written {
            Ok(digest) => digest,
            Err(e) => {
                discard_partial(&destination).await;
                return Err(e);
            }
        };

        let bytes_written = digest.bytes();
        let sha256 = digest.finish();

        let size_mismatch = target.expected_total.filter(|&total| total != bytes_written);
        if let Some(total) = size_mismatch {
            warn!(
                logical,
                expected = total,
                actual = bytes_written,
                "merged size differs from announced total"
            );
        }

        enter(logical, MergePhase::CleaningUp);
        let (chunks_removed, cleanup_failures) = self.cleanup(logical, &parts).await;

        enter(logical, MergePhase::Done);
        info!(
            logical,
            parts = parts.len(),
            bytes = bytes_written,
            path = %destination.display(),
            "merge complete"
        );

        Ok(MergeOutcome::Merged(MergeReport {
            logical_name: logical.to_string(),
            destination,
            parts: parts.iter().map(|p| p.part).collect(),
            bytes_written,
            sha256,
            chunks_removed,
            cleanup_failures,
            size_mismatch,
        }))
    }

    /// Replaces `destination` with the ordered concatenation of `parts`.
    ///
    /// Returns the digest of everything written.
    async fn write_destination(
        &self,
        logical: &str,
        destination: &Path,
        parts: &[PartFile],
        cancel: &CancellationToken,
    ) -> Result<MergeDigest, TransferError> {
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent).await?;
        }
        match fs::remove_file(destination).await {
            Ok(()) => debug!(logical, "replacing existing merged file"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let mut dest = File::create(destination).await?;
        let mut digest = MergeDigest::new();

        for part in parts {
            if cancel.is_cancelled() {
                return Err(TransferError::Cancelled(logical.to_string()));
            }
            self.copy_part(logical, &mut dest, part, &mut digest, cancel)
                .await?;
        }

        dest.flush().await?;
        dest.sync_all().await?;
        Ok(digest)
    }

    /// Appends one chunk after the bytes already in `digest`, retrying with
    /// backoff.
    ///
    /// Every retry first truncates the destination back to the chunk
    /// boundary and restarts from the digest taken there, so a partially
    /// copied chunk is neither written nor hashed twice.
    async fn copy_part(
        &self,
        logical: &str,
        dest: &mut File,
        part: &PartFile,
        digest: &mut MergeDigest,
        cancel: &CancellationToken,
    ) -> Result<(), TransferError> {
        let policy = self.options.retry;
        let offset = digest.bytes();
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let mut running = digest.clone();
            let err = match copy_once(dest, &part.path, &mut running).await {
                Ok(n) => {
                    debug!(logical, part = part.part, bytes = n, attempt, "chunk copied");
                    *digest = running;
                    return Ok(());
                }
                Err(e) => e,
            };

            if !policy.should_retry(attempt) {
                return Err(TransferError::MergeFailed {
                    logical: logical.to_string(),
                    part: part.part,
                    attempts: attempt,
                    source: err,
                });
            }

            let delay = policy.backoff(attempt);
            warn!(
                logical,
                part = part.part,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "chunk copy failed, retrying: {err}"
            );
            rewind(dest, offset).await?;

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(TransferError::Cancelled(logical.to_string()));
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Deletes merged chunks concurrently. Returns `(removed, failed)`.
    async fn cleanup(&self, logical: &str, parts: &[PartFile]) -> (usize, usize) {
        let results = futures_util::future::join_all(
            parts.iter().map(|p| self.store.delete(&p.path)),
        )
        .await;

        let mut removed = 0;
        let mut failed = 0;
        for (part, result) in parts.iter().zip(results) {
            match result {
                Ok(true) => removed += 1,
                Ok(false) => {}
                Err(e) => {
                    failed += 1;
                    warn!(
                        logical,
                        part = part.part,
                        path = %part.path.display(),
                        "failed to delete chunk: {e}"
                    );
                }
            }
        }
        (removed, failed)
    }
}

fn enter(logical: &str, phase: MergePhase) {
    debug!(logical, %phase, "merge phase");
}

/// Decodes and orders chunk files by part number.
///
/// Entries that do not decode are skipped. If two entries share a part
/// number the later-listed one wins.
pub fn sort_parts(chunks: Vec<StoredChunk>) -> Vec<PartFile> {
    let mut by_part: BTreeMap<u32, PathBuf> = BTreeMap::new();
    for chunk in chunks {
        match naming::decode(&chunk.name) {
            Ok(name) => {
                by_part.insert(name.part, chunk.path);
            }
            Err(e) => {
                warn!(name = %chunk.name, "skipping non-chunk file: {e}");
            }
        }
    }
    by_part
        .into_iter()
        .map(|(part, path)| PartFile { part, path })
        .collect()
}

/// Part numbers in `1..=expected` that are absent from `parts`.
pub fn missing_parts(parts: &[PartFile], expected: u32) -> Vec<u32> {
    (1..=expected)
        .filter(|n| !parts.iter().any(|p| p.part == *n))
        .collect()
}

async fn copy_once(dest: &mut File, path: &Path, digest: &mut MergeDigest) -> io::Result<u64> {
    let mut src = File::open(path).await?;
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut copied = 0u64;
    loop {
        let n = src.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        dest.write_all(&buf[..n]).await?;
        digest.update(&buf[..n]);
        copied += n as u64;
    }
    Ok(copied)
}

async fn rewind(dest: &mut File, offset: u64) -> io::Result<()> {
    dest.flush().await?;
    dest.set_len(offset).await?;
    dest.seek(SeekFrom::Start(offset)).await?;
    Ok(())
}

async fn discard_partial(destination: &Path) {
    if let Err(e) = fs::remove_file(destination).await {
        if e.kind() != io::ErrorKind::NotFound {
            warn!(path = %destination.display(), "failed to remove partial merge output: {e}");
        }
    }
}
