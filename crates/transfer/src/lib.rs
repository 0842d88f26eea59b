//! Chunk reassembly for chunked uploads.
//!
//! Chunks of a logical file are stored as `<name>.partNumber-<n>` in a chunk
//! directory and concatenated in part-number order once the last one has
//! arrived. A [`MergeRegistry`] keeps merges of the same file exclusive.

mod checksum;
pub mod naming;
mod reassembly;
mod registry;
mod retry;
mod store;
mod validation;

pub use checksum::{MergeDigest, sha256_hex};
pub use naming::{ChunkName, ChunkNameError};
pub use reassembly::{
    COPY_BUFFER_SIZE, MergeOptions, MergeOutcome, MergePhase, MergeReport, MergeTarget, PartFile,
    ReassemblyEngine, missing_parts, sort_parts,
};
pub use registry::{MergeGuard, MergeRegistry};
pub use retry::{
    DEFAULT_INITIAL_BACKOFF, DEFAULT_MAX_ATTEMPTS, DEFAULT_MAX_BACKOFF, RetryPolicy,
};
pub use store::{ChunkSink, ChunkStore, StoredChunk};
pub use validation::{canonical_logical_name, validate_logical_name};

/// Errors produced by the transfer crate.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("invalid chunk name: {0}")]
    ChunkName(#[from] ChunkNameError),

    #[error("{logical}: missing parts {missing:?}")]
    Incomplete { logical: String, missing: Vec<u32> },

    #[error("{logical}: copying part {part} failed after {attempts} attempts: {source}")]
    MergeFailed {
        logical: String,
        part: u32,
        attempts: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("{0}: merge cancelled")]
    Cancelled(String),
}
