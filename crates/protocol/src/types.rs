use serde::{Deserialize, Serialize};

use crate::constants::{DEFAULT_BUFFER_SIZE, MAX_BUFFER_SIZE};

/// Metadata sent alongside every chunk upload.
///
/// Clients send it as query parameters (`?fileName=...&partNumber=2&chunks=5`)
/// or as JSON; every field is optional on the wire and defaults to zero/empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkMetadata {
    /// Logical file name (before any part suffix).
    #[serde(default)]
    pub file_name: String,
    /// 1-based ordinal of this chunk.
    #[serde(default)]
    pub part_number: u32,
    /// Total number of chunks for the logical file.
    #[serde(default)]
    pub chunks: u32,
    /// Buffer size hint used while persisting the chunk.
    #[serde(default)]
    pub size: u32,
    /// Byte offset of this chunk within the logical file.
    #[serde(default)]
    pub start: u64,
    /// End offset (exclusive) of this chunk within the logical file.
    #[serde(default)]
    pub end: u64,
    /// Size of the whole logical file in bytes (0 if unknown).
    #[serde(default)]
    pub total: u64,
}

/// Reasons a [`ChunkMetadata`] is rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MetadataError {
    #[error("partNumber must be >= 1")]
    PartNumberZero,

    #[error("chunks must be >= 1")]
    NoChunks,

    #[error("partNumber {part} exceeds chunk count {chunks}")]
    PartOutOfRange { part: u32, chunks: u32 },
}

impl ChunkMetadata {
    /// Checks `partNumber ∈ [1, chunks]`.
    pub fn validate(&self) -> Result<(), MetadataError> {
        if self.part_number == 0 {
            return Err(MetadataError::PartNumberZero);
        }
        if self.chunks == 0 {
            return Err(MetadataError::NoChunks);
        }
        if self.part_number > self.chunks {
            return Err(MetadataError::PartOutOfRange {
                part: self.part_number,
                chunks: self.chunks,
            });
        }
        Ok(())
    }

    /// Returns `true` when the client marked this upload as the final chunk.
    ///
    /// This says nothing about whether the other chunks already exist on disk.
    pub fn is_last_chunk(&self) -> bool {
        self.part_number != 0 && self.part_number == self.chunks
    }

    /// Write buffer size derived from the `size` hint, clamped to a sane range.
    pub fn buffer_size(&self) -> usize {
        match self.size as usize {
            0 => DEFAULT_BUFFER_SIZE,
            n => n.min(MAX_BUFFER_SIZE),
        }
    }

    /// Expected byte length of this chunk, if the client sent a byte range.
    pub fn expected_len(&self) -> Option<u64> {
        (self.end > self.start).then(|| self.end - self.start)
    }

    /// Expected size of the merged file, if known.
    pub fn expected_total(&self) -> Option<u64> {
        (self.total > 0).then_some(self.total)
    }
}
