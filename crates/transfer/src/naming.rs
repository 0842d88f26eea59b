//! Stored chunk names: `<base><PART_TOKEN><part>`.
//!
//! This is the only place that knows how a chunk file's logical owner and
//! ordinal are derived from its name.

use std::fmt;

use chunkmerge_protocol::PART_TOKEN;

/// Error returned when a name cannot be encoded or decoded as a chunk name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChunkNameError {
    #[error("part token not found in {0:?}")]
    MissingToken(String),

    #[error("invalid part number {0:?}")]
    InvalidPart(String),

    #[error("empty base name")]
    EmptyBase,

    #[error("base name {0:?} contains the part token")]
    BaseContainsToken(String),
}

/// A decoded chunk name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChunkName {
    pub base: String,
    pub part: u32,
}

impl ChunkName {
    /// Builds a chunk name, rejecting values that would not decode back.
    pub fn new(base: impl Into<String>, part: u32) -> Result<Self, ChunkNameError> {
        let base = base.into();
        if base.is_empty() {
            return Err(ChunkNameError::EmptyBase);
        }
        if base.contains(PART_TOKEN) {
            return Err(ChunkNameError::BaseContainsToken(base));
        }
        if part == 0 {
            return Err(ChunkNameError::InvalidPart(part.to_string()));
        }
        Ok(Self { base, part })
    }
}

impl fmt::Display for ChunkName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.base, PART_TOKEN, self.part)
    }
}

/// Encodes `base` and `part` into a storage name.
pub fn encode(base: &str, part: u32) -> Result<String, ChunkNameError> {
    ChunkName::new(base, part).map(|name| name.to_string())
}

/// Decodes a storage name, splitting on the first part token.
///
/// The suffix must be a plain run of ASCII digits with a value >= 1.
pub fn decode(storage_name: &str) -> Result<ChunkName, ChunkNameError> {
    let Some((base, suffix)) = storage_name.split_once(PART_TOKEN) else {
        return Err(ChunkNameError::MissingToken(storage_name.to_string()));
    };

    if base.is_empty() {
        return Err(ChunkNameError::EmptyBase);
    }

    if suffix.is_empty() || !suffix.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ChunkNameError::InvalidPart(suffix.to_string()));
    }

    let part: u32 = suffix
        .parse()
        .map_err(|_| ChunkNameError::InvalidPart(suffix.to_string()))?;
    if part == 0 {
        return Err(ChunkNameError::InvalidPart(suffix.to_string()));
    }

    Ok(ChunkName {
        base: base.to_string(),
        part,
    })
}

/// Prefix shared by every chunk of `base` (`base` + part token).
pub fn chunk_prefix(base: &str) -> String {
    format!("{base}{PART_TOKEN}")
}
