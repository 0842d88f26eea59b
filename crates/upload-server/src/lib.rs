//! Upload coordinator for chunked uploads.
//!
//! Accepts one chunk per multipart request, stores it through the
//! [`ChunkStore`](chunkmerge_transfer::ChunkStore), and runs the merge under
//! the [`MergeRegistry`](chunkmerge_transfer::MergeRegistry) once the client
//! reports the final chunk. Transport is left to the embedding application.

mod coordinator;
pub mod multipart;

pub use coordinator::{
    CoordinatorConfig, MergeCallback, MergeDispatch, MergeEvent, UploadCoordinator, merge_status,
};

use chunkmerge_protocol::{ErrorResponse, MetadataError};
use chunkmerge_transfer::TransferError;

/// Errors produced by the upload coordinator.
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("invalid metadata: {0}")]
    Metadata(#[from] MetadataError),

    #[error("malformed multipart body: {0}")]
    Multipart(#[from] multer::Error),

    #[error("merge already in progress: {0}")]
    MergeConflict(String),

    #[error(transparent)]
    Transfer(#[from] TransferError),
}

impl UploadError {
    /// HTTP-style status code for the embedding transport.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidRequest(_) | Self::Metadata(_) | Self::Multipart(_) => 400,
            Self::MergeConflict(_) => 409,
            Self::Transfer(e) => match e {
                TransferError::InvalidPath(_) | TransferError::ChunkName(_) => 400,
                TransferError::Incomplete { .. } => 409,
                TransferError::Cancelled(_) => 503,
                TransferError::Io(_) | TransferError::MergeFailed { .. } => 500,
            },
        }
    }

    /// Error body for the embedding transport.
    pub fn to_response(&self) -> ErrorResponse {
        ErrorResponse {
            code: self.status_code(),
            message: self.to_string(),
        }
    }
}
