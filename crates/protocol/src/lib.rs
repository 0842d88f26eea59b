pub mod constants;
pub mod messages;
pub mod types;

// Re-export primary types for convenience.
pub use constants::{DEFAULT_BUFFER_SIZE, DEFAULT_CHUNK_FOLDER, PART_TOKEN};
pub use messages::{ErrorResponse, MergeStatus, UploadAck};
pub use types::{ChunkMetadata, MetadataError};
