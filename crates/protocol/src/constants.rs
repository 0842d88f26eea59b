/// Delimiter between a logical file name and its part number in a stored
/// chunk name (`report.pdf.partNumber-3`).
pub const PART_TOKEN: &str = ".partNumber-";

/// Folder (under the storage root) that holds chunk files and merged output.
///
/// Kept identical to the folder used by existing upload clients.
pub const DEFAULT_CHUNK_FOLDER: &str = "a658591407c04576cff0649dbff0d285";

/// Write buffer used when the client sends no `size` hint (64 KiB).
pub const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;

/// Upper bound for a client supplied buffer hint (8 MiB).
pub const MAX_BUFFER_SIZE: usize = 8 * 1024 * 1024;
