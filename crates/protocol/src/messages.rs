use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Response payloads
// ---------------------------------------------------------------------------

/// What happened to the merge step after a chunk was stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum MergeStatus {
    /// The chunk was not the final one.
    NotTriggered,
    /// The final chunk arrived but no chunk files were found.
    NothingToMerge,
    /// The merge ran to completion before the acknowledgement was sent.
    #[serde(rename_all = "camelCase")]
    Completed {
        parts: Vec<u32>,
        bytes: u64,
        path: String,
        #[serde(default, skip_serializing_if = "String::is_empty")]
        sha256: String,
    },
    /// The merge was started in the background.
    Scheduled,
    /// Another merge of the same logical file is still running.
    AlreadyInProgress,
}

/// Acknowledgement for an accepted chunk upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadAck {
    pub file_name: String,
    pub part_number: u32,
    pub bytes_written: u64,
    pub merge: MergeStatus,
}

/// Error body for rejected requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: u16,
    pub message: String,
}
