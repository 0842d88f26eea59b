use std::path::{Component, Path};

use crate::TransferError;

/// Validates a logical file name before it is joined onto a storage root.
///
/// Logical names may carry a relative directory (`docs/report.pdf`).
///
/// Rejects:
/// - Empty names and names ending in a separator
/// - Absolute paths (Unix `/` or Windows `C:\`)
/// - Parent directory traversal (`..`)
/// - Windows prefix components (`C:`, `\\server`)
/// - Names with no file component (`.`)
pub fn validate_logical_name(name: &str) -> Result<(), TransferError> {
    canonical_logical_name(name).map(|_| ())
}

/// Validates `name` and returns its canonical spelling.
///
/// `.` segments and repeated separators are dropped and the remaining
/// segments are joined with `/`, so `./docs//r.txt` and `docs/r.txt` name
/// the same file. Every key that identifies a logical file (merge locks,
/// acknowledgements, pending listings) uses this form.
pub fn canonical_logical_name(name: &str) -> Result<String, TransferError> {
    if name.is_empty() {
        return Err(TransferError::InvalidPath("empty file name".into()));
    }

    if name.ends_with('/') || name.ends_with('\\') {
        return Err(TransferError::InvalidPath(format!(
            "file name must not end with a separator: {name}"
        )));
    }

    let path = Path::new(name);

    if path.is_absolute() {
        return Err(TransferError::InvalidPath(format!(
            "absolute path not allowed: {name}"
        )));
    }

    let mut segments: Vec<&str> = Vec::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                return Err(TransferError::InvalidPath(format!(
                    "parent directory traversal not allowed: {name}"
                )));
            }
            Component::Prefix(_) => {
                return Err(TransferError::InvalidPath(format!(
                    "path prefix not allowed: {name}"
                )));
            }
            Component::RootDir => {
                return Err(TransferError::InvalidPath(format!(
                    "absolute path not allowed: {name}"
                )));
            }
            Component::CurDir => {}
            Component::Normal(segment) => match segment.to_str() {
                Some(segment) => segments.push(segment),
                None => {
                    return Err(TransferError::InvalidPath(format!(
                        "file name is not valid UTF-8: {name}"
                    )));
                }
            },
        }
    }

    if segments.is_empty() {
        return Err(TransferError::InvalidPath(format!(
            "no file name component: {name}"
        )));
    }

    Ok(segments.join("/"))
}
