//! Request-level checks for multipart chunk uploads.
//!
//! Everything here runs before a single byte reaches the chunk directory.

use chunkmerge_protocol::ChunkMetadata;
use chunkmerge_transfer::{ChunkNameError, canonical_logical_name, naming};

use crate::UploadError;

/// Extracts the multipart boundary from a `Content-Type` header value.
///
/// Any `multipart/*` subtype is accepted.
pub fn boundary(content_type: Option<&str>) -> Result<String, UploadError> {
    let Some(raw) = content_type.map(str::trim).filter(|ct| !ct.is_empty()) else {
        return Err(UploadError::InvalidRequest("missing content type".into()));
    };

    let parsed: mime::Mime = raw
        .parse()
        .map_err(|e| UploadError::InvalidRequest(format!("unparsable content type {raw:?}: {e}")))?;

    if parsed.type_() != mime::MULTIPART {
        return Err(UploadError::InvalidRequest(format!(
            "expected a multipart content type, got {raw:?}"
        )));
    }

    match parsed.get_param(mime::BOUNDARY) {
        Some(b) if !b.as_str().is_empty() => Ok(b.as_str().to_string()),
        _ => Err(UploadError::InvalidRequest("missing multipart boundary".into())),
    }
}

/// Where one multipart section is stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionTarget {
    pub logical: String,
    pub part: u32,
}

/// Resolves a section's `filename` into a canonical logical name and part
/// number.
///
/// Clients either send the plain logical name, or the already-encoded chunk
/// name (`report.pdf.partNumber-3`). In the second case the encoded part must
/// agree with the metadata.
pub fn resolve_section(
    file_name: Option<&str>,
    meta: &ChunkMetadata,
) -> Result<SectionTarget, UploadError> {
    let Some(file_name) = file_name.map(str::trim).filter(|n| !n.is_empty()) else {
        return Err(UploadError::InvalidRequest(
            "multipart section has no filename".into(),
        ));
    };

    match naming::decode(file_name) {
        Ok(chunk) if chunk.part == meta.part_number => Ok(SectionTarget {
            logical: canonical_logical_name(&chunk.base)?,
            part: chunk.part,
        }),
        Ok(chunk) => Err(UploadError::InvalidRequest(format!(
            "filename {file_name:?} names part {} but partNumber is {}",
            chunk.part, meta.part_number
        ))),
        Err(ChunkNameError::MissingToken(_)) => Ok(SectionTarget {
            logical: canonical_logical_name(file_name)?,
            part: meta.part_number,
        }),
        Err(e) => Err(UploadError::InvalidRequest(format!(
            "malformed chunk filename {file_name:?}: {e}"
        ))),
    }
}

/// Builds a `multipart/form-data` body with one file section per entry.
///
/// Used by clients that replay chunks from disk.
pub fn form_body(boundary: &str, sections: &[(&str, &[u8])]) -> Vec<u8> {
    let mut body = Vec::new();
    for (file_name, data) in sections {
        body.extend_from_slice(
            format!(
                "--{boundary}\r\n\
                 Content-Disposition: form-data; name=\"file\"; filename=\"{file_name}\"\r\n\
                 Content-Type: application/octet-stream\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(data);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{boundary}--\r\n").as_bytes());
    body
}
