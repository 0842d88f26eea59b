use sha2::{Digest, Sha256};

/// Running SHA-256 of a merged file, fed while chunks are copied.
///
/// A chunk copy works on a clone taken at the chunk boundary and is only
/// committed once the copy succeeds, so a retried chunk is hashed once.
#[derive(Clone, Default)]
pub struct MergeDigest {
    hasher: Sha256,
    bytes: u64,
}

impl MergeDigest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
        self.bytes += data.len() as u64;
    }

    /// Bytes hashed so far.
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Hex-encoded digest.
    pub fn finish(self) -> String {
        hex::encode(self.hasher.finalize())
    }
}

/// Hex SHA-256 of `data`, for comparing against a merge report.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut digest = MergeDigest::new();
    digest.update(data);
    digest.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_value() {
        assert_eq!(
            sha256_hex(b"Hello, World"),
            "03675ac53ff9cd1535ccc7dfcdfa2c458c5218371f418dc136f2d19ac1fbe8a5"
        );
    }

    #[test]
    fn pieces_hash_like_the_whole() {
        let mut digest = MergeDigest::new();
        digest.update(b"Hello, ");
        digest.update(b"World");
        assert_eq!(digest.bytes(), 12);
        assert_eq!(digest.finish(), sha256_hex(b"Hello, World"));
    }

    #[test]
    fn abandoned_clone_leaves_checkpoint_untouched() {
        let mut committed = MergeDigest::new();
        committed.update(b"Hello, ");

        let mut failed_attempt = committed.clone();
        failed_attempt.update(b"Wor");
        drop(failed_attempt);

        let mut retry = committed.clone();
        retry.update(b"World");
        committed = retry;

        assert_eq!(committed.finish(), sha256_hex(b"Hello, World"));
    }
}
