//! Streaming digest and the restart-on-change file hasher (spec 4.1).

use sha2::{Digest, Sha256};
use std::fs::Metadata;
use std::io::Read;
use std::path::Path;
use std::time::UNIX_EPOCH;

use crate::error::{HasherError, HasherResult};

/// Name of the primary digest algorithm. A future version may make this
/// pluggable; today only SHA-256 is wired up, matching spec 4.1's default.
pub const PRIMARY_ALGORITHM: &str = "sha256";

/// Default number of times a `FileHasher` will restart hashing after
/// detecting a mid-read change before giving up.
pub const DEFAULT_MAX_HASH_ATTEMPTS: u32 = 5;

/// A streaming digest, identified by algorithm name.
pub struct StreamingHasher {
    algorithm: &'static str,
    inner: Sha256,
}

impl StreamingHasher {
    /// Create a hasher for the named algorithm.
    pub fn new(algorithm: &str) -> HasherResult<Self> {
        match algorithm {
            "sha256" => Ok(Self {
                algorithm: PRIMARY_ALGORITHM,
                inner: Sha256::new(),
            }),
            other => Err(HasherError::UnsupportedAlgorithm(other.to_string())),
        }
    }

    /// The algorithm name this hasher was constructed with.
    pub fn algorithm(&self) -> &'static str {
        self.algorithm
    }

    /// Feed bytes into the running digest.
    pub fn update(&mut self, bytes: &[u8]) {
        self.inner.update(bytes);
    }

    /// Finalize and return the hex-encoded digest, consuming the hasher.
    pub fn finalize(self) -> String {
        hex::encode(self.inner.finalize())
    }
}

/// The `(size, mtime)` pair used to detect a file changing mid-read.
#[derive(Debug, Clone, Copy, PartialEq)]
struct SizeModified {
    size: u64,
    modified: f64,
}

impl SizeModified {
    fn from_metadata(meta: &Metadata) -> std::io::Result<Self> {
        let modified = meta.modified()?;
        let secs = modified
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        Ok(Self {
            size: meta.len(),
            modified: secs,
        })
    }
}

/// Hashes a file on disk, restarting the digest if the file's `(size,
/// mtime)` changes partway through the read. After `max_attempts` restarts
/// it gives up with `HasherError::FileChangedWhileHashing` (spec 4.1).
pub struct FileHasher {
    max_attempts: u32,
}

impl Default for FileHasher {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_HASH_ATTEMPTS,
        }
    }
}

impl FileHasher {
    /// Create a file hasher with a custom restart budget.
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self { max_attempts }
    }

    /// Hash the file at `path`, returning the hex digest and the final
    /// `(size, mtime)` observed, which the caller should record on the BFI.
    pub fn hash_file(&self, path: &Path) -> HasherResult<(String, u64, f64)> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let file = std::fs::File::open(path)?;
            let before = SizeModified::from_metadata(&file.metadata()?)?;

            let mut hasher = StreamingHasher::new(PRIMARY_ALGORITHM)?;
            let mut reader = std::io::BufReader::with_capacity(256 * 1024, file);
            let mut buf = [0u8; 64 * 1024];
            loop {
                let n = reader.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
            }

            let after = SizeModified::from_metadata(&std::fs::metadata(path)?)?;
            if before != after {
                tracing::warn!(
                    path = %path.display(),
                    attempt,
                    "file changed while hashing, restarting"
                );
                if attempt >= self.max_attempts {
                    return Err(HasherError::FileChangedWhileHashing {
                        path: path.display().to_string(),
                        attempts: attempt,
                    });
                }
                continue;
            }

            return Ok((hasher.finalize(), after.size, after.modified));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn streaming_hasher_matches_sha256_of_empty_input() {
        let hasher = StreamingHasher::new("sha256").unwrap();
        let digest = hasher.finalize();
        assert_eq!(
            digest,
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn rejects_unsupported_algorithm() {
        assert!(StreamingHasher::new("md5").is_err());
    }

    #[test]
    fn hashes_a_stable_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, b"hello world").unwrap();

        let (digest, size, _mtime) = FileHasher::default().hash_file(&path).unwrap();
        assert_eq!(size, 11);
        assert_eq!(digest.len(), 64);

        let (digest2, _, _) = FileHasher::default().hash_file(&path).unwrap();
        assert_eq!(digest, digest2);
    }

    #[test]
    fn different_content_yields_different_digest() {
        let dir = tempfile::tempdir().unwrap();
        let p1 = dir.path().join("a.txt");
        let p2 = dir.path().join("b.txt");
        std::fs::write(&p1, b"content one").unwrap();
        std::fs::write(&p2, b"content two, longer").unwrap();

        let (d1, _, _) = FileHasher::default().hash_file(&p1).unwrap();
        let (d2, _, _) = FileHasher::default().hash_file(&p2).unwrap();
        assert_ne!(d1, d2);
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.txt");
        let mut f = std::fs::File::create(dir.path().join("placeholder")).unwrap();
        writeln!(f, "unused").unwrap();
        let err = FileHasher::default().hash_file(&missing).unwrap_err();
        assert!(matches!(err, HasherError::Io(_)));
    }
}
