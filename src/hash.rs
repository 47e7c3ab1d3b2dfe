//! Streaming file digests and checksum verification.
//!
//! Files are read through a fixed 1 MiB buffer so large artifacts never sit in
//! memory. A checksum whose algorithm is unknown cannot be verified and is
//! treated as a failed verification.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use md5::Md5;
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha512};
use thiserror::Error;
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tracing::{debug, instrument, warn};

const HASH_BUFFER_SIZE: usize = 1024 * 1024;

/// Errors raised while computing a digest.
#[derive(Debug, Error)]
pub enum HashError {
    /// The algorithm name is not supported.
    #[error("unsupported hash algorithm '{name}'")]
    UnsupportedAlgorithm {
        /// The name as given.
        name: String,
    },

    /// The file could not be read.
    #[error("cannot read {path}: {source}")]
    Io {
        /// File being hashed.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },
}

/// Supported digest algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HashAlgorithm {
    /// MD5 (legacy manifests).
    Md5,
    /// SHA-1.
    Sha1,
    /// SHA-256.
    Sha256,
    /// SHA-512.
    Sha512,
}

impl FromStr for HashAlgorithm {
    type Err = HashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .trim()
            .chars()
            .filter(|c| *c != '-' && *c != '_')
            .collect::<String>()
            .to_ascii_lowercase();
        match normalized.as_str() {
            "md5" => Ok(Self::Md5),
            "sha1" => Ok(Self::Sha1),
            "sha256" => Ok(Self::Sha256),
            "sha512" => Ok(Self::Sha512),
            _ => Err(HashError::UnsupportedAlgorithm { name: s.to_string() }),
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Md5 => "md5",
            Self::Sha1 => "sha1",
            Self::Sha256 => "sha256",
            Self::Sha512 => "sha512",
        };
        f.write_str(name)
    }
}

/// Outcome of a checksum comparison.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyResult {
    /// Digest matches the expected checksum.
    Verified,
    /// Digest differs.
    Mismatch {
        /// Expected checksum (lowercase).
        expected: String,
        /// Computed checksum.
        actual: String,
    },
    /// The file could not be hashed; counts as a failure.
    Unverifiable {
        /// Why hashing was impossible.
        reason: String,
    },
}

impl VerifyResult {
    /// Whether the file passed verification.
    #[must_use]
    pub fn is_verified(&self) -> bool {
        matches!(self, Self::Verified)
    }
}

/// Computes the lowercase hex digest of a file.
///
/// # Errors
///
/// Returns [`HashError::UnsupportedAlgorithm`] for unknown names and
/// [`HashError::Io`] when the file cannot be read.
pub async fn digest(path: &Path, algorithm: &str) -> Result<String, HashError> {
    let algorithm: HashAlgorithm = algorithm.parse()?;
    digest_with(path, algorithm).await
}

/// Computes the digest for an already parsed algorithm.
///
/// # Errors
///
/// Returns [`HashError::Io`] when the file cannot be read.
pub async fn digest_with(path: &Path, algorithm: HashAlgorithm) -> Result<String, HashError> {
    match algorithm {
        HashAlgorithm::Md5 => stream_digest::<Md5>(path).await,
        HashAlgorithm::Sha1 => stream_digest::<Sha1>(path).await,
        HashAlgorithm::Sha256 => stream_digest::<Sha256>(path).await,
        HashAlgorithm::Sha512 => stream_digest::<Sha512>(path).await,
    }
}

async fn stream_digest<D: Digest>(path: &Path) -> Result<String, HashError> {
    let io_error = |source| HashError::Io {
        path: path.to_path_buf(),
        source,
    };
    let mut file = File::open(path).await.map_err(io_error)?;
    let mut hasher = D::new();
    let mut buffer = vec![0u8; HASH_BUFFER_SIZE];

    loop {
        let read = file.read(&mut buffer).await.map_err(io_error)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    Ok(to_hex(hasher.finalize().as_slice()))
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut out, b| {
        out.push_str(&format!("{b:02x}"));
        out
    })
}

/// Compares a file's digest with `expected` (case-insensitive).
///
/// Never deletes the file.
#[instrument(skip(path, expected), fields(path = %path.display()))]
pub async fn verify(path: &Path, expected: &str, algorithm: &str) -> VerifyResult {
    let actual = match digest(path, algorithm).await {
        Ok(actual) => actual,
        Err(error) => {
            warn!(%error, "checksum cannot be verified");
            return VerifyResult::Unverifiable {
                reason: error.to_string(),
            };
        }
    };

    let expected = expected.trim().to_ascii_lowercase();
    if actual == expected {
        debug!(%algorithm, "checksum verified");
        VerifyResult::Verified
    } else {
        warn!(%algorithm, %expected, %actual, "checksum mismatch");
        VerifyResult::Mismatch { expected, actual }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const ABC_MD5: &str = "900150983cd24fb0d6963f7d28e17f72";
    const ABC_SHA1: &str = "a9993e364706816aba3e25717850c26c9cd0d89d";
    const ABC_SHA256: &str = "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";

    fn write_abc(temp: &TempDir) -> PathBuf {
        let path = temp.path().join("abc.txt");
        std::fs::write(&path, b"abc").unwrap();
        path
    }

    #[tokio::test]
    async fn test_known_digests() {
        let temp = TempDir::new().unwrap();
        let path = write_abc(&temp);
        assert_eq!(digest(&path, "md5").await.unwrap(), ABC_MD5);
        assert_eq!(digest(&path, "SHA1").await.unwrap(), ABC_SHA1);
        assert_eq!(digest(&path, "sha-256").await.unwrap(), ABC_SHA256);
        assert_eq!(digest(&path, "sha512").await.unwrap().len(), 128);
    }

    #[tokio::test]
    async fn test_digest_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("big.bin");
        let content: Vec<u8> = (0..3 * HASH_BUFFER_SIZE + 7).map(|i| (i % 253) as u8).collect();
        std::fs::write(&path, &content).unwrap();

        let first = digest(&path, "sha256").await.unwrap();
        let second = digest(&path, "sha256").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first, format!("{:x}", Sha256::digest(&content)));
    }

    #[tokio::test]
    async fn test_verify_is_case_insensitive() {
        let temp = TempDir::new().unwrap();
        let path = write_abc(&temp);
        let result = verify(&path, &ABC_MD5.to_uppercase(), "MD5").await;
        assert!(result.is_verified());
    }

    #[tokio::test]
    async fn test_verify_mismatch_keeps_file() {
        let temp = TempDir::new().unwrap();
        let path = write_abc(&temp);
        let result = verify(&path, "deadbeef", "md5").await;
        assert_eq!(
            result,
            VerifyResult::Mismatch {
                expected: "deadbeef".into(),
                actual: ABC_MD5.into()
            }
        );
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_unknown_algorithm_fails_verification() {
        let temp = TempDir::new().unwrap();
        let path = write_abc(&temp);
        let result = verify(&path, ABC_MD5, "crc32").await;
        assert!(matches!(result, VerifyResult::Unverifiable { .. }));
        assert!(!result.is_verified());
    }

    #[test]
    fn test_to_hex_pads_every_byte() {
        assert_eq!(to_hex(&[0x00, 0x0f, 0xa0, 0xff]), "000fa0ff");
        assert_eq!(to_hex(&[]), "");
    }

    #[tokio::test]
    async fn test_missing_file_is_unverifiable() {
        let result = verify(Path::new("/nonexistent/file"), ABC_MD5, "md5").await;
        assert!(matches!(result, VerifyResult::Unverifiable { .. }));
    }
}
