//! Error types for the update pipeline.

use std::path::PathBuf;

use thiserror::Error;

/// Errors surfaced by the update orchestrator.
///
/// Lower layers report failures as values; the orchestrator is the boundary
/// that turns them into this taxonomy.
#[derive(Debug, Error)]
pub enum UpdateError {
    /// An API call or file download did not succeed.
    #[error("{stage} failed: {summary}")]
    Network {
        /// Pipeline stage or file being fetched.
        stage: String,
        /// HTTP status, 0 when no response was received.
        status: u16,
        /// Short failure summary from the transport.
        summary: String,
    },

    /// A response body or manifest is malformed.
    #[error("malformed {what}: {reason}")]
    Parse {
        /// What was being parsed.
        what: &'static str,
        /// Why it was rejected.
        reason: String,
    },

    /// Local file operation failed.
    #[error("file error on {path}: {source}")]
    File {
        /// The path involved.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// A downloaded file did not match its checksum or could not be hashed.
    #[error("checksum verification failed for {file}: {reason}")]
    HashMismatch {
        /// Manifest file name.
        file: String,
        /// Expected/actual digests or why hashing was impossible.
        reason: String,
    },

    /// The caller passed an unusable argument.
    #[error("invalid argument: {0}")]
    Argument(String),

    /// The update was cancelled through [`UpdateOrchestrator::cancel`](super::UpdateOrchestrator::cancel).
    #[error("update cancelled")]
    Cancelled,
}

impl UpdateError {
    /// Creates a network error for a stage.
    pub fn network(stage: impl Into<String>, status: u16, summary: impl Into<String>) -> Self {
        Self::Network {
            stage: stage.into(),
            status,
            summary: summary.into(),
        }
    }

    /// Creates a parse error.
    pub fn parse(what: &'static str, reason: impl Into<String>) -> Self {
        Self::Parse {
            what,
            reason: reason.into(),
        }
    }

    /// Creates a file error.
    pub fn file(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::File {
            path: path.into(),
            source,
        }
    }

    /// Whether retrying the whole pipeline later may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network { .. })
    }
}
