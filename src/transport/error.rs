//! Error types for the transport module.
//!
//! Transport operations never surface these to callers directly: a failed
//! request cycle is folded into a [`RequestOutcome`](super::RequestOutcome),
//! with the error's `Display` as the short summary and its source chain as the
//! diagnostic detail. Client construction is the one place they are returned.

use std::error::Error as _;
use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur during a single HTTP request cycle.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Network-level error (DNS resolution, connection refused, TLS errors, etc.)
    #[error("network error requesting {url}: {source}")]
    Network {
        /// The URL that failed.
        url: String,
        /// The underlying network error.
        #[source]
        source: reqwest::Error,
    },

    /// Request timed out before completion.
    #[error("timeout requesting {url}")]
    Timeout {
        /// The URL that timed out.
        url: String,
    },

    /// File system error while reading or writing a target file.
    #[error("IO error on {path}: {source}")]
    Io {
        /// The file path where the error occurred.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The provided URL is malformed or invalid.
    #[error("invalid URL: {url}")]
    InvalidUrl {
        /// The invalid URL string.
        url: String,
    },

    /// A DOWNLOAD request was submitted without a target file.
    #[error("DOWNLOAD request for {url} has no target file")]
    MissingTarget {
        /// The URL of the request.
        url: String,
    },

    /// A header line or header value could not be encoded.
    #[error("invalid header {name:?} for {url}")]
    InvalidHeader {
        /// The URL of the request.
        url: String,
        /// The offending header name.
        name: String,
    },

    /// The explicit proxy URL could not be parsed.
    #[error("invalid proxy {proxy:?}: {source}")]
    InvalidProxy {
        /// The configured proxy value.
        proxy: String,
        /// The underlying reqwest error.
        #[source]
        source: reqwest::Error,
    },

    /// The HTTP client could not be built from the network configuration.
    #[error("failed to build HTTP client: {source}")]
    ClientBuild {
        /// The underlying reqwest error.
        #[source]
        source: reqwest::Error,
    },

    /// The client builder panicked while resolving proxy settings, even with
    /// the environment-proxy fallback.
    #[error("HTTP client builder panicked while resolving proxy settings")]
    ClientBuildPanicked,
}

impl TransportError {
    /// Creates a network error, promoting reqwest timeouts to [`TransportError::Timeout`].
    pub fn network(url: impl Into<String>, source: reqwest::Error) -> Self {
        if source.is_timeout() {
            return Self::Timeout { url: url.into() };
        }
        Self::Network {
            url: url.into(),
            source,
        }
    }

    /// Creates an IO error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Creates an invalid URL error.
    pub fn invalid_url(url: impl Into<String>) -> Self {
        Self::InvalidUrl { url: url.into() }
    }

    /// Creates a missing-target error.
    pub fn missing_target(url: impl Into<String>) -> Self {
        Self::MissingTarget { url: url.into() }
    }

    /// Creates an invalid header error.
    pub fn invalid_header(url: impl Into<String>, name: impl Into<String>) -> Self {
        Self::InvalidHeader {
            url: url.into(),
            name: name.into(),
        }
    }

    /// Short, user-safe classification used as an outcome's error summary.
    #[must_use]
    pub fn summary(&self) -> String {
        match self {
            Self::Network { source, .. } if is_tls_error(source) => "TLS handshake failed".into(),
            Self::Network { source, .. } if source.is_connect() => "connection failed".into(),
            Self::Network { .. } => "network error".into(),
            Self::Timeout { .. } => "request timed out".into(),
            Self::Io { .. } => "local file error".into(),
            Self::InvalidUrl { .. } => "invalid URL".into(),
            Self::MissingTarget { .. } => "missing target file".into(),
            Self::InvalidHeader { .. } => "invalid header".into(),
            Self::InvalidProxy { .. } => "invalid proxy".into(),
            Self::ClientBuild { .. } | Self::ClientBuildPanicked => {
                "HTTP client unavailable".into()
            }
        }
    }

    /// Full diagnostic text including the source chain. Logged, never parsed.
    #[must_use]
    pub fn detail(&self) -> String {
        let mut detail = self.to_string();
        let mut source = self.source();
        while let Some(inner) = source {
            detail.push_str(": ");
            detail.push_str(&inner.to_string());
            source = inner.source();
        }
        detail
    }
}

/// Checks if a reqwest error is a TLS/certificate error.
fn is_tls_error(error: &reqwest::Error) -> bool {
    let mut text = error.to_string().to_lowercase();
    let mut source = error.source();
    while let Some(inner) = source {
        text.push(' ');
        text.push_str(&inner.to_string().to_lowercase());
        source = inner.source();
    }
    text.contains("certificate")
        || text.contains("tls")
        || text.contains("ssl")
        || text.contains("handshake")
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_error_timeout_display() {
        let error = TransportError::Timeout {
            url: "https://example.com/file.bin".into(),
        };
        assert!(error.to_string().contains("timeout"));
        assert!(error.to_string().contains("https://example.com/file.bin"));
        assert_eq!(error.summary(), "request timed out");
    }

    #[test]
    fn test_transport_error_io_detail_includes_source() {
        let io_error = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "access denied");
        let error = TransportError::io(PathBuf::from("/tmp/update.bin"), io_error);
        let detail = error.detail();
        assert!(detail.contains("/tmp/update.bin"), "Expected path in: {detail}");
        assert!(detail.contains("access denied"), "Expected source in: {detail}");
        assert_eq!(error.summary(), "local file error");
    }

    #[test]
    fn test_transport_error_invalid_url_display() {
        let error = TransportError::invalid_url("not-a-url");
        let msg = error.to_string();
        assert!(msg.contains("invalid URL"), "Expected 'invalid URL' in: {msg}");
        assert!(msg.contains("not-a-url"));
    }

    #[test]
    fn test_transport_error_missing_target_summary() {
        let error = TransportError::missing_target("https://example.com/a.zip");
        assert_eq!(error.summary(), "missing target file");
        assert!(error.to_string().contains("no target file"));
    }
}
