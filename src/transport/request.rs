//! Request and outcome value types shared by every transport layer.
//!
//! A [`RequestSpec`] is built once through its consuming builder methods and is
//! then treated as immutable: executors borrow it or clone it into tasks, and
//! retries re-submit the same value. Each submission yields exactly one
//! [`RequestOutcome`].

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use tracing::warn;

/// HTTP verbs understood by the transport.
///
/// `Download` is a GET whose body is streamed into the request's target file
/// instead of being collected in memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    /// Collect the response body in memory.
    Get,
    /// Headers only.
    Head,
    /// Send the request body verbatim.
    Post,
    /// Stream the response body into the target file.
    Download,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Get => "GET",
            Self::Head => "HEAD",
            Self::Post => "POST",
            Self::Download => "DOWNLOAD",
        };
        f.write_str(name)
    }
}

/// Inclusive byte range of a remote resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    /// First byte offset.
    pub start: u64,
    /// Last byte offset (inclusive), or open-ended when `None`.
    pub end: Option<u64>,
}

impl ByteRange {
    /// Creates a closed range `start..=end`.
    #[must_use]
    pub fn new(start: u64, end: u64) -> Self {
        Self {
            start,
            end: Some(end),
        }
    }

    /// Creates an open-ended range starting at `start`.
    #[must_use]
    pub fn from_offset(start: u64) -> Self {
        Self { start, end: None }
    }

    /// Number of bytes covered by a closed range.
    #[must_use]
    pub fn len(&self) -> Option<u64> {
        self.end.map(|end| end.saturating_sub(self.start) + 1)
    }

    /// Whether `already_have` bytes cover the whole closed range.
    #[must_use]
    pub fn is_satisfied_by(&self, already_have: u64) -> bool {
        self.len().is_some_and(|len| already_have >= len)
    }

    /// Renders the `Range` header value after skipping `already_have` bytes.
    #[must_use]
    pub fn header_value(&self, already_have: u64) -> String {
        let start = self.start.saturating_add(already_have);
        match self.end {
            Some(end) => format!("bytes={start}-{end}"),
            None => format!("bytes={start}-"),
        }
    }
}

/// Callback receiving the cumulative number of bytes received for a request.
#[derive(Clone)]
pub struct ProgressSink(Arc<dyn Fn(u64) + Send + Sync>);

impl ProgressSink {
    /// Wraps a progress callback.
    pub fn new(callback: impl Fn(u64) + Send + Sync + 'static) -> Self {
        Self(Arc::new(callback))
    }

    /// Reports the cumulative byte count.
    pub fn report(&self, cumulative_bytes: u64) {
        (self.0)(cumulative_bytes);
    }
}

impl fmt::Debug for ProgressSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ProgressSink(..)")
    }
}

/// Generates a short random id used to correlate log lines of one request.
#[must_use]
pub fn new_correlation_id() -> String {
    format!("{:016x}", rand::random::<u64>())
}

/// Description of one HTTP request cycle.
#[derive(Debug, Clone)]
pub struct RequestSpec {
    url: String,
    method: Method,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
    target_file: Option<PathBuf>,
    byte_range: Option<ByteRange>,
    resumable: bool,
    progress_sink: Option<ProgressSink>,
    correlation_id: String,
}

impl RequestSpec {
    fn with_method(url: impl Into<String>, method: Method) -> Self {
        Self {
            url: url.into(),
            method,
            headers: Vec::new(),
            body: Vec::new(),
            target_file: None,
            byte_range: None,
            resumable: false,
            progress_sink: None,
            correlation_id: new_correlation_id(),
        }
    }

    /// GET collected into memory.
    pub fn get(url: impl Into<String>) -> Self {
        Self::with_method(url, Method::Get)
    }

    /// HEAD, headers only.
    pub fn head(url: impl Into<String>) -> Self {
        Self::with_method(url, Method::Head)
    }

    /// POST with a verbatim body.
    pub fn post(url: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        let mut spec = Self::with_method(url, Method::Post);
        spec.body = body.into();
        spec
    }

    /// DOWNLOAD streamed into `target_file`.
    pub fn download(url: impl Into<String>, target_file: impl Into<PathBuf>) -> Self {
        let mut spec = Self::with_method(url, Method::Download);
        spec.target_file = Some(target_file.into());
        spec
    }

    /// Adds a header.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Adds a free-form `"Name: value"` header line. Lines without a colon are dropped.
    #[must_use]
    pub fn header_line(self, line: &str) -> Self {
        match line.split_once(':') {
            Some((name, value)) if !name.trim().is_empty() => {
                self.header(name.trim(), value.trim())
            }
            _ => {
                warn!(line, "ignoring malformed header line");
                self
            }
        }
    }

    /// Sets the file a DOWNLOAD streams into.
    #[must_use]
    pub fn target_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.target_file = Some(path.into());
        self
    }

    /// Restricts the request to a byte range.
    #[must_use]
    pub fn byte_range(mut self, range: ByteRange) -> Self {
        self.byte_range = Some(range);
        self
    }

    /// Resume from an existing partial target file.
    #[must_use]
    pub fn resumable(mut self, resumable: bool) -> Self {
        self.resumable = resumable;
        self
    }

    /// Receives cumulative byte counts while the body streams.
    #[must_use]
    pub fn progress_sink(mut self, sink: ProgressSink) -> Self {
        self.progress_sink = Some(sink);
        self
    }

    /// Overrides the generated correlation id.
    #[must_use]
    pub fn correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = id.into();
        self
    }

    /// Request URL.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Request method.
    #[must_use]
    pub fn method(&self) -> Method {
        self.method
    }

    /// Request headers in insertion order.
    #[must_use]
    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    /// Case-insensitive header lookup.
    #[must_use]
    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Request body (POST only).
    #[must_use]
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// DOWNLOAD target.
    #[must_use]
    pub fn target(&self) -> Option<&Path> {
        self.target_file.as_deref()
    }

    /// Requested byte range.
    #[must_use]
    pub fn range(&self) -> Option<ByteRange> {
        self.byte_range
    }

    /// Whether a partial target file is resumed.
    #[must_use]
    pub fn is_resumable(&self) -> bool {
        self.resumable
    }

    /// Progress callback, if any.
    #[must_use]
    pub fn sink(&self) -> Option<&ProgressSink> {
        self.progress_sink.as_ref()
    }

    /// Correlation id for logs.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.correlation_id
    }
}

/// Result of one submitted request.
///
/// `succeeded` is true only when no transport error occurred and the status
/// is in `200..299`. Retry layers build new outcomes rather than mutating
/// the ones they received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestOutcome<T> {
    /// HTTP status, or 0 when no response was received.
    pub status_code: u16,
    /// Whether the request cycle is considered successful.
    pub succeeded: bool,
    /// Response body converted to the caller's payload type.
    pub payload: T,
    /// Short classification of the failure, empty on success.
    pub error_summary: String,
    /// Diagnostic text for logs only.
    pub error_detail: String,
    /// `Content-Length` header of the response, when present.
    pub content_length: Option<u64>,
    /// Body bytes received by this cycle.
    pub bytes_transferred: u64,
    /// Correlation id copied from the request.
    pub correlation_id: String,
}

impl<T> RequestOutcome<T> {
    /// Whether a status code counts as generic success.
    #[must_use]
    pub fn is_success_status(status_code: u16) -> bool {
        (200..299).contains(&status_code)
    }

    /// Converts the payload, keeping every other field.
    pub fn map_payload<U>(self, convert: impl FnOnce(T) -> U) -> RequestOutcome<U> {
        RequestOutcome {
            status_code: self.status_code,
            succeeded: self.succeeded,
            payload: convert(self.payload),
            error_summary: self.error_summary,
            error_detail: self.error_detail,
            content_length: self.content_length,
            bytes_transferred: self.bytes_transferred,
            correlation_id: self.correlation_id,
        }
    }
}

impl<T: Default> RequestOutcome<T> {
    /// Outcome for a request that failed before a response was received.
    pub fn transport_failure(
        correlation_id: impl Into<String>,
        summary: impl Into<String>,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            status_code: 0,
            succeeded: false,
            payload: T::default(),
            error_summary: summary.into(),
            error_detail: detail.into(),
            content_length: None,
            bytes_transferred: 0,
            correlation_id: correlation_id.into(),
        }
    }
}

impl RequestOutcome<Vec<u8>> {
    /// Converts the raw body into the caller's payload type.
    #[must_use]
    pub fn into_payload<T: Payload>(self) -> RequestOutcome<T> {
        self.map_payload(T::from_body)
    }
}

impl RequestOutcome<String> {
    /// Deserializes the body as JSON.
    ///
    /// # Errors
    ///
    /// Returns the serde error when the body is not valid JSON for `D`.
    pub fn json<D: DeserializeOwned>(&self) -> Result<D, serde_json::Error> {
        serde_json::from_str(&self.payload)
    }
}

/// Payload types a response body can be converted into.
pub trait Payload: Default + Send + 'static {
    /// Builds the payload from the raw body bytes.
    fn from_body(body: Vec<u8>) -> Self;
}

impl Payload for Vec<u8> {
    fn from_body(body: Vec<u8>) -> Self {
        body
    }
}

impl Payload for String {
    fn from_body(body: Vec<u8>) -> Self {
        String::from_utf8(body)
            .unwrap_or_else(|error| String::from_utf8_lossy(error.as_bytes()).into_owned())
    }
}

impl Payload for () {
    fn from_body(_body: Vec<u8>) -> Self {}
}
