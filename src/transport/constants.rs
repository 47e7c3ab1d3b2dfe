//! Constants for the transport module (timeouts, buffers, retry defaults).

use std::time::Duration;

/// Default HTTP connect timeout (30 seconds).
pub const CONNECT_TIMEOUT_SECS: u64 = 30;

/// Default HTTP read timeout (5 minutes for large files).
pub const READ_TIMEOUT_SECS: u64 = 300;

/// Content type sent with POST bodies unless the caller supplies one.
pub const DEFAULT_POST_CONTENT_TYPE: &str = "application/json";

/// Default delay between retry attempts.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Upper bound on response bytes kept in an error detail for non-2xx downloads.
pub const MAX_ERROR_BODY_BYTES: usize = 2048;
