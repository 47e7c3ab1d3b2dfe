//! HTTP transport: single request cycles, bounded retry and task submission.
//!
//! This module provides the building blocks every higher layer uses to talk
//! to the network.
//!
//! # Features
//!
//! - GET/HEAD/POST collected in memory, DOWNLOAD streamed to disk
//! - Byte ranges and resume from a partial target file
//! - Explicit, system or direct proxy; optional local CA bundle
//! - Configurable timeouts (30s connect, 5min read by default)
//! - Failures reported as values, never as errors or panics
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use netupdate_core::{HttpTransport, NetworkConfig, RequestSpec, TokioExecutor};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = NetworkConfig::new("https://api.example.com/");
//! let executor = Arc::new(TokioExecutor::current(8)?);
//! let transport = HttpTransport::new(&config, executor)?;
//! let outcome = transport
//!     .execute::<String>(&RequestSpec::get("https://example.com/status.json"))
//!     .await;
//! println!("{} {}", outcome.status_code, outcome.payload);
//! # Ok(())
//! # }
//! ```

mod client;
mod constants;
mod error;
mod executor;
mod request;
mod retry;

pub use client::{HttpTransport, Transport, execute_async};
pub use constants::{CONNECT_TIMEOUT_SECS, READ_TIMEOUT_SECS};
pub use error::TransportError;
pub use executor::{
    AsyncExecutor, DEFAULT_CONCURRENCY, ExecutorError, TaskHandle, TokioExecutor, submit,
};
pub use request::{
    ByteRange, Method, Payload, ProgressSink, RequestOutcome, RequestSpec, new_correlation_id,
};
pub use retry::{DEFAULT_MAX_ATTEMPTS, RetryController, RetryDecision, RetryPolicy};
