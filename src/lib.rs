//! Network transport and update-delivery engine.
//!
//! This library fetches remote JSON resources and binary artifacts over
//! HTTP(S), with bounded retry and segmented parallel downloads, and drives a
//! multi-stage update pipeline for a host desktop application.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//! - [`transport`] - Single request cycles, retry controller, task executor
//! - [`segmented`] - Byte-range planning, concurrent segments, ordered merge
//! - [`hash`] - Streaming file digests and checksum verification
//! - [`update`] - Maintenance gate, update check, download, verify, handoff
//! - [`config`] - Immutable network configuration and updater settings
//! - [`auth`] - Authentication backends applied to API requests

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod auth;
pub mod config;
pub mod hash;
pub mod segmented;
pub mod transport;
pub mod update;
mod user_agent;

// Re-export commonly used types
pub use auth::{AuthBackend, AuthlibInjectorAuth, OfflineAuth};
pub use config::{AuthMode, ConfigError, EngineConfig, NetworkConfig, ProxySetting, UpdaterSettings};
pub use hash::{HashAlgorithm, HashError, VerifyResult, digest, verify};
pub use segmented::{SegmentPlan, SegmentSpec, SegmentedDownloader, SplitApproach, plan_segments};
pub use transport::{
    AsyncExecutor, ByteRange, DEFAULT_CONCURRENCY, DEFAULT_MAX_ATTEMPTS, ExecutorError,
    HttpTransport, Method, Payload, ProgressSink, RequestOutcome, RequestSpec, RetryController,
    RetryDecision, RetryPolicy, TaskHandle, TokioExecutor, Transport, TransportError,
    execute_async, submit,
};
pub use update::{
    ArchiveExtractor, HostBridge, HostNotice, JsonVersionStore, MaintenanceNotice,
    MaintenanceStatus, NoticeKind, UpdateError, UpdateFileSpec, UpdateManifest,
    UpdateOrchestrator, UpdateOutcome, UpdateState, UpdaterLaunch, VersionStore,
};
