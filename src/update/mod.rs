//! Update delivery: maintenance gate, update check, parallel download and
//! verification, then version persistence and external-updater handoff.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use netupdate_core::{
//!     EngineConfig, HostBridge, HttpTransport, TokioExecutor, UpdateOrchestrator, UpdateOutcome,
//! };
//!
//! # async fn example(host: Arc<dyn HostBridge>) -> Result<(), Box<dyn std::error::Error>> {
//! let config = EngineConfig::load(std::path::Path::new("netupdate.json"))?;
//! let executor = Arc::new(TokioExecutor::current(config.updater.concurrency)?);
//! let transport = Arc::new(HttpTransport::new(&config.network, executor)?);
//! let orchestrator =
//!     UpdateOrchestrator::new(&config.network, config.updater.clone(), transport, host)?;
//!
//! match orchestrator.run().await {
//!     UpdateOutcome::Completed => println!("up to date"),
//!     other => println!("{other:?}"),
//! }
//! # Ok(())
//! # }
//! ```

mod error;
mod host;
mod manifest;
mod orchestrator;

pub use error::UpdateError;
pub use host::{
    ArchiveExtractor, HostBridge, HostNotice, JsonVersionStore, NoticeKind, UpdaterLaunch,
    VersionStore,
};
pub use manifest::{
    MaintenanceNotice, MaintenanceStatus, UpdateFileSpec, UpdateManifest, request_envelope,
};
pub use orchestrator::{UpdateOrchestrator, UpdateOutcome, UpdateState};
