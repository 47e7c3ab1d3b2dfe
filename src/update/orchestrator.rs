//! Update pipeline state machine.
//!
//! ```text
//! Idle -> CheckingMaintenance -> MaintenanceActive
//!                             -> CheckingUpdate -> NoUpdate
//!                                               -> ParsingManifest -> ParseFailed
//!                                                                  -> DownloadingFiles
//! DownloadingFiles <-> VerifyingHashes (per file) -> DownloadFailed | VerifyFailed
//!                                                 -> Finalizing -> AwaitingExternalUpdater | Completed
//! ```
//!
//! Network failures in the two check stages move to `CheckFailed`.

use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde_json::{Map, Value, json};
use tracing::{debug, info, instrument, warn};
use url::Url;

use super::error::UpdateError;
use super::host::{
    ArchiveExtractor, HostBridge, HostNotice, JsonVersionStore, NoticeKind, UpdaterLaunch,
    VersionStore,
};
use super::manifest::{MaintenanceNotice, UpdateFileSpec, UpdateManifest, request_envelope};
use crate::auth::AuthBackend;
use crate::config::{NetworkConfig, UpdaterSettings};
use crate::hash::{self, VerifyResult};
use crate::segmented::{SegmentedDownloader, SplitApproach};
use crate::transport::{
    AsyncExecutor, RequestOutcome, RequestSpec, RetryController, RetryPolicy, TaskHandle,
    TokioExecutor, Transport, submit,
};

const MAINTENANCE_ENDPOINT: &str = "maintenance";
const UPDATE_ENDPOINT: &str = "update";

/// Suffix of non-core files until the whole update succeeded.
const STAGED_SUFFIX: &str = ".part";

/// Observable pipeline state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateState {
    /// Nothing started yet.
    Idle,
    /// Querying the maintenance endpoint.
    CheckingMaintenance,
    /// Maintenance announced; pipeline halted.
    MaintenanceActive,
    /// Querying the update endpoint.
    CheckingUpdate,
    /// A check stage could not reach the server.
    CheckFailed,
    /// The server has nothing newer.
    NoUpdate,
    /// Reading the update manifest.
    ParsingManifest,
    /// The manifest was rejected.
    ParseFailed,
    /// File downloads are running.
    DownloadingFiles,
    /// A download failed; staged files were removed.
    DownloadFailed,
    /// A downloaded file is being hashed.
    VerifyingHashes,
    /// A checksum did not match; staged files were removed.
    VerifyFailed,
    /// Persisting the version, extracting archives, preparing the handoff.
    Finalizing,
    /// Core files are staged and the external updater was launched.
    AwaitingExternalUpdater,
    /// Update fully applied in place.
    Completed,
}

impl fmt::Display for UpdateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Terminal result of [`UpdateOrchestrator::run`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// Files applied in place; nothing left to do.
    Completed,
    /// The server reported no newer release.
    NoUpdateAvailable,
    /// The pipeline failed and retrying now will not help.
    Failed(String),
    /// A check stage hit a network failure; try again later.
    RetryRequired(String),
    /// Maintenance is announced; the notice was published.
    MaintenanceActive(MaintenanceNotice),
    /// Core files are staged and the host was asked to run the updater.
    AwaitingExternalUpdater(UpdaterLaunch),
}

/// A manifest file with its resolved URL and local paths.
#[derive(Debug, Clone)]
struct StagedFile {
    file: UpdateFileSpec,
    url: String,
    /// Where the download lands.
    staged: PathBuf,
    /// Final location for non-core files; `None` for core files left to the updater.
    destination: Option<PathBuf>,
}

/// Drives maintenance check, update check, download, verification and handoff.
#[derive(Debug)]
pub struct UpdateOrchestrator {
    api_root: Url,
    file_root: Url,
    preferences: Map<String, Value>,
    auth: Arc<dyn AuthBackend>,
    settings: UpdaterSettings,
    retry: RetryController,
    segmented: SegmentedDownloader,
    executor: Arc<dyn AsyncExecutor>,
    host: Arc<dyn HostBridge>,
    version_store: Arc<dyn VersionStore>,
    extractor: Option<Arc<dyn ArchiveExtractor>>,
    state: Arc<Mutex<UpdateState>>,
    cancelled: Arc<AtomicBool>,
}

impl UpdateOrchestrator {
    /// Creates an orchestrator.
    ///
    /// File tasks run on their own executor (bounded by
    /// `settings.concurrency`) so they never compete with the segment
    /// requests they wait on. The version store defaults to the client
    /// configuration file named in `settings`.
    ///
    /// # Errors
    ///
    /// Returns [`UpdateError::Argument`] for an unusable API root or when no
    /// Tokio runtime is running.
    pub fn new(
        network: &NetworkConfig,
        settings: UpdaterSettings,
        transport: Arc<dyn Transport>,
        host: Arc<dyn HostBridge>,
    ) -> Result<Self, UpdateError> {
        let api_root = base_url("api_root", &network.api_root)?;
        let file_root = base_url("file_root", network.effective_file_root())?;
        let executor = TokioExecutor::current(settings.concurrency)
            .map_err(|e| UpdateError::Argument(e.to_string()))?;

        let auth = network.auth.backend();
        let mut preferences = network.preferences.clone();
        auth.extend_preferences(&mut preferences);

        let version_store = Arc::new(JsonVersionStore::new(&settings.client_config_path));
        debug!(api_root = %api_root, auth = auth.name(), "update orchestrator ready");

        Ok(Self {
            api_root,
            file_root,
            preferences,
            auth,
            settings,
            retry: RetryController::new(Arc::clone(&transport)),
            segmented: SegmentedDownloader::new(transport),
            executor: Arc::new(executor),
            host,
            version_store,
            extractor: None,
            state: Arc::new(Mutex::new(UpdateState::Idle)),
            cancelled: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Replaces the executor used for per-file tasks.
    #[must_use]
    pub fn with_executor(mut self, executor: Arc<dyn AsyncExecutor>) -> Self {
        self.executor = executor;
        self
    }

    /// Replaces the version store.
    #[must_use]
    pub fn with_version_store(mut self, store: Arc<dyn VersionStore>) -> Self {
        self.version_store = store;
        self
    }

    /// Sets the extractor applied to `.zip` files.
    #[must_use]
    pub fn with_extractor(mut self, extractor: Arc<dyn ArchiveExtractor>) -> Self {
        self.extractor = Some(extractor);
        self
    }

    /// Current pipeline state.
    #[must_use]
    pub fn state(&self) -> UpdateState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stops file tasks that have not started yet. In-flight transfers finish.
    pub fn cancel(&self) {
        info!("update cancellation requested");
        self.cancelled.store(true, Ordering::SeqCst);
    }

    fn transition(&self, next: UpdateState) {
        transition(&self.state, next);
    }

    fn api_policy(&self) -> RetryPolicy {
        RetryPolicy::default()
            .with_max_attempts(self.settings.max_attempts)
            .with_delay(Duration::from_millis(self.settings.retry_delay_ms))
            .accepting([200, 204])
    }

    fn download_policy(&self) -> RetryPolicy {
        self.api_policy().accepting([200])
    }

    async fn api_call(
        &self,
        stage: &str,
        endpoint: &str,
        request_name: &str,
        body: Value,
    ) -> Result<RequestOutcome<String>, UpdateError> {
        let url = self
            .api_root
            .join(endpoint)
            .map_err(|e| UpdateError::Argument(format!("cannot build {endpoint} URL: {e}")))?;
        let envelope = request_envelope(request_name, body, &self.preferences);
        let spec = self
            .auth
            .authorize(RequestSpec::post(url.as_str(), envelope.to_string()));

        let outcome: RequestOutcome<String> =
            self.retry.execute_with_retry(&spec, &self.api_policy()).await;
        if !outcome.succeeded {
            return Err(UpdateError::network(
                stage,
                outcome.status_code,
                outcome.error_summary,
            ));
        }
        Ok(outcome)
    }

    /// Queries the maintenance endpoint.
    ///
    /// A 204 means no maintenance. A notice is published to the host, and an
    /// `inProgress` notice also asks the host to quit.
    ///
    /// # Errors
    ///
    /// Returns [`UpdateError::Network`] when the endpoint cannot be reached and
    /// [`UpdateError::Parse`] for a malformed notice.
    #[instrument(skip(self))]
    pub async fn check_maintenance(&self) -> Result<Option<MaintenanceNotice>, UpdateError> {
        self.transition(UpdateState::CheckingMaintenance);
        let outcome = self
            .api_call("maintenance check", MAINTENANCE_ENDPOINT, "maintenance", json!({}))
            .await
            .inspect_err(|_| self.transition(UpdateState::CheckFailed))?;

        if outcome.status_code == 204 {
            debug!("no maintenance scheduled");
            return Ok(None);
        }

        let notice = MaintenanceNotice::from_json(&outcome.payload)
            .inspect_err(|_| self.transition(UpdateState::CheckFailed))?;
        self.transition(UpdateState::MaintenanceActive);
        info!(title = %notice.title, status = ?notice.status, "maintenance active");

        self.host.publish_notice(&HostNotice::new(
            NoticeKind::Maintenance,
            notice.title.clone(),
            notice.description.clone(),
        ));
        if notice.requires_quit() {
            self.host.request_quit_after_acknowledgement();
        }
        Ok(Some(notice))
    }

    /// Queries the update endpoint with the installed resource version.
    ///
    /// # Errors
    ///
    /// Returns [`UpdateError::Network`] when the endpoint cannot be reached and
    /// [`UpdateError::Parse`] for a malformed manifest.
    #[instrument(skip(self))]
    pub async fn check_update(&self) -> Result<Option<UpdateManifest>, UpdateError> {
        self.transition(UpdateState::CheckingUpdate);
        let body = json!({ "resourceVersion": self.version_store.resource_version() });
        let outcome = self
            .api_call("update check", UPDATE_ENDPOINT, "update", body)
            .await
            .inspect_err(|_| self.transition(UpdateState::CheckFailed))?;

        if outcome.status_code == 204 {
            self.transition(UpdateState::NoUpdate);
            return Ok(None);
        }

        self.transition(UpdateState::ParsingManifest);
        let manifest = UpdateManifest::from_json(&outcome.payload)
            .inspect_err(|_| self.transition(UpdateState::ParseFailed))?;
        info!(
            version = %manifest.resource_version,
            files = manifest.files.len(),
            mandatory = manifest.is_mandatory,
            "update available"
        );
        Ok(Some(manifest))
    }

    /// Downloads, verifies and applies `manifest`.
    ///
    /// Returns the updater launch when core files were handed off. A failure
    /// is published to the host as an error notice before it is returned.
    ///
    /// # Errors
    ///
    /// Returns the first observed file failure after every in-flight task
    /// finished; staged files are removed and nothing is applied.
    #[instrument(skip(self, manifest), fields(version = %manifest.resource_version, files = manifest.files.len()))]
    pub async fn update(
        &self,
        manifest: &UpdateManifest,
    ) -> Result<Option<UpdaterLaunch>, UpdateError> {
        self.apply(manifest)
            .await
            .inspect_err(|error| self.publish_failure(error))
    }

    async fn apply(&self, manifest: &UpdateManifest) -> Result<Option<UpdaterLaunch>, UpdateError> {
        if manifest.files.is_empty() {
            return Err(UpdateError::Argument("update manifest has no files".into()));
        }
        if self.cancelled.load(Ordering::SeqCst) {
            return Err(UpdateError::Cancelled);
        }

        let jobs = self.stage_files(manifest)?;
        self.transition(UpdateState::DownloadingFiles);

        let context = Arc::new(FileTaskContext {
            retry: self.retry.clone(),
            segmented: self.segmented.clone(),
            policy: self.download_policy(),
            stop: AtomicBool::new(false),
            cancelled: Arc::clone(&self.cancelled),
            failure: Mutex::new(None),
            state: Arc::clone(&self.state),
        });

        let handles: Vec<TaskHandle<bool>> = jobs
            .iter()
            .cloned()
            .map(|job| {
                let context = Arc::clone(&context);
                submit(self.executor.as_ref(), async move { context.run(job).await })
            })
            .collect();

        let mut applied = 0usize;
        for handle in handles {
            match handle.await {
                Ok(true) => applied += 1,
                Ok(false) => {}
                Err(error) => context.record_failure(UpdateError::network(
                    "file task",
                    0,
                    error.to_string(),
                )),
            }
        }
        debug!(applied, total = jobs.len(), "file tasks drained");

        let failure = context.take_failure().or_else(|| {
            self.cancelled
                .load(Ordering::SeqCst)
                .then_some(UpdateError::Cancelled)
        });
        if let Some(error) = failure {
            discard(&jobs).await;
            self.transition(if matches!(error, UpdateError::HashMismatch { .. }) {
                UpdateState::VerifyFailed
            } else {
                UpdateState::DownloadFailed
            });
            return Err(error);
        }

        if let Err(error) = promote(&jobs).await {
            discard(&jobs).await;
            self.transition(UpdateState::DownloadFailed);
            return Err(error);
        }

        self.transition(UpdateState::Finalizing);
        self.finalize(manifest, &jobs).await
    }

    /// Runs the whole pipeline, reporting every terminal state as a value.
    #[instrument(skip(self))]
    pub async fn run(&self) -> UpdateOutcome {
        match self.check_maintenance().await {
            Ok(Some(notice)) => return UpdateOutcome::MaintenanceActive(notice),
            Ok(None) => {}
            Err(error) => return self.check_failed(&error),
        }

        let manifest = match self.check_update().await {
            Ok(Some(manifest)) => manifest,
            Ok(None) => {
                info!("no update available");
                return UpdateOutcome::NoUpdateAvailable;
            }
            Err(error) => return self.check_failed(&error),
        };

        match self.update(&manifest).await {
            Ok(Some(launch)) => UpdateOutcome::AwaitingExternalUpdater(launch),
            Ok(None) => UpdateOutcome::Completed,
            Err(error) => UpdateOutcome::Failed(error.to_string()),
        }
    }

    fn check_failed(&self, error: &UpdateError) -> UpdateOutcome {
        self.publish_failure(error);
        if error.is_retryable() {
            UpdateOutcome::RetryRequired(error.to_string())
        } else {
            UpdateOutcome::Failed(error.to_string())
        }
    }

    fn publish_failure(&self, error: &UpdateError) {
        warn!(%error, state = %self.state(), "update pipeline stopped");
        self.host.publish_notice(&HostNotice::new(
            NoticeKind::Error,
            "Update failed",
            error.to_string(),
        ));
    }

    fn stage_files(&self, manifest: &UpdateManifest) -> Result<Vec<StagedFile>, UpdateError> {
        manifest
            .files
            .iter()
            .map(|file| {
                let url = if file.is_absolute_url {
                    Url::parse(&file.url)
                } else {
                    self.file_root.join(&file.url)
                }
                .map_err(|e| {
                    UpdateError::parse("update manifest", format!("bad file URL {:?}: {e}", file.url))
                })?;

                let (staged, destination) = if file.is_core_file {
                    (self.settings.staging_dir.join(&file.file_name), None)
                } else {
                    let destination = self.settings.work_dir.join(&file.file_name);
                    let mut staged = destination.clone().into_os_string();
                    staged.push(STAGED_SUFFIX);
                    (PathBuf::from(staged), Some(destination))
                };

                Ok(StagedFile {
                    file: file.clone(),
                    url: url.into(),
                    staged,
                    destination,
                })
            })
            .collect()
    }

    async fn finalize(
        &self,
        manifest: &UpdateManifest,
        jobs: &[StagedFile],
    ) -> Result<Option<UpdaterLaunch>, UpdateError> {
        self.extract_archives(jobs).await?;

        let core_files: Vec<PathBuf> = jobs
            .iter()
            .filter(|job| job.destination.is_none())
            .map(|job| job.staged.clone())
            .collect();

        if core_files.is_empty() {
            self.version_store
                .persist_resource_version(&manifest.resource_version)?;
            self.transition(UpdateState::Completed);
            self.host.publish_notice(&HostNotice::new(
                NoticeKind::Info,
                "Update complete",
                format!("Version {} installed", manifest.resource_version),
            ));
            return Ok(None);
        }

        let program = self.copy_updater()?;
        let mut args = Vec::with_capacity(core_files.len() + 1);
        args.push(self.settings.work_dir.clone());
        args.extend(core_files);
        let launch = UpdaterLaunch { program, args };

        // The host may exit inside the launch call, so the version is written
        // first and put back if the updater never started.
        let previous = self.version_store.resource_version();
        self.version_store
            .persist_resource_version(&manifest.resource_version)?;
        if let Err(error) = self.host.launch_updater_and_exit(&launch) {
            if let Err(restore_error) = self
                .version_store
                .restore_resource_version(previous.as_deref())
            {
                warn!(%restore_error, "could not restore resource version");
            }
            return Err(error);
        }

        self.transition(UpdateState::AwaitingExternalUpdater);
        Ok(Some(launch))
    }

    async fn extract_archives(&self, jobs: &[StagedFile]) -> Result<(), UpdateError> {
        for job in jobs.iter().filter(|job| job.file.is_archive()) {
            let Some(archive) = job.destination.clone() else {
                continue;
            };
            let Some(extractor) = self.extractor.clone() else {
                warn!(archive = %archive.display(), "no archive extractor configured, leaving archive as is");
                continue;
            };
            let work_dir = self.settings.work_dir.clone();
            let target = archive.clone();
            tokio::task::spawn_blocking(move || extractor.extract(&target, &work_dir))
                .await
                .map_err(|e| UpdateError::file(&archive, std::io::Error::other(e)))?
                .map_err(|e| UpdateError::file(&archive, e))?;
            info!(archive = %archive.display(), "archive extracted");
        }
        Ok(())
    }

    /// Copies the updater executable into a fresh temp directory.
    fn copy_updater(&self) -> Result<PathBuf, UpdateError> {
        let source = &self.settings.updater_path;
        let name = source.file_name().ok_or_else(|| {
            UpdateError::Argument(format!("updater path {} has no file name", source.display()))
        })?;
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |elapsed| elapsed.as_nanos());
        let dir = std::env::temp_dir().join(format!(
            "netupdate-updater-{}-{nanos}",
            std::process::id()
        ));
        std::fs::create_dir_all(&dir).map_err(|e| UpdateError::file(&dir, e))?;

        let target = dir.join(name);
        std::fs::copy(source, &target).map_err(|e| UpdateError::file(source, e))?;
        debug!(updater = %target.display(), "updater copied");
        Ok(target)
    }
}

fn transition(state: &Mutex<UpdateState>, next: UpdateState) {
    let mut current = state.lock().unwrap_or_else(PoisonError::into_inner);
    if *current != next {
        info!(from = %*current, to = %next, "update state changed");
        *current = next;
    }
}

fn base_url(field: &str, raw: &str) -> Result<Url, UpdateError> {
    let mut normalized = raw.trim().to_string();
    if !normalized.ends_with('/') {
        normalized.push('/');
    }
    Url::parse(&normalized).map_err(|e| UpdateError::Argument(format!("{field} {raw:?}: {e}")))
}

/// Renames staged non-core files into place.
async fn promote(jobs: &[StagedFile]) -> Result<(), UpdateError> {
    for job in jobs {
        if let Some(destination) = &job.destination {
            tokio::fs::rename(&job.staged, destination)
                .await
                .map_err(|e| UpdateError::file(destination, e))?;
        }
    }
    Ok(())
}

/// Removes every staged file, ignoring ones that were never written.
async fn discard(jobs: &[StagedFile]) {
    for job in jobs {
        if let Err(error) = tokio::fs::remove_file(&job.staged).await
            && error.kind() != std::io::ErrorKind::NotFound
        {
            warn!(path = %job.staged.display(), %error, "could not remove staged file");
        }
    }
}

/// State shared by the per-file tasks of one `update` call.
struct FileTaskContext {
    retry: RetryController,
    segmented: SegmentedDownloader,
    policy: RetryPolicy,
    stop: AtomicBool,
    cancelled: Arc<AtomicBool>,
    failure: Mutex<Option<UpdateError>>,
    state: Arc<Mutex<UpdateState>>,
}

impl FileTaskContext {
    fn should_stop(&self) -> bool {
        self.stop.load(Ordering::SeqCst) || self.cancelled.load(Ordering::SeqCst)
    }

    /// Keeps the first failure and tells the other tasks to stop.
    fn record_failure(&self, error: UpdateError) {
        self.stop.store(true, Ordering::SeqCst);
        let mut slot = self.failure.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            warn!(%error, "first file failure, stopping remaining tasks");
            *slot = Some(error);
        } else {
            debug!(%error, "additional file failure");
        }
    }

    fn take_failure(&self) -> Option<UpdateError> {
        self.failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Downloads and verifies one file. Returns `true` when it is ready to apply.
    async fn run(&self, job: StagedFile) -> bool {
        let name = job.file.file_name.as_str();
        if self.should_stop() {
            debug!(file = name, "skipping file, update is stopping");
            return false;
        }

        let spec = RequestSpec::download(job.url.as_str(), &job.staged);
        if job.file.suggest_multi_thread {
            if !self
                .segmented
                .multi_threaded_download(&spec, SplitApproach::Auto, 0)
                .await
            {
                self.record_failure(UpdateError::network(
                    format!("download of {name}"),
                    0,
                    "segmented download failed",
                ));
                return false;
            }
        } else {
            let outcome: RequestOutcome<()> =
                self.retry.execute_with_retry(&spec, &self.policy).await;
            if !outcome.succeeded {
                self.record_failure(UpdateError::network(
                    format!("download of {name}"),
                    outcome.status_code,
                    outcome.error_summary,
                ));
                return false;
            }
        }

        if self.should_stop() {
            return false;
        }

        transition(&self.state, UpdateState::VerifyingHashes);
        match hash::verify(&job.staged, &job.file.checksum, &job.file.hash_algorithm).await {
            VerifyResult::Verified => {
                debug!(file = name, "file ready");
                true
            }
            VerifyResult::Mismatch { expected, actual } => {
                self.record_failure(UpdateError::HashMismatch {
                    file: name.to_string(),
                    reason: format!("expected {expected}, got {actual}"),
                });
                false
            }
            VerifyResult::Unverifiable { reason } => {
                self.record_failure(UpdateError::HashMismatch {
                    file: name.to_string(),
                    reason,
                });
                false
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_appends_trailing_slash() {
        let url = base_url("api_root", "https://api.example.com/v1").unwrap();
        assert_eq!(url.join("update").unwrap().as_str(), "https://api.example.com/v1/update");
        assert!(matches!(
            base_url("api_root", "nope"),
            Err(UpdateError::Argument(_))
        ));
    }

    #[test]
    fn test_transition_records_latest_state() {
        let state = Mutex::new(UpdateState::Idle);
        transition(&state, UpdateState::CheckingMaintenance);
        transition(&state, UpdateState::CheckingMaintenance);
        assert_eq!(*state.lock().unwrap(), UpdateState::CheckingMaintenance);
        assert_eq!(UpdateState::NoUpdate.to_string(), "NoUpdate");
    }
}
