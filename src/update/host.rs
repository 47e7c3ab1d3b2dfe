//! Collaborators the host application provides to the orchestrator.
//!
//! The engine has no UI and never terminates the process on its own: it
//! publishes notices and hands the updater launch to a [`HostBridge`].
//! Version persistence and archive extraction are pluggable as well.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Child, Command};

use serde_json::{Map, Value};
use tracing::{debug, info};

use super::error::UpdateError;

/// Severity of a host notice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeKind {
    /// Informational (update applied, nothing to do).
    Info,
    /// Server maintenance announcement.
    Maintenance,
    /// The pipeline failed.
    Error,
}

/// Message for the host to show to the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostNotice {
    /// Severity.
    pub kind: NoticeKind,
    /// Short title.
    pub title: String,
    /// Body text. Never contains diagnostic detail.
    pub message: String,
}

impl HostNotice {
    /// Creates a notice.
    pub fn new(kind: NoticeKind, title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            title: title.into(),
            message: message.into(),
        }
    }
}

/// Command line of the external updater process.
///
/// Arguments are `<workPath> <coreFile1> [coreFile2 ...]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdaterLaunch {
    /// Copied updater executable in its own temp directory.
    pub program: PathBuf,
    /// Work folder followed by the staged core files.
    pub args: Vec<PathBuf>,
}

impl UpdaterLaunch {
    /// Spawns the updater without waiting for it.
    ///
    /// # Errors
    ///
    /// Returns [`UpdateError::File`] when the process cannot be started.
    pub fn spawn(&self) -> Result<Child, UpdateError> {
        info!(program = %self.program.display(), args = self.args.len(), "spawning external updater");
        Command::new(&self.program)
            .args(&self.args)
            .spawn()
            .map_err(|e| UpdateError::file(&self.program, e))
    }
}

/// Host-side effects requested by the orchestrator.
pub trait HostBridge: Send + Sync + fmt::Debug {
    /// Shows a notice to the user.
    fn publish_notice(&self, notice: &HostNotice);

    /// Asks the host to quit once the user acknowledged the last notice.
    fn request_quit_after_acknowledgement(&self);

    /// Spawns the external updater and terminates the host.
    ///
    /// # Errors
    ///
    /// Implementations return [`UpdateError`] when the updater cannot be started.
    fn launch_updater_and_exit(&self, launch: &UpdaterLaunch) -> Result<(), UpdateError>;
}

/// Persists the installed resource version.
pub trait VersionStore: Send + Sync + fmt::Debug {
    /// Currently installed version, if known.
    fn resource_version(&self) -> Option<String>;

    /// Records `version` as installed.
    ///
    /// # Errors
    ///
    /// Returns [`UpdateError`] when the store cannot be written.
    fn persist_resource_version(&self, version: &str) -> Result<(), UpdateError>;

    /// Puts back a version read earlier through
    /// [`resource_version`](Self::resource_version); `None` removes it.
    ///
    /// # Errors
    ///
    /// Returns [`UpdateError`] when the store cannot be written.
    fn restore_resource_version(&self, previous: Option<&str>) -> Result<(), UpdateError>;
}

/// Unpacks archive files shipped in an update.
pub trait ArchiveExtractor: Send + Sync + fmt::Debug {
    /// Extracts `archive` into `destination`.
    ///
    /// # Errors
    ///
    /// Returns the IO error that stopped extraction.
    fn extract(&self, archive: &Path, destination: &Path) -> std::io::Result<()>;
}

const RESOURCE_VERSION_KEY: &str = "resourceVersion";

/// Stores `resourceVersion` inside the client configuration JSON file,
/// preserving every other key.
#[derive(Debug, Clone)]
pub struct JsonVersionStore {
    path: PathBuf,
}

impl JsonVersionStore {
    /// Uses the JSON file at `path` (created on first write).
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn read_object(&self) -> Result<Map<String, Value>, UpdateError> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(Map::new()),
            Err(error) => return Err(UpdateError::file(&self.path, error)),
        };
        if text.trim().is_empty() {
            return Ok(Map::new());
        }
        match serde_json::from_str::<Value>(&text) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(_) => Err(UpdateError::parse("client configuration", "top level is not an object")),
            Err(error) => Err(UpdateError::parse("client configuration", error.to_string())),
        }
    }

    fn write_object(&self, object: Map<String, Value>) -> Result<(), UpdateError> {
        let text = serde_json::to_string_pretty(&Value::Object(object))
            .map_err(|e| UpdateError::parse("client configuration", e.to_string()))?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| UpdateError::file(parent, e))?;
        }
        // Staged write, then rename over the original.
        let mut staged = self.path.clone().into_os_string();
        staged.push(".tmp");
        let staged = PathBuf::from(staged);
        fs::write(&staged, text).map_err(|e| UpdateError::file(&staged, e))?;
        fs::rename(&staged, &self.path).map_err(|e| UpdateError::file(&self.path, e))
    }
}

impl VersionStore for JsonVersionStore {
    fn resource_version(&self) -> Option<String> {
        self.read_object()
            .ok()?
            .get(RESOURCE_VERSION_KEY)?
            .as_str()
            .map(str::to_string)
    }

    fn persist_resource_version(&self, version: &str) -> Result<(), UpdateError> {
        let mut object = self.read_object()?;
        object.insert(RESOURCE_VERSION_KEY.into(), Value::from(version));
        self.write_object(object)?;
        debug!(path = %self.path.display(), version, "resource version persisted");
        Ok(())
    }

    fn restore_resource_version(&self, previous: Option<&str>) -> Result<(), UpdateError> {
        let mut object = self.read_object()?;
        match previous {
            Some(version) => {
                object.insert(RESOURCE_VERSION_KEY.into(), Value::from(version));
            }
            None => {
                object.remove(RESOURCE_VERSION_KEY);
            }
        }
        self.write_object(object)?;
        debug!(path = %self.path.display(), ?previous, "resource version restored");
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_version_store_preserves_other_keys() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("client.json");
        std::fs::write(&path, r#"{"language": "en", "resourceVersion": "1.0"}"#).unwrap();
        let store = JsonVersionStore::new(&path);

        assert_eq!(store.resource_version().as_deref(), Some("1.0"));
        store.persist_resource_version("1.1").unwrap();

        let value: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["resourceVersion"], "1.1");
        assert_eq!(value["language"], "en");
    }

    #[test]
    fn test_version_store_creates_missing_file() {
        let temp = TempDir::new().unwrap();
        let store = JsonVersionStore::new(temp.path().join("nested/client.json"));
        assert_eq!(store.resource_version(), None);
        store.persist_resource_version("2.0").unwrap();
        assert_eq!(store.resource_version().as_deref(), Some("2.0"));
    }

    #[test]
    fn test_version_store_restore_puts_back_or_removes() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("client.json");
        std::fs::write(&path, r#"{"language": "en", "resourceVersion": "1.0"}"#).unwrap();
        let store = JsonVersionStore::new(&path);

        store.persist_resource_version("2.0").unwrap();
        store.restore_resource_version(Some("1.0")).unwrap();
        assert_eq!(store.resource_version().as_deref(), Some("1.0"));

        store.restore_resource_version(None).unwrap();
        assert_eq!(store.resource_version(), None);
        let value: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["language"], "en");
    }

    #[test]
    fn test_version_store_rejects_non_object() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("client.json");
        std::fs::write(&path, "[1, 2]").unwrap();
        let error = JsonVersionStore::new(&path)
            .persist_resource_version("1")
            .unwrap_err();
        assert!(matches!(error, UpdateError::Parse { .. }));
    }

    #[test]
    fn test_spawn_missing_updater_is_file_error() {
        let launch = UpdaterLaunch {
            program: PathBuf::from("/nonexistent/updater"),
            args: vec![PathBuf::from("/opt/app")],
        };
        assert!(matches!(launch.spawn(), Err(UpdateError::File { .. })));
    }
}
