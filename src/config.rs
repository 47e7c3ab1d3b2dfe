//! Engine configuration.
//!
//! [`NetworkConfig`] is built once at startup (from code or a JSON file) and
//! passed by reference into [`HttpTransport::new`](crate::HttpTransport::new);
//! nothing mutates it afterwards. [`UpdaterSettings`] carries the filesystem
//! layout the update orchestrator works in.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::auth::{AuthBackend, AuthlibInjectorAuth, OfflineAuth};
use crate::transport::{CONNECT_TIMEOUT_SECS, DEFAULT_CONCURRENCY, READ_TIMEOUT_SECS};
use crate::user_agent::default_user_agent;

/// Largest accepted timeout in seconds.
const MAX_TIMEOUT_SECS: u64 = 3600;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("cannot read config {path}: {source}")]
    Io {
        /// Config file path.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The configuration file is not valid JSON for the schema.
    #[error("cannot parse config {path}: {source}")]
    Parse {
        /// Config file path.
        path: PathBuf,
        /// The underlying serde error.
        #[source]
        source: serde_json::Error,
    },

    /// A value is outside its accepted range.
    #[error("invalid config value for `{field}`: {reason}")]
    Invalid {
        /// Offending field.
        field: &'static str,
        /// What is wrong with it.
        reason: String,
    },
}

impl ConfigError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// How outgoing connections reach the network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxySetting {
    /// Connect directly, ignoring any OS proxy.
    Direct,
    /// Use the operating system / environment proxy settings.
    System,
    /// Use this proxy URL for every scheme.
    Explicit(String),
}

impl ProxySetting {
    /// Resolves the raw configuration value.
    ///
    /// `"true"` selects the system proxy, any other non-empty value is an
    /// explicit proxy URL, and empty or `"false"` means direct.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        let value = raw.trim();
        if value.eq_ignore_ascii_case("true") {
            Self::System
        } else if value.is_empty() || value.eq_ignore_ascii_case("false") {
            Self::Direct
        } else {
            Self::Explicit(value.to_string())
        }
    }
}

/// Authentication backend selection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum AuthMode {
    /// No account.
    #[default]
    Offline,
    /// authlib-injector compatible account server.
    AuthlibInjector {
        /// Account server root URL.
        server: String,
        /// Session token sent as a bearer credential.
        #[serde(default)]
        access_token: Option<String>,
    },
}

impl AuthMode {
    /// Instantiates the selected backend.
    #[must_use]
    pub fn backend(&self) -> Arc<dyn AuthBackend> {
        match self {
            Self::Offline => Arc::new(OfflineAuth),
            Self::AuthlibInjector {
                server,
                access_token,
            } => Arc::new(AuthlibInjectorAuth::new(server.clone(), access_token.clone())),
        }
    }
}

/// Immutable network configuration shared by every transport call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Application name used in the default User-Agent.
    pub app_name: String,
    /// Application version used in the default User-Agent.
    pub app_version: String,
    /// Operating system label used in the default User-Agent.
    pub os: String,
    /// Build identifier used in the default User-Agent.
    pub build_id: String,
    /// Full User-Agent override.
    pub user_agent: Option<String>,
    /// Raw proxy value: explicit URL, `"true"` for the system proxy, or empty.
    pub proxy: String,
    /// PEM bundle of trusted CA certificates. Falls back to the system store.
    pub ca_bundle: Option<PathBuf>,
    /// Connect timeout in seconds.
    pub connect_timeout_secs: u64,
    /// Whole-request timeout in seconds.
    pub read_timeout_secs: u64,
    /// Root URL of the update API (maintenance and update endpoints).
    pub api_root: String,
    /// Base URL for update files whose `url` is relative. Defaults to `api_root`.
    pub file_root: Option<String>,
    /// Client preferences sent with every API envelope.
    pub preferences: Map<String, Value>,
    /// Authentication backend.
    pub auth: AuthMode,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            app_name: "netupdate".into(),
            app_version: env!("CARGO_PKG_VERSION").into(),
            os: std::env::consts::OS.into(),
            build_id: "0".into(),
            user_agent: None,
            proxy: String::new(),
            ca_bundle: None,
            connect_timeout_secs: CONNECT_TIMEOUT_SECS,
            read_timeout_secs: READ_TIMEOUT_SECS,
            api_root: String::new(),
            file_root: None,
            preferences: Map::new(),
            auth: AuthMode::Offline,
        }
    }
}

impl NetworkConfig {
    /// Creates a configuration pointing at `api_root` with default settings.
    pub fn new(api_root: impl Into<String>) -> Self {
        Self {
            api_root: api_root.into(),
            ..Self::default()
        }
    }

    /// Effective User-Agent value.
    #[must_use]
    pub fn effective_user_agent(&self) -> String {
        self.user_agent
            .clone()
            .filter(|ua| !ua.trim().is_empty())
            .unwrap_or_else(|| {
                default_user_agent(&self.app_name, &self.app_version, &self.os, &self.build_id)
            })
    }

    /// Resolved proxy setting.
    #[must_use]
    pub fn proxy_setting(&self) -> ProxySetting {
        ProxySetting::parse(&self.proxy)
    }

    /// Base URL for relative update file URLs.
    #[must_use]
    pub fn effective_file_root(&self) -> &str {
        self.file_root.as_deref().unwrap_or(&self.api_root)
    }

    /// Validates ranges and URLs.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_timeout("connect_timeout_secs", self.connect_timeout_secs)?;
        validate_timeout("read_timeout_secs", self.read_timeout_secs)?;
        if !self.api_root.is_empty() && Url::parse(&self.api_root).is_err() {
            return Err(ConfigError::invalid("api_root", format!("not a URL: {}", self.api_root)));
        }
        if let Some(root) = &self.file_root
            && Url::parse(root).is_err()
        {
            return Err(ConfigError::invalid("file_root", format!("not a URL: {root}")));
        }
        Ok(())
    }
}

fn validate_timeout(field: &'static str, value: u64) -> Result<(), ConfigError> {
    if !(1..=MAX_TIMEOUT_SECS).contains(&value) {
        return Err(ConfigError::invalid(
            field,
            format!("{value}. Expected range: 1..={MAX_TIMEOUT_SECS}"),
        ));
    }
    Ok(())
}

/// Filesystem layout and parallelism of the update pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdaterSettings {
    /// Installation directory receiving non-core files and archive contents.
    pub work_dir: PathBuf,
    /// Directory where core files are staged for the external updater.
    pub staging_dir: PathBuf,
    /// External updater executable copied out before the handoff.
    pub updater_path: PathBuf,
    /// Client configuration JSON whose `resourceVersion` is persisted.
    pub client_config_path: PathBuf,
    /// Maximum concurrent transfers.
    pub concurrency: usize,
    /// Attempts for API calls and single-file downloads.
    pub max_attempts: u32,
    /// Delay between attempts in milliseconds.
    pub retry_delay_ms: u64,
}

impl Default for UpdaterSettings {
    fn default() -> Self {
        let temp = std::env::temp_dir();
        Self {
            work_dir: PathBuf::from("."),
            staging_dir: temp.join("netupdate-staging"),
            updater_path: PathBuf::from(if cfg!(windows) { "updater.exe" } else { "updater" }),
            client_config_path: PathBuf::from("client.json"),
            concurrency: DEFAULT_CONCURRENCY,
            max_attempts: 3,
            retry_delay_ms: 1000,
        }
    }
}

impl UpdaterSettings {
    /// Settings rooted at `work_dir`, with updater and client config inside it.
    pub fn for_work_dir(work_dir: impl Into<PathBuf>) -> Self {
        let work_dir = work_dir.into();
        let defaults = Self::default();
        Self {
            updater_path: work_dir.join(&defaults.updater_path),
            client_config_path: work_dir.join(&defaults.client_config_path),
            work_dir,
            ..defaults
        }
    }

    /// Validates ranges.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=100).contains(&self.concurrency) {
            return Err(ConfigError::invalid(
                "concurrency",
                format!("{}. Expected range: 1..=100", self.concurrency),
            ));
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::invalid("max_attempts", "must be at least 1"));
        }
        Ok(())
    }
}

/// Top-level configuration file: `{"network": {...}, "updater": {...}}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Transport settings.
    pub network: NetworkConfig,
    /// Update pipeline settings.
    pub updater: UpdaterSettings,
}

impl EngineConfig {
    /// Loads and validates a JSON configuration file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the file cannot be read, parsed, or validated.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.network.validate()?;
        config.updater.validate()?;
        debug!(path = %path.display(), api_root = %config.network.api_root, "configuration loaded");
        Ok(config)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_proxy_resolution_order() {
        assert_eq!(
            ProxySetting::parse("http://proxy.local:3128"),
            ProxySetting::Explicit("http://proxy.local:3128".into())
        );
        assert_eq!(ProxySetting::parse("true"), ProxySetting::System);
        assert_eq!(ProxySetting::parse("TRUE"), ProxySetting::System);
        assert_eq!(ProxySetting::parse(""), ProxySetting::Direct);
        assert_eq!(ProxySetting::parse("  "), ProxySetting::Direct);
        assert_eq!(ProxySetting::parse("false"), ProxySetting::Direct);
    }

    #[test]
    fn test_default_user_agent_uses_identity() {
        let config = NetworkConfig {
            app_name: "Launcher".into(),
            app_version: "1.2.3".into(),
            os: "macos".into(),
            build_id: "77".into(),
            ..NetworkConfig::default()
        };
        assert_eq!(config.effective_user_agent(), "Launcher/1.2.3 (macos; Build 77)");
    }

    #[test]
    fn test_user_agent_override_wins() {
        let config = NetworkConfig {
            user_agent: Some("Custom/1".into()),
            ..NetworkConfig::default()
        };
        assert_eq!(config.effective_user_agent(), "Custom/1");
    }

    #[test]
    fn test_validate_rejects_zero_timeout() {
        let config = NetworkConfig {
            connect_timeout_secs: 0,
            ..NetworkConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("connect_timeout_secs"));
    }

    #[test]
    fn test_validate_rejects_bad_api_root() {
        let err = NetworkConfig::new("not a url").validate().unwrap_err();
        assert!(err.to_string().contains("api_root"));
    }

    #[test]
    fn test_file_root_defaults_to_api_root() {
        let config = NetworkConfig::new("https://api.example.com/");
        assert_eq!(config.effective_file_root(), "https://api.example.com/");
    }

    #[test]
    fn test_auth_mode_deserializes_tagged() {
        let mode: AuthMode = serde_json::from_str(
            r#"{"mode": "authlib_injector", "server": "https://auth.example.com"}"#,
        )
        .unwrap();
        assert_eq!(mode.backend().name(), "authlib_injector");
        let offline: AuthMode = serde_json::from_str(r#"{"mode": "offline"}"#).unwrap();
        assert_eq!(offline.backend().name(), "offline");
    }

    #[test]
    fn test_engine_config_load_partial_file_uses_defaults() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("engine.json");
        std::fs::write(
            &path,
            r#"{"network": {"api_root": "https://api.example.com", "proxy": "true"},
                "updater": {"concurrency": 4}}"#,
        )
        .unwrap();

        let config = EngineConfig::load(&path).unwrap();
        assert_eq!(config.network.proxy_setting(), ProxySetting::System);
        assert_eq!(config.network.connect_timeout_secs, CONNECT_TIMEOUT_SECS);
        assert_eq!(config.updater.concurrency, 4);
        assert_eq!(config.updater.max_attempts, 3);
    }

    #[test]
    fn test_engine_config_load_rejects_invalid_concurrency() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("engine.json");
        std::fs::write(&path, r#"{"updater": {"concurrency": 0}}"#).unwrap();
        let err = EngineConfig::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "concurrency", .. }));
    }

    #[test]
    fn test_engine_config_load_missing_file() {
        let err = EngineConfig::load(Path::new("/nonexistent/engine.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn test_updater_settings_for_work_dir() {
        let settings = UpdaterSettings::for_work_dir("/opt/app");
        assert_eq!(settings.work_dir, PathBuf::from("/opt/app"));
        assert!(settings.updater_path.starts_with("/opt/app"));
        assert_eq!(settings.client_config_path, PathBuf::from("/opt/app/client.json"));
    }
}
