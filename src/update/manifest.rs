//! Update API payloads: request envelopes, update manifests and maintenance
//! notices.
//!
//! The wire format nests per-file download flags under `downloadMeta`; the
//! Rust types flatten them so the orchestrator reads one struct per file.

use std::path::{Component, Path};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use super::error::UpdateError;

/// Builds `{"<name>Request": body, "preferences": preferences}`.
#[must_use]
pub fn request_envelope(name: &str, body: Value, preferences: &Map<String, Value>) -> Value {
    let mut envelope = Map::new();
    envelope.insert(format!("{name}Request"), body);
    envelope.insert("preferences".into(), Value::Object(preferences.clone()));
    Value::Object(envelope)
}

/// Release described by the update endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateManifest {
    /// Release title.
    pub title: String,
    /// Release notes.
    pub description: String,
    /// Poster image URL.
    pub poster_url: Option<String>,
    /// Publication time as sent by the server.
    pub publish_time: Option<String>,
    /// Version persisted after a successful update.
    pub resource_version: String,
    /// Whether the host must not let the user skip the update.
    pub is_mandatory: bool,
    /// Opaque server metadata.
    pub meta: Option<Value>,
    /// Files to fetch; never empty once parsed.
    pub files: Vec<UpdateFileSpec>,
}

/// One file of an update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateFileSpec {
    /// Absolute URL, or a path relative to the file root.
    pub url: String,
    /// Relative destination path.
    pub file_name: String,
    /// Expected digest in hex.
    pub checksum: String,
    /// Digest algorithm name.
    pub hash_algorithm: String,
    /// Fetch with the segmented downloader.
    pub suggest_multi_thread: bool,
    /// Replaced by the external updater instead of in place.
    pub is_core_file: bool,
    /// Whether `url` is absolute.
    pub is_absolute_url: bool,
}

impl UpdateFileSpec {
    /// Whether the file is a `.zip` archive to extract into the work folder.
    #[must_use]
    pub fn is_archive(&self) -> bool {
        Path::new(&self.file_name)
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("zip"))
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateEnvelope {
    update_response: WireManifest,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireManifest {
    title: String,
    #[serde(default)]
    description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    poster_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    publish_time: Option<String>,
    resource_version: String,
    #[serde(default)]
    is_mandatory: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    meta: Option<Value>,
    files: Vec<WireFile>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireFile {
    url: String,
    file_name: String,
    checksum: String,
    download_meta: WireDownloadMeta,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireDownloadMeta {
    hash_algorithm: String,
    #[serde(default)]
    suggest_multi_thread: bool,
    #[serde(default)]
    is_core_file: bool,
    #[serde(default)]
    is_absolute_url: bool,
}

impl UpdateManifest {
    /// Parses an `updateResponse` body.
    ///
    /// # Errors
    ///
    /// Returns [`UpdateError::Parse`] for malformed JSON, missing fields, an
    /// empty file list, or a file name escaping the work folder.
    pub fn from_json(body: &str) -> Result<Self, UpdateError> {
        let envelope: UpdateEnvelope =
            serde_json::from_str(body).map_err(|e| UpdateError::parse("update manifest", e.to_string()))?;
        let wire = envelope.update_response;
        if wire.files.is_empty() {
            return Err(UpdateError::parse("update manifest", "files list is empty"));
        }
        let files = wire
            .files
            .into_iter()
            .map(|file| {
                validate_file_name(&file.file_name)?;
                Ok(UpdateFileSpec {
                    url: file.url,
                    file_name: file.file_name,
                    checksum: file.checksum,
                    hash_algorithm: file.download_meta.hash_algorithm,
                    suggest_multi_thread: file.download_meta.suggest_multi_thread,
                    is_core_file: file.download_meta.is_core_file,
                    is_absolute_url: file.download_meta.is_absolute_url,
                })
            })
            .collect::<Result<Vec<_>, UpdateError>>()?;

        Ok(Self {
            title: wire.title,
            description: wire.description,
            poster_url: wire.poster_url,
            publish_time: wire.publish_time,
            resource_version: wire.resource_version,
            is_mandatory: wire.is_mandatory,
            meta: wire.meta,
            files,
        })
    }

    /// Serializes back into the `updateResponse` wire form.
    ///
    /// # Errors
    ///
    /// Returns [`UpdateError::Parse`] if serialization fails.
    pub fn to_json(&self) -> Result<String, UpdateError> {
        let envelope = UpdateEnvelope {
            update_response: WireManifest {
                title: self.title.clone(),
                description: self.description.clone(),
                poster_url: self.poster_url.clone(),
                publish_time: self.publish_time.clone(),
                resource_version: self.resource_version.clone(),
                is_mandatory: self.is_mandatory,
                meta: self.meta.clone(),
                files: self
                    .files
                    .iter()
                    .map(|file| WireFile {
                        url: file.url.clone(),
                        file_name: file.file_name.clone(),
                        checksum: file.checksum.clone(),
                        download_meta: WireDownloadMeta {
                            hash_algorithm: file.hash_algorithm.clone(),
                            suggest_multi_thread: file.suggest_multi_thread,
                            is_core_file: file.is_core_file,
                            is_absolute_url: file.is_absolute_url,
                        },
                    })
                    .collect(),
            },
        };
        serde_json::to_string(&envelope).map_err(|e| UpdateError::parse("update manifest", e.to_string()))
    }
}

fn validate_file_name(name: &str) -> Result<(), UpdateError> {
    let path = Path::new(name);
    let escapes = name.trim().is_empty()
        || path
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if escapes {
        return Err(UpdateError::parse(
            "update manifest",
            format!("file name {name:?} must be a relative path inside the work folder"),
        ));
    }
    Ok(())
}

/// Maintenance phase reported by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MaintenanceStatus {
    /// Maintenance is running now; the host should quit.
    InProgress,
    /// Maintenance is announced for later.
    Scheduled,
    /// Any status this client does not know.
    #[serde(other)]
    Unknown,
}

/// Maintenance announcement halting the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MaintenanceNotice {
    /// Notice title.
    pub title: String,
    /// Notice body.
    #[serde(default)]
    pub description: String,
    /// Maintenance phase.
    pub status: MaintenanceStatus,
    /// Start time as sent by the server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<String>,
    /// End time as sent by the server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<String>,
}

impl MaintenanceNotice {
    /// Parses a `maintenanceResponse` body.
    ///
    /// # Errors
    ///
    /// Returns [`UpdateError::Parse`] when the envelope is missing or malformed.
    pub fn from_json(body: &str) -> Result<Self, UpdateError> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Envelope {
            maintenance_response: MaintenanceNotice,
        }
        serde_json::from_str::<Envelope>(body)
            .map(|envelope| envelope.maintenance_response)
            .map_err(|e| UpdateError::parse("maintenance notice", e.to_string()))
    }

    /// Whether the host should quit once the user acknowledged the notice.
    #[must_use]
    pub fn requires_quit(&self) -> bool {
        self.status == MaintenanceStatus::InProgress
    }

    /// Wire form, used by tests and mock servers.
    #[must_use]
    pub fn to_json(&self) -> Value {
        json!({ "maintenanceResponse": self })
    }
}
