//! Installation state and version tracking.
//!
//! The `SystemState` document is a flat JSON object on disk. Every write is a
//! shallow merge into whatever is already stored, stamps `updated_at` and bumps
//! a monotonic `revision`. Writes land in a temp file that is renamed over the
//! document, so a crash never leaves it half written. A caller that read a
//! revision can use [`StateTracker::save_system_state_if`] to refuse writing on
//! top of someone else's change.
//!
//! The revision counter also lives in a sidecar (`<state>.revision`) that
//! backups never capture. Restoring an older document therefore never moves
//! the revision backwards.

use crate::{
    config::{DataStore, Settings},
    core::{schema, version},
    errors::{Error, Result},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, instrument, warn};

/// How this run relates to the previous one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallationType {
    /// Nothing from a previous run exists
    CleanInstall,
    /// The recorded version differs from the running one
    Update,
    /// Data exists but predates state tracking
    ExistingNoState,
    /// Same version as last time
    Normal,
}

/// Inputs of the installation classification
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstallationProbe {
    /// Schema history table exists and has at least one row
    pub has_data_store: bool,
    /// The `SystemState` document exists
    pub has_state_file: bool,
    /// The activation sentinel exists
    pub has_activation_marker: bool,
    /// `installed_version` from the state document
    pub previous_version: Option<String>,
}

/// Result of [`classify_installation`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstallationInfo {
    /// Classification
    #[serde(rename = "type")]
    pub kind: InstallationType,
    /// Version recorded by the previous run
    pub from_version: Option<String>,
    /// Version now running
    pub to_version: String,
    /// True only for a clean install
    pub is_first_run: bool,
}

/// Decides the installation type from its four inputs.
#[must_use]
pub fn classify_installation(probe: &InstallationProbe, current_version: &str) -> InstallationInfo {
    if !probe.has_data_store && !probe.has_state_file && !probe.has_activation_marker {
        return InstallationInfo {
            kind: InstallationType::CleanInstall,
            from_version: None,
            to_version: current_version.to_string(),
            is_first_run: true,
        };
    }

    let kind = match probe.previous_version.as_deref() {
        Some(previous) if previous != current_version => InstallationType::Update,
        _ if probe.has_data_store && !probe.has_state_file => InstallationType::ExistingNoState,
        _ => InstallationType::Normal,
    };

    InstallationInfo {
        kind,
        from_version: probe.previous_version.clone(),
        to_version: current_version.to_string(),
        is_first_run: false,
    }
}

/// Typed view of the state document. Unknown keys are preserved on disk but
/// not surfaced here.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemState {
    /// Version the installation was last brought to
    pub installed_version: Option<String>,
    /// Classification recorded at initialization
    pub installation_type: Option<InstallationType>,
    /// License activation completed
    pub activated: bool,
    /// When activation happened
    pub activated_at: Option<DateTime<Utc>>,
    /// Activated license key
    pub license_key: Option<String>,
    /// License holder
    pub licensed_to: Option<String>,
    /// Outcome of the last migration run
    pub last_migration_success: Option<bool>,
    /// When the last migration run finished
    pub last_migration_at: Option<DateTime<Utc>>,
    /// Captured output of the last failed migration run
    pub last_migration_error: Option<String>,
    /// Consecutive failed migration runs
    pub migration_failures: u32,
    /// Crash-recovery flag held around risky update steps
    pub update_in_progress: bool,
    /// Backup taken when the current or last update started
    pub update_backup_id: Option<String>,
    /// When the current or last update started
    pub update_started_at: Option<DateTime<Utc>>,
    /// When the last update completed
    pub update_completed_at: Option<DateTime<Utc>>,
    /// When the last manual rollback happened
    pub last_rollback_at: Option<DateTime<Utc>>,
    /// Version rolled back from
    pub rollback_from_version: Option<String>,
    /// Version rolled back to
    pub rollback_to_version: Option<String>,
    /// Monotonic write counter
    pub revision: u64,
    /// Last write
    pub updated_at: Option<DateTime<Utc>>,
}

/// Reads and writes the state document and classifies the installation.
#[derive(Debug, Clone)]
pub struct StateTracker {
    settings: Arc<Settings>,
    store: Arc<DataStore>,
    write_lock: Arc<Mutex<()>>,
}

fn now() -> String {
    Utc::now().to_rfc3339()
}

fn atomic_write(path: &Path, body: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
    }
    let file_name = path
        .file_name()
        .and_then(|s| s.to_str())
        .ok_or_else(|| Error::config(format!("Invalid state file path: {}", path.display())))?;
    let tmp = path.with_file_name(format!(
        ".{file_name}.tmp.{}.{}",
        std::process::id(),
        Utc::now().timestamp_nanos_opt().unwrap_or_default()
    ));
    std::fs::write(&tmp, body).map_err(|e| Error::io(&tmp, e))?;
    std::fs::rename(&tmp, path).map_err(|e| {
        let _ = std::fs::remove_file(&tmp);
        Error::io(path, e)
    })
}

fn revision_of(doc: &Map<String, Value>) -> u64 {
    doc.get("revision").and_then(Value::as_u64).unwrap_or(0)
}

/// Typed view that drops only the fields whose type does not match.
fn typed_view(doc: &Map<String, Value>) -> SystemState {
    if let Ok(state) = serde_json::from_value(Value::Object(doc.clone())) {
        return state;
    }
    let mut usable = Map::new();
    for (key, value) in doc {
        let mut single = Map::new();
        single.insert(key.clone(), value.clone());
        match serde_json::from_value::<SystemState>(Value::Object(single)) {
            Ok(_) => {
                usable.insert(key.clone(), value.clone());
            }
            Err(e) => warn!("Ignoring state field '{}' with unexpected type: {}", key, e),
        }
    }
    serde_json::from_value(Value::Object(usable)).unwrap_or_default()
}

fn object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

impl StateTracker {
    /// Creates a tracker for the given installation.
    #[must_use]
    pub fn new(settings: Arc<Settings>, store: Arc<DataStore>) -> Self {
        Self {
            settings,
            store,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Location of the state document.
    #[must_use]
    pub fn state_path(&self) -> PathBuf {
        self.settings.state_file()
    }

    /// Location of the revision counter.
    #[must_use]
    pub fn revision_path(&self) -> PathBuf {
        self.state_path().with_extension("revision")
    }

    fn stored_counter(&self) -> u64 {
        std::fs::read_to_string(self.revision_path())
            .ok()
            .and_then(|raw| raw.trim().parse().ok())
            .unwrap_or(0)
    }

    /// Highest revision ever written, whatever document is on disk now.
    #[must_use]
    pub fn current_revision(&self) -> u64 {
        self.stored_counter().max(revision_of(&self.load_document()))
    }

    /// Whether the state document exists.
    #[must_use]
    pub fn has_state_file(&self) -> bool {
        self.state_path().is_file()
    }

    /// Whether the activation sentinel exists.
    #[must_use]
    pub fn has_activation_marker(&self) -> bool {
        self.settings.activation_marker().exists()
    }

    /// The raw document. Missing or unreadable files yield an empty document.
    #[must_use]
    pub fn load_document(&self) -> Map<String, Value> {
        let path = self.state_path();
        let contents = match std::fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Map::new(),
            Err(e) => {
                warn!("Could not read state file {}: {}", path.display(), e);
                return Map::new();
            }
        };
        match serde_json::from_str::<Value>(&contents) {
            Ok(Value::Object(map)) => map,
            Ok(_) | Err(_) => {
                warn!("State file {} is not a JSON object, ignoring it", path.display());
                Map::new()
            }
        }
    }

    /// The typed view of the document; never fails. Fields with an
    /// unexpected type read as their default, the rest are kept.
    #[must_use]
    pub fn load_system_state(&self) -> SystemState {
        let doc = self.load_document();
        let mut state = typed_view(&doc);
        state.revision = self.stored_counter().max(revision_of(&doc));
        state
    }

    fn merge_locked<F>(&self, expected_revision: Option<u64>, build_patch: F) -> Result<SystemState>
    where
        F: FnOnce(&SystemState) -> Map<String, Value>,
    {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| Error::config("State write lock poisoned"))?;

        let mut doc = self.load_document();
        let found = self.stored_counter().max(revision_of(&doc));
        if let Some(expected) = expected_revision {
            if expected != found {
                return Err(Error::StateConflict { expected, found });
            }
        }

        let current = typed_view(&doc);
        for (key, value) in build_patch(&current) {
            doc.insert(key, value);
        }
        let revision = found + 1;
        doc.insert("revision".to_string(), json!(revision));
        doc.insert("updated_at".to_string(), json!(now()));

        let body = serde_json::to_string_pretty(&doc)?;
        // Counter first: a crash in between leaves it ahead, never behind.
        atomic_write(&self.revision_path(), &revision.to_string())?;
        atomic_write(&self.state_path(), &body)?;
        debug!("State document written at revision {}", revision);
        Ok(typed_view(&doc))
    }

    /// Shallow-merges `patch` into the stored document.
    pub fn save_system_state(&self, patch: Map<String, Value>) -> Result<SystemState> {
        self.merge_locked(None, |_| patch)
    }

    /// Like [`Self::save_system_state`] but only if the stored revision is still `expected`.
    ///
    /// # Errors
    /// `Error::StateConflict` (retryable) when another writer got there first.
    pub fn save_system_state_if(
        &self,
        expected: u64,
        patch: Map<String, Value>,
    ) -> Result<SystemState> {
        self.merge_locked(Some(expected), |_| patch)
    }

    /// Writes the first-run document for this installation.
    #[instrument(skip(self))]
    pub fn initialize_system_state(&self, kind: InstallationType) -> Result<SystemState> {
        let version = self.current_version();
        info!("Initializing system state at version {}", version);
        self.save_system_state(object(json!({
            "installed_version": version,
            "installation_type": kind,
            "activated": self.has_activation_marker(),
            "migration_failures": 0,
            "update_in_progress": false,
        })))
    }

    /// The running application version.
    #[must_use]
    pub fn current_version(&self) -> String {
        version::resolve_current_version(
            &self.settings.config_dir(),
            &self.settings.package_descriptor(),
        )
    }

    /// Gathers the classification inputs. A data store that cannot be reached
    /// counts as having no schema history.
    pub async fn probe(&self) -> InstallationProbe {
        let has_data_store = match self.store.connection().await {
            Ok(conn) => schema::has_schema_history(&conn).await.unwrap_or_else(|e| {
                warn!("Could not inspect schema history: {}", e);
                false
            }),
            Err(e) => {
                warn!("Could not connect to data store: {}", e);
                false
            }
        };
        InstallationProbe {
            has_data_store,
            has_state_file: self.has_state_file(),
            has_activation_marker: self.has_activation_marker(),
            previous_version: self.load_system_state().installed_version,
        }
    }

    /// Classifies this run against the previous one.
    #[instrument(skip(self))]
    pub async fn detect_installation_type(&self) -> InstallationInfo {
        let probe = self.probe().await;
        let info = classify_installation(&probe, &self.current_version());
        info!("Detected installation type {:?}", info.kind);
        info
    }

    /// Records a successful migration run and resets the failure counter.
    pub fn mark_migration_success(&self) -> Result<SystemState> {
        self.save_system_state(object(json!({
            "last_migration_success": true,
            "last_migration_at": now(),
            "last_migration_error": null,
            "migration_failures": 0,
        })))
    }

    /// Records a failed migration run and increments the failure counter.
    pub fn mark_migration_failed(&self, error: &str) -> Result<SystemState> {
        let error = error.to_string();
        self.merge_locked(None, move |current| {
            object(json!({
                "last_migration_success": false,
                "last_migration_at": now(),
                "last_migration_error": error,
                "migration_failures": current.migration_failures.saturating_add(1),
            }))
        })
    }

    /// Zeroes the failure counter without touching the rest of the migration record.
    pub fn reset_migration_failures(&self) -> Result<SystemState> {
        self.save_system_state(object(json!({ "migration_failures": 0 })))
    }

    /// Sets or clears the crash-recovery flag.
    pub fn set_update_in_progress(&self, in_progress: bool) -> Result<SystemState> {
        let mut patch = object(json!({ "update_in_progress": in_progress }));
        if in_progress {
            patch.insert("update_started_at".to_string(), json!(now()));
        }
        self.save_system_state(patch)
    }

    /// Whether an update was started and never cleared.
    #[must_use]
    pub fn is_update_in_progress(&self) -> bool {
        self.load_system_state().update_in_progress
    }

    /// Clears the crash-recovery flag.
    pub fn clear_update_in_progress(&self) -> Result<SystemState> {
        self.set_update_in_progress(false)
    }

    /// Marks the start of an update run and records its pre-update backup.
    pub fn begin_update(&self, backup_id: Option<&str>) -> Result<SystemState> {
        self.save_system_state(object(json!({
            "update_in_progress": true,
            "update_started_at": now(),
            "update_backup_id": backup_id,
        })))
    }

    /// Marks an update run finished and records the version it reached.
    pub fn complete_update(&self, installed_version: &str) -> Result<SystemState> {
        self.save_system_state(object(json!({
            "update_in_progress": false,
            "update_completed_at": now(),
            "installed_version": installed_version,
        })))
    }

    /// Records license activation and drops the activation sentinel.
    pub fn record_activation(&self, license_key: &str, licensed_to: &str) -> Result<SystemState> {
        let marker = self.settings.activation_marker();
        if let Some(parent) = marker.parent() {
            std::fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
        }
        std::fs::write(&marker, now()).map_err(|e| Error::io(&marker, e))?;
        self.save_system_state(object(json!({
            "activated": true,
            "activated_at": now(),
            "license_key": license_key,
            "licensed_to": licensed_to,
        })))
    }

    /// Records a completed manual rollback.
    pub fn record_rollback(&self, from: Option<&str>, to: &str) -> Result<SystemState> {
        self.save_system_state(object(json!({
            "last_rollback_at": now(),
            "rollback_from_version": from,
            "rollback_to_version": to,
        })))
    }

    /// Removes the state document and the activation sentinel. The revision
    /// counter stays, so revisions keep increasing across a reset.
    pub fn delete_state_files(&self) -> Result<()> {
        for path in [self.state_path(), self.settings.activation_marker()] {
            match std::fs::remove_file(&path) {
                Ok(()) => info!("Removed {}", path.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(Error::io(&path, e)),
            }
        }
        Ok(())
    }

    /// The installer's metadata document, if present and valid JSON.
    #[must_use]
    pub fn installation_metadata(&self) -> Option<Value> {
        let contents = std::fs::read_to_string(self.settings.installation_metadata()).ok()?;
        serde_json::from_str(&contents).ok()
    }

    /// Computed overview used in diagnostic bundles.
    #[must_use]
    pub fn state_summary(&self) -> Value {
        let state = self.load_system_state();
        let current = self.current_version();
        json!({
            "installed_version": state.installed_version,
            "current_version": current,
            "version_matches": state.installed_version.as_deref() == Some(current.as_str()),
            "installation_type": state.installation_type,
            "activated": state.activated,
            "activation_marker_present": self.has_activation_marker(),
            "update_in_progress": state.update_in_progress,
            "migration_failures": state.migration_failures,
            "last_migration_success": state.last_migration_success,
            "last_rollback_at": state.last_rollback_at,
            "state_revision": state.revision,
            "installation_metadata": self.installation_metadata(),
        })
    }
}
