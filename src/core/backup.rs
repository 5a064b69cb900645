//! Backup and restore.
//!
//! A backup is a directory `<backups-root>/<timestamp>_v<version>/` holding
//! the database artifact and its checksum, a full copy of the configuration
//! directory, an optional copy of the state document and `manifest.json`. A
//! backup is valid only while its checksum matches the artifact and its
//! manifest exists; creation verifies this before reporting success and
//! restore re-verifies it before touching anything live.
//!
//! Create, restore and delete take the installation's operation lock.

use crate::{
    config::{DataStore, Settings},
    core::{
        artifact, host,
        host::RuntimeFacts,
        lock::OperationLock,
        version,
    },
    errors::{Error, Result},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};
use walkdir::WalkDir;

/// Manifest file name inside every backup.
pub const MANIFEST_FILE: &str = "manifest.json";
/// Configuration tree copy inside every backup.
pub const CONFIG_DIR_NAME: &str = "config";
/// State document copy inside a backup.
pub const STATE_FILE_NAME: &str = "system_state.json";

/// Relative artifact paths recorded in the manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupPaths {
    /// Database artifact
    pub database: String,
    /// Checksum sibling of the database artifact
    pub checksum: String,
    /// Configuration tree
    pub config: String,
    /// State document, absent before first activation
    pub system_state: Option<String>,
}

/// `manifest.json`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupManifest {
    /// Directory name of the backup
    pub backup_id: String,
    /// When the backup was taken
    pub created_at: DateTime<Utc>,
    /// Application version at backup time
    pub version: String,
    /// Engine the artifact came from
    pub driver: String,
    /// Host runtime at backup time
    pub runtime: RuntimeFacts,
    /// Artifact locations relative to the backup directory
    pub backup_paths: BackupPaths,
    /// Byte size per artifact (`database`, `config`, `system_state`)
    pub file_sizes: BTreeMap<String, u64>,
}

/// Result of [`BackupManager::create_backup`]
#[derive(Debug, Clone, Serialize)]
pub struct BackupOutcome {
    /// Whether a verified backup now exists
    pub success: bool,
    /// Id of the new backup
    pub backup_id: Option<String>,
    /// Human-readable result
    pub message: String,
    /// Backup directory
    pub directory: Option<PathBuf>,
    /// Artifact paths inside the directory
    pub paths: Option<BackupPaths>,
}

impl BackupOutcome {
    fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            backup_id: None,
            message: message.into(),
            directory: None,
            paths: None,
        }
    }
}

/// `{success, message}` result of restore and delete
#[derive(Debug, Clone, Serialize)]
pub struct ActionOutcome {
    /// Whether the action completed
    pub success: bool,
    /// Human-readable result
    pub message: String,
}

impl ActionOutcome {
    fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

/// Result of [`BackupManager::clean_old_backups`]
#[derive(Debug, Clone, Serialize)]
pub struct CleanupOutcome {
    /// Whether pruning completed
    pub success: bool,
    /// Human-readable result
    pub message: String,
    /// Ids that were deleted
    pub removed: Vec<String>,
}

/// One entry of [`BackupManager::list_backups`]
#[derive(Debug, Clone, Serialize)]
pub struct BackupSummary {
    /// Backup id
    pub id: String,
    /// When it was taken
    pub created_at: DateTime<Utc>,
    /// Application version it captured
    pub version: String,
    /// Engine the artifact came from
    pub driver: String,
    /// Total bytes on disk
    pub size_bytes: u64,
    /// Backup directory
    pub path: PathBuf,
    /// Whether a state document was captured
    pub has_system_state: bool,
}

/// Creates, verifies, lists, prunes and restores backups
#[derive(Debug, Clone)]
pub struct BackupManager {
    settings: Arc<Settings>,
    store: Arc<DataStore>,
}

/// Copies a directory tree, skipping symlinks.
pub(crate) fn copy_tree(src: &Path, dst: &Path) -> Result<u64> {
    std::fs::create_dir_all(dst).map_err(|e| Error::io(dst, e))?;
    let mut bytes = 0;
    for entry in WalkDir::new(src).follow_links(false) {
        let entry = entry?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| Error::config(format!("Unexpected path during copy: {e}")))?;
        let target = dst.join(relative);
        let file_type = entry.file_type();
        if file_type.is_dir() {
            std::fs::create_dir_all(&target).map_err(|e| Error::io(&target, e))?;
        } else if file_type.is_file() {
            bytes += std::fs::copy(entry.path(), &target).map_err(|e| Error::io(&target, e))?;
        } else {
            debug!("Skipping non-regular file {}", entry.path().display());
        }
    }
    Ok(bytes)
}

fn tree_size(path: &Path) -> u64 {
    WalkDir::new(path)
        .into_iter()
        .filter_map(std::result::Result::ok)
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum()
}

fn file_size(path: &Path) -> Result<u64> {
    Ok(std::fs::metadata(path).map_err(|e| Error::io(path, e))?.len())
}

fn sanitize_version(version: &str) -> String {
    version
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect()
}

/// Whether `name` looks like a backup directory name.
#[must_use]
pub fn is_backup_id(name: &str) -> bool {
    name.starts_with(|c: char| c.is_ascii_digit())
        && name.contains("_v")
        && !name.contains(['/', '\\'])
        && !name.contains("..")
}

fn require_backup_id(id: &str) -> Result<()> {
    if is_backup_id(id) {
        Ok(())
    } else {
        Err(Error::BackupNotFound { id: id.to_string() })
    }
}

fn remove_dir_if_exists(path: &Path) -> Result<()> {
    match std::fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::io(path, e)),
    }
}

fn config_snapshot_path(live: &Path) -> PathBuf {
    let mut name = live.as_os_str().to_os_string();
    name.push("_before_restore");
    PathBuf::from(name)
}

/// Loads and checks a backup directory: manifest present, checksum matching,
/// configuration tree present.
pub fn verify_backup_dir(dir: &Path) -> Result<BackupManifest> {
    let manifest_path = dir.join(MANIFEST_FILE);
    let raw = std::fs::read_to_string(&manifest_path)
        .map_err(|e| Error::integrity(format!("manifest missing or unreadable: {e}")))?;
    let manifest: BackupManifest = serde_json::from_str(&raw)
        .map_err(|e| Error::integrity(format!("manifest is invalid: {e}")))?;

    let artifact_path = dir.join(&manifest.backup_paths.database);
    let checksum_path = dir.join(&manifest.backup_paths.checksum);
    let recorded = artifact::read_checksum(&checksum_path)
        .map_err(|e| Error::integrity(format!("checksum unavailable: {e}")))?;
    let actual = artifact::checksum_file(&artifact_path)
        .map_err(|e| Error::integrity(format!("database artifact unreadable: {e}")))?;
    if recorded != actual {
        return Err(Error::integrity(format!(
            "checksum mismatch for {} (recorded {recorded}, computed {actual})",
            manifest.backup_paths.database
        )));
    }
    if !dir.join(&manifest.backup_paths.config).is_dir() {
        return Err(Error::integrity("configuration copy missing"));
    }
    Ok(manifest)
}

impl BackupManager {
    /// Creates a manager for the given installation.
    #[must_use]
    pub const fn new(settings: Arc<Settings>, store: Arc<DataStore>) -> Self {
        Self { settings, store }
    }

    /// Backups root.
    #[must_use]
    pub fn backups_dir(&self) -> PathBuf {
        self.settings.backups_dir()
    }

    /// Takes the installation's operation lock.
    pub fn lock(&self, operation: &str) -> Result<OperationLock> {
        OperationLock::acquire(
            &self.backups_dir(),
            operation,
            Duration::from_secs(self.settings.backup.lock_stale_after_secs),
        )
    }

    /// Free space on the backup volume meets `required_mb`. An unknown
    /// volume is assumed to have room.
    #[must_use]
    pub fn has_enough_disk_space(&self, required_mb: u64) -> bool {
        if required_mb == 0 {
            return true;
        }
        match host::available_space_mb(&self.backups_dir()) {
            Some(available) => available >= required_mb,
            None => {
                warn!("Could not determine free space for the backup volume");
                true
            }
        }
    }

    /// Creates a verified backup, then prunes beyond the retention count.
    #[instrument(skip(self))]
    pub async fn create_backup(&self) -> BackupOutcome {
        match self.lock("backup") {
            Ok(lock) => self.create_backup_locked(&lock).await,
            Err(e) => BackupOutcome::failed(format!("Backup not started: {e}")),
        }
    }

    /// [`Self::create_backup`] for a caller already holding the operation lock.
    pub async fn create_backup_locked(&self, _lock: &OperationLock) -> BackupOutcome {
        let required = self.settings.backup.required_free_mb;
        if !self.has_enough_disk_space(required) {
            let available = host::available_space_mb(&self.backups_dir()).unwrap_or(0);
            let e = Error::InsufficientDiskSpace {
                required_mb: required,
                available_mb: available,
            };
            error!("{}", e);
            return BackupOutcome::failed(format!("Backup not started: {e}"));
        }

        let (backup_id, dir) = match self.allocate_backup_dir() {
            Ok(allocated) => allocated,
            Err(e) => {
                error!("Could not create backup directory: {}", e);
                return BackupOutcome::failed(format!("Backup failed: {e}"));
            }
        };

        match self.populate_backup(&backup_id, &dir).await {
            Ok(manifest) => {
                info!("Backup {} created and verified", backup_id);
                if let Err(e) =
                    self.prune_keeping(self.settings.backup.retention, Some(&backup_id))
                {
                    warn!("Pruning after backup failed: {}", e);
                }
                BackupOutcome {
                    success: true,
                    backup_id: Some(backup_id.clone()),
                    message: format!("Backup {backup_id} created successfully"),
                    directory: Some(dir),
                    paths: Some(manifest.backup_paths),
                }
            }
            Err(e) => {
                error!("Backup {} failed: {}", backup_id, e);
                if let Err(cleanup) = remove_dir_if_exists(&dir) {
                    error!("Could not remove incomplete backup {}: {}", backup_id, cleanup);
                }
                BackupOutcome::failed(format!("Backup failed: {e}"))
            }
        }
    }

    fn allocate_backup_dir(&self) -> Result<(String, PathBuf)> {
        let root = self.backups_dir();
        std::fs::create_dir_all(&root).map_err(|e| Error::io(&root, e))?;
        let version = sanitize_version(&version::resolve_current_version(
            &self.settings.config_dir(),
            &self.settings.package_descriptor(),
        ));

        let mut last_err = None;
        for _ in 0..5 {
            let id = format!("{}_v{version}", Utc::now().format("%Y-%m-%d_%H-%M-%S-%3f"));
            let dir = root.join(&id);
            match std::fs::create_dir(&dir) {
                Ok(()) => return Ok((id, dir)),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    last_err = Some(Error::io(&dir, e));
                    std::thread::sleep(Duration::from_millis(2));
                }
                Err(e) => return Err(Error::io(&dir, e)),
            }
        }
        Err(last_err.unwrap_or_else(|| Error::config("Could not allocate a backup id")))
    }

    async fn populate_backup(&self, backup_id: &str, dir: &Path) -> Result<BackupManifest> {
        let engine = self.store.engine();
        let database_name = format!("database.{}", engine.artifact_extension());
        let database_path = dir.join(&database_name);
        artifact::export_database(&self.store, &database_path).await?;
        artifact::write_checksum(&database_path)?;
        let checksum_name = format!("{database_name}.{}", artifact::CHECKSUM_SUFFIX);

        let config_src = self.settings.config_dir();
        let config_dst = dir.join(CONFIG_DIR_NAME);
        let config_bytes = copy_tree(&config_src, &config_dst)?;

        let mut file_sizes = BTreeMap::new();
        file_sizes.insert("database".to_string(), file_size(&database_path)?);
        file_sizes.insert("config".to_string(), config_bytes);

        let state_src = self.settings.state_file();
        let system_state = if state_src.is_file() {
            let state_dst = dir.join(STATE_FILE_NAME);
            let bytes = std::fs::copy(&state_src, &state_dst).map_err(|e| Error::io(&state_dst, e))?;
            file_sizes.insert("system_state".to_string(), bytes);
            Some(STATE_FILE_NAME.to_string())
        } else {
            debug!("No state document to back up");
            None
        };

        let manifest = BackupManifest {
            backup_id: backup_id.to_string(),
            created_at: Utc::now(),
            version: version::resolve_current_version(
                &config_src,
                &self.settings.package_descriptor(),
            ),
            driver: engine.driver().to_string(),
            runtime: RuntimeFacts::current(),
            backup_paths: BackupPaths {
                database: database_name,
                checksum: checksum_name,
                config: CONFIG_DIR_NAME.to_string(),
                system_state,
            },
            file_sizes,
        };
        let manifest_path = dir.join(MANIFEST_FILE);
        std::fs::write(&manifest_path, serde_json::to_string_pretty(&manifest)?)
            .map_err(|e| Error::io(&manifest_path, e))?;

        verify_backup_dir(dir)
    }

    fn backup_dir(&self, id: &str) -> Result<PathBuf> {
        require_backup_id(id)?;
        let dir = self.backups_dir().join(id);
        if dir.is_dir() {
            Ok(dir)
        } else {
            Err(Error::BackupNotFound { id: id.to_string() })
        }
    }

    /// Re-verifies a stored backup without restoring it.
    pub fn verify_backup(&self, id: &str) -> Result<BackupManifest> {
        verify_backup_dir(&self.backup_dir(id)?)
    }

    /// Restores database, configuration and (if captured) the state document.
    #[instrument(skip(self))]
    pub async fn restore_backup(&self, id: &str) -> ActionOutcome {
        let lock = match self.lock("restore") {
            Ok(lock) => lock,
            Err(e) => return ActionOutcome::failed(format!("Restore not started: {e}")),
        };
        let result = self.restore_locked(id, &lock).await;
        drop(lock);
        match result {
            Ok(()) => {
                info!("Backup {} restored", id);
                ActionOutcome::ok(format!("Backup {id} restored successfully"))
            }
            Err(e) => {
                error!("Restore of {} failed: {}", id, e);
                ActionOutcome::failed(format!("Restore failed: {e}"))
            }
        }
    }

    async fn restore_locked(&self, id: &str, _lock: &OperationLock) -> Result<()> {
        let dir = self.backup_dir(id)?;
        let manifest = verify_backup_dir(&dir)?;

        artifact::restore_database(
            &self.store,
            &dir.join(&manifest.backup_paths.database),
            &self.backups_dir(),
        )
        .await?;

        if let Err(e) = self.restore_files(&dir, &manifest) {
            error!("Restore of {} failed after the database was replaced, putting it back", id);
            if let Err(back) = artifact::undo_restore(&self.store, &self.backups_dir()).await {
                error!("Putting the database back failed: {}", back);
            }
            return Err(e);
        }
        Ok(())
    }

    /// Configuration tree, then the state document. A failed state copy puts
    /// the configuration snapshot back.
    fn restore_files(&self, dir: &Path, manifest: &BackupManifest) -> Result<()> {
        let config_live = self.settings.config_dir();
        restore_config_tree(&dir.join(&manifest.backup_paths.config), &config_live)?;

        if let Some(state_name) = &manifest.backup_paths.system_state {
            if let Err(e) = restore_state_file(&dir.join(state_name), &self.settings.state_file())
            {
                error!("Copying the state document failed, putting configuration back");
                if let Err(back) = put_back_config_snapshot(&config_live) {
                    error!("Putting configuration back failed: {}", back);
                }
                return Err(e);
            }
        }
        Ok(())
    }

    fn read_summary(&self, dir: &Path) -> Option<BackupSummary> {
        let raw = std::fs::read_to_string(dir.join(MANIFEST_FILE)).ok()?;
        let manifest: BackupManifest = match serde_json::from_str(&raw) {
            Ok(manifest) => manifest,
            Err(e) => {
                warn!("Ignoring backup with invalid manifest {}: {}", dir.display(), e);
                return None;
            }
        };
        Some(BackupSummary {
            id: dir.file_name()?.to_string_lossy().into_owned(),
            created_at: manifest.created_at,
            version: manifest.version,
            driver: manifest.driver,
            size_bytes: tree_size(dir),
            path: dir.to_path_buf(),
            has_system_state: manifest.backup_paths.system_state.is_some(),
        })
    }

    fn backup_ids_newest_first(&self) -> Result<Vec<String>> {
        let root = self.backups_dir();
        let entries = match std::fs::read_dir(&root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::io(&root, e)),
        };
        let mut ids: Vec<String> = entries
            .filter_map(std::result::Result::ok)
            .filter(|entry| entry.file_type().is_ok_and(|t| t.is_dir()))
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .filter(|name| is_backup_id(name))
            .collect();
        ids.sort_unstable_by(|a, b| b.cmp(a));
        Ok(ids)
    }

    /// Backups with a readable manifest, newest first.
    #[must_use]
    pub fn list_backups(&self) -> Vec<BackupSummary> {
        let ids = self.backup_ids_newest_first().unwrap_or_else(|e| {
            warn!("Could not list backups: {}", e);
            Vec::new()
        });
        let root = self.backups_dir();
        let mut backups: Vec<BackupSummary> = ids
            .iter()
            .filter_map(|id| self.read_summary(&root.join(id)))
            .collect();
        backups.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
        backups
    }

    /// One backup by id.
    #[must_use]
    pub fn get_backup(&self, id: &str) -> Option<BackupSummary> {
        let dir = self.backup_dir(id).ok()?;
        self.read_summary(&dir)
    }

    /// Deletes one backup.
    #[instrument(skip(self))]
    pub fn delete_backup(&self, id: &str) -> ActionOutcome {
        let result = self.backup_dir(id).and_then(|dir| {
            let _lock = self.lock("delete")?;
            remove_dir_if_exists(&dir)
        });
        match result {
            Ok(()) => {
                info!("Backup {} deleted", id);
                ActionOutcome::ok(format!("Backup {id} deleted"))
            }
            Err(e) => ActionOutcome::failed(format!("Delete failed: {e}")),
        }
    }

    /// Keeps the `keep` newest backups by id and removes the rest.
    pub fn prune_old_backups(&self, keep: usize) -> Result<Vec<String>> {
        self.prune_keeping(keep, None)
    }

    /// [`Self::prune_old_backups`] that never removes `protected`.
    fn prune_keeping(&self, keep: usize, protected: Option<&str>) -> Result<Vec<String>> {
        let ids = self.backup_ids_newest_first()?;
        let root = self.backups_dir();
        let mut removed = Vec::new();
        for id in ids
            .into_iter()
            .skip(keep)
            .filter(|id| Some(id.as_str()) != protected)
        {
            remove_dir_if_exists(&root.join(&id))?;
            info!("Pruned old backup {}", id);
            removed.push(id);
        }
        Ok(removed)
    }

    /// On-demand trim down to `keep` backups.
    pub fn clean_old_backups(&self, keep: usize) -> CleanupOutcome {
        match self.prune_old_backups(keep) {
            Ok(removed) => CleanupOutcome {
                success: true,
                message: format!("Removed {} old backup(s)", removed.len()),
                removed,
            },
            Err(e) => CleanupOutcome {
                success: false,
                message: format!("Cleanup failed: {e}"),
                removed: Vec::new(),
            },
        }
    }
}

fn restore_state_file(src: &Path, live: &Path) -> Result<()> {
    if let Some(parent) = live.parent() {
        std::fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
    }
    let staged = live.with_extension("json.restoring");
    if let Err(e) = std::fs::copy(src, &staged) {
        let _ = std::fs::remove_file(&staged);
        return Err(Error::io(&staged, e));
    }
    std::fs::rename(&staged, live).map_err(|e| Error::io(live, e))
}

/// Replaces the live configuration tree with its `_before_restore` snapshot.
fn put_back_config_snapshot(live: &Path) -> Result<()> {
    let snapshot = config_snapshot_path(live);
    remove_dir_if_exists(live)?;
    if !snapshot.is_dir() {
        // No configuration existed before the restore.
        return Ok(());
    }
    copy_tree(&snapshot, live).map(|_| ())
}

/// Replaces the live configuration tree with `src`, snapshotting the live
/// tree to `<config>_before_restore` and putting it back on failure.
fn restore_config_tree(src: &Path, live: &Path) -> Result<()> {
    let snapshot = config_snapshot_path(live);
    remove_dir_if_exists(&snapshot)?;
    let had_live = live.is_dir();
    if had_live {
        copy_tree(live, &snapshot)?;
    }
    remove_dir_if_exists(live)?;

    if let Err(e) = copy_tree(src, live) {
        error!("Copying configuration failed, putting snapshot back: {}", e);
        let _ = remove_dir_if_exists(live);
        if had_live {
            if let Err(back) = copy_tree(&snapshot, live) {
                error!("Restoring configuration snapshot failed: {}", back);
            }
        }
        return Err(e);
    }
    Ok(())
}
