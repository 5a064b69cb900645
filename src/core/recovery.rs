//! Recovery orchestration.
//!
//! The orchestrator is a small state machine over `update_in_progress` and
//! `migration_failures`. Every entry point performs at most one recovery
//! action and answers with a [`RecoveryOutcome`]; nothing here retries on
//! its own, and automatic migration retries stop at the failure threshold.

use crate::{
    config::{DataStore, Settings},
    core::{
        backup::{BackupManager, BackupSummary},
        cache::CacheStore,
        diagnostics::{DiagnosticExporter, DiagnosticOutcome},
        health::{HealthChecker, HealthReport},
        migrations::MigrationRunner,
        state::{InstallationInfo, InstallationType, StateTracker, SystemState},
    },
};
use chrono::Utc;
use serde::Serialize;
use serde_json::{Map, json};
use std::sync::Arc;
use tracing::{error, info, instrument, warn};

/// What a recovery entry point actually did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    /// Nothing was changed
    None,
    /// The newest backup was restored after an interrupted update
    RestoreBackup,
    /// The migration tool was run again
    RetryMigrations,
    /// A manual rollback restored a backup
    Rollback,
    /// The installation was wiped and rebuilt
    FactoryReset,
}

/// What the operator should do next
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SuggestedAction {
    /// Roll back to a known-good backup
    Rollback,
    /// Try again after the retry cooldown
    RetryLater,
    /// Nothing automatic is left to try
    ContactSupport,
}

/// Structured result of every recovery entry point
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecoveryOutcome {
    /// Whether the installation is now in a good state
    pub success: bool,
    /// Action performed
    pub action_taken: RecoveryAction,
    /// Human-readable result
    pub message: String,
    /// Next step for a human, when automation gives up
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggested_action: Option<SuggestedAction>,
    /// Backup that was restored or created
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup_id: Option<String>,
}

impl RecoveryOutcome {
    fn new(success: bool, action_taken: RecoveryAction, message: impl Into<String>) -> Self {
        Self {
            success,
            action_taken,
            message: message.into(),
            suggested_action: None,
            backup_id: None,
        }
    }

    fn suggest(mut self, action: SuggestedAction) -> Self {
        self.suggested_action = Some(action);
        self
    }

    fn with_backup(mut self, id: impl Into<String>) -> Self {
        self.backup_id = Some(id.into());
        self
    }
}

/// Result of [`Orchestrator::begin_update`]
#[derive(Debug, Clone, Serialize)]
pub struct UpdateStart {
    /// Whether the update may proceed
    pub success: bool,
    /// Human-readable result
    pub message: String,
    /// Verified pre-update backup
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup_id: Option<String>,
    /// State after the update flag was set
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<SystemState>,
}

impl UpdateStart {
    fn refused(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            backup_id: None,
            state: None,
        }
    }
}

/// Result of [`Orchestrator::startup`]
#[derive(Debug, Clone, Serialize)]
pub struct StartupReport {
    /// Classification of this run
    pub installation: InstallationInfo,
    /// Whether a fresh state document was written
    pub state_initialized: bool,
    /// Auto-recovery result, if an interrupted update was found
    pub recovery: Option<RecoveryOutcome>,
    /// Health check results
    pub health: HealthReport,
    /// A critical health check failed
    pub blocking: bool,
}

/// Ties state, backups, migrations, caches and health checks together
#[derive(Debug, Clone)]
pub struct Orchestrator {
    settings: Arc<Settings>,
    store: Arc<DataStore>,
    tracker: StateTracker,
    backups: BackupManager,
    migrations: MigrationRunner,
    health: HealthChecker,
    cache: CacheStore,
}

impl Orchestrator {
    /// Wires every component for one installation.
    #[must_use]
    pub fn new(settings: Arc<Settings>, store: Arc<DataStore>) -> Self {
        Self {
            tracker: StateTracker::new(Arc::clone(&settings), Arc::clone(&store)),
            backups: BackupManager::new(Arc::clone(&settings), Arc::clone(&store)),
            migrations: MigrationRunner::new(Arc::clone(&settings)),
            health: HealthChecker::new(Arc::clone(&settings), Arc::clone(&store)),
            cache: CacheStore::new(settings.cache_dir()),
            settings,
            store,
        }
    }

    /// Installation settings.
    #[must_use]
    pub const fn settings(&self) -> &Arc<Settings> {
        &self.settings
    }

    /// Data store handle.
    #[must_use]
    pub const fn store(&self) -> &Arc<DataStore> {
        &self.store
    }

    /// State tracker.
    #[must_use]
    pub const fn tracker(&self) -> &StateTracker {
        &self.tracker
    }

    /// Backup manager.
    #[must_use]
    pub const fn backups(&self) -> &BackupManager {
        &self.backups
    }

    /// Migration tool runner.
    #[must_use]
    pub const fn migrations(&self) -> &MigrationRunner {
        &self.migrations
    }

    /// Health checker.
    #[must_use]
    pub const fn health(&self) -> &HealthChecker {
        &self.health
    }

    /// Cache store.
    #[must_use]
    pub const fn cache(&self) -> &CacheStore {
        &self.cache
    }

    fn max_failures(&self) -> u32 {
        self.settings.migrations.max_failures
    }

    /// Picks and performs at most one recovery action.
    #[instrument(skip(self))]
    pub async fn attempt_auto_recovery(&self) -> RecoveryOutcome {
        if self.tracker.is_update_in_progress() {
            info!("Interrupted update detected, recovering from backup");
            return self.recover_from_failed_update().await;
        }

        let state = self.tracker.load_system_state();
        let failures = state.migration_failures;
        if failures >= self.max_failures() {
            warn!(
                "{} recorded migration failures, leaving the decision to an operator",
                failures
            );
            return RecoveryOutcome::new(
                false,
                RecoveryAction::None,
                format!(
                    "Migrations failed {failures} times; automatic recovery stopped. Roll back to a backup."
                ),
            )
            .suggest(SuggestedAction::Rollback);
        }
        if failures == 0 {
            return RecoveryOutcome::new(false, RecoveryAction::None, "No recovery needed");
        }

        let cooldown = self.settings.migrations.retry_cooldown_secs;
        if cooldown > 0 {
            if let Some(last) = state.last_migration_at {
                let elapsed = Utc::now().signed_duration_since(last).num_seconds();
                let elapsed = u64::try_from(elapsed).unwrap_or(0);
                if elapsed < cooldown {
                    let wait = cooldown - elapsed;
                    info!("Migration retry deferred for {}s", wait);
                    return RecoveryOutcome::new(
                        false,
                        RecoveryAction::None,
                        format!("Last migration failed {elapsed}s ago; retry in {wait}s"),
                    )
                    .suggest(SuggestedAction::RetryLater);
                }
            }
        }

        self.retry_migrations().await
    }

    /// Takes a verified pre-update backup under the operation lock, then sets
    /// the update flag. Nothing is flagged if the backup fails.
    #[instrument(skip(self))]
    pub async fn begin_update(&self) -> UpdateStart {
        let lock = match self.backups.lock("update") {
            Ok(lock) => lock,
            Err(e) => return UpdateStart::refused(format!("Update not started: {e}")),
        };

        let backup = self.backups.create_backup_locked(&lock).await;
        let Some(backup_id) = backup.backup_id.filter(|_| backup.success) else {
            error!("Pre-update backup failed, update not started");
            return UpdateStart::refused(format!("Update not started: {}", backup.message));
        };
        if let Err(e) = self.backups.verify_backup(&backup_id) {
            error!("Pre-update backup {} did not verify: {}", backup_id, e);
            return UpdateStart::refused(format!("Update not started: {e}"));
        }

        match self.tracker.begin_update(Some(&backup_id)) {
            Ok(state) => {
                info!("Update started; pre-update backup {}", backup_id);
                UpdateStart {
                    success: true,
                    message: format!("Update started; pre-update backup {backup_id}"),
                    backup_id: Some(backup_id),
                    state: Some(state),
                }
            }
            Err(e) => UpdateStart {
                success: false,
                message: format!("Backup {backup_id} taken but the update flag was not set: {e}"),
                backup_id: Some(backup_id),
                state: None,
            },
        }
    }

    /// The update's own backup if it still exists, otherwise the newest.
    fn update_recovery_target(&self) -> Option<BackupSummary> {
        let recorded = self.tracker.load_system_state().update_backup_id;
        if let Some(id) = recorded.as_deref() {
            match self.backups.get_backup(id) {
                Some(backup) => return Some(backup),
                None => warn!("Pre-update backup {} is gone, using the newest backup", id),
            }
        }
        self.backups.list_backups().into_iter().next()
    }

    /// Restores the pre-update backup (or the newest) and clears the
    /// interrupted-update flag.
    #[instrument(skip(self))]
    pub async fn recover_from_failed_update(&self) -> RecoveryOutcome {
        let Some(target) = self.update_recovery_target() else {
            error!("Interrupted update but no backup to restore");
            return RecoveryOutcome::new(
                false,
                RecoveryAction::None,
                "An update was interrupted and no backup is available to recover from",
            )
            .suggest(SuggestedAction::ContactSupport);
        };

        let restored = self.backups.restore_backup(&target.id).await;
        if !restored.success {
            return RecoveryOutcome::new(false, RecoveryAction::RestoreBackup, restored.message)
                .suggest(SuggestedAction::ContactSupport)
                .with_backup(target.id);
        }

        let cleared = self
            .tracker
            .clear_update_in_progress()
            .and_then(|_| self.tracker.reset_migration_failures());
        if let Err(e) = cleared {
            error!("Backup restored but state could not be updated: {}", e);
            return RecoveryOutcome::new(
                false,
                RecoveryAction::RestoreBackup,
                format!("Backup {} restored but state update failed: {e}", target.id),
            )
            .with_backup(target.id);
        }
        self.clear_caches_after("recovery");

        RecoveryOutcome::new(
            true,
            RecoveryAction::RestoreBackup,
            format!("Recovered from interrupted update using backup {}", target.id),
        )
        .with_backup(target.id)
    }

    /// Clears derived caches, runs the migration tool again and records the result.
    #[instrument(skip(self))]
    pub async fn retry_migrations(&self) -> RecoveryOutcome {
        if let Err(e) = self.cache.clear_derived_caches() {
            return RecoveryOutcome::new(
                false,
                RecoveryAction::RetryMigrations,
                format!("Could not clear caches before retrying migrations: {e}"),
            );
        }

        let run = self.migrations.migrate().await;
        if run.succeeded {
            if let Err(e) = self.tracker.mark_migration_success() {
                warn!("Migration succeeded but could not be recorded: {}", e);
            }
            return RecoveryOutcome::new(
                true,
                RecoveryAction::RetryMigrations,
                "Migrations completed successfully",
            );
        }

        let captured = if run.output.trim().is_empty() {
            run.failure_reason.clone().unwrap_or_default()
        } else {
            run.output.trim().to_string()
        };
        let failures = match self.tracker.mark_migration_failed(&captured) {
            Ok(state) => state.migration_failures,
            Err(e) => {
                warn!("Migration failure could not be recorded: {}", e);
                0
            }
        };
        let reason = run.failure_reason.unwrap_or_default();
        let outcome = RecoveryOutcome::new(
            false,
            RecoveryAction::RetryMigrations,
            format!("Migration retry failed ({reason})"),
        );
        if failures >= self.max_failures() {
            outcome.suggest(SuggestedAction::Rollback)
        } else {
            outcome
        }
    }

    fn find_backup(&self, backup_id: Option<&str>) -> Result<BackupSummary, String> {
        match backup_id {
            Some(id) => self
                .backups
                .get_backup(id)
                .ok_or_else(|| format!("Backup not found: {id}")),
            None => self
                .backups
                .list_backups()
                .into_iter()
                .next()
                .ok_or_else(|| "No backups available".to_string()),
        }
    }

    /// Restores a chosen backup, or the newest, and records the rollback.
    #[instrument(skip(self))]
    pub async fn rollback_to_last_good_state(&self, backup_id: Option<&str>) -> RecoveryOutcome {
        let target = match self.find_backup(backup_id) {
            Ok(target) => target,
            Err(message) => return RecoveryOutcome::new(false, RecoveryAction::None, message),
        };
        let from_version = self.tracker.load_system_state().installed_version;

        let restored = self.backups.restore_backup(&target.id).await;
        if !restored.success {
            return RecoveryOutcome::new(false, RecoveryAction::Rollback, restored.message)
                .with_backup(target.id);
        }

        if let Err(e) = self
            .tracker
            .record_rollback(from_version.as_deref(), &target.version)
        {
            warn!("Rollback could not be recorded: {}", e);
        }
        self.clear_caches_after("rollback");
        info!("Rolled back to backup {} (v{})", target.id, target.version);

        RecoveryOutcome::new(
            true,
            RecoveryAction::Rollback,
            format!("Rolled back to backup {} (version {})", target.id, target.version),
        )
        .with_backup(target.id)
    }

    /// Builds a support archive.
    pub async fn export_diagnostic_bundle(&self) -> DiagnosticOutcome {
        DiagnosticExporter::new(
            Arc::clone(&self.settings),
            Arc::clone(&self.store),
            self.tracker.clone(),
            self.health.clone(),
        )
        .export_diagnostic_bundle()
        .await
    }

    /// Wipes and rebuilds the installation after an emergency backup.
    ///
    /// Without `confirmed` nothing is touched.
    #[instrument(skip(self))]
    pub async fn reset_to_factory_defaults(&self, confirmed: bool) -> RecoveryOutcome {
        if !confirmed {
            return RecoveryOutcome::new(
                false,
                RecoveryAction::None,
                "Factory reset requires explicit confirmation",
            );
        }

        let lock = match self.backups.lock("reset") {
            Ok(lock) => lock,
            Err(e) => {
                return RecoveryOutcome::new(
                    false,
                    RecoveryAction::None,
                    format!("Factory reset not started: {e}"),
                )
                .suggest(SuggestedAction::RetryLater);
            }
        };

        let emergency = self.backups.create_backup_locked(&lock).await;
        let Some(backup_id) = emergency.backup_id.filter(|_| emergency.success) else {
            error!("Emergency backup failed, factory reset aborted");
            return RecoveryOutcome::new(
                false,
                RecoveryAction::None,
                format!("Factory reset aborted: {}", emergency.message),
            );
        };
        if let Err(e) = self.backups.verify_backup(&backup_id) {
            error!("Emergency backup {} did not verify, factory reset aborted", backup_id);
            return RecoveryOutcome::new(
                false,
                RecoveryAction::None,
                format!("Factory reset aborted: emergency backup unusable: {e}"),
            );
        }
        warn!("Factory reset starting; emergency backup {}", backup_id);

        if let Err(e) = self.store.disconnect().await {
            warn!("Disconnect before schema rebuild failed: {}", e);
        }
        let run = self.migrations.fresh().await;
        if !run.succeeded {
            let reason = run.failure_reason.unwrap_or_default();
            return RecoveryOutcome::new(
                false,
                RecoveryAction::FactoryReset,
                format!("Schema rebuild failed ({reason}); restore backup {backup_id} to undo"),
            )
            .suggest(SuggestedAction::Rollback)
            .with_backup(backup_id);
        }

        let result = self
            .tracker
            .delete_state_files()
            .and_then(|()| self.cache.clear_derived_caches().map(|_| ()))
            .and_then(|()| {
                self.tracker
                    .initialize_system_state(InstallationType::CleanInstall)
                    .map(|_| ())
            });
        drop(lock);

        match result {
            Ok(()) => {
                info!("Factory reset completed");
                RecoveryOutcome::new(
                    true,
                    RecoveryAction::FactoryReset,
                    format!("Factory reset completed; emergency backup {backup_id}"),
                )
                .with_backup(backup_id)
            }
            Err(e) => RecoveryOutcome::new(
                false,
                RecoveryAction::FactoryReset,
                format!("Factory reset incomplete: {e}"),
            )
            .suggest(SuggestedAction::Rollback)
            .with_backup(backup_id),
        }
    }

    /// Classifies the run, prepares the state document, recovers an
    /// interrupted update and runs the health checks.
    #[instrument(skip(self))]
    pub async fn startup(&self) -> StartupReport {
        let installation = self.tracker.detect_installation_type().await;

        let mut state_initialized = false;
        match installation.kind {
            InstallationType::CleanInstall | InstallationType::ExistingNoState => {
                match self.tracker.initialize_system_state(installation.kind) {
                    Ok(_) => state_initialized = true,
                    Err(e) => error!("Could not initialize system state: {}", e),
                }
            }
            InstallationType::Update => {
                let mut patch = Map::new();
                patch.insert(
                    "installation_type".to_string(),
                    json!(InstallationType::Update),
                );
                if let Err(e) = self.tracker.save_system_state(patch) {
                    warn!("Could not record update detection: {}", e);
                }
            }
            InstallationType::Normal => {}
        }

        let recovery = if self.tracker.is_update_in_progress() {
            Some(self.attempt_auto_recovery().await)
        } else {
            None
        };

        let health = self.run_health().await;
        StartupReport {
            blocking: health.is_blocking(),
            installation,
            state_initialized,
            recovery,
            health,
        }
    }

    async fn run_health(&self) -> HealthReport {
        self.health.run_all_checks().await
    }

    fn clear_caches_after(&self, operation: &str) {
        if let Err(e) = self.cache.clear_derived_caches() {
            warn!("Clearing caches after {} failed: {}", operation, e);
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::core::cache::DerivedCache;
    use crate::errors::Result;
    use crate::test_utils::TestInstallation;

    #[tokio::test]
    async fn test_nothing_to_recover() -> Result<()> {
        let install = TestInstallation::new().await?;
        let outcome = install.orchestrator().attempt_auto_recovery().await;
        assert!(!outcome.success);
        assert_eq!(outcome.action_taken, RecoveryAction::None);
        assert_eq!(outcome.message, "No recovery needed");
        assert!(outcome.suggested_action.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_three_failures_suggest_rollback() -> Result<()> {
        let install = TestInstallation::new().await?;
        let orchestrator = install.orchestrator();
        for _ in 0..3 {
            orchestrator.tracker().mark_migration_failed("SQLSTATE[42S02]")?;
        }

        let outcome = orchestrator.attempt_auto_recovery().await;
        assert!(!outcome.success);
        assert_eq!(outcome.action_taken, RecoveryAction::None);
        assert_eq!(outcome.suggested_action, Some(SuggestedAction::Rollback));
        // The decision is left to a human; nothing was retried.
        assert_eq!(orchestrator.tracker().load_system_state().migration_failures, 3);
        Ok(())
    }

    #[tokio::test]
    async fn test_interrupted_update_restores_newest_backup() -> Result<()> {
        let install = TestInstallation::new().await?;
        let orchestrator = install.orchestrator();
        let tracker = orchestrator.tracker();
        tracker.initialize_system_state(InstallationType::Normal)?;
        let backup = orchestrator.backups().create_backup().await;
        assert!(backup.success, "{}", backup.message);

        tracker.begin_update(None)?;
        tracker.mark_migration_failed("Exception: boom")?;

        let outcome = orchestrator.attempt_auto_recovery().await;
        assert!(outcome.success, "{}", outcome.message);
        assert_eq!(outcome.action_taken, RecoveryAction::RestoreBackup);
        assert_eq!(outcome.backup_id, backup.backup_id);
        assert!(!tracker.is_update_in_progress());
        assert_eq!(tracker.load_system_state().migration_failures, 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_interrupted_update_without_backup_fails() -> Result<()> {
        let install = TestInstallation::new().await?;
        let orchestrator = install.orchestrator();
        orchestrator.tracker().begin_update(None)?;

        let outcome = orchestrator.attempt_auto_recovery().await;
        assert!(!outcome.success);
        assert_eq!(outcome.suggested_action, Some(SuggestedAction::ContactSupport));
        assert!(orchestrator.tracker().is_update_in_progress());
        Ok(())
    }

    #[tokio::test]
    async fn test_retry_success_resets_counter_and_clears_caches() -> Result<()> {
        let install = TestInstallation::new().await?;
        let orchestrator = install.orchestrator();
        orchestrator.tracker().mark_migration_failed("ERROR 1050")?;
        let views = orchestrator.cache().derived_dir(DerivedCache::Views);
        std::fs::create_dir_all(&views).unwrap();
        std::fs::write(views.join("stale.php"), "x").unwrap();

        let outcome = orchestrator.attempt_auto_recovery().await;
        assert!(outcome.success, "{}", outcome.message);
        assert_eq!(outcome.action_taken, RecoveryAction::RetryMigrations);

        let state = orchestrator.tracker().load_system_state();
        assert_eq!(state.migration_failures, 0);
        assert_eq!(state.last_migration_success, Some(true));
        assert_eq!(std::fs::read_dir(&views).unwrap().count(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_retry_counts_marker_failures() -> Result<()> {
        let install = TestInstallation::with_settings(|settings| {
            settings.migrations.args = vec![
                "-c".to_string(),
                "echo 'SQLSTATE[42S01]: Base table or view already exists'".to_string(),
            ];
        })
        .await?;
        let orchestrator = install.orchestrator();
        orchestrator.tracker().mark_migration_failed("first")?;

        let second = orchestrator.attempt_auto_recovery().await;
        assert!(!second.success);
        assert_eq!(second.action_taken, RecoveryAction::RetryMigrations);
        assert!(second.suggested_action.is_none());

        let third = orchestrator.attempt_auto_recovery().await;
        assert_eq!(third.suggested_action, Some(SuggestedAction::Rollback));

        let state = orchestrator.tracker().load_system_state();
        assert_eq!(state.migration_failures, 3);
        assert!(state.last_migration_error.unwrap().contains("already exists"));

        let fourth = orchestrator.attempt_auto_recovery().await;
        assert_eq!(fourth.action_taken, RecoveryAction::None);
        Ok(())
    }

    #[tokio::test]
    async fn test_cooldown_defers_retry() -> Result<()> {
        let install = TestInstallation::with_settings(|settings| {
            settings.migrations.retry_cooldown_secs = 3600;
        })
        .await?;
        let orchestrator = install.orchestrator();
        orchestrator.tracker().mark_migration_failed("ERROR")?;

        let outcome = orchestrator.attempt_auto_recovery().await;
        assert_eq!(outcome.action_taken, RecoveryAction::None);
        assert_eq!(outcome.suggested_action, Some(SuggestedAction::RetryLater));
        assert_eq!(orchestrator.tracker().load_system_state().migration_failures, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_rollback_records_versions() -> Result<()> {
        let install = TestInstallation::new().await?;
        let orchestrator = install.orchestrator();
        let tracker = orchestrator.tracker();
        tracker.initialize_system_state(InstallationType::Normal)?;
        let backup = orchestrator.backups().create_backup().await;
        let id = backup.backup_id.unwrap();

        tracker.complete_update("3.0.0")?;
        let outcome = orchestrator.rollback_to_last_good_state(Some(&id)).await;
        assert!(outcome.success, "{}", outcome.message);
        assert_eq!(outcome.action_taken, RecoveryAction::Rollback);

        let state = tracker.load_system_state();
        assert_eq!(state.rollback_from_version.as_deref(), Some("3.0.0"));
        assert_eq!(state.rollback_to_version.as_deref(), Some("2.1.0"));
        assert!(state.last_rollback_at.is_some());
        assert_eq!(state.installed_version.as_deref(), Some("2.1.0"));
        Ok(())
    }

    #[tokio::test]
    async fn test_rollback_to_unknown_backup_has_no_side_effects() -> Result<()> {
        let install = TestInstallation::new().await?;
        let orchestrator = install.orchestrator();
        let outcome = orchestrator
            .rollback_to_last_good_state(Some("2020-01-01_00-00-00-000_v1.0.0"))
            .await;
        assert!(!outcome.success);
        assert_eq!(outcome.action_taken, RecoveryAction::None);
        assert!(!orchestrator.tracker().has_state_file());

        let newest = orchestrator.rollback_to_last_good_state(None).await;
        assert!(!newest.success);
        assert_eq!(newest.message, "No backups available");
        Ok(())
    }

    #[tokio::test]
    async fn test_unconfirmed_reset_does_nothing() -> Result<()> {
        let install = TestInstallation::new().await?;
        let orchestrator = install.orchestrator();
        orchestrator.tracker().initialize_system_state(InstallationType::Normal)?;
        let state_before = std::fs::read(orchestrator.tracker().state_path()).unwrap();

        let outcome = orchestrator.reset_to_factory_defaults(false).await;
        assert!(!outcome.success);
        assert_eq!(outcome.action_taken, RecoveryAction::None);
        assert!(orchestrator.backups().list_backups().is_empty());
        assert_eq!(
            std::fs::read(orchestrator.tracker().state_path()).unwrap(),
            state_before
        );
        let conn = orchestrator.store().connection().await?;
        assert!(crate::core::schema::table_exists(&conn, "users").await?);
        Ok(())
    }

    #[tokio::test]
    async fn test_confirmed_reset_rebuilds_state() -> Result<()> {
        let install = TestInstallation::new().await?;
        let orchestrator = install.orchestrator();
        let tracker = orchestrator.tracker();
        tracker.initialize_system_state(InstallationType::Normal)?;
        tracker.record_activation("KEY-123", "Shop Ltd")?;
        let revision_before = tracker.mark_migration_failed("ERROR")?.revision;

        let outcome = orchestrator.reset_to_factory_defaults(true).await;
        assert!(outcome.success, "{}", outcome.message);
        assert_eq!(outcome.action_taken, RecoveryAction::FactoryReset);
        let backup_id = outcome.backup_id.unwrap();
        assert!(orchestrator.backups().get_backup(&backup_id).unwrap().has_system_state);

        assert!(!tracker.has_activation_marker());
        let state = tracker.load_system_state();
        assert_eq!(state.installation_type, Some(InstallationType::CleanInstall));
        assert!(!state.activated);
        assert!(state.license_key.is_none());
        assert_eq!(state.migration_failures, 0);
        assert!(state.revision > revision_before);
        Ok(())
    }

    #[tokio::test]
    async fn test_reset_with_zero_retention_keeps_emergency_backup() -> Result<()> {
        let install = TestInstallation::with_settings(|settings| {
            settings.backup.retention = 0;
        })
        .await?;
        let orchestrator = install.orchestrator();
        orchestrator.tracker().initialize_system_state(InstallationType::Normal)?;

        let outcome = orchestrator.reset_to_factory_defaults(true).await;
        assert!(outcome.success, "{}", outcome.message);
        let backup_id = outcome.backup_id.unwrap();
        assert!(orchestrator.backups().verify_backup(&backup_id).is_ok());
        assert_eq!(orchestrator.backups().list_backups().len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_begin_update_takes_verified_backup() -> Result<()> {
        let install = TestInstallation::new().await?;
        let orchestrator = install.orchestrator();
        let tracker = orchestrator.tracker();
        tracker.initialize_system_state(InstallationType::Normal)?;

        let started = orchestrator.begin_update().await;
        assert!(started.success, "{}", started.message);
        let backup_id = started.backup_id.unwrap();
        assert!(orchestrator.backups().verify_backup(&backup_id).is_ok());
        assert!(tracker.is_update_in_progress());
        assert_eq!(
            tracker.load_system_state().update_backup_id.as_deref(),
            Some(backup_id.as_str())
        );
        let lock_file = orchestrator
            .backups()
            .backups_dir()
            .join(crate::core::lock::LOCK_FILE_NAME);
        assert!(!lock_file.exists());

        // A later backup does not displace the pre-update one during recovery.
        let later = orchestrator.backups().create_backup().await;
        assert!(later.success, "{}", later.message);
        let outcome = orchestrator.attempt_auto_recovery().await;
        assert!(outcome.success, "{}", outcome.message);
        assert_eq!(outcome.backup_id.as_deref(), Some(backup_id.as_str()));
        assert!(!tracker.is_update_in_progress());
        Ok(())
    }

    #[tokio::test]
    async fn test_begin_update_refused_when_backup_fails() -> Result<()> {
        let install = TestInstallation::new().await?;
        let orchestrator = install.orchestrator();
        orchestrator.tracker().initialize_system_state(InstallationType::Normal)?;
        orchestrator.store().disconnect().await?;
        std::fs::remove_file(orchestrator.store().embedded_path().unwrap()).unwrap();

        let started = orchestrator.begin_update().await;
        assert!(!started.success);
        assert!(started.backup_id.is_none());
        assert!(!orchestrator.tracker().is_update_in_progress());
        assert!(orchestrator.backups().list_backups().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_begin_update_refused_while_locked() -> Result<()> {
        let install = TestInstallation::new().await?;
        let orchestrator = install.orchestrator();
        let _held = orchestrator.backups().lock("restore")?;

        let started = orchestrator.begin_update().await;
        assert!(!started.success);
        assert!(started.message.contains("in progress"));
        assert!(!orchestrator.tracker().is_update_in_progress());
        Ok(())
    }

    #[tokio::test]
    async fn test_reset_aborts_when_emergency_backup_fails() -> Result<()> {
        let install = TestInstallation::new().await?;
        let orchestrator = install.orchestrator();
        orchestrator.tracker().initialize_system_state(InstallationType::Normal)?;
        orchestrator.store().disconnect().await?;
        let live = orchestrator.store().embedded_path().unwrap().to_path_buf();
        std::fs::remove_file(&live).unwrap();

        let outcome = orchestrator.reset_to_factory_defaults(true).await;
        assert!(!outcome.success);
        assert_eq!(outcome.action_taken, RecoveryAction::None);
        assert!(outcome.message.starts_with("Factory reset aborted"));
        assert!(orchestrator.tracker().has_state_file());
        Ok(())
    }

    #[tokio::test]
    async fn test_startup_initializes_clean_install() -> Result<()> {
        let install = TestInstallation::empty().await?;
        let report = install.orchestrator().startup().await;
        assert_eq!(report.installation.kind, InstallationType::CleanInstall);
        assert!(report.state_initialized);
        assert!(report.recovery.is_none());
        assert!(!report.blocking);
        assert_eq!(report.health.checks.len(), 6);

        let again = install.orchestrator().startup().await;
        assert_eq!(again.installation.kind, InstallationType::Normal);
        assert!(!again.state_initialized);
        Ok(())
    }

    #[tokio::test]
    async fn test_startup_recovers_interrupted_update() -> Result<()> {
        let install = TestInstallation::new().await?;
        let orchestrator = install.orchestrator();
        orchestrator.tracker().initialize_system_state(InstallationType::Normal)?;
        assert!(orchestrator.backups().create_backup().await.success);
        orchestrator.tracker().begin_update(None)?;

        let report = orchestrator.startup().await;
        let recovery = report.recovery.unwrap();
        assert!(recovery.success, "{}", recovery.message);
        assert_eq!(recovery.action_taken, RecoveryAction::RestoreBackup);
        assert!(!orchestrator.tracker().is_update_in_progress());
        Ok(())
    }
}
