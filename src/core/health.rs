//! Startup health checks.
//!
//! Checks run in a fixed order and the sequence stops only when a check is
//! both critical and failed. Non-critical failures are reported and the run
//! continues. A check that passes but has something worth knowing sets
//! `warning`.

use crate::{
    config::{DataStore, Engine, Settings, application},
    core::{cache::CacheStore, schema},
    errors::Result,
};
use chrono::Utc;
use serde::Serialize;
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// Result of one health check
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthCheckResult {
    /// Stable check name
    pub name: String,
    /// Whether the check passed
    pub passed: bool,
    /// A failure of this check blocks startup and halts the sequence
    pub critical: bool,
    /// Passed, but with something the operator should know
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<bool>,
    /// Human-readable result
    pub message: String,
    /// Check-specific details
    #[serde(skip_serializing_if = "Value::is_null")]
    pub data: Value,
}

impl HealthCheckResult {
    fn pass(name: &str, critical: bool, message: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            passed: true,
            critical,
            warning: None,
            message: message.into(),
            data: Value::Null,
        }
    }

    fn fail(name: &str, critical: bool, message: impl Into<String>) -> Self {
        Self {
            passed: false,
            ..Self::pass(name, critical, message)
        }
    }

    fn with_warning(mut self) -> Self {
        self.warning = Some(true);
        self
    }

    fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    /// Failed and critical.
    #[must_use]
    pub const fn is_blocking(&self) -> bool {
        self.critical && !self.passed
    }
}

/// Aggregated counts over a set of results
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HealthSummary {
    /// Checks that ran
    pub total: usize,
    /// Checks that passed
    pub passed: usize,
    /// Checks that failed
    pub failed: usize,
    /// Failed checks marked critical
    pub critical_failures: usize,
    /// Passed checks carrying a warning
    pub warnings: usize,
}

/// Counts passes, failures and critical failures.
#[must_use]
pub fn get_summary(results: &[HealthCheckResult]) -> HealthSummary {
    let passed = results.iter().filter(|r| r.passed).count();
    HealthSummary {
        total: results.len(),
        passed,
        failed: results.len() - passed,
        critical_failures: results.iter().filter(|r| r.is_blocking()).count(),
        warnings: results.iter().filter(|r| r.warning == Some(true)).count(),
    }
}

/// Result of [`HealthChecker::run_all_checks`]
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    /// Every check that ran passed
    pub success: bool,
    /// Results in execution order
    pub checks: Vec<HealthCheckResult>,
    /// Name of the critical check that stopped the sequence
    pub halted_at: Option<String>,
    /// Aggregated counts
    pub summary: HealthSummary,
}

impl HealthReport {
    /// A critical check failed; startup should not proceed.
    #[must_use]
    pub const fn is_blocking(&self) -> bool {
        self.summary.critical_failures > 0
    }
}

#[derive(Debug, Clone, Copy)]
enum Check {
    DatabaseConnection,
    MigrationsTable,
    RequiredTables,
    Configuration,
    StoragePermissions,
    Cache,
}

impl Check {
    const ORDER: [Self; 6] = [
        Self::DatabaseConnection,
        Self::MigrationsTable,
        Self::RequiredTables,
        Self::Configuration,
        Self::StoragePermissions,
        Self::Cache,
    ];
}

/// Runs the startup health checks for one installation
#[derive(Debug, Clone)]
pub struct HealthChecker {
    settings: Arc<Settings>,
    store: Arc<DataStore>,
}

/// The history table is advisory: a missing table or a failed inspection
/// passes with a warning.
fn migrations_table_result(inspected: Result<bool>) -> HealthCheckResult {
    const NAME: &str = "migrations_table";
    match inspected {
        Ok(true) => HealthCheckResult::pass(NAME, false, "Migration history table exists"),
        Ok(false) => HealthCheckResult::pass(
            NAME,
            false,
            "Migration history table not found; migrations have not run yet",
        )
        .with_warning(),
        Err(e) => HealthCheckResult::pass(NAME, false, "Could not inspect migration history")
            .with_warning()
            .with_data(json!({ "error": e.to_string() })),
    }
}

impl HealthChecker {
    /// Creates a checker for the given installation.
    #[must_use]
    pub const fn new(settings: Arc<Settings>, store: Arc<DataStore>) -> Self {
        Self { settings, store }
    }

    /// Runs every check in order, halting after a critical failure.
    #[instrument(skip(self))]
    pub async fn run_all_checks(&self) -> HealthReport {
        let mut checks = Vec::with_capacity(Check::ORDER.len());
        let mut halted_at = None;
        for check in Check::ORDER {
            let result = self.run_check(check).await;
            if !result.passed {
                warn!("Health check {} failed: {}", result.name, result.message);
            }
            let blocking = result.is_blocking();
            let name = result.name.clone();
            checks.push(result);
            if blocking {
                halted_at = Some(name);
                break;
            }
        }

        let summary = get_summary(&checks);
        info!(
            "Health checks: {}/{} passed, {} critical failure(s)",
            summary.passed, summary.total, summary.critical_failures
        );
        HealthReport {
            success: summary.failed == 0,
            checks,
            halted_at,
            summary,
        }
    }

    async fn run_check(&self, check: Check) -> HealthCheckResult {
        match check {
            Check::DatabaseConnection => self.check_database_connection().await,
            Check::MigrationsTable => self.check_migrations_table().await,
            Check::RequiredTables => self.check_required_tables().await,
            Check::Configuration => self.check_configuration(),
            Check::StoragePermissions => self.check_storage_permissions(),
            Check::Cache => self.check_cache(),
        }
    }

    async fn check_database_connection(&self) -> HealthCheckResult {
        const NAME: &str = "database_connection";
        let conn = match self.store.connection().await {
            Ok(conn) => conn,
            Err(e) => return HealthCheckResult::fail(NAME, true, format!("Cannot connect: {e}")),
        };
        match conn.ping().await {
            Ok(()) => HealthCheckResult::pass(NAME, true, "Database connection is healthy")
                .with_data(json!({ "driver": self.store.engine().driver() })),
            Err(e) => HealthCheckResult::fail(NAME, true, format!("Ping failed: {e}")),
        }
    }

    async fn check_migrations_table(&self) -> HealthCheckResult {
        let result = match self.store.connection().await {
            Ok(conn) => schema::table_exists(&conn, schema::HISTORY_TABLE).await,
            Err(e) => Err(e),
        };
        migrations_table_result(result)
    }

    async fn check_required_tables(&self) -> HealthCheckResult {
        const NAME: &str = "required_tables";
        let tables = match self.store.connection().await {
            Ok(conn) => schema::list_tables(&conn).await,
            Err(e) => Err(e),
        };
        let tables = match tables {
            Ok(tables) => tables,
            Err(e) => {
                return HealthCheckResult::fail(NAME, false, format!("Could not list tables: {e}"));
            }
        };
        let missing: Vec<&String> = self
            .settings
            .health
            .required_tables
            .iter()
            .filter(|t| !tables.contains(t))
            .collect();
        if missing.is_empty() {
            HealthCheckResult::pass(NAME, false, "All required tables exist")
        } else {
            HealthCheckResult::fail(
                NAME,
                false,
                format!("{} required table(s) missing", missing.len()),
            )
            .with_data(json!({ "missing": missing }))
        }
    }

    fn check_configuration(&self) -> HealthCheckResult {
        const NAME: &str = "configuration";
        let config_dir = self.settings.config_dir();
        let mut issues = Vec::new();
        for domain in &self.settings.health.required_config_domains {
            match application::load_domain(&config_dir, domain) {
                Ok(table) if table.is_empty() => {
                    issues.push(format!("Configuration domain '{domain}' is empty"));
                }
                Ok(_) => {}
                Err(e) => issues.push(e.to_string()),
            }
        }
        if application::app_key(&config_dir).is_none() {
            issues.push("Application key is not set".to_string());
        }
        if let Engine::Embedded { path } = self.store.engine() {
            if path.as_os_str().is_empty() || path.file_name().is_none() {
                issues.push("Embedded database path is not set".to_string());
            }
        }

        if issues.is_empty() {
            HealthCheckResult::pass(NAME, true, "Configuration is complete")
        } else {
            HealthCheckResult::fail(
                NAME,
                true,
                format!("{} configuration issue(s) found", issues.len()),
            )
            .with_data(json!({ "issues": issues }))
        }
    }

    fn check_storage_permissions(&self) -> HealthCheckResult {
        const NAME: &str = "storage_permissions";
        let probe_name = format!(".write_probe_{}", std::process::id());
        let mut issues = Vec::new();
        for relative in &self.settings.health.required_directories {
            let dir = self.settings.resolve(relative);
            if let Err(e) = std::fs::create_dir_all(&dir) {
                issues.push(format!("{}: cannot create ({e})", relative.display()));
                continue;
            }
            let probe = dir.join(&probe_name);
            match std::fs::write(&probe, b"ok") {
                Ok(()) => {
                    let _ = std::fs::remove_file(&probe);
                }
                Err(e) => issues.push(format!("{}: not writable ({e})", relative.display())),
            }
        }
        if issues.is_empty() {
            HealthCheckResult::pass(NAME, false, "All storage directories are writable")
        } else {
            HealthCheckResult::fail(
                NAME,
                false,
                format!("{} storage director(ies) unusable", issues.len()),
            )
            .with_data(json!({ "issues": issues }))
        }
    }

    fn check_cache(&self) -> HealthCheckResult {
        const NAME: &str = "cache";
        let cache = CacheStore::new(self.settings.cache_dir());
        let stamp = Utc::now().timestamp_nanos_opt().unwrap_or_default();
        let key = format!("health_check_{}_{stamp}", std::process::id());
        let value = format!("probe-{stamp}");

        let round_trip = cache
            .put(&key, &value)
            .and_then(|()| cache.get(&key))
            .and_then(|read| cache.forget(&key).map(|_| read));
        match round_trip {
            Ok(Some(read)) if read == value => {
                HealthCheckResult::pass(NAME, false, "Cache read/write works")
            }
            Ok(_) => HealthCheckResult::fail(NAME, false, "Cache returned a different value"),
            Err(e) => HealthCheckResult::fail(NAME, false, format!("Cache unusable: {e}")),
        }
    }
}
