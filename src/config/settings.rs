//! Settings for the lifecycle manager itself.
//!
//! Settings come from a single TOML file (`stateward.toml` by default, or the
//! path in `STATEWARD_CONFIG`). Every path inside it is relative to `root`,
//! and a relative `root` is resolved against the directory holding the
//! settings file. Only `[database]` is mandatory.

use crate::errors::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Settings file looked up when `STATEWARD_CONFIG` is not set.
pub const DEFAULT_SETTINGS_FILE: &str = "stateward.toml";

/// Environment variable naming an alternative settings file.
pub const SETTINGS_ENV_VAR: &str = "STATEWARD_CONFIG";

/// Top-level settings document
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Installation root every relative path resolves against
    #[serde(default = "default_root")]
    pub root: PathBuf,
    /// Layout of the installation
    #[serde(default)]
    pub paths: PathSettings,
    /// Data store engine and location
    pub database: DatabaseSettings,
    /// Backup retention and safety thresholds
    #[serde(default)]
    pub backup: BackupSettings,
    /// External schema migration tool
    #[serde(default)]
    pub migrations: MigrationSettings,
    /// Health check expectations
    #[serde(default)]
    pub health: HealthSettings,
    /// Diagnostic bundle options
    #[serde(default)]
    pub diagnostics: DiagnosticSettings,
}

fn default_root() -> PathBuf {
    PathBuf::from(".")
}

/// Installation layout, relative to [`Settings::root`]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PathSettings {
    /// Application configuration directory, copied into every backup
    pub config_dir: PathBuf,
    /// Persisted `SystemState` document
    pub state_file: PathBuf,
    /// Presence-only activation sentinel
    pub activation_marker: PathBuf,
    /// Installer-written metadata (read-only here)
    pub installation_metadata: PathBuf,
    /// Package descriptor used as a version fallback
    pub package_descriptor: PathBuf,
    /// Where backup directories live
    pub backups_dir: PathBuf,
    /// Application log directory
    pub logs_dir: PathBuf,
    /// Primary application log, tailed into diagnostic bundles
    pub primary_log: PathBuf,
    /// Root of the derived caches and the key/value cache
    pub cache_dir: PathBuf,
    /// Where diagnostic archives are written
    pub diagnostics_dir: PathBuf,
}

impl Default for PathSettings {
    fn default() -> Self {
        Self {
            config_dir: PathBuf::from("config"),
            state_file: PathBuf::from("storage/app/system_state.json"),
            activation_marker: PathBuf::from("storage/app/.activated"),
            installation_metadata: PathBuf::from("storage/app/installation.json"),
            package_descriptor: PathBuf::from("package.json"),
            backups_dir: PathBuf::from("storage/backups"),
            logs_dir: PathBuf::from("storage/logs"),
            primary_log: PathBuf::from("storage/logs/app.log"),
            cache_dir: PathBuf::from("storage/framework/cache"),
            diagnostics_dir: PathBuf::from("storage/diagnostics"),
        }
    }
}

/// Which engine holds the application's data
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "driver", rename_all = "lowercase")]
pub enum DatabaseSettings {
    /// Embedded single-file engine, backed up by file copy
    Sqlite {
        /// Database file, relative to the installation root
        path: PathBuf,
    },
    /// Server engine, backed up with the external dump utility
    Mysql(MysqlSettings),
}

/// Connection and tooling details for a MySQL server
#[derive(Debug, Clone, Deserialize)]
pub struct MysqlSettings {
    /// Server host
    #[serde(default = "default_mysql_host")]
    pub host: String,
    /// Server port
    #[serde(default = "default_mysql_port")]
    pub port: u16,
    /// Schema name
    pub database: String,
    /// Login user
    pub username: String,
    /// Login password
    #[serde(default)]
    pub password: String,
    /// Explicit path to `mysqldump`; falls back to the bare name on `PATH`
    #[serde(default)]
    pub dump_binary: Option<PathBuf>,
    /// Explicit path to the `mysql` client; falls back to the bare name on `PATH`
    #[serde(default)]
    pub client_binary: Option<PathBuf>,
}

fn default_mysql_host() -> String {
    "127.0.0.1".to_string()
}

const fn default_mysql_port() -> u16 {
    3306
}

/// Backup retention and guard rails
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackupSettings {
    /// How many backups survive the automatic post-create prune
    pub retention: usize,
    /// Free space required on the backup volume before starting
    pub required_free_mb: u64,
    /// Age after which an operation lock is considered abandoned
    pub lock_stale_after_secs: u64,
}

impl Default for BackupSettings {
    fn default() -> Self {
        Self {
            retention: 10,
            required_free_mb: 100,
            lock_stale_after_secs: 3600,
        }
    }
}

/// External schema migration tool
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MigrationSettings {
    /// Program to run
    pub program: String,
    /// Arguments for a forced, non-interactive migration run
    pub args: Vec<String>,
    /// Arguments for a drop-and-recreate run (factory reset)
    pub fresh_args: Vec<String>,
    /// Output substrings that mean the run failed, whatever the exit code
    pub failure_markers: Vec<String>,
    /// Recorded failures after which auto-recovery stops retrying
    pub max_failures: u32,
    /// Minimum seconds between an automatic retry and the last failure (0 disables)
    pub retry_cooldown_secs: u64,
}

impl Default for MigrationSettings {
    fn default() -> Self {
        Self {
            program: "migrate".to_string(),
            args: vec!["--force".to_string(), "--no-interaction".to_string()],
            fresh_args: vec![
                "fresh".to_string(),
                "--force".to_string(),
                "--no-interaction".to_string(),
            ],
            failure_markers: ["FAIL", "ERROR", "Exception", "SQLSTATE["]
                .iter()
                .map(ToString::to_string)
                .collect(),
            max_failures: 3,
            retry_cooldown_secs: 0,
        }
    }
}

/// What the startup health checks expect to find
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HealthSettings {
    /// Business tables that should exist once migrations ran
    pub required_tables: Vec<String>,
    /// Configuration domains that must load and be non-empty
    pub required_config_domains: Vec<String>,
    /// Directories that must exist and be writable, relative to root
    pub required_directories: Vec<PathBuf>,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            required_tables: [
                "users",
                "categories",
                "products",
                "customers",
                "orders",
                "order_items",
            ]
            .iter()
            .map(ToString::to_string)
            .collect(),
            required_config_domains: vec!["app".to_string(), "database".to_string()],
            required_directories: [
                "storage/app",
                "storage/logs",
                "storage/backups",
                "storage/framework/cache",
                "storage/framework/views",
            ]
            .iter()
            .map(PathBuf::from)
            .collect(),
        }
    }
}

/// Diagnostic bundle options
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DiagnosticSettings {
    /// Lines kept from the end of the primary log
    pub log_tail_lines: usize,
}

impl Default for DiagnosticSettings {
    fn default() -> Self {
        Self {
            log_tail_lines: 5000,
        }
    }
}

impl Settings {
    /// Resolves a path from the settings against the installation root.
    #[must_use]
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }

    /// Application configuration directory
    #[must_use]
    pub fn config_dir(&self) -> PathBuf {
        self.resolve(&self.paths.config_dir)
    }

    /// `SystemState` document
    #[must_use]
    pub fn state_file(&self) -> PathBuf {
        self.resolve(&self.paths.state_file)
    }

    /// Activation sentinel
    #[must_use]
    pub fn activation_marker(&self) -> PathBuf {
        self.resolve(&self.paths.activation_marker)
    }

    /// Installer metadata document
    #[must_use]
    pub fn installation_metadata(&self) -> PathBuf {
        self.resolve(&self.paths.installation_metadata)
    }

    /// Package descriptor
    #[must_use]
    pub fn package_descriptor(&self) -> PathBuf {
        self.resolve(&self.paths.package_descriptor)
    }

    /// Backups root
    #[must_use]
    pub fn backups_dir(&self) -> PathBuf {
        self.resolve(&self.paths.backups_dir)
    }

    /// Log directory
    #[must_use]
    pub fn logs_dir(&self) -> PathBuf {
        self.resolve(&self.paths.logs_dir)
    }

    /// Primary application log
    #[must_use]
    pub fn primary_log(&self) -> PathBuf {
        self.resolve(&self.paths.primary_log)
    }

    /// Cache root
    #[must_use]
    pub fn cache_dir(&self) -> PathBuf {
        self.resolve(&self.paths.cache_dir)
    }

    /// Diagnostic archive directory
    #[must_use]
    pub fn diagnostics_dir(&self) -> PathBuf {
        self.resolve(&self.paths.diagnostics_dir)
    }
}

/// Parses settings from TOML text, resolving a relative root against `base`.
pub fn parse_settings(contents: &str, base: &Path) -> Result<Settings> {
    let mut settings: Settings = toml::from_str(contents).map_err(|e| Error::Config {
        message: format!("Failed to parse settings: {e}"),
    })?;
    if settings.root.is_relative() {
        settings.root = base.join(&settings.root);
    }
    Ok(settings)
}

/// Loads settings from a TOML file
///
/// # Errors
/// Returns an error if the file cannot be read, the TOML is invalid or the
/// `[database]` section is missing.
pub fn load_settings<P: AsRef<Path>>(path: P) -> Result<Settings> {
    let path_ref = path.as_ref();
    tracing::debug!("Attempting to load settings from: {:?}", path_ref);
    let contents = std::fs::read_to_string(path_ref).map_err(|e| Error::Config {
        message: format!("Failed to read settings file {}: {e}", path_ref.display()),
    })?;
    let base = path_ref
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    parse_settings(&contents, base)
}

/// Loads settings from `STATEWARD_CONFIG`, or `./stateward.toml` when unset.
pub fn load_default_settings() -> Result<Settings> {
    let path = std::env::var(SETTINGS_ENV_VAR).unwrap_or_else(|_| DEFAULT_SETTINGS_FILE.into());
    load_settings(path)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn test_parse_minimal_settings_uses_defaults() {
        let toml_str = r#"
            [database]
            driver = "sqlite"
            path = "database/app.sqlite"
        "#;

        let settings = parse_settings(toml_str, Path::new("/srv/shop")).unwrap();
        assert_eq!(settings.root, PathBuf::from("/srv/shop/."));
        assert_eq!(settings.backup.retention, 10);
        assert_eq!(settings.migrations.max_failures, 3);
        assert_eq!(settings.diagnostics.log_tail_lines, 5000);
        assert!(matches!(settings.database, DatabaseSettings::Sqlite { .. }));
        assert_eq!(
            settings.state_file(),
            PathBuf::from("/srv/shop/./storage/app/system_state.json")
        );
    }

    #[test]
    fn test_parse_mysql_settings() {
        let toml_str = r#"
            root = "/opt/pos"

            [database]
            driver = "mysql"
            database = "pos"
            username = "pos_user"
            dump_binary = "/usr/local/mysql/bin/mysqldump"

            [backup]
            retention = 3

            [migrations]
            program = "php"
            args = ["artisan", "migrate", "--force"]
        "#;

        let settings = parse_settings(toml_str, Path::new("/ignored")).unwrap();
        assert_eq!(settings.root, PathBuf::from("/opt/pos"));
        assert_eq!(settings.backup.retention, 3);
        assert_eq!(settings.backup.required_free_mb, 100);
        assert_eq!(settings.migrations.program, "php");
        assert_eq!(settings.migrations.failure_markers.len(), 4);
        let DatabaseSettings::Mysql(mysql) = settings.database else {
            panic!("expected mysql settings");
        };
        assert_eq!(mysql.port, 3306);
        assert_eq!(mysql.host, "127.0.0.1");
        assert!(mysql.client_binary.is_none());
    }

    #[test]
    fn test_missing_database_section_is_config_error() {
        let result = parse_settings("root = \".\"", Path::new("."));
        assert!(matches!(result, Err(Error::Config { .. })));
    }

    #[test]
    fn test_absolute_paths_are_not_rebased() {
        let toml_str = r#"
            root = "/opt/pos"
            [paths]
            backups_dir = "/mnt/backups"
            [database]
            driver = "sqlite"
            path = "db.sqlite"
        "#;
        let settings = parse_settings(toml_str, Path::new(".")).unwrap();
        assert_eq!(settings.backups_dir(), PathBuf::from("/mnt/backups"));
        assert_eq!(settings.config_dir(), PathBuf::from("/opt/pos/config"));
    }
}
