/// Application configuration directory (one TOML file per domain)
pub mod application;

/// Data store connection management
pub mod database;

/// Lifecycle manager settings loaded from `stateward.toml`
pub mod settings;

pub use database::{DataStore, Engine};
pub use settings::{
    BackupSettings, DatabaseSettings, DiagnosticSettings, HealthSettings, MigrationSettings,
    MysqlSettings, PathSettings, Settings, load_default_settings, load_settings,
};
