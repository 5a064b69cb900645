//! Shared test utilities for `Stateward`.
//!
//! [`TestInstallation`] lays out a throwaway installation in a temp
//! directory: a configuration tree, a `SQLite` data store and settings wired
//! to both. The migration tool is simulated with `sh -c` scripts.

use crate::{
    config::{DataStore, Settings, settings::parse_settings},
    core::{
        BackupManager, HealthChecker, Orchestrator, StateTracker, migrations::MigrationRunner,
    },
    entities::{Migration, migration},
    errors::{Error, Result},
};
use sea_orm::{ActiveModelTrait, ConnectionTrait, DatabaseConnection, Schema, Set};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;
use tracing_subscriber::EnvFilter;

const TEST_SETTINGS: &str = r#"
[database]
driver = "sqlite"
path = "database/app.sqlite"

[backup]
required_free_mb = 0

[migrations]
program = "sh"
args = ["-c", "echo 'Nothing to migrate.'"]
fresh_args = ["-c", "echo 'Dropped all tables successfully.'"]
"#;

const APP_TOML: &str = r#"name = "Shop"
version = "2.1.0"
key = "base64:dGVzdGluZy1rZXktZm9yLXRlc3Rz"
"#;

const DATABASE_TOML: &str = r#"default = "sqlite"

[sqlite]
database = "database/app.sqlite"
password = ""
"#;

const BUSINESS_TABLES: [&str; 6] = [
    "users",
    "categories",
    "products",
    "customers",
    "orders",
    "order_items",
];

/// Installs a test subscriber; safe to call from every test.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("trace")),
        )
        .with_test_writer()
        .try_init();
}

/// Creates the migration history table from its entity definition.
pub async fn create_history_table(db: &DatabaseConnection) -> Result<()> {
    let builder = db.get_database_backend();
    let schema = Schema::new(builder);
    let table = schema.create_table_from_entity(Migration);
    db.execute(builder.build(&table)).await?;
    Ok(())
}

/// Creates the history table with one applied batch plus the business tables.
pub async fn run_fake_migrations(db: &DatabaseConnection) -> Result<()> {
    create_history_table(db).await?;
    for (index, table) in BUSINESS_TABLES.iter().enumerate() {
        db.execute_unprepared(&format!(
            "CREATE TABLE {table} (id INTEGER PRIMARY KEY, name TEXT NOT NULL)"
        ))
        .await?;
        migration::ActiveModel {
            migration: Set(format!("2024_01_01_00000{index}_create_{table}_table")),
            batch: Set(1),
            ..Default::default()
        }
        .insert(db)
        .await?;
    }
    Ok(())
}

/// A throwaway installation rooted in a temp directory
pub struct TestInstallation {
    dir: TempDir,
    settings: Arc<Settings>,
    store: Arc<DataStore>,
}

fn write(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
    }
    std::fs::write(path, contents).map_err(|e| Error::io(path, e))
}

impl TestInstallation {
    /// Installation whose data store has migration history and business tables.
    pub async fn new() -> Result<Self> {
        Self::build(true, |_| {}).await
    }

    /// Installation with configuration but an empty data store.
    pub async fn empty() -> Result<Self> {
        Self::build(false, |_| {}).await
    }

    /// Migrated installation with adjusted settings.
    pub async fn with_settings<F>(customize: F) -> Result<Self>
    where
        F: FnOnce(&mut Settings),
    {
        Self::build(true, customize).await
    }

    async fn build<F>(migrated: bool, customize: F) -> Result<Self>
    where
        F: FnOnce(&mut Settings),
    {
        init_test_tracing();
        let dir = tempfile::tempdir().map_err(|e| Error::io("tempdir", e))?;
        let root = dir.path();

        let mut settings = parse_settings(TEST_SETTINGS, root)?;
        settings.root = root.to_path_buf();
        customize(&mut settings);

        write(&settings.config_dir().join("app.toml"), APP_TOML)?;
        write(&settings.config_dir().join("database.toml"), DATABASE_TOML)?;
        let database_dir = root.join("database");
        std::fs::create_dir_all(&database_dir).map_err(|e| Error::io(&database_dir, e))?;

        let store = Arc::new(DataStore::new(&settings));
        if migrated {
            let conn = store.connection().await?;
            run_fake_migrations(&conn).await?;
        }

        Ok(Self {
            dir,
            settings: Arc::new(settings),
            store,
        })
    }

    /// Installation root.
    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    /// Settings shared by every component.
    pub fn settings(&self) -> Arc<Settings> {
        Arc::clone(&self.settings)
    }

    /// Data store handle shared by every component.
    pub fn store(&self) -> Arc<DataStore> {
        Arc::clone(&self.store)
    }

    /// State tracker for this installation.
    pub fn tracker(&self) -> StateTracker {
        StateTracker::new(self.settings(), self.store())
    }

    /// Backup manager for this installation.
    pub fn backups(&self) -> BackupManager {
        BackupManager::new(self.settings(), self.store())
    }

    /// Health checker for this installation.
    pub fn health(&self) -> HealthChecker {
        HealthChecker::new(self.settings(), self.store())
    }

    /// Migration runner for this installation.
    pub fn migrations(&self) -> MigrationRunner {
        MigrationRunner::new(self.settings())
    }

    /// Fully wired orchestrator for this installation.
    pub fn orchestrator(&self) -> Orchestrator {
        Orchestrator::new(self.settings(), self.store())
    }
}
