//! Core lifecycle logic, independent of the command-line surface.

/// Database artifact export, restore and checksums
pub mod artifact;
/// Verified backups and restore
pub mod backup;
/// Derived caches and the key/value cache
pub mod cache;
/// Diagnostic archive export
pub mod diagnostics;
/// External process invocation
pub mod external;
/// Startup health checks
pub mod health;
/// Host and runtime facts
pub mod host;
/// Advisory operation lock
pub mod lock;
/// Schema migration tool runner
pub mod migrations;
/// Auto-recovery, rollback and factory reset
pub mod recovery;
/// Schema inspection
pub mod schema;
/// Installation state and classification
pub mod state;
/// Version resolution and comparison
pub mod version;

pub use backup::BackupManager;
pub use health::HealthChecker;
pub use recovery::Orchestrator;
pub use state::StateTracker;
