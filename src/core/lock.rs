//! Advisory lock serializing backup, restore and factory reset.
//!
//! The lock is a file created with create-new semantics holding the owner's
//! pid, the operation name and the acquisition time. It is removed when the
//! [`OperationLock`] is dropped, on every exit path. A lock older than the
//! configured threshold is assumed abandoned by a crashed process and broken.

use crate::errors::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, warn};

/// Lock file name inside the guarded directory.
pub const LOCK_FILE_NAME: &str = ".operation.lock";

#[derive(Debug, Serialize, Deserialize)]
struct LockRecord {
    pid: u32,
    operation: String,
    acquired_at: DateTime<Utc>,
}

/// Held for the duration of one risky operation
#[derive(Debug)]
pub struct OperationLock {
    path: PathBuf,
    operation: String,
}

fn lock_age(path: &Path, record: Option<&LockRecord>) -> Option<Duration> {
    if let Some(record) = record {
        return (Utc::now() - record.acquired_at).to_std().ok().or(Some(Duration::ZERO));
    }
    let modified = std::fs::metadata(path).ok()?.modified().ok()?;
    SystemTime::now().duration_since(modified).ok()
}

impl OperationLock {
    /// Takes the lock in `dir` for `operation`.
    ///
    /// # Errors
    /// `Error::OperationInProgress` (retryable) if a fresh lock is held.
    pub fn acquire(dir: &Path, operation: &str, stale_after: Duration) -> Result<Self> {
        std::fs::create_dir_all(dir).map_err(|e| Error::io(dir, e))?;
        let path = dir.join(LOCK_FILE_NAME);

        // Second pass only happens after breaking a stale lock.
        for _ in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    let record = LockRecord {
                        pid: std::process::id(),
                        operation: operation.to_string(),
                        acquired_at: Utc::now(),
                    };
                    let body = serde_json::to_vec(&record)?;
                    if let Err(e) = file.write_all(&body) {
                        let _ = std::fs::remove_file(&path);
                        return Err(Error::io(&path, e));
                    }
                    debug!("Acquired {} lock at {}", operation, path.display());
                    return Ok(Self {
                        path,
                        operation: operation.to_string(),
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    let record = std::fs::read(&path)
                        .ok()
                        .and_then(|raw| serde_json::from_slice::<LockRecord>(&raw).ok());
                    let stale = lock_age(&path, record.as_ref()).is_some_and(|age| age > stale_after);
                    if !stale {
                        return Err(match record {
                            Some(r) => Error::OperationInProgress {
                                operation: r.operation,
                                pid: r.pid,
                                since: r.acquired_at.to_rfc3339(),
                            },
                            None => Error::OperationInProgress {
                                operation: "unknown".to_string(),
                                pid: 0,
                                since: "unknown".to_string(),
                            },
                        });
                    }
                    warn!("Breaking stale operation lock at {}", path.display());
                    match std::fs::remove_file(&path) {
                        Ok(()) => {}
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                        Err(e) => return Err(Error::io(&path, e)),
                    }
                }
                Err(e) => return Err(Error::io(&path, e)),
            }
        }

        Err(Error::OperationInProgress {
            operation: "unknown".to_string(),
            pid: 0,
            since: "unknown".to_string(),
        })
    }

    /// Operation this lock was taken for.
    #[must_use]
    pub fn operation(&self) -> &str {
        &self.operation
    }
}

impl Drop for OperationLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!("Failed to release lock {}: {}", self.path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    const HOUR: Duration = Duration::from_secs(3600);

    #[test]
    fn test_second_acquire_is_refused_until_release() {
        let dir = tempfile::tempdir().unwrap();
        let lock = OperationLock::acquire(dir.path(), "backup", HOUR).unwrap();
        assert_eq!(lock.operation(), "backup");

        let err = OperationLock::acquire(dir.path(), "restore", HOUR).unwrap_err();
        assert!(err.is_retryable());
        assert!(
            matches!(err, Error::OperationInProgress { ref operation, pid, .. } if operation == "backup" && pid == std::process::id())
        );

        drop(lock);
        assert!(!dir.path().join(LOCK_FILE_NAME).exists());
        OperationLock::acquire(dir.path(), "restore", HOUR).unwrap();
    }

    #[test]
    fn test_stale_lock_is_broken() {
        let dir = tempfile::tempdir().unwrap();
        let old = LockRecord {
            pid: 999_999,
            operation: "reset".to_string(),
            acquired_at: Utc::now() - chrono::Duration::hours(5),
        };
        std::fs::write(
            dir.path().join(LOCK_FILE_NAME),
            serde_json::to_vec(&old).unwrap(),
        )
        .unwrap();

        let lock = OperationLock::acquire(dir.path(), "backup", HOUR).unwrap();
        let raw = std::fs::read_to_string(dir.path().join(LOCK_FILE_NAME)).unwrap();
        assert!(raw.contains("backup"));
        drop(lock);
    }

    #[test]
    fn test_unreadable_fresh_lock_is_respected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(LOCK_FILE_NAME), "garbage").unwrap();
        let result = OperationLock::acquire(dir.path(), "backup", HOUR);
        assert!(matches!(result, Err(Error::OperationInProgress { pid: 0, .. })));
    }
}
