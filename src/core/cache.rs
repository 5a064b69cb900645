//! Derived caches and the key/value cache.
//!
//! Derived caches are precompiled artifacts (configuration, routes, views,
//! permissions) kept in one directory each under the cache root. They must be
//! thrown away after a restore or a migration retry so the application
//! rebuilds them from the restored sources. The `data/` directory holds a
//! small file-backed key/value cache, one file per key.

use crate::errors::{Error, Result};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Named derived cache domains
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DerivedCache {
    /// Compiled configuration
    Configuration,
    /// Compiled route table
    Routes,
    /// Compiled views
    Views,
    /// Third-party permission cache; may not be installed at all
    Permissions,
}

impl DerivedCache {
    /// Every domain, in clearing order.
    pub const ALL: [Self; 4] = [
        Self::Configuration,
        Self::Routes,
        Self::Views,
        Self::Permissions,
    ];

    /// Directory name under the cache root.
    #[must_use]
    pub const fn dir_name(self) -> &'static str {
        match self {
            Self::Configuration => "config",
            Self::Routes => "routes",
            Self::Views => "views",
            Self::Permissions => "permissions",
        }
    }

    /// Failures clearing an optional domain are logged, not returned.
    #[must_use]
    pub const fn is_optional(self) -> bool {
        matches!(self, Self::Permissions)
    }
}

/// File-backed cache rooted at one directory
#[derive(Debug, Clone)]
pub struct CacheStore {
    root: PathBuf,
}

fn remove_entry(path: &Path) -> std::io::Result<()> {
    if path.is_dir() {
        std::fs::remove_dir_all(path)
    } else {
        std::fs::remove_file(path)
    }
}

impl CacheStore {
    /// Creates a cache rooted at `root`; nothing is touched until used.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory of one derived cache.
    #[must_use]
    pub fn derived_dir(&self, cache: DerivedCache) -> PathBuf {
        self.root.join(cache.dir_name())
    }

    /// Empties one derived cache and returns how many entries were removed.
    pub fn clear(&self, cache: DerivedCache) -> Result<usize> {
        let dir = self.derived_dir(cache);
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(Error::io(&dir, e)),
        };
        let mut removed = 0;
        for entry in entries {
            let path = entry.map_err(|e| Error::io(&dir, e))?.path();
            remove_entry(&path).map_err(|e| Error::io(&path, e))?;
            removed += 1;
        }
        debug!("Cleared {} entries from {} cache", removed, cache.dir_name());
        Ok(removed)
    }

    /// Clears every derived cache, tolerating failures in optional ones.
    ///
    /// Returns the names of the caches that were cleared.
    pub fn clear_derived_caches(&self) -> Result<Vec<&'static str>> {
        let mut cleared = Vec::new();
        for cache in DerivedCache::ALL {
            match self.clear(cache) {
                Ok(_) => cleared.push(cache.dir_name()),
                Err(e) if cache.is_optional() => {
                    warn!("Skipping optional {} cache: {}", cache.dir_name(), e);
                }
                Err(e) => return Err(e),
            }
        }
        info!("Derived caches cleared: {}", cleared.join(", "));
        Ok(cleared)
    }

    fn data_path(&self, key: &str) -> PathBuf {
        let digest = Sha256::digest(key.as_bytes());
        self.root.join("data").join(format!("{digest:x}"))
    }

    /// Stores a value under `key`.
    pub fn put(&self, key: &str, value: &str) -> Result<()> {
        let path = self.data_path(key);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
        }
        std::fs::write(&path, value).map_err(|e| Error::io(&path, e))
    }

    /// Reads the value stored under `key`.
    pub fn get(&self, key: &str) -> Result<Option<String>> {
        let path = self.data_path(key);
        match std::fs::read_to_string(&path) {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::io(&path, e)),
        }
    }

    /// Removes `key`; returns whether it existed.
    pub fn forget(&self, key: &str) -> Result<bool> {
        let path = self.data_path(key);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(Error::io(&path, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn test_put_get_forget() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheStore::new(dir.path());

        assert_eq!(cache.get("missing")?, None);
        cache.put("greeting", "hello")?;
        assert_eq!(cache.get("greeting")?.as_deref(), Some("hello"));
        assert!(cache.forget("greeting")?);
        assert!(!cache.forget("greeting")?);
        assert_eq!(cache.get("greeting")?, None);
        Ok(())
    }

    #[test]
    fn test_clear_derived_caches() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheStore::new(dir.path());

        let views = cache.derived_dir(DerivedCache::Views);
        std::fs::create_dir_all(views.join("nested")).unwrap();
        std::fs::write(views.join("home.compiled"), "x").unwrap();
        std::fs::write(views.join("nested").join("list.compiled"), "y").unwrap();
        let config = cache.derived_dir(DerivedCache::Configuration);
        std::fs::create_dir_all(&config).unwrap();
        std::fs::write(config.join("config.cache"), "z").unwrap();
        cache.put("kept", "value")?;

        let cleared = cache.clear_derived_caches()?;
        assert_eq!(cleared, vec!["config", "routes", "views", "permissions"]);
        assert_eq!(std::fs::read_dir(&views).unwrap().count(), 0);
        assert_eq!(std::fs::read_dir(&config).unwrap().count(), 0);
        assert_eq!(cache.get("kept")?.as_deref(), Some("value"));
        Ok(())
    }

    #[test]
    fn test_unreadable_optional_cache_is_tolerated() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheStore::new(dir.path());
        // A file where the permissions directory should be cannot be listed.
        std::fs::write(cache.derived_dir(DerivedCache::Permissions), "not a dir").unwrap();

        let cleared = cache.clear_derived_caches()?;
        assert_eq!(cleared, vec!["config", "routes", "views"]);
        Ok(())
    }
}
