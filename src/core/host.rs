//! Host and runtime facts for manifests, disk-space gates and diagnostics.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::path::{Path, PathBuf};
use sysinfo::{Disks, System};

const MB: u64 = 1024 * 1024;

/// Runtime facts recorded in every backup manifest
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RuntimeFacts {
    /// Operating system family
    pub os: String,
    /// CPU architecture
    pub arch: String,
    /// Version of this lifecycle manager
    pub manager_version: String,
}

impl RuntimeFacts {
    /// Facts about the running process.
    #[must_use]
    pub fn current() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            manager_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Closest existing ancestor, canonicalized, so mount lookup works before a
/// directory is created.
fn existing_ancestor(path: &Path) -> Option<PathBuf> {
    path.ancestors()
        .find(|p| p.exists())
        .and_then(|p| p.canonicalize().ok())
}

/// Free space in MB on the volume holding `path`, if the volume can be found.
#[must_use]
pub fn available_space_mb(path: &Path) -> Option<u64> {
    let target = existing_ancestor(path)?;
    let disks = Disks::new_with_refreshed_list();
    disks
        .list()
        .iter()
        .filter(|disk| target.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().as_os_str().len())
        .map(|disk| disk.available_space() / MB)
}

/// OS, runtime, memory and disk facts for a diagnostic bundle.
#[must_use]
pub fn host_facts(data_path: &Path) -> Value {
    let mut system = System::new();
    system.refresh_memory();
    json!({
        "os": std::env::consts::OS,
        "os_family": std::env::consts::FAMILY,
        "arch": std::env::consts::ARCH,
        "os_version": System::long_os_version(),
        "kernel_version": System::kernel_version(),
        "hostname": System::host_name(),
        "runtime": RuntimeFacts::current(),
        "process_id": std::process::id(),
        "memory": {
            "total_mb": system.total_memory() / MB,
            "available_mb": system.available_memory() / MB,
            "swap_total_mb": system.total_swap() / MB,
        },
        "disk": {
            "path": data_path.display().to_string(),
            "available_mb": available_space_mb(data_path),
        },
    })
}
