//! Dotted version strings.
//!
//! Versions compare component by component as integers. A leading `v` is
//! ignored, missing trailing components count as zero, and anything after the
//! leading digits of a component (`3-beta`) is dropped.

use crate::config::application;
use std::cmp::Ordering;
use std::path::Path;

/// Version reported when neither the configuration nor the package descriptor has one.
pub const DEFAULT_VERSION: &str = "1.0.0";

fn components(version: &str) -> Vec<u64> {
    let trimmed = version.trim();
    let trimmed = trimmed
        .strip_prefix('v')
        .or_else(|| trimmed.strip_prefix('V'))
        .unwrap_or(trimmed);
    trimmed
        .split('.')
        .map(|part| {
            let digits: String = part.chars().take_while(char::is_ascii_digit).collect();
            digits.parse().unwrap_or(0)
        })
        .collect()
}

/// Orders two dotted versions.
#[must_use]
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let left = components(a);
    let right = components(b);
    let len = left.len().max(right.len());
    (0..len)
        .map(|i| {
            let l = left.get(i).copied().unwrap_or(0);
            let r = right.get(i).copied().unwrap_or(0);
            l.cmp(&r)
        })
        .find(|ord| *ord != Ordering::Equal)
        .unwrap_or(Ordering::Equal)
}

/// True when `to` has a larger leading component than `from`.
#[must_use]
pub fn is_major_upgrade(from: &str, to: &str) -> bool {
    let major = |v: &str| components(v).first().copied().unwrap_or(0);
    major(to) > major(from)
}

fn descriptor_version(descriptor: &Path) -> Option<String> {
    let contents = std::fs::read_to_string(descriptor).ok()?;
    let value: serde_json::Value = serde_json::from_str(&contents).ok()?;
    value
        .get("version")?
        .as_str()
        .filter(|v| !v.trim().is_empty())
        .map(ToString::to_string)
}

/// Resolves the running application version.
///
/// Order: `app.toml` in the configuration directory, then the `version` field
/// of the JSON package descriptor, then [`DEFAULT_VERSION`].
#[must_use]
pub fn resolve_current_version(config_dir: &Path, package_descriptor: &Path) -> String {
    application::configured_version(config_dir)
        .or_else(|| descriptor_version(package_descriptor))
        .unwrap_or_else(|| DEFAULT_VERSION.to_string())
}
