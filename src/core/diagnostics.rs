//! Support diagnostic bundle.
//!
//! Everything that goes into the archive is gathered first; the archive is
//! then written under a `.partial` name and renamed into place, so a failed
//! export never leaves a corrupt bundle where a caller would look for one.

use crate::{
    config::{DataStore, Settings, application},
    core::{health::HealthChecker, host, schema, state::StateTracker},
    errors::{Error, Result},
};
use chrono::Utc;
use serde::Serialize;
use serde_json::{Value, json};
use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, instrument};
use zip::{CompressionMethod, ZipWriter, write::FileOptions};

/// Result of [`DiagnosticExporter::export_diagnostic_bundle`]
#[derive(Debug, Clone, Serialize)]
pub struct DiagnosticOutcome {
    /// Whether the archive was written
    pub success: bool,
    /// Human-readable result
    pub message: String,
    /// Archive location
    pub path: Option<PathBuf>,
    /// Archive size in bytes
    pub size_bytes: Option<u64>,
}

/// Last `limit` lines of a text file.
pub fn tail_lines(path: &Path, limit: usize) -> Result<String> {
    let file = File::open(path).map_err(|e| Error::io(path, e))?;
    let mut lines = VecDeque::with_capacity(limit.min(8192));
    for line in BufReader::new(file).split(b'\n') {
        let line = line.map_err(|e| Error::io(path, e))?;
        if lines.len() == limit {
            lines.pop_front();
        }
        if limit > 0 {
            lines.push_back(String::from_utf8_lossy(&line).into_owned());
        }
    }
    let mut out = lines.into_iter().collect::<Vec<_>>().join("\n");
    if !out.is_empty() {
        out.push('\n');
    }
    Ok(out)
}

/// Builds diagnostic archives for one installation
#[derive(Debug, Clone)]
pub struct DiagnosticExporter {
    settings: Arc<Settings>,
    store: Arc<DataStore>,
    tracker: StateTracker,
    health: HealthChecker,
}

struct BundleEntry {
    name: String,
    body: Vec<u8>,
}

impl BundleEntry {
    fn json(name: &str, value: &Value) -> Result<Self> {
        Ok(Self {
            name: name.to_string(),
            body: serde_json::to_vec_pretty(value)?,
        })
    }
}

impl DiagnosticExporter {
    /// Creates an exporter for the given installation.
    #[must_use]
    pub const fn new(
        settings: Arc<Settings>,
        store: Arc<DataStore>,
        tracker: StateTracker,
        health: HealthChecker,
    ) -> Self {
        Self {
            settings,
            store,
            tracker,
            health,
        }
    }

    /// Writes a zip archive with state, recent logs, health results, schema
    /// structure, redacted configuration and host facts.
    #[instrument(skip(self))]
    pub async fn export_diagnostic_bundle(&self) -> DiagnosticOutcome {
        match self.build().await {
            Ok((path, size)) => {
                info!("Diagnostic bundle written to {}", path.display());
                DiagnosticOutcome {
                    success: true,
                    message: format!("Diagnostic bundle created ({size} bytes)"),
                    path: Some(path),
                    size_bytes: Some(size),
                }
            }
            Err(e) => {
                error!("Diagnostic export failed: {}", e);
                DiagnosticOutcome {
                    success: false,
                    message: format!("Diagnostic export failed: {e}"),
                    path: None,
                    size_bytes: None,
                }
            }
        }
    }

    async fn build(&self) -> Result<(PathBuf, u64)> {
        let entries = self.collect_entries().await?;

        let dir = self.settings.diagnostics_dir();
        std::fs::create_dir_all(&dir).map_err(|e| Error::io(&dir, e))?;
        let final_path = dir.join(format!(
            "diagnostics_{}.zip",
            Utc::now().format("%Y-%m-%d_%H-%M-%S-%3f")
        ));
        let partial = final_path.with_extension("zip.partial");

        if let Err(e) = write_archive(&partial, &entries) {
            let _ = std::fs::remove_file(&partial);
            return Err(e);
        }
        std::fs::rename(&partial, &final_path).map_err(|e| {
            let _ = std::fs::remove_file(&partial);
            Error::io(&final_path, e)
        })?;
        let size = std::fs::metadata(&final_path)
            .map_err(|e| Error::io(&final_path, e))?
            .len();
        Ok((final_path, size))
    }

    async fn collect_entries(&self) -> Result<Vec<BundleEntry>> {
        let mut entries = Vec::new();

        entries.push(BundleEntry::json(
            "system_state.json",
            &json!({
                "state": Value::Object(self.tracker.load_document()),
                "summary": self.tracker.state_summary(),
            }),
        )?);

        let log = self.settings.primary_log();
        let stem = log
            .file_stem()
            .map_or_else(|| "app".to_string(), |s| s.to_string_lossy().into_owned());
        let body = if log.is_file() {
            tail_lines(&log, self.settings.diagnostics.log_tail_lines)?
        } else {
            format!("Log file not found: {}\n", log.display())
        };
        entries.push(BundleEntry {
            name: format!("logs/{stem}_recent.log"),
            body: body.into_bytes(),
        });

        let report = self.health.run_all_checks().await;
        entries.push(BundleEntry::json("health_check.json", &serde_json::to_value(&report)?)?);

        let structure = match self.schema_structure().await {
            Ok(tables) => json!({
                "driver": self.store.engine().driver(),
                "tables": tables,
            }),
            Err(e) => json!({ "error": e.to_string() }),
        };
        entries.push(BundleEntry::json("database/structure.json", &structure)?);

        let config = application::redacted_summary(&self.settings.config_dir())
            .unwrap_or_else(|e| json!({ "error": e.to_string() }));
        entries.push(BundleEntry::json("config_summary.json", &config)?);

        entries.push(BundleEntry::json(
            "system_info.json",
            &host::host_facts(&self.settings.root),
        )?);
        Ok(entries)
    }

    async fn schema_structure(&self) -> Result<Value> {
        let conn = self.store.connection().await?;
        Ok(serde_json::to_value(schema::describe_schema(&conn).await?)?)
    }
}

fn write_archive(path: &Path, entries: &[BundleEntry]) -> Result<()> {
    let file = File::create(path).map_err(|e| Error::io(path, e))?;
    let mut zip = ZipWriter::new(file);
    let options = FileOptions::default().compression_method(CompressionMethod::Deflated);
    for entry in entries {
        zip.start_file(entry.name.as_str(), options)?;
        zip.write_all(&entry.body).map_err(|e| Error::io(path, e))?;
    }
    let file = zip.finish()?;
    file.sync_all().map_err(|e| Error::io(path, e))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::test_utils::TestInstallation;
    use std::io::Read;

    fn read_entry(archive: &mut zip::ZipArchive<File>, name: &str) -> String {
        let mut body = String::new();
        archive.by_name(name).unwrap().read_to_string(&mut body).unwrap();
        body
    }

    #[test]
    fn test_tail_lines() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("app.log");
        let contents: String = (1..=10).map(|i| format!("line {i}\n")).collect();
        std::fs::write(&log, contents).unwrap();

        assert_eq!(tail_lines(&log, 3)?, "line 8\nline 9\nline 10\n");
        assert_eq!(tail_lines(&log, 100)?.lines().count(), 10);
        assert_eq!(tail_lines(&log, 0)?, "");
        Ok(())
    }

    #[tokio::test]
    async fn test_bundle_contains_every_entry() -> Result<()> {
        let install = TestInstallation::new().await?;
        install
            .tracker()
            .initialize_system_state(crate::core::state::InstallationType::Normal)?;
        let logs = install.root().join("storage/logs");
        std::fs::create_dir_all(&logs).unwrap();
        let lines: String = (1..=6000).map(|i| format!("entry {i}\n")).collect();
        std::fs::write(logs.join("app.log"), lines).unwrap();

        let outcome = install.orchestrator().export_diagnostic_bundle().await;
        assert!(outcome.success, "{}", outcome.message);
        let path = outcome.path.unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), outcome.size_bytes.unwrap());
        assert_eq!(path.extension().unwrap(), "zip");

        let mut archive = zip::ZipArchive::new(File::open(&path).unwrap()).unwrap();
        let mut names: Vec<String> = archive.file_names().map(ToString::to_string).collect();
        names.sort();
        assert_eq!(
            names,
            vec![
                "config_summary.json",
                "database/structure.json",
                "health_check.json",
                "logs/app_recent.log",
                "system_info.json",
                "system_state.json",
            ]
        );

        let log = read_entry(&mut archive, "logs/app_recent.log");
        assert_eq!(log.lines().count(), 5000);
        assert_eq!(log.lines().next(), Some("entry 1001"));

        let config = read_entry(&mut archive, "config_summary.json");
        assert!(config.contains("[redacted]"));
        assert!(!config.contains("base64:"));

        let state: Value = serde_json::from_str(&read_entry(&mut archive, "system_state.json"))?;
        assert_eq!(state["state"]["installed_version"], "2.1.0");
        assert_eq!(state["summary"]["version_matches"], true);

        let structure: Value =
            serde_json::from_str(&read_entry(&mut archive, "database/structure.json"))?;
        let tables = structure["tables"].as_array().unwrap();
        assert!(tables.iter().any(|t| t["name"] == "users"));

        let health: Value = serde_json::from_str(&read_entry(&mut archive, "health_check.json"))?;
        assert_eq!(health["checks"].as_array().unwrap().len(), 6);

        let leftovers: Vec<_> = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(std::result::Result::ok)
            .filter(|e| e.file_name().to_string_lossy().ends_with(".partial"))
            .collect();
        assert!(leftovers.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_log_is_noted() -> Result<()> {
        let install = TestInstallation::new().await?;
        let outcome = install.orchestrator().export_diagnostic_bundle().await;
        assert!(outcome.success, "{}", outcome.message);

        let mut archive =
            zip::ZipArchive::new(File::open(outcome.path.unwrap()).unwrap()).unwrap();
        assert!(read_entry(&mut archive, "logs/app_recent.log").starts_with("Log file not found"));
        Ok(())
    }

    #[tokio::test]
    async fn test_unwritable_destination_reports_failure() -> Result<()> {
        let install = TestInstallation::new().await?;
        // A file where the diagnostics directory should be.
        let target = install.root().join("storage/diagnostics");
        std::fs::create_dir_all(target.parent().unwrap()).unwrap();
        std::fs::write(&target, "not a directory").unwrap();

        let outcome = install.orchestrator().export_diagnostic_bundle().await;
        assert!(!outcome.success);
        assert!(outcome.path.is_none());
        Ok(())
    }
}
