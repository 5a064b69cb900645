//! Application configuration directory.
//!
//! The installation keeps its configuration as one TOML file per domain
//! (`app.toml`, `database.toml`, ...) under the configuration directory.
//! This module loads domains, resolves the application version and key, and
//! builds the secret-free summary that goes into diagnostic bundles.

use crate::errors::{Error, Result};
use serde_json::{Map, Value, json};
use std::path::Path;
use toml::Table;

/// Environment variable that overrides `app.toml`'s `key`.
pub const APP_KEY_ENV_VAR: &str = "APP_KEY";

/// Key fragments whose values never leave the machine.
const SECRET_FRAGMENTS: [&str; 5] = ["password", "secret", "key", "token", "license"];

/// Why a domain could not be loaded. Never carries file contents.
#[derive(Debug, Clone, PartialEq, Eq)]
enum DomainError {
    Unreadable(String),
    Unparseable { line: usize, column: usize },
}

/// 1-based line and column of a byte offset.
fn position(contents: &str, offset: usize) -> (usize, usize) {
    let before = contents.get(..offset).unwrap_or(contents);
    let line = before.matches('\n').count() + 1;
    let column = before.rsplit('\n').next().map_or(0, |l| l.chars().count()) + 1;
    (line, column)
}

fn read_domain(config_dir: &Path, domain: &str) -> std::result::Result<Table, DomainError> {
    let path = config_dir.join(format!("{domain}.toml"));
    let contents =
        std::fs::read_to_string(&path).map_err(|e| DomainError::Unreadable(e.to_string()))?;
    contents.parse::<Table>().map_err(|e| {
        let (line, column) = e
            .span()
            .map_or((0, 0), |span| position(&contents, span.start));
        DomainError::Unparseable { line, column }
    })
}

/// Loads one configuration domain (`<config_dir>/<domain>.toml`).
///
/// Parse errors report a position only; the offending line is never echoed.
///
/// # Errors
/// Returns `Error::Config` if the file is missing or is not valid TOML.
pub fn load_domain(config_dir: &Path, domain: &str) -> Result<Table> {
    read_domain(config_dir, domain).map_err(|e| Error::Config {
        message: match e {
            DomainError::Unreadable(reason) => {
                format!("Failed to read configuration domain '{domain}': {reason}")
            }
            DomainError::Unparseable { line, column } => format!(
                "Failed to parse configuration domain '{domain}' at line {line}, column {column}"
            ),
        },
    })
}

/// Version string configured in `app.toml`, if any.
#[must_use]
pub fn configured_version(config_dir: &Path) -> Option<String> {
    load_domain(config_dir, "app")
        .ok()?
        .get("version")?
        .as_str()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(ToString::to_string)
}

/// The application's cryptographic key: `APP_KEY` first, then `app.toml`.
#[must_use]
pub fn app_key(config_dir: &Path) -> Option<String> {
    if let Ok(key) = std::env::var(APP_KEY_ENV_VAR) {
        if !key.trim().is_empty() {
            return Some(key);
        }
    }
    load_domain(config_dir, "app")
        .ok()?
        .get("key")?
        .as_str()
        .filter(|k| !k.trim().is_empty())
        .map(ToString::to_string)
}

/// Names of every domain file in the configuration directory, sorted.
pub fn list_domains(config_dir: &Path) -> Result<Vec<String>> {
    let entries = std::fs::read_dir(config_dir).map_err(|e| Error::io(config_dir, e))?;
    let mut domains: Vec<String> = entries
        .filter_map(std::result::Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "toml"))
        .filter_map(|path| path.file_stem().map(|s| s.to_string_lossy().into_owned()))
        .collect();
    domains.sort();
    Ok(domains)
}

fn is_secret(key: &str) -> bool {
    let lowered = key.to_ascii_lowercase();
    SECRET_FRAGMENTS.iter().any(|f| lowered.contains(f))
}

fn redact(value: &toml::Value, key: &str) -> Value {
    if is_secret(key) {
        return json!("[redacted]");
    }
    match value {
        toml::Value::Table(table) => Value::Object(
            table
                .iter()
                .map(|(k, v)| (k.clone(), redact(v, k)))
                .collect::<Map<String, Value>>(),
        ),
        toml::Value::Array(items) => Value::Array(items.iter().map(|v| redact(v, "")).collect()),
        toml::Value::String(s) => json!(s),
        toml::Value::Integer(i) => json!(i),
        toml::Value::Float(f) => json!(f),
        toml::Value::Boolean(b) => json!(b),
        toml::Value::Datetime(d) => json!(d.to_string()),
    }
}

/// Every domain with secret-looking values replaced by `"[redacted]"`.
///
/// Domains that cannot be loaded are reported by name with a marker and,
/// for parse errors, the position of the error.
pub fn redacted_summary(config_dir: &Path) -> Result<Value> {
    let mut summary = Map::new();
    for domain in list_domains(config_dir)? {
        let entry = match read_domain(config_dir, &domain) {
            Ok(table) => redact(&toml::Value::Table(table), ""),
            Err(DomainError::Unreadable(_)) => json!({ "error": "unreadable" }),
            Err(DomainError::Unparseable { line, column }) => {
                json!({ "error": "unparseable", "line": line, "column": column })
            }
        };
        summary.insert(domain, entry);
    }
    Ok(Value::Object(summary))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    fn write(dir: &Path, name: &str, contents: &str) {
        std::fs::write(dir.join(name), contents).unwrap();
    }

    #[test]
    fn test_configured_version_and_key() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "app.toml", "version = \"2.4.1\"\nkey = \"base64:abc\"\n");

        assert_eq!(configured_version(dir.path()).as_deref(), Some("2.4.1"));
        // APP_KEY may be set in the environment; either way a key is found.
        assert!(app_key(dir.path()).is_some());
    }

    #[test]
    fn test_missing_domain_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            load_domain(dir.path(), "mail"),
            Err(Error::Config { .. })
        ));
        assert!(configured_version(dir.path()).is_none());
    }

    #[test]
    fn test_redacted_summary_hides_secrets() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "database.toml",
            "host = \"db.local\"\npassword = \"hunter2\"\n[replica]\napi_token = \"t\"\nport = 3306\n",
        );
        write(dir.path(), "broken.toml", "this is = = not toml");
        write(dir.path(), "notes.txt", "ignored");

        let summary = redacted_summary(dir.path()).unwrap();
        assert_eq!(summary["database"]["host"], "db.local");
        assert_eq!(summary["database"]["password"], "[redacted]");
        assert_eq!(summary["database"]["replica"]["api_token"], "[redacted]");
        assert_eq!(summary["database"]["replica"]["port"], 3306);
        assert_eq!(summary["broken"]["error"], "unparseable");
        assert!(summary.get("notes").is_none());
        assert!(!summary.to_string().contains("hunter2"));
    }

    #[test]
    fn test_malformed_domain_never_echoes_its_contents() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "mail.toml", "host = \"smtp\"\npassword = \"hunter2\n");

        let summary = redacted_summary(dir.path()).unwrap();
        assert_eq!(summary["mail"]["error"], "unparseable");
        assert_eq!(summary["mail"]["line"], 2);
        assert!(!summary.to_string().contains("hunter2"));

        let err = load_domain(dir.path(), "mail").unwrap_err().to_string();
        assert!(err.contains("line 2"), "{err}");
        assert!(!err.contains("hunter2"));
    }

    #[test]
    fn test_position_of_offset() {
        let text = "a = 1\nbb = \"x\n";
        assert_eq!(position(text, 0), (1, 1));
        assert_eq!(position(text, 6), (2, 1));
        assert_eq!(position(text, 11), (2, 6));
        assert_eq!(position(text, 999), (3, 1));
    }
}
