//! Schema migration tool runner.
//!
//! The migration tool's exit code is not trusted on its own: a run succeeded
//! only if the process exited zero AND its combined output contains none of
//! the configured failure markers. Marker matching is case-sensitive.

use crate::{
    config::{MigrationSettings, Settings},
    core::external::ToolInvocation,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// Outcome of one migration tool invocation
#[derive(Debug, Clone, Serialize)]
pub struct MigrationRun {
    /// Exit zero and no failure marker in the output
    pub succeeded: bool,
    /// Process exit code, if it exited normally
    pub exit_code: Option<i32>,
    /// Captured stdout and stderr
    pub output: String,
    /// Why the run counts as failed
    pub failure_reason: Option<String>,
}

/// First configured marker found in `output`.
#[must_use]
pub fn find_failure_marker<'a>(output: &str, markers: &'a [String]) -> Option<&'a str> {
    markers
        .iter()
        .filter(|marker| !marker.is_empty())
        .find(|marker| output.contains(marker.as_str()))
        .map(String::as_str)
}

/// Runs the configured migration tool from the installation root
#[derive(Debug, Clone)]
pub struct MigrationRunner {
    settings: Arc<Settings>,
}

impl MigrationRunner {
    /// Creates a runner for the given installation.
    #[must_use]
    pub const fn new(settings: Arc<Settings>) -> Self {
        Self { settings }
    }

    fn config(&self) -> &MigrationSettings {
        &self.settings.migrations
    }

    /// Forced, non-interactive migration run.
    pub async fn migrate(&self) -> MigrationRun {
        self.run(&self.config().args).await
    }

    /// Drop-and-recreate run used by factory reset.
    pub async fn fresh(&self) -> MigrationRun {
        self.run(&self.config().fresh_args).await
    }

    #[instrument(skip(self))]
    async fn run(&self, args: &[String]) -> MigrationRun {
        let config = self.config();
        let invocation = ToolInvocation {
            program: &config.program,
            args: args.to_vec(),
            current_dir: Some(&self.settings.root),
            ..Default::default()
        };
        let out = match invocation.run().await {
            Ok(out) => out,
            Err(e) => {
                warn!("Migration tool could not be run: {}", e);
                return MigrationRun {
                    succeeded: false,
                    exit_code: None,
                    output: String::new(),
                    failure_reason: Some(e.to_string()),
                };
            }
        };

        let failure_reason = if out.exit_ok {
            find_failure_marker(&out.output, &config.failure_markers)
                .map(|marker| format!("output contains failure marker '{marker}'"))
        } else {
            Some(format!("exited with status {:?}", out.code))
        };

        match &failure_reason {
            None => info!("Migration tool run succeeded"),
            Some(reason) => warn!("Migration tool run failed: {}", reason),
        }
        MigrationRun {
            succeeded: failure_reason.is_none(),
            exit_code: out.code,
            output: out.output,
            failure_reason,
        }
    }
}
