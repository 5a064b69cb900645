//! External process invocation.
//!
//! Dump, client and migration tools are black boxes: they get arguments and
//! optionally a file on stdin, and come back with an exit status plus their
//! combined stdout and stderr. The caller blocks until the process exits.

use crate::errors::{Error, Result};
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, instrument};

/// What an external process left behind
#[derive(Debug, Clone)]
pub struct ToolOutput {
    /// Process exited with status zero
    pub exit_ok: bool,
    /// Exit code, if the process was not killed by a signal
    pub code: Option<i32>,
    /// Stdout followed by stderr
    pub output: String,
}

/// One external process invocation
#[derive(Debug, Clone, Default)]
pub struct ToolInvocation<'a> {
    /// Program name or path
    pub program: &'a str,
    /// Arguments
    pub args: Vec<String>,
    /// Extra environment variables
    pub env: Vec<(&'a str, String)>,
    /// File piped to stdin
    pub stdin: Option<&'a Path>,
    /// Working directory
    pub current_dir: Option<&'a Path>,
}

impl ToolInvocation<'_> {
    /// Runs the process to completion.
    ///
    /// # Errors
    /// `Error::ExternalTool` if the process cannot be started (e.g. binary not
    /// found), `Error::Io` if the stdin file cannot be opened. A non-zero exit
    /// is not an error here; callers decide what it means.
    #[instrument(skip(self), fields(program = self.program))]
    pub async fn run(&self) -> Result<ToolOutput> {
        let mut command = Command::new(self.program);
        command
            .args(&self.args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for (key, value) in &self.env {
            command.env(key, value);
        }
        if let Some(dir) = self.current_dir {
            command.current_dir(dir);
        }
        match self.stdin {
            Some(path) => {
                let file = std::fs::File::open(path).map_err(|e| Error::io(path, e))?;
                command.stdin(Stdio::from(file));
            }
            None => {
                command.stdin(Stdio::null());
            }
        }

        let output = command.output().await.map_err(|e| Error::ExternalTool {
            tool: self.program.to_string(),
            output: format!("failed to start: {e}"),
        })?;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.is_empty() {
            if !combined.is_empty() && !combined.ends_with('\n') {
                combined.push('\n');
            }
            combined.push_str(&stderr);
        }
        debug!("{} exited with {:?}", self.program, output.status.code());

        Ok(ToolOutput {
            exit_ok: output.status.success(),
            code: output.status.code(),
            output: combined,
        })
    }
}
