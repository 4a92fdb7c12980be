//! External command execution for the delta tools.
//!
//! The bsdiff engine runs `bsdiff`/`bspatch` through [`Cmd`]. Spawn failures
//! and non-zero exits both surface as [`Error::Tool`], which callers treat
//! as a fallback trigger rather than a fatal error.

use std::path::Path;
use std::process::{Command, ExitStatus};

use crate::error::{Error, Result};

/// Exit status and diagnostics of a finished tool.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub status: ExitStatus,
    pub stderr: String,
}

/// A tool invocation with path arguments.
#[derive(Debug)]
pub struct Cmd {
    program: String,
    args: Vec<String>,
}

impl Cmd {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn arg_path(self, path: &Path) -> Self {
        let arg = path.to_string_lossy().into_owned();
        self.arg(arg)
    }

    /// Run to completion. Stdout is discarded; stderr is kept for the error.
    pub fn run(self) -> Result<ToolOutput> {
        tracing::trace!(program = %self.program, args = ?self.args, "running tool");
        let output = Command::new(&self.program)
            .args(&self.args)
            .output()
            .map_err(|e| Error::Tool {
                tool: self.program.clone(),
                detail: format!("could not start: {e}"),
            })?;

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if !output.status.success() {
            let code = output
                .status
                .code()
                .map_or_else(|| "signal".to_string(), |c| c.to_string());
            let detail = if stderr.is_empty() {
                format!("exit {code}")
            } else {
                format!("exit {code}: {stderr}")
            };
            return Err(Error::Tool {
                tool: self.program,
                detail,
            });
        }

        Ok(ToolOutput {
            status: output.status,
            stderr,
        })
    }
}

/// Whether `program` resolves on `PATH`.
pub fn exists(program: &str) -> bool {
    which::which(program).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success() {
        let out = Cmd::new("true").run().unwrap();
        assert!(out.status.success());
    }

    #[test]
    fn test_nonzero_exit_is_recoverable() {
        let err = Cmd::new("sh").arg("-c").arg("echo broken >&2; exit 3").run().unwrap_err();
        assert!(err.is_recoverable());
        let msg = err.to_string();
        assert!(msg.contains("exit 3"), "{msg}");
        assert!(msg.contains("broken"), "{msg}");
    }

    #[test]
    fn test_missing_program() {
        let err = Cmd::new("nonexistent_program_12345").run().unwrap_err();
        assert!(matches!(err, Error::Tool { .. }));
    }

    #[test]
    fn test_path_arguments() {
        let dir = tempfile::TempDir::new().unwrap();
        let target = dir.path().join("made");
        Cmd::new("touch").arg_path(&target).run().unwrap();
        assert!(target.exists());
    }

    #[test]
    fn test_exists() {
        assert!(exists("sh"));
        assert!(!exists("nonexistent_program_12345"));
    }
}
