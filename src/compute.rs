//! Script execution for compute jobs.

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::error::{Result, SyncError};

/// Runs the interpreter with `args` in `dir` (the linked dataset snapshot).
///
/// Returns the combined console output; on failure the output is carried in
/// the [`SyncError::Compute`] message.
#[async_trait]
pub trait ComputeRunner: Send + Sync {
    async fn run(&self, dir: &Path, args: &[String]) -> Result<String>;
}

/// `<command> <args..>` as a child process, killed when the job is cancelled.
pub struct ShellComputeRunner {
    command: String,
}

impl ShellComputeRunner {
    pub fn new(command: impl Into<String>) -> Self {
        Self { command: command.into() }
    }
}

#[async_trait]
impl ComputeRunner for ShellComputeRunner {
    async fn run(&self, dir: &Path, args: &[String]) -> Result<String> {
        debug!(command = %self.command, ?args, dir = %dir.display(), "Running compute script");
        let output = Command::new(&self.command)
            .args(args)
            .current_dir(dir)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await?;
        let mut console = String::from_utf8_lossy(&output.stdout).into_owned();
        console.push_str(&String::from_utf8_lossy(&output.stderr));
        if output.status.success() {
            Ok(console)
        } else {
            Err(SyncError::Compute(format!("{console}\n\n{}", output.status)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_runs_in_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("data.txt"), "x").unwrap();
        std::fs::write(dir.path().join("run.sh"), "ls\necho done >&2\n").unwrap();
        let out = ShellComputeRunner::new("sh").run(dir.path(), &["run.sh".to_string()]).await.unwrap();
        assert!(out.contains("data.txt"));
        assert!(out.contains("done"));
    }

    #[tokio::test]
    async fn test_failure_keeps_output() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("fail.sh"), "echo partial\nexit 3\n").unwrap();
        let err = ShellComputeRunner::new("sh").run(dir.path(), &["fail.sh".to_string()]).await.unwrap_err();
        match err {
            SyncError::Compute(msg) => assert!(msg.contains("partial")),
            other => panic!("unexpected error: {other}"),
        }
    }
}
