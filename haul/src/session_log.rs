//! Append-only subprocess log
//!
//! Every external command a session runs (archivers, compressors, the diff
//! tool, driver CLIs) has its stdout and stderr appended to one log file in
//! the work directory.

use crate::error::{HaulError, HaulResult};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

/// Append-mode log shared by all subprocesses of one session
#[derive(Debug, Clone)]
pub struct SessionLog {
    path: PathBuf,
}

impl SessionLog {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Open a fresh append handle suitable for a child's stdout or stderr
    pub fn stdio(&self) -> HaulResult<Stdio> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        Ok(Stdio::from(file))
    }

    /// Write a marker line before a command runs
    pub fn note(&self, line: &str) -> HaulResult<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "# {}", line)?;
        Ok(())
    }

    /// Run a command to completion with output appended to the log.
    ///
    /// A non-zero exit status is returned as an error built by `on_failure`.
    pub async fn run(
        &self,
        cmd: &mut Command,
        on_failure: impl FnOnce(String) -> HaulError,
    ) -> HaulResult<()> {
        let description = format!("{:?}", cmd.as_std());
        self.note(&description)?;
        debug!(command = %description, log = %self.path.display(), "Running subprocess");

        cmd.stdin(Stdio::null())
            .stdout(self.stdio()?)
            .stderr(self.stdio()?)
            .kill_on_drop(true);

        let status = match cmd.status().await {
            Ok(status) => status,
            Err(e) => return Err(on_failure(format!("failed to execute {}: {}", description, e))),
        };

        if !status.success() {
            return Err(on_failure(format!(
                "{} exited with {}, see {}",
                description,
                status,
                self.path.display()
            )));
        }
        Ok(())
    }

    /// Run a command and hand back its output, which is also appended to
    /// the log. The exit status is left for the caller to judge.
    pub async fn capture(
        &self,
        cmd: &mut Command,
        on_failure: impl FnOnce(String) -> HaulError,
    ) -> HaulResult<Output> {
        self.collect(cmd).await?.map_err(on_failure)
    }

    /// Like [`run`](Self::run), but also returns the command's stdout
    pub async fn output(
        &self,
        cmd: &mut Command,
        on_failure: impl FnOnce(String) -> HaulError,
    ) -> HaulResult<String> {
        let description = format!("{:?}", cmd.as_std());
        let output = match self.collect(cmd).await? {
            Ok(output) => output,
            Err(message) => return Err(on_failure(message)),
        };
        if !output.status.success() {
            return Err(on_failure(format!(
                "{} exited with {}, see {}",
                description,
                output.status,
                self.path.display()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Outer error: the log itself. Inner error: the command could not start.
    async fn collect(&self, cmd: &mut Command) -> HaulResult<Result<Output, String>> {
        let description = format!("{:?}", cmd.as_std());
        self.note(&description)?;
        debug!(command = %description, log = %self.path.display(), "Running subprocess");

        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = match cmd.output().await {
            Ok(output) => output,
            Err(e) => return Ok(Err(format!("failed to execute {}: {}", description, e))),
        };

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&output.stdout).await?;
        file.write_all(&output.stderr).await?;
        file.flush().await?;
        Ok(Ok(output))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_appends_output() {
        let dir = tempfile::tempdir().unwrap();
        let log = SessionLog::new(dir.path().join("session.log"));

        let mut first = Command::new("sh");
        first.args(["-c", "echo first"]);
        log.run(&mut first, |m| HaulError::transfer("test", m)).await.unwrap();

        let mut second = Command::new("sh");
        second.args(["-c", "echo second >&2"]);
        log.run(&mut second, |m| HaulError::transfer("test", m)).await.unwrap();

        let content = std::fs::read_to_string(log.path()).unwrap();
        let first_at = content.find("first").unwrap();
        let second_at = content.find("second").unwrap();
        assert!(first_at < second_at);
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let log = SessionLog::new(dir.path().join("session.log"));

        let mut cmd = Command::new("sh");
        cmd.args(["-c", "exit 3"]);
        let err = log
            .run(&mut cmd, |m| HaulError::diff("diff", m))
            .await
            .unwrap_err();
        assert!(matches!(err, HaulError::Diff { .. }));
    }

    #[tokio::test]
    async fn test_output_is_returned_and_logged() {
        let dir = tempfile::tempdir().unwrap();
        let log = SessionLog::new(dir.path().join("session.log"));

        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo 'Total bytes sent: 42'; echo warning >&2"]);
        let stdout = log
            .output(&mut cmd, |m| HaulError::transfer("test", m))
            .await
            .unwrap();
        assert_eq!(stdout.trim(), "Total bytes sent: 42");

        let content = std::fs::read_to_string(log.path()).unwrap();
        assert!(content.contains("Total bytes sent: 42"));
        assert!(content.contains("warning"));
    }

    #[tokio::test]
    async fn test_capture_leaves_status_to_caller() {
        let dir = tempfile::tempdir().unwrap();
        let log = SessionLog::new(dir.path().join("session.log"));

        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo 'not supported' >&2; exit 1"]);
        let output = log
            .capture(&mut cmd, |m| HaulError::validation("test", m))
            .await
            .unwrap();
        assert!(!output.status.success());
        assert!(String::from_utf8_lossy(&output.stderr).contains("not supported"));
        assert!(std::fs::read_to_string(log.path()).unwrap().contains("not supported"));

        let mut missing = Command::new("/nonexistent/tool");
        let err = log
            .capture(&mut missing, |m| HaulError::validation("test", m))
            .await
            .unwrap_err();
        assert!(matches!(err, HaulError::Validation { .. }));
    }
}
