//! External directory-diff tool
//!
//! The tool is invoked as `<cmd> diff <old> <new> <out>` to produce a delta
//! file and `<cmd> apply <old> <patch> <out>` to rebuild a directory from it.

use crate::config::MigrationConfig;
use crate::error::{HaulError, HaulResult};
use crate::session_log::SessionLog;
use std::path::Path;
use tokio::process::Command;

/// Command line of the directory-diff tool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffTool {
    program: String,
    args: Vec<String>,
}

impl DiffTool {
    /// Parse a shell-style command such as `python3 /opt/xdelta3-dir-patcher`
    pub fn new(command: &str) -> HaulResult<Self> {
        let mut argv = shlex::split(command)
            .ok_or_else(|| HaulError::config(format!("diff tool command is malformed: {}", command)))?;
        if argv.is_empty() {
            return Err(HaulError::config("diff tool command is empty"));
        }
        let program = argv.remove(0);
        Ok(Self { program, args: argv })
    }

    pub fn from_config(config: &MigrationConfig) -> HaulResult<Self> {
        Self::new(&config.diff_tool)
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        cmd
    }

    /// Write the delta from `old` to `new` into the file `out`
    pub async fn diff(&self, old: &Path, new: &Path, out: &Path, log: &SessionLog) -> HaulResult<()> {
        let mut cmd = self.command();
        cmd.arg("diff").arg(old).arg(new).arg(out);
        log.run(&mut cmd, |m| HaulError::diff("diff", m)).await
    }

    /// Rebuild a directory at `out` from `old` plus `patch`
    pub async fn apply(&self, old: &Path, patch: &Path, out: &Path, log: &SessionLog) -> HaulResult<()> {
        let mut cmd = self.command();
        cmd.arg("apply").arg(old).arg(patch).arg(out);
        log.run(&mut cmd, |m| HaulError::diff("apply", m)).await
    }
}
