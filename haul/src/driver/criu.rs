//! CRIU command-line checkpoint tool.

use crate::driver::CheckpointTool;
use crate::error::{HaulError, HaulResult};
use crate::rpc::messages::CompatProbe;
use crate::session_log::SessionLog;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::info;

/// Name of the CPU description image
pub const CPUINFO_IMG: &str = "cpuinfo.img";

const CPUINFO_LOG: &str = "criu-cpuinfo.log";

pub struct CriuCli {
    bin: PathBuf,
    page_server_port: u16,
}

impl Default for CriuCli {
    fn default() -> Self {
        Self::new("criu", 27)
    }
}

impl CriuCli {
    pub fn new(bin: impl Into<PathBuf>, page_server_port: u16) -> Self {
        Self {
            bin: bin.into(),
            page_server_port,
        }
    }

    fn command(&self, args: &[&str], dir: Option<&Path>) -> Command {
        let mut cmd = Command::new(&self.bin);
        cmd.args(args);
        if let Some(dir) = dir {
            cmd.arg("--images-dir").arg(dir);
        }
        cmd
    }

    fn spawn_error(&self, message: String) -> HaulError {
        HaulError::validation("criu", format!("cannot run {}: {}", self.bin.display(), message))
    }

    async fn output(&self, args: &[&str], dir: Option<&Path>) -> HaulResult<std::process::Output> {
        self.command(args, dir)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| self.spawn_error(e.to_string()))
    }

    /// `criu cpuinfo <action>` in `work_dir`, with output kept in its log
    async fn cpuinfo(&self, action: &str, work_dir: &Path) -> HaulResult<std::process::Output> {
        let log = SessionLog::new(work_dir.join(CPUINFO_LOG));
        let mut cmd = self.command(&["cpuinfo", action], Some(work_dir));
        log.capture(&mut cmd, |m| self.spawn_error(m)).await
    }
}

/// First line of `criu --version`, without the `Version:` label
fn parse_version(output: &str) -> Option<String> {
    let line = output.lines().next()?.trim();
    let version = line.strip_prefix("Version:").unwrap_or(line).trim();
    if version.is_empty() {
        None
    } else {
        Some(version.to_string())
    }
}

#[async_trait]
impl CheckpointTool for CriuCli {
    async fn version(&self) -> HaulResult<String> {
        let output = self.output(&["--version"], None).await?;
        if !output.status.success() {
            return Err(HaulError::validation("criu version", "can't get criu version"));
        }
        parse_version(&String::from_utf8_lossy(&output.stdout))
            .ok_or_else(|| HaulError::validation("criu version", "empty version string"))
    }

    async fn cpu_probe(&self, work_dir: &Path) -> HaulResult<Option<CompatProbe>> {
        let output = self.cpuinfo("dump", work_dir).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("not supported") || stderr.contains("Unknown command") {
                info!("Dumping CPU info not supported");
                return Ok(None);
            }
            return Err(HaulError::validation("cpu", format!("can't dump cpuinfo: {}", stderr.trim())));
        }
        let data = tokio::fs::read(work_dir.join(CPUINFO_IMG)).await?;
        Ok(Some(CompatProbe {
            file_name: CPUINFO_IMG.to_string(),
            data,
        }))
    }

    async fn cpu_check(&self, work_dir: &Path, probe: &CompatProbe) -> HaulResult<bool> {
        let name = Path::new(&probe.file_name)
            .file_name()
            .ok_or_else(|| HaulError::validation("cpu", "probe has no file name"))?;
        tokio::fs::write(work_dir.join(name), &probe.data).await?;
        let output = self.cpuinfo("check", work_dir).await?;
        Ok(output.status.success())
    }

    async fn start_page_server(&self, image_dir: &Path) -> HaulResult<()> {
        let port = self.page_server_port.to_string();
        let output = self
            .output(&["page-server", "--daemon", "--port", &port], Some(image_dir))
            .await?;
        if !output.status.success() {
            return Err(HaulError::workload(
                "page_server",
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        info!(port = self.page_server_port, dir = %image_dir.display(), "Page server started");
        Ok(())
    }
}
