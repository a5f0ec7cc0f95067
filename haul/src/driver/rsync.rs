//! Subtree filesystem driver: rsync of a fixed set of directories to the
//! same parent path on the destination host.

use crate::config::MigrationConfig;
use crate::driver::{FsDriver, FsStats};
use crate::error::{HaulError, HaulResult};
use crate::session_log::SessionLog;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::info;

const RSYNC_LOG_NAME: &str = "rsync.log";

pub struct SubtreeFs {
    program: PathBuf,
    roots: Vec<PathBuf>,
    destination: Option<String>,
    work_dir: Option<PathBuf>,
    legacy_transfer: bool,
}

impl SubtreeFs {
    pub fn new(roots: Vec<PathBuf>) -> Self {
        for root in &roots {
            info!(path = %root.display(), "Initialized subtree FS hauler");
        }
        Self {
            program: PathBuf::from("rsync"),
            roots,
            destination: None,
            work_dir: None,
            legacy_transfer: false,
        }
    }

    /// Use another rsync binary
    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    fn log_path(&self) -> PathBuf {
        self.work_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir)
            .join(RSYNC_LOG_NAME)
    }

    async fn run_rsync(&self) -> HaulResult<FsStats> {
        let host = self
            .destination
            .as_deref()
            .ok_or_else(|| HaulError::config("filesystem sync needs a destination host"))?;

        let log = SessionLog::new(self.log_path());
        let mut total = 0u64;
        for root in &self.roots {
            let parent = root.parent().unwrap_or_else(|| Path::new("/"));
            let dst = format!("{}:{}", host, parent.display());
            let mut cmd = Command::new(&self.program);
            cmd.args(["-a", "--stats", "-e", "ssh -p22", "--timeout=7200"])
                .arg(root)
                .arg(&dst);
            let stats = log
                .output(&mut cmd, |m| HaulError::transfer("fs_sync", m))
                .await?;
            total += parse_bytes_sent(&stats);
        }
        Ok(FsStats {
            bytes_transferred: total,
        })
    }
}

/// Extract `Total bytes sent: 1,234` from rsync `--stats` output
fn parse_bytes_sent(stats: &str) -> u64 {
    stats
        .lines()
        .find_map(|line| line.trim().strip_prefix("Total bytes sent:"))
        .map(|rest| {
            rest.chars()
                .filter(|c| c.is_ascii_digit())
                .collect::<String>()
        })
        .and_then(|digits| digits.parse().ok())
        .unwrap_or(0)
}

#[async_trait]
impl FsDriver for SubtreeFs {
    fn set_work_dir(&mut self, path: &Path) {
        self.work_dir = Some(path.to_path_buf());
    }

    fn set_options(&mut self, config: &MigrationConfig) {
        self.destination = config.to.clone();
        self.legacy_transfer = config.is_legacy_transfer();
    }

    async fn start_migration(&mut self) -> HaulResult<FsStats> {
        info!("Starting FS migration");
        // layered transfers ship the container layers elsewhere
        if !self.legacy_transfer {
            return Ok(FsStats::default());
        }
        self.run_rsync().await
    }

    async fn next_iteration(&mut self) -> HaulResult<FsStats> {
        self.run_rsync().await
    }

    async fn stop_migration(&mut self) -> HaulResult<FsStats> {
        info!("Doing final FS sync");
        self.run_rsync().await
    }
}
