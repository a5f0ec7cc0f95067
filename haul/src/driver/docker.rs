//! Docker workload driver
//!
//! Checkpoints and restores a container through the docker CLI
//! (`docker checkpoint --image-dir=...`, `docker restore --image-dir=...`).
//! Layer bookkeeping is out of scope: the container's config directory is
//! synced with rsync and the runtime state file travels as a meta image.

use crate::config::MigrationConfig;
use crate::driver::rsync::SubtreeFs;
use crate::driver::{DriverRole, DumpContext, FsDriver, RestoreContext, WorkloadDriver};
use crate::error::{HaulError, HaulResult};
use crate::session_log::SessionLog;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::process::Command;
use tracing::{info, warn};

/// Paths and commands of the local docker installation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DockerConfig {
    pub docker_bin: PathBuf,
    /// Docker data root (`containers/<id>` lives here)
    pub root_dir: PathBuf,
    /// Runtime state root (`<id>/state.json` lives here)
    pub run_meta_dir: PathBuf,
    /// Whether checkpoint-and-resume pre-dumps are supported
    pub pre_dump: bool,
    /// Command that restarts the docker daemon on the target
    pub daemon_reload: Vec<String>,
    /// Log for commands run outside a session work directory
    pub log_path: PathBuf,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            docker_bin: PathBuf::from("/usr/bin/docker"),
            root_dir: PathBuf::from("/var/lib/docker"),
            run_meta_dir: PathBuf::from("/var/run/docker/execdriver/native"),
            pre_dump: false,
            daemon_reload: vec![
                "systemctl".to_string(),
                "restart".to_string(),
                "docker".to_string(),
            ],
            log_path: std::env::temp_dir().join("phaul-docker.log"),
        }
    }
}

/// Driver for one docker container
pub struct DockerDriver {
    id: String,
    role: DriverRole,
    config: DockerConfig,
    last_dump: Mutex<Option<PathBuf>>,
}

impl DockerDriver {
    pub fn new(id: &str, role: DriverRole, config: DockerConfig) -> HaulResult<Self> {
        if id.len() < 3 {
            return Err(HaulError::config(format!(
                "docker container id '{}' is too short (need at least 3 characters)",
                id
            )));
        }
        Ok(Self {
            id: id.to_string(),
            role,
            config,
            last_dump: Mutex::new(None),
        })
    }

    fn docker(&self) -> Command {
        Command::new(&self.config.docker_bin)
    }

    fn image_dir_arg(dir: &Path) -> String {
        format!("--image-dir={}", dir.display())
    }

    async fn checkpoint(&self, image_dir: &Path, log: &SessionLog) -> HaulResult<()> {
        let mut cmd = self.docker();
        cmd.arg("checkpoint").arg(Self::image_dir_arg(image_dir)).arg(&self.id);
        log.run(&mut cmd, |m| HaulError::workload("checkpoint", m)).await
    }

    async fn restore_from(&self, image_dir: &Path, log: &SessionLog) -> HaulResult<()> {
        let mut cmd = self.docker();
        cmd.arg("restore").arg(Self::image_dir_arg(image_dir)).arg(&self.id);
        log.run(&mut cmd, |m| HaulError::workload("restore", m)).await
    }

    async fn simple(&self, verb: &str) -> HaulResult<()> {
        let log = SessionLog::new(&self.config.log_path);
        let mut cmd = self.docker();
        cmd.arg(verb).arg(&self.id);
        log.run(&mut cmd, |m| HaulError::workload(verb, m)).await
    }

    fn remember_dump(&self, dir: &Path) {
        if let Ok(mut last) = self.last_dump.lock() {
            *last = Some(dir.to_path_buf());
        }
    }
}

#[async_trait]
impl WorkloadDriver for DockerDriver {
    fn kind(&self) -> &str {
        "docker"
    }

    async fn root_task_id(&self) -> HaulResult<String> {
        Ok(self.id.clone())
    }

    async fn pre_dump(&self, ctx: &DumpContext, _fs: &mut dyn FsDriver) -> HaulResult<()> {
        if !self.config.pre_dump {
            return Ok(());
        }
        info!(container = %self.id, dir = %ctx.image_dir.display(), "Pre-dumping container");
        let log = SessionLog::new(ctx.work_dir.join("docker_pre_dump.log"));
        self.checkpoint(&ctx.image_dir, &log).await?;
        // the container keeps running on the source
        self.restore_from(&ctx.image_dir, &log).await
    }

    async fn final_dump(&self, ctx: &DumpContext, _fs: &mut dyn FsDriver) -> HaulResult<()> {
        info!(container = %self.id, dir = %ctx.image_dir.display(), "Dumping container");
        let log = SessionLog::new(ctx.work_dir.join("docker_checkpoint_final.log"));
        self.remember_dump(&ctx.image_dir);
        self.checkpoint(&ctx.image_dir, &log).await
    }

    fn can_pre_dump(&self) -> bool {
        self.config.pre_dump
    }

    fn dump_needs_page_server(&self) -> bool {
        false
    }

    async fn start(&self) -> HaulResult<()> {
        self.simple("start").await
    }

    async fn stop(&self, _unmount: bool) -> HaulResult<()> {
        self.simple("stop").await
    }

    async fn migration_complete(&self) -> HaulResult<()> {
        if self.role == DriverRole::Source {
            info!(container = %self.id, "Removing container from source");
            self.simple("rm").await?;
        }
        Ok(())
    }

    async fn migration_fail(&self) -> HaulResult<()> {
        let last = self.last_dump.lock().ok().and_then(|last| last.clone());
        match last {
            Some(dir) => {
                warn!(container = %self.id, dir = %dir.display(), "Resuming container on source");
                let log = SessionLog::new(&self.config.log_path);
                self.restore_from(&dir, &log).await
            }
            None => Ok(()),
        }
    }

    fn meta_images(&self, image_dir: &Path) -> Vec<(PathBuf, String)> {
        [
            (self.config.run_meta_dir.join(&self.id).join("state.json"), "state.json"),
            (image_dir.join("descriptors.json"), "descriptors.json"),
        ]
        .into_iter()
        .filter(|(path, _)| path.is_file())
        .map(|(path, name)| (path, name.to_string()))
        .collect()
    }

    fn fs_driver(&self, config: &MigrationConfig) -> HaulResult<Box<dyn FsDriver>> {
        let subtree = self.config.root_dir.join("containers").join(&self.id);
        let mut fs = SubtreeFs::new(vec![subtree]);
        fs.set_options(config);
        Ok(Box::new(fs))
    }

    async fn restore(&self, ctx: &RestoreContext) -> HaulResult<()> {
        let state = ctx.image_dir.join("state.json");
        if state.is_file() {
            let meta_dir = self.config.run_meta_dir.join(&self.id);
            tokio::fs::create_dir_all(&meta_dir).await?;
            tokio::fs::copy(&state, meta_dir.join("state.json")).await?;
        }
        info!(container = %self.id, dir = %ctx.image_dir.display(), "Restoring container");
        let log = SessionLog::new(ctx.work_dir.join("docker_restore.log"));
        self.restore_from(&ctx.image_dir, &log).await
    }

    async fn reload_daemon(&self) -> HaulResult<()> {
        let Some((program, args)) = self.config.daemon_reload.split_first() else {
            return Ok(());
        };
        let log = SessionLog::new(&self.config.log_path);
        let mut cmd = Command::new(program);
        cmd.args(args);
        log.run(&mut cmd, |m| HaulError::workload("reload_daemon", m)).await
    }
}
