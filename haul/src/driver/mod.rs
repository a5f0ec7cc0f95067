//! Workload, filesystem and checkpoint-tool capabilities
//!
//! The orchestrator never talks to a container runtime directly. It drives
//! a [`WorkloadDriver`] (freeze, dump, restore, resume), a [`FsDriver`]
//! (bulk filesystem sync) and a [`CheckpointTool`] (compatibility probes).
//! Concrete drivers are looked up by type name in a [`DriverRegistry`].

pub mod criu;
pub mod docker;
pub mod registry;
pub mod rsync;

use crate::config::MigrationConfig;
use crate::error::HaulResult;
use crate::rpc::messages::CompatProbe;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

pub use criu::CriuCli;
pub use docker::{DockerConfig, DockerDriver};
pub use registry::{DriverFactory, DriverRegistry};
pub use rsync::SubtreeFs;

/// Which end of the migration a driver instance serves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverRole {
    Source,
    Target,
}

impl fmt::Display for DriverRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Source => write!(f, "source"),
            Self::Target => write!(f, "target"),
        }
    }
}

/// Result of one filesystem sync round
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsStats {
    pub bytes_transferred: u64,
}

/// Where a dump writes its images
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DumpContext {
    pub root_task: String,
    pub image_dir: PathBuf,
    /// Previous iteration, relative to `image_dir`, for incremental dumps
    pub parent_dir: Option<PathBuf>,
    pub work_dir: PathBuf,
}

/// Where a restore reads its images
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreContext {
    pub image_dir: PathBuf,
    pub work_dir: PathBuf,
}

/// Bulk filesystem transfer for the workload's on-disk state
#[async_trait]
pub trait FsDriver: Send {
    fn set_work_dir(&mut self, path: &Path);

    fn set_options(&mut self, config: &MigrationConfig);

    /// Preliminary sync while the workload runs
    async fn start_migration(&mut self) -> HaulResult<FsStats>;

    /// One more incremental sync while the workload runs
    async fn next_iteration(&mut self) -> HaulResult<FsStats>;

    /// Final sync with the workload stopped or frozen
    async fn stop_migration(&mut self) -> HaulResult<FsStats>;
}

/// Runtime-specific checkpoint and restore of one workload.
///
/// Source-side methods are called by the orchestrator, target-side methods
/// (`restore`, `reload_daemon`) by the target service.
#[async_trait]
pub trait WorkloadDriver: Send + Sync {
    /// Registry name of this driver type
    fn kind(&self) -> &str;

    async fn root_task_id(&self) -> HaulResult<String>;

    /// Incremental checkpoint; the workload keeps running. May be a no-op.
    async fn pre_dump(&self, ctx: &DumpContext, fs: &mut dyn FsDriver) -> HaulResult<()>;

    /// Final checkpoint; the workload is frozen or stopped on return.
    async fn final_dump(&self, ctx: &DumpContext, fs: &mut dyn FsDriver) -> HaulResult<()>;

    fn can_pre_dump(&self) -> bool;

    fn dump_needs_page_server(&self) -> bool;

    async fn start(&self) -> HaulResult<()>;

    async fn stop(&self, unmount: bool) -> HaulResult<()>;

    /// Clean up after the target took over
    async fn migration_complete(&self) -> HaulResult<()>;

    /// Best-effort rollback after a failure past the final dump
    async fn migration_fail(&self) -> HaulResult<()>;

    /// Auxiliary files shipped with a checkpoint, as `(source, archive name)`
    fn meta_images(&self, image_dir: &Path) -> Vec<(PathBuf, String)>;

    /// Filesystem driver for this workload's on-disk state
    fn fs_driver(&self, config: &MigrationConfig) -> HaulResult<Box<dyn FsDriver>>;

    /// Bring the workload up from a checkpoint (target side)
    async fn restore(&self, ctx: &RestoreContext) -> HaulResult<()>;

    /// Restart the runtime daemon so it sees synced state (target side)
    async fn reload_daemon(&self) -> HaulResult<()> {
        Ok(())
    }
}

/// External checkpoint tool queries used for compatibility checks
#[async_trait]
pub trait CheckpointTool: Send + Sync {
    /// Tool version string
    async fn version(&self) -> HaulResult<String>;

    /// Dump a CPU description into `work_dir`; `None` when unsupported
    async fn cpu_probe(&self, work_dir: &Path) -> HaulResult<Option<CompatProbe>>;

    /// Check a peer's CPU description against this host
    async fn cpu_check(&self, work_dir: &Path, probe: &CompatProbe) -> HaulResult<bool>;

    /// Serve memory pages for a dump that streams them directly
    async fn start_page_server(&self, image_dir: &Path) -> HaulResult<()>;
}
