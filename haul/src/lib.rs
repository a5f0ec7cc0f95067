//! Live workload migration engine
//!
//! This library moves a running workload (a container or process tree)
//! between two hosts using an external checkpoint/restore tool:
//! - iterative pre-dumps shipped as full image sets or binary diffs
//! - a final dump, filesystem sync and restore on the target
//! - a restart mode that syncs the filesystem and restarts from scratch
//!
//! # Layout
//!
//! - [`orchestrator`]: phase machine and the source-side protocol
//! - [`images`]: iteration directories, diffs and their transfer
//! - [`rpc`]: the host coordination contract, its client and the target service
//! - [`policy`]: when to stop pre-dumping
//! - [`driver`]: workload, filesystem and checkpoint-tool capabilities
//! - [`stats`]: per-session metrics and the JSONL stats report
//!
//! # Usage
//!
//! ```bash
//! # on the target
//! phaul serve --listen 0.0.0.0:12345
//!
//! # on the source
//! phaul migrate docker 3f2a9c --to target-host --port 12345
//! ```

pub mod config;
pub mod driver;
pub mod error;
pub mod images;
pub mod orchestrator;
pub mod policy;
pub mod rpc;
pub mod session_log;
pub mod stats;

// Re-export key configuration and error types
pub use config::{MigrationConfig, MigrationMode, PreDumpPolicy, TransferStrategy};
pub use error::{HaulError, HaulResult};

// Re-export the orchestration surface
pub use orchestrator::{LiveProtocol, MigrationPhase, MigrationSession, Orchestrator, PhaseMachine};
pub use policy::{decide, ConvergenceConfig, Decision};

// Re-export image store types
pub use images::{DiffArtifact, DiffTool, ImageStore, Packaging};

// Re-export coordination types
pub use rpc::{
    connect_tcp, HostCoordination, ImageDirKind, ImagePayload, RemoteHost, TargetService,
    WorkloadDescriptor,
};

// Re-export driver types
pub use driver::{
    CheckpointTool, CriuCli, DockerConfig, DockerDriver, DriverRegistry, DriverRole, FsDriver,
    FsStats, SubtreeFs, WorkloadDriver,
};

pub use stats::{LiveStats, MetricsSink, PeerTimings, StatsReport};
