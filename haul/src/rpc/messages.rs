//! Wire messages between the source orchestrator and the target service.
//!
//! One JSON object per line in each direction. A request names its method
//! and carries its arguments under `params`; every request gets exactly one
//! response before the next request is sent.

use crate::config::{MigrationConfig, MigrationMode};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies the workload being migrated
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadDescriptor {
    /// Driver type name, as registered in the driver registry
    pub kind: String,
    /// Runtime-specific identifier (container id, pid)
    pub id: String,
}

impl WorkloadDescriptor {
    pub fn new(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for WorkloadDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

/// Hardware compatibility probe produced by the checkpoint tool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompatProbe {
    /// File name the probe is stored under in the work directory
    pub file_name: String,
    pub data: Vec<u8>,
}

/// Which target directory receives an image stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageDirKind {
    WorkDir,
    ImageDir,
}

/// What an image stream contains
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImagePayload {
    /// A complete checkpoint; the iteration counts as synced once unpacked
    Full,
    /// A delta to be applied with `apply_diff_images`
    Diff,
}

/// Requests sent to the target host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "snake_case")]
pub enum RpcRequest {
    Setup {
        workload: WorkloadDescriptor,
        mode: MigrationMode,
    },
    PropagateConfig {
        config: MigrationConfig,
    },
    CheckCompat {
        probe: CompatProbe,
    },
    CheckToolVersion {
        version: String,
    },
    StartIteration {
        need_page_server: bool,
    },
    StartAcceptImages {
        dir: ImageDirKind,
        payload: ImagePayload,
    },
    StopAcceptImages,
    ApplyDiffImages,
    RestoreFromImages,
    ReloadWorkloadDaemonNonblocking,
    StartWorkload,
    MigrationComplete,
    RestoreTime,
    DiffApplyTime,
    ReloadTime,
}

impl RpcRequest {
    /// Method name as it appears on the wire
    pub fn method(&self) -> &'static str {
        match self {
            Self::Setup { .. } => "setup",
            Self::PropagateConfig { .. } => "propagate_config",
            Self::CheckCompat { .. } => "check_compat",
            Self::CheckToolVersion { .. } => "check_tool_version",
            Self::StartIteration { .. } => "start_iteration",
            Self::StartAcceptImages { .. } => "start_accept_images",
            Self::StopAcceptImages => "stop_accept_images",
            Self::ApplyDiffImages => "apply_diff_images",
            Self::RestoreFromImages => "restore_from_images",
            Self::ReloadWorkloadDaemonNonblocking => "reload_workload_daemon_nonblocking",
            Self::StartWorkload => "start_workload",
            Self::MigrationComplete => "migration_complete",
            Self::RestoreTime => "restore_time",
            Self::DiffApplyTime => "diff_apply_time",
            Self::ReloadTime => "reload_time",
        }
    }
}

/// Response to one request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub ok: bool,
    #[serde(default)]
    pub result: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RpcResponse {
    pub fn success(result: serde_json::Value) -> Self {
        Self {
            ok: true,
            result,
            error: None,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            result: serde_json::Value::Null,
            error: Some(message.into()),
        }
    }
}
