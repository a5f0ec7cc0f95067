//! Identity and lifecycle timestamps of one migration.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::{MigrationConfig, MigrationMode, PreDumpPolicy};
use crate::rpc::WorkloadDescriptor;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationSession {
    pub id: String,
    pub workload: WorkloadDescriptor,
    pub mode: MigrationMode,
    pub pre_dump: PreDumpPolicy,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl MigrationSession {
    pub fn new(workload: WorkloadDescriptor, config: &MigrationConfig) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            workload,
            mode: config.mode,
            pre_dump: config.pre_dump,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    pub fn mark_started(&mut self) {
        self.started_at = Some(Utc::now());
    }

    pub fn mark_finished(&mut self) {
        self.finished_at = Some(Utc::now());
    }

    pub fn is_live(&self) -> bool {
        self.mode == MigrationMode::Live
    }
}
