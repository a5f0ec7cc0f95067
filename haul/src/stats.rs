//! Migration statistics
//!
//! The orchestrator reports phase boundaries, per-iteration sizes and
//! transferred bytes to an injected [`MetricsSink`]. [`LiveStats`] is the
//! stock sink: it keeps everything in memory and, when the session ends,
//! builds a [`StatsReport`] and appends it as one JSON line to the configured
//! stats file.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::MigrationMode;
use crate::orchestrator::MigrationPhase;

/// Timings only the target host can measure
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PeerTimings {
    pub restore: Option<Duration>,
    pub diff_apply: Option<Duration>,
    pub reload: Option<Duration>,
}

/// Receives progress events from the orchestrator
pub trait MetricsSink: Send {
    fn phase_started(&mut self, phase: MigrationPhase);

    fn phase_finished(&mut self, phase: MigrationPhase);

    /// One checkpoint iteration finished; `bytes` is what went over the wire
    fn iteration_finished(&mut self, index: u32, bytes: u64, elapsed: Duration);

    /// Bytes moved outside of iteration transfers (filesystem sync)
    fn bytes_transferred(&mut self, stage: &str, bytes: u64);

    fn add_sleep(&mut self, slept: Duration);

    /// Session is over; return the final report
    fn finish(&mut self, peer: PeerTimings, succeeded: bool) -> StatsReport;
}

/// Start and end of one phase, relative to session start
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseTiming {
    pub phase: MigrationPhase,
    pub started_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_ms: Option<u64>,
}

impl PhaseTiming {
    pub fn duration_ms(&self) -> Option<u64> {
        self.finished_ms.map(|end| end.saturating_sub(self.started_ms))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IterationStats {
    pub index: u32,
    pub bytes: u64,
    pub elapsed_ms: u64,
}

/// Final report of one migration session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsReport {
    pub session_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub mode: MigrationMode,
    pub succeeded: bool,
    pub total_ms: u64,
    /// Final dump start to restore end; the workload is unavailable here
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub freeze_ms: Option<u64>,
    /// Time spent streaming images after the final dump
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_transfer_ms: Option<u64>,
    pub sleep_ms: u64,
    pub bytes_transferred: u64,
    pub bytes_by_stage: BTreeMap<String, u64>,
    pub iterations: Vec<IterationStats>,
    pub phases: Vec<PhaseTiming>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restore_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff_apply_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reload_ms: Option<u64>,
}

/// In-memory collector for one session
pub struct LiveStats {
    session_id: String,
    mode: MigrationMode,
    started_at: DateTime<Utc>,
    start: Instant,
    phases: Vec<PhaseTiming>,
    iterations: Vec<IterationStats>,
    bytes_by_stage: BTreeMap<String, u64>,
    sleep: Duration,
    stats_path: Option<PathBuf>,
}

fn millis(d: Duration) -> u64 {
    d.as_millis() as u64
}

impl LiveStats {
    pub fn new(session_id: &str, mode: MigrationMode, stats_path: Option<PathBuf>) -> Self {
        Self {
            session_id: session_id.to_string(),
            mode,
            started_at: Utc::now(),
            start: Instant::now(),
            phases: Vec::new(),
            iterations: Vec::new(),
            bytes_by_stage: BTreeMap::new(),
            sleep: Duration::ZERO,
            stats_path,
        }
    }

    fn now_ms(&self) -> u64 {
        millis(self.start.elapsed())
    }

    fn first_start(&self, phase: MigrationPhase) -> Option<u64> {
        self.phases
            .iter()
            .find(|p| p.phase == phase)
            .map(|p| p.started_ms)
    }

    fn last_finish(&self, phase: MigrationPhase) -> Option<u64> {
        self.phases
            .iter()
            .rev()
            .find(|p| p.phase == phase)
            .and_then(|p| p.finished_ms)
    }

    pub fn phases(&self) -> &[PhaseTiming] {
        &self.phases
    }
}

impl MetricsSink for LiveStats {
    fn phase_started(&mut self, phase: MigrationPhase) {
        let started_ms = self.now_ms();
        self.phases.push(PhaseTiming {
            phase,
            started_ms,
            finished_ms: None,
        });
    }

    fn phase_finished(&mut self, phase: MigrationPhase) {
        let now = self.now_ms();
        if let Some(timing) = self
            .phases
            .iter_mut()
            .rev()
            .find(|p| p.phase == phase && p.finished_ms.is_none())
        {
            timing.finished_ms = Some(now);
        }
    }

    fn iteration_finished(&mut self, index: u32, bytes: u64, elapsed: Duration) {
        info!(iteration = index, bytes, elapsed_ms = millis(elapsed), "Iteration finished");
        self.iterations.push(IterationStats {
            index,
            bytes,
            elapsed_ms: millis(elapsed),
        });
    }

    fn bytes_transferred(&mut self, stage: &str, bytes: u64) {
        *self.bytes_by_stage.entry(stage.to_string()).or_default() += bytes;
    }

    fn add_sleep(&mut self, slept: Duration) {
        self.sleep += slept;
    }

    fn finish(&mut self, peer: PeerTimings, succeeded: bool) -> StatsReport {
        let freeze_ms = match (
            self.first_start(MigrationPhase::FinalDump),
            self.last_finish(MigrationPhase::Restore),
        ) {
            (Some(start), Some(end)) => Some(end.saturating_sub(start)),
            _ => None,
        };
        let image_transfer_ms = self
            .phases
            .iter()
            .filter(|p| p.phase == MigrationPhase::ImageTransfer)
            .filter_map(PhaseTiming::duration_ms)
            .reduce(|a, b| a + b);
        let iteration_bytes: u64 = self.iterations.iter().map(|i| i.bytes).sum();
        let stage_bytes: u64 = self.bytes_by_stage.values().sum();

        let report = StatsReport {
            session_id: self.session_id.clone(),
            started_at: self.started_at,
            finished_at: Utc::now(),
            mode: self.mode,
            succeeded,
            total_ms: self.now_ms(),
            freeze_ms,
            image_transfer_ms,
            sleep_ms: millis(self.sleep),
            bytes_transferred: iteration_bytes + stage_bytes,
            bytes_by_stage: self.bytes_by_stage.clone(),
            iterations: self.iterations.clone(),
            phases: self.phases.clone(),
            restore_ms: peer.restore.map(millis),
            diff_apply_ms: peer.diff_apply.map(millis),
            reload_ms: peer.reload.map(millis),
        };

        info!(
            session = %report.session_id,
            succeeded,
            total_ms = report.total_ms,
            freeze_ms = ?report.freeze_ms,
            bytes = report.bytes_transferred,
            "Migration stats"
        );
        if let Some(path) = &self.stats_path {
            append_report(&report, path);
        }
        report
    }
}

/// Append `report` as one line to a JSONL file. Failures are logged only.
pub fn append_report(report: &StatsReport, path: &Path) {
    match serde_json::to_string(report) {
        Ok(json) => {
            use std::io::Write;
            match std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
            {
                Ok(mut file) => {
                    if let Err(e) = writeln!(file, "{json}") {
                        warn!("Failed to append stats: {e}");
                    } else {
                        info!(path = %path.display(), "Appended migration stats");
                    }
                }
                Err(e) => warn!("Failed to open stats file: {e}"),
            }
        }
        Err(e) => warn!("Failed to serialize stats: {e}"),
    }
}
