//! Migration phase state machine: explicit phases and legal transition guards.
//!
//! Every session starts at `Init` and ends at `Complete` or `Failed`. The
//! orchestrator calls `advance()` to move between phases; each call checks
//! the edge against the transition table and records it.

use std::fmt;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::error::HaulError;

/// The phases of one migration session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationPhase {
    /// Session created, peer not yet checked.
    Init,
    /// Compatibility checks against the peer.
    Validate,
    /// Incremental checkpoint while the workload runs.
    PreDump,
    /// Final checkpoint; the workload is frozen from here on.
    FinalDump,
    /// Filesystem sync.
    FsSync,
    /// Checkpoint images streamed to the target.
    ImageTransfer,
    /// Target rebuilds the final images from a delta.
    DiffApply,
    /// Workload brought up on the target.
    Restore,
    /// Migration succeeded (terminal).
    Complete,
    /// Migration aborted (terminal).
    Failed,
}

impl MigrationPhase {
    /// Whether this is a terminal phase (no further transitions allowed).
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }
}

impl fmt::Display for MigrationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Init => write!(f, "Init"),
            Self::Validate => write!(f, "Validate"),
            Self::PreDump => write!(f, "PreDump"),
            Self::FinalDump => write!(f, "FinalDump"),
            Self::FsSync => write!(f, "FsSync"),
            Self::ImageTransfer => write!(f, "ImageTransfer"),
            Self::DiffApply => write!(f, "DiffApply"),
            Self::Restore => write!(f, "Restore"),
            Self::Complete => write!(f, "Complete"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// Legal transitions between phases.
///
/// ```text
/// Init → Validate
/// Validate → PreDump | FinalDump | FsSync
/// PreDump → PreDump | FinalDump
/// FinalDump → FsSync
/// FsSync → FsSync | ImageTransfer | Restore
/// ImageTransfer → DiffApply | Restore
/// DiffApply → Restore
/// Restore → Complete
/// ```
fn is_legal_transition(from: MigrationPhase, to: MigrationPhase) -> bool {
    use MigrationPhase::*;

    // Any non-terminal phase can transition to Failed.
    if to == Failed && !from.is_terminal() {
        return true;
    }

    matches!(
        (from, to),
        (Init, Validate)
            | (Validate, PreDump)
            | (Validate, FinalDump)
            // restart mode goes straight to filesystem iterations
            | (Validate, FsSync)
            | (PreDump, PreDump)
            | (PreDump, FinalDump)
            | (FinalDump, FsSync)
            | (FsSync, FsSync)
            | (FsSync, ImageTransfer)
            | (FsSync, Restore)
            | (ImageTransfer, DiffApply)
            | (ImageTransfer, Restore)
            | (DiffApply, Restore)
            | (Restore, Complete)
    )
}

/// A single recorded phase transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub from: MigrationPhase,
    pub to: MigrationPhase,
    /// Checkpoint iteration at the time of transition (0 before the first).
    pub iteration: u32,
    /// Milliseconds since the state machine was created.
    pub elapsed_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Error returned when an illegal transition is attempted.
#[derive(Debug, Clone)]
pub struct IllegalTransition {
    pub from: MigrationPhase,
    pub to: MigrationPhase,
}

impl fmt::Display for IllegalTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Illegal phase transition: {} → {}", self.from, self.to)
    }
}

impl std::error::Error for IllegalTransition {}

impl From<IllegalTransition> for HaulError {
    fn from(err: IllegalTransition) -> Self {
        HaulError::invalid_state(err.to_string())
    }
}

/// Tracks the current phase and the full transition log of a session.
pub struct PhaseMachine {
    current: MigrationPhase,
    iteration: u32,
    created_at: Instant,
    transitions: Vec<TransitionRecord>,
}

impl PhaseMachine {
    pub fn new() -> Self {
        Self {
            current: MigrationPhase::Init,
            iteration: 0,
            created_at: Instant::now(),
            transitions: Vec::new(),
        }
    }

    pub fn current(&self) -> MigrationPhase {
        self.current
    }

    pub fn iteration(&self) -> u32 {
        self.iteration
    }

    pub fn set_iteration(&mut self, iteration: u32) {
        self.iteration = iteration;
    }

    /// Attempt to advance to the next phase.
    pub fn advance(
        &mut self,
        to: MigrationPhase,
        reason: Option<&str>,
    ) -> Result<(), IllegalTransition> {
        if !is_legal_transition(self.current, to) {
            return Err(IllegalTransition {
                from: self.current,
                to,
            });
        }

        let record = TransitionRecord {
            from: self.current,
            to,
            iteration: self.iteration,
            elapsed_ms: self.created_at.elapsed().as_millis() as u64,
            reason: reason.map(String::from),
        };

        tracing::debug!(
            from = %self.current,
            to = %to,
            iteration = self.iteration,
            "Phase transition"
        );

        self.transitions.push(record);
        self.current = to;
        Ok(())
    }

    /// Transition to `Failed` from any non-terminal phase.
    pub fn fail(&mut self, reason: &str) -> Result<(), IllegalTransition> {
        self.advance(MigrationPhase::Failed, Some(reason))
    }

    pub fn is_terminal(&self) -> bool {
        self.current.is_terminal()
    }

    pub fn transitions(&self) -> &[TransitionRecord] {
        &self.transitions
    }

    /// Whether the session ever entered `phase`
    pub fn visited(&self, phase: MigrationPhase) -> bool {
        self.transitions.iter().any(|t| t.to == phase)
    }

    /// One-line history, e.g. `Init → Complete (5120ms, 7 transitions) [...]`
    pub fn summary(&self) -> String {
        let phases: Vec<String> = self.transitions.iter().map(|t| t.to.to_string()).collect();
        let mut summary = format!(
            "{} → {} ({}ms, {} transitions)",
            MigrationPhase::Init,
            self.current,
            self.created_at.elapsed().as_millis(),
            self.transitions.len(),
        );
        if !phases.is_empty() {
            summary.push_str(&format!(" [{}]", phases.join(" → ")));
        }
        summary
    }
}

impl Default for PhaseMachine {
    fn default() -> Self {
        Self::new()
    }
}
