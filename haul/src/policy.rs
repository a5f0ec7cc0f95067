//! Convergence policy
//!
//! Decides, after each pre-dump (or filesystem-only) iteration, whether one
//! more incremental round is worth it or the workload should be frozen now.
//! The decision is a pure function of the iteration index, the metric
//! measured for this round and the metric of the previous round.

use serde::{Deserialize, Serialize};
use tracing::info;

/// Hard cap on iterations used by the policy presets
pub const MAX_ITERS_COUNT: u32 = 8;

/// Minimum dumped page count for another memory iteration
pub const MIN_ITER_PAGES_COUNT: u64 = 64;

/// Minimum transferred filesystem bytes for another restart-mode iteration
pub const MIN_ITER_FS_XFER_BYTES: u64 = 0x100000;

/// Maximum acceptable growth between two iterations, in percent
pub const MAX_ITER_GROW_RATE: u64 = 10;

/// Thresholds the policy compares against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConvergenceConfig {
    /// Stop when the metric is at or below this value
    pub min_unit_count: u64,
    /// Stop when the metric grew by more than this many percent
    pub max_growth_percent: u64,
    /// Stop once the iteration index reaches this value
    pub max_iterations: u32,
}

impl ConvergenceConfig {
    /// Page-count policy for memory pre-dumps
    pub fn pages() -> Self {
        Self {
            min_unit_count: MIN_ITER_PAGES_COUNT,
            max_growth_percent: MAX_ITER_GROW_RATE,
            max_iterations: MAX_ITERS_COUNT,
        }
    }

    /// Byte-transfer policy for restart-mode filesystem iterations
    pub fn restart() -> Self {
        Self {
            min_unit_count: MIN_ITER_FS_XFER_BYTES,
            max_growth_percent: MAX_ITER_GROW_RATE,
            max_iterations: MAX_ITERS_COUNT,
        }
    }

    /// Diff-size policy for the multi-iteration pre-dump loop.
    ///
    /// `total_iterations` includes the final dump, so the loop itself may
    /// run one fewer round.
    pub fn diff_bytes(min_diff_bytes: u64, total_iterations: u32) -> Self {
        Self {
            min_unit_count: min_diff_bytes,
            max_growth_percent: MAX_ITER_GROW_RATE,
            max_iterations: total_iterations.saturating_sub(1),
        }
    }
}

impl Default for ConvergenceConfig {
    fn default() -> Self {
        Self::pages()
    }
}

/// Outcome of a convergence check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Continue,
    Stop,
}

impl Decision {
    pub fn should_continue(self) -> bool {
        self == Self::Continue
    }
}

/// Growth of `metric` over `prev_metric` in whole percent.
///
/// Integer division truncates toward zero; a shrinking metric yields a
/// negative rate. A zero previous metric counts as unbounded growth.
pub fn growth_percent(metric: u64, prev_metric: u64) -> i128 {
    if prev_metric == 0 {
        return i128::MAX;
    }
    let delta = metric as i128 - prev_metric as i128;
    delta * 100 / prev_metric as i128
}

/// Decide whether to run another iteration.
pub fn decide(
    index: u32,
    metric: u64,
    prev_metric: Option<u64>,
    config: &ConvergenceConfig,
) -> Decision {
    if metric <= config.min_unit_count {
        info!(index, metric, min = config.min_unit_count, "Small iteration, stopping");
        return Decision::Stop;
    }

    if let Some(prev) = prev_metric {
        let growth = growth_percent(metric, prev);
        if growth > config.max_growth_percent as i128 {
            info!(index, metric, prev, growth = %growth, "Iteration grows, stopping");
            return Decision::Stop;
        }
    }

    if index >= config.max_iterations {
        info!(index, max = config.max_iterations, "Too many iterations, stopping");
        return Decision::Stop;
    }

    info!(index, metric, "Proceeding to next iteration");
    Decision::Continue
}
