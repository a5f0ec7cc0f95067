//! Migration configuration
//!
//! `MigrationConfig` is assembled from defaults, an optional TOML file,
//! `PHAUL_*` environment variables and finally command-line flags. Every
//! value that can be wrong is checked by [`MigrationConfig::validate`] before
//! a session starts, so a bad compression level fails at startup rather than
//! in the middle of a transfer.

use crate::error::{HaulError, HaulResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Default root for image working directories
pub const DEFAULT_IMG_PATH: &str = "/var/local/p.haul-fs/";

/// Default directory-diff tool
pub const DEFAULT_DIFF_TOOL: &str = "xdelta3-dir-patcher";

/// Highest accepted compression level
pub const MAX_COMPRESSION_LEVEL: u8 = 9;

/// How the workload is moved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationMode {
    /// Checkpoint memory and restore it on the target
    Live,
    /// Sync the filesystem, stop on the source and start fresh on the target
    Restart,
}

impl fmt::Display for MigrationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Live => write!(f, "live"),
            Self::Restart => write!(f, "restart"),
        }
    }
}

impl FromStr for MigrationMode {
    type Err = HaulError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "live" => Ok(Self::Live),
            "restart" => Ok(Self::Restart),
            other => Err(HaulError::config(format!(
                "unknown migration mode '{}' (expected live or restart)",
                other
            ))),
        }
    }
}

/// Whether incremental checkpoints are taken before the final dump
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreDumpPolicy {
    /// Ask the workload driver
    Auto,
    Enabled,
    Disabled,
}

impl PreDumpPolicy {
    /// Resolve `Auto` against what the workload driver supports
    pub fn resolve(self, driver_can_pre_dump: bool) -> bool {
        match self {
            Self::Auto => driver_can_pre_dump,
            Self::Enabled => true,
            Self::Disabled => false,
        }
    }
}

impl fmt::Display for PreDumpPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auto => write!(f, "auto"),
            Self::Enabled => write!(f, "enabled"),
            Self::Disabled => write!(f, "disabled"),
        }
    }
}

impl FromStr for PreDumpPolicy {
    type Err = HaulError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "enabled" | "enable" | "on" | "true" => Ok(Self::Enabled),
            "disabled" | "disable" | "off" | "false" => Ok(Self::Disabled),
            other => Err(HaulError::config(format!(
                "unknown pre-dump policy '{}' (expected auto, enabled or disabled)",
                other
            ))),
        }
    }
}

/// How image directories are packaged onto the image channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStrategy {
    /// Plain archive, no compression
    Archive,
    /// Archive piped through a single-threaded compressor
    ArchiveCompress,
    /// Archive piped through a parallel compressor
    ThreadedCompress,
}

impl fmt::Display for TransferStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Archive => write!(f, "archive"),
            Self::ArchiveCompress => write!(f, "archive-compress"),
            Self::ThreadedCompress => write!(f, "threaded-compress"),
        }
    }
}

impl FromStr for TransferStrategy {
    type Err = HaulError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('_', "-").as_str() {
            "archive" => Ok(Self::Archive),
            "archive-compress" | "compress" => Ok(Self::ArchiveCompress),
            "threaded-compress" | "threaded" => Ok(Self::ThreadedCompress),
            other => Err(HaulError::config(format!(
                "unknown transfer strategy '{}'",
                other
            ))),
        }
    }
}

/// Top-level migration configuration, shared verbatim with the target host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationConfig {
    /// Migration mode
    pub mode: MigrationMode,

    /// Pre-dump policy for live mode
    pub pre_dump: PreDumpPolicy,

    /// Total number of checkpoint iterations, the final dump included
    pub max_iterations: u32,

    /// Minimum diff size worth transferring (`4m`, `512k`, `0` = unlimited)
    pub iter_threshold: String,

    /// Apply `iter_threshold` in the multi-iteration loop
    pub enforce_iter_threshold: bool,

    /// Diffs at or below this size stop the pre-dump loop
    pub min_diff_bytes: u64,

    /// Compression level, 0 disables compression
    pub compression_level: u8,

    /// Packaging strategy for image transfers
    pub transfer: TransferStrategy,

    /// Keep image directories after the migration
    pub keep_images: bool,

    /// Skip every sanity check
    pub force: bool,

    /// Skip the CPU compatibility check
    pub skip_cpu_check: bool,

    /// Skip the checkpoint tool version check
    pub skip_criu_check: bool,

    /// Destination host (used by filesystem drivers that push over ssh)
    pub to: Option<String>,

    /// Root directory for image working directories
    pub img_path: PathBuf,

    /// Directory-diff tool command line (split shell-style)
    pub diff_tool: String,

    /// Upper bound for joining a receive-side unpack task
    pub unpack_timeout_secs: u64,

    /// Minimum wait between the last pre-dump and the final dump
    pub predump_settle_secs: u64,

    /// Pause before retrying an iteration discarded by the threshold
    pub iteration_interval_secs: u64,

    /// Append a JSON stats report to this file when the migration ends
    pub stats_path: Option<PathBuf>,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            mode: MigrationMode::Live,
            pre_dump: PreDumpPolicy::Auto,
            max_iterations: 4,
            iter_threshold: "0".to_string(),
            enforce_iter_threshold: false,
            min_diff_bytes: 64 * 4096,
            compression_level: 0,
            transfer: TransferStrategy::ThreadedCompress,
            keep_images: false,
            force: false,
            skip_cpu_check: false,
            skip_criu_check: false,
            to: None,
            img_path: PathBuf::from(DEFAULT_IMG_PATH),
            diff_tool: DEFAULT_DIFF_TOOL.to_string(),
            unpack_timeout_secs: 3600,
            predump_settle_secs: 5,
            iteration_interval_secs: 2,
            stats_path: None,
        }
    }
}

fn env_flag(name: &str) -> Option<bool> {
    std::env::var(name)
        .ok()
        .map(|val| val.to_lowercase() == "true" || val == "1")
}

fn parse_env_number<T: FromStr>(name: &str, value: &str) -> HaulResult<T> {
    value
        .trim()
        .parse()
        .map_err(|_| HaulError::config(format!("{}: invalid number '{}'", name, value)))
}

impl MigrationConfig {
    /// Create config from environment variables
    pub fn from_env() -> HaulResult<Self> {
        let mut config = Self::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Load config from a TOML file; missing keys keep their defaults
    pub fn from_toml_file(path: impl AsRef<Path>) -> HaulResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            HaulError::config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&content)
    }

    /// Parse config from TOML text
    pub fn from_toml_str(content: &str) -> HaulResult<Self> {
        toml::from_str(content).map_err(|e| HaulError::config(e.to_string()))
    }

    /// Overlay `PHAUL_*` environment variables onto this config
    pub fn apply_env(&mut self) -> HaulResult<()> {
        if let Ok(mode) = std::env::var("PHAUL_MODE") {
            self.mode = mode.parse()?;
        }
        if let Ok(policy) = std::env::var("PHAUL_PRE_DUMP") {
            self.pre_dump = policy.parse()?;
        }
        if let Ok(max) = std::env::var("PHAUL_ITER_MAX") {
            self.max_iterations = parse_env_number("PHAUL_ITER_MAX", &max)?;
        }
        if let Ok(threshold) = std::env::var("PHAUL_ITER_THRESHOLD") {
            self.iter_threshold = threshold;
        }
        if let Ok(level) = std::env::var("PHAUL_COMPRESSION_LEVEL") {
            self.compression_level = parse_compression_level(&level)?;
        }
        if let Ok(strategy) = std::env::var("PHAUL_TRANSFER") {
            self.transfer = strategy.parse()?;
        }
        if let Some(keep) = env_flag("PHAUL_KEEP_IMAGES") {
            self.keep_images = keep;
        }
        if let Some(force) = env_flag("PHAUL_FORCE") {
            self.force = force;
        }
        if let Some(skip) = env_flag("PHAUL_SKIP_CPU_CHECK") {
            self.skip_cpu_check = skip;
        }
        if let Some(skip) = env_flag("PHAUL_SKIP_CRIU_CHECK") {
            self.skip_criu_check = skip;
        }
        if let Ok(to) = std::env::var("PHAUL_TO") {
            self.to = Some(to);
        }
        if let Ok(path) = std::env::var("PHAUL_IMG_PATH") {
            self.img_path = PathBuf::from(path);
        }
        if let Ok(tool) = std::env::var("PHAUL_DIFF_TOOL") {
            self.diff_tool = tool;
        }
        if let Ok(secs) = std::env::var("PHAUL_UNPACK_TIMEOUT") {
            self.unpack_timeout_secs = parse_env_number("PHAUL_UNPACK_TIMEOUT", &secs)?;
        }
        if let Ok(path) = std::env::var("PHAUL_STATS_PATH") {
            self.stats_path = Some(PathBuf::from(path));
        }
        Ok(())
    }

    /// Eagerly check every value a session depends on
    pub fn validate(&self) -> HaulResult<()> {
        if self.compression_level > MAX_COMPRESSION_LEVEL {
            return Err(HaulError::config(format!(
                "compression level {} is not defined (expected 0..={})",
                self.compression_level, MAX_COMPRESSION_LEVEL
            )));
        }
        if self.max_iterations == 0 {
            return Err(HaulError::config("max_iterations must be at least 1"));
        }
        parse_byte_threshold(&self.iter_threshold)?;
        self.diff_tool_argv()?;
        if self.unpack_timeout_secs == 0 {
            return Err(HaulError::config("unpack_timeout_secs must be positive"));
        }
        Ok(())
    }

    /// Parsed `iter_threshold` in bytes
    pub fn iter_threshold_bytes(&self) -> HaulResult<u64> {
        parse_byte_threshold(&self.iter_threshold)
    }

    /// Diff tool command split into program and leading arguments
    pub fn diff_tool_argv(&self) -> HaulResult<Vec<String>> {
        let argv = shlex::split(&self.diff_tool).ok_or_else(|| {
            HaulError::config(format!("diff tool command is malformed: {}", self.diff_tool))
        })?;
        if argv.is_empty() {
            return Err(HaulError::config("diff tool command is empty"));
        }
        Ok(argv)
    }

    /// Whether the transfer path compresses at all
    pub fn compression_enabled(&self) -> bool {
        self.compression_level > 0 && self.transfer != TransferStrategy::Archive
    }

    /// Legacy transfer mode: plain archives, preliminary FS sync, no daemon reload
    pub fn is_legacy_transfer(&self) -> bool {
        self.transfer == TransferStrategy::Archive
    }

    pub fn unpack_timeout(&self) -> Duration {
        Duration::from_secs(self.unpack_timeout_secs)
    }

    pub fn predump_settle(&self) -> Duration {
        Duration::from_secs(self.predump_settle_secs)
    }

    pub fn iteration_interval(&self) -> Duration {
        Duration::from_secs(self.iteration_interval_secs)
    }
}

/// Parse a compression level, rejecting anything outside `0..=9`
pub fn parse_compression_level(value: &str) -> HaulResult<u8> {
    let level: u8 = value
        .trim()
        .parse()
        .map_err(|_| HaulError::config(format!("compression level '{}' is not a number", value)))?;
    if level > MAX_COMPRESSION_LEVEL {
        return Err(HaulError::config(format!(
            "compression level {} is not defined (expected 0..={})",
            level, MAX_COMPRESSION_LEVEL
        )));
    }
    Ok(level)
}

/// Parse a byte threshold such as `4m`, `512K`, `1g`, `100b` or `2048`.
///
/// Suffixes are binary multiples and case-insensitive; a bare number is
/// bytes. `0` means unlimited.
pub fn parse_byte_threshold(value: &str) -> HaulResult<u64> {
    let value = value.trim();
    let invalid = || HaulError::config(format!("invalid byte threshold '{}'", value));

    let last = value.chars().last().ok_or_else(invalid)?;
    let (digits, multiplier) = match last.to_ascii_lowercase() {
        'g' => (&value[..value.len() - 1], 1024 * 1024 * 1024),
        'm' => (&value[..value.len() - 1], 1024 * 1024),
        'k' => (&value[..value.len() - 1], 1024),
        'b' => (&value[..value.len() - 1], 1),
        _ => (value, 1),
    };

    let count: u64 = digits.trim().parse().map_err(|_| invalid())?;
    count.checked_mul(multiplier).ok_or_else(invalid)
}
