//! Migration error types
//!
//! One error enum covers every failure a migration session can hit. The
//! variants follow the fault domains of a migration: compatibility checks,
//! data transfer, diff tooling, the remote peer, and the workload itself.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for migration operations
pub type HaulResult<T> = Result<T, HaulError>;

/// Process exit status for a successful migration.
pub const EXIT_OK: i32 = 0;
/// Process exit status for a failure on the local host.
pub const EXIT_LOCAL_FAILURE: i32 = 1;
/// Process exit status for a configuration or compatibility failure.
pub const EXIT_VALIDATION_FAILURE: i32 = 2;
/// Process exit status when the remote host reported or caused the failure.
pub const EXIT_REMOTE_FAILURE: i32 = 3;

/// Errors that can occur during a migration session
#[derive(Error, Debug)]
pub enum HaulError {
    /// Hardware or tool compatibility mismatch with the peer
    #[error("Validation failed ({check}): {message}")]
    Validation { check: String, message: String },

    /// Archive, stream or transfer subprocess failure
    #[error("Transfer failed during {stage}: {message}")]
    Transfer { stage: String, message: String },

    /// Diff or patch tool failure
    #[error("Diff tool failed ({operation}): {message}")]
    Diff { operation: String, message: String },

    /// Remote call failed or the peer reported failure
    #[error("RPC {method} failed: {message}")]
    Rpc { method: String, message: String },

    /// Workload driver reported a checkpoint/restore failure
    #[error("Workload error during {operation}: {message}")]
    Workload { operation: String, message: String },

    /// Invalid configuration value
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Operation not allowed in the current session or store state
    #[error("Invalid state: {message}")]
    InvalidState { message: String },

    /// Iteration index outside the known sequence
    #[error("Iteration {index} does not exist (current iteration is {current})")]
    NoSuchIteration { index: u32, current: u32 },

    /// A required file or directory is missing
    #[error("Path not found: {path}")]
    PathNotFound { path: PathBuf },

    /// IO error wrapper
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl HaulError {
    /// Create a validation error
    pub fn validation(check: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            check: check.into(),
            message: message.into(),
        }
    }

    /// Create a transfer error
    pub fn transfer(stage: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transfer {
            stage: stage.into(),
            message: message.into(),
        }
    }

    /// Create a diff tool error
    pub fn diff(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Diff {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create an RPC error
    pub fn rpc(method: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Rpc {
            method: method.into(),
            message: message.into(),
        }
    }

    /// Create a workload error
    pub fn workload(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Workload {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create a config error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create an invalid state error
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState {
            message: message.into(),
        }
    }

    /// Whether the failure originated on (or in talking to) the remote host
    pub fn is_remote(&self) -> bool {
        matches!(self, Self::Rpc { .. })
    }

    /// Process exit status that lets driving automation tell which host
    /// needs attention.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Rpc { .. } => EXIT_REMOTE_FAILURE,
            Self::Validation { .. } | Self::Config { .. } => EXIT_VALIDATION_FAILURE,
            _ => EXIT_LOCAL_FAILURE,
        }
    }

    /// Get recovery suggestion for this error
    pub fn recovery_suggestion(&self) -> Option<&'static str> {
        match self {
            Self::Validation { check, .. } => {
                if check.contains("cpu") {
                    Some("CPU features differ between hosts. Pick a compatible target or pass --skip-cpu-check.")
                } else {
                    Some("Checkpoint tool versions differ. Align versions or pass --skip-criu-check.")
                }
            }
            Self::Transfer { .. } => Some(
                "Check connectivity to the target and free space in the image directory. \
                 Subprocess output is in the session logs under the work directory.",
            ),
            Self::Diff { .. } => Some(
                "The diff tool exited non-zero. Inspect xdelta3.log in the work directory.",
            ),
            Self::Rpc { .. } => Some(
                "The target host failed. Inspect the target service log; the source workload \
                 was rolled back if it had been frozen.",
            ),
            Self::Workload { .. } => Some(
                "The workload driver failed. Inspect the driver logs in the work directory.",
            ),
            Self::Config { .. } => Some("Check command-line flags and PHAUL_* environment variables."),
            Self::PathNotFound { .. } => Some("File or directory not found. Check the path exists."),
            Self::Io(e) => match e.kind() {
                std::io::ErrorKind::PermissionDenied => {
                    Some("Permission denied. Migration usually needs root on both hosts.")
                }
                _ => Some("IO error occurred. Check disk space and file permissions."),
            },
            _ => None,
        }
    }

    /// Get error with recovery suggestion formatted
    pub fn with_suggestion(&self) -> String {
        match self.recovery_suggestion() {
            Some(suggestion) => format!("{}\n\nRecovery: {}", self, suggestion),
            None => self.to_string(),
        }
    }
}
