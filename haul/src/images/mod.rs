//! Checkpoint images: iteration directories, diffs and their transfer.

pub mod diff;
pub mod store;
pub mod transfer;

pub use diff::DiffTool;
pub use store::{DiffArtifact, ImageStore, DIFF_FILE_NAME};
pub use transfer::{send_dir, spawn_unpack, Packaging, UnpackTask};
