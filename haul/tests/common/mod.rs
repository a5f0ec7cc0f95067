#![allow(dead_code)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use haul::{MigrationConfig, PreDumpPolicy};

/// Stand-in for a binary delta tool: the "delta" is a tar of the new tree,
/// applying it unpacks that tar.
const DIFF_SCRIPT: &str = r#"#!/bin/sh
set -e
case "$1" in
    diff) tar -cf "$4" -C "$3" . ;;
    apply) mkdir -p "$4" && tar -xf "$3" -C "$4" ;;
    *) echo "unknown command $1" >&2; exit 2 ;;
esac
"#;

/// Route library logs to the test harness; `RUST_LOG` selects the level
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn write_diff_tool(dir: &Path) -> PathBuf {
    let path = dir.join("dirdiff.sh");
    std::fs::write(&path, DIFF_SCRIPT).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Config rooted in `root` with no waits, no compression and the script diff tool
pub fn test_config(root: &Path) -> MigrationConfig {
    let tools = root.join("tools");
    std::fs::create_dir_all(&tools).unwrap();
    MigrationConfig {
        img_path: root.join("images"),
        diff_tool: write_diff_tool(&tools).display().to_string(),
        pre_dump: PreDumpPolicy::Disabled,
        predump_settle_secs: 0,
        iteration_interval_secs: 0,
        compression_level: 0,
        ..Default::default()
    }
}
