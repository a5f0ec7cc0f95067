//! End-to-end orchestrator runs against recording fakes.
//!
//! The peer, workload driver, filesystem driver and checkpoint tool all push
//! their calls onto one shared event log so tests can assert exact ordering.
//! Image transfers run for real (tar into a sink), diffs use the script tool
//! from `common`.

mod common;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use haul::driver::{DumpContext, RestoreContext};
use haul::error::{EXIT_LOCAL_FAILURE, EXIT_REMOTE_FAILURE, EXIT_VALIDATION_FAILURE};
use haul::rpc::CompatProbe;
use haul::{
    CheckpointTool, FsDriver, FsStats, HaulError, HaulResult, HostCoordination, ImageDirKind,
    ImagePayload, MigrationConfig, MigrationMode, MigrationPhase, Orchestrator, PreDumpPolicy,
    WorkloadDescriptor, WorkloadDriver,
};

type Events = Arc<Mutex<Vec<String>>>;

fn record(events: &Events, name: &str, fail_on: &[&'static str]) -> HaulResult<()> {
    events.lock().unwrap().push(name.to_string());
    if fail_on.contains(&name) {
        return Err(HaulError::Workload {
            operation: name.to_string(),
            message: "injected failure".to_string(),
        });
    }
    Ok(())
}

// ── fakes ───────────────────────────────────────────────────────────────

struct FakePeer {
    events: Events,
    fail_on: Vec<&'static str>,
    compatible: bool,
    img_path: PathBuf,
}

/// Iteration directories the source store has created under `img_path`
fn iteration_dirs(img_path: &Path) -> usize {
    let Ok(sessions) = std::fs::read_dir(img_path) else {
        return 0;
    };
    sessions
        .filter_map(|session| std::fs::read_dir(session.ok()?.path().join("img")).ok())
        .flatten()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_name().to_string_lossy().parse::<u32>().is_ok())
        .count()
}

impl FakePeer {
    fn call(&self, method: &'static str) -> HaulResult<()> {
        let name = format!("peer.{}", method);
        self.events.lock().unwrap().push(name.clone());
        if self.fail_on.contains(&name.as_str()) {
            return Err(HaulError::rpc(method, "injected failure"));
        }
        Ok(())
    }
}

#[async_trait]
impl HostCoordination for FakePeer {
    async fn setup(&mut self, _workload: &WorkloadDescriptor, _mode: MigrationMode) -> HaulResult<()> {
        self.call("setup")
    }
    async fn propagate_config(&mut self, _config: &MigrationConfig) -> HaulResult<()> {
        self.call("propagate_config")
    }
    async fn check_compat(&mut self, _probe: &CompatProbe) -> HaulResult<bool> {
        self.call("check_compat")?;
        Ok(self.compatible)
    }
    async fn check_tool_version(&mut self, _version: &str) -> HaulResult<bool> {
        self.call("check_tool_version")?;
        Ok(true)
    }
    async fn start_iteration(&mut self, _need_page_server: bool) -> HaulResult<()> {
        self.call("start_iteration")?;
        let existing = iteration_dirs(&self.img_path);
        self.events
            .lock()
            .unwrap()
            .push(format!("store.iterations:{}", existing));
        Ok(())
    }
    async fn start_accept_images(&mut self, _dir: ImageDirKind, _payload: ImagePayload) -> HaulResult<()> {
        self.call("start_accept_images")
    }
    async fn stop_accept_images(&mut self) -> HaulResult<u64> {
        self.call("stop_accept_images")?;
        Ok(0)
    }
    async fn apply_diff_images(&mut self) -> HaulResult<()> {
        self.call("apply_diff_images")
    }
    async fn restore_from_images(&mut self) -> HaulResult<()> {
        self.call("restore_from_images")
    }
    async fn reload_workload_daemon_nonblocking(&mut self) -> HaulResult<()> {
        self.call("reload_workload_daemon_nonblocking")
    }
    async fn start_workload(&mut self) -> HaulResult<()> {
        self.call("start_workload")
    }
    async fn migration_complete(&mut self) -> HaulResult<()> {
        self.call("migration_complete")
    }
    async fn restore_time(&mut self) -> HaulResult<Option<Duration>> {
        self.call("restore_time")?;
        Ok(Some(Duration::from_millis(40)))
    }
    async fn diff_apply_time(&mut self) -> HaulResult<Option<Duration>> {
        self.call("diff_apply_time")?;
        Ok(None)
    }
    async fn reload_time(&mut self) -> HaulResult<Option<Duration>> {
        self.call("reload_time")?;
        Ok(None)
    }
}

struct FakeFs {
    events: Events,
    fail_on: Vec<&'static str>,
    iteration_bytes: u64,
}

#[async_trait]
impl FsDriver for FakeFs {
    fn set_work_dir(&mut self, _path: &Path) {}

    fn set_options(&mut self, _config: &MigrationConfig) {}

    async fn start_migration(&mut self) -> HaulResult<FsStats> {
        record(&self.events, "fs.start_migration", &self.fail_on)?;
        Ok(FsStats::default())
    }

    async fn next_iteration(&mut self) -> HaulResult<FsStats> {
        record(&self.events, "fs.next_iteration", &self.fail_on)?;
        Ok(FsStats {
            bytes_transferred: self.iteration_bytes,
        })
    }

    async fn stop_migration(&mut self) -> HaulResult<FsStats> {
        record(&self.events, "fs.stop_migration", &self.fail_on)?;
        Ok(FsStats {
            bytes_transferred: 10,
        })
    }
}

struct FakeWorkload {
    events: Events,
    fail_on: Vec<&'static str>,
    can_pre_dump: bool,
    fs_iteration_bytes: u64,
}

/// A dump always lands in a directory the store has just created
fn record_new_iteration(events: &Events, ctx: &DumpContext) {
    let fresh = std::fs::read_dir(&ctx.image_dir)
        .map(|mut entries| entries.next().is_none())
        .unwrap_or(false);
    assert!(fresh, "dump into a used directory {}", ctx.image_dir.display());
    let index = ctx.image_dir.file_name().unwrap().to_string_lossy();
    events
        .lock()
        .unwrap()
        .push(format!("store.new_iteration:{}", index));
}

fn write_pages(ctx: &DumpContext) {
    std::fs::write(ctx.image_dir.join("pages-1.img"), vec![7u8; 100]).unwrap();
}

#[async_trait]
impl WorkloadDriver for FakeWorkload {
    fn kind(&self) -> &str {
        "fake"
    }
    async fn root_task_id(&self) -> HaulResult<String> {
        record(&self.events, "workload.root_task_id", &self.fail_on)?;
        Ok("4242".to_string())
    }
    async fn pre_dump(&self, ctx: &DumpContext, _fs: &mut dyn FsDriver) -> HaulResult<()> {
        record_new_iteration(&self.events, ctx);
        record(&self.events, "workload.pre_dump", &self.fail_on)?;
        write_pages(ctx);
        Ok(())
    }
    async fn final_dump(&self, ctx: &DumpContext, _fs: &mut dyn FsDriver) -> HaulResult<()> {
        record_new_iteration(&self.events, ctx);
        record(&self.events, "workload.final_dump", &self.fail_on)?;
        write_pages(ctx);
        Ok(())
    }
    fn can_pre_dump(&self) -> bool {
        self.can_pre_dump
    }
    fn dump_needs_page_server(&self) -> bool {
        false
    }
    async fn start(&self) -> HaulResult<()> {
        record(&self.events, "workload.start", &self.fail_on)
    }
    async fn stop(&self, _unmount: bool) -> HaulResult<()> {
        record(&self.events, "workload.stop", &self.fail_on)
    }
    async fn migration_complete(&self) -> HaulResult<()> {
        record(&self.events, "workload.migration_complete", &self.fail_on)
    }
    async fn migration_fail(&self) -> HaulResult<()> {
        record(&self.events, "workload.migration_fail", &self.fail_on)
    }
    fn meta_images(&self, _image_dir: &Path) -> Vec<(PathBuf, String)> {
        Vec::new()
    }
    fn fs_driver(&self, _config: &MigrationConfig) -> HaulResult<Box<dyn FsDriver>> {
        Ok(Box::new(FakeFs {
            events: Arc::clone(&self.events),
            fail_on: self.fail_on.clone(),
            iteration_bytes: self.fs_iteration_bytes,
        }))
    }
    async fn restore(&self, _ctx: &RestoreContext) -> HaulResult<()> {
        record(&self.events, "workload.restore", &self.fail_on)
    }
}

struct FakeTool {
    events: Events,
    probe_supported: bool,
}

#[async_trait]
impl CheckpointTool for FakeTool {
    async fn version(&self) -> HaulResult<String> {
        self.events.lock().unwrap().push("tool.version".into());
        Ok("3.17.1".into())
    }
    async fn cpu_probe(&self, _work_dir: &Path) -> HaulResult<Option<CompatProbe>> {
        self.events.lock().unwrap().push("tool.cpu_probe".into());
        Ok(self.probe_supported.then(|| CompatProbe {
            file_name: "cpuinfo.img".into(),
            data: vec![1, 2, 3],
        }))
    }
    async fn cpu_check(&self, _work_dir: &Path, _probe: &CompatProbe) -> HaulResult<bool> {
        Ok(true)
    }
    async fn start_page_server(&self, _image_dir: &Path) -> HaulResult<()> {
        Ok(())
    }
}

// ── harness ─────────────────────────────────────────────────────────────

struct Harness {
    events: Events,
    fail_on: Vec<&'static str>,
    compatible: bool,
    probe_supported: bool,
    can_pre_dump: bool,
    fs_iteration_bytes: u64,
}

impl Harness {
    fn new() -> Self {
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
            fail_on: Vec::new(),
            compatible: true,
            probe_supported: true,
            can_pre_dump: false,
            fs_iteration_bytes: 0,
        }
    }

    fn failing(mut self, name: &'static str) -> Self {
        self.fail_on.push(name);
        self
    }

    fn orchestrator(&self, config: MigrationConfig) -> Orchestrator {
        let peer = FakePeer {
            events: Arc::clone(&self.events),
            fail_on: self.fail_on.clone(),
            compatible: self.compatible,
            img_path: config.img_path.clone(),
        };
        let workload = FakeWorkload {
            events: Arc::clone(&self.events),
            fail_on: self.fail_on.clone(),
            can_pre_dump: self.can_pre_dump,
            fs_iteration_bytes: self.fs_iteration_bytes,
        };
        let tool = FakeTool {
            events: Arc::clone(&self.events),
            probe_supported: self.probe_supported,
        };
        Orchestrator::new(
            WorkloadDescriptor::new("fake", "4242"),
            config,
            Box::new(peer),
            Arc::new(workload),
            Arc::new(tool),
            Box::new(tokio::io::sink()),
        )
        .unwrap()
    }

    fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    fn count(&self, name: &str) -> usize {
        self.events().iter().filter(|e| e.as_str() == name).count()
    }

    /// Every name in `expected` occurs, in this relative order
    fn assert_in_order(&self, expected: &[&str]) {
        let events = self.events();
        let mut pos = 0;
        for name in expected {
            match events[pos..].iter().position(|e| e == name) {
                Some(offset) => pos += offset + 1,
                None => panic!("{} missing or out of order in {:?}", name, events),
            }
        }
    }
}

// ── live, legacy ────────────────────────────────────────────────────────

#[tokio::test]
async fn test_legacy_live_ordering() {
    common::init_tracing();
    let root = tempfile::tempdir().unwrap();
    let stats_path = root.path().join("stats.jsonl");
    let harness = Harness::new();
    let mut orch = harness.orchestrator(MigrationConfig {
        stats_path: Some(stats_path.clone()),
        ..common::test_config(root.path())
    });

    let report = orch.run().await.unwrap();

    harness.assert_in_order(&[
        "peer.setup",
        "peer.propagate_config",
        "tool.cpu_probe",
        "peer.check_compat",
        "peer.check_tool_version",
        "peer.start_iteration",
        "store.iterations:0",
        "store.new_iteration:1",
        "workload.final_dump",
        "fs.stop_migration",
        "peer.start_accept_images",
        "peer.stop_accept_images",
        "peer.restore_from_images",
        "workload.migration_complete",
        "peer.migration_complete",
    ]);
    assert_eq!(harness.count("store.new_iteration:1"), 1);
    assert_eq!(harness.count("workload.migration_fail"), 0);
    assert_eq!(harness.count("workload.pre_dump"), 0);
    assert_eq!(harness.count("peer.apply_diff_images"), 0);

    assert_eq!(orch.phases().current(), MigrationPhase::Complete);
    assert!(!orch.phases().visited(MigrationPhase::PreDump));
    assert!(report.succeeded);
    assert!(report.freeze_ms.is_some());
    assert_eq!(report.iterations.len(), 1);
    assert_eq!(report.restore_ms, Some(40));

    // work directory removed, one stats line appended
    assert!(!orch.store().unwrap().work_dir().exists());
    let stats = std::fs::read_to_string(&stats_path).unwrap();
    assert_eq!(stats.lines().count(), 1);
}

#[tokio::test]
async fn test_failure_after_final_dump_rolls_back_once() {
    let root = tempfile::tempdir().unwrap();
    let harness = Harness::new().failing("fs.stop_migration");
    let mut orch = harness.orchestrator(common::test_config(root.path()));

    let err = orch.run().await.unwrap_err();

    assert_eq!(err.exit_code(), EXIT_LOCAL_FAILURE);
    assert_eq!(harness.count("workload.migration_fail"), 1);
    assert_eq!(harness.count("peer.restore_from_images"), 0);
    harness.assert_in_order(&["workload.final_dump", "fs.stop_migration", "workload.migration_fail"]);
    assert_eq!(orch.phases().current(), MigrationPhase::Failed);
}

#[tokio::test]
async fn test_transfer_rpc_failure_is_remote_and_rolls_back() {
    let root = tempfile::tempdir().unwrap();
    let harness = Harness::new().failing("peer.stop_accept_images");
    let mut orch = harness.orchestrator(common::test_config(root.path()));

    let err = orch.run().await.unwrap_err();

    assert!(err.is_remote());
    assert_eq!(err.exit_code(), EXIT_REMOTE_FAILURE);
    assert_eq!(harness.count("workload.migration_fail"), 1);
    assert_eq!(harness.count("peer.restore_from_images"), 0);
}

#[tokio::test]
async fn test_failure_before_final_dump_skips_rollback() {
    let root = tempfile::tempdir().unwrap();
    let harness = Harness::new().failing("fs.start_migration");
    let mut orch = harness.orchestrator(common::test_config(root.path()));

    assert!(orch.run().await.is_err());
    assert_eq!(harness.count("workload.migration_fail"), 0);
    assert_eq!(harness.count("workload.final_dump"), 0);
}

#[tokio::test]
async fn test_failed_rollback_keeps_original_error() {
    let root = tempfile::tempdir().unwrap();
    let harness = Harness::new()
        .failing("peer.restore_from_images")
        .failing("workload.migration_fail");
    let mut orch = harness.orchestrator(common::test_config(root.path()));

    let err = orch.run().await.unwrap_err();
    assert!(matches!(err, HaulError::Rpc { ref method, .. } if method == "restore_from_images"));
    assert_eq!(harness.count("workload.migration_fail"), 1);
}

// ── validation ──────────────────────────────────────────────────────────

#[tokio::test]
async fn test_cpu_mismatch_aborts_before_dump() {
    let root = tempfile::tempdir().unwrap();
    let mut harness = Harness::new();
    harness.compatible = false;
    let mut orch = harness.orchestrator(common::test_config(root.path()));

    orch.setup().await.unwrap();
    let err = orch.validate().await.unwrap_err();
    assert!(matches!(err, HaulError::Validation { .. }));
    assert_eq!(err.exit_code(), EXIT_VALIDATION_FAILURE);
    assert_eq!(harness.count("peer.check_tool_version"), 0);

    let err = orch.start_migration().await.unwrap_err();
    assert!(matches!(err, HaulError::InvalidState { .. }));
    assert_eq!(harness.count("workload.final_dump"), 0);
}

#[tokio::test]
async fn test_unsupported_probe_skips_version_check() {
    let root = tempfile::tempdir().unwrap();
    let mut harness = Harness::new();
    harness.probe_supported = false;
    let mut orch = harness.orchestrator(common::test_config(root.path()));

    orch.run().await.unwrap();
    assert_eq!(harness.count("peer.check_compat"), 0);
    assert_eq!(harness.count("tool.version"), 0);
}

#[tokio::test]
async fn test_force_skips_all_checks() {
    let root = tempfile::tempdir().unwrap();
    let harness = Harness::new();
    let mut orch = harness.orchestrator(MigrationConfig {
        force: true,
        ..common::test_config(root.path())
    });

    orch.run().await.unwrap();
    assert_eq!(harness.count("tool.cpu_probe"), 0);
    assert_eq!(harness.count("peer.check_tool_version"), 0);
}

#[tokio::test]
async fn test_start_requires_setup_and_validate() {
    let root = tempfile::tempdir().unwrap();
    let harness = Harness::new();
    let mut orch = harness.orchestrator(common::test_config(root.path()));

    assert!(matches!(
        orch.start_migration().await,
        Err(HaulError::InvalidState { .. })
    ));
    assert!(matches!(orch.validate().await, Err(HaulError::InvalidState { .. })));

    orch.setup().await.unwrap();
    assert!(matches!(
        orch.start_migration().await,
        Err(HaulError::InvalidState { .. })
    ));
    assert!(harness.events().iter().all(|e| !e.starts_with("workload.")));
}

// ── live, with pre-dumps ────────────────────────────────────────────────

#[tokio::test]
async fn test_single_pre_dump_sends_diff_of_final_dump() {
    let root = tempfile::tempdir().unwrap();
    let harness = Harness::new();
    let mut orch = harness.orchestrator(MigrationConfig {
        pre_dump: PreDumpPolicy::Enabled,
        max_iterations: 2,
        ..common::test_config(root.path())
    });

    orch.run().await.unwrap();

    harness.assert_in_order(&[
        "peer.start_iteration",
        "workload.pre_dump",
        "peer.start_accept_images",
        "peer.stop_accept_images",
        "workload.final_dump",
        "fs.stop_migration",
        "peer.start_iteration",
        "peer.start_accept_images",
        "peer.stop_accept_images",
        "peer.apply_diff_images",
        "peer.restore_from_images",
    ]);
    assert_eq!(harness.count("workload.pre_dump"), 1);
    assert!(orch.phases().visited(MigrationPhase::DiffApply));
}

#[tokio::test]
async fn test_apply_diff_failure_exits_remote_without_restore() {
    let root = tempfile::tempdir().unwrap();
    let harness = Harness::new().failing("peer.apply_diff_images");
    let mut orch = harness.orchestrator(MigrationConfig {
        pre_dump: PreDumpPolicy::Enabled,
        max_iterations: 2,
        ..common::test_config(root.path())
    });

    let err = orch.run().await.unwrap_err();

    assert_eq!(err.exit_code(), EXIT_REMOTE_FAILURE);
    assert_eq!(harness.count("peer.restore_from_images"), 0);
    assert_eq!(harness.count("workload.migration_fail"), 1);
}

#[tokio::test]
async fn test_iterative_loop_stops_at_iteration_cap() {
    common::init_tracing();
    let root = tempfile::tempdir().unwrap();
    let mut harness = Harness::new();
    harness.can_pre_dump = true;
    let mut orch = harness.orchestrator(MigrationConfig {
        pre_dump: PreDumpPolicy::Auto,
        max_iterations: 4,
        min_diff_bytes: 0,
        ..common::test_config(root.path())
    });

    let report = orch.run().await.unwrap();

    // one full pre-dump, diff pre-dumps 2 and 3, then the final dump
    assert_eq!(harness.count("workload.pre_dump"), 3);
    assert_eq!(harness.count("peer.apply_diff_images"), 3);
    assert_eq!(harness.count("workload.final_dump"), 1);
    assert_eq!(report.iterations.len(), 4);
}

#[tokio::test]
async fn test_small_diff_stops_loop_early() {
    let root = tempfile::tempdir().unwrap();
    let harness = Harness::new();
    let mut orch = harness.orchestrator(MigrationConfig {
        pre_dump: PreDumpPolicy::Enabled,
        max_iterations: 8,
        min_diff_bytes: 1 << 30,
        ..common::test_config(root.path())
    });

    orch.run().await.unwrap();

    // iteration 2 is already below the minimum
    assert_eq!(harness.count("workload.pre_dump"), 2);
    assert_eq!(harness.count("peer.apply_diff_images"), 2);
}

#[tokio::test]
async fn test_threshold_discards_small_iterations() {
    let root = tempfile::tempdir().unwrap();
    let harness = Harness::new();
    let mut orch = harness.orchestrator(MigrationConfig {
        pre_dump: PreDumpPolicy::Enabled,
        max_iterations: 4,
        min_diff_bytes: 0,
        enforce_iter_threshold: true,
        iter_threshold: "1g".into(),
        ..common::test_config(root.path())
    });

    orch.run().await.unwrap();

    // both loop iterations fall below the threshold and never leave the host
    assert_eq!(harness.count("workload.pre_dump"), 3);
    assert_eq!(harness.count("peer.apply_diff_images"), 1);
    assert_eq!(harness.count("peer.start_iteration"), 2);
}

// ── restart mode ────────────────────────────────────────────────────────

#[tokio::test]
async fn test_restart_mode_ordering() {
    let root = tempfile::tempdir().unwrap();
    let harness = Harness::new();
    let mut orch = harness.orchestrator(MigrationConfig {
        mode: MigrationMode::Restart,
        ..common::test_config(root.path())
    });

    orch.run().await.unwrap();

    harness.assert_in_order(&[
        "peer.setup",
        "fs.start_migration",
        "fs.next_iteration",
        "workload.stop",
        "fs.stop_migration",
        "peer.start_workload",
        "workload.migration_complete",
    ]);
    assert_eq!(harness.count("fs.next_iteration"), 1);
    assert_eq!(harness.count("tool.cpu_probe"), 0);
    assert!(orch.store().is_none());
    assert_eq!(orch.phases().current(), MigrationPhase::Complete);
}

#[tokio::test]
async fn test_restart_mode_iterates_while_transfers_are_large() {
    let root = tempfile::tempdir().unwrap();
    let mut harness = Harness::new();
    // constant 2 MiB per round: no growth, only the iteration cap stops it
    harness.fs_iteration_bytes = 2 << 20;
    let mut orch = harness.orchestrator(MigrationConfig {
        mode: MigrationMode::Restart,
        ..common::test_config(root.path())
    });

    orch.run().await.unwrap();
    assert_eq!(harness.count("fs.next_iteration"), 9);
}

#[tokio::test]
async fn test_restart_failure_restarts_source() {
    let root = tempfile::tempdir().unwrap();
    let harness = Harness::new().failing("peer.start_workload");
    let mut orch = harness.orchestrator(MigrationConfig {
        mode: MigrationMode::Restart,
        ..common::test_config(root.path())
    });

    let err = orch.run().await.unwrap_err();
    assert!(err.is_remote());
    harness.assert_in_order(&["workload.stop", "workload.migration_fail", "workload.start"]);
    assert_eq!(harness.count("workload.migration_fail"), 1);
}
