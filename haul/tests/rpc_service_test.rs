//! Source orchestrator talking to a real target service over in-memory pipes.
//!
//! Control requests travel as JSON lines through one duplex pipe, images
//! through a second one, exactly as they would over the two TCP connections.

mod common;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use haul::driver::{DumpContext, RestoreContext};
use haul::error::{EXIT_REMOTE_FAILURE, EXIT_VALIDATION_FAILURE};
use haul::rpc::CompatProbe;
use haul::{
    CheckpointTool, DriverRegistry, FsDriver, FsStats, HaulError, HaulResult, MigrationConfig,
    MigrationPhase, Orchestrator, PreDumpPolicy, RemoteHost, TargetService, WorkloadDescriptor,
    WorkloadDriver,
};
use tokio::io::{DuplexStream, ReadHalf};
use tokio::task::JoinHandle;

const PAGE: usize = 4096;

struct NoopFs;

#[async_trait]
impl FsDriver for NoopFs {
    fn set_work_dir(&mut self, _path: &Path) {}
    fn set_options(&mut self, _config: &MigrationConfig) {}
    async fn start_migration(&mut self) -> HaulResult<FsStats> {
        Ok(FsStats::default())
    }
    async fn next_iteration(&mut self) -> HaulResult<FsStats> {
        Ok(FsStats::default())
    }
    async fn stop_migration(&mut self) -> HaulResult<FsStats> {
        Ok(FsStats::default())
    }
}

/// Both ends of the workload: the source dumps pages, the target records
/// what it was asked to restore.
#[derive(Default)]
struct Shared {
    restored: Option<Vec<(String, Vec<u8>)>>,
    rolled_back: u32,
    completed: u32,
}

struct PagesWorkload {
    shared: Arc<Mutex<Shared>>,
    fail_restore: bool,
}

fn snapshot(dir: &Path) -> Vec<(String, Vec<u8>)> {
    let mut files: Vec<_> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().path())
        .filter(|p| p.is_file())
        .map(|p| {
            let name = p.file_name().unwrap().to_string_lossy().to_string();
            (name, std::fs::read(&p).unwrap())
        })
        .collect();
    files.sort();
    files
}

#[async_trait]
impl WorkloadDriver for PagesWorkload {
    fn kind(&self) -> &str {
        "pages"
    }
    async fn root_task_id(&self) -> HaulResult<String> {
        Ok("1".into())
    }
    async fn pre_dump(&self, ctx: &DumpContext, _fs: &mut dyn FsDriver) -> HaulResult<()> {
        std::fs::write(ctx.image_dir.join("pages-1.img"), vec![1u8; PAGE])?;
        Ok(())
    }
    async fn final_dump(&self, ctx: &DumpContext, _fs: &mut dyn FsDriver) -> HaulResult<()> {
        std::fs::write(ctx.image_dir.join("pages-1.img"), vec![2u8; PAGE])?;
        std::fs::write(ctx.image_dir.join("core-1.img"), b"core")?;
        Ok(())
    }
    fn can_pre_dump(&self) -> bool {
        true
    }
    fn dump_needs_page_server(&self) -> bool {
        false
    }
    async fn start(&self) -> HaulResult<()> {
        Ok(())
    }
    async fn stop(&self, _unmount: bool) -> HaulResult<()> {
        Ok(())
    }
    async fn migration_complete(&self) -> HaulResult<()> {
        self.shared.lock().unwrap().completed += 1;
        Ok(())
    }
    async fn migration_fail(&self) -> HaulResult<()> {
        self.shared.lock().unwrap().rolled_back += 1;
        Ok(())
    }
    fn meta_images(&self, _image_dir: &Path) -> Vec<(PathBuf, String)> {
        Vec::new()
    }
    fn fs_driver(&self, _config: &MigrationConfig) -> HaulResult<Box<dyn FsDriver>> {
        Ok(Box::new(NoopFs))
    }
    async fn restore(&self, ctx: &RestoreContext) -> HaulResult<()> {
        if self.fail_restore {
            return Err(HaulError::workload("restore", "restore tool exited with 1"));
        }
        self.shared.lock().unwrap().restored = Some(snapshot(&ctx.image_dir));
        Ok(())
    }
}

struct VersionTool(&'static str);

#[async_trait]
impl CheckpointTool for VersionTool {
    async fn version(&self) -> HaulResult<String> {
        Ok(format!("{}\n", self.0))
    }
    async fn cpu_probe(&self, _work_dir: &Path) -> HaulResult<Option<CompatProbe>> {
        Ok(Some(CompatProbe {
            file_name: "cpuinfo.img".into(),
            data: b"x86_64".to_vec(),
        }))
    }
    async fn cpu_check(&self, _work_dir: &Path, probe: &CompatProbe) -> HaulResult<bool> {
        Ok(probe.data == b"x86_64")
    }
    async fn start_page_server(&self, _image_dir: &Path) -> HaulResult<()> {
        Ok(())
    }
}

struct Pair {
    orchestrator: Orchestrator,
    target: JoinHandle<HaulResult<()>>,
    shared: Arc<Mutex<Shared>>,
}

fn connect(config: MigrationConfig, target_version: &'static str, fail_restore: bool) -> Pair {
    let shared = Arc::new(Mutex::new(Shared::default()));

    let mut registry = DriverRegistry::new();
    let target_shared = Arc::clone(&shared);
    registry.register("pages", move |_descriptor, _role| {
        Ok(Arc::new(PagesWorkload {
            shared: Arc::clone(&target_shared),
            fail_restore,
        }) as Arc<dyn WorkloadDriver>)
    });

    let (control_src, control_dst) = tokio::io::duplex(64 * 1024);
    let (images_src, images_dst) = tokio::io::duplex(64 * 1024);

    let mut service: TargetService<DuplexStream> =
        TargetService::new(registry, Arc::new(VersionTool(target_version)), images_dst);
    let target = tokio::spawn(async move {
        let (reader, writer) = tokio::io::split(control_dst);
        service.serve(reader, writer).await
    });

    let (reader, writer): (ReadHalf<DuplexStream>, _) = tokio::io::split(control_src);
    let orchestrator = Orchestrator::new(
        WorkloadDescriptor::new("pages", "1"),
        config,
        Box::new(RemoteHost::new(reader, writer)),
        Arc::new(PagesWorkload {
            shared: Arc::clone(&shared),
            fail_restore: false,
        }),
        Arc::new(VersionTool("3.17.1")),
        Box::new(images_src),
    )
    .unwrap();

    Pair {
        orchestrator,
        target,
        shared,
    }
}

fn expected_final_images() -> Vec<(String, Vec<u8>)> {
    vec![
        ("core-1.img".to_string(), b"core".to_vec()),
        ("pages-1.img".to_string(), vec![2u8; PAGE]),
    ]
}

#[tokio::test]
async fn test_full_image_transfer_restores_final_dump() {
    let root = tempfile::tempdir().unwrap();
    let mut pair = connect(common::test_config(root.path()), "3.17.1", false);

    let report = pair.orchestrator.run().await.unwrap();
    drop(pair.orchestrator);
    pair.target.await.unwrap().unwrap();

    let shared = pair.shared.lock().unwrap();
    assert_eq!(shared.restored.as_deref(), Some(&expected_final_images()[..]));
    // once on the source, once on the target
    assert_eq!(shared.completed, 2);
    assert_eq!(shared.rolled_back, 0);
    assert!(report.restore_ms.is_some());
    assert!(report.bytes_transferred > 0);
}

#[tokio::test]
async fn test_diff_transfer_rebuilds_final_dump_on_target() {
    common::init_tracing();
    let root = tempfile::tempdir().unwrap();
    let config = MigrationConfig {
        pre_dump: PreDumpPolicy::Enabled,
        max_iterations: 2,
        ..common::test_config(root.path())
    };
    let mut pair = connect(config, "3.17.1", false);

    let report = pair.orchestrator.run().await.unwrap();
    assert!(pair.orchestrator.phases().visited(MigrationPhase::DiffApply));
    drop(pair.orchestrator);
    pair.target.await.unwrap().unwrap();

    let shared = pair.shared.lock().unwrap();
    assert_eq!(shared.restored.as_deref(), Some(&expected_final_images()[..]));
    assert!(report.diff_apply_ms.is_some());
    assert_eq!(report.iterations.len(), 2);
}

#[tokio::test]
async fn test_tool_version_mismatch_is_validation_failure() {
    let root = tempfile::tempdir().unwrap();
    let mut pair = connect(common::test_config(root.path()), "3.16", false);

    let err = pair.orchestrator.run().await.unwrap_err();
    assert!(matches!(err, HaulError::Validation { .. }));
    assert_eq!(err.exit_code(), EXIT_VALIDATION_FAILURE);
    drop(pair.orchestrator);
    pair.target.await.unwrap().unwrap();

    let shared = pair.shared.lock().unwrap();
    assert!(shared.restored.is_none());
    assert_eq!(shared.rolled_back, 0);
}

#[tokio::test]
async fn test_target_restore_failure_rolls_back_source() {
    let root = tempfile::tempdir().unwrap();
    let mut pair = connect(common::test_config(root.path()), "3.17.1", true);

    let err = pair.orchestrator.run().await.unwrap_err();
    assert!(err.is_remote());
    assert_eq!(err.exit_code(), EXIT_REMOTE_FAILURE);
    assert!(err.to_string().contains("restore tool exited with 1"));
    assert_eq!(pair.orchestrator.phases().current(), MigrationPhase::Failed);
    drop(pair.orchestrator);
    pair.target.await.unwrap().unwrap();

    let shared = pair.shared.lock().unwrap();
    assert_eq!(shared.rolled_back, 1);
    assert_eq!(shared.completed, 0);
}

#[tokio::test]
async fn test_remote_host_round_trip_before_setup() {
    let (control_src, control_dst) = tokio::io::duplex(4096);
    let (_images_src, images_dst) = tokio::io::duplex(4096);
    let mut service =
        TargetService::new(DriverRegistry::new(), Arc::new(VersionTool("3.17.1")), images_dst);
    let target = tokio::spawn(async move {
        let (reader, writer) = tokio::io::split(control_dst);
        service.serve(reader, writer).await
    });

    let (reader, writer) = tokio::io::split(control_src);
    let mut host = RemoteHost::new(reader, writer);
    {
        use haul::HostCoordination;
        assert!(host.check_tool_version("3.17.1\n").await.unwrap());
        assert_eq!(host.restore_time().await.unwrap(), None);
        let err = host.stop_accept_images().await.unwrap_err();
        assert!(matches!(err, HaulError::Rpc { ref method, .. } if method == "stop_accept_images"));
        assert!(err.to_string().contains("no image transfer in progress"));
    }
    drop(host);
    target.await.unwrap().unwrap();
}
