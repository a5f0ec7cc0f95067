//! Source-side migration driver
//!
//! [`Orchestrator`] sequences one migration: it sets up the peer, runs the
//! compatibility checks, then walks the phase machine through one of the
//! live protocols or the restart protocol. Every step that touches the target
//! goes through [`HostCoordination`]; every step that touches the workload
//! goes through the [`WorkloadDriver`] and [`FsDriver`].
//!
//! Rollback: once the final dump starts (live) or the workload is stopped
//! (restart), a failure calls `migration_fail` on the driver exactly once
//! before the error is returned. Errors before that point propagate as is.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::AsyncWrite;
use tracing::{debug, error, info, warn};

use crate::config::{MigrationConfig, MigrationMode};
use crate::driver::{CheckpointTool, DumpContext, FsDriver, WorkloadDriver};
use crate::error::{HaulError, HaulResult};
use crate::images::{send_dir, DiffArtifact, ImageStore, Packaging};
use crate::orchestrator::session::MigrationSession;
use crate::orchestrator::state_machine::{MigrationPhase, PhaseMachine};
use crate::policy::{decide, ConvergenceConfig};
use crate::rpc::{HostCoordination, ImageDirKind, ImagePayload, WorkloadDescriptor};
use crate::stats::{LiveStats, MetricsSink, PeerTimings, StatsReport};

/// Which live protocol a session runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiveProtocol {
    /// No pre-dump: final dump, full transfer, restore
    Legacy,
    /// One full pre-dump, then a diff of the final dump
    SinglePreDump,
    /// Full pre-dump followed by diff pre-dumps until the policy stops
    Iterative,
}

impl LiveProtocol {
    pub fn select(config: &MigrationConfig, driver_can_pre_dump: bool) -> Self {
        if !config.pre_dump.resolve(driver_can_pre_dump) {
            Self::Legacy
        } else if config.max_iterations <= 2 {
            Self::SinglePreDump
        } else {
            Self::Iterative
        }
    }
}

fn not_set_up() -> HaulError {
    HaulError::invalid_state("setup() has not completed")
}

pub struct Orchestrator {
    session: MigrationSession,
    config: MigrationConfig,
    peer: Box<dyn HostCoordination>,
    workload: Arc<dyn WorkloadDriver>,
    tool: Arc<dyn CheckpointTool>,
    fs: Option<Box<dyn FsDriver>>,
    store: Option<ImageStore>,
    images: Box<dyn AsyncWrite + Unpin + Send>,
    stats: Box<dyn MetricsSink>,
    phases: PhaseMachine,
    root_task: String,
    setup_done: bool,
    validated: bool,
    rollback_armed: bool,
}

impl Orchestrator {
    /// `images` is the write end of the image channel to the target.
    pub fn new(
        workload: WorkloadDescriptor,
        config: MigrationConfig,
        peer: Box<dyn HostCoordination>,
        driver: Arc<dyn WorkloadDriver>,
        tool: Arc<dyn CheckpointTool>,
        images: Box<dyn AsyncWrite + Unpin + Send>,
    ) -> HaulResult<Self> {
        config.validate()?;
        let session = MigrationSession::new(workload, &config);
        let stats = LiveStats::new(&session.id, config.mode, config.stats_path.clone());
        Ok(Self {
            session,
            config,
            peer,
            workload: driver,
            tool,
            fs: None,
            store: None,
            images,
            stats: Box::new(stats),
            phases: PhaseMachine::new(),
            root_task: String::new(),
            setup_done: false,
            validated: false,
            rollback_armed: false,
        })
    }

    /// Replace the default in-memory stats collector
    pub fn with_metrics(mut self, sink: Box<dyn MetricsSink>) -> Self {
        self.stats = sink;
        self
    }

    pub fn session(&self) -> &MigrationSession {
        &self.session
    }

    pub fn config(&self) -> &MigrationConfig {
        &self.config
    }

    pub fn phases(&self) -> &PhaseMachine {
        &self.phases
    }

    pub fn store(&self) -> Option<&ImageStore> {
        self.store.as_ref()
    }

    /// Setup, validate and migrate in one call
    pub async fn run(&mut self) -> HaulResult<StatsReport> {
        self.setup().await?;
        self.validate().await?;
        self.start_migration().await
    }

    /// Bind the peer to this workload, send it the configuration and prepare
    /// the local image store and filesystem driver.
    pub async fn setup(&mut self) -> HaulResult<()> {
        if self.setup_done {
            return Err(HaulError::invalid_state("setup() already ran"));
        }
        info!(
            session = %self.session.id,
            workload = %self.session.workload,
            mode = %self.config.mode,
            "Setting up migration"
        );
        let result = self.setup_inner().await;
        if let Err(e) = &result {
            self.abort(e).await;
            self.close_store();
        }
        result
    }

    async fn setup_inner(&mut self) -> HaulResult<()> {
        self.peer
            .setup(&self.session.workload, self.config.mode)
            .await?;
        self.peer.propagate_config(&self.config).await?;

        let mut fs = self.workload.fs_driver(&self.config)?;
        fs.set_options(&self.config);
        if self.session.is_live() {
            let store = ImageStore::create(self.workload.kind(), &self.config)?;
            fs.set_work_dir(store.work_dir());
            self.store = Some(store);
        }
        self.fs = Some(fs);
        self.setup_done = true;
        Ok(())
    }

    /// Compatibility checks against the peer. A failed check is fatal and
    /// happens before anything on the source is touched.
    pub async fn validate(&mut self) -> HaulResult<()> {
        if !self.setup_done {
            return Err(not_set_up());
        }
        self.enter(MigrationPhase::Validate, None)?;
        let result = self.run_checks().await;
        match &result {
            Ok(()) => self.validated = true,
            Err(e) => {
                self.abort(e).await;
                self.close_store();
            }
        }
        result
    }

    async fn run_checks(&mut self) -> HaulResult<()> {
        if self.config.mode == MigrationMode::Restart {
            info!("Restart mode, skipping compatibility checks");
            return Ok(());
        }
        if self.config.force {
            info!("Forced migration, skipping compatibility checks");
            return Ok(());
        }

        let mut force = false;
        if self.config.skip_cpu_check {
            info!("Skipping CPU check");
        } else {
            let work_dir = self
                .store
                .as_ref()
                .ok_or_else(not_set_up)?
                .work_dir()
                .to_path_buf();
            match self.tool.cpu_probe(&work_dir).await? {
                None => {
                    warn!("CPU probe unsupported, skipping remaining checks");
                    force = true;
                }
                Some(probe) => {
                    info!("Checking CPU compatibility with target");
                    if !self.peer.check_compat(&probe).await? {
                        return Err(HaulError::validation("cpu", "CPUs mismatch"));
                    }
                }
            }
        }

        if force || self.config.skip_criu_check {
            return Ok(());
        }
        let version = self.tool.version().await?;
        info!(version = %version.trim(), "Checking checkpoint tool version on target");
        if !self.peer.check_tool_version(&version).await? {
            return Err(HaulError::validation(
                "criu version",
                format!(
                    "target runs a different checkpoint tool version (source has {})",
                    version.trim()
                ),
            ));
        }
        Ok(())
    }

    /// Run the migration. Requires `setup()` and `validate()`.
    pub async fn start_migration(&mut self) -> HaulResult<StatsReport> {
        if !self.setup_done || !self.validated {
            return Err(HaulError::invalid_state(
                "start_migration() requires setup() and validate() first",
            ));
        }
        if self.phases.current() != MigrationPhase::Validate {
            return Err(HaulError::invalid_state("migration already started"));
        }

        self.session.mark_started();
        let result = match self.config.mode {
            MigrationMode::Live => self.live().await,
            MigrationMode::Restart => self.restart().await,
        };

        let report = match result {
            Ok(peer) => {
                self.enter(MigrationPhase::Complete, None)?;
                info!(summary = %self.phases.summary(), "Migration succeeded");
                Ok(self.stats.finish(peer, true))
            }
            Err(e) => {
                self.abort(&e).await;
                self.stats.finish(PeerTimings::default(), false);
                Err(e)
            }
        };
        self.session.mark_finished();
        self.close_store();
        report
    }

    /// Advance the phase machine and the stats sink together
    fn enter(&mut self, phase: MigrationPhase, reason: Option<&str>) -> HaulResult<()> {
        let previous = self.phases.current();
        self.phases.advance(phase, reason)?;
        if previous != MigrationPhase::Init {
            self.stats.phase_finished(previous);
        }
        if !phase.is_terminal() {
            self.stats.phase_started(phase);
        }
        debug!(phase = %phase, iteration = self.phases.iteration(), "Entered phase");
        Ok(())
    }

    async fn abort(&mut self, err: &HaulError) {
        let phase = self.phases.current();
        error!(phase = %phase, error = %err, "Migration failed");
        if let Some(hint) = err.recovery_suggestion() {
            info!("Hint: {}", hint);
        }
        if !phase.is_terminal() {
            if phase != MigrationPhase::Init {
                self.stats.phase_finished(phase);
            }
            if let Err(e) = self.phases.fail(&err.to_string()) {
                warn!("{}", e);
            }
        }

        if !self.rollback_armed {
            return;
        }
        self.rollback_armed = false;
        warn!(workload = %self.session.workload, "Rolling back workload on source");
        if let Err(e) = self.workload.migration_fail().await {
            error!(error = %e, "Rollback failed");
        }
        if self.config.mode == MigrationMode::Restart {
            if let Err(e) = self.workload.start().await {
                error!(error = %e, "Failed to restart workload on source");
            }
        }
    }

    fn close_store(&mut self) {
        if let Some(store) = self.store.as_mut() {
            store.close();
        }
    }

    // ── live mode ──────────────────────────────────────────────────────

    async fn live(&mut self) -> HaulResult<PeerTimings> {
        self.root_task = self.workload.root_task_id().await?;
        let protocol = LiveProtocol::select(&self.config, self.workload.can_pre_dump());
        info!(root_task = %self.root_task, protocol = ?protocol, "Starting live migration");

        info!("Preliminary FS migration");
        let fs = self.fs.as_deref_mut().ok_or_else(not_set_up)?;
        let fsstats = fs.start_migration().await?;
        self.stats
            .bytes_transferred("fs_sync", fsstats.bytes_transferred);

        match protocol {
            LiveProtocol::Legacy => {
                self.final_dump(true).await?;
                self.final_fs_sync().await?;
                self.enter(MigrationPhase::ImageTransfer, None)?;
                let started = Instant::now();
                let bytes = self.transfer_current().await?;
                self.stats
                    .iteration_finished(self.phases.iteration(), bytes, started.elapsed());
            }
            LiveProtocol::SinglePreDump => {
                let last = self.first_pre_dump().await?;
                self.settle(last).await;
                self.final_dump(false).await?;
                self.final_fs_sync().await?;
                self.final_diff_transfer().await?;
            }
            LiveProtocol::Iterative => {
                let mut last = self.first_pre_dump().await?;
                last = self.pre_dump_loop(last).await?;
                self.settle(last).await;
                self.final_dump(false).await?;
                self.final_fs_sync().await?;
                self.final_diff_transfer().await?;
            }
        }

        self.restore().await
    }

    fn next_dump_context(&mut self) -> HaulResult<DumpContext> {
        let store = self.store.as_mut().ok_or_else(not_set_up)?;
        let image_dir = store.new_iteration()?;
        self.phases.set_iteration(store.current_iter());
        Ok(DumpContext {
            root_task: self.root_task.clone(),
            image_dir,
            parent_dir: store.parent_dir(),
            work_dir: store.work_dir().to_path_buf(),
        })
    }

    /// Iteration 1: pre-dump and ship the whole image set. Returns when the
    /// pre-dump finished.
    async fn first_pre_dump(&mut self) -> HaulResult<Instant> {
        self.enter(MigrationPhase::PreDump, Some("first pre-dump"))?;
        let started = Instant::now();
        self.peer.start_iteration(false).await?;
        let ctx = self.next_dump_context()?;
        let fs = self.fs.as_deref_mut().ok_or_else(not_set_up)?;
        self.workload.pre_dump(&ctx, fs).await?;
        let dumped = Instant::now();

        let bytes = self.transfer_current().await?;
        self.stats
            .iteration_finished(self.phases.iteration(), bytes, started.elapsed());
        Ok(dumped)
    }

    /// Diff pre-dumps until the convergence policy says stop
    async fn pre_dump_loop(&mut self, mut last_dump: Instant) -> HaulResult<Instant> {
        let policy = ConvergenceConfig::diff_bytes(self.config.min_diff_bytes, self.config.max_iterations);
        let threshold = if self.config.enforce_iter_threshold {
            Some(self.config.iter_threshold_bytes()?).filter(|t| *t > 0)
        } else {
            None
        };

        let mut prev: Option<u64> = None;
        let mut index = 2;
        while index < self.config.max_iterations {
            self.enter(MigrationPhase::PreDump, None)?;
            let started = Instant::now();
            let ctx = self.next_dump_context()?;
            let fs = self.fs.as_deref_mut().ok_or_else(not_set_up)?;
            self.workload.pre_dump(&ctx, fs).await?;
            last_dump = Instant::now();

            let store = self.store.as_mut().ok_or_else(not_set_up)?;
            let artifact = store.diff_since_sync().await?;

            if let Some(min) = threshold {
                if artifact.size < min {
                    info!(
                        iteration = index,
                        bytes = artifact.size,
                        threshold = min,
                        "Diff below threshold, discarding iteration"
                    );
                    store.discard_last_iteration()?;
                    let pause = self.config.iteration_interval();
                    tokio::time::sleep(pause).await;
                    self.stats.add_sleep(pause);
                    index += 1;
                    continue;
                }
            }

            let bytes = self.transfer_diff(&artifact).await?;
            self.peer.apply_diff_images().await?;
            self.stats.iteration_finished(index, bytes, started.elapsed());

            if !decide(index, artifact.size, prev, &policy).should_continue() {
                break;
            }
            prev = Some(artifact.size);
            index += 1;
        }
        Ok(last_dump)
    }

    /// Give the workload time to dirty memory again before the final dump
    async fn settle(&mut self, last_dump: Instant) {
        let settle = self.config.predump_settle();
        if settle.is_zero() {
            return;
        }
        let wait = settle
            .saturating_sub(last_dump.elapsed())
            .max(Duration::from_secs(1));
        info!(wait_ms = wait.as_millis() as u64, "Waiting before final dump");
        tokio::time::sleep(wait).await;
        self.stats.add_sleep(wait);
    }

    /// Freeze and checkpoint the workload. With `mirror_on_peer` the target
    /// allocates its matching image directory right away.
    async fn final_dump(&mut self, mirror_on_peer: bool) -> HaulResult<()> {
        self.enter(MigrationPhase::FinalDump, None)?;
        self.rollback_armed = true;
        if mirror_on_peer {
            self.peer
                .start_iteration(self.workload.dump_needs_page_server())
                .await?;
        }
        let ctx = self.next_dump_context()?;
        info!(iteration = self.phases.iteration(), dir = %ctx.image_dir.display(), "Final dump");
        let fs = self.fs.as_deref_mut().ok_or_else(not_set_up)?;
        self.workload.final_dump(&ctx, fs).await?;
        self.copy_meta_images(&ctx.image_dir)
    }

    fn copy_meta_images(&self, image_dir: &Path) -> HaulResult<()> {
        for (source, name) in self.workload.meta_images(image_dir) {
            let dest = image_dir.join(&name);
            if source == dest {
                continue;
            }
            debug!(from = %source.display(), to = %dest.display(), "Copying meta image");
            std::fs::copy(&source, &dest)?;
        }
        Ok(())
    }

    async fn final_fs_sync(&mut self) -> HaulResult<()> {
        self.enter(MigrationPhase::FsSync, None)?;
        let fs = self.fs.as_deref_mut().ok_or_else(not_set_up)?;
        let fsstats = fs.stop_migration().await?;
        self.stats
            .bytes_transferred("fs_sync", fsstats.bytes_transferred);
        if !self.config.is_legacy_transfer() {
            self.peer.reload_workload_daemon_nonblocking().await?;
        }
        Ok(())
    }

    async fn final_diff_transfer(&mut self) -> HaulResult<()> {
        self.enter(MigrationPhase::ImageTransfer, None)?;
        let started = Instant::now();
        let store = self.store.as_mut().ok_or_else(not_set_up)?;
        let artifact = store.diff_since_sync().await?;
        let bytes = self.transfer_diff(&artifact).await?;
        self.stats
            .iteration_finished(self.phases.iteration(), bytes, started.elapsed());

        self.enter(MigrationPhase::DiffApply, None)?;
        self.peer.apply_diff_images().await
    }

    /// Ship the current iteration directory as a full image set
    async fn transfer_current(&mut self) -> HaulResult<u64> {
        let packaging = Packaging::from_config(&self.config);
        let store = self.store.as_mut().ok_or_else(not_set_up)?;
        let dir = store.current_dir()?.to_path_buf();

        self.peer
            .start_accept_images(ImageDirKind::ImageDir, ImagePayload::Full)
            .await?;
        let sent = send_dir(&dir, &mut *self.images, packaging, store.transfer_log()).await?;
        let received = self.peer.stop_accept_images().await?;
        store.mark_synced();
        debug!(sent, received, iteration = store.current_iter(), "Full images transferred");
        Ok(sent)
    }

    /// Ship a diff into a fresh iteration directory on the target
    async fn transfer_diff(&mut self, artifact: &DiffArtifact) -> HaulResult<u64> {
        let packaging = Packaging::from_config(&self.config);
        let store = self.store.as_mut().ok_or_else(not_set_up)?;

        self.peer.start_iteration(false).await?;
        self.peer
            .start_accept_images(ImageDirKind::ImageDir, ImagePayload::Diff)
            .await?;
        let sent = send_dir(&artifact.dir, &mut *self.images, packaging, store.transfer_log()).await?;
        let received = self.peer.stop_accept_images().await?;
        store.mark_synced();
        debug!(
            sent,
            received,
            base = artifact.base_iter,
            target = artifact.target_iter,
            "Diff images transferred"
        );
        Ok(sent)
    }

    async fn restore(&mut self) -> HaulResult<PeerTimings> {
        self.enter(MigrationPhase::Restore, None)?;
        info!("Asking target host to restore");
        self.peer.restore_from_images().await?;
        self.rollback_armed = false;
        info!("Restored on target host");

        let timings = self.peer_timings().await;
        self.workload.migration_complete().await?;
        self.peer.migration_complete().await?;
        Ok(timings)
    }

    /// Target-side timings for the report. The workload already runs on the
    /// target here, so a failed query only costs the numbers.
    async fn peer_timings(&mut self) -> PeerTimings {
        let mut timings = PeerTimings::default();
        match self.peer.restore_time().await {
            Ok(t) => timings.restore = t,
            Err(e) => warn!(error = %e, "Could not fetch restore time"),
        }
        match self.peer.diff_apply_time().await {
            Ok(t) => timings.diff_apply = t,
            Err(e) => warn!(error = %e, "Could not fetch diff apply time"),
        }
        match self.peer.reload_time().await {
            Ok(t) => timings.reload = t,
            Err(e) => warn!(error = %e, "Could not fetch reload time"),
        }
        timings
    }

    // ── restart mode ───────────────────────────────────────────────────

    async fn restart(&mut self) -> HaulResult<PeerTimings> {
        self.enter(MigrationPhase::FsSync, Some("preliminary"))?;
        info!("Preliminary FS migration");
        let fs = self.fs.as_deref_mut().ok_or_else(not_set_up)?;
        let fsstats = fs.start_migration().await?;
        self.stats
            .bytes_transferred("fs_sync", fsstats.bytes_transferred);

        let policy = ConvergenceConfig::restart();
        let mut prev: Option<u64> = None;
        let mut index = 0;
        loop {
            info!(iteration = index, "FS iteration");
            self.phases.set_iteration(index);
            let started = Instant::now();
            let fs = self.fs.as_deref_mut().ok_or_else(not_set_up)?;
            let bytes = fs.next_iteration().await?.bytes_transferred;
            self.stats.iteration_finished(index, bytes, started.elapsed());

            if !decide(index, bytes, prev, &policy).should_continue() {
                break;
            }
            prev = Some(bytes);
            index += 1;
            self.enter(MigrationPhase::FsSync, None)?;
        }

        info!("Final stop and start");
        self.workload.stop(false).await?;
        self.rollback_armed = true;

        self.enter(MigrationPhase::FsSync, Some("final"))?;
        let fs = self.fs.as_deref_mut().ok_or_else(not_set_up)?;
        let fsstats = fs.stop_migration().await?;
        self.stats
            .bytes_transferred("fs_sync", fsstats.bytes_transferred);

        self.enter(MigrationPhase::Restore, None)?;
        info!("Asking target host to start");
        self.peer.start_workload().await?;
        self.rollback_armed = false;
        info!("Started on target host");

        self.workload.migration_complete().await?;
        Ok(PeerTimings::default())
    }
}
