//! Target-side peer
//!
//! [`TargetService`] answers the requests a [`RemoteHost`](super::RemoteHost)
//! sends. It owns the target's image store, a target-role workload driver and
//! the receiving end of the image channel. The channel is lent to one unpack
//! task at a time and comes back when `stop_accept_images` joins it.

use crate::config::{MigrationConfig, MigrationMode};
use crate::driver::{CheckpointTool, DriverRegistry, DriverRole, RestoreContext, WorkloadDriver};
use crate::error::{HaulError, HaulResult};
use crate::images::{spawn_unpack, ImageStore, Packaging, UnpackTask, DIFF_FILE_NAME};
use crate::rpc::messages::{
    CompatProbe, ImageDirKind, ImagePayload, RpcRequest, RpcResponse, WorkloadDescriptor,
};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// State of the target end of one migration session
pub struct TargetService<R> {
    registry: DriverRegistry,
    tool: Arc<dyn CheckpointTool>,
    config: MigrationConfig,
    workload: Option<WorkloadDescriptor>,
    mode: Option<MigrationMode>,
    driver: Option<Arc<dyn WorkloadDriver>>,
    store: Option<ImageStore>,
    channel: Option<R>,
    pending: Option<(UnpackTask<R>, ImagePayload)>,
    reload: Option<JoinHandle<HaulResult<Duration>>>,
    restore_time: Option<Duration>,
    reload_time: Option<Duration>,
}

fn secs(value: Option<Duration>) -> Value {
    value.map_or(Value::Null, |d| Value::from(d.as_secs_f64()))
}

impl<R> TargetService<R>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    pub fn new(registry: DriverRegistry, tool: Arc<dyn CheckpointTool>, channel: R) -> Self {
        Self {
            registry,
            tool,
            config: MigrationConfig::default(),
            workload: None,
            mode: None,
            driver: None,
            store: None,
            channel: Some(channel),
            pending: None,
            reload: None,
            restore_time: None,
            reload_time: None,
        }
    }

    pub fn config(&self) -> &MigrationConfig {
        &self.config
    }

    pub fn store(&self) -> Option<&ImageStore> {
        self.store.as_ref()
    }

    pub fn mode(&self) -> Option<MigrationMode> {
        self.mode
    }

    fn driver(&self) -> HaulResult<Arc<dyn WorkloadDriver>> {
        self.driver
            .clone()
            .ok_or_else(|| HaulError::invalid_state("setup has not been called"))
    }

    /// The image store, created from the propagated config on first use
    fn store_mut(&mut self) -> HaulResult<&mut ImageStore> {
        if self.store.is_none() {
            let kind = self
                .workload
                .as_ref()
                .map_or("haul", |w| w.kind.as_str());
            self.store = Some(ImageStore::create(kind, &self.config)?);
        }
        self.store
            .as_mut()
            .ok_or_else(|| HaulError::invalid_state("image store unavailable"))
    }

    async fn await_reload(&mut self) -> HaulResult<()> {
        let Some(handle) = self.reload.take() else {
            return Ok(());
        };
        match handle.await {
            Ok(Ok(elapsed)) => {
                self.reload_time = Some(elapsed);
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(e) => Err(HaulError::workload("reload_daemon", e.to_string())),
        }
    }

    async fn check_compat(&mut self, probe: &CompatProbe) -> HaulResult<bool> {
        let tool = Arc::clone(&self.tool);
        let work_dir = self.store_mut()?.work_dir().to_path_buf();
        let ok = tool.cpu_check(&work_dir, probe).await?;
        info!(compatible = ok, "CPU compatibility checked");
        Ok(ok)
    }

    async fn check_tool_version(&self, version: &str) -> HaulResult<bool> {
        let local = self.tool.version().await?;
        let ok = local.trim() == version.trim();
        info!(local = %local.trim(), remote = %version.trim(), matches = ok, "Checkpoint tool version checked");
        Ok(ok)
    }

    async fn start_iteration(&mut self, need_page_server: bool) -> HaulResult<()> {
        let dir = self.store_mut()?.new_iteration()?;
        if need_page_server {
            self.tool.start_page_server(&dir).await?;
        }
        Ok(())
    }

    fn start_accept_images(&mut self, kind: ImageDirKind, payload: ImagePayload) -> HaulResult<()> {
        if self.pending.is_some() {
            return Err(HaulError::invalid_state("an image transfer is already in progress"));
        }
        let packaging = Packaging::from_config(&self.config);
        let store = self.store_mut()?;
        let dest = match kind {
            ImageDirKind::WorkDir => store.work_dir().to_path_buf(),
            ImageDirKind::ImageDir => store.current_dir()?.to_path_buf(),
        };
        let log = store.transfer_log().clone();
        let channel = self
            .channel
            .take()
            .ok_or_else(|| HaulError::invalid_state("image channel is not available"))?;
        self.pending = Some((spawn_unpack(channel, dest, packaging, log), payload));
        Ok(())
    }

    async fn stop_accept_images(&mut self) -> HaulResult<u64> {
        let (task, payload) = self
            .pending
            .take()
            .ok_or_else(|| HaulError::invalid_state("no image transfer in progress"))?;
        let (channel, bytes) = task.join(self.config.unpack_timeout()).await?;
        self.channel = Some(channel);
        if payload == ImagePayload::Full {
            self.store_mut()?.mark_synced();
        }
        Ok(bytes)
    }

    async fn apply_diff_images(&mut self) -> HaulResult<()> {
        let store = self.store_mut()?;
        let base = store.last_sync_iter();
        let patch = store.current_dir()?.join(DIFF_FILE_NAME);
        store.apply_diff(base, &patch).await?;
        Ok(())
    }

    fn reload_daemon(&mut self) -> HaulResult<()> {
        let driver = self.driver()?;
        if self.reload.is_some() {
            return Err(HaulError::invalid_state("daemon reload already running"));
        }
        info!("Reloading workload daemon in background");
        self.reload = Some(tokio::spawn(async move {
            let start = Instant::now();
            driver.reload_daemon().await?;
            Ok(start.elapsed())
        }));
        Ok(())
    }

    async fn restore_from_images(&mut self) -> HaulResult<()> {
        self.await_reload().await?;
        let driver = self.driver()?;
        let store = self.store_mut()?;
        let ctx = RestoreContext {
            image_dir: store.current_dir()?.to_path_buf(),
            work_dir: store.work_dir().to_path_buf(),
        };
        let start = Instant::now();
        driver.restore(&ctx).await?;
        self.restore_time = Some(start.elapsed());
        info!(
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Workload restored"
        );
        Ok(())
    }

    async fn migration_complete(&mut self) -> HaulResult<()> {
        self.driver()?.migration_complete().await?;
        if let Some(store) = self.store.as_mut() {
            store.close();
        }
        info!("Migration complete on target");
        Ok(())
    }

    /// Execute one request
    pub async fn handle(&mut self, request: RpcRequest) -> HaulResult<Value> {
        match request {
            RpcRequest::Setup { workload, mode } => {
                self.driver = Some(self.registry.create(&workload, DriverRole::Target)?);
                info!(workload = %workload, mode = %mode, "Target set up");
                self.workload = Some(workload);
                self.mode = Some(mode);
                Ok(Value::Null)
            }
            RpcRequest::PropagateConfig { config } => {
                config.validate()?;
                self.config = config;
                Ok(Value::Null)
            }
            RpcRequest::CheckCompat { probe } => Ok(Value::from(self.check_compat(&probe).await?)),
            RpcRequest::CheckToolVersion { version } => {
                Ok(Value::from(self.check_tool_version(&version).await?))
            }
            RpcRequest::StartIteration { need_page_server } => {
                self.start_iteration(need_page_server).await?;
                Ok(Value::Null)
            }
            RpcRequest::StartAcceptImages { dir, payload } => {
                self.start_accept_images(dir, payload)?;
                Ok(Value::Null)
            }
            RpcRequest::StopAcceptImages => Ok(Value::from(self.stop_accept_images().await?)),
            RpcRequest::ApplyDiffImages => {
                self.apply_diff_images().await?;
                Ok(Value::Null)
            }
            RpcRequest::RestoreFromImages => {
                self.restore_from_images().await?;
                Ok(Value::Null)
            }
            RpcRequest::ReloadWorkloadDaemonNonblocking => {
                self.reload_daemon()?;
                Ok(Value::Null)
            }
            RpcRequest::StartWorkload => {
                self.await_reload().await?;
                self.driver()?.start().await?;
                Ok(Value::Null)
            }
            RpcRequest::MigrationComplete => {
                self.migration_complete().await?;
                Ok(Value::Null)
            }
            RpcRequest::RestoreTime => Ok(secs(self.restore_time)),
            RpcRequest::DiffApplyTime => Ok(secs(
                self.store.as_ref().and_then(ImageStore::apply_diff_time),
            )),
            RpcRequest::ReloadTime => Ok(secs(self.reload_time)),
        }
    }

    /// Answer requests read from `reader` until the peer hangs up
    pub async fn serve<RD, WR>(&mut self, reader: RD, mut writer: WR) -> HaulResult<()>
    where
        RD: AsyncRead + Unpin,
        WR: AsyncWrite + Unpin,
    {
        let mut lines = BufReader::new(reader).lines();
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let response = match serde_json::from_str::<RpcRequest>(&line) {
                Ok(request) => {
                    let method = request.method();
                    debug!(method, "Handling request");
                    match self.handle(request).await {
                        Ok(result) => RpcResponse::success(result),
                        Err(e) => {
                            warn!(method, error = %e, "Request failed");
                            RpcResponse::failure(e.to_string())
                        }
                    }
                }
                Err(e) => RpcResponse::failure(format!("malformed request: {}", e)),
            };
            let mut out = serde_json::to_string(&response)?;
            out.push('\n');
            writer.write_all(out.as_bytes()).await?;
            writer.flush().await?;
        }
        info!("Peer disconnected");
        self.shutdown();
        Ok(())
    }

    /// Stop any in-flight unpack and release the image store
    pub fn shutdown(&mut self) {
        if let Some((task, _)) = self.pending.take() {
            task.cancel();
        }
        if let Some(store) = self.store.as_mut() {
            store.close();
        }
    }
}
