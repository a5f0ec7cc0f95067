//! Host coordination proxy
//!
//! The source side drives the target through [`HostCoordination`]. Every
//! call blocks until the peer answers; there is no pipelining and no retry.
//! Any transport failure or non-success response is an [`HaulError::Rpc`],
//! which invalidates the whole session.

use crate::config::{MigrationConfig, MigrationMode};
use crate::error::{HaulError, HaulResult};
use crate::rpc::messages::{
    CompatProbe, ImageDirKind, ImagePayload, RpcRequest, RpcResponse, WorkloadDescriptor,
};
use async_trait::async_trait;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};
use tracing::debug;

/// Remote operations the orchestrator needs from the target host.
///
/// Methods take `&mut self` so a handle can only have one call in flight.
#[async_trait]
pub trait HostCoordination: Send {
    /// Bind the target to a workload and migration mode
    async fn setup(&mut self, workload: &WorkloadDescriptor, mode: MigrationMode) -> HaulResult<()>;

    /// Send the session configuration
    async fn propagate_config(&mut self, config: &MigrationConfig) -> HaulResult<()>;

    /// Ask the target whether the source's CPU probe is compatible
    async fn check_compat(&mut self, probe: &CompatProbe) -> HaulResult<bool>;

    /// Ask the target whether its checkpoint tool matches `version`
    async fn check_tool_version(&mut self, version: &str) -> HaulResult<bool>;

    /// Mirror a `new_iteration()` on the target
    async fn start_iteration(&mut self, need_page_server: bool) -> HaulResult<()>;

    /// Start unpacking the next archive on the image channel
    async fn start_accept_images(&mut self, dir: ImageDirKind, payload: ImagePayload) -> HaulResult<()>;

    /// Join the unpack task; returns the number of bytes received
    async fn stop_accept_images(&mut self) -> HaulResult<u64>;

    /// Apply the received delta to the last synced iteration
    async fn apply_diff_images(&mut self) -> HaulResult<()>;

    /// Restore the workload from the current image directory
    async fn restore_from_images(&mut self) -> HaulResult<()>;

    /// Start reloading the workload runtime daemon without waiting for it
    async fn reload_workload_daemon_nonblocking(&mut self) -> HaulResult<()>;

    /// Start the workload from its synced filesystem (restart mode)
    async fn start_workload(&mut self) -> HaulResult<()>;

    async fn migration_complete(&mut self) -> HaulResult<()>;

    async fn restore_time(&mut self) -> HaulResult<Option<Duration>>;

    async fn diff_apply_time(&mut self) -> HaulResult<Option<Duration>>;

    async fn reload_time(&mut self) -> HaulResult<Option<Duration>>;
}

/// JSON-lines client for a target service
pub struct RemoteHost<R, W> {
    reader: BufReader<R>,
    writer: W,
    line: String,
}

/// Connect to a target service over TCP
pub async fn connect_tcp(
    addr: impl ToSocketAddrs,
) -> HaulResult<RemoteHost<OwnedReadHalf, OwnedWriteHalf>> {
    let stream = TcpStream::connect(addr)
        .await
        .map_err(|e| HaulError::rpc("connect", e.to_string()))?;
    stream.set_nodelay(true)?;
    let (reader, writer) = stream.into_split();
    Ok(RemoteHost::new(reader, writer))
}

impl<R, W> RemoteHost<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader: BufReader::new(reader),
            writer,
            line: String::new(),
        }
    }

    /// Send one request and wait for its response
    pub async fn call(&mut self, request: RpcRequest) -> HaulResult<serde_json::Value> {
        let method = request.method();
        let started = Instant::now();

        let mut payload = serde_json::to_string(&request)?;
        payload.push('\n');
        self.writer
            .write_all(payload.as_bytes())
            .await
            .map_err(|e| HaulError::rpc(method, format!("send failed: {}", e)))?;
        self.writer
            .flush()
            .await
            .map_err(|e| HaulError::rpc(method, format!("send failed: {}", e)))?;

        self.line.clear();
        let n = self
            .reader
            .read_line(&mut self.line)
            .await
            .map_err(|e| HaulError::rpc(method, format!("receive failed: {}", e)))?;
        if n == 0 {
            return Err(HaulError::rpc(method, "connection closed by peer"));
        }

        let response: RpcResponse = serde_json::from_str(self.line.trim_end())
            .map_err(|e| HaulError::rpc(method, format!("malformed response: {}", e)))?;
        debug!(
            method,
            ok = response.ok,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "RPC call"
        );

        if !response.ok {
            return Err(HaulError::rpc(
                method,
                response
                    .error
                    .unwrap_or_else(|| "peer reported failure".to_string()),
            ));
        }
        Ok(response.result)
    }

    async fn call_as<T: serde::de::DeserializeOwned>(&mut self, request: RpcRequest) -> HaulResult<T> {
        let method = request.method();
        let value = self.call(request).await?;
        serde_json::from_value(value)
            .map_err(|e| HaulError::rpc(method, format!("unexpected result: {}", e)))
    }

    async fn call_duration(&mut self, request: RpcRequest) -> HaulResult<Option<Duration>> {
        let method = request.method();
        let secs: Option<f64> = self.call_as(request).await?;
        secs.map(|secs| {
            Duration::try_from_secs_f64(secs)
                .map_err(|e| HaulError::rpc(method, format!("invalid duration {}: {}", secs, e)))
        })
        .transpose()
    }
}

#[async_trait]
impl<R, W> HostCoordination for RemoteHost<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    async fn setup(&mut self, workload: &WorkloadDescriptor, mode: MigrationMode) -> HaulResult<()> {
        self.call(RpcRequest::Setup {
            workload: workload.clone(),
            mode,
        })
        .await?;
        Ok(())
    }

    async fn propagate_config(&mut self, config: &MigrationConfig) -> HaulResult<()> {
        self.call(RpcRequest::PropagateConfig {
            config: config.clone(),
        })
        .await?;
        Ok(())
    }

    async fn check_compat(&mut self, probe: &CompatProbe) -> HaulResult<bool> {
        self.call_as(RpcRequest::CheckCompat {
            probe: probe.clone(),
        })
        .await
    }

    async fn check_tool_version(&mut self, version: &str) -> HaulResult<bool> {
        self.call_as(RpcRequest::CheckToolVersion {
            version: version.to_string(),
        })
        .await
    }

    async fn start_iteration(&mut self, need_page_server: bool) -> HaulResult<()> {
        self.call(RpcRequest::StartIteration { need_page_server }).await?;
        Ok(())
    }

    async fn start_accept_images(&mut self, dir: ImageDirKind, payload: ImagePayload) -> HaulResult<()> {
        self.call(RpcRequest::StartAcceptImages { dir, payload }).await?;
        Ok(())
    }

    async fn stop_accept_images(&mut self) -> HaulResult<u64> {
        self.call_as(RpcRequest::StopAcceptImages).await
    }

    async fn apply_diff_images(&mut self) -> HaulResult<()> {
        self.call(RpcRequest::ApplyDiffImages).await?;
        Ok(())
    }

    async fn restore_from_images(&mut self) -> HaulResult<()> {
        self.call(RpcRequest::RestoreFromImages).await?;
        Ok(())
    }

    async fn reload_workload_daemon_nonblocking(&mut self) -> HaulResult<()> {
        self.call(RpcRequest::ReloadWorkloadDaemonNonblocking).await?;
        Ok(())
    }

    async fn start_workload(&mut self) -> HaulResult<()> {
        self.call(RpcRequest::StartWorkload).await?;
        Ok(())
    }

    async fn migration_complete(&mut self) -> HaulResult<()> {
        self.call(RpcRequest::MigrationComplete).await?;
        Ok(())
    }

    async fn restore_time(&mut self) -> HaulResult<Option<Duration>> {
        self.call_duration(RpcRequest::RestoreTime).await
    }

    async fn diff_apply_time(&mut self) -> HaulResult<Option<Duration>> {
        self.call_duration(RpcRequest::DiffApplyTime).await
    }

    async fn reload_time(&mut self) -> HaulResult<Option<Duration>> {
        self.call_duration(RpcRequest::ReloadTime).await
    }
}
