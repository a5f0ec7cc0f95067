//! Image transfer primitives
//!
//! A directory is packaged with `tar`, optionally piped through a
//! compressor, and written onto an already-open byte channel as a sequence
//! of length-prefixed frames:
//!
//! ```text
//! [u32 BE len][len bytes] ... [u32 BE 0]
//! ```
//!
//! The zero-length frame ends one archive so the same channel can carry the
//! next transfer. The receiving side unpacks in a background task that the
//! caller joins with a bounded wait.

use crate::config::{MigrationConfig, TransferStrategy};
use crate::error::{HaulError, HaulResult};
use crate::session_log::SessionLog;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Payload size of one frame
pub const FRAME_CHUNK: usize = 64 * 1024;

/// Largest frame accepted from a peer
const MAX_FRAME: u32 = 16 * 1024 * 1024;

/// Write one frame; an empty payload is the end-of-archive marker
pub async fn write_frame<W>(channel: &mut W, payload: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    channel.write_u32(payload.len() as u32).await?;
    if !payload.is_empty() {
        channel.write_all(payload).await?;
    }
    Ok(())
}

/// Read one frame into `buf`; returns 0 at the end-of-archive marker
pub async fn read_frame<R>(channel: &mut R, buf: &mut Vec<u8>) -> std::io::Result<usize>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let len = channel.read_u32().await?;
    if len > MAX_FRAME {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame of {} bytes exceeds limit", len),
        ));
    }
    buf.resize(len as usize, 0);
    channel.read_exact(buf).await?;
    Ok(len as usize)
}

/// How archives are compressed on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Packaging {
    pub strategy: TransferStrategy,
    pub level: u8,
}

impl Packaging {
    pub fn new(strategy: TransferStrategy, level: u8) -> Self {
        Self { strategy, level }
    }

    pub fn from_config(config: &MigrationConfig) -> Self {
        Self::new(config.transfer, config.compression_level)
    }

    /// Compressor program, or `None` for a plain archive
    pub fn compressor(&self) -> Option<&'static str> {
        if self.level == 0 {
            return None;
        }
        match self.strategy {
            TransferStrategy::Archive => None,
            TransferStrategy::ArchiveCompress => Some("gzip"),
            TransferStrategy::ThreadedCompress => Some("pigz"),
        }
    }
}

fn spawn_failed(stage: &str, program: &str, e: std::io::Error) -> HaulError {
    HaulError::transfer(stage, format!("cannot spawn {}: {}", program, e))
}

async fn wait_success(child: &mut Child, stage: &str, program: &str) -> HaulResult<()> {
    let status = child
        .wait()
        .await
        .map_err(|e| HaulError::transfer(stage, format!("waiting for {}: {}", program, e)))?;
    if !status.success() {
        return Err(HaulError::transfer(
            stage,
            format!("{} exited with {}", program, status),
        ));
    }
    Ok(())
}

/// Package `dir` onto `channel`; returns the number of payload bytes sent
pub async fn send_dir<W>(
    dir: &Path,
    channel: &mut W,
    packaging: Packaging,
    log: &SessionLog,
) -> HaulResult<u64>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    if !dir.is_dir() {
        return Err(HaulError::PathNotFound {
            path: dir.to_path_buf(),
        });
    }
    log.note(&format!("pack {}", dir.display()))?;

    let mut tar = Command::new("tar")
        .arg("-cpf")
        .arg("-")
        .arg("-C")
        .arg(dir)
        .arg(".")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(log.stdio()?)
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| spawn_failed("pack", "tar", e))?;
    let tar_out = tar
        .stdout
        .take()
        .ok_or_else(|| HaulError::transfer("pack", "tar stdout unavailable"))?;

    let (mut source, mut compressor): (Box<dyn AsyncRead + Unpin + Send>, Option<(Child, &str)>) =
        match packaging.compressor() {
            Some(program) => {
                let stdin: Stdio = tar_out.try_into()?;
                let mut child = Command::new(program)
                    .arg(format!("-{}", packaging.level))
                    .arg("-c")
                    .stdin(stdin)
                    .stdout(Stdio::piped())
                    .stderr(log.stdio()?)
                    .kill_on_drop(true)
                    .spawn()
                    .map_err(|e| spawn_failed("compress", program, e))?;
                let out = child
                    .stdout
                    .take()
                    .ok_or_else(|| HaulError::transfer("compress", "compressor stdout unavailable"))?;
                (Box::new(out), Some((child, program)))
            }
            None => (Box::new(tar_out), None),
        };

    let mut buf = vec![0u8; FRAME_CHUNK];
    let mut total = 0u64;
    loop {
        let n = source
            .read(&mut buf)
            .await
            .map_err(|e| HaulError::transfer("pack", e.to_string()))?;
        if n == 0 {
            break;
        }
        write_frame(channel, &buf[..n])
            .await
            .map_err(|e| HaulError::transfer("send", e.to_string()))?;
        total += n as u64;
    }
    write_frame(channel, &[])
        .await
        .map_err(|e| HaulError::transfer("send", e.to_string()))?;
    channel
        .flush()
        .await
        .map_err(|e| HaulError::transfer("send", e.to_string()))?;

    wait_success(&mut tar, "pack", "tar").await?;
    if let Some((child, program)) = compressor.as_mut() {
        wait_success(child, "compress", program).await?;
    }

    debug!(dir = %dir.display(), bytes = total, "Sent archive");
    Ok(total)
}

async fn receive_into<R>(
    mut channel: R,
    dest: PathBuf,
    packaging: Packaging,
    log: SessionLog,
) -> HaulResult<(R, u64)>
where
    R: AsyncRead + Unpin + Send,
{
    log.note(&format!("unpack into {}", dest.display()))?;

    let mut tar_cmd = Command::new("tar");
    tar_cmd
        .arg("-xpf")
        .arg("-")
        .arg("-C")
        .arg(&dest)
        .stdout(log.stdio()?)
        .stderr(log.stdio()?)
        .kill_on_drop(true);

    let (mut sink, mut tar, mut decompressor) = match packaging.compressor() {
        Some(program) => {
            let mut child = Command::new(program)
                .arg("-d")
                .arg("-c")
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(log.stdio()?)
                .kill_on_drop(true)
                .spawn()
                .map_err(|e| spawn_failed("decompress", program, e))?;
            let out = child
                .stdout
                .take()
                .ok_or_else(|| HaulError::transfer("decompress", "decompressor stdout unavailable"))?;
            let stdin = child
                .stdin
                .take()
                .ok_or_else(|| HaulError::transfer("decompress", "decompressor stdin unavailable"))?;
            let tar_in: Stdio = out.try_into()?;
            let tar = tar_cmd
                .stdin(tar_in)
                .spawn()
                .map_err(|e| spawn_failed("unpack", "tar", e))?;
            (stdin, tar, Some((child, program)))
        }
        None => {
            let mut tar = tar_cmd
                .stdin(Stdio::piped())
                .spawn()
                .map_err(|e| spawn_failed("unpack", "tar", e))?;
            let stdin = tar
                .stdin
                .take()
                .ok_or_else(|| HaulError::transfer("unpack", "tar stdin unavailable"))?;
            (stdin, tar, None)
        }
    };

    let mut buf = Vec::with_capacity(FRAME_CHUNK);
    let mut total = 0u64;
    loop {
        let n = read_frame(&mut channel, &mut buf)
            .await
            .map_err(|e| HaulError::transfer("receive", e.to_string()))?;
        if n == 0 {
            break;
        }
        sink.write_all(&buf[..n])
            .await
            .map_err(|e| HaulError::transfer("unpack", e.to_string()))?;
        total += n as u64;
    }
    sink.shutdown()
        .await
        .map_err(|e| HaulError::transfer("unpack", e.to_string()))?;
    drop(sink);

    if let Some((child, program)) = decompressor.as_mut() {
        wait_success(child, "decompress", program).await?;
    }
    wait_success(&mut tar, "unpack", "tar").await?;

    info!(dest = %dest.display(), bytes = total, "Received archive");
    Ok((channel, total))
}

/// Background unpack of one archive from the image channel
pub struct UnpackTask<R> {
    dest: PathBuf,
    handle: JoinHandle<HaulResult<(R, u64)>>,
    cancel: CancellationToken,
}

/// Start unpacking the next archive on `channel` into `dest`.
///
/// The channel is handed back by [`UnpackTask::join`] once the archive is
/// fully consumed.
pub fn spawn_unpack<R>(channel: R, dest: PathBuf, packaging: Packaging, log: SessionLog) -> UnpackTask<R>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    let task_dest = dest.clone();
    let handle = tokio::spawn(async move {
        tokio::select! {
            _ = token.cancelled() => Err(HaulError::transfer("unpack", "cancelled")),
            result = receive_into(channel, task_dest, packaging, log) => result,
        }
    });
    info!(dest = %dest.display(), "Started image receiver");
    UnpackTask {
        dest,
        handle,
        cancel,
    }
}

impl<R> UnpackTask<R> {
    pub fn dest(&self) -> &Path {
        &self.dest
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the unpack to finish. Exceeding `timeout` is fatal and
    /// cancels the task.
    pub async fn join(mut self, timeout: Duration) -> HaulResult<(R, u64)> {
        match tokio::time::timeout(timeout, &mut self.handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(HaulError::transfer("unpack", format!("unpack task failed: {}", e))),
            Err(_) => {
                self.cancel.cancel();
                error!(
                    dest = %self.dest.display(),
                    timeout_secs = timeout.as_secs(),
                    "Timed out waiting for images to unpack"
                );
                Err(HaulError::transfer(
                    "unpack",
                    format!("timed out after {}s", timeout.as_secs()),
                ))
            }
        }
    }
}
