//! Checkpoint image store
//!
//! Owns the work directory of one migration session and the ordered list of
//! iteration directories under `<work_dir>/img`:
//!
//! ```text
//! <img_path>/<kind>-<yy.mm.dd-HH.MM>-<random>/
//!     img/1, img/2, ...          one checkpoint per iteration
//!     img/diff-<base>-<target>/  delta between two iterations (diff.bin)
//!     img/combined-<new>-<base>/ base + delta, target side only
//!     xdelta3.log                diff tool output
//!     transfer.log               archiver output
//! ```
//!
//! Iterations are 1-indexed. `current_iter` always equals the number of
//! iteration directories, and `last_sync_iter` never exceeds it.

use crate::config::MigrationConfig;
use crate::error::{HaulError, HaulResult};
use crate::images::diff::DiffTool;
use crate::session_log::SessionLog;
use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// File name of a delta inside its diff directory
pub const DIFF_FILE_NAME: &str = "diff.bin";

/// Log file receiving diff tool output
pub const DIFF_LOG_NAME: &str = "xdelta3.log";

/// Log file receiving archiver and compressor output
pub const TRANSFER_LOG_NAME: &str = "transfer.log";

/// A computed delta between two iterations
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffArtifact {
    pub base_iter: u32,
    pub target_iter: u32,
    /// Directory holding `diff.bin`
    pub dir: PathBuf,
    /// Size of `diff.bin` in bytes
    pub size: u64,
}

impl DiffArtifact {
    pub fn file(&self) -> PathBuf {
        self.dir.join(DIFF_FILE_NAME)
    }
}

/// Iteration directories and diff artifacts of one session
pub struct ImageStore {
    work_dir: PathBuf,
    img_root: PathBuf,
    iterations: Vec<PathBuf>,
    current_iter: u32,
    last_sync_iter: u32,
    current_handle: Option<File>,
    diffs: HashMap<(u32, u32), DiffArtifact>,
    diff_tool: DiffTool,
    diff_log: SessionLog,
    transfer_log: SessionLog,
    keep_on_close: bool,
    closed: bool,
    diff_time: Option<Duration>,
    apply_diff_time: Option<Duration>,
    diff_count: u32,
    apply_count: u32,
}

impl ImageStore {
    /// Create a fresh work directory under `config.img_path`
    pub fn create(kind: &str, config: &MigrationConfig) -> HaulResult<Self> {
        std::fs::create_dir_all(&config.img_path)?;
        let stamp = chrono::Local::now().format("%y.%m.%d-%H.%M");
        let work_dir = tempfile::Builder::new()
            .prefix(&format!("{}-{}-", kind, stamp))
            .tempdir_in(&config.img_path)?
            .into_path();
        Self::open(work_dir, config)
    }

    /// Use an existing, empty work directory
    pub fn open(work_dir: impl AsRef<Path>, config: &MigrationConfig) -> HaulResult<Self> {
        let work_dir = work_dir.as_ref().to_path_buf();
        if !work_dir.is_dir() {
            return Err(HaulError::PathNotFound { path: work_dir });
        }
        let img_root = work_dir.join("img");
        std::fs::create_dir_all(&img_root)?;
        info!(work_dir = %work_dir.display(), "Image store ready");

        Ok(Self {
            diff_log: SessionLog::new(work_dir.join(DIFF_LOG_NAME)),
            transfer_log: SessionLog::new(work_dir.join(TRANSFER_LOG_NAME)),
            work_dir,
            img_root,
            iterations: Vec::new(),
            current_iter: 0,
            last_sync_iter: 0,
            current_handle: None,
            diffs: HashMap::new(),
            diff_tool: DiffTool::from_config(config)?,
            keep_on_close: config.keep_images,
            closed: false,
            diff_time: None,
            apply_diff_time: None,
            diff_count: 0,
            apply_count: 0,
        })
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn image_root(&self) -> &Path {
        &self.img_root
    }

    pub fn current_iter(&self) -> u32 {
        self.current_iter
    }

    pub fn last_sync_iter(&self) -> u32 {
        self.last_sync_iter
    }

    pub fn iterations(&self) -> &[PathBuf] {
        &self.iterations
    }

    pub fn transfer_log(&self) -> &SessionLog {
        &self.transfer_log
    }

    /// Directory of a 1-indexed iteration
    pub fn iteration_dir(&self, index: u32) -> HaulResult<&Path> {
        if index == 0 || index > self.current_iter {
            return Err(HaulError::NoSuchIteration {
                index,
                current: self.current_iter,
            });
        }
        Ok(&self.iterations[index as usize - 1])
    }

    /// Directory of the current iteration
    pub fn current_dir(&self) -> HaulResult<&Path> {
        self.iteration_dir(self.current_iter)
    }

    /// Parent image directory relative to the current one, for incremental dumps
    pub fn parent_dir(&self) -> Option<PathBuf> {
        if self.current_iter <= 1 {
            return None;
        }
        let parent = self.iterations.get(self.current_iter as usize - 2)?;
        let name = parent.file_name()?;
        Some(Path::new("..").join(name))
    }

    fn diff_dir_name(&self, base: u32, target: u32) -> PathBuf {
        self.img_root.join(format!("diff-{}-{}", base, target))
    }

    fn ensure_open(&self) -> HaulResult<()> {
        if self.closed {
            return Err(HaulError::invalid_state("image store is closed"));
        }
        Ok(())
    }

    /// Allocate the next iteration directory and make it current
    pub fn new_iteration(&mut self) -> HaulResult<PathBuf> {
        self.ensure_open()?;
        self.current_handle = None;

        let index = self.current_iter + 1;
        let dir = self.img_root.join(index.to_string());
        info!(iteration = index, dir = %dir.display(), "Making image directory");
        std::fs::create_dir(&dir)?;

        self.current_handle = Some(File::open(&dir)?);
        self.iterations.push(dir.clone());
        self.current_iter = index;
        Ok(dir)
    }

    /// Drop the newest iteration together with any diff computed for it.
    ///
    /// Iterations the peer already received cannot be discarded.
    pub fn discard_last_iteration(&mut self) -> HaulResult<()> {
        self.ensure_open()?;
        if self.current_iter == 0 {
            return Err(HaulError::invalid_state("no iteration to discard"));
        }
        if self.current_iter <= self.last_sync_iter {
            return Err(HaulError::invalid_state(format!(
                "iteration {} was already transferred",
                self.current_iter
            )));
        }

        self.current_handle = None;
        let index = self.current_iter;
        if let Some(dir) = self.iterations.last() {
            std::fs::remove_dir_all(dir)?;
            info!(iteration = index, dir = %dir.display(), "Image directory discarded");
        }
        self.iterations.pop();
        self.current_iter -= 1;

        let stale: Vec<(u32, u32)> = self
            .diffs
            .keys()
            .filter(|(_, target)| *target == index)
            .copied()
            .collect();
        for key in stale {
            if let Some(artifact) = self.diffs.remove(&key) {
                if artifact.dir.exists() {
                    std::fs::remove_dir_all(&artifact.dir)?;
                }
            }
        }

        if let Some(dir) = self.iterations.last() {
            self.current_handle = Some(File::open(dir)?);
        }
        Ok(())
    }

    /// Compute the delta from `base_iter` to `target_iter`.
    ///
    /// Each pair is computed at most once; later calls return the cached
    /// artifact.
    pub async fn compute_diff(&mut self, base_iter: u32, target_iter: u32) -> HaulResult<DiffArtifact> {
        self.ensure_open()?;
        if base_iter == target_iter {
            return Err(HaulError::diff(
                "diff",
                format!("base and target are the same iteration ({})", base_iter),
            ));
        }
        if let Some(artifact) = self.diffs.get(&(base_iter, target_iter)) {
            debug!(base = base_iter, target = target_iter, "Reusing computed diff");
            return Ok(artifact.clone());
        }

        let base = self.iteration_dir(base_iter)?.to_path_buf();
        let target = self.iteration_dir(target_iter)?.to_path_buf();

        let dir = self.diff_dir_name(base_iter, target_iter);
        if dir.exists() {
            std::fs::remove_dir_all(&dir)?;
        }
        std::fs::create_dir(&dir)?;
        let out = dir.join(DIFF_FILE_NAME);

        let start = Instant::now();
        self.diff_count += 1;
        self.diff_tool.diff(&base, &target, &out, &self.diff_log).await?;
        let elapsed = start.elapsed();
        self.diff_time = Some(elapsed);

        let size = std::fs::metadata(&out)
            .map_err(|e| HaulError::diff("diff", format!("no delta produced at {}: {}", out.display(), e)))?
            .len();
        info!(
            base = base_iter,
            target = target_iter,
            bytes = size,
            elapsed_ms = elapsed.as_millis() as u64,
            "Computed image diff"
        );

        let artifact = DiffArtifact {
            base_iter,
            target_iter,
            dir,
            size,
        };
        self.diffs.insert((base_iter, target_iter), artifact.clone());
        Ok(artifact)
    }

    /// Delta between the last synced iteration and the current one
    pub async fn diff_since_sync(&mut self) -> HaulResult<DiffArtifact> {
        self.compute_diff(self.last_sync_iter, self.current_iter).await
    }

    /// Rebuild a full image directory from `base_iter` plus `patch`
    /// (target side). The result is appended as a new iteration that is
    /// both current and synced. Returns the new index.
    pub async fn apply_diff(&mut self, base_iter: u32, patch: &Path) -> HaulResult<u32> {
        self.ensure_open()?;
        if self.current_iter <= self.last_sync_iter {
            return Err(HaulError::invalid_state(format!(
                "current iteration {} is not newer than last synced iteration {}, nothing to apply",
                self.current_iter, self.last_sync_iter
            )));
        }
        if base_iter >= self.current_iter {
            return Err(HaulError::invalid_state(format!(
                "diff base {} must precede current iteration {}",
                base_iter, self.current_iter
            )));
        }
        let base = self.iteration_dir(base_iter)?.to_path_buf();
        if !patch.is_file() {
            return Err(HaulError::PathNotFound {
                path: patch.to_path_buf(),
            });
        }

        let combined = self
            .img_root
            .join(format!("combined-{}-{}", self.current_iter, base_iter));
        if combined.exists() {
            return Err(HaulError::invalid_state(format!(
                "combined directory {} already exists",
                combined.display()
            )));
        }

        let start = Instant::now();
        self.apply_count += 1;
        self.current_handle = None;
        self.diff_tool.apply(&base, patch, &combined, &self.diff_log).await?;
        let elapsed = start.elapsed();
        self.apply_diff_time = Some(elapsed);

        self.current_handle = Some(File::open(&combined)?);
        self.iterations.push(combined);
        self.current_iter = self.iterations.len() as u32;
        self.last_sync_iter = self.current_iter;
        info!(
            base = base_iter,
            iteration = self.current_iter,
            elapsed_ms = elapsed.as_millis() as u64,
            "Applied image diff"
        );
        Ok(self.current_iter)
    }

    /// Record that the peer now holds the current iteration
    pub fn mark_synced(&mut self) {
        self.last_sync_iter = self.current_iter;
    }

    /// Time taken by the most recent diff computation
    pub fn diff_time(&self) -> Option<Duration> {
        self.diff_time
    }

    /// Time taken by the most recent diff application
    pub fn apply_diff_time(&self) -> Option<Duration> {
        self.apply_diff_time
    }

    pub fn diff_count(&self) -> u32 {
        self.diff_count
    }

    pub fn apply_count(&self) -> u32 {
        self.apply_count
    }

    /// Keep the work directory when the store is closed
    pub fn save_images(&mut self) {
        info!("Keeping images");
        self.keep_on_close = true;
    }

    /// Release directory handles and remove the work directory unless
    /// images are kept. Safe to call more than once.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.current_handle = None;

        if self.keep_on_close {
            info!(work_dir = %self.work_dir.display(), "Images are kept");
            return;
        }
        info!(work_dir = %self.work_dir.display(), "Removing images");
        if let Err(e) = std::fs::remove_dir_all(&self.work_dir) {
            warn!(work_dir = %self.work_dir.display(), "Failed to remove images: {}", e);
        }
    }
}
