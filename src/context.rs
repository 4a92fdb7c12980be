//! Build context shared across all build stages.
//!
//! One context describes one build invocation: which version is being
//! produced, which version it is derived from, and the resources (worker
//! pool, delta engine, counters) the stages share. Nothing here is global,
//! so independent builds can run side by side in one process.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::Config;
use crate::delta::{engine_from_name, DeltaEngine, RsyncDelta};
use crate::error::Result;
use crate::file::File;
use crate::heuristics::probe_filetype;
use crate::manifest::{RenameParams, FORMAT_CURRENT};
use crate::pool::{num_threads, WorkerPool};
use crate::state::{read_current_version, LATEST_VERSION_FILE};
use crate::stats::Stats;

/// Shared context for all build operations.
#[derive(Debug)]
pub struct BuildContext {
    pub config: Config,
    /// Last version built before this invocation (0 when none).
    pub current_version: u32,
    /// Version being produced.
    pub new_version: u32,
    /// Deletions older than this are dropped from manifests.
    pub min_version: u32,
    /// Manifest format to write.
    pub format: u32,
    /// Shared with pool workers that account delta outcomes.
    pub stats: Arc<Stats>,
    pub rename: RenameParams,
    pub delta: Arc<dyn DeltaEngine>,
    pub pool: WorkerPool,
}

impl BuildContext {
    /// Create a context for building `new_version`.
    ///
    /// The previous version comes from `latest.version` in the image base,
    /// or the configured initial version when nothing was built yet.
    pub fn new(config: Config, new_version: u32) -> Result<Self> {
        let latest = config.image_base.join(LATEST_VERSION_FILE);
        let current_version = read_current_version(&latest)?.unwrap_or(config.initial_version);
        let pool = WorkerPool::new(num_threads(config.thread_scaling))?;
        let delta = engine_from_name(&config.delta_engine);

        Ok(Self {
            config,
            current_version,
            new_version,
            min_version: 0,
            format: FORMAT_CURRENT,
            stats: Arc::default(),
            rename: RenameParams::default(),
            delta,
            pool,
        })
    }

    pub fn with_min_version(mut self, min_version: u32) -> Self {
        self.min_version = min_version;
        self
    }

    pub fn with_format(mut self, format: u32) -> Self {
        self.format = format;
        self
    }

    pub fn with_current_version(mut self, version: u32) -> Self {
        self.current_version = version;
        self
    }

    /// Create a build context rooted at `state_dir` for testing.
    ///
    /// Unlike `new()`, this ignores the environment and `latest.version`.
    /// This is intended for unit/integration tests only.
    #[doc(hidden)]
    pub fn for_testing(state_dir: &Path, new_version: u32) -> Result<Self> {
        let pool = WorkerPool::new(2)?;
        Ok(Self {
            config: Config::for_state_dir(state_dir),
            current_version: 0,
            new_version,
            min_version: 0,
            format: FORMAT_CURRENT,
            stats: Arc::default(),
            rename: RenameParams::default(),
            delta: Arc::new(RsyncDelta::default()),
            pool,
        })
    }

    /// `<image_base>/<version>`.
    pub fn image_dir(&self, version: u32) -> PathBuf {
        self.config.image_base.join(version.to_string())
    }

    /// `<image_base>/<version>/full`.
    pub fn full_dir(&self, version: u32) -> PathBuf {
        self.image_dir(version).join("full")
    }

    /// Location of `filename` inside the full tree of `version`.
    pub fn image_path(&self, version: u32, filename: &str) -> PathBuf {
        self.full_dir(version).join(filename.trim_start_matches('/'))
    }

    /// `<output_dir>/<version>`.
    pub fn output_version_dir(&self, version: u32) -> PathBuf {
        self.config.output_dir.join(version.to_string())
    }

    /// `groups.ini` in the state directory.
    pub fn groups_file(&self) -> PathBuf {
        self.config.state_dir.join("groups.ini")
    }

    /// Content class probe used by rename detection.
    pub fn probe(&self, version: u32, file: &File) -> String {
        probe_filetype(&self.config.image_base, version, file)
    }
}
