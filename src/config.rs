//! Configuration management for the update server.
//!
//! Reads configuration from environment variables. `main` loads a `.env`
//! file first (via dotenvy), so values from `.env` apply unless the real
//! environment overrides them.

use serde::Serialize;
use std::path::{Path, PathBuf};

/// Default state directory holding images, output and bookkeeping.
pub const DEFAULT_STATE_DIR: &str = "/var/lib/update";

/// Server configuration.
#[derive(Debug, Clone, Serialize)]
pub struct Config {
    /// Root of all server state (default: /var/lib/update)
    pub state_dir: PathBuf,
    /// Per-version image trees: `<image_base>/<version>/{full,<bundle>}`
    pub image_base: PathBuf,
    /// Download area: `<output_dir>/<version>/Manifest.*`, fullfiles, packs
    pub output_dir: PathBuf,
    /// Version assumed as previous when no latest.version exists
    pub initial_version: u32,
    /// Skip debuginfo files when walking image trees
    pub ban_debuginfo: bool,
    /// Path prefix of library debuginfo
    pub debuginfo_lib: String,
    /// Path prefix of source debuginfo
    pub debuginfo_src: String,
    /// Worker pool scaling factor applied to the CPU count
    pub thread_scaling: f32,
    /// Binary diff engine: `rsync` (in-process) or `bsdiff`
    pub delta_engine: String,
}

impl Config {
    /// Load configuration from the environment, rooted at the default state dir.
    pub fn load() -> Self {
        Self::load_with_state_dir(None)
    }

    /// Load configuration, optionally overriding the state directory.
    ///
    /// Paths not set explicitly are derived from the state directory.
    pub fn load_with_state_dir(state_dir: Option<&Path>) -> Self {
        let state_dir = state_dir
            .map(Path::to_path_buf)
            .or_else(|| env_path("SWUPD_STATE_DIR"))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_STATE_DIR));

        let image_base = env_path("SWUPD_IMAGE_BASE").unwrap_or_else(|| state_dir.join("image"));
        let output_dir = env_path("SWUPD_OUTPUT_DIR").unwrap_or_else(|| state_dir.join("www"));

        let initial_version = std::env::var("SWUPD_INITIAL_VERSION")
            .ok()
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0);

        let ban_debuginfo = std::env::var("SWUPD_BAN_DEBUGINFO")
            .map(|v| parse_bool(&v))
            .unwrap_or(false);

        let debuginfo_lib = std::env::var("SWUPD_DEBUGINFO_LIB")
            .unwrap_or_else(|_| "/usr/lib/debug/".to_string());
        let debuginfo_src = std::env::var("SWUPD_DEBUGINFO_SRC")
            .unwrap_or_else(|_| "/usr/src/debug/".to_string());

        let thread_scaling = std::env::var("SWUPD_THREAD_SCALING")
            .ok()
            .and_then(|v| v.trim().parse().ok())
            .filter(|s: &f32| *s > 0.0)
            .unwrap_or(1.0);

        let delta_engine = std::env::var("SWUPD_DELTA_ENGINE")
            .map(|v| v.trim().to_ascii_lowercase())
            .ok()
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| "rsync".to_string());

        Self {
            state_dir,
            image_base,
            output_dir,
            initial_version,
            ban_debuginfo,
            debuginfo_lib,
            debuginfo_src,
            thread_scaling,
            delta_engine,
        }
    }

    /// Configuration rooted entirely under `state_dir`, ignoring the environment.
    ///
    /// Intended for tests that run several builds in one process.
    #[doc(hidden)]
    pub fn for_state_dir(state_dir: &Path) -> Self {
        Self {
            state_dir: state_dir.to_path_buf(),
            image_base: state_dir.join("image"),
            output_dir: state_dir.join("www"),
            initial_version: 0,
            ban_debuginfo: false,
            debuginfo_lib: "/usr/lib/debug/".to_string(),
            debuginfo_src: "/usr/src/debug/".to_string(),
            thread_scaling: 1.0,
            delta_engine: "rsync".to_string(),
        }
    }

    /// Returns the debuginfo path prefix that `path` falls under, if any.
    pub fn debuginfo_path(&self, path: &str) -> Option<&str> {
        [self.debuginfo_lib.as_str(), self.debuginfo_src.as_str()]
            .into_iter()
            .find(|prefix| !prefix.is_empty() && path.starts_with(prefix))
    }

    /// Print configuration for debugging.
    pub fn print(&self) {
        println!("Configuration:");
        println!("  SWUPD_STATE_DIR: {}", self.state_dir.display());
        println!("  SWUPD_IMAGE_BASE: {}", self.image_base.display());
        println!("  SWUPD_OUTPUT_DIR: {}", self.output_dir.display());
        println!("  SWUPD_INITIAL_VERSION: {}", self.initial_version);
        println!("  SWUPD_BAN_DEBUGINFO: {}", self.ban_debuginfo);
        println!("  SWUPD_THREAD_SCALING: {}", self.thread_scaling);
        println!("  SWUPD_DELTA_ENGINE: {}", self.delta_engine);
        if self.image_base.exists() {
            println!("  Image base: FOUND");
        } else {
            println!("  Image base: NOT FOUND");
        }
    }
}

fn env_path(key: &str) -> Option<PathBuf> {
    std::env::var(key)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .map(PathBuf::from)
}

fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
