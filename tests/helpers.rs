//! Shared test utilities for swupd-server tests.
#![allow(dead_code)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use swupd_server::config::Config;
use swupd_server::context::BuildContext;
use swupd_server::file::File;
use swupd_server::manifest::{manifest_from_file, Manifest};
use swupd_server::state::{read_current_version, LATEST_VERSION_FILE};
use swupd_server::update::{create_update, UpdateSummary};
use tempfile::TempDir;
use walkdir::WalkDir;

/// Test environment: one state directory with image trees and output.
pub struct TestEnv {
    /// Temporary directory (kept alive for lifetime of TestEnv)
    pub _temp_dir: TempDir,
    /// State directory (`image/`, `www/`, `groups.ini`)
    pub state_dir: PathBuf,
}

impl TestEnv {
    /// Create a new test environment with the given bundles in groups.ini.
    pub fn new(groups: &[&str]) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let state_dir = temp_dir.path().join("state");
        fs::create_dir_all(&state_dir).expect("Failed to create state dir");

        let env = Self {
            _temp_dir: temp_dir,
            state_dir,
        };
        env.write_groups(groups);
        env
    }

    pub fn config(&self) -> Config {
        Config::for_state_dir(&self.state_dir)
    }

    pub fn image(&self, version: u32) -> PathBuf {
        self.state_dir.join("image").join(version.to_string())
    }

    pub fn output(&self) -> PathBuf {
        self.state_dir.join("www")
    }

    /// Rewrite groups.ini with one section per bundle.
    pub fn write_groups(&self, groups: &[&str]) {
        let text: String = groups
            .iter()
            .map(|g| format!("[{g}]\ngroup={g}\nstatus=ACTIVE\n\n"))
            .collect();
        fs::write(self.state_dir.join("groups.ini"), text).expect("Failed to write groups.ini");
    }

    /// Build context for `version` on top of the last version built here.
    pub fn context(&self, version: u32) -> BuildContext {
        let latest = self.state_dir.join("image").join(LATEST_VERSION_FILE);
        let current = read_current_version(&latest)
            .expect("Failed to read latest.version")
            .unwrap_or(0);
        BuildContext::for_testing(&self.state_dir, version)
            .expect("Failed to create build context")
            .with_current_version(current)
    }

    /// Run the full pipeline for `version`.
    pub fn create_update(&self, version: u32) -> UpdateSummary {
        let ctx = self.context(version);
        create_update(&ctx).unwrap_or_else(|e| panic!("create_update {version} failed: {e}"))
    }

    /// Load a published manifest.
    pub fn manifest(&self, version: u32, module: &str) -> Manifest {
        manifest_from_file(&self.output(), version, module)
            .unwrap_or_else(|e| panic!("Failed to load {module} at {version}: {e}"))
    }

    /// Write `path` into the full tree and into the view of `bundle`.
    pub fn add_file(&self, version: u32, bundle: &str, path: &str, content: impl AsRef<[u8]>) {
        for root in [self.image(version).join("full"), self.image(version).join(bundle)] {
            let target = root.join(path.trim_start_matches('/'));
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).expect("Failed to create parent dir");
            }
            fs::write(&target, content.as_ref()).expect("Failed to write image file");
        }
    }

    /// Like [`add_file`](Self::add_file), with an explicit mode.
    pub fn add_file_mode(&self, version: u32, bundle: &str, path: &str, content: impl AsRef<[u8]>, mode: u32) {
        self.add_file(version, bundle, path, content);
        for root in [self.image(version).join("full"), self.image(version).join(bundle)] {
            let target = root.join(path.trim_start_matches('/'));
            fs::set_permissions(&target, fs::Permissions::from_mode(mode)).expect("Failed to set mode");
        }
    }

    pub fn add_symlink(&self, version: u32, bundle: &str, path: &str, target: &str) {
        for root in [self.image(version).join("full"), self.image(version).join(bundle)] {
            let link = root.join(path.trim_start_matches('/'));
            if let Some(parent) = link.parent() {
                fs::create_dir_all(parent).expect("Failed to create parent dir");
            }
            std::os::unix::fs::symlink(target, &link).expect("Failed to create symlink");
        }
    }

    /// Make sure the full tree of `version` exists even when empty.
    pub fn ensure_full(&self, version: u32) {
        fs::create_dir_all(self.image(version).join("full")).expect("Failed to create full tree");
    }

    /// Record the bundles `bundle` includes at `version`.
    pub fn set_includes(&self, version: u32, bundle: &str, includes: &[&str]) {
        let noship = self.image(version).join("noship");
        fs::create_dir_all(&noship).expect("Failed to create noship");
        let mut text = includes.join("\n");
        text.push('\n');
        fs::write(noship.join(format!("{bundle}-includes")), text).expect("Failed to write includes");
    }

    /// Remove `path` from the full tree and every bundle view.
    pub fn remove(&self, version: u32, path: &str) {
        let entries = fs::read_dir(self.image(version)).expect("Failed to read image dir");
        for entry in entries {
            let target = entry.expect("Failed to read image entry").path().join(path.trim_start_matches('/'));
            match fs::symlink_metadata(&target) {
                Ok(meta) if meta.is_dir() => fs::remove_dir_all(&target).expect("Failed to remove dir"),
                Ok(_) => fs::remove_file(&target).expect("Failed to remove file"),
                Err(_) => {}
            }
        }
    }

    /// Copy the whole image of `from` (full tree, bundle views, noship) to `to`.
    pub fn copy_image(&self, from: u32, to: u32) {
        let src = self.image(from);
        let dst = self.image(to);
        for entry in WalkDir::new(&src).sort_by_file_name() {
            let entry = entry.expect("Failed to walk image");
            let relative = entry.path().strip_prefix(&src).expect("Path outside image");
            let target = dst.join(relative);
            let ft = entry.file_type();
            if ft.is_dir() {
                fs::create_dir_all(&target).expect("Failed to create dir");
            } else if ft.is_symlink() {
                let link = fs::read_link(entry.path()).expect("Failed to read symlink");
                std::os::unix::fs::symlink(link, &target).expect("Failed to create symlink");
            } else {
                fs::copy(entry.path(), &target).expect("Failed to copy file");
            }
        }
    }
}

/// Deterministic pseudo-random bytes.
pub fn noise(seed: u64, len: usize) -> Vec<u8> {
    let mut state = seed.wrapping_mul(0x9e37_79b9_7f4a_7c15) | 1;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            (state >> 24) as u8
        })
        .collect()
}

/// Readable text of roughly `len` bytes.
pub fn text(word: &str, len: usize) -> String {
    let mut out = String::new();
    let mut line = 0;
    while out.len() < len {
        out.push_str(&format!("{word} line {line}\n"));
        line += 1;
    }
    out.truncate(len);
    out
}

/// Assert that `manifest` has an entry for `path` and return it.
pub fn entry<'a>(manifest: &'a Manifest, path: &str) -> &'a File {
    manifest
        .get(path)
        .unwrap_or_else(|| panic!("{} {} has no entry {path}", manifest.component, manifest.version))
}

/// Assert that a file exists.
pub fn assert_file_exists(path: &Path) {
    assert!(path.exists(), "Expected file to exist: {}", path.display());
}
