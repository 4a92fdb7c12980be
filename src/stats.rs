//! Accounting of classification decisions.
//!
//! Every decision is reported through [`log_event`] at the point it is made;
//! the counters are only a summary for the end of a build.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::file::File;

/// Counters for one build invocation.
#[derive(Debug, Default)]
pub struct Stats {
    new_files: AtomicU64,
    deleted_files: AtomicU64,
    changed_files: AtomicU64,
    renamed_files: AtomicU64,
    delta_hits: AtomicU64,
    delta_misses: AtomicU64,
}

/// Point-in-time copy of [`Stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub new_files: u64,
    pub deleted_files: u64,
    pub changed_files: u64,
    pub renamed_files: u64,
    pub delta_hits: u64,
    pub delta_misses: u64,
}

/// Report one accounted event for `file` at `version`.
pub fn log_event(file: &File, version: u32, msg: &str) {
    tracing::debug!(target: "swupd::account", file = %file.filename, version, "{msg}");
}

impl Stats {
    pub fn account_new_file(&self, file: &File, version: u32) {
        self.new_files.fetch_add(1, Ordering::Relaxed);
        log_event(file, version, "new file");
    }

    pub fn account_deleted_file(&self, file: &File, version: u32) {
        self.deleted_files.fetch_add(1, Ordering::Relaxed);
        log_event(file, version, "deleted file");
    }

    pub fn account_changed_file(&self, file: &File, version: u32) {
        self.changed_files.fetch_add(1, Ordering::Relaxed);
        log_event(file, version, "changed file");
    }

    pub fn account_renamed_file(&self, file: &File, version: u32) {
        self.renamed_files.fetch_add(1, Ordering::Relaxed);
        log_event(file, version, "rename");
    }

    pub fn account_delta_hit(&self, file: &File, version: u32) {
        self.delta_hits.fetch_add(1, Ordering::Relaxed);
        log_event(file, version, "delta hit");
    }

    pub fn account_delta_miss(&self, file: &File, version: u32) {
        self.delta_misses.fetch_add(1, Ordering::Relaxed);
        log_event(file, version, "delta miss");
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            new_files: self.new_files.load(Ordering::Relaxed),
            deleted_files: self.deleted_files.load(Ordering::Relaxed),
            changed_files: self.changed_files.load(Ordering::Relaxed),
            renamed_files: self.renamed_files.load(Ordering::Relaxed),
            delta_hits: self.delta_hits.load(Ordering::Relaxed),
            delta_misses: self.delta_misses.load(Ordering::Relaxed),
        }
    }

    /// Log a summary of the transition from `version1` to `version2`.
    pub fn print_statistics(&self, version1: u32, version2: u32) {
        let s = self.snapshot();
        tracing::info!(
            from = version1,
            to = version2,
            new = s.new_files,
            deleted = s.deleted_files,
            changed = s.changed_files,
            renamed = s.renamed_files,
            delta_hits = s.delta_hits,
            delta_misses = s.delta_misses,
            "update statistics"
        );
    }
}
