//! Versioned manifests: ordered inventories of [`File`] entries.
//!
//! A manifest describes one bundle at one version, or the whole system when
//! it is the manifest-of-manifests (MoM), whose `manifests` entries reference
//! bundle manifests.
//!
//! # Submodules
//!
//! - `format`: textual serialization (`write_manifest`, `manifest_from_file`)
//! - `diff`: matching, pruning, include tracking, type changes
//! - `rename`: rename detection between deletions and additions
//! - `nest`: MoM nesting, traversal and consolidation

pub mod diff;
pub mod format;
pub mod nest;
pub mod rename;

use std::collections::BTreeSet;

use serde::Serialize;

use crate::error::{Error, Result};
use crate::file::{file_sort_filename, file_sort_version, File};
use crate::hash::ContentHash;

pub use diff::{
    add_deleted_files, changed_includes, classify_new, classify_old, manifest_includes,
    match_manifests, prune_manifest, relink_peers, remove_deprecated_files,
    subtract_manifests_frontend, type_change_detection, Change,
};
pub use format::{check_filename, manifest_from_file, manifest_path, write_manifest, FORMAT_CURRENT};
pub use nest::{
    consolidate_submanifests, maximize_to_full, manifest_subversion, nest_manifest,
    nest_manifest_file, recurse_manifest,
};
pub use rename::{final_link, link_renames, rename_detection, RenameParams};

/// Component name of the manifest-of-manifests.
pub const MOM_NAME: &str = "MoM";

/// Component name of the full-tree manifest.
pub const FULL_NAME: &str = "full";

/// An ordered, versioned inventory for one bundle or for the whole system.
#[derive(Debug, Clone, Serialize)]
pub struct Manifest {
    /// Manifest format revision.
    pub format: u32,
    pub version: u32,
    pub prevversion: u32,
    /// Bundle name, `MoM` or `full`.
    pub component: String,
    /// Sum of sizes of shipped entries.
    pub contentsize: u64,
    /// Entries, kept sorted by filename outside of in-progress edits.
    pub files: Vec<File>,
    /// Bundle manifest references (MoM only).
    pub manifests: Vec<File>,
    /// Nested bundle manifests owned by this one once loaded.
    #[serde(skip)]
    pub submanifests: Vec<Manifest>,
    /// Transitive set of bundles this bundle pulls in.
    pub includes: Vec<String>,
    /// Post-update actions.
    pub actions: Vec<String>,
}

impl Manifest {
    /// Allocate an empty manifest.
    pub fn new(version: u32, component: impl Into<String>, format: u32) -> Self {
        Self {
            format,
            version,
            prevversion: 0,
            component: component.into(),
            contentsize: 0,
            files: Vec::new(),
            manifests: Vec::new(),
            submanifests: Vec::new(),
            includes: Vec::new(),
            actions: Vec::new(),
        }
    }

    /// Number of entries written to the manifest.
    pub fn count(&self) -> usize {
        self.files.len() + self.manifests.len()
    }

    /// Recompute `contentsize` from live, shippable entries.
    pub fn update_contentsize(&mut self) {
        self.contentsize = self
            .files
            .iter()
            .filter(|f| f.kind.is_live() && !f.modifiers.state)
            .map(|f| f.stat.size)
            .sum();
    }

    /// Sort entries by filename. Indices held in `peer`/`rename_peer` are
    /// cleared since they would no longer be valid.
    pub fn sort_by_filename(&mut self) {
        self.files.sort_by(file_sort_filename);
        self.manifests.sort_by(file_sort_filename);
        for file in &mut self.files {
            file.peer = None;
            file.rename_peer = None;
        }
    }

    /// Sort entries by last change, then filename.
    pub fn sort_by_version(&mut self) {
        self.files.sort_by(file_sort_version);
        for file in &mut self.files {
            file.peer = None;
            file.rename_peer = None;
        }
    }

    /// Index of `filename`, assuming the manifest is sorted by filename.
    pub fn find(&self, filename: &str) -> Option<usize> {
        self.files
            .binary_search_by(|f| f.filename.as_str().cmp(filename))
            .ok()
    }

    /// Look up an entry by filename.
    pub fn get(&self, filename: &str) -> Option<&File> {
        self.find(filename).map(|idx| &self.files[idx])
    }

    /// Check ordering and filename uniqueness.
    pub fn validate(&self) -> Result<()> {
        for list in [&self.files, &self.manifests] {
            for pair in list.windows(2) {
                if pair[0].filename == pair[1].filename {
                    return Err(Error::Invariant(format!(
                        "duplicate filename {} in manifest {} version {}",
                        pair[0].filename, self.component, self.version
                    )));
                }
                if pair[0].filename > pair[1].filename {
                    return Err(Error::Invariant(format!(
                        "manifest {} is not sorted at {}",
                        self.component, pair[1].filename
                    )));
                }
            }
        }
        Ok(())
    }

    /// Keep only entries matching `keep`, returning how many were removed.
    ///
    /// `rename_peer` indices are remapped; a rename whose partner was removed
    /// is dropped. `peer` indices are cleared and must be relinked by the
    /// caller.
    pub fn retain_files(&mut self, mut keep: impl FnMut(&File) -> bool) -> usize {
        let keep: Vec<bool> = self.files.iter().map(|f| keep(f)).collect();
        let mut remap = vec![None; self.files.len()];
        let mut next = 0;
        for (old, kept) in keep.iter().enumerate() {
            if *kept {
                remap[old] = Some(next);
                next += 1;
            }
        }

        let before = self.files.len();
        let mut idx = 0;
        self.files.retain(|_| {
            let kept = keep[idx];
            idx += 1;
            kept
        });

        for file in &mut self.files {
            file.peer = None;
            file.rename_peer = file.rename_peer.and_then(|p| remap[p]);
            if file.rename_peer.is_none() {
                file.rename_score = 0.0;
            }
        }
        before - self.files.len()
    }

    /// Hashes of content a client holding this manifest already has.
    pub fn content_hashes(&self) -> BTreeSet<ContentHash> {
        self.files
            .iter()
            .filter(|f| f.kind.is_live() && !f.modifiers.state && !f.hash.is_zeros())
            .map(|f| f.hash)
            .collect()
    }

    /// True when any entry was touched at this manifest's version.
    pub fn has_changes(&self) -> bool {
        self.files.iter().any(|f| f.last_change == self.version)
    }
}
