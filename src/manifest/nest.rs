//! MoM composition: bundle references, nested loading and flattening.

use std::path::Path;

use crate::error::Result;
use crate::file::{file_sort_filename, File, FileKind};
use crate::hash::ContentHash;
use crate::manifest::{manifest_from_file, Manifest};

/// Register a single bundle reference, replacing any reference of the same
/// name. References stay sorted by filename.
pub fn nest_manifest_file(parent: &mut Manifest, file: File) {
    match parent
        .manifests
        .binary_search_by(|m| m.filename.as_str().cmp(&file.filename))
    {
        Ok(idx) => parent.manifests[idx] = file,
        Err(idx) => parent.manifests.insert(idx, file),
    }
}

/// Nest bundle manifest `sub` under `parent`, referenced by `hash` (the
/// digest of its serialized form).
pub fn nest_manifest(parent: &mut Manifest, sub: Manifest, hash: ContentHash) {
    let mut reference = File::new(sub.component.clone(), FileKind::Manifest);
    reference.hash = hash;
    reference.last_change = sub.version;
    nest_manifest_file(parent, reference);

    match parent
        .submanifests
        .binary_search_by(|m| m.component.cmp(&sub.component))
    {
        Ok(idx) => parent.submanifests[idx] = sub,
        Err(idx) => parent.submanifests.insert(idx, sub),
    }
}

/// Version of bundle `group` as referenced by `parent`.
pub fn manifest_subversion(parent: &Manifest, group: &str) -> Option<u32> {
    parent
        .manifests
        .iter()
        .find(|m| m.filename == group)
        .map(|m| m.last_change)
}

/// Load the bundle manifests referenced by `mom` into its `submanifests`,
/// in filename order. With `component` set, only that bundle is loaded.
pub fn recurse_manifest(mom: &mut Manifest, output_dir: &Path, component: Option<&str>) -> Result<()> {
    let mut loaded = Vec::new();
    for reference in &mom.manifests {
        if component.is_some_and(|c| c != reference.filename) {
            continue;
        }
        let sub = manifest_from_file(output_dir, reference.last_change, &reference.filename)?;
        tracing::trace!(bundle = %sub.component, version = sub.version, "loaded bundle manifest");
        loaded.push(sub);
    }
    mom.submanifests = loaded;
    Ok(())
}

/// Flatten the nested bundle manifests into one view.
///
/// A path owned by several bundles appears once: a live entry wins over a
/// deletion, then the most recent change wins.
pub fn consolidate_submanifests(mom: &Manifest) -> Manifest {
    let mut merged = Manifest::new(mom.version, mom.component.clone(), mom.format);
    merged.prevversion = mom.prevversion;
    merged.files = mom
        .submanifests
        .iter()
        .flat_map(|sub| sub.files.iter().cloned())
        .collect();
    merged.files.sort_by(|a, b| {
        file_sort_filename(a, b)
            .then(a.kind.is_live().cmp(&b.kind.is_live()))
    });

    let mut files: Vec<File> = Vec::with_capacity(merged.files.len());
    for mut file in merged.files.drain(..) {
        file.clear_scratch();
        match files.last_mut() {
            Some(prev) if prev.filename == file.filename => {
                let better = (file.kind.is_live(), file.last_change) >= (prev.kind.is_live(), prev.last_change);
                if better {
                    *prev = file;
                }
            }
            _ => files.push(file),
        }
    }
    merged.files = files;
    merged.update_contentsize();
    merged
}

/// Raise `last_change` of full-tree entries to the newest version any
/// bundle records for the same path. A path that moved into a bundle at
/// this version is new for that bundle even though the tree already had it.
/// Returns the number of entries raised.
pub fn maximize_to_full(mom: &Manifest, full: &mut Manifest) -> usize {
    let merged = consolidate_submanifests(mom);
    let mut raised = 0;
    for file in &mut full.files {
        if let Some(bundle_file) = merged.get(&file.filename) {
            if bundle_file.kind == file.kind && bundle_file.last_change > file.last_change {
                file.last_change = bundle_file.last_change;
                raised += 1;
            }
        }
    }
    raised
}
