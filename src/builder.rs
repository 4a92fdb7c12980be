//! Manifests from image trees.
//!
//! `image/<version>/full` is hashed once; bundle views under
//! `image/<version>/<bundle>` only record which paths they own and take
//! hashes and stat data from the full manifest, so a path hashes the same
//! whichever bundle observes it.

use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::config::Config;
use crate::context::BuildContext;
use crate::error::{Error, Result};
use crate::file::File;
use crate::hash::compute_hash;
use crate::heuristics::file_is_debuginfo;
use crate::manifest::{check_filename, Manifest, FULL_NAME};
use crate::timing::Timer;

/// Walk `root` in filename order, returning entries with stat populated and
/// no hash, each paired with its location on disk.
fn walk_tree(config: &Config, root: &Path) -> Result<Vec<(File, PathBuf)>> {
    if !root.is_dir() {
        return Err(Error::format(format!("image tree {} does not exist", root.display())));
    }

    let mut entries = Vec::new();
    let mut walker = WalkDir::new(root)
        .min_depth(1)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter();

    while let Some(entry) = walker.next() {
        let entry = entry.map_err(|e| {
            let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| root.to_path_buf());
            match e.into_io_error() {
                Some(io) => Error::io(path, io),
                None => Error::format(format!("filesystem loop at {}", path.display())),
            }
        })?;

        let relative = entry
            .path()
            .strip_prefix(root)
            .map_err(|_| Error::Invariant(format!("{} escaped {}", entry.path().display(), root.display())))?;
        // A name the manifest cannot carry would publish a version no later
        // build can read back, so the build stops before writing anything.
        let relative = relative.to_str().ok_or_else(|| {
            Error::format(format!("{} is not a UTF-8 path", entry.path().display()))
        })?;
        let filename = format!("/{relative}");
        check_filename(&filename)?;

        if file_is_debuginfo(config, &filename) {
            if entry.file_type().is_dir() {
                walker.skip_current_dir();
            }
            continue;
        }

        let meta = entry.metadata().map_err(|e| {
            let io = e
                .into_io_error()
                .unwrap_or_else(|| std::io::Error::other("metadata unavailable"));
            Error::io(entry.path(), io)
        })?;
        let file = File::from_metadata(filename, &meta)?;
        entries.push((file, entry.into_path()));
    }
    Ok(entries)
}

/// Build the full-tree manifest for `version`, hashing every entry on the
/// worker pool.
pub fn full_manifest_from_directory(ctx: &BuildContext, version: u32) -> Result<Manifest> {
    let timer = Timer::start("hash full tree");
    let root = ctx.full_dir(version);
    let entries = walk_tree(&ctx.config, &root)?;

    let files = ctx.pool.try_map(entries, |(mut file, path)| {
        compute_hash(&mut file, &path)?;
        Ok(file)
    })?;

    let mut manifest = Manifest::new(version, FULL_NAME, ctx.format);
    manifest.files = files;
    manifest.sort_by_filename();
    manifest.validate()?;
    manifest.update_contentsize();
    tracing::info!(version, entries = manifest.files.len(), "full manifest built");
    timer.finish();
    Ok(manifest)
}

/// Build the manifest of bundle `component` at `version` from its view
/// `image/<version>/<component>`. Hashes are filled in afterwards by
/// [`add_component_hashes_to_manifest`].
pub fn sub_manifest_from_directory(ctx: &BuildContext, component: &str, version: u32) -> Result<Manifest> {
    let root = ctx.image_dir(version).join(component);
    let entries = walk_tree(&ctx.config, &root)?;

    let mut manifest = Manifest::new(version, component, ctx.format);
    manifest.files = entries.into_iter().map(|(file, _)| file).collect();
    manifest.sort_by_filename();
    manifest.validate()?;
    tracing::debug!(component, version, entries = manifest.files.len(), "bundle view walked");
    Ok(manifest)
}

/// Copy hash, type and stat of every bundle entry from the full manifest.
///
/// A bundle path that is missing from the full tree is a format error: the
/// bundle would reference content that is never published.
pub fn add_component_hashes_to_manifest(compm: &mut Manifest, fullm: &Manifest) -> Result<()> {
    for file in &mut compm.files {
        let Some(full) = fullm.get(&file.filename) else {
            return Err(Error::format(format!(
                "bundle {} contains {} which is not in the full tree",
                compm.component, file.filename
            )));
        };
        file.hash = full.hash;
        file.kind = full.kind;
        file.stat = full.stat;
        file.modifiers = full.modifiers;
    }
    Ok(())
}
