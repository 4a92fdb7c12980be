//! The `create_update` pipeline: one new version from its image trees.
//!
//! Output for version N is assembled in `<output>/N.work` and renamed to
//! `<output>/N` only once every manifest and fullfile is written. A failed
//! build removes the work directory, so prior versions stay servable and no
//! partial manifest is ever published.

use std::fs;
use std::path::Path;

use serde::Serialize;

use crate::builder::{add_component_hashes_to_manifest, full_manifest_from_directory, sub_manifest_from_directory};
use crate::context::BuildContext;
use crate::delta::{create_manifest_deltas, create_manifest_file_deltas};
use crate::error::{Error, IoContext, Result};
use crate::fullfile::create_fullfiles;
use crate::groups::{read_groups, resolve_includes};
use crate::hash::hash_regular_file;
use crate::heuristics::apply_heuristics;
use crate::manifest::{
    add_deleted_files, changed_includes, manifest_from_file, manifest_subversion, match_manifests,
    maximize_to_full, nest_manifest, recurse_manifest, relink_peers, remove_deprecated_files,
    rename_detection, type_change_detection, write_manifest, Manifest, FULL_NAME, MOM_NAME,
};
use crate::pack::SWUPD_NUM_PACKS;
use crate::state::{
    create_dir_exclusive, ensure_version_image_exists, get_last_versions_list,
    write_cookiecrumbs_to_download_area, write_new_version, LATEST_VERSION_FILE,
};
use crate::stats::{Stats, StatsSnapshot};
use crate::timing::Timer;

/// What one `create_update` run produced.
#[derive(Debug, Clone, Serialize)]
pub struct UpdateSummary {
    pub version: u32,
    pub previous: u32,
    /// Bundles whose manifest was rewritten at this version.
    pub bundles_written: Vec<String>,
    /// Bundles whose previous manifest was carried forward.
    pub bundles_carried: Vec<String>,
    pub fullfiles: usize,
    /// Content deltas available under `<output>/N/delta` after the build.
    pub content_deltas: usize,
    pub manifest_deltas: usize,
    pub stats: StatsSnapshot,
}

/// Build version `ctx.new_version` on top of `ctx.current_version`.
pub fn create_update(ctx: &BuildContext) -> Result<UpdateSummary> {
    let version = ctx.new_version;
    let previous = ctx.current_version;
    if version <= previous {
        return Err(Error::format(format!(
            "new version {version} must be greater than the current version {previous}"
        )));
    }
    ensure_version_image_exists(&ctx.config.image_base, version)?;

    let final_dir = ctx.output_version_dir(version);
    if final_dir.exists() {
        return Err(Error::format(format!("{} already exists", final_dir.display())));
    }

    // Build into `N.work`, then rename it to `N`. Claiming the work
    // directory is the per-version lock: a second build fails here.
    fs::create_dir_all(&ctx.config.output_dir).at(&ctx.config.output_dir)?;
    let work_dir = ctx.config.output_dir.join(format!("{version}.work"));
    create_dir_exclusive(&work_dir)?;

    tracing::info!(version, previous, "creating update");
    let timer = Timer::start("create update");
    let (mut summary, full) = match build_version(ctx, &work_dir) {
        Ok(built) => built,
        Err(e) => {
            let _ = fs::remove_dir_all(&work_dir);
            return Err(e);
        }
    };
    if let Err(e) = fs::rename(&work_dir, &final_dir) {
        let _ = fs::remove_dir_all(&work_dir);
        return Err(Error::io(&final_dir, e));
    }

    write_new_version(&ctx.config.image_base.join(LATEST_VERSION_FILE), version)?;
    write_cookiecrumbs_to_download_area(&ctx.config.output_dir, ctx.format, version)?;

    // Deltas are an optimization: packs fall back to full content.
    let content_deltas = get_last_versions_list(&ctx.config.output_dir, version, SWUPD_NUM_PACKS)
        .and_then(|last_versions| create_manifest_deltas(ctx, &full, &last_versions));
    summary.content_deltas = match content_deltas {
        Ok(count) => count,
        Err(e) => {
            tracing::warn!(version, "content deltas failed: {e}");
            0
        }
    };
    summary.manifest_deltas = match create_manifest_file_deltas(ctx, version, &summary.bundles_written) {
        Ok(count) => count,
        Err(e) => {
            tracing::warn!(version, "manifest deltas failed: {e}");
            0
        }
    };

    summary.stats = ctx.stats.snapshot();
    ctx.stats.print_statistics(previous, version);
    timer.finish();
    Ok(summary)
}

fn previous_manifest(ctx: &BuildContext, version: u32, module: &str) -> Result<Manifest> {
    if version == 0 {
        Ok(Manifest::new(0, module, ctx.format))
    } else {
        manifest_from_file(&ctx.config.output_dir, version, module)
    }
}

/// Write every manifest and fullfile of the new version into `work_dir`.
/// Returns the summary and the new full manifest.
fn build_version(ctx: &BuildContext, work_dir: &Path) -> Result<(UpdateSummary, Manifest)> {
    let version = ctx.new_version;
    let previous = ctx.current_version;

    let mut old_mom = previous_manifest(ctx, previous, MOM_NAME)?;
    if previous != 0 {
        recurse_manifest(&mut old_mom, &ctx.config.output_dir, None)?;
    }

    // The full tree is diffed for its own history; its events are logged
    // but only bundle decisions feed the summary counters.
    let full_stats = Stats::default();
    let mut full = full_manifest_from_directory(ctx, version)?;
    apply_heuristics(&ctx.config, &mut full);
    let mut old_full = previous_manifest(ctx, previous, FULL_NAME)?;
    match_manifests(&mut old_full, &mut full, &full_stats);
    type_change_detection(&mut full, &mut old_full);
    add_deleted_files(&mut old_full, &mut full, ctx.min_version, &full_stats);
    full.prevversion = previous;

    let groups = read_groups(&ctx.groups_file())?;
    let image_dir = ctx.image_dir(version);
    let mut mom = Manifest::new(version, MOM_NAME, ctx.format);
    mom.prevversion = previous;

    let mut bundles_written = Vec::new();
    let mut bundles_carried = Vec::new();
    for group in &groups {
        let mut bundle = sub_manifest_from_directory(ctx, group, version)?;
        add_component_hashes_to_manifest(&mut bundle, &full)?;
        apply_heuristics(&ctx.config, &mut bundle);
        bundle.includes = resolve_includes(&image_dir, group, &groups)?;

        let mut old = match manifest_subversion(&old_mom, group) {
            Some(old_version) => old_mom
                .submanifests
                .iter()
                .find(|m| m.component == *group)
                .cloned()
                .ok_or_else(|| Error::format(format!("MoM {previous} references {group} {old_version} but it was not loaded")))?,
            None => Manifest::new(0, group.as_str(), ctx.format),
        };

        match_manifests(&mut old, &mut bundle, &ctx.stats);
        type_change_detection(&mut bundle, &mut old);
        add_deleted_files(&mut old, &mut bundle, ctx.min_version, &ctx.stats);
        rename_detection(&mut bundle, &old, &ctx.rename, &ctx.stats, |v, f| ctx.probe(v, f));
        remove_deprecated_files(&mut bundle, &full, |file, policy| {
            file.is_deleted() && file.last_change == version && policy.modifiers.state
        });
        relink_peers(&mut old, &mut bundle);

        bundle.prevversion = old.version;
        bundle.update_contentsize();
        let changed = old.version == 0
            || bundle.has_changes()
            || changed_includes(&old, &bundle)
            || old.format != ctx.format;

        if changed {
            let path = write_manifest(&bundle, work_dir)?;
            let hash = hash_regular_file(&path)?;
            tracing::info!(bundle = %group, entries = bundle.files.len(), "bundle manifest written");
            nest_manifest(&mut mom, bundle, hash);
            bundles_written.push(group.clone());
        } else {
            let reference = old_mom
                .manifests
                .iter()
                .find(|m| m.filename == *group)
                .map(|m| m.hash)
                .ok_or_else(|| Error::Invariant(format!("bundle {group} unchanged but unreferenced")))?;
            tracing::debug!(bundle = %group, version = old.version, "bundle unchanged");
            nest_manifest(&mut mom, old, reference);
            bundles_carried.push(group.clone());
        }
    }

    maximize_to_full(&mom, &mut full);
    full.update_contentsize();
    write_manifest(&full, work_dir)?;

    mom.contentsize = mom.submanifests.iter().map(|m| m.contentsize).sum();
    write_manifest(&mom, work_dir)?;

    let fullfiles = create_fullfiles(ctx, &full, &work_dir.join("files"))?;

    let summary = UpdateSummary {
        version,
        previous,
        bundles_written,
        bundles_carried,
        fullfiles,
        content_deltas: 0,
        manifest_deltas: 0,
        stats: StatsSnapshot::default(),
    };
    Ok((summary, full))
}
