//! create-update and make-fullfiles commands.

use anyhow::{Context, Result};

use swupd_server::config::Config;
use swupd_server::context::BuildContext;
use swupd_server::fullfile::create_fullfiles;
use swupd_server::manifest::{manifest_from_file, FULL_NAME};
use swupd_server::update::create_update;

/// Build version `osversion` from its image trees.
pub fn cmd_create_update(
    config: Config,
    osversion: u32,
    format: Option<u32>,
    minversion: Option<u32>,
) -> Result<()> {
    let mut ctx = BuildContext::new(config, osversion).context("Failed to set up build")?;
    if let Some(format) = format {
        ctx = ctx.with_format(format);
    }
    if let Some(minversion) = minversion {
        ctx = ctx.with_min_version(minversion);
    }

    let summary = create_update(&ctx)
        .with_context(|| format!("Failed to create update {osversion}"))?;

    println!(
        "Version {} (from {}): {} bundle manifest(s) written, {} carried, {} full file(s), {} content delta(s), {} manifest delta(s)",
        summary.version,
        summary.previous,
        summary.bundles_written.len(),
        summary.bundles_carried.len(),
        summary.fullfiles,
        summary.content_deltas,
        summary.manifest_deltas,
    );
    Ok(())
}

/// Restage full files for an already published version.
pub fn cmd_make_fullfiles(config: Config, osversion: u32) -> Result<()> {
    let ctx = BuildContext::new(config, osversion).context("Failed to set up build")?;
    let full = manifest_from_file(&ctx.config.output_dir, osversion, FULL_NAME)
        .with_context(|| format!("Failed to load full manifest {osversion}"))?;
    let files_dir = ctx.output_version_dir(osversion).join("files");
    let count = create_fullfiles(&ctx, &full, &files_dir).context("Failed to stage full files")?;
    println!("Staged {count} full file(s) in {}", files_dir.display());
    Ok(())
}
