//! make-pack and make-packs commands.

use anyhow::{Context, Result};

use swupd_server::config::Config;
use swupd_server::context::BuildContext;
use swupd_server::pack::{make_pack, make_packs, PackData};

/// Build the pack of `bundle` from `from` to `to`.
pub fn cmd_make_pack(config: Config, bundle: &str, from: u32, to: u32) -> Result<()> {
    if from >= to {
        anyhow::bail!("Pack source version {from} must be older than {to}");
    }
    let ctx = BuildContext::new(config, to)
        .context("Failed to set up build")?
        .with_current_version(from);
    let mut pack = PackData::new(bundle, from, to);
    let path = make_pack(&ctx, &mut pack)
        .with_context(|| format!("Failed to make pack {bundle} {from} -> {to}"))?;
    println!(
        "{}: {} full, {} delta",
        path.display(),
        pack.fullcount,
        pack.deltacount
    );
    Ok(())
}

/// Build packs to `osversion` for every bundle changed at that version.
pub fn cmd_make_packs(config: Config, osversion: u32, zero: bool) -> Result<()> {
    let ctx = BuildContext::new(config, osversion).context("Failed to set up build")?;
    let packs = make_packs(&ctx, osversion, zero)
        .with_context(|| format!("Failed to make packs for {osversion}"))?;
    for pack in &packs {
        println!(
            "  {} {} -> {}: {} full, {} delta",
            pack.module, pack.from, pack.to, pack.fullcount, pack.deltacount
        );
    }
    println!("Built {} pack(s)", packs.len());
    ctx.stats.print_statistics(osversion, osversion);
    Ok(())
}
