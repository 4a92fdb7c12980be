//! Diff command - entries added and removed between two bundle manifests.

use anyhow::{Context, Result};

use swupd_server::config::Config;
use swupd_server::manifest::{manifest_from_file, subtract_manifests_frontend, Manifest};

fn print_entries(label: &str, manifest: &Manifest) {
    for file in manifest.files.iter().chain(manifest.manifests.iter()) {
        println!("{label} {}", file.filename);
    }
}

/// Print entries of `bundle` present only at `v1` (`-`) or only at `v2` (`+`).
pub fn cmd_diff(config: &Config, bundle: &str, v1: u32, v2: u32) -> Result<()> {
    let old = manifest_from_file(&config.output_dir, v1, bundle)
        .with_context(|| format!("Failed to load {bundle} at {v1}"))?;
    let new = manifest_from_file(&config.output_dir, v2, bundle)
        .with_context(|| format!("Failed to load {bundle} at {v2}"))?;

    let removed = subtract_manifests_frontend(&old, &new);
    let added = subtract_manifests_frontend(&new, &old);
    print_entries("-", &removed);
    print_entries("+", &added);
    println!(
        "{bundle} {v1} -> {v2}: {} removed, {} added",
        removed.files.len() + removed.manifests.len(),
        added.files.len() + added.manifests.len()
    );
    Ok(())
}
