//! Show command - displays information.

use anyhow::{Context, Result};

use swupd_server::config::Config;
use swupd_server::manifest::format::manifest_to_string;
use swupd_server::manifest::manifest_from_file;

/// Show target for the show command.
pub enum ShowTarget {
    /// Show configuration
    Config { json: bool },
    /// Show a published manifest
    Manifest {
        bundle: String,
        version: u32,
        json: bool,
    },
}

/// Execute the show command.
pub fn cmd_show(target: ShowTarget, config: &Config) -> Result<()> {
    match target {
        ShowTarget::Config { json: true } => {
            println!("{}", serde_json::to_string_pretty(config)?);
        }
        ShowTarget::Config { json: false } => config.print(),
        ShowTarget::Manifest {
            bundle,
            version,
            json,
        } => {
            let manifest = manifest_from_file(&config.output_dir, version, &bundle)
                .with_context(|| format!("Failed to load {bundle} at {version}"))?;
            if json {
                println!("{}", serde_json::to_string_pretty(&manifest)?);
            } else {
                print!("{}", manifest_to_string(&manifest)?);
            }
        }
    }
    Ok(())
}
