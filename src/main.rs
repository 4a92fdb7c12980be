//! swupd-server - update content builder.
//!
//! Produces, per OS version:
//! - Manifests (MoM, full, one per bundle)
//! - Staged full files (`files/<hash>.tar`)
//! - Binary deltas and per-bundle packs for recent versions

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use swupd_server::config::Config;

#[derive(Parser)]
#[command(name = "swupd-server")]
#[command(about = "Build manifests, full files, deltas and packs for OS updates")]
#[command(
    after_help = "QUICK START:\n  swupd-server show config                Check paths\n  swupd-server create-update --osversion 10\n  swupd-server make-packs --osversion 10  Packs from recent versions"
)]
struct Cli {
    /// State directory (default: $SWUPD_STATE_DIR or /var/lib/update)
    #[arg(long, global = true)]
    statedir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build manifests and full files for a new version
    CreateUpdate {
        /// Version to build
        #[arg(long)]
        osversion: u32,
        /// Manifest format to write (default: current)
        #[arg(long)]
        format: Option<u32>,
        /// Drop deletion records older than this version
        #[arg(long)]
        minversion: Option<u32>,
    },

    /// (Re)stage full files for an already built version
    MakeFullfiles {
        #[arg(long)]
        osversion: u32,
    },

    /// Build one pack for a bundle between two versions
    MakePack {
        bundle: String,
        from: u32,
        to: u32,
    },

    /// Build packs for every bundle changed at a version
    MakePacks {
        #[arg(long)]
        osversion: u32,
        /// Also build packs from version 0
        #[arg(long)]
        zero: bool,
    },

    /// List entries added and removed between two bundle manifests
    Diff {
        bundle: String,
        v1: u32,
        v2: u32,
    },

    /// Show information
    Show {
        #[command(subcommand)]
        what: ShowTarget,
    },
}

#[derive(Subcommand)]
enum ShowTarget {
    /// Show current configuration
    Config {
        #[arg(long)]
        json: bool,
    },
    /// Show a published manifest
    Manifest {
        /// Bundle name, `MoM` or `full`
        bundle: String,
        version: u32,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load .env if present
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let config = Config::load_with_state_dir(cli.statedir.as_deref());

    match cli.command {
        Commands::CreateUpdate {
            osversion,
            format,
            minversion,
        } => {
            commands::cmd_create_update(config, osversion, format, minversion)?;
        }

        Commands::MakeFullfiles { osversion } => {
            commands::cmd_make_fullfiles(config, osversion)?;
        }

        Commands::MakePack { bundle, from, to } => {
            commands::cmd_make_pack(config, &bundle, from, to)?;
        }

        Commands::MakePacks { osversion, zero } => {
            commands::cmd_make_packs(config, osversion, zero)?;
        }

        Commands::Diff { bundle, v1, v2 } => {
            commands::cmd_diff(&config, &bundle, v1, v2)?;
        }

        Commands::Show { what } => {
            let show_target = match what {
                ShowTarget::Config { json } => commands::show::ShowTarget::Config { json },
                ShowTarget::Manifest {
                    bundle,
                    version,
                    json,
                } => commands::show::ShowTarget::Manifest {
                    bundle,
                    version,
                    json,
                },
            };
            commands::cmd_show(show_target, &config)?;
        }
    }

    Ok(())
}
