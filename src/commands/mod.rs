//! CLI command handlers.
//!
//! Each submodule handles a specific CLI command:
//! - `update` - Build a version, restage full files
//! - `pack` - Build packs
//! - `diff` - Compare two bundle manifests
//! - `show` - Display information

mod diff;
mod pack;
pub mod show;
mod update;

pub use diff::cmd_diff;
pub use pack::{cmd_make_pack, cmd_make_packs};
pub use show::cmd_show;
pub use update::{cmd_create_update, cmd_make_fullfiles};
