//! Build-side engine for OS software updates.
//!
//! Turns successive snapshots of an OS image tree into versioned manifests,
//! staged full files, binary deltas and per-bundle packs.
//!
//! The library is what the `swupd-server` binary drives and what the
//! integration tests in `tests/` exercise.

pub mod builder;
pub mod config;
pub mod context;
pub mod delta;
pub mod error;
pub mod file;
pub mod fullfile;
pub mod groups;
pub mod hash;
pub mod heuristics;
pub mod manifest;
pub mod pack;
pub mod pool;
pub mod process;
pub mod state;
pub mod stats;
pub mod timing;
pub mod update;

pub use error::{Error, Result};
