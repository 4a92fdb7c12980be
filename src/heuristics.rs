//! Path-based classification of entries and content probing.

use std::fs;
use std::io::Read;
use std::path::Path;

use crate::config::Config;
use crate::file::{File, FileKind};
use crate::manifest::Manifest;

const CONFIG_PREFIXES: &[&str] = &["/etc/"];

const BOOT_PREFIXES: &[&str] = &["/boot/", "/usr/lib/modules/", "/usr/lib/kernel/"];

/// Trees holding runtime data. The roots themselves are state too.
const STATE_DIRS: &[&str] = &[
    "/var",
    "/run",
    "/tmp",
    "/home",
    "/root",
    "/proc",
    "/sys",
    "/dev",
    "/lost+found",
    "/data",
];

/// Debug sources are runtime data when shipped. A build that bans
/// debuginfo drops what is under them instead.
const DEBUG_SOURCE_DIR: &str = "/usr/src/debug";

const PROBE_BYTES: u64 = 8192;

fn under(path: &str, dir: &str) -> bool {
    path == dir || path.strip_prefix(dir).is_some_and(|rest| rest.starts_with('/'))
}

pub fn is_config(path: &str) -> bool {
    CONFIG_PREFIXES.iter().any(|p| path.starts_with(p))
}

pub fn is_boot(path: &str) -> bool {
    BOOT_PREFIXES.iter().any(|p| path.starts_with(p))
}

pub fn is_state(path: &str) -> bool {
    STATE_DIRS.iter().any(|dir| under(path, dir))
}

/// Set the policy modifiers of one entry from its path.
pub fn set_heuristics(config: &Config, file: &mut File) {
    let path = file.filename.as_str();
    file.modifiers.config = is_config(path);
    file.modifiers.boot = is_boot(path);
    file.modifiers.state = is_state(path) || (!config.ban_debuginfo && under(path, DEBUG_SOURCE_DIR));
}

/// Classify every entry of `manifest`.
pub fn apply_heuristics(config: &Config, manifest: &mut Manifest) {
    for file in &mut manifest.files {
        if file.kind.is_live() {
            set_heuristics(config, file);
        }
    }
}

/// Whether `path` is debuginfo that the configuration bans from manifests.
pub fn file_is_debuginfo(config: &Config, path: &str) -> bool {
    config.ban_debuginfo && config.debuginfo_path(path).is_some()
}

/// Coarse content class of `file` as found in the full tree of `version`.
///
/// Recognized formats report their mime type; anything else is `text`,
/// `data` or `empty`. Unreadable files count as `data`.
pub fn probe_filetype(image_base: &Path, version: u32, file: &File) -> String {
    match file.kind {
        FileKind::Directory => return "directory".to_string(),
        FileKind::Symlink => return "symlink".to_string(),
        _ => {}
    }

    let path = image_base
        .join(version.to_string())
        .join("full")
        .join(file.filename.trim_start_matches('/'));
    let mut head = Vec::new();
    let read = fs::File::open(&path).and_then(|f| f.take(PROBE_BYTES).read_to_end(&mut head));
    if read.is_err() {
        return "data".to_string();
    }
    classify_bytes(&head)
}

fn classify_bytes(head: &[u8]) -> String {
    if head.is_empty() {
        return "empty".to_string();
    }
    if let Some(kind) = infer::get(head) {
        return kind.mime_type().to_owned();
    }
    if std::str::from_utf8(head).is_ok() {
        "text".to_string()
    } else {
        "data".to_string()
    }
}
