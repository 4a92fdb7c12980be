//! One filesystem entry as recorded in a manifest.
//!
//! The exclusive type class is a [`FileKind`]; the independent modifiers
//! live in [`Modifiers`]. Relations to other entries (`peer`, `rename_peer`)
//! are plain indices and never own anything.

use std::cmp::Ordering;
use std::fs::Metadata;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

use serde::Serialize;

use crate::error::{Error, IoContext, Result};
use crate::hash::ContentHash;

/// Exclusive type of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum FileKind {
    Directory,
    Regular,
    Symlink,
    Deleted,
    /// Treated as deleted for diffing, but the client leaves it in place.
    Ghosted,
    /// Reference to a bundle manifest (MoM entries only).
    Manifest,
}

impl FileKind {
    /// Build the kind from individual type flags, rejecting anything but
    /// exactly one set flag.
    pub fn from_flags(
        is_dir: bool,
        is_file: bool,
        is_link: bool,
        is_deleted: bool,
        is_ghosted: bool,
        is_manifest: bool,
    ) -> Result<Self> {
        let flags = [
            (is_dir, Self::Directory),
            (is_file, Self::Regular),
            (is_link, Self::Symlink),
            (is_deleted, Self::Deleted),
            (is_ghosted, Self::Ghosted),
            (is_manifest, Self::Manifest),
        ];
        let mut set = flags.iter().filter(|(on, _)| *on).map(|(_, kind)| *kind);
        match (set.next(), set.next()) {
            (Some(kind), None) => Ok(kind),
            (None, _) => Err(Error::Invariant("entry has no type flag".to_string())),
            (Some(first), Some(second)) => Err(Error::Invariant(format!(
                "entry has conflicting type flags {first:?} and {second:?}"
            ))),
        }
    }

    /// Deleted or ghosted.
    pub fn is_deleted(self) -> bool {
        matches!(self, Self::Deleted | Self::Ghosted)
    }

    /// Directory, regular file or symlink: something with content to ship.
    pub fn is_live(self) -> bool {
        matches!(self, Self::Directory | Self::Regular | Self::Symlink)
    }
}

/// Independent modifier flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
pub struct Modifiers {
    /// User-editable; preserved on update.
    pub config: bool,
    /// Runtime data; never shipped.
    pub state: bool,
    /// Lives in the boot partition.
    pub boot: bool,
    /// Destination of a detected rename.
    pub rename: bool,
}

impl Modifiers {
    /// Policy flags that make an otherwise identical entry "changed".
    pub fn policy_eq(&self, other: &Self) -> bool {
        self.config == other.config && self.state == other.state && self.boot == other.boot
    }
}

/// POSIX stat subset that is part of the digest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
pub struct Stat {
    pub mode: u64,
    pub uid: u64,
    pub gid: u64,
    pub rdev: u64,
    pub size: u64,
}

impl Stat {
    /// Stat subset from `lstat` metadata. Directory sizes are filesystem
    /// dependent, so they are recorded as zero.
    pub fn from_metadata(meta: &Metadata) -> Self {
        Self {
            mode: u64::from(meta.mode()),
            uid: u64::from(meta.uid()),
            gid: u64::from(meta.gid()),
            rdev: meta.rdev(),
            size: if meta.is_dir() { 0 } else { meta.size() },
        }
    }

    /// `lstat` the path.
    pub fn from_path(path: &Path) -> Result<Self> {
        let meta = std::fs::symlink_metadata(path).at(path)?;
        Ok(Self::from_metadata(&meta))
    }
}

/// Scratch data for rename scoring. Recomputed on demand, never persisted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RenameHints {
    /// Basename with everything but ASCII letters stripped.
    pub alpha_only_filename: String,
    /// Detected content class (mime type or a coarse fallback).
    pub filetype: String,
    pub basename: String,
    pub dirname: String,
}

impl RenameHints {
    /// Derive hints from a filename and a detected content class.
    pub fn new(filename: &str, filetype: impl Into<String>) -> Self {
        let (dirname, basename) = match filename.rfind('/') {
            Some(idx) => (&filename[..idx], &filename[idx + 1..]),
            None => ("", filename),
        };
        Self {
            alpha_only_filename: basename.chars().filter(char::is_ascii_alphabetic).collect(),
            filetype: filetype.into(),
            basename: basename.to_string(),
            dirname: dirname.to_string(),
        }
    }
}

/// A manifest entry.
#[derive(Debug, Clone, Serialize)]
pub struct File {
    /// Absolute path within the tree (or bundle name for manifest references).
    pub filename: String,
    pub hash: ContentHash,
    pub kind: FileKind,
    pub modifiers: Modifiers,
    pub stat: Stat,
    /// Version that last modified this entry.
    pub last_change: u32,

    /// Index of the same path in the manifest this one was matched against.
    #[serde(skip)]
    pub peer: Option<usize>,
    /// Index of the other end of a rename, within the same manifest.
    #[serde(skip)]
    pub rename_peer: Option<usize>,
    #[serde(skip)]
    pub rename_score: f64,
    #[serde(skip)]
    pub hints: Option<RenameHints>,
}

impl File {
    /// New entry with zero hash and empty stat.
    pub fn new(filename: impl Into<String>, kind: FileKind) -> Self {
        Self {
            filename: filename.into(),
            hash: ContentHash::ZERO,
            kind,
            modifiers: Modifiers::default(),
            stat: Stat::default(),
            last_change: 0,
            peer: None,
            rename_peer: None,
            rename_score: 0.0,
            hints: None,
        }
    }

    /// Entry for a filesystem object, typed and stat'ed from its metadata.
    pub fn from_metadata(filename: impl Into<String>, meta: &Metadata) -> Result<Self> {
        let filename = filename.into();
        let ft = meta.file_type();
        let kind = FileKind::from_flags(ft.is_dir(), ft.is_file(), ft.is_symlink(), false, false, false)
            .map_err(|_| Error::format(format!("{filename}: unsupported file type")))?;
        let mut file = Self::new(filename, kind);
        file.stat = Stat::from_metadata(meta);
        Ok(file)
    }

    /// Deletion record for `self` at `version`.
    pub fn deleted_copy(&self, version: u32) -> Self {
        let mut file = Self::new(self.filename.clone(), FileKind::Deleted);
        file.modifiers = Modifiers {
            rename: false,
            ..self.modifiers
        };
        file.last_change = version;
        file
    }

    pub fn is_deleted(&self) -> bool {
        self.kind.is_deleted()
    }

    /// Clear every field that is never persisted.
    pub fn clear_scratch(&mut self) {
        self.peer = None;
        self.rename_peer = None;
        self.rename_score = 0.0;
        self.hints = None;
    }
}

/// Total order by filename, then version, then hash.
pub fn file_sort_filename(a: &File, b: &File) -> Ordering {
    a.filename
        .cmp(&b.filename)
        .then(a.last_change.cmp(&b.last_change))
        .then(a.hash.cmp(&b.hash))
}

/// Total order by hash, then filename.
pub fn file_sort_hash(a: &File, b: &File) -> Ordering {
    a.hash.cmp(&b.hash).then_with(|| a.filename.cmp(&b.filename))
}

/// Total order by last change, then filename.
pub fn file_sort_version(a: &File, b: &File) -> Ordering {
    a.last_change
        .cmp(&b.last_change)
        .then_with(|| a.filename.cmp(&b.filename))
}
