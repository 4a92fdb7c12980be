//! Content addressing using SHA-256.
//!
//! A digest covers the content bytes (file data, symlink target, or the
//! directory marker) keyed by the stat subset and the extended attributes
//! that clients restore, so a permission or capability change is a content
//! change. Modification times never enter the digest.
//!
//! Key layout: `mode | uid | gid | rdev | size | xattr_count | xattrs...`,
//! each xattr as `name_len | name | value_len | value` in name order.

use std::collections::BTreeMap;
use std::fmt;
use std::io::Read;
use std::path::Path;
use std::str::FromStr;

use serde::{Serialize, Serializer};
use sha2::{Digest, Sha256};

use crate::error::{Error, IoContext, Result};
use crate::file::{File, FileKind, Stat};

/// Length of a hex-encoded digest in a manifest line.
pub const SWUPD_HASH_LEN: usize = 64;

/// Content hashed for every directory in place of file data.
pub const SWUPD_HASH_DIRNAME: &str = "DIRECTORY";

/// Labels applied by the client's own security policy, never shipped.
const HOST_XATTRS: &[&str] = &["security.selinux"];

/// `EOPNOTSUPP` on Linux.
const XATTRS_UNSUPPORTED: i32 = 95;

/// Extended attributes of one object, by name.
pub type Xattrs = BTreeMap<String, Vec<u8>>;

/// Read the extended attributes of `path` without following symlinks.
///
/// A filesystem without xattr support reads as empty. A non-UTF-8 name is
/// a format error: it could not be archived faithfully.
pub fn read_xattrs(path: &Path) -> Result<Xattrs> {
    let mut xattrs = Xattrs::new();
    if !xattr::SUPPORTED_PLATFORM {
        return Ok(xattrs);
    }
    let names = match xattr::list(path) {
        Ok(names) => names,
        Err(e) if e.raw_os_error() == Some(XATTRS_UNSUPPORTED) => return Ok(xattrs),
        Err(e) => return Err(Error::io(path, e)),
    };
    for name in names {
        let name = name
            .into_string()
            .map_err(|n| Error::format(format!("{}: xattr name {n:?} is not UTF-8", path.display())))?;
        if HOST_XATTRS.contains(&name.as_str()) {
            continue;
        }
        // Removed between list and get.
        if let Some(value) = xattr::get(path, &name).at(path)? {
            xattrs.insert(name, value);
        }
    }
    Ok(xattrs)
}

/// A SHA-256 content digest. All zeros means "no content".
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    /// The sentinel for deleted entries and content that is never shipped.
    pub const ZERO: Self = Self([0; 32]);

    /// Hash arbitrary bytes under a stat key with no xattrs.
    pub fn of_bytes(stat: &Stat, data: &[u8]) -> Self {
        Self::keyed_bytes(stat, &Xattrs::new(), data)
    }

    pub fn keyed_bytes(stat: &Stat, xattrs: &Xattrs, data: &[u8]) -> Self {
        let mut hasher = keyed_hasher(stat, xattrs);
        hasher.update(data);
        Self(hasher.finalize().into())
    }

    /// Hash a regular file with no xattrs by streaming its content.
    pub fn of_file(stat: &Stat, path: &Path) -> Result<Self> {
        Self::keyed_file(stat, &Xattrs::new(), path)
    }

    pub fn keyed_file(stat: &Stat, xattrs: &Xattrs, path: &Path) -> Result<Self> {
        let mut file = std::fs::File::open(path).at(path)?;
        let mut hasher = keyed_hasher(stat, xattrs);
        let mut buffer = [0u8; 64 * 1024];

        loop {
            let read = file.read(&mut buffer).at(path)?;
            if read == 0 {
                break;
            }
            hasher.update(&buffer[..read]);
        }

        Ok(Self(hasher.finalize().into()))
    }

    /// Digest used for every directory with the given stat.
    pub fn directory(stat: &Stat) -> Self {
        Self::of_bytes(stat, SWUPD_HASH_DIRNAME.as_bytes())
    }

    /// Returns true for the "no content" sentinel.
    pub fn is_zeros(&self) -> bool {
        self.0 == [0; 32]
    }

    /// Reset to the "no content" sentinel.
    pub fn set_zeros(&mut self) {
        self.0 = [0; 32];
    }

    /// Full hex form as written to manifests.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

fn keyed_hasher(stat: &Stat, xattrs: &Xattrs) -> Sha256 {
    let mut hasher = Sha256::new();
    for field in [stat.mode, stat.uid, stat.gid, stat.rdev, stat.size] {
        hasher.update(field.to_le_bytes());
    }
    hasher.update((xattrs.len() as u64).to_le_bytes());
    for (name, value) in xattrs {
        hasher.update((name.len() as u64).to_le_bytes());
        hasher.update(name.as_bytes());
        hasher.update((value.len() as u64).to_le_bytes());
        hasher.update(value);
    }
    hasher
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = self.to_hex();
        write!(f, "ContentHash({})", hex.get(..12).unwrap_or(&hex))
    }
}

impl FromStr for ContentHash {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.len() != SWUPD_HASH_LEN {
            return Err(Error::format(format!(
                "hash {s:?} is {} chars, expected {SWUPD_HASH_LEN}",
                s.len()
            )));
        }
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s, &mut bytes)
            .map_err(|e| Error::format(format!("hash {s:?}: {e}")))?;
        Ok(Self(bytes))
    }
}

impl Serialize for ContentHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

/// Exact digest equality; the only test for "content unchanged".
pub fn hash_compare(a: &ContentHash, b: &ContentHash) -> bool {
    a == b
}

/// Compute the digest for `file` from the object at `path`.
///
/// Regular files hash their content, symlinks their target, directories the
/// fixed directory marker, each keyed by the object's xattrs. Deleted,
/// ghosted and manifest-reference entries get the zero sentinel; manifest
/// references are hashed by the caller from the written manifest file.
pub fn compute_hash(file: &mut File, path: &Path) -> Result<()> {
    file.hash = match file.kind {
        FileKind::Regular => ContentHash::keyed_file(&file.stat, &read_xattrs(path)?, path)?,
        FileKind::Symlink => {
            let target = std::fs::read_link(path).at(path)?;
            ContentHash::keyed_bytes(&file.stat, &read_xattrs(path)?, target.as_os_str().as_encoded_bytes())
        }
        FileKind::Directory => {
            ContentHash::keyed_bytes(&file.stat, &read_xattrs(path)?, SWUPD_HASH_DIRNAME.as_bytes())
        }
        FileKind::Deleted | FileKind::Ghosted | FileKind::Manifest => ContentHash::ZERO,
    };
    Ok(())
}

/// Hash a plain file on disk (used for written manifests).
pub fn hash_regular_file(path: &Path) -> Result<ContentHash> {
    let stat = Stat::from_path(path)?;
    ContentHash::of_file(&stat, path)
}
