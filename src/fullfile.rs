//! Full-content staging: one `files/<hash>.tar` per changed content item.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::context::BuildContext;
use crate::error::{Error, IoContext, Result};
use crate::hash::{read_xattrs, ContentHash};
use crate::manifest::Manifest;
use crate::state::fopen_exclusive;
use crate::timing::Timer;

/// PAX record prefix for extended attributes, as GNU tar writes them.
const PAX_XATTR_PREFIX: &str = "SCHILY.xattr.";

/// Append the object at `src` under `name`, archiving symlinks and
/// directories as themselves. Extended attributes travel as PAX records
/// ahead of the entry, so the unpacked object hashes as it did here.
pub(crate) fn append_entry<W: std::io::Write>(archive: &mut tar::Builder<W>, archive_path: &Path, src: &Path, name: &str) -> Result<()> {
    let archive_error = |source| Error::Archive {
        path: archive_path.to_path_buf(),
        source,
    };
    let xattrs = read_xattrs(src)?;
    if !xattrs.is_empty() {
        let records: Vec<(String, &[u8])> = xattrs
            .iter()
            .map(|(name, value)| (format!("{PAX_XATTR_PREFIX}{name}"), value.as_slice()))
            .collect();
        archive
            .append_pax_extensions(records.iter().map(|(key, value)| (key.as_str(), *value)))
            .map_err(archive_error)?;
    }
    archive.append_path_with_name(src, name).map_err(archive_error)
}

/// Write `<dir>/<hash>.tar` holding the object at `src` as entry `<hash>`.
///
/// The archive is assembled under a temporary name so a failed write never
/// leaves a truncated fullfile behind.
pub fn write_fullfile(dir: &Path, hash: &ContentHash, src: &Path) -> Result<PathBuf> {
    let out = dir.join(format!("{hash}.tar"));
    let tmp = dir.join(format!(".{hash}.tar.tmp"));
    let result = (|| {
        let file = fopen_exclusive(&tmp)?;
        let mut archive = tar::Builder::new(file);
        archive.follow_symlinks(false);
        append_entry(&mut archive, &out, src, &hash.to_hex())?;
        archive
            .into_inner()
            .map_err(|source| Error::Archive { path: out.clone(), source })?;
        fs::rename(&tmp, &out).at(&out)
    })();
    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result.map(|()| out)
}

/// Stage fullfiles for every shippable entry of `manifest` changed at its
/// version, into `files_dir`. Hashes already staged are skipped. Returns
/// the number of archives written.
pub fn create_fullfiles(ctx: &BuildContext, manifest: &Manifest, files_dir: &Path) -> Result<usize> {
    let timer = Timer::start("stage fullfiles");
    fs::create_dir_all(files_dir).at(files_dir)?;

    let mut wanted: BTreeMap<ContentHash, PathBuf> = BTreeMap::new();
    for file in &manifest.files {
        if file.last_change != manifest.version
            || !file.kind.is_live()
            || file.modifiers.state
            || file.hash.is_zeros()
        {
            continue;
        }
        wanted
            .entry(file.hash)
            .or_insert_with(|| ctx.image_path(manifest.version, &file.filename));
    }
    wanted.retain(|hash, _| !files_dir.join(format!("{hash}.tar")).exists());

    let dir = files_dir.to_path_buf();
    let items: Vec<(ContentHash, PathBuf)> = wanted.into_iter().collect();
    let written = ctx
        .pool
        .try_map(items, move |(hash, src)| write_fullfile(&dir, &hash, &src))?;

    tracing::info!(version = manifest.version, count = written.len(), "fullfiles staged");
    timer.finish();
    Ok(written.len())
}
