//! Version bookkeeping in the state directory.
//!
//! Output for a version is owned by exactly one build: files are opened with
//! [`fopen_exclusive`] and directories with [`create_dir_exclusive`], and
//! both fail rather than overwrite.

use std::fs::{self, OpenOptions};
use std::io;
use std::path::Path;

use crate::error::{Error, IoContext, Result};
use crate::manifest::{manifest_path, MOM_NAME};

/// Name of the file in the image base recording the last built version.
pub const LATEST_VERSION_FILE: &str = "latest.version";

/// Open `path` for writing, failing if it already exists.
pub fn fopen_exclusive(path: &Path) -> Result<fs::File> {
    OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .at(path)
}

/// Create the directory `path`, failing if it already exists.
pub fn create_dir_exclusive(path: &Path) -> Result<()> {
    fs::create_dir(path).at(path)
}

/// Read a version number from a file, or `None` when it does not exist.
pub fn read_current_version(path: &Path) -> Result<Option<u32>> {
    match fs::read_to_string(path) {
        Ok(text) => text
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| Error::format(format!("{}: not a version number", path.display()))),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(Error::io(path, e)),
    }
}

/// Record `version` in `path`, replacing the previous value.
pub fn write_new_version(path: &Path, version: u32) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).at(parent)?;
    }
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, format!("{version}\n")).at(&tmp)?;
    fs::rename(&tmp, path).at(path)
}

/// Publish `version` as the latest for its format under the download area.
pub fn write_cookiecrumbs_to_download_area(output_dir: &Path, format: u32, version: u32) -> Result<()> {
    let path = output_dir
        .join("version")
        .join(format!("format{format}"))
        .join("latest");
    write_new_version(&path, version)
}

/// Fail unless the image tree for `version` exists.
pub fn ensure_version_image_exists(image_base: &Path, version: u32) -> Result<()> {
    let full = image_base.join(version.to_string()).join("full");
    if full.is_dir() {
        Ok(())
    } else {
        Err(Error::format(format!(
            "image for version {version} not found at {}",
            full.display()
        )))
    }
}

/// Up to `max_versions` published versions below `next_version`, newest first.
///
/// A version counts as published once its MoM exists in the output directory.
pub fn get_last_versions_list(output_dir: &Path, next_version: u32, max_versions: usize) -> Result<Vec<u32>> {
    let entries = match fs::read_dir(output_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(Error::io(output_dir, e)),
    };

    let mut versions = Vec::new();
    for entry in entries {
        let entry = entry.at(output_dir)?;
        let Some(version) = entry
            .file_name()
            .to_str()
            .and_then(|name| name.parse::<u32>().ok())
        else {
            continue;
        };
        if version > 0
            && version < next_version
            && manifest_path(output_dir, version, MOM_NAME).is_file()
        {
            versions.push(version);
        }
    }

    versions.sort_unstable_by(|a, b| b.cmp(a));
    versions.truncate(max_versions);
    Ok(versions)
}
