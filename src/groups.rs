//! Bundle list and bundle include graph.
//!
//! `groups.ini` in the state directory names one bundle per section:
//!
//! ```ini
//! [os-core]
//! group=os-core
//! status=ACTIVE
//! ```
//!
//! `image/<version>/noship/<bundle>-includes` lists the bundles a bundle
//! pulls in, one per line.

use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::Path;

use crate::error::{Error, IoContext, Result};

/// Bundle names in `groups.ini`, in file order without duplicates.
pub fn read_groups(path: &Path) -> Result<Vec<String>> {
    let text = fs::read_to_string(path).at(path)?;
    let mut groups: Vec<String> = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        let Some(name) = line.strip_prefix('[').and_then(|rest| rest.strip_suffix(']')) else {
            continue;
        };
        let name = name.trim();
        if name.is_empty() || name.contains('/') {
            return Err(Error::format(format!("{}: bad bundle name {line:?}", path.display())));
        }
        if !groups.iter().any(|g| g == name) {
            groups.push(name.to_string());
        }
    }
    if groups.is_empty() {
        return Err(Error::format(format!("{}: no bundles defined", path.display())));
    }
    Ok(groups)
}

/// Bundles directly included by `bundle` in the image at `image_dir`.
pub fn read_includes(image_dir: &Path, bundle: &str) -> Result<Vec<String>> {
    let path = image_dir.join("noship").join(format!("{bundle}-includes"));
    let text = match fs::read_to_string(&path) {
        Ok(text) => text,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(Error::io(&path, e)),
    };
    Ok(text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(str::to_string)
        .collect())
}

/// Transitive includes of `bundle`, sorted, excluding the bundle itself.
///
/// An include naming a bundle that is not in `known` would leave a dangling
/// reference in the manifest and is a format error.
pub fn resolve_includes(image_dir: &Path, bundle: &str, known: &[String]) -> Result<Vec<String>> {
    let mut seen = BTreeSet::new();
    let mut stack = vec![bundle.to_string()];
    while let Some(current) = stack.pop() {
        for include in read_includes(image_dir, &current)? {
            if !known.iter().any(|k| *k == include) {
                return Err(Error::format(format!(
                    "bundle {current} includes unknown bundle {include}"
                )));
            }
            if include != bundle && seen.insert(include.clone()) {
                stack.push(include);
            }
        }
    }
    Ok(seen.into_iter().collect())
}
