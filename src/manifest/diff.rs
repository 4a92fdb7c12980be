//! Matching and differencing between two manifests.
//!
//! `m1` is always the older manifest and `m2` the newer one. Both are kept
//! sorted by filename, so pairing is a single merge pass after sorting.

use std::cmp::Ordering;
use std::collections::BTreeSet;

use crate::file::File;
use crate::manifest::Manifest;
use crate::stats::{log_event, Stats};

/// How an entry moved between two versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Change {
    Unchanged,
    Changed,
    New,
    Deleted,
    RenameSource,
    RenameDest,
}

/// Two live entries of different kinds are never peers once type changes
/// have been detected.
fn peers_compatible(a: &File, b: &File) -> bool {
    !(a.kind.is_live() && b.kind.is_live() && a.kind != b.kind)
}

/// Pair entries by filename, returning the number of unmatched entries on
/// both sides. Both manifests must already be sorted.
fn link_peers(m1: &mut Manifest, m2: &mut Manifest, respect_type: bool) -> usize {
    for file in m1.files.iter_mut().chain(m2.files.iter_mut()) {
        file.peer = None;
    }

    let (mut i, mut j) = (0, 0);
    let mut unmatched = 0;
    while i < m1.files.len() && j < m2.files.len() {
        match m1.files[i].filename.cmp(&m2.files[j].filename) {
            Ordering::Less => {
                unmatched += 1;
                i += 1;
            }
            Ordering::Greater => {
                unmatched += 1;
                j += 1;
            }
            Ordering::Equal => {
                if !respect_type || peers_compatible(&m1.files[i], &m2.files[j]) {
                    m1.files[i].peer = Some(j);
                    m2.files[j].peer = Some(i);
                } else {
                    unmatched += 2;
                }
                i += 1;
                j += 1;
            }
        }
    }
    unmatched + (m1.files.len() - i) + (m2.files.len() - j)
}

/// Re-establish `peer` links after entries were added, removed or re-sorted.
pub fn relink_peers(m1: &mut Manifest, m2: &mut Manifest) -> usize {
    link_peers(m1, m2, true)
}

/// Pair `m2` (freshly built) against `m1` and assign `last_change`.
///
/// Identical entries (same hash, kind and policy flags) inherit the old
/// `last_change`; everything else is stamped with `m2.version`. Returns the
/// number of unmatched entries across both manifests.
pub fn match_manifests(m1: &mut Manifest, m2: &mut Manifest, stats: &Stats) -> usize {
    m1.sort_by_filename();
    m2.sort_by_filename();
    let unmatched = link_peers(m1, m2, false);
    let version = m2.version;

    for file in &mut m2.files {
        match file.peer {
            Some(i) => {
                let old = &m1.files[i];
                if old.is_deleted() {
                    file.last_change = version;
                    stats.account_new_file(file, version);
                } else if old.hash == file.hash
                    && old.kind == file.kind
                    && old.modifiers.policy_eq(&file.modifiers)
                {
                    file.last_change = old.last_change;
                } else {
                    file.last_change = version;
                    stats.account_changed_file(file, version);
                }
            }
            None => {
                file.last_change = version;
                stats.account_new_file(file, version);
            }
        }
    }
    unmatched
}

/// Record unmatched entries of `m1` as deletions in `m2`.
///
/// Live entries become deletions stamped with `m2.version`. Entries that
/// were already deleted are carried forward with their original version
/// until it drops below `min_version`. Returns the number of new deletions.
pub fn add_deleted_files(m1: &mut Manifest, m2: &mut Manifest, min_version: u32, stats: &Stats) -> usize {
    let version = m2.version;
    let mut added = Vec::new();
    let mut deleted = 0;

    for old in &m1.files {
        if old.peer.is_some() || m2.find(&old.filename).is_some() {
            continue;
        }
        if old.is_deleted() {
            if old.last_change >= min_version {
                let mut carried = old.clone();
                carried.clear_scratch();
                carried.modifiers.rename = false;
                added.push(carried);
            }
        } else {
            let record = old.deleted_copy(version);
            stats.account_deleted_file(&record, version);
            added.push(record);
            deleted += 1;
        }
    }

    if !added.is_empty() {
        m2.files.extend(added);
        m2.sort_by_filename();
    }
    relink_peers(m1, m2);
    deleted
}

/// Break matches whose live type changed (file, directory, symlink).
///
/// Such a pair is a delete of the old entry plus an add of the new one; it
/// is never shipped as an in-place delta. Returns the number of pairs broken.
pub fn type_change_detection(manifest: &mut Manifest, old: &mut Manifest) -> usize {
    let version = manifest.version;
    let mut changed = 0;
    for file in &mut manifest.files {
        let Some(i) = file.peer else { continue };
        let before = &mut old.files[i];
        if before.kind.is_live() && file.kind.is_live() && before.kind != file.kind {
            log_event(file, version, &format!("type change {:?} -> {:?}", before.kind, file.kind));
            before.peer = None;
            file.peer = None;
            file.last_change = version;
            changed += 1;
        }
    }
    changed
}

/// Remove entries that are identical to their matched peer in `old`.
///
/// What remains is exactly what a client at `old` lacks. Rename endpoints
/// are always kept. Peers are relinked afterwards; returns the count pruned.
pub fn prune_manifest(manifest: &mut Manifest, old: &mut Manifest) -> usize {
    let redundant: Vec<bool> = manifest
        .files
        .iter()
        .map(|file| match file.peer {
            Some(i) => {
                let before = &old.files[i];
                file.kind.is_live()
                    && file.kind == before.kind
                    && file.hash == before.hash
                    && file.modifiers.policy_eq(&before.modifiers)
                    && file.rename_peer.is_none()
            }
            None => false,
        })
        .collect();

    let mut idx = 0;
    let pruned = manifest.retain_files(|_| {
        let keep = !redundant[idx];
        idx += 1;
        keep
    });
    relink_peers(old, manifest);
    pruned
}

/// Remove entries from `m1` for which `compfunc` holds against the entry of
/// the same name in `m2`. Returns the number removed.
///
/// `m2` must be sorted. `peer` links of `m1` are cleared.
pub fn remove_deprecated_files<F>(m1: &mut Manifest, m2: &Manifest, mut compfunc: F) -> usize
where
    F: FnMut(&File, &File) -> bool,
{
    let version = m1.version;
    m1.retain_files(|file| match m2.get(&file.filename) {
        Some(other) if compfunc(file, other) => {
            log_event(file, version, "deprecated");
            false
        }
        _ => true,
    })
}

/// Entries of `m1` whose filename is absent from `m2`.
pub fn subtract_manifests_frontend(m1: &Manifest, m2: &Manifest) -> Manifest {
    let names: BTreeSet<&str> = m2
        .files
        .iter()
        .chain(m2.manifests.iter())
        .map(|f| f.filename.as_str())
        .collect();

    let mut result = Manifest::new(m1.version, m1.component.clone(), m1.format);
    result.prevversion = m2.version;
    for (src, dst) in [(&m1.files, &mut result.files), (&m1.manifests, &mut result.manifests)] {
        dst.extend(
            src.iter()
                .filter(|f| !names.contains(f.filename.as_str()))
                .map(|f| {
                    let mut f = f.clone();
                    f.clear_scratch();
                    f
                }),
        );
    }
    result
}

/// Whether `manifest` pulls in bundle `component`.
pub fn manifest_includes(manifest: &Manifest, component: &str) -> bool {
    manifest.includes.iter().any(|inc| inc == component)
}

/// Whether the set of included bundles differs between two versions.
pub fn changed_includes(old: &Manifest, new: &Manifest) -> bool {
    let a: BTreeSet<&str> = old.includes.iter().map(String::as_str).collect();
    let b: BTreeSet<&str> = new.includes.iter().map(String::as_str).collect();
    a != b
}

/// Classify entry `idx` of the newer manifest.
pub fn classify_new(m1: &Manifest, m2: &Manifest, idx: usize) -> Change {
    let file = &m2.files[idx];
    if file.is_deleted() {
        return if file.rename_peer.is_some() {
            Change::RenameSource
        } else if file.last_change == m2.version {
            Change::Deleted
        } else {
            Change::Unchanged
        };
    }
    if file.rename_peer.is_some() {
        return Change::RenameDest;
    }
    match file.peer {
        Some(i) if !m1.files[i].is_deleted() => {
            if file.last_change == m2.version {
                Change::Changed
            } else {
                Change::Unchanged
            }
        }
        _ => Change::New,
    }
}

/// Classify entry `idx` of the older manifest.
pub fn classify_old(m1: &Manifest, m2: &Manifest, idx: usize) -> Change {
    let file = &m1.files[idx];
    if file.is_deleted() {
        return Change::Unchanged;
    }
    match file.peer {
        None => Change::Deleted,
        Some(j) => {
            let new = &m2.files[j];
            if new.is_deleted() {
                if new.rename_peer.is_some() {
                    Change::RenameSource
                } else {
                    Change::Deleted
                }
            } else if new.last_change == m2.version {
                Change::Changed
            } else {
                Change::Unchanged
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::{FileKind, Stat};
    use crate::hash::ContentHash;
    use crate::manifest::FORMAT_CURRENT;

    fn entry(name: &str, kind: FileKind, content: &[u8]) -> File {
        let mut f = File::new(name, kind);
        f.hash = ContentHash::of_bytes(&Stat::default(), content);
        f
    }

    fn old_manifest() -> Manifest {
        let mut m = Manifest::new(10, "os-core", FORMAT_CURRENT);
        for (name, content) in [("/a", "a"), ("/b", "b"), ("/c", "c")] {
            let mut f = entry(name, FileKind::Regular, content.as_bytes());
            f.last_change = 10;
            m.files.push(f);
        }
        m
    }

    #[test]
    fn test_match_assigns_versions() {
        let stats = Stats::default();
        let mut m1 = old_manifest();
        let mut m2 = Manifest::new(20, "os-core", FORMAT_CURRENT);
        m2.files.push(entry("/b", FileKind::Regular, b"b"));
        m2.files.push(entry("/a", FileKind::Regular, b"a2"));
        m2.files.push(entry("/d", FileKind::Regular, b"d"));

        let unmatched = match_manifests(&mut m1, &mut m2, &stats);
        assert_eq!(unmatched, 2); // /c gone, /d new
        assert_eq!(m2.get("/a").unwrap().last_change, 20);
        assert_eq!(m2.get("/b").unwrap().last_change, 10);
        assert_eq!(m2.get("/d").unwrap().last_change, 20);

        let s = stats.snapshot();
        assert_eq!(s.changed_files, 1);
        assert_eq!(s.new_files, 1);
    }

    #[test]
    fn test_flag_change_is_a_change() {
        let stats = Stats::default();
        let mut m1 = old_manifest();
        let mut m2 = Manifest::new(20, "os-core", FORMAT_CURRENT);
        let mut b = entry("/b", FileKind::Regular, b"b");
        b.modifiers.config = true;
        m2.files.push(b);
        match_manifests(&mut m1, &mut m2, &stats);
        assert_eq!(m2.files[0].last_change, 20);
    }

    #[test]
    fn test_deleted_files_added_and_carried() {
        let stats = Stats::default();
        let mut m1 = old_manifest();
        let mut gone = File::new("/old-gone", FileKind::Deleted);
        gone.last_change = 5;
        let mut ancient = File::new("/ancient", FileKind::Deleted);
        ancient.last_change = 1;
        m1.files.push(gone);
        m1.files.push(ancient);

        let mut m2 = Manifest::new(20, "os-core", FORMAT_CURRENT);
        m2.files.push(entry("/a", FileKind::Regular, b"a"));
        match_manifests(&mut m1, &mut m2, &stats);
        let added = add_deleted_files(&mut m1, &mut m2, 3, &stats);

        assert_eq!(added, 2); // /b and /c
        assert!(m2.get("/b").unwrap().is_deleted());
        assert_eq!(m2.get("/b").unwrap().last_change, 20);
        assert_eq!(m2.get("/old-gone").unwrap().last_change, 5);
        assert!(m2.get("/ancient").is_none());
        m2.validate().unwrap();

        // Every old entry now points at its counterpart.
        let b = m1.find("/b").unwrap();
        assert_eq!(classify_old(&m1, &m2, b), Change::Deleted);
    }

    #[test]
    fn test_type_change_breaks_pair() {
        let stats = Stats::default();
        let mut m1 = old_manifest();
        let mut m2 = Manifest::new(20, "os-core", FORMAT_CURRENT);
        m2.files.push(entry("/a", FileKind::Regular, b"a"));
        m2.files.push(entry("/b", FileKind::Symlink, b"b"));
        m2.files.push(entry("/c", FileKind::Regular, b"c"));
        match_manifests(&mut m1, &mut m2, &stats);

        assert_eq!(type_change_detection(&mut m2, &mut m1), 1);
        let b_new = m2.find("/b").unwrap();
        let b_old = m1.find("/b").unwrap();
        assert_eq!(classify_new(&m1, &m2, b_new), Change::New);
        assert_eq!(classify_old(&m1, &m2, b_old), Change::Deleted);

        // No duplicate deletion record is added for the type-changed path.
        add_deleted_files(&mut m1, &mut m2, 0, &stats);
        m2.validate().unwrap();
        assert_eq!(m2.files.len(), 3);
        let b_old = m1.find("/b").unwrap();
        assert!(m1.files[b_old].peer.is_none());
    }

    #[test]
    fn test_prune_keeps_only_differences() {
        let stats = Stats::default();
        let mut m1 = old_manifest();
        let mut m2 = Manifest::new(20, "os-core", FORMAT_CURRENT);
        m2.files.push(entry("/a", FileKind::Regular, b"a"));
        m2.files.push(entry("/b", FileKind::Regular, b"b-changed"));
        m2.files.push(entry("/e", FileKind::Regular, b"e"));
        match_manifests(&mut m1, &mut m2, &stats);
        add_deleted_files(&mut m1, &mut m2, 0, &stats);

        let pruned = prune_manifest(&mut m2, &mut m1);
        assert_eq!(pruned, 1);
        let names: Vec<&str> = m2.files.iter().map(|f| f.filename.as_str()).collect();
        assert_eq!(names, vec!["/b", "/c", "/e"]);
        assert_eq!(m2.get("/b").unwrap().peer, m1.find("/b"));
    }

    #[test]
    fn test_remove_deprecated_files() {
        let mut m1 = old_manifest();
        let mut policy = Manifest::new(10, "full", FORMAT_CURRENT);
        let mut c = entry("/c", FileKind::Regular, b"c");
        c.modifiers.state = true;
        policy.files.push(c);
        policy.files.push(entry("/a", FileKind::Regular, b"a"));
        policy.sort_by_filename();

        let removed = remove_deprecated_files(&mut m1, &policy, |_, other| other.modifiers.state);
        assert_eq!(removed, 1);
        assert!(m1.get("/c").is_none());
        assert!(m1.get("/a").is_some());
    }

    #[test]
    fn test_subtract() {
        let m1 = old_manifest();
        let mut m2 = Manifest::new(20, "os-core", FORMAT_CURRENT);
        m2.files.push(entry("/b", FileKind::Regular, b"other"));
        let diff = subtract_manifests_frontend(&m1, &m2);
        let names: Vec<&str> = diff.files.iter().map(|f| f.filename.as_str()).collect();
        assert_eq!(names, vec!["/a", "/c"]);
    }

    #[test]
    fn test_changed_includes() {
        let mut old = Manifest::new(10, "editors", FORMAT_CURRENT);
        old.includes = vec!["os-core".to_string()];
        let mut new = Manifest::new(20, "editors", FORMAT_CURRENT);
        new.includes = vec!["os-core".to_string()];
        assert!(!changed_includes(&old, &new));

        new.includes.push("python".to_string());
        assert!(changed_includes(&old, &new));
        assert!(manifest_includes(&new, "python"));
        assert!(!manifest_includes(&old, "python"));
    }
}
