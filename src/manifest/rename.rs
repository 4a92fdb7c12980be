//! Rename detection between deletions and additions of one build.
//!
//! Candidate pairs are scored on filename, directory, content class and size
//! similarity, then accepted greedily from the highest score down. The
//! matching is reproducible, not optimal: ties fall back to filename order.

use crate::file::{File, FileKind, RenameHints};
use crate::manifest::Manifest;
use crate::stats::Stats;

/// Weights and limits for rename scoring.
#[derive(Debug, Clone, PartialEq)]
pub struct RenameParams {
    pub name_weight: f64,
    pub dir_weight: f64,
    pub type_weight: f64,
    pub size_weight: f64,
    /// Minimum score for a pair to be linked.
    pub threshold: f64,
    /// Largest accepted size difference, relative to the larger file.
    pub size_tolerance: f64,
}

impl Default for RenameParams {
    fn default() -> Self {
        Self {
            name_weight: 0.45,
            dir_weight: 0.10,
            type_weight: 0.20,
            size_weight: 0.25,
            threshold: 0.70,
            size_tolerance: 0.5,
        }
    }
}

/// One scored (deleted, added) pair, as indices into the new manifest.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RenameCandidate {
    pub from: usize,
    pub to: usize,
    pub score: f64,
}

fn levenshtein(a: &str, b: &str) -> usize {
    let b: Vec<char> = b.chars().collect();
    let mut row: Vec<usize> = (0..=b.len()).collect();
    for (i, ca) in a.chars().enumerate() {
        let mut diag = row[0];
        row[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let above = row[j + 1];
            row[j + 1] = if ca == *cb {
                diag
            } else {
                1 + diag.min(above).min(row[j])
            };
            diag = above;
        }
    }
    row[b.len()]
}

fn name_similarity(a: &str, b: &str) -> f64 {
    let longest = a.chars().count().max(b.chars().count());
    if longest == 0 {
        return 1.0;
    }
    1.0 - levenshtein(a, b) as f64 / longest as f64
}

fn size_similarity(a: u64, b: u64) -> f64 {
    let larger = a.max(b);
    if larger == 0 {
        return 1.0;
    }
    1.0 - a.abs_diff(b) as f64 / larger as f64
}

/// Similarity of `source` (the pre-deletion entry) and `dest`, in `[0, 1]`.
pub fn rename_score(source: &File, source_hints: &RenameHints, dest: &File, dest_hints: &RenameHints, params: &RenameParams) -> f64 {
    if !source.hash.is_zeros() && source.hash == dest.hash {
        return 1.0;
    }
    let name = name_similarity(&source_hints.alpha_only_filename, &dest_hints.alpha_only_filename);
    let dir = f64::from(u8::from(source_hints.dirname == dest_hints.dirname));
    let filetype = f64::from(u8::from(source_hints.filetype == dest_hints.filetype));
    let size = size_similarity(source.stat.size, dest.stat.size);

    params.name_weight * name + params.dir_weight * dir + params.type_weight * filetype + params.size_weight * size
}

fn size_within_tolerance(a: u64, b: u64, tolerance: f64) -> bool {
    a.abs_diff(b) as f64 <= tolerance * a.max(b) as f64
}

/// Greedily accept candidates above the threshold, each endpoint at most once.
///
/// Candidates are ordered by descending score, then by source and
/// destination index, which is filename order in a sorted manifest.
pub fn link_renames(mut candidates: Vec<RenameCandidate>, threshold: f64) -> Vec<RenameCandidate> {
    candidates.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then(a.from.cmp(&b.from))
            .then(a.to.cmp(&b.to))
    });

    let mut used_from = std::collections::BTreeSet::new();
    let mut used_to = std::collections::BTreeSet::new();
    let mut accepted = Vec::new();
    for candidate in candidates {
        if candidate.score < threshold {
            break;
        }
        if used_from.contains(&candidate.from) || used_to.contains(&candidate.to) {
            continue;
        }
        used_from.insert(candidate.from);
        used_to.insert(candidate.to);
        accepted.push(candidate);
    }
    accepted
}

/// Commit a rename from deleted entry `from` to added entry `to`.
///
/// A boot file that moved is ghosted so the client leaves the old copy for
/// the bootloader tooling to clean up.
pub fn final_link(manifest: &mut Manifest, from: usize, to: usize, score: f64) {
    let source = &mut manifest.files[from];
    source.rename_peer = Some(to);
    source.rename_score = score;
    if source.modifiers.boot {
        source.kind = FileKind::Ghosted;
    }

    let dest = &mut manifest.files[to];
    dest.rename_peer = Some(from);
    dest.rename_score = score;
    dest.modifiers.rename = true;
}

/// Detect renames in `manifest` (the new version) against `old`.
///
/// Sources are deletions recorded at this version whose peer in `old` is a
/// live entry; destinations are new entries without a peer. `probe` returns
/// the content class of an entry found in the manifest of the given
/// version. Returns the number of renames linked.
pub fn rename_detection<F>(manifest: &mut Manifest, old: &Manifest, params: &RenameParams, stats: &Stats, mut probe: F) -> usize
where
    F: FnMut(u32, &File) -> String,
{
    let version = manifest.version;

    let mut sources = Vec::new();
    let mut dests = Vec::new();
    for (idx, file) in manifest.files.iter().enumerate() {
        if file.modifiers.state || file.modifiers.config {
            continue;
        }
        if file.kind == FileKind::Deleted && file.last_change == version {
            if let Some(peer) = file.peer {
                let before = &old.files[peer];
                if matches!(before.kind, FileKind::Regular | FileKind::Symlink) {
                    sources.push((idx, peer));
                }
            }
        } else if matches!(file.kind, FileKind::Regular | FileKind::Symlink) && file.peer.is_none() {
            dests.push(idx);
        }
    }
    if sources.is_empty() || dests.is_empty() {
        return 0;
    }

    let source_hints: Vec<RenameHints> = sources
        .iter()
        .map(|&(_, peer)| {
            let before = &old.files[peer];
            RenameHints::new(&before.filename, probe(old.version, before))
        })
        .collect();
    for &idx in &dests {
        let filetype = probe(version, &manifest.files[idx]);
        let hints = RenameHints::new(&manifest.files[idx].filename, filetype);
        manifest.files[idx].hints = Some(hints);
    }

    let mut candidates = Vec::new();
    for (&(from, peer), hints) in sources.iter().zip(&source_hints) {
        let before = &old.files[peer];
        for &to in &dests {
            let dest = &manifest.files[to];
            let Some(dest_hints) = dest.hints.as_ref() else { continue };
            if before.kind != dest.kind
                || !size_within_tolerance(before.stat.size, dest.stat.size, params.size_tolerance)
            {
                continue;
            }
            let score = rename_score(before, hints, dest, dest_hints, params);
            candidates.push(RenameCandidate { from, to, score });
        }
    }

    let accepted = link_renames(candidates, params.threshold);
    for candidate in &accepted {
        final_link(manifest, candidate.from, candidate.to, candidate.score);
        let dest = &manifest.files[candidate.to];
        stats.account_renamed_file(dest, version);
        tracing::debug!(
            from = %manifest.files[candidate.from].filename,
            to = %dest.filename,
            score = candidate.score,
            "rename linked"
        );
    }
    for file in &mut manifest.files {
        file.hints = None;
    }
    accepted.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::Stat;
    use crate::hash::ContentHash;
    use crate::manifest::{add_deleted_files, match_manifests, FORMAT_CURRENT};

    fn regular(name: &str, content: &[u8], size: u64) -> File {
        let mut f = File::new(name, FileKind::Regular);
        f.stat = Stat { mode: 0o100644, size, ..Stat::default() };
        f.hash = ContentHash::of_bytes(&f.stat, content);
        f
    }

    fn detect(old_files: Vec<File>, new_files: Vec<File>) -> (Manifest, Manifest, usize) {
        let stats = Stats::default();
        let mut old = Manifest::new(10, "os-core", FORMAT_CURRENT);
        old.files = old_files;
        for f in &mut old.files {
            f.last_change = 10;
        }
        let mut new = Manifest::new(11, "os-core", FORMAT_CURRENT);
        new.files = new_files;
        match_manifests(&mut old, &mut new, &stats);
        add_deleted_files(&mut old, &mut new, 0, &stats);
        let n = rename_detection(&mut new, &old, &RenameParams::default(), &stats, |_, _| "application/x-sharedlib".to_string());
        (old, new, n)
    }

    #[test]
    fn test_levenshtein() {
        assert_eq!(levenshtein("", "abc"), 3);
        assert_eq!(levenshtein("kitten", "sitting"), 3);
        assert_eq!(levenshtein("modso", "libmodso"), 3);
        assert_eq!(levenshtein("same", "same"), 0);
    }

    #[test]
    fn test_identical_content_is_a_rename() {
        let (_, new, n) = detect(
            vec![regular("/bin/foo", b"binary", 6)],
            vec![regular("/bin/foo2", b"binary", 6)],
        );
        assert_eq!(n, 1);
        let dest = new.get("/bin/foo2").unwrap();
        assert!(dest.modifiers.rename);
        assert_eq!(dest.rename_score, 1.0);
        let source = dest.rename_peer.unwrap();
        assert_eq!(new.files[source].filename, "/bin/foo");
        assert_eq!(new.files[source].rename_peer, new.find("/bin/foo2"));
    }

    #[test]
    fn test_similar_names_combine_signals() {
        let (_, new, n) = detect(
            vec![regular("/lib/mod.so", b"old module", 2048)],
            vec![regular("/lib/libmod.so", b"new module", 2150)],
        );
        assert_eq!(n, 1);
        let score = new.get("/lib/libmod.so").unwrap().rename_score;
        assert!(score > 0.8 && score < 0.83, "score {score}");
    }

    #[test]
    fn test_size_outside_tolerance_is_not_a_candidate() {
        let (_, new, n) = detect(
            vec![regular("/lib/mod.so", b"old", 2048)],
            vec![regular("/lib/mod.so.1", b"new", 100_000)],
        );
        assert_eq!(n, 0);
        assert!(!new.get("/lib/mod.so.1").unwrap().modifiers.rename);
    }

    #[test]
    fn test_each_endpoint_used_once() {
        let (_, new, n) = detect(
            vec![regular("/usr/lib/libfoo-1.so", b"a", 1000), regular("/usr/lib/libfoo-2.so", b"b", 1000)],
            vec![
                regular("/usr/lib/libfoo-3.so", b"c", 1000),
                regular("/usr/lib/libfoo-4.so", b"d", 1000),
                regular("/usr/lib/libfoo-5.so", b"e", 1000),
            ],
        );
        assert_eq!(n, 2);

        let mut seen = std::collections::BTreeSet::new();
        for file in &new.files {
            if let Some(peer) = file.rename_peer {
                assert!(seen.insert(peer), "{peer} used twice");
                assert_eq!(new.files[peer].rename_peer, new.find(&file.filename));
            }
        }
        // Greedy ties resolve in filename order; optimal assignment is not promised.
        assert!(new.get("/usr/lib/libfoo-3.so").unwrap().modifiers.rename);
        assert!(new.get("/usr/lib/libfoo-4.so").unwrap().modifiers.rename);
        assert!(!new.get("/usr/lib/libfoo-5.so").unwrap().modifiers.rename);
    }

    #[test]
    fn test_boot_source_is_ghosted() {
        let mut vmlinuz = regular("/usr/lib/kernel/vmlinuz-1", b"kernel", 4096);
        vmlinuz.modifiers.boot = true;
        let (_, new, n) = detect(vec![vmlinuz], vec![regular("/usr/lib/kernel/vmlinuz-1", b"k", 1)]);
        // Same path: a change, not a rename.
        assert_eq!(n, 0);
        assert_eq!(new.files.len(), 1);

        let mut vmlinuz = regular("/usr/lib/kernel/vmlinuz-1", b"kernel", 4096);
        vmlinuz.modifiers.boot = true;
        let mut next = regular("/usr/lib/kernel/vmlinuz-2", b"kernel2", 4100);
        next.modifiers.boot = true;
        let (_, new, n) = detect(vec![vmlinuz], vec![next]);
        assert_eq!(n, 1);
        assert_eq!(new.get("/usr/lib/kernel/vmlinuz-1").unwrap().kind, FileKind::Ghosted);
    }

    #[test]
    fn test_link_renames_is_deterministic() {
        let candidates = vec![
            RenameCandidate { from: 1, to: 5, score: 0.9 },
            RenameCandidate { from: 0, to: 5, score: 0.9 },
            RenameCandidate { from: 0, to: 6, score: 0.75 },
            RenameCandidate { from: 2, to: 7, score: 0.5 },
        ];
        let accepted = link_renames(candidates, 0.7);
        assert_eq!(accepted.len(), 1);
        assert_eq!((accepted[0].from, accepted[0].to), (0, 5));
    }
}
