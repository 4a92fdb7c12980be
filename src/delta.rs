//! Binary deltas for changed file content and for manifests.
//!
//! Content deltas for a new version are generated eagerly by
//! [`create_manifest_deltas`]; packs reuse them and fill in the rest.
//!
//! A delta is kept only when it is smaller than the content it replaces and
//! reproduces that content exactly when applied. Every other outcome is a
//! miss and the caller ships full content.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use fast_rsync::{Signature, SignatureOptions};

use crate::context::BuildContext;
use crate::error::{Error, IoContext, Result};
use crate::file::{File, FileKind};
use crate::hash::{read_xattrs, ContentHash};
use crate::manifest::{manifest_from_file, manifest_path, Manifest, FULL_NAME};
use crate::process::{self, Cmd};
use crate::state::get_last_versions_list;
use crate::stats::Stats;
use crate::timing::Timer;

/// Files smaller than this are always shipped in full.
pub const BSDIFFSIZE: u64 = 200;

/// Number of prior versions that get manifest deltas.
pub const SWUPD_NUM_MANIFEST_DELTAS: usize = 25;

/// A binary diff implementation.
pub trait DeltaEngine: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    /// Write a delta turning `old` into `new` to `delta`.
    fn diff(&self, old: &Path, new: &Path, delta: &Path) -> Result<()>;

    /// Reconstruct `out` from `old` and `delta`.
    fn apply(&self, old: &Path, delta: &Path, out: &Path) -> Result<()>;
}

/// In-process rsync-style deltas.
#[derive(Debug, Clone)]
pub struct RsyncDelta {
    pub block_size: u32,
}

impl Default for RsyncDelta {
    fn default() -> Self {
        Self { block_size: 2048 }
    }
}

impl RsyncDelta {
    fn tool_error(&self, detail: impl fmt::Display) -> Error {
        Error::Tool {
            tool: self.name().to_string(),
            detail: detail.to_string(),
        }
    }
}

impl DeltaEngine for RsyncDelta {
    fn name(&self) -> &'static str {
        "rsync-delta"
    }

    fn diff(&self, old: &Path, new: &Path, delta: &Path) -> Result<()> {
        let base = fs::read(old).at(old)?;
        let target = fs::read(new).at(new)?;
        let options = SignatureOptions {
            block_size: self.block_size,
            crypto_hash_size: 8,
        };
        let signature = Signature::calculate(&base, options);
        let mut out = Vec::new();
        fast_rsync::diff(&signature.index(), &target, &mut out).map_err(|e| self.tool_error(e))?;
        fs::write(delta, out).at(delta)
    }

    fn apply(&self, old: &Path, delta: &Path, out: &Path) -> Result<()> {
        let base = fs::read(old).at(old)?;
        let patch = fs::read(delta).at(delta)?;
        let mut result = Vec::new();
        fast_rsync::apply(&base, &patch, &mut result).map_err(|e| self.tool_error(e))?;
        fs::write(out, result).at(out)
    }
}

/// External `bsdiff`/`bspatch`.
#[derive(Debug, Clone, Default)]
pub struct Bsdiff;

impl Bsdiff {
    pub fn available() -> bool {
        process::exists("bsdiff") && process::exists("bspatch")
    }
}

impl DeltaEngine for Bsdiff {
    fn name(&self) -> &'static str {
        "bsdiff"
    }

    fn diff(&self, old: &Path, new: &Path, delta: &Path) -> Result<()> {
        Cmd::new("bsdiff").arg_path(old).arg_path(new).arg_path(delta).run()?;
        Ok(())
    }

    fn apply(&self, old: &Path, delta: &Path, out: &Path) -> Result<()> {
        Cmd::new("bspatch").arg_path(old).arg_path(out).arg_path(delta).run()?;
        Ok(())
    }
}

/// Engine named by the configuration, falling back to [`RsyncDelta`].
pub fn engine_from_name(name: &str) -> Arc<dyn DeltaEngine> {
    match name {
        "bsdiff" if Bsdiff::available() => Arc::new(Bsdiff),
        "bsdiff" => {
            tracing::warn!("bsdiff/bspatch not found in PATH, using in-process deltas");
            Arc::new(RsyncDelta::default())
        }
        "rsync" => Arc::new(RsyncDelta::default()),
        other => {
            tracing::warn!(engine = other, "unknown delta engine, using in-process deltas");
            Arc::new(RsyncDelta::default())
        }
    }
}

/// `<output>/<to_version>/delta/<from>-<to>-<fromhash>-<tohash>`.
pub fn delta_path(output_dir: &Path, to_version: u32, old: &File, new: &File) -> PathBuf {
    output_dir
        .join(to_version.to_string())
        .join("delta")
        .join(delta_name(old, new))
}

pub fn delta_name(old: &File, new: &File) -> String {
    format!("{}-{}-{}-{}", old.last_change, new.last_change, old.hash, new.hash)
}

/// Whether a content delta from `old` to `new` is worth attempting.
pub fn delta_eligible(old: &File, new: &File) -> bool {
    old.kind == FileKind::Regular
        && new.kind == FileKind::Regular
        && old.hash != new.hash
        && !old.hash.is_zeros()
        && !new.hash.is_zeros()
        && old.stat.size >= BSDIFFSIZE
        && new.stat.size >= BSDIFFSIZE
}

fn remove_quietly(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(path = %path.display(), "failed to remove temporary file: {e}");
        }
    }
}

/// One content delta to attempt. Owns everything it needs, so it can run on
/// a pool worker.
#[derive(Debug, Clone)]
pub struct DeltaJob {
    pub to_version: u32,
    pub old: File,
    pub old_path: PathBuf,
    pub new: File,
    pub new_path: PathBuf,
    /// Final location under `<output>/<to_version>/delta/`.
    pub out: PathBuf,
}

impl DeltaJob {
    pub fn new(output_dir: &Path, to_version: u32, old: &File, old_path: &Path, new: &File, new_path: &Path) -> Self {
        Self {
            to_version,
            out: delta_path(output_dir, to_version, old, new),
            old: old.clone(),
            old_path: old_path.to_path_buf(),
            new: new.clone(),
            new_path: new_path.to_path_buf(),
        }
    }

    /// Produce the delta, or reuse one generated earlier.
    ///
    /// Returns the delta path on a hit and `None` on a miss. Tool failures
    /// are misses; I/O failures on the output directory are errors.
    pub fn run(&self, engine: &dyn DeltaEngine, stats: &Stats) -> Result<Option<PathBuf>> {
        let (new, out) = (&self.new, &self.out);
        if out.is_file() {
            stats.account_delta_hit(new, self.to_version);
            return Ok(Some(out.clone()));
        }
        if let Some(dir) = out.parent() {
            fs::create_dir_all(dir).at(dir)?;
        }

        let tmp = out.with_extension("tmp");
        let check = out.with_extension("check");
        let outcome = self.attempt(engine, &tmp, &check);
        remove_quietly(&check);

        match outcome {
            Ok(true) => {
                fs::rename(&tmp, out).at(out)?;
                stats.account_delta_hit(new, self.to_version);
                Ok(Some(out.clone()))
            }
            Ok(false) => {
                remove_quietly(&tmp);
                stats.account_delta_miss(new, self.to_version);
                Ok(None)
            }
            Err(e) if e.is_recoverable() => {
                tracing::warn!(file = %new.filename, "delta failed, shipping full content: {e}");
                remove_quietly(&tmp);
                stats.account_delta_miss(new, self.to_version);
                Ok(None)
            }
            Err(e) => {
                remove_quietly(&tmp);
                Err(e)
            }
        }
    }

    fn attempt(&self, engine: &dyn DeltaEngine, tmp: &Path, check: &Path) -> Result<bool> {
        let new = &self.new;
        engine.diff(&self.old_path, &self.new_path, tmp)?;
        let size = fs::metadata(tmp).at(tmp)?.len();
        if size >= new.stat.size {
            tracing::debug!(file = %new.filename, delta = size, full = new.stat.size, "delta not smaller than content");
            return Ok(false);
        }

        engine.apply(&self.old_path, tmp, check)?;
        // Xattrs travel in the archive, not in the delta.
        let xattrs = read_xattrs(&self.new_path)?;
        if ContentHash::keyed_file(&new.stat, &xattrs, check)? != new.hash {
            tracing::warn!(file = %new.filename, engine = engine.name(), "delta does not reproduce content");
            return Ok(false);
        }
        Ok(true)
    }
}

/// Try to produce a delta between two versions of one file.
///
/// `old_path` and `new_path` locate the content in the image trees. An
/// ineligible pair is `None` without being accounted.
pub fn create_delta(
    ctx: &BuildContext,
    to_version: u32,
    old: &File,
    old_path: &Path,
    new: &File,
    new_path: &Path,
) -> Result<Option<PathBuf>> {
    if !delta_eligible(old, new) {
        return Ok(None);
    }
    DeltaJob::new(&ctx.config.output_dir, to_version, old, old_path, new, new_path).run(ctx.delta.as_ref(), &ctx.stats)
}

/// Content deltas for every regular file of `full` that changed at its
/// version, from each of `last_versions`, generated on the worker pool.
///
/// The old content is taken from the image tree of each older version; a
/// version whose image is gone is skipped. Returns the number of deltas
/// available afterwards.
pub fn create_manifest_deltas(ctx: &BuildContext, full: &Manifest, last_versions: &[u32]) -> Result<usize> {
    let version = full.version;
    let mut by_version = full.clone();
    by_version.sort_by_version();
    let first = by_version.files.partition_point(|f| f.last_change < version);
    let changed: Vec<&File> = by_version.files[first..]
        .iter()
        .filter(|f| f.kind == FileKind::Regular && !f.modifiers.state)
        .collect();
    if changed.is_empty() {
        return Ok(0);
    }

    let output = &ctx.config.output_dir;
    let mut jobs: BTreeMap<PathBuf, DeltaJob> = BTreeMap::new();
    for &old_version in last_versions {
        if !ctx.full_dir(old_version).is_dir() {
            tracing::debug!(old_version, "image gone, no deltas from it");
            continue;
        }
        let old_full = manifest_from_file(output, old_version, FULL_NAME)?;
        for new in &changed {
            let Some(old) = old_full.get(&new.filename) else {
                continue;
            };
            if old.modifiers.state || !delta_eligible(old, new) {
                continue;
            }
            let old_path = ctx.image_path(old_version, &old.filename);
            let new_path = ctx.image_path(version, &new.filename);
            let job = DeltaJob::new(output, version, old, &old_path, new, &new_path);
            jobs.entry(job.out.clone()).or_insert(job);
        }
    }

    let timer = Timer::start("content deltas");
    tracing::info!(version, from = ?last_versions, jobs = jobs.len(), threads = ctx.pool.threads(), "generating content deltas");
    let engine = Arc::clone(&ctx.delta);
    let stats = Arc::clone(&ctx.stats);
    let made = ctx
        .pool
        .try_map(jobs.into_values().collect(), move |job: DeltaJob| job.run(engine.as_ref(), &stats))?;
    timer.finish();
    Ok(made.iter().flatten().count())
}

/// `Manifest.<module>.D.<old_version>` next to the new manifest.
pub fn manifest_delta_path(output_dir: &Path, old_version: u32, new_version: u32, module: &str) -> PathBuf {
    let mut path = manifest_path(output_dir, new_version, module).into_os_string();
    path.push(format!(".D.{old_version}"));
    PathBuf::from(path)
}

/// Diff the serialized manifests of `module` between two versions.
///
/// Returns the delta path when one was kept. A missing old manifest (the
/// bundle did not exist yet) is not an error.
pub fn create_manifest_delta(ctx: &BuildContext, old_version: u32, new_version: u32, module: &str) -> Result<Option<PathBuf>> {
    let output = &ctx.config.output_dir;
    let old = manifest_path(output, old_version, module);
    let new = manifest_path(output, new_version, module);
    if !old.is_file() {
        return Ok(None);
    }
    let out = manifest_delta_path(output, old_version, new_version, module);
    if out.is_file() {
        return Ok(Some(out));
    }

    let new_size = fs::metadata(&new).at(&new)?.len();
    match ctx.delta.diff(&old, &new, &out) {
        Ok(()) => {}
        Err(e) if e.is_recoverable() => {
            tracing::warn!(module, old_version, "manifest delta failed: {e}");
            remove_quietly(&out);
            return Ok(None);
        }
        Err(e) => {
            remove_quietly(&out);
            return Err(e);
        }
    }

    let size = fs::metadata(&out).at(&out)?.len();
    if size >= new_size {
        remove_quietly(&out);
        return Ok(None);
    }
    tracing::debug!(module, old_version, new_version, size, "manifest delta");
    Ok(Some(out))
}

/// Manifest deltas for `modules` from each of the most recent published
/// versions before `new_version`. Returns the number created.
pub fn create_manifest_file_deltas(ctx: &BuildContext, new_version: u32, modules: &[String]) -> Result<usize> {
    let versions = get_last_versions_list(&ctx.config.output_dir, new_version, SWUPD_NUM_MANIFEST_DELTAS)?;
    let mut created = 0;
    for old_version in versions {
        for module in modules {
            if create_manifest_delta(ctx, old_version, new_version, module)?.is_some() {
                created += 1;
            }
        }
    }
    Ok(created)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::Stat;
    use tempfile::TempDir;

    fn content(seed: u64, len: usize) -> Vec<u8> {
        let mut state = seed.wrapping_mul(0x9e37_79b9_7f4a_7c15) | 1;
        (0..len)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                state as u8
            })
            .collect()
    }

    fn file_for(name: &str, path: &Path, last_change: u32) -> File {
        let mut f = File::new(name, FileKind::Regular);
        f.stat = Stat::from_path(path).unwrap();
        f.hash = ContentHash::of_file(&f.stat, path).unwrap();
        f.last_change = last_change;
        f
    }

    #[test]
    fn test_rsync_round_trip() {
        let dir = TempDir::new().unwrap();
        let old = dir.path().join("old");
        let new = dir.path().join("new");
        let mut data = content(1, 64 * 1024);
        fs::write(&old, &data).unwrap();
        data[1000..1010].copy_from_slice(b"0123456789");
        fs::write(&new, &data).unwrap();

        let engine = RsyncDelta::default();
        let delta = dir.path().join("delta");
        let out = dir.path().join("out");
        engine.diff(&old, &new, &delta).unwrap();
        engine.apply(&old, &delta, &out).unwrap();
        assert_eq!(fs::read(&out).unwrap(), data);
        assert!(fs::metadata(&delta).unwrap().len() < data.len() as u64);
    }

    #[test]
    fn test_eligibility() {
        let mut a = File::new("/a", FileKind::Regular);
        let mut b = File::new("/a", FileKind::Regular);
        a.stat.size = 1000;
        b.stat.size = 1000;
        a.hash = ContentHash::of_bytes(&a.stat, b"a");
        b.hash = ContentHash::of_bytes(&b.stat, b"b");
        assert!(delta_eligible(&a, &b));

        b.stat.size = BSDIFFSIZE - 1;
        assert!(!delta_eligible(&a, &b));

        b.stat.size = 1000;
        b.kind = FileKind::Symlink;
        assert!(!delta_eligible(&a, &b));
    }

    #[test]
    fn test_create_delta_hit_and_reuse() {
        let dir = TempDir::new().unwrap();
        let ctx = BuildContext::for_testing(dir.path(), 20).unwrap();
        let old_path = dir.path().join("old");
        let new_path = dir.path().join("new");
        let mut data = content(3, 32 * 1024);
        fs::write(&old_path, &data).unwrap();
        data[500] ^= 0xff;
        fs::write(&new_path, &data).unwrap();

        let old = file_for("/usr/lib/libx.so", &old_path, 10);
        let new = file_for("/usr/lib/libx.so", &new_path, 20);
        let delta = create_delta(&ctx, 20, &old, &old_path, &new, &new_path)
            .unwrap()
            .unwrap();
        assert!(delta.ends_with(format!("delta/10-20-{}-{}", old.hash, new.hash)));
        assert_eq!(ctx.stats.snapshot().delta_hits, 1);

        let again = create_delta(&ctx, 20, &old, &old_path, &new, &new_path).unwrap();
        assert_eq!(again, Some(delta));
        assert_eq!(ctx.stats.snapshot().delta_hits, 2);
    }

    #[test]
    fn test_unrelated_content_is_a_miss() {
        let dir = TempDir::new().unwrap();
        let ctx = BuildContext::for_testing(dir.path(), 20).unwrap();
        let old_path = dir.path().join("old");
        let new_path = dir.path().join("new");
        fs::write(&old_path, content(5, 4096)).unwrap();
        fs::write(&new_path, content(200, 4096)).unwrap();

        let old = file_for("/etc/app.conf", &old_path, 10);
        let new = file_for("/etc/app.conf", &new_path, 20);
        assert_eq!(create_delta(&ctx, 20, &old, &old_path, &new, &new_path).unwrap(), None);
        let s = ctx.stats.snapshot();
        assert_eq!(s.delta_misses, 1);
        assert_eq!(s.delta_hits, 0);
        let delta_dir = dir.path().join("www/20/delta");
        assert_eq!(fs::read_dir(delta_dir).unwrap().count(), 0);
    }

    #[test]
    fn test_manifest_delta_path() {
        let path = manifest_delta_path(Path::new("/www"), 10, 20, "os-core");
        assert_eq!(path, PathBuf::from("/www/20/Manifest.os-core.D.10"));
    }
}
