//! Packs: per-bundle archives of what a client at one version lacks.
//!
//! A pack from `from` to `to` holds `staged/<hash>` for content shipped in
//! full and `delta/<name>` for content reconstructible from a file the
//! client already has.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::context::BuildContext;
use crate::delta::{create_delta, delta_name};
use crate::error::{Error, IoContext, Result};
use crate::file::{File, FileKind};
use crate::fullfile::append_entry;
use crate::hash::ContentHash;
use crate::manifest::{
    add_deleted_files, manifest_from_file, manifest_subversion, prune_manifest, relink_peers,
    rename_detection, Manifest, MOM_NAME,
};
use crate::state::get_last_versions_list;
use crate::stats::Stats;

/// Number of prior versions that get a direct pack to each new version.
pub const SWUPD_NUM_PACKS: usize = 4;

/// One pack artifact.
#[derive(Debug, Clone, Serialize)]
pub struct PackData {
    pub module: String,
    pub from: u32,
    pub to: u32,
    /// Items shipped in full.
    pub fullcount: usize,
    /// Items shipped as deltas.
    pub deltacount: usize,
    /// Bundle manifest at `to`, once resolved.
    #[serde(skip)]
    pub end_manifest: Option<Manifest>,
}

impl PackData {
    pub fn new(module: impl Into<String>, from: u32, to: u32) -> Self {
        Self {
            module: module.into(),
            from,
            to,
            fullcount: 0,
            deltacount: 0,
            end_manifest: None,
        }
    }
}

/// One archive member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PackItem {
    /// Full content of `hash`, read from `source`.
    Full { hash: ContentHash, source: PathBuf },
    /// Delta producing `hash`.
    Delta { hash: ContentHash, name: String, source: PathBuf },
}

impl PackItem {
    /// Hash of the content the item delivers.
    pub fn hash(&self) -> ContentHash {
        match self {
            Self::Full { hash, .. } | Self::Delta { hash, .. } => *hash,
        }
    }

    fn archive_name(&self) -> String {
        match self {
            Self::Full { hash, .. } => format!("staged/{hash}"),
            Self::Delta { name, .. } => format!("delta/{name}"),
        }
    }
}

/// `<output>/<to>/pack-<module>-from-<from>.tar`.
pub fn pack_path(output_dir: &Path, module: &str, from: u32, to: u32) -> PathBuf {
    output_dir
        .join(to.to_string())
        .join(format!("pack-{module}-from-{from}.tar"))
}

/// Bundle manifest of `module` as published at MoM `version`. A bundle that
/// did not exist yet (or version 0) yields an empty manifest.
fn bundle_at(ctx: &BuildContext, module: &str, version: u32) -> Result<Manifest> {
    if version == 0 {
        return Ok(Manifest::new(0, module, ctx.format));
    }
    let output = &ctx.config.output_dir;
    let mom = manifest_from_file(output, version, MOM_NAME)?;
    match manifest_subversion(&mom, module) {
        Some(bundle_version) => manifest_from_file(output, bundle_version, module),
        None => Ok(Manifest::new(0, module, ctx.format)),
    }
}

fn live_copy(manifest: &Manifest) -> Manifest {
    let mut copy = manifest.clone();
    copy.retain_files(|f| f.kind.is_live());
    copy
}

/// The old file a new entry can be diffed against: its same-path peer, or
/// the source of a detected rename.
fn delta_base<'a>(current: &Manifest, old: &'a Manifest, idx: usize) -> Option<&'a File> {
    let file = &current.files[idx];
    if let Some(peer) = file.peer {
        let base = &old.files[peer];
        return (base.kind == FileKind::Regular).then_some(base);
    }
    let source = file.rename_peer?;
    let peer = current.files[source].peer?;
    Some(&old.files[peer])
}

/// Resolve the members of `pack`, generating deltas where they pay off.
///
/// Every live, non-state entry at `to` whose hash a client at `from` does
/// not already have is delivered exactly once.
pub fn resolve_pack_items(ctx: &BuildContext, pack: &mut PackData) -> Result<Vec<PackItem>> {
    let start = bundle_at(ctx, &pack.module, pack.from)?;
    let end = bundle_at(ctx, &pack.module, pack.to)?;
    if end.version == 0 {
        return Err(Error::format(format!(
            "bundle {} does not exist at version {}",
            pack.module, pack.to
        )));
    }

    let mut old = live_copy(&start);
    let mut current = live_copy(&end);
    relink_peers(&mut old, &mut current);

    // Rename pairing only guides delta selection here; it is not accounted.
    let scratch = Stats::default();
    add_deleted_files(&mut old, &mut current, 0, &scratch);
    rename_detection(&mut current, &old, &ctx.rename, &scratch, |version, file| {
        let image_version = if version == old.version { pack.from } else { pack.to };
        ctx.probe(image_version, file)
    });
    prune_manifest(&mut current, &mut old);

    let have = start.content_hashes();
    let mut added = BTreeSet::new();
    let mut items = Vec::new();
    for idx in 0..current.files.len() {
        let file = &current.files[idx];
        if !file.kind.is_live() || file.modifiers.state || file.hash.is_zeros() {
            continue;
        }
        if have.contains(&file.hash) || !added.insert(file.hash) {
            continue;
        }

        let new_path = ctx.image_path(pack.to, &file.filename);
        if let Some(base) = delta_base(&current, &old, idx) {
            let old_path = ctx.image_path(pack.from, &base.filename);
            if let Some(delta) = create_delta(ctx, pack.to, base, &old_path, file, &new_path)? {
                items.push(PackItem::Delta {
                    hash: file.hash,
                    name: delta_name(base, file),
                    source: delta,
                });
                continue;
            }
        }
        items.push(PackItem::Full {
            hash: file.hash,
            source: new_path,
        });
    }

    pack.fullcount = items.iter().filter(|i| matches!(i, PackItem::Full { .. })).count();
    pack.deltacount = items.len() - pack.fullcount;
    pack.end_manifest = Some(end);
    Ok(items)
}

/// Build the pack archive for `pack`, returning its path.
pub fn make_pack(ctx: &BuildContext, pack: &mut PackData) -> Result<PathBuf> {
    let items = resolve_pack_items(ctx, pack)?;

    let out = pack_path(&ctx.config.output_dir, &pack.module, pack.from, pack.to);
    if let Some(dir) = out.parent() {
        fs::create_dir_all(dir).at(dir)?;
    }
    let tmp = out.with_extension("tar.tmp");
    let result = (|| {
        let file = fs::File::create(&tmp).at(&tmp)?;
        let mut archive = tar::Builder::new(file);
        archive.follow_symlinks(false);
        for item in &items {
            let source = match item {
                PackItem::Full { source, .. } | PackItem::Delta { source, .. } => source,
            };
            append_entry(&mut archive, &out, source, &item.archive_name())?;
        }
        archive
            .into_inner()
            .map_err(|source| Error::Archive { path: out.clone(), source })?;
        fs::rename(&tmp, &out).at(&out)
    })();
    if let Err(e) = result {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }

    tracing::info!(
        module = %pack.module,
        from = pack.from,
        to = pack.to,
        full = pack.fullcount,
        deltas = pack.deltacount,
        "pack written"
    );
    Ok(out)
}

/// Packs to `to_version` for every bundle changed at that version, from each
/// of the last [`SWUPD_NUM_PACKS`] published versions, plus from 0 when
/// `zero` is set.
pub fn make_packs(ctx: &BuildContext, to_version: u32, zero: bool) -> Result<Vec<PackData>> {
    let mom = manifest_from_file(&ctx.config.output_dir, to_version, MOM_NAME)?;
    let mut froms = get_last_versions_list(&ctx.config.output_dir, to_version, SWUPD_NUM_PACKS)?;
    if zero {
        froms.push(0);
    }

    let mut packs = Vec::new();
    for reference in mom.manifests.iter().filter(|m| m.last_change == to_version) {
        for &from in &froms {
            let mut pack = PackData::new(reference.filename.clone(), from, to_version);
            make_pack(ctx, &mut pack)?;
            pack.end_manifest = None;
            packs.push(pack);
        }
    }
    Ok(packs)
}
