//! Integration tests for pack building.

mod helpers;

use helpers::{entry, noise, text, TestEnv};
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use swupd_server::hash::ContentHash;
use swupd_server::manifest::Manifest;
use swupd_server::pack::{make_pack, make_packs, pack_path, resolve_pack_items, PackData, PackItem};

/// Entry names of a pack archive, in archive order.
fn pack_entries(path: &Path) -> Vec<String> {
    let mut archive = tar::Archive::new(fs::File::open(path).unwrap());
    archive
        .entries()
        .unwrap()
        .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
        .collect()
}

/// Hash of the content an archive entry delivers.
fn delivered_hash(name: &str) -> ContentHash {
    if let Some(hash) = name.strip_prefix("staged/") {
        return hash.parse().unwrap();
    }
    let delta = name.strip_prefix("delta/").unwrap();
    delta.rsplit('-').next().unwrap().parse().unwrap()
}

/// Live, non-state content a client needs for `manifest`.
fn needed(manifest: &Manifest) -> BTreeSet<ContentHash> {
    manifest.content_hashes()
}

fn assert_pack_complete(env: &TestEnv, bundle: &str, from: u32, to: u32, from_manifest: &Manifest) {
    let path = pack_path(&env.output(), bundle, from, to);
    let names = pack_entries(&path);
    let shipped: Vec<ContentHash> = names.iter().map(|n| delivered_hash(n)).collect();
    let shipped_set: BTreeSet<ContentHash> = shipped.iter().copied().collect();
    assert_eq!(shipped.len(), shipped_set.len(), "content shipped twice in {names:?}");

    let have = needed(from_manifest);
    let target = needed(&env.manifest(to, bundle));
    assert!(shipped_set.is_disjoint(&have), "pack ships content the client has");
    assert!(shipped_set.is_subset(&target), "pack ships content not in {bundle} {to}");
    let union: BTreeSet<ContentHash> = shipped_set.union(&have).copied().collect();
    assert!(target.is_subset(&union), "pack is missing content of {bundle} {to}");
}

fn two_versions(env: &TestEnv) {
    env.add_file(10, "os-core", "/usr/bin/sh", text("shell", 3000));
    env.add_file(10, "os-core", "/usr/lib/libbig.so", noise(7, 65536));
    env.add_file(10, "os-core", "/etc/app.conf", noise(1, 4096));
    env.add_file(10, "os-core", "/var/cache/index", "state");
    env.add_symlink(10, "os-core", "/usr/lib/libbig.so.1", "libbig.so");
    env.create_update(10);

    env.copy_image(10, 11);
    let mut big = noise(7, 65536);
    for b in &mut big[30000..30010] {
        *b = !*b;
    }
    env.add_file(11, "os-core", "/usr/lib/libbig.so", big);
    env.add_file(11, "os-core", "/etc/app.conf", noise(2, 4096));
    env.add_file(11, "os-core", "/var/cache/index", "other state");
    env.add_file(11, "os-core", "/usr/share/new.txt", "brand new");
    env.create_update(11);
}

#[test]
fn test_pack_ships_deltas_and_full_content() {
    let env = TestEnv::new(&["os-core"]);
    two_versions(&env);

    let ctx = env.context(11);
    let mut pack = PackData::new("os-core", 10, 11);
    let path = make_pack(&ctx, &mut pack).unwrap();
    assert_eq!(path, env.output().join("11/pack-os-core-from-10.tar"));

    let core10 = env.manifest(10, "os-core");
    let core11 = env.manifest(11, "os-core");
    let big10 = entry(&core10, "/usr/lib/libbig.so");
    let big11 = entry(&core11, "/usr/lib/libbig.so");
    let delta_name = format!("10-11-{}-{}", big10.hash, big11.hash);

    let names = pack_entries(&path);
    assert!(names.contains(&format!("delta/{delta_name}")), "{names:?}");
    assert!(env.output().join("11/delta").join(&delta_name).is_file());
    assert!(names.contains(&format!("staged/{}", entry(&core11, "/usr/share/new.txt").hash)));

    // Unrelated random config content does not diff well: shipped in full.
    let conf = entry(&core11, "/etc/app.conf");
    assert!(names.contains(&format!("staged/{}", conf.hash)));
    // State never ships.
    let state = entry(&core11, "/var/cache/index");
    assert!(names.iter().all(|n| !n.ends_with(&state.hash.to_hex())));

    assert_eq!(pack.deltacount, 1);
    assert_eq!(pack.fullcount + pack.deltacount, names.len());
    let stats = ctx.stats.snapshot();
    assert_eq!(stats.delta_hits, 1);
    assert_eq!(stats.delta_misses, 1);

    assert_pack_complete(&env, "os-core", 10, 11, &core10);
}

#[test]
fn test_existing_delta_is_reused() {
    let env = TestEnv::new(&["os-core"]);
    two_versions(&env);

    let ctx = env.context(11);
    let mut first = PackData::new("os-core", 10, 11);
    let items = resolve_pack_items(&ctx, &mut first).unwrap();
    let delta = items
        .iter()
        .find_map(|i| match i {
            PackItem::Delta { source, .. } => Some(source.clone()),
            PackItem::Full { .. } => None,
        })
        .unwrap();
    let written = fs::metadata(&delta).unwrap().modified().unwrap();

    let mut second = PackData::new("os-core", 10, 11);
    resolve_pack_items(&ctx, &mut second).unwrap();
    assert_eq!(fs::metadata(&delta).unwrap().modified().unwrap(), written);
    assert_eq!(ctx.stats.snapshot().delta_hits, 2);
}

#[test]
fn test_rename_ships_nothing_for_identical_content() {
    let env = TestEnv::new(&["os-core"]);
    env.add_file(10, "os-core", "/usr/bin/foo", text("foo tool", 1500));
    env.create_update(10);
    env.copy_image(10, 11);
    env.remove(11, "/usr/bin/foo");
    env.add_file(11, "os-core", "/usr/bin/foo2", text("foo tool", 1500));
    env.create_update(11);

    let ctx = env.context(11);
    let mut pack = PackData::new("os-core", 10, 11);
    let path = make_pack(&ctx, &mut pack).unwrap();
    assert!(pack_entries(&path).is_empty());
    assert_eq!(pack.deltacount, 0);
    assert!(!env.output().join("11/delta").exists());
}

#[test]
fn test_renamed_file_diffs_against_its_source() {
    let env = TestEnv::new(&["os-core"]);
    env.add_file(10, "os-core", "/usr/lib/libfoo-1.2.so", noise(9, 32768));
    env.create_update(10);

    env.copy_image(10, 11);
    env.remove(11, "/usr/lib/libfoo-1.2.so");
    let mut next = noise(9, 32768);
    next[100] ^= 0xff;
    env.add_file(11, "os-core", "/usr/lib/libfoo-1.3.so", next);
    env.create_update(11);

    let core10 = env.manifest(10, "os-core");
    let core11 = env.manifest(11, "os-core");
    assert!(entry(&core11, "/usr/lib/libfoo-1.3.so").modifiers.rename);

    let ctx = env.context(11);
    let mut pack = PackData::new("os-core", 10, 11);
    let path = make_pack(&ctx, &mut pack).unwrap();
    let expected = format!(
        "delta/10-11-{}-{}",
        entry(&core10, "/usr/lib/libfoo-1.2.so").hash,
        entry(&core11, "/usr/lib/libfoo-1.3.so").hash
    );
    assert_eq!(pack_entries(&path), vec![expected]);
    assert_pack_complete(&env, "os-core", 10, 11, &core10);
}

#[test]
fn test_make_packs_covers_recent_versions_and_zero() {
    let env = TestEnv::new(&["os-core", "editors"]);
    env.add_file(10, "os-core", "/usr/bin/sh", "sh 1");
    env.add_file(10, "editors", "/usr/bin/vi", "vi 1");
    env.create_update(10);
    env.copy_image(10, 11);
    env.add_file(11, "os-core", "/usr/bin/sh", "sh 2");
    env.create_update(11);
    env.copy_image(11, 12);
    env.add_file(12, "os-core", "/usr/bin/sh", "sh 3");
    env.create_update(12);

    let ctx = env.context(12);
    let packs = make_packs(&ctx, 12, true).unwrap();
    let made: Vec<(String, u32)> = packs.iter().map(|p| (p.module.clone(), p.from)).collect();
    // editors did not change at 12.
    assert_eq!(
        made,
        vec![("os-core".to_string(), 11), ("os-core".to_string(), 10), ("os-core".to_string(), 0)]
    );

    for from in [11, 10] {
        let start = env.manifest(env_bundle_version(&env, from, "os-core"), "os-core");
        assert_pack_complete(&env, "os-core", from, 12, &start);
    }
    assert_pack_complete(&env, "os-core", 0, 12, &Manifest::new(0, "os-core", 3));

    // A zero pack carries every live entry of the bundle.
    let zero = pack_entries(&pack_path(&env.output(), "os-core", 0, 12));
    assert_eq!(zero.len(), env.manifest(12, "os-core").content_hashes().len());
}

fn env_bundle_version(env: &TestEnv, version: u32, bundle: &str) -> u32 {
    env.manifest(version, "MoM")
        .manifests
        .iter()
        .find(|m| m.filename == bundle)
        .unwrap()
        .last_change
}

#[test]
fn test_pack_for_missing_bundle_fails() {
    let env = TestEnv::new(&["os-core"]);
    env.add_file(10, "os-core", "/usr/bin/sh", "sh");
    env.create_update(10);

    let ctx = env.context(10);
    let mut pack = PackData::new("nope", 0, 10);
    assert!(make_pack(&ctx, &mut pack).is_err());
    assert!(!pack_path(&env.output(), "nope", 0, 10).exists());
}
