use assert_cmd::prelude::*;
use predicates::prelude::*;
use rand::{rngs::StdRng, RngCore, SeedableRng};
use std::process::Command;

use rman_core::cache::{Cache, CacheOptions};
use rman_core::chunk::{ChunkDst, FileId, HashType};
use rman_core::file::{JrmanWriter, RFile};

/// Seed an input cache + JRMAN manifest describing one file.
fn seed_input(dir: &std::path::Path, content: &[u8]) -> (std::path::PathBuf, std::path::PathBuf) {
    let bundle = dir.join("in.bundle");
    let manifest = dir.join("in.jrman");

    let mut cache = Cache::open(&CacheOptions {
        path: bundle.clone(),
        readonly: false,
        flush_size: 0,
        max_size: 0,
    })
    .unwrap();
    let mut chunks = Vec::new();
    let mut offset = 0u64;
    for part in content.chunks(64 * 1024) {
        let src = cache.add_uncompressed(part, 3).unwrap();
        chunks.push(ChunkDst { src, hash_type: HashType::RitoHkdf, uncompressed_offset: offset });
        offset += part.len() as u64;
    }
    let file = RFile {
        file_id: FileId::from_raw(0xF00D),
        permissions: 0,
        size: offset,
        path: "game/assets/data.bin".into(),
        link: String::new(),
        langs: "none".into(),
        time: 0,
        chunks: Some(chunks),
    };
    let mut writer = JrmanWriter::create(&manifest, false).unwrap();
    writer.write(&file).unwrap();
    drop(writer);
    drop(cache);
    (bundle, manifest)
}

#[test]
fn ls_prints_manifest_files() {
    let td = tempfile::tempdir().unwrap();
    let (_bundle, manifest) = seed_input(td.path(), &[7u8; 1000]);

    let mut cmd = Command::cargo_bin("rman").unwrap();
    cmd.args(["ls", manifest.to_str().unwrap()]);
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("game/assets/data.bin,1000,000000000000F00D,none"));
}

#[test]
fn remake_then_check_then_restore() {
    let td = tempfile::tempdir().unwrap();
    let mut content = vec![0u8; 300 * 1024];
    StdRng::seed_from_u64(99).fill_bytes(&mut content);
    let (bundle, manifest) = seed_input(td.path(), &content);

    let outbundle = td.path().join("out.bundle");
    let outmanifest = td.path().join("out.jrman");

    // Rechunk everything into a fresh bundle + manifest.
    let mut cmd = Command::cargo_bin("rman").unwrap();
    cmd.args([
        "remake",
        outbundle.to_str().unwrap(),
        outmanifest.to_str().unwrap(),
        bundle.to_str().unwrap(),
        manifest.to_str().unwrap(),
        "--no-progress",
        "--chunk-size",
        "64",
        "--cdc",
        "bup",
        "--ar-min",
        "4",
    ]);
    cmd.assert().success();

    // Every chunk in the output bundle decompresses and hashes to its id.
    let mut cmd = Command::cargo_bin("rman").unwrap();
    cmd.args(["bundle-chk", outbundle.to_str().unwrap(), "--verify-hash"]);
    cmd.assert().success().stdout(predicate::str::contains("OK"));

    // Restore the tree from the remade manifest, fed only by the cache.
    let outdir = td.path().join("restore");
    let mut cmd = Command::cargo_bin("rman").unwrap();
    cmd.args([
        "dl",
        outmanifest.to_str().unwrap(),
        outdir.to_str().unwrap(),
        "--cache",
        outbundle.to_str().unwrap(),
        "--no-progress",
    ]);
    cmd.assert().success();

    let restored = std::fs::read(outdir.join("game/assets/data.bin")).unwrap();
    assert_eq!(restored, content);

    // A second dl run verifies in place and stays green.
    let mut cmd = Command::cargo_bin("rman").unwrap();
    cmd.args([
        "dl",
        outmanifest.to_str().unwrap(),
        outdir.to_str().unwrap(),
        "--cache",
        outbundle.to_str().unwrap(),
        "--no-progress",
    ]);
    cmd.assert().success();
}

#[test]
fn bundle_ls_lists_chunks() {
    let td = tempfile::tempdir().unwrap();
    let (bundle, _manifest) = seed_input(td.path(), &[3u8; 100_000]);

    let mut cmd = Command::cargo_bin("rman").unwrap();
    cmd.args(["bundle-ls", bundle.to_str().unwrap()]);
    cmd.assert().success().stdout(predicate::str::contains(","));
}

#[test]
fn path_filter_limits_dl() {
    let td = tempfile::tempdir().unwrap();
    let (bundle, manifest) = seed_input(td.path(), &[1u8; 500]);

    let outdir = td.path().join("filtered");
    let mut cmd = Command::cargo_bin("rman").unwrap();
    cmd.args([
        "dl",
        manifest.to_str().unwrap(),
        outdir.to_str().unwrap(),
        "--cache",
        bundle.to_str().unwrap(),
        "--filter-path",
        "does-not-match",
        "--no-progress",
    ]);
    cmd.assert().success().stderr(predicate::str::contains("Done: 0 files"));
    assert!(!outdir.join("game/assets/data.bin").exists());
}
