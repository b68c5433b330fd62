//! End-to-end per-file pipeline: verify existing bytes, fill the rest from
//! the cache, write chunks at their offsets.

use rman_core::cache::{Cache, CacheOptions};
use rman_core::chunk::{self, ChunkDst, FileId, HashType};
use rman_core::download::{download_file, DownloadOptions};
use rman_core::file::RFile;
use rman_core::progress::Progress;

fn cached_file(cache: &mut Cache, path: &str, parts: &[&[u8]]) -> RFile {
    let mut chunks = Vec::new();
    let mut offset = 0u64;
    for part in parts {
        let src = cache.add_uncompressed(part, 3).unwrap();
        chunks.push(ChunkDst {
            src,
            hash_type: HashType::RitoHkdf,
            uncompressed_offset: offset,
        });
        offset += part.len() as u64;
    }
    RFile {
        file_id: FileId::from_raw(0x77),
        permissions: 0,
        size: offset,
        path: path.to_string(),
        link: String::new(),
        langs: "none".into(),
        time: 0,
        chunks: Some(chunks),
    }
}

#[test]
fn fills_a_missing_file_from_the_cache() {
    let td = tempfile::tempdir().unwrap();
    let out = td.path().join("out");
    let mut cache = Cache::open(&CacheOptions {
        path: td.path().join("cache.bundle"),
        readonly: false,
        flush_size: 0,
        max_size: 0,
    })
    .unwrap();

    let part_a = vec![0xAAu8; 70_000];
    let part_b = vec![0xBBu8; 30_000];
    let file = cached_file(&mut cache, "nested/dir/data.bin", &[&part_a, &part_b]);

    let progress = Progress::new(false);
    let report = download_file(
        &file,
        &out,
        DownloadOptions::default(),
        Some(&mut cache),
        None,
        &progress,
    )
    .unwrap();
    assert!(report.is_complete());

    let written = std::fs::read(out.join("nested/dir/data.bin")).unwrap();
    assert_eq!(written.len(), 100_000);
    assert_eq!(&written[..70_000], &part_a[..]);
    assert_eq!(&written[70_000..], &part_b[..]);

    // A second run verifies in place and touches nothing.
    let report = download_file(
        &file,
        &out,
        DownloadOptions::default(),
        Some(&mut cache),
        None,
        &progress,
    )
    .unwrap();
    assert!(report.is_complete());
}

#[test]
fn repairs_a_corrupted_region_only() {
    let td = tempfile::tempdir().unwrap();
    let out = td.path().join("out");
    let mut cache = Cache::open(&CacheOptions {
        path: td.path().join("cache.bundle"),
        readonly: false,
        flush_size: 0,
        max_size: 0,
    })
    .unwrap();

    let part_a = vec![0x11u8; 50_000];
    let part_b = vec![0x22u8; 50_000];
    let file = cached_file(&mut cache, "data.bin", &[&part_a, &part_b]);
    let progress = Progress::new(false);
    download_file(&file, &out, DownloadOptions::default(), Some(&mut cache), None, &progress)
        .unwrap();

    // Corrupt the second chunk's bytes on disk.
    let path = out.join("data.bin");
    let mut on_disk = std::fs::read(&path).unwrap();
    on_disk[60_000] ^= 0xFF;
    std::fs::write(&path, &on_disk).unwrap();

    let report =
        download_file(&file, &out, DownloadOptions::default(), Some(&mut cache), None, &progress)
            .unwrap();
    assert!(report.is_complete());
    let repaired = std::fs::read(&path).unwrap();
    assert_eq!(&repaired[50_000..], &part_b[..]);
}

#[test]
fn unsatisfiable_chunks_leave_the_file_partial() {
    let td = tempfile::tempdir().unwrap();
    let out = td.path().join("out");
    let mut cache = Cache::open(&CacheOptions {
        path: td.path().join("cache.bundle"),
        readonly: false,
        flush_size: 0,
        max_size: 0,
    })
    .unwrap();

    let part = vec![0x5Au8; 10_000];
    let mut file = cached_file(&mut cache, "data.bin", &[&part]);
    // Point the file at a chunk the cache does not have.
    let ghost = vec![0xA5u8; 10_000];
    if let Some(chunks) = file.chunks.as_mut() {
        chunks[0].src.chunk.id = chunk::hash(&ghost, HashType::RitoHkdf);
    }

    let progress = Progress::new(false);
    let report =
        download_file(&file, &out, DownloadOptions::default(), Some(&mut cache), None, &progress)
            .unwrap();
    assert_eq!(report.failed.len(), 1);
    // The file exists at full size, content unfilled.
    assert_eq!(std::fs::metadata(out.join("data.bin")).unwrap().len(), 10_000);
}

// A single-chunk file whose on-disk bytes hash to the manifest id verifies
// clean with no sources attached.
#[test]
fn verified_file_needs_no_sources() {
    let td = tempfile::tempdir().unwrap();
    let out = td.path().join("out");
    std::fs::create_dir_all(&out).unwrap();

    let payload = vec![0x42u8; 100];
    std::fs::write(out.join("foo.bin"), &payload).unwrap();

    let file = RFile {
        file_id: FileId::from_raw(1),
        permissions: 0,
        size: 100,
        path: "foo.bin".into(),
        link: String::new(),
        langs: "none".into(),
        time: 0,
        chunks: Some(vec![ChunkDst {
            src: rman_core::chunk::ChunkSrc {
                chunk: rman_core::chunk::Chunk {
                    id: chunk::hash(&payload, HashType::Sha256),
                    uncompressed_size: 100,
                    compressed_size: 50,
                },
                ..Default::default()
            },
            hash_type: HashType::Sha256,
            uncompressed_offset: 0,
        }]),
    };

    let unverified = file.verify(&out.join("foo.bin"), |_, _| {}).unwrap();
    assert!(unverified.is_empty());

    let progress = Progress::new(false);
    let report =
        download_file(&file, &out, DownloadOptions::default(), None, None, &progress).unwrap();
    assert!(report.is_complete());
}
