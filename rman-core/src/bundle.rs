//! Footer-indexed bundle files (`RBUN`).
//!
//! Layout: concatenated zstd frames, then `entry_count * 16` bytes of TOC,
//! then a fixed 20-byte footer at end-of-file. The footer checksum is
//! `XXH64(TOC, seed 0)`; legacy version-1 files store the bundle id in the
//! checksum slot instead and are accepted read-only.

use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};

use anyhow::{bail, Context, Result};
use xxhash_rust::xxh64::xxh64;

use crate::chunk::{BundleId, Chunk, ChunkId, ChunkSrc, CHUNK_LIMIT};
use crate::reader::Reader;

pub const MAGIC: [u8; 4] = *b"RBUN";
pub const VERSION: u32 = 0xFFFF_FFFF;
pub const FOOTER_SIZE: u64 = 20;
pub const TOC_ENTRY_SIZE: u64 = 16;

#[derive(Default, Debug)]
pub struct Bundle {
    /// Set only for legacy version-1 files, which carry their id in the
    /// checksum slot.
    pub bundle_id: BundleId,
    /// Length of the data region; the TOC starts here.
    pub toc_offset: u64,
    pub chunks: Vec<Chunk>,
    pub lookup: HashMap<ChunkId, ChunkSrc>,
}

impl Bundle {
    pub fn read(file: &mut File) -> Result<Bundle> {
        Self::read_with(file, false)
    }

    pub fn read_with(file: &mut File, no_lookup: bool) -> Result<Bundle> {
        let file_size = file.metadata().context("stat bundle")?.len();
        if file_size < FOOTER_SIZE {
            bail!("not a bundle: {} bytes is too short for a footer", file_size);
        }

        let footer = read_exact_at(file, file_size - FOOTER_SIZE, FOOTER_SIZE as usize)?;
        let mut r = Reader::new(&footer);
        let checksum: [u8; 8] = r.read_array().unwrap();
        let entry_count = r.read::<u32>().unwrap();
        let version = r.read::<u32>().unwrap();
        let magic: [u8; 4] = r.read_array().unwrap();
        if magic != MAGIC {
            bail!("not a bundle: bad footer magic");
        }
        if version != VERSION && version != 1 {
            bail!("unsupported bundle version {:#x}", version);
        }

        let toc_size = TOC_ENTRY_SIZE * entry_count as u64;
        if file_size < toc_size + FOOTER_SIZE {
            bail!("bundle TOC of {} entries does not fit the file", entry_count);
        }
        let toc_offset = file_size - FOOTER_SIZE - toc_size;
        let toc = read_exact_at(file, toc_offset, toc_size as usize)?;

        let bundle_id = if version == VERSION {
            let expect = xxh64(&toc, 0);
            if checksum != expect.to_le_bytes() {
                bail!("bundle TOC checksum mismatch");
            }
            BundleId::NONE
        } else {
            BundleId::from_raw(u64::from_le_bytes(checksum))
        };

        let mut r = Reader::new(&toc);
        let mut chunks = Vec::with_capacity(entry_count as usize);
        for _ in 0..entry_count {
            chunks.push(Chunk {
                id: ChunkId::from_raw(r.read::<u64>().unwrap()),
                uncompressed_size: r.read::<u32>().unwrap(),
                compressed_size: r.read::<u32>().unwrap(),
            });
        }

        let mut lookup = HashMap::new();
        if !no_lookup {
            lookup.reserve(chunks.len());
            let mut compressed_offset = 0u64;
            for chunk in &chunks {
                if compressed_offset + chunk.compressed_size as u64 > toc_offset {
                    bail!("chunk {} spills past the bundle data region", chunk.id);
                }
                if chunk.uncompressed_size > CHUNK_LIMIT {
                    bail!("chunk {} exceeds the uncompressed size limit", chunk.id);
                }
                if chunk.compressed_size as usize
                    > zstd::zstd_safe::compress_bound(chunk.uncompressed_size as usize)
                {
                    bail!("chunk {} compressed size exceeds the zstd bound", chunk.id);
                }
                lookup.insert(
                    chunk.id,
                    ChunkSrc { chunk: *chunk, bundle_id, compressed_offset },
                );
                compressed_offset += chunk.compressed_size as u64;
            }
        }

        Ok(Bundle { bundle_id, toc_offset, chunks, lookup })
    }
}

/// Serialize a TOC the way the footer checksums it.
pub fn encode_toc(chunks: &[Chunk]) -> Vec<u8> {
    let mut out = Vec::with_capacity(chunks.len() * TOC_ENTRY_SIZE as usize);
    for chunk in chunks {
        out.extend_from_slice(&chunk.id.raw().to_le_bytes());
        out.extend_from_slice(&chunk.uncompressed_size.to_le_bytes());
        out.extend_from_slice(&chunk.compressed_size.to_le_bytes());
    }
    out
}

pub fn encode_footer(toc: &[u8], entry_count: u32) -> [u8; FOOTER_SIZE as usize] {
    let mut out = [0u8; FOOTER_SIZE as usize];
    out[..8].copy_from_slice(&xxh64(toc, 0).to_le_bytes());
    out[8..12].copy_from_slice(&entry_count.to_le_bytes());
    out[12..16].copy_from_slice(&VERSION.to_le_bytes());
    out[16..20].copy_from_slice(&MAGIC);
    out
}

pub(crate) fn read_exact_at(f: &mut File, off: u64, len: usize) -> Result<Vec<u8>> {
    f.seek(SeekFrom::Start(off)).context("seek bundle")?;
    let mut buf = vec![0u8; len];
    f.read_exact(&mut buf).context("read bundle")?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_bundle(path: &std::path::Path, payloads: &[&[u8]]) -> Vec<Chunk> {
        let mut f = File::create(path).unwrap();
        let mut chunks = Vec::new();
        for p in payloads {
            let compressed = zstd::bulk::compress(p, 3).unwrap();
            f.write_all(&compressed).unwrap();
            chunks.push(Chunk {
                id: crate::chunk::hash(p, crate::chunk::HashType::RitoHkdf),
                uncompressed_size: p.len() as u32,
                compressed_size: compressed.len() as u32,
            });
        }
        let toc = encode_toc(&chunks);
        f.write_all(&toc).unwrap();
        f.write_all(&encode_footer(&toc, chunks.len() as u32)).unwrap();
        chunks
    }

    #[test]
    fn write_read_round_trip() {
        let td = tempfile::tempdir().unwrap();
        let path = td.path().join("a.bundle");
        let chunks = write_bundle(&path, &[b"first chunk data", b"second chunk data etc"]);

        let mut f = File::open(&path).unwrap();
        let bundle = Bundle::read(&mut f).unwrap();
        assert_eq!(bundle.chunks, chunks);
        assert!(bundle.bundle_id.is_none());

        let mut offset = 0u64;
        let mut total = 0u64;
        for c in &chunks {
            let src = bundle.lookup[&c.id];
            assert_eq!(src.compressed_offset, offset);
            offset += c.compressed_size as u64;
            total += c.compressed_size as u64;
        }
        assert_eq!(bundle.toc_offset, total);
    }

    #[test]
    fn short_file_and_bad_magic_rejected() {
        let td = tempfile::tempdir().unwrap();
        let path = td.path().join("bad.bundle");
        std::fs::write(&path, b"tiny").unwrap();
        assert!(Bundle::read(&mut File::open(&path).unwrap()).is_err());

        std::fs::write(&path, [0u8; 64]).unwrap();
        assert!(Bundle::read(&mut File::open(&path).unwrap()).is_err());
    }

    #[test]
    fn corrupt_toc_fails_checksum() {
        let td = tempfile::tempdir().unwrap();
        let path = td.path().join("c.bundle");
        write_bundle(&path, &[b"chunk payload"]);

        let mut raw = std::fs::read(&path).unwrap();
        let toc_start = raw.len() - FOOTER_SIZE as usize - TOC_ENTRY_SIZE as usize;
        raw[toc_start] ^= 0xFF;
        std::fs::write(&path, &raw).unwrap();

        let err = Bundle::read(&mut File::open(&path).unwrap()).unwrap_err();
        assert!(err.to_string().contains("checksum"));
    }

    #[test]
    fn legacy_version_carries_bundle_id() {
        let td = tempfile::tempdir().unwrap();
        let path = td.path().join("v1.bundle");
        let payload = b"legacy payload";
        let compressed = zstd::bulk::compress(payload, 3).unwrap();
        let chunk = Chunk {
            id: crate::chunk::hash(payload, crate::chunk::HashType::RitoHkdf),
            uncompressed_size: payload.len() as u32,
            compressed_size: compressed.len() as u32,
        };
        let toc = encode_toc(std::slice::from_ref(&chunk));
        let mut f = File::create(&path).unwrap();
        f.write_all(&compressed).unwrap();
        f.write_all(&toc).unwrap();
        f.write_all(&0xABCDu64.to_le_bytes()).unwrap();
        f.write_all(&1u32.to_le_bytes()).unwrap();
        f.write_all(&1u32.to_le_bytes()).unwrap();
        f.write_all(&MAGIC).unwrap();
        drop(f);

        let bundle = Bundle::read(&mut File::open(&path).unwrap()).unwrap();
        assert_eq!(bundle.bundle_id.raw(), 0xABCD);
        assert_eq!(bundle.chunks.len(), 1);
    }
}
