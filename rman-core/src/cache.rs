//! Local chunk cache: a rolling sequence of bundle files acting as one
//! content-addressed store.
//!
//! `base.bundle` is probed first, then `base.00001.bundle`, `base.00002…`
//! while files exist. Every file but the last is frozen; the last is the
//! active writer. Chunk sources are stamped with the file's sequence index
//! (cache-local, distinct from manifest bundle ids) and merged into one map,
//! later files shadowing earlier ones. Appends are buffered in memory; each
//! flush rewrites `[buffered data || TOC || footer]` at the current TOC
//! offset, so an interrupted run loses only the unflushed tail.

use std::collections::HashMap;
use std::fs::File;
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, ensure, Context, Result};
use fs2::FileExt;

use crate::bundle::{self, Bundle, FOOTER_SIZE, TOC_ENTRY_SIZE};
use crate::chunk::{self, BundleId, Chunk, ChunkDst, ChunkId, ChunkSrc, FileId, HashType};

const MIN_FLUSH_SIZE: u64 = 32 * 1024 * 1024;
/// Packed sidecar record: chunk id + (hash_type << 28 | uncompressed_size).
const PACKED_ENTRY_SIZE: usize = 12;

#[derive(Clone, Debug, Default)]
pub struct CacheOptions {
    pub path: PathBuf,
    pub readonly: bool,
    pub flush_size: u64,
    pub max_size: u64,
}

struct Writer {
    /// Absolute offset the next flush writes at: everything before it is
    /// already durable data.
    toc_offset: u64,
    /// Projected end of file after a flush (data + TOC + footer).
    end_offset: u64,
    chunks: Vec<Chunk>,
    buffer: Vec<u8>,
}

pub struct Cache {
    options: CacheOptions,
    files: Vec<File>,
    lookup: HashMap<ChunkId, ChunkSrc>,
    writer: Option<Writer>,
}

fn cache_file_path(base: &Path, index: usize) -> PathBuf {
    if index == 0 {
        return base.to_path_buf();
    }
    base.with_extension(format!("{:05}.bundle", index))
}

impl Cache {
    pub fn open(options: &CacheOptions) -> Result<Cache> {
        let mut options = options.clone();
        if !options.readonly {
            options.flush_size = options.flush_size.max(MIN_FLUSH_SIZE);
            // Keep one flush worth of slack below the cap so the final flush
            // of a file always fits.
            options.max_size =
                options.max_size.max(options.flush_size * 2) - options.flush_size;
        }

        let mut cache =
            Cache { options, files: Vec::new(), lookup: HashMap::new(), writer: None };
        loop {
            let index = cache.files.len();
            let path = cache_file_path(&cache.options.path, index);
            let next_exists = cache_file_path(&cache.options.path, index + 1).exists();
            let writable = !cache.options.readonly && !next_exists;

            let mut file = open_cache_file(&path, writable)?;
            let is_empty = file.metadata()?.len() == 0;
            let bundle = if is_empty {
                Bundle::default()
            } else {
                Bundle::read(&mut file).with_context(|| format!("read cache file {:?}", path))?
            };
            for (id, mut src) in bundle.lookup {
                src.bundle_id = BundleId::from_raw(index as u64);
                cache.lookup.insert(id, src);
            }
            cache.files.push(file);

            if writable {
                let toc_size = TOC_ENTRY_SIZE * bundle.chunks.len() as u64;
                cache.writer = Some(Writer {
                    toc_offset: bundle.toc_offset,
                    end_offset: bundle.toc_offset + toc_size + FOOTER_SIZE,
                    chunks: bundle.chunks,
                    buffer: Vec::new(),
                });
                if is_empty {
                    cache.flush()?;
                } else {
                    cache.check_space(cache.options.flush_size)?;
                }
            }

            if !next_exists {
                break;
            }
        }
        Ok(cache)
    }

    pub fn can_write(&self) -> bool {
        self.writer.is_some()
    }

    pub fn contains(&self, id: ChunkId) -> bool {
        self.lookup.contains_key(&id)
    }

    pub fn find(&self, id: ChunkId) -> Option<ChunkSrc> {
        self.lookup.get(&id).copied()
    }

    /// Stage a compressed chunk for the active writer. Returns `false` when
    /// the chunk is already cached (or carries the reserved id); the cache
    /// must be writable.
    pub fn add(&mut self, chunk: &Chunk, data: &[u8]) -> Result<bool> {
        ensure!(
            chunk.compressed_size as usize == data.len(),
            "chunk {} declared {} compressed bytes, got {}",
            chunk.id,
            chunk.compressed_size,
            data.len()
        );
        if chunk.id.is_none() || self.lookup.contains_key(&chunk.id) {
            return Ok(false);
        }
        if self.writer.is_none() {
            bail!("cache is read-only");
        }

        let extra = TOC_ENTRY_SIZE + data.len() as u64;
        self.check_space(extra)?;

        let seq = BundleId::from_raw(self.files.len() as u64 - 1);
        let writer = self.writer.as_mut().unwrap();
        writer.chunks.push(*chunk);
        self.lookup.insert(
            chunk.id,
            ChunkSrc {
                chunk: *chunk,
                bundle_id: seq,
                compressed_offset: writer.toc_offset + writer.buffer.len() as u64,
            },
        );
        writer.buffer.extend_from_slice(data);
        writer.end_offset += extra;
        if writer.buffer.len() as u64 > self.options.flush_size {
            self.flush()?;
        }
        Ok(true)
    }

    /// Hash, compress and stage raw bytes; a cache hit short-circuits before
    /// compressing.
    pub fn add_uncompressed(&mut self, data: &[u8], level: i32) -> Result<ChunkSrc> {
        let id = chunk::hash(data, HashType::RitoHkdf);
        if let Some(existing) = self.find(id) {
            ensure!(
                existing.uncompressed_size() as usize == data.len(),
                "chunk {} cached with a different size",
                id
            );
            return Ok(existing);
        }
        let compressed = zstd::bulk::compress(data, level).context("compress chunk")?;
        let chunk = Chunk {
            id,
            uncompressed_size: data.len() as u32,
            compressed_size: compressed.len() as u32,
        };
        ensure!(self.add(&chunk, &compressed)?, "freshly hashed chunk {} refused", id);
        Ok(self.find(id).unwrap())
    }

    /// Decompress and deliver every resolvable chunk; the unresolved subset
    /// comes back. Runs of identical ids share one decompression.
    pub fn get(
        &mut self,
        chunks: Vec<ChunkDst>,
        mut on_data: impl FnMut(&ChunkDst, &[u8]),
    ) -> Result<Vec<ChunkDst>> {
        let mut missing = Vec::new();
        let mut found = Vec::new();
        for mut chunk in chunks {
            match self.find(chunk.id()) {
                Some(src) if !chunk.id().is_none() => {
                    ensure!(
                        src.uncompressed_size() == chunk.uncompressed_size(),
                        "chunk {} cached with a different size",
                        chunk.id()
                    );
                    chunk.src = src;
                    found.push(chunk);
                }
                _ => missing.push(chunk),
            }
        }
        found.sort_by_key(|c| (c.compressed_offset(), c.uncompressed_offset));

        let mut last_id = ChunkId::NONE;
        let mut last_data = Vec::new();
        for chunk in &found {
            if chunk.id() != last_id {
                let compressed = self.read_compressed(&chunk.src)?;
                last_data =
                    zstd::bulk::decompress(&compressed, chunk.uncompressed_size() as usize)
                        .with_context(|| format!("decompress cached chunk {}", chunk.id()))?;
                last_id = chunk.id();
            }
            on_data(chunk, &last_data);
        }
        Ok(missing)
    }

    /// Register a file's chunk list under the sidecar index: the packed list
    /// is stored as an ordinary chunk and its id becomes the file id.
    pub fn add_chunks(&mut self, chunks: &[ChunkDst], level: i32) -> Result<FileId> {
        let mut packed = Vec::with_capacity(chunks.len() * PACKED_ENTRY_SIZE);
        for c in chunks {
            packed.extend_from_slice(&c.id().raw().to_le_bytes());
            let word = (c.uncompressed_size() & 0x0FFF_FFFF) | ((c.hash_type as u32) << 28);
            packed.extend_from_slice(&word.to_le_bytes());
        }
        let src = self.add_uncompressed(&packed, level)?;
        Ok(FileId::from_raw(src.id().raw()))
    }

    /// Resolve a stripped file's chunk list from the sidecar index, with
    /// uncompressed offsets rebuilt by prefix sum.
    pub fn get_chunks(&mut self, file_id: FileId) -> Result<Vec<ChunkDst>> {
        let id = ChunkId::from_raw(file_id.raw());
        let src = self
            .find(id)
            .with_context(|| format!("no packed chunk list for file {}", file_id))?;
        let compressed = self.read_compressed(&src)?;
        let packed = zstd::bulk::decompress(&compressed, src.uncompressed_size() as usize)
            .context("decompress packed chunk list")?;
        ensure!(packed.len() % PACKED_ENTRY_SIZE == 0, "packed chunk list length invalid");

        let mut out = Vec::with_capacity(packed.len() / PACKED_ENTRY_SIZE);
        let mut uncompressed_offset = 0u64;
        for rec in packed.chunks(PACKED_ENTRY_SIZE) {
            let id = ChunkId::from_raw(u64::from_le_bytes(rec[..8].try_into().unwrap()));
            let word = u32::from_le_bytes(rec[8..12].try_into().unwrap());
            let hash_type = HashType::from_u8((word >> 28) as u8)
                .context("packed chunk list hash type invalid")?;
            let uncompressed_size = word & 0x0FFF_FFFF;
            out.push(ChunkDst {
                src: ChunkSrc {
                    chunk: Chunk { id, uncompressed_size, compressed_size: 0 },
                    ..Default::default()
                },
                hash_type,
                uncompressed_offset,
            });
            uncompressed_offset += uncompressed_size as u64;
        }
        Ok(out)
    }

    fn read_compressed(&mut self, src: &ChunkSrc) -> Result<Vec<u8>> {
        let index = src.bundle_id.raw() as usize;
        ensure!(index < self.files.len(), "chunk {} points at a missing cache file", src.id());
        if let Some(writer) = &self.writer {
            if index == self.files.len() - 1 && src.compressed_offset >= writer.toc_offset {
                let start = (src.compressed_offset - writer.toc_offset) as usize;
                let end = start + src.compressed_size() as usize;
                ensure!(end <= writer.buffer.len(), "buffered chunk {} out of range", src.id());
                return Ok(writer.buffer[start..end].to_vec());
            }
        }
        bundle::read_exact_at(
            &mut self.files[index],
            src.compressed_offset,
            src.compressed_size() as usize,
        )
    }

    /// Roll over to a fresh cache file once the active one cannot take
    /// `extra` more bytes. Never rolls an empty file.
    fn check_space(&mut self, extra: u64) -> Result<bool> {
        let Some(writer) = &self.writer else { return Ok(false) };
        if writer.end_offset <= FOOTER_SIZE {
            return Ok(false);
        }
        if writer.end_offset + extra < self.options.max_size {
            return Ok(false);
        }
        self.flush()?;

        let index = self.files.len();
        let path = cache_file_path(&self.options.path, index);
        let file = open_cache_file(&path, true)?;
        file.set_len(0)?;
        self.files.push(file);
        let writer = self.writer.as_mut().unwrap();
        writer.toc_offset = 0;
        writer.end_offset = FOOTER_SIZE;
        writer.chunks.clear();
        writer.buffer.clear();
        self.flush()?;
        Ok(true)
    }

    /// Write `[buffered data || TOC || footer]` starting at the current TOC
    /// offset, then advance past the data. The footer lands last, so the
    /// previous one stays valid until this flush completes; the buffer is
    /// kept intact unless every write succeeded.
    pub fn flush(&mut self) -> Result<bool> {
        let Some(writer) = &mut self.writer else { return Ok(false) };
        if writer.buffer.is_empty() && writer.toc_offset != 0 {
            return Ok(false);
        }
        let toc = bundle::encode_toc(&writer.chunks);
        let footer = bundle::encode_footer(&toc, writer.chunks.len() as u32);
        let new_toc_offset = writer.toc_offset + writer.buffer.len() as u64;

        let file = self.files.last_mut().unwrap();
        file.seek(SeekFrom::Start(writer.toc_offset)).context("seek cache writer")?;
        file.write_all(&writer.buffer).context("flush cache data")?;
        file.write_all(&toc).context("flush cache TOC")?;
        file.write_all(&footer).context("flush cache footer")?;
        writer.buffer.clear();
        writer.toc_offset = new_toc_offset;
        Ok(true)
    }
}

impl Drop for Cache {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

fn open_cache_file(path: &Path, writable: bool) -> Result<File> {
    if writable {
        let file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .with_context(|| format!("open cache file {:?}", path))?;
        file.try_lock_exclusive()
            .with_context(|| format!("lock cache file {:?}", path))?;
        Ok(file)
    } else {
        File::open(path).with_context(|| format!("open cache file {:?}", path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(path: &Path) -> CacheOptions {
        CacheOptions {
            path: path.to_path_buf(),
            readonly: false,
            flush_size: 0,
            max_size: 0,
        }
    }

    #[test]
    fn add_is_idempotent() {
        let td = tempfile::tempdir().unwrap();
        let mut cache = Cache::open(&options(&td.path().join("c.bundle"))).unwrap();
        let data = b"idempotent chunk".to_vec();
        let first = cache.add_uncompressed(&data, 3).unwrap();
        let second = cache.add_uncompressed(&data, 3).unwrap();
        assert_eq!(first.id(), second.id());
        assert_eq!(first.compressed_offset, second.compressed_offset);
        assert!(cache.contains(first.id()));
    }

    #[test]
    fn durable_after_reopen() {
        let td = tempfile::tempdir().unwrap();
        let path = td.path().join("c.bundle");
        let payload = vec![0x5Au8; 4096];
        let id = {
            let mut cache = Cache::open(&options(&path)).unwrap();
            cache.add_uncompressed(&payload, 3).unwrap().id()
            // Drop flushes.
        };

        let mut cache = Cache::open(&CacheOptions {
            path: path.clone(),
            readonly: true,
            ..Default::default()
        })
        .unwrap();
        let src = cache.find(id).unwrap();
        assert_eq!(src.uncompressed_size() as usize, payload.len());

        let dst = ChunkDst {
            src,
            hash_type: HashType::RitoHkdf,
            uncompressed_offset: 0,
        };
        let mut delivered = Vec::new();
        let missing = cache.get(vec![dst], |_, data| delivered = data.to_vec()).unwrap();
        assert!(missing.is_empty());
        assert_eq!(delivered, payload);
    }

    #[test]
    fn unflushed_chunks_are_readable_from_the_buffer() {
        let td = tempfile::tempdir().unwrap();
        let mut cache = Cache::open(&options(&td.path().join("c.bundle"))).unwrap();
        let payload = vec![0x11u8; 1000];
        let src = cache.add_uncompressed(&payload, 3).unwrap();
        let dst = ChunkDst { src, hash_type: HashType::RitoHkdf, uncompressed_offset: 0 };
        let mut delivered = Vec::new();
        let missing = cache.get(vec![dst], |_, data| delivered = data.to_vec()).unwrap();
        assert!(missing.is_empty());
        assert_eq!(delivered, payload);
    }

    #[test]
    fn readonly_cache_refuses_writes() {
        let td = tempfile::tempdir().unwrap();
        let path = td.path().join("c.bundle");
        drop(Cache::open(&options(&path)).unwrap());

        let mut cache = Cache::open(&CacheOptions {
            path,
            readonly: true,
            ..Default::default()
        })
        .unwrap();
        assert!(!cache.can_write());
        assert!(cache.add_uncompressed(b"nope", 3).is_err());
    }

    #[test]
    fn duplicate_ids_share_one_decompression() {
        let td = tempfile::tempdir().unwrap();
        let mut cache = Cache::open(&options(&td.path().join("c.bundle"))).unwrap();
        let payload = vec![0x77u8; 512];
        let src = cache.add_uncompressed(&payload, 3).unwrap();

        // Two destinations referencing the same chunk id.
        let requests = vec![
            ChunkDst { src, hash_type: HashType::RitoHkdf, uncompressed_offset: 0 },
            ChunkDst { src, hash_type: HashType::RitoHkdf, uncompressed_offset: 512 },
        ];
        let mut offsets = Vec::new();
        let missing = cache
            .get(requests, |c, data| {
                assert_eq!(data, &payload[..]);
                offsets.push(c.uncompressed_offset);
            })
            .unwrap();
        assert!(missing.is_empty());
        assert_eq!(offsets, vec![0, 512]);
    }

    #[test]
    fn sidecar_chunk_lists_round_trip() {
        let td = tempfile::tempdir().unwrap();
        let mut cache = Cache::open(&options(&td.path().join("c.bundle"))).unwrap();
        let a = cache.add_uncompressed(&vec![1u8; 300], 3).unwrap();
        let b = cache.add_uncompressed(&vec![2u8; 200], 3).unwrap();
        let chunks = vec![
            ChunkDst { src: a, hash_type: HashType::RitoHkdf, uncompressed_offset: 0 },
            ChunkDst { src: b, hash_type: HashType::RitoHkdf, uncompressed_offset: 300 },
        ];
        let file_id = cache.add_chunks(&chunks, 3).unwrap();
        let back = cache.get_chunks(file_id).unwrap();
        assert_eq!(back.len(), 2);
        assert_eq!(back[0].id(), a.id());
        assert_eq!(back[1].id(), b.id());
        assert_eq!(back[0].uncompressed_offset, 0);
        assert_eq!(back[1].uncompressed_offset, 300);
        assert_eq!(back[1].hash_type, HashType::RitoHkdf);
    }

    #[test]
    fn unknown_chunks_are_returned_unresolved() {
        let td = tempfile::tempdir().unwrap();
        let mut cache = Cache::open(&options(&td.path().join("c.bundle"))).unwrap();
        let dst = ChunkDst {
            src: ChunkSrc {
                chunk: Chunk {
                    id: ChunkId::from_raw(0x1234),
                    uncompressed_size: 10,
                    compressed_size: 0,
                },
                ..Default::default()
            },
            hash_type: HashType::RitoHkdf,
            uncompressed_offset: 0,
        };
        let missing = cache.get(vec![dst], |_, _| panic!("nothing cached")).unwrap();
        assert_eq!(missing.len(), 1);
    }
}
