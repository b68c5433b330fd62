//! Binary manifest (`RMAN`) decoding.
//!
//! A 28-byte envelope wraps a single zstd frame holding a flat-buffer style
//! table-of-tables body: every table starts with a signed offset to its
//! vtable, every reference field holds a signed offset relative to the slot
//! it is read from, and a zero vtable slot means "absent" (scalars decode as
//! zero, strings as empty). Table indices are fixed: 0 bundles, 1 languages,
//! 2 files, 3 directories, 4 encryption keys, 5 chunking parameters.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use anyhow::{bail, ensure, Context, Result};
use memmap2::Mmap;

use crate::chunk::{
    BundleId, Chunk, ChunkDst, ChunkId, ChunkSrc, FileId, HashType, ManifestId, CHUNK_LIMIT,
};
use crate::file::RFile;
use crate::reader::{Le, Reader};

pub const MAGIC: [u8; 4] = *b"RMAN";
pub const HEADER_SIZE: usize = 28;
/// Hard cap on any string stored in a manifest body.
const STRING_LIMIT: i64 = 4096;

#[derive(Debug)]
pub struct Manifest {
    pub manifest_id: ManifestId,
    pub files: Vec<RFile>,
    pub bundles: Vec<ManifestBundle>,
}

#[derive(Debug)]
pub struct ManifestBundle {
    pub bundle_id: BundleId,
    pub chunks: Vec<Chunk>,
}

/// Per-file chunking parameters (table 5). The unknown fields are carried but
/// never acted on.
#[derive(Clone, Copy, Debug)]
pub struct ChunkingParams {
    pub unk0: u16,
    pub hash_type: HashType,
    pub unk2: u8,
    pub unk3: u32,
    pub max_uncompressed: u32,
}

impl Manifest {
    pub fn read(data: &[u8]) -> Result<Manifest> {
        let header = Header::parse(data)?;
        let start = header.offset as usize;
        let body = zstd::bulk::decompress(
            &data[start..start + header.length as usize],
            header.body_length as usize,
        )
        .context("decompress manifest body")?;
        ensure!(
            body.len() == header.body_length as usize,
            "manifest body decompressed to {} bytes, header says {}",
            body.len(),
            header.body_length
        );
        let (files, bundles) = Decoder { body: Body { data: &body } }.parse()?;
        Ok(Manifest { manifest_id: header.manifest_id, files, bundles })
    }

    pub fn read_file(path: &Path) -> Result<Manifest> {
        let file = std::fs::File::open(path).with_context(|| format!("open {:?}", path))?;
        let map = unsafe { Mmap::map(&file) }.with_context(|| format!("map {:?}", path))?;
        Self::read(&map).with_context(|| format!("parse manifest {:?}", path))
    }
}

struct Header {
    manifest_id: ManifestId,
    offset: u32,
    length: u32,
    body_length: u32,
}

impl Header {
    fn parse(data: &[u8]) -> Result<Header> {
        ensure!(data.len() >= HEADER_SIZE, "manifest too short for its header");
        let mut r = Reader::new(data);
        let magic: [u8; 4] = r.read_array().unwrap();
        ensure!(magic == MAGIC, "not a manifest: bad magic");
        let version_major = r.read::<u8>().unwrap();
        let _version_minor = r.read::<u8>().unwrap();
        let _flags = r.read::<u16>().unwrap();
        let offset = r.read::<u32>().unwrap();
        let length = r.read::<u32>().unwrap();
        let manifest_id = ManifestId::from_raw(r.read::<u64>().unwrap());
        let body_length = r.read::<u32>().unwrap();
        ensure!(version_major == 2, "unsupported manifest version {}", version_major);
        ensure!(length >= 4 && body_length >= 4, "manifest body too small");
        ensure!(offset as usize <= data.len(), "manifest body offset out of bounds");
        ensure!(
            length as usize <= data.len() - offset as usize,
            "manifest body length out of bounds"
        );
        Ok(Header { manifest_id, offset, length, body_length })
    }
}

/// Decompressed body with bounds-checked signed-offset access.
#[derive(Clone, Copy)]
struct Body<'a> {
    data: &'a [u8],
}

/// A decoded table: absolute position plus its vtable field offsets.
struct Table {
    pos: i64,
    fields: Vec<u16>,
}

impl Table {
    /// Absolute position of field `index`, or `None` when absent.
    fn field(&self, index: usize) -> Option<i64> {
        match self.fields.get(index) {
            Some(&off) if off != 0 => Some(self.pos + off as i64),
            _ => None,
        }
    }
}

impl<'a> Body<'a> {
    fn len(&self) -> i64 {
        self.data.len() as i64
    }

    fn raw<T: Le>(&self, pos: i64) -> Result<T> {
        ensure!(
            pos >= 0 && pos + T::SIZE as i64 <= self.len(),
            "manifest body read out of bounds at {}",
            pos
        );
        Ok(T::from_le(&self.data[pos as usize..pos as usize + T::SIZE]))
    }

    /// Scalar field; absent decodes to the type's zero value.
    fn scalar<T: Le + Default>(&self, off: Option<i64>) -> Result<T> {
        match off {
            Some(pos) => self.raw(pos),
            None => Ok(T::default()),
        }
    }

    /// Follow the signed relative offset stored at `off`. A zero stored
    /// offset means the target is absent.
    fn deref(&self, off: Option<i64>) -> Result<Option<i64>> {
        let Some(pos) = off else { return Ok(None) };
        let rel = self.raw::<i32>(pos)? as i64;
        if rel == 0 {
            return Ok(None);
        }
        let target = pos + rel;
        ensure!(target >= 0 && target <= self.len(), "manifest offset escapes the body");
        Ok(Some(target))
    }

    fn string(&self, off: Option<i64>) -> Result<String> {
        let Some(pos) = self.deref(off)? else { return Ok(String::new()) };
        let size = self.raw::<i32>(pos)? as i64;
        if size == 0 {
            return Ok(String::new());
        }
        ensure!((0..=STRING_LIMIT).contains(&size), "manifest string length {} invalid", size);
        ensure!(pos + 4 + size <= self.len(), "manifest string out of bounds");
        let bytes = &self.data[(pos + 4) as usize..(pos + 4 + size) as usize];
        Ok(String::from_utf8_lossy(bytes).into_owned())
    }

    fn table(&self, off: Option<i64>) -> Result<Table> {
        let Some(pos) = self.deref(off)? else { bail!("required manifest table is absent") };
        let rel = self.raw::<i32>(pos)? as i64;
        let vtable = pos - rel;
        ensure!(vtable >= 0 && vtable <= self.len(), "manifest vtable escapes the body");
        let vtable_size = self.raw::<u16>(vtable)? as i64;
        ensure!(
            vtable_size >= 4 && vtable_size % 2 == 0,
            "manifest vtable size {} malformed",
            vtable_size
        );
        ensure!(vtable + vtable_size <= self.len(), "manifest vtable out of bounds");
        let _struct_size = self.raw::<u16>(vtable + 2)?;
        let count = (vtable_size - 4) / 2;
        let mut fields = Vec::with_capacity(count as usize);
        for i in 0..count {
            fields.push(self.raw::<u16>(vtable + 4 + 2 * i)?);
        }
        Ok(Table { pos, fields })
    }

    fn scalars<T: Le + Default>(&self, off: Option<i64>) -> Result<Vec<T>> {
        let Some(pos) = self.deref(off)? else { return Ok(Vec::new()) };
        let count = self.raw::<i32>(pos)? as i64;
        if count == 0 {
            return Ok(Vec::new());
        }
        ensure!(count >= 0, "manifest vector count negative");
        ensure!(pos + 4 + count * T::SIZE as i64 <= self.len(), "manifest vector out of bounds");
        let mut out = Vec::with_capacity(count as usize);
        for i in 0..count {
            out.push(self.raw(pos + 4 + i * T::SIZE as i64)?);
        }
        Ok(out)
    }

    fn tables(&self, off: Option<i64>) -> Result<Vec<Table>> {
        let Some(pos) = self.deref(off)? else { return Ok(Vec::new()) };
        let count = self.raw::<i32>(pos)? as i64;
        if count == 0 {
            return Ok(Vec::new());
        }
        ensure!(count >= 0, "manifest vector count negative");
        ensure!(pos + 4 + count * 4 <= self.len(), "manifest vector out of bounds");
        let mut out = Vec::with_capacity(count as usize);
        for i in 0..count {
            out.push(self.table(Some(pos + 4 + i * 4))?);
        }
        Ok(out)
    }
}

struct Decoder<'a> {
    body: Body<'a>,
}

impl<'a> Decoder<'a> {
    fn parse(self) -> Result<(Vec<RFile>, Vec<ManifestBundle>)> {
        let root = self.body.table(Some(0)).context("manifest root table")?;
        let langs = self.parse_langs(&root).context("manifest language table")?;
        let dirs = self.parse_dirs(&root).context("manifest directory table")?;
        let params = self.parse_params(&root).context("manifest chunking parameters")?;
        self.check_keys(&root).context("manifest key table")?;
        let (bundles, chunk_lookup) = self.parse_bundles(&root).context("manifest bundle table")?;
        let files = self
            .parse_files(&root, &langs, &dirs, &params, &chunk_lookup)
            .context("manifest file table")?;
        Ok((files, bundles))
    }

    fn parse_langs(&self, root: &Table) -> Result<HashMap<u8, String>> {
        let mut out = HashMap::new();
        for table in self.body.tables(root.field(1))? {
            let id: u8 = self.body.scalar(table.field(0))?;
            let name = self.body.string(table.field(1))?;
            ensure!(
                !name.is_empty()
                    && name.chars().all(|c| c.is_ascii_alphanumeric() || "._-".contains(c)),
                "language name {:?} malformed",
                name
            );
            out.insert(id, name);
        }
        Ok(out)
    }

    fn parse_dirs(&self, root: &Table) -> Result<HashMap<u64, (String, u64)>> {
        let mut out = HashMap::new();
        for table in self.body.tables(root.field(3))? {
            let id: u64 = self.body.scalar(table.field(0))?;
            let parent: u64 = self.body.scalar(table.field(1))?;
            let mut name = self.body.string(table.field(2))?;
            ensure!(name != "." && name != "..", "directory name {:?} not allowed", name);
            if !name.is_empty() && !name.ends_with('/') {
                name.push('/');
            }
            out.insert(id, (name, parent));
        }
        Ok(out)
    }

    fn parse_params(&self, root: &Table) -> Result<Vec<ChunkingParams>> {
        let mut out = Vec::new();
        for table in self.body.tables(root.field(5))? {
            let unk0: u16 = self.body.scalar(table.field(0))?;
            let hash_raw: u8 = self.body.scalar(table.field(1))?;
            let unk2: u8 = self.body.scalar(table.field(2))?;
            let unk3: u32 = self.body.scalar(table.field(3))?;
            let max_uncompressed: u32 = self.body.scalar(table.field(4))?;
            let hash_type = HashType::from_u8(hash_raw)
                .filter(|h| *h != HashType::None)
                .with_context(|| format!("chunking hash type {} unsupported", hash_raw))?;
            out.push(ChunkingParams { unk0, hash_type, unk2, unk3, max_uncompressed });
        }
        Ok(out)
    }

    /// The key table is reserved; any populated entry is a decode error.
    fn check_keys(&self, root: &Table) -> Result<()> {
        let keys = self.body.tables(root.field(4))?;
        ensure!(keys.is_empty(), "manifest carries {} encryption keys", keys.len());
        Ok(())
    }

    #[allow(clippy::type_complexity)]
    fn parse_bundles(
        &self,
        root: &Table,
    ) -> Result<(Vec<ManifestBundle>, HashMap<ChunkId, ChunkSrc>)> {
        let mut bundles = Vec::new();
        let mut lookup = HashMap::new();
        for table in self.body.tables(root.field(0))? {
            let bundle_id = BundleId::from_raw(self.body.scalar(table.field(0))?);
            ensure!(!bundle_id.is_none(), "bundle id is the reserved zero value");
            let mut chunks = Vec::new();
            let mut compressed_offset = 0u64;
            for chunk_table in self.body.tables(table.field(1))? {
                let id = ChunkId::from_raw(self.body.scalar(chunk_table.field(0))?);
                let compressed_size: u32 = self.body.scalar(chunk_table.field(1))?;
                let uncompressed_size: u32 = self.body.scalar(chunk_table.field(2))?;
                ensure!(!id.is_none(), "chunk id is the reserved zero value");
                ensure!(uncompressed_size <= CHUNK_LIMIT, "chunk {} too large", id);
                ensure!(
                    compressed_size as usize
                        <= zstd::zstd_safe::compress_bound(uncompressed_size as usize),
                    "chunk {} compressed size exceeds the zstd bound",
                    id
                );
                let chunk = Chunk { id, uncompressed_size, compressed_size };
                lookup.insert(id, ChunkSrc { chunk, bundle_id, compressed_offset });
                chunks.push(chunk);
                compressed_offset += compressed_size as u64;
            }
            bundles.push(ManifestBundle { bundle_id, chunks });
        }
        Ok((bundles, lookup))
    }

    fn parse_files(
        &self,
        root: &Table,
        langs: &HashMap<u8, String>,
        dirs: &HashMap<u64, (String, u64)>,
        params: &[ChunkingParams],
        chunk_lookup: &HashMap<ChunkId, ChunkSrc>,
    ) -> Result<Vec<RFile>> {
        let mut files = Vec::new();
        let mut visited = HashSet::new();
        for table in self.body.tables(root.field(2))? {
            let file_id = FileId::from_raw(self.body.scalar(table.field(0))?);
            let mut dir_id: u64 = self.body.scalar(table.field(1))?;
            let size: u32 = self.body.scalar(table.field(2))?;
            let name = self.body.string(table.field(3))?;
            let locale_flags: u64 = self.body.scalar(table.field(4))?;
            let _unk5: u8 = self.body.scalar(table.field(5))?;
            let _unk6: u8 = self.body.scalar(table.field(6))?;
            let chunk_ids: Vec<u64> = self.body.scalars(table.field(7))?;
            let _app_flag: u8 = self.body.scalar(table.field(8))?;
            let link = self.body.string(table.field(9))?;
            let _unk10: u8 = self.body.scalar(table.field(10))?;
            let params_index: u8 = self.body.scalar(table.field(11))?;
            let permissions: u8 = self.body.scalar(table.field(12))?;

            ensure!(!file_id.is_none(), "file id is the reserved zero value");
            ensure!(!name.is_empty(), "file {} has an empty name", file_id);
            let param = params.get(params_index as usize).with_context(|| {
                format!("file {} references missing params {}", file_id, params_index)
            })?;

            // Walk the parent chain lazily per file; cycles are malformed
            // input, caught by the visited set.
            let mut path = name;
            visited.clear();
            while dir_id != 0 {
                ensure!(path.len() < 256, "file {} path exceeds 256 bytes", file_id);
                ensure!(
                    visited.insert(dir_id),
                    "directory {} participates in a parent cycle",
                    dir_id
                );
                let (dir_name, parent) = dirs.get(&dir_id).with_context(|| {
                    format!("file {} references missing dir {}", file_id, dir_id)
                })?;
                if !dir_name.is_empty() {
                    path.insert_str(0, dir_name);
                }
                dir_id = *parent;
            }

            let mut file_langs = String::new();
            for bit in 0..32u8 {
                if locale_flags & (1u64 << bit) == 0 {
                    continue;
                }
                let lang = langs.get(&(bit + 1)).with_context(|| {
                    format!("file {} references missing lang {}", file_id, bit + 1)
                })?;
                if !file_langs.is_empty() {
                    file_langs.push(';');
                }
                file_langs.push_str(lang);
            }
            if file_langs.is_empty() {
                file_langs.push_str("none");
            }

            let mut chunks = Vec::with_capacity(chunk_ids.len());
            let mut uncompressed_offset = 0u64;
            for raw_id in chunk_ids {
                let id = ChunkId::from_raw(raw_id);
                let src = chunk_lookup
                    .get(&id)
                    .with_context(|| format!("file {} references unknown chunk {}", file_id, id))?;
                chunks.push(ChunkDst { src: *src, hash_type: param.hash_type, uncompressed_offset });
                uncompressed_offset += src.uncompressed_size() as u64;
                ensure!(
                    uncompressed_offset <= size as u64,
                    "file {} chunks overflow its size",
                    file_id
                );
            }

            files.push(RFile {
                file_id,
                permissions,
                size: size as u64,
                path,
                link,
                langs: file_langs,
                time: 0,
                chunks: Some(chunks),
            });
        }
        Ok(files)
    }
}
