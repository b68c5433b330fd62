//! Manifest file records: on-disk verification and the line-delimited JRMAN
//! dump format (plus its zstd-framed ZRMAN variant).

use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use anyhow::{bail, ensure, Context, Result};
use serde::{Deserialize, Serialize};

use crate::chunk::{self, Chunk, ChunkDst, ChunkSrc, FileId, HashType};
use crate::manifest::Manifest;

/// First line of every JRMAN stream.
pub const JRMAN_MARKER: &str = "JRMAN";
/// zstd frame magic; a manifest starting with it is ZRMAN.
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];
/// Streaming window for ZRMAN decoding; lines are carried across windows.
const ZRMAN_WINDOW: usize = (128 + 32) * 1024 * 1024;

#[derive(Clone, Debug, Default)]
pub struct RFile {
    pub file_id: FileId,
    pub permissions: u8,
    pub size: u64,
    pub path: String,
    pub link: String,
    pub langs: String,
    pub time: u64,
    /// `None` when the chunk list was stripped and must be fetched through
    /// the cache's sidecar index keyed by `file_id`.
    pub chunks: Option<Vec<ChunkDst>>,
}

/// Path / language filter for selecting files out of a manifest.
/// Patterns are case-insensitive substring matches.
#[derive(Clone, Debug, Default)]
pub struct Match {
    pub path: Option<String>,
    pub langs: Option<String>,
}

impl Match {
    pub fn matches(&self, file: &RFile) -> bool {
        fn contains_ci(haystack: &str, needle: &str) -> bool {
            haystack.to_ascii_lowercase().contains(&needle.to_ascii_lowercase())
        }
        if let Some(pat) = &self.path {
            if !contains_ci(&file.path, pat) {
                return false;
            }
        }
        if let Some(pat) = &self.langs {
            if !contains_ci(&file.langs, pat) {
                return false;
            }
        }
        true
    }
}

#[derive(Serialize, Deserialize)]
struct ChunkRecord {
    #[serde(rename = "chunkId")]
    chunk_id: String,
    hash_type: u8,
    uncompressed_size: u32,
}

#[derive(Serialize, Deserialize)]
struct FileRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    chunks: Option<Vec<ChunkRecord>>,
    #[serde(rename = "fileId")]
    file_id: String,
    langs: String,
    link: String,
    path: String,
    permissions: u8,
    size: u64,
    #[serde(default, skip_serializing_if = "is_zero")]
    time: u64,
}

fn is_zero(v: &u64) -> bool {
    *v == 0
}

impl RFile {
    /// Serialize as one compact JRMAN line (newline included).
    pub fn dump(&self) -> Result<String> {
        let record = FileRecord {
            chunks: self.chunks.as_ref().map(|chunks| {
                chunks
                    .iter()
                    .map(|c| ChunkRecord {
                        chunk_id: c.id().to_string(),
                        hash_type: c.hash_type as u8,
                        uncompressed_size: c.uncompressed_size(),
                    })
                    .collect()
            }),
            file_id: self.file_id.to_string(),
            langs: self.langs.clone(),
            link: self.link.clone(),
            path: self.path.clone(),
            permissions: self.permissions,
            size: self.size,
            time: self.time,
        };
        let mut line = serde_json::to_string(&record).context("serialize file record")?;
        line.push('\n');
        Ok(line)
    }

    /// Parse one JRMAN line. `uncompressed_offset` is not stored on the wire;
    /// it is rebuilt by prefix sum, and the total must equal the file size.
    pub fn undump(line: &str) -> Result<RFile> {
        let record: FileRecord =
            serde_json::from_str(line).context("parse JRMAN file record")?;
        let file_id = FileId::from_hex(&record.file_id)
            .with_context(|| format!("file id {:?} is not hex", record.file_id))?;
        let chunks = match record.chunks {
            None => None,
            Some(records) => {
                let mut chunks = Vec::with_capacity(records.len());
                let mut uncompressed_offset = 0u64;
                for r in records {
                    let id = chunk::ChunkId::from_hex(&r.chunk_id)
                        .with_context(|| format!("chunk id {:?} is not hex", r.chunk_id))?;
                    let hash_type = HashType::from_u8(r.hash_type)
                        .with_context(|| format!("hash type {} unknown", r.hash_type))?;
                    chunks.push(ChunkDst {
                        src: ChunkSrc {
                            chunk: Chunk {
                                id,
                                uncompressed_size: r.uncompressed_size,
                                compressed_size: 0,
                            },
                            ..Default::default()
                        },
                        hash_type,
                        uncompressed_offset,
                    });
                    uncompressed_offset += r.uncompressed_size as u64;
                }
                ensure!(
                    uncompressed_offset == record.size,
                    "chunk sizes sum to {}, file says {}",
                    uncompressed_offset,
                    record.size
                );
                Some(chunks)
            }
        };
        Ok(RFile {
            file_id,
            permissions: record.permissions,
            size: record.size,
            path: record.path,
            link: record.link,
            langs: record.langs,
            time: record.time,
            chunks,
        })
    }

    /// Check the file on disk chunk by chunk. Verified chunks are handed to
    /// `on_data`; the unverified remainder comes back in original order. Once
    /// a chunk does not fit the on-disk size, it and everything after it is
    /// unverified without further reads.
    pub fn verify(
        &self,
        path: &Path,
        mut on_data: impl FnMut(&ChunkDst, &[u8]),
    ) -> Result<Vec<ChunkDst>> {
        let chunks = self
            .chunks
            .as_ref()
            .with_context(|| format!("file {} has no chunk list to verify", self.file_id))?;
        if !path.exists() {
            return Ok(chunks.clone());
        }
        let mut file =
            File::open(path).with_context(|| format!("open {:?} for verify", path))?;
        let disk_size = file.metadata()?.len();

        let mut unverified = Vec::new();
        let mut failfast = false;
        for chunk in chunks {
            if failfast {
                unverified.push(*chunk);
                continue;
            }
            let end = chunk.uncompressed_offset + chunk.uncompressed_size() as u64;
            if end > disk_size {
                failfast = true;
                unverified.push(*chunk);
                continue;
            }
            let data = crate::bundle::read_exact_at(
                &mut file,
                chunk.uncompressed_offset,
                chunk.uncompressed_size() as usize,
            )?;
            if chunk::hash(&data, chunk.hash_type) == chunk.id() {
                on_data(chunk, &data);
            } else {
                unverified.push(*chunk);
            }
        }
        Ok(unverified)
    }

    /// Read any accepted manifest format, invoking `cb` per file until it
    /// returns `false`. Returns the manifest id for binary manifests.
    pub fn read(
        data: &[u8],
        cb: &mut dyn FnMut(RFile) -> bool,
    ) -> Result<Option<crate::chunk::ManifestId>> {
        ensure!(data.len() >= 5, "manifest is too short to identify");
        if &data[..5] == JRMAN_MARKER.as_bytes() {
            read_jrman(data, cb)?;
            return Ok(None);
        }
        if data[..4] == ZSTD_MAGIC {
            read_zrman(data, cb)?;
            return Ok(None);
        }
        let manifest = Manifest::read(data)?;
        let id = manifest.manifest_id;
        for file in manifest.files {
            if !cb(file) {
                break;
            }
        }
        Ok(if id.is_none() { None } else { Some(id) })
    }

    pub fn read_file(
        path: &Path,
        cb: &mut dyn FnMut(RFile) -> bool,
    ) -> Result<Option<crate::chunk::ManifestId>> {
        let file = File::open(path).with_context(|| format!("open {:?}", path))?;
        let map = unsafe { memmap2::Mmap::map(&file) }
            .with_context(|| format!("map {:?}", path))?;
        Self::read(&map, cb).with_context(|| format!("read manifest {:?}", path))
    }
}

fn read_jrman(data: &[u8], cb: &mut dyn FnMut(RFile) -> bool) -> Result<()> {
    let text = std::str::from_utf8(data).context("JRMAN stream is not UTF-8")?;
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line == JRMAN_MARKER {
            continue;
        }
        if !cb(RFile::undump(line)?) {
            return Ok(());
        }
    }
    Ok(())
}

fn read_zrman(data: &[u8], cb: &mut dyn FnMut(RFile) -> bool) -> Result<()> {
    let mut decoder =
        zstd::stream::read::Decoder::new(data).context("open ZRMAN decoder")?;
    let mut buf = vec![0u8; ZRMAN_WINDOW];
    let mut filled = 0usize;
    loop {
        let n = decoder.read(&mut buf[filled..]).context("decompress ZRMAN window")?;
        if n == 0 {
            break;
        }
        filled += n;
        let mut start = 0usize;
        while let Some(nl) = buf[start..filled].iter().position(|&b| b == b'\n') {
            let line = std::str::from_utf8(&buf[start..start + nl])
                .context("ZRMAN line is not UTF-8")?
                .trim();
            if !line.is_empty() && line != JRMAN_MARKER {
                if !cb(RFile::undump(line)?) {
                    return Ok(());
                }
            }
            start += nl + 1;
        }
        ensure!(start > 0 || filled < buf.len(), "ZRMAN line exceeds the streaming window");
        buf.copy_within(start..filled, 0);
        filled -= start;
    }
    // Trailing record without a final newline.
    let line = std::str::from_utf8(&buf[..filled]).context("ZRMAN tail is not UTF-8")?.trim();
    if !line.is_empty() && line != JRMAN_MARKER {
        cb(RFile::undump(line)?);
    }
    Ok(())
}

/// Line-at-a-time JRMAN writer; emits the marker on creation.
pub struct JrmanWriter {
    file: File,
}

impl JrmanWriter {
    pub fn create(path: &Path, append: bool) -> Result<JrmanWriter> {
        let mut opts = File::options();
        opts.write(true).create(true);
        if append {
            opts.append(true);
        } else {
            opts.truncate(true);
        }
        let mut file = opts.open(path).with_context(|| format!("create {:?}", path))?;
        if !append || file.metadata()?.len() == 0 {
            file.write_all(JRMAN_MARKER.as_bytes())?;
            file.write_all(b"\n")?;
        }
        Ok(JrmanWriter { file })
    }

    pub fn write(&mut self, file: &RFile) -> Result<()> {
        if file.size > 0 && file.chunks.as_ref().is_some_and(|c| c.is_empty()) {
            bail!("file {} has a size but no chunks", file.file_id);
        }
        self.file.write_all(file.dump()?.as_bytes()).context("write JRMAN line")
    }
}
