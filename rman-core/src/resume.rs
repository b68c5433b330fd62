//! Resume journal for long manifest rebuilds: fixed 32-byte records mapping
//! an input file id to its rewritten id and chunk disposition, appended as
//! files finish so an interrupted run can skip them.

use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use anyhow::{ensure, Context, Result};

use crate::chunk::{Chunk, ChunkDst, ChunkId, ChunkSrc, FileId, HashType};
use crate::file::RFile;

const RECORD_SIZE: usize = 32;
/// Chunk-slot sentinel: the file's chunk list was stripped.
const NIL: u64 = u64::MAX;
/// Chunk-slot sentinel: the file has an empty chunk list.
const ZERO: u64 = 0;

#[derive(Clone, Copy)]
struct Record {
    new_file_id: FileId,
    chunk: u64,
}

pub struct ResumeFile {
    file: Option<File>,
    flush_size: usize,
    buffer: Vec<u8>,
    entries: HashMap<FileId, Record>,
}

impl ResumeFile {
    /// A no-op journal: nothing restores, nothing is written.
    pub fn disabled() -> ResumeFile {
        ResumeFile { file: None, flush_size: 0, buffer: Vec::new(), entries: HashMap::new() }
    }

    pub fn open(path: &Path, flush_size: usize) -> Result<ResumeFile> {
        let mut file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .with_context(|| format!("open resume file {:?}", path))?;
        let size = file.metadata()?.len() as usize;
        ensure!(size % RECORD_SIZE == 0, "resume file {:?} is not record-aligned", path);

        let mut raw = vec![0u8; size];
        file.read_exact(&mut raw).context("read resume file")?;
        let mut entries = HashMap::with_capacity(size / RECORD_SIZE);
        for rec in raw.chunks(RECORD_SIZE) {
            let old = FileId::from_raw(u64::from_le_bytes(rec[0..8].try_into().unwrap()));
            let new = FileId::from_raw(u64::from_le_bytes(rec[8..16].try_into().unwrap()));
            let chunk = u64::from_le_bytes(rec[16..24].try_into().unwrap());
            entries.insert(old, Record { new_file_id: new, chunk });
        }
        Ok(ResumeFile { file: Some(file), flush_size, buffer: Vec::new(), entries })
    }

    /// Rewrite `rfile` from a journal hit: the recorded file id, plus either
    /// no chunk list, an empty one, or the single whole-file chunk.
    pub fn restore(&self, file_id: FileId, rfile: &mut RFile) -> bool {
        let Some(record) = self.entries.get(&file_id) else { return false };
        rfile.file_id = record.new_file_id;
        rfile.chunks = match record.chunk {
            NIL => None,
            ZERO => Some(Vec::new()),
            raw => Some(vec![ChunkDst {
                src: ChunkSrc {
                    chunk: Chunk {
                        id: ChunkId::from_raw(raw),
                        uncompressed_size: rfile.size as u32,
                        compressed_size: 0,
                    },
                    ..Default::default()
                },
                hash_type: HashType::RitoHkdf,
                uncompressed_offset: 0,
            }]),
        };
        true
    }

    /// Journal one finished file. Multi-chunk lists cannot be represented
    /// and return `false` (the file is simply reprocessed on resume).
    pub fn save(&mut self, file_id: FileId, rfile: &RFile) -> Result<bool> {
        let chunk = match &rfile.chunks {
            None => NIL,
            Some(chunks) if chunks.is_empty() => ZERO,
            Some(chunks) if chunks.len() == 1 => chunks[0].id().raw(),
            Some(_) => return Ok(false),
        };
        let record = Record { new_file_id: rfile.file_id, chunk };
        self.entries.insert(file_id, record);
        if self.file.is_some() {
            self.buffer.extend_from_slice(&file_id.raw().to_le_bytes());
            self.buffer.extend_from_slice(&record.new_file_id.raw().to_le_bytes());
            self.buffer.extend_from_slice(&record.chunk.to_le_bytes());
            self.buffer.extend_from_slice(&0u64.to_le_bytes());
            if self.buffer.len() >= self.flush_size {
                self.flush()?;
            }
        }
        Ok(true)
    }

    pub fn flush(&mut self) -> Result<()> {
        let Some(file) = &mut self.file else { return Ok(()) };
        if self.buffer.is_empty() {
            return Ok(());
        }
        file.seek(SeekFrom::End(0)).context("seek resume file")?;
        file.write_all(&self.buffer).context("append resume file")?;
        self.buffer.clear();
        Ok(())
    }
}

impl Drop for ResumeFile {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}
