//! Per-file download pipeline: verify what is already on disk, satisfy the
//! rest from the local cache, then from the CDN. The output file is resized
//! to its final length up front and chunks land at their own offsets, so a
//! failed file is simply left partial.

use std::fs::File;
use std::io::{Seek, SeekFrom, Write};
use std::path::{Component, Path, PathBuf};

use anyhow::{bail, ensure, Context, Result};

use crate::cache::Cache;
use crate::cdn::Cdn;
use crate::chunk::ChunkDst;
use crate::file::RFile;
use crate::progress::{Phase, Progress};

#[derive(Clone, Copy, Debug, Default)]
pub struct DownloadOptions {
    pub no_verify: bool,
    pub no_write: bool,
}

#[derive(Debug, Default)]
pub struct DownloadReport {
    /// Chunks no source could satisfy; non-empty means the file is partial.
    pub failed: Vec<ChunkDst>,
}

impl DownloadReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Join a manifest path onto the output root, refusing absolute paths and
/// parent traversal.
pub fn validate_path(root: &Path, rel: &str) -> Result<PathBuf> {
    let rel = Path::new(rel);
    ensure!(!rel.is_absolute(), "absolute paths are not allowed: {:?}", rel);
    for comp in rel.components() {
        match comp {
            Component::Normal(_) => {}
            _ => bail!("path component {:?} not allowed in {:?}", comp, rel),
        }
    }
    Ok(root.join(rel))
}

pub fn download_file(
    file: &RFile,
    output: &Path,
    options: DownloadOptions,
    mut cache: Option<&mut Cache>,
    cdn: Option<&Cdn>,
    progress: &Progress,
) -> Result<DownloadReport> {
    let chunks = file
        .chunks
        .as_ref()
        .with_context(|| format!("file {} has no chunk list", file.file_id))?;
    let path = validate_path(output, &file.path)?;

    progress.begin_file(&file.path, file.size);
    let mut bad = if options.no_verify {
        chunks.clone()
    } else {
        file.verify(&path, |_, data| progress.advance(Phase::Verify, data.len()))?
    };

    let mut outfile = None;
    if !options.no_write {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create directory {:?}", parent))?;
        }
        let f = File::options()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .with_context(|| format!("open {:?} for writing", path))?;
        f.set_len(file.size).with_context(|| format!("resize {:?}", path))?;
        outfile = Some(f);
    }

    // Chunk writes land at their uncompressed offsets; callbacks cannot
    // propagate, so the first write error is parked and re-raised after.
    // Delivered bytes are attributed to whichever source produced them.
    let mut write_err: Option<anyhow::Error> = None;
    let mut deliver = |phase: Phase, chunk: &ChunkDst, data: &[u8]| {
        if write_err.is_none() {
            if let Some(f) = outfile.as_mut() {
                if let Err(err) = write_at(f, chunk.uncompressed_offset, data) {
                    write_err = Some(err);
                    return;
                }
            }
        }
        progress.advance(phase, data.len());
    };

    if !bad.is_empty() {
        if let Some(cache) = cache.as_deref_mut() {
            bad = cache.get(bad, |chunk, data| deliver(Phase::Cache, chunk, data))?;
        }
    }
    if !bad.is_empty() {
        if let Some(cdn) = cdn {
            let mut on_data =
                |chunk: &ChunkDst, data: &[u8]| deliver(Phase::Download, chunk, data);
            bad = cdn.get(bad, cache, &mut on_data)?;
        }
    }

    if let Some(err) = write_err {
        return Err(err.context(format!("write {:?}", path)));
    }
    Ok(DownloadReport { failed: bad })
}

fn write_at(file: &mut File, offset: u64, data: &[u8]) -> Result<()> {
    file.seek(SeekFrom::Start(offset))?;
    file.write_all(data)?;
    Ok(())
}
