use anyhow::{bail, ensure, Context, Result};
use clap::{Parser, Subcommand};
use rayon::prelude::*;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use rman_core::ar::{Ar, CdcKind, Recognizer};
use rman_core::bundle::Bundle;
use rman_core::cache::{Cache, CacheOptions};
use rman_core::cdn::{Cdn, CdnOptions};
use rman_core::chunk::{self, ChunkDst, HashType};
use rman_core::download::{download_file, DownloadOptions};
use rman_core::file::{JrmanWriter, Match, RFile};
use rman_core::progress::{Phase, Progress};
use rman_core::resume::ResumeFile;

const KIB: usize = 1024;
const MIB: u64 = 1024 * 1024;
const GIB: u64 = 1024 * 1024 * 1024;

#[derive(Parser)]
#[command(name = "rman", version, about = "manifest-driven content download and repacking")]
struct Cli {
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Download or repair files described by a manifest
    Dl {
        /// Manifest file to read from (RMAN, JRMAN or ZRMAN)
        manifest: PathBuf,
        /// Output directory to store and verify files in
        #[arg(default_value = ".")]
        output: PathBuf,
        /// Filter: case-insensitive path fragment
        #[arg(short = 'p', long)]
        filter_path: Option<String>,
        /// Filter: case-insensitive language fragment ("none" for international)
        #[arg(short = 'l', long)]
        filter_lang: Option<String>,
        /// Skip verification of existing files
        #[arg(long, default_value_t = false)]
        no_verify: bool,
        /// Do not write to disk
        #[arg(long, default_value_t = false)]
        no_write: bool,
        #[arg(long, default_value_t = false)]
        no_progress: bool,
        /// Cache bundle path
        #[arg(long)]
        cache: Option<PathBuf>,
        /// Do not write newly downloaded chunks into the cache
        #[arg(long, default_value_t = false)]
        cache_readonly: bool,
        /// Cache write buffer in megabytes
        #[arg(long, default_value_t = 32, value_parser = clap::value_parser!(u32).range(1..=4096))]
        cache_buffer: u32,
        /// Cache bundle size limit in gigabytes
        #[arg(long, default_value_t = 4, value_parser = clap::value_parser!(u32).range(0..=4096))]
        cache_limit: u32,
        /// Source url to download bundles from
        #[arg(long, default_value = "")]
        cdn: String,
        /// Retry rounds per file
        #[arg(long, default_value_t = 3, value_parser = clap::value_parser!(u32).range(0..=8))]
        cdn_retry: u32,
        /// Concurrent connections per downloaded file
        #[arg(long, default_value_t = 32, value_parser = clap::value_parser!(u32).range(1..=64))]
        cdn_workers: u32,
        #[arg(long, default_value = "")]
        cdn_useragent: String,
        #[arg(long, default_value = "")]
        cdn_proxy: String,
    },
    /// Remake manifests by rechunking all file data
    Remake {
        /// Bundle file to write into
        outbundle: PathBuf,
        /// JRMAN manifest to write into
        outmanifest: PathBuf,
        /// Input bundle to read chunk data from
        inbundle: PathBuf,
        /// Input manifests (files or directories)
        inmanifests: Vec<PathBuf>,
        #[arg(short = 'p', long)]
        filter_path: Option<String>,
        #[arg(short = 'l', long)]
        filter_lang: Option<String>,
        /// Resume file used to skip already processed files
        #[arg(long)]
        resume: Option<PathBuf>,
        /// Resume buffer before flush in kilobytes
        #[arg(long, default_value_t = 64, value_parser = clap::value_parser!(u32).range(1..=16384))]
        resume_buffer: u32,
        /// Append to the output manifest instead of overwriting
        #[arg(long, default_value_t = false)]
        append: bool,
        #[arg(long, default_value_t = false)]
        no_progress: bool,
        /// Drop chunk lists of multi-chunk files from the output manifest
        #[arg(long, default_value_t = false)]
        strip_chunks: bool,
        /// Prefix file paths with the manifest name
        #[arg(long, default_value_t = false)]
        with_prefix: bool,
        /// Comma-separated smart chunkers to disable
        #[arg(long, default_value = "")]
        no_ar: String,
        /// Fail instead of falling back to dumb chunking on recogniser errors
        #[arg(long, default_value_t = false)]
        ar_strict: bool,
        /// Dumb chunking fallback: fixed or bup
        #[arg(long, default_value = "fixed")]
        cdc: String,
        /// Smart chunking minimum size in kilobytes
        #[arg(long, default_value_t = 4, value_parser = clap::value_parser!(u32).range(1..=4096))]
        ar_min: u32,
        /// Chunk max size in kilobytes
        #[arg(long, default_value_t = 1024, value_parser = clap::value_parser!(u32).range(1..=8096))]
        chunk_size: u32,
        /// zstd compression level
        #[arg(long, default_value_t = 6, value_parser = clap::value_parser!(i32).range(-7..=22))]
        level: i32,
        /// Compression level for high entropy chunks (0 for no special handling)
        #[arg(long, default_value_t = 0, value_parser = clap::value_parser!(i32).range(-7..=22))]
        level_high_entropy: i32,
        /// Output bundle write buffer in megabytes
        #[arg(long, default_value_t = 32, value_parser = clap::value_parser!(u32).range(1..=4096))]
        buffer: u32,
        /// Output bundle size limit in gigabytes
        #[arg(long, default_value_t = 4096, value_parser = clap::value_parser!(u32).range(0..=4096))]
        limit: u32,
    },
    /// List files in a manifest as path,size,fileId,langs
    Ls {
        manifest: PathBuf,
        #[arg(short = 'p', long)]
        filter_path: Option<String>,
        #[arg(short = 'l', long)]
        filter_lang: Option<String>,
    },
    /// List chunks in a bundle file as chunkId,uncompressed,compressed,offset
    BundleLs { bundle: PathBuf },
    /// Check a bundle file: footer, checksum, and every chunk's contents
    BundleChk {
        bundle: PathBuf,
        /// Also match each chunk's id against its decompressed bytes
        #[arg(long, default_value_t = false)]
        verify_hash: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.cmd {
        Cmd::Dl {
            manifest,
            output,
            filter_path,
            filter_lang,
            no_verify,
            no_write,
            no_progress,
            cache,
            cache_readonly,
            cache_buffer,
            cache_limit,
            cdn,
            cdn_retry,
            cdn_workers,
            cdn_useragent,
            cdn_proxy,
        } => dl(DlArgs {
            manifest,
            output,
            filter: Match { path: filter_path, langs: filter_lang },
            no_verify,
            no_write,
            no_progress,
            cache,
            cache_readonly,
            cache_buffer,
            cache_limit,
            cdn,
            cdn_retry,
            cdn_workers,
            cdn_useragent,
            cdn_proxy,
        }),
        Cmd::Remake {
            outbundle,
            outmanifest,
            inbundle,
            inmanifests,
            filter_path,
            filter_lang,
            resume,
            resume_buffer,
            append,
            no_progress,
            strip_chunks,
            with_prefix,
            no_ar,
            ar_strict,
            cdc,
            ar_min,
            chunk_size,
            level,
            level_high_entropy,
            buffer,
            limit,
        } => remake(RemakeArgs {
            outbundle,
            outmanifest,
            inbundle,
            inmanifests,
            filter: Match { path: filter_path, langs: filter_lang },
            resume,
            resume_buffer,
            append,
            no_progress,
            strip_chunks,
            with_prefix,
            no_ar,
            ar_strict,
            cdc,
            ar_min,
            chunk_size,
            level,
            level_high_entropy,
            buffer,
            limit,
        }),
        Cmd::Ls { manifest, filter_path, filter_lang } => {
            ls(&manifest, &Match { path: filter_path, langs: filter_lang })
        }
        Cmd::BundleLs { bundle } => bundle_ls(&bundle),
        Cmd::BundleChk { bundle, verify_hash } => bundle_chk(&bundle, verify_hash),
    }
}

struct DlArgs {
    manifest: PathBuf,
    output: PathBuf,
    filter: Match,
    no_verify: bool,
    no_write: bool,
    no_progress: bool,
    cache: Option<PathBuf>,
    cache_readonly: bool,
    cache_buffer: u32,
    cache_limit: u32,
    cdn: String,
    cdn_retry: u32,
    cdn_workers: u32,
    cdn_useragent: String,
    cdn_proxy: String,
}

fn dl(args: DlArgs) -> Result<()> {
    let mut files = Vec::new();
    let manifest_id = RFile::read_file(&args.manifest, &mut |file| {
        if args.filter.matches(&file) {
            files.push(file);
        }
        true
    })?;

    if !args.no_write {
        std::fs::create_dir_all(&args.output)
            .with_context(|| format!("create output directory {:?}", args.output))?;
    }

    // Line-format manifests carry no manifest id; those can verify and fill
    // from a read-only cache but never download.
    let cdn_url = args.cdn.trim_end_matches('/').to_string();
    let downloadable = !cdn_url.is_empty() && manifest_id.is_some();

    let mut cache = match &args.cache {
        Some(path) => Some(Cache::open(&CacheOptions {
            path: path.clone(),
            readonly: args.cache_readonly || !downloadable,
            flush_size: args.cache_buffer as u64 * MIB,
            max_size: args.cache_limit as u64 * GIB,
        })?),
        None => None,
    };
    let cdn = if downloadable {
        Some(Cdn::new(CdnOptions {
            url: cdn_url,
            workers: args.cdn_workers,
            retry: args.cdn_retry,
            useragent: args.cdn_useragent.clone(),
            proxy: args.cdn_proxy.clone(),
        })?)
    } else {
        None
    };

    let progress = Progress::new(!args.no_progress);
    progress.set_files_total(files.len());
    progress.start();

    let options = DownloadOptions { no_verify: args.no_verify, no_write: args.no_write };
    let mut failed_files = 0usize;
    for file in &files {
        eprintln!("START: {}", file.path);
        let report =
            download_file(file, &args.output, options, cache.as_mut(), cdn.as_ref(), &progress)
                .with_context(|| format!("download {}", file.path))?;
        if report.is_complete() {
            eprintln!("OK: {}", file.path);
        } else {
            failed_files += 1;
            eprintln!("FAILED: {} ({} chunks left)", file.path, report.failed.len());
        }
        progress.file_done(report.is_complete());
    }
    progress.stop();

    if failed_files > 0 {
        bail!("{} of {} files left partial", failed_files, files.len());
    }
    eprintln!("Done: {} files", files.len());
    Ok(())
}

struct RemakeArgs {
    outbundle: PathBuf,
    outmanifest: PathBuf,
    inbundle: PathBuf,
    inmanifests: Vec<PathBuf>,
    filter: Match,
    resume: Option<PathBuf>,
    resume_buffer: u32,
    append: bool,
    no_progress: bool,
    strip_chunks: bool,
    with_prefix: bool,
    no_ar: String,
    ar_strict: bool,
    cdc: String,
    ar_min: u32,
    chunk_size: u32,
    level: i32,
    level_high_entropy: i32,
    buffer: u32,
    limit: u32,
}

fn remake(args: RemakeArgs) -> Result<()> {
    let mut disabled = Vec::new();
    for name in args.no_ar.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        disabled.push(
            Recognizer::from_name(name)
                .with_context(|| format!("unknown smart chunker {:?}", name))?,
        );
    }
    let mut ar = Ar {
        chunk_min: args.ar_min as usize * KIB,
        chunk_max: args.chunk_size as usize * KIB,
        disabled,
        cdc: CdcKind::from_name(&args.cdc)
            .with_context(|| format!("unknown cdc algorithm {:?}", args.cdc))?,
        strict: args.ar_strict,
        errors: Vec::new(),
    };

    eprintln!("Collecting input manifests ...");
    let manifests = collect_manifests(&args.inmanifests)?;
    ensure!(!manifests.is_empty(), "no input manifests found");

    eprintln!("Processing input bundle ...");
    let mut inbundle = Cache::open(&CacheOptions {
        path: args.inbundle.clone(),
        readonly: true,
        ..Default::default()
    })?;

    eprintln!("Processing output bundle ...");
    let mut outbundle = Cache::open(&CacheOptions {
        path: args.outbundle.clone(),
        readonly: false,
        flush_size: args.buffer as u64 * MIB,
        max_size: args.limit as u64 * GIB,
    })?;

    let mut resume = match &args.resume {
        Some(path) => ResumeFile::open(path, args.resume_buffer as usize * KIB)?,
        None => ResumeFile::disabled(),
    };

    eprintln!("Create output manifest ...");
    let mut writer = JrmanWriter::create(&args.outmanifest, args.append)?;

    let progress = Progress::new(!args.no_progress);
    progress.set_files_total(manifests.len());
    progress.start();

    for path in &manifests {
        eprintln!("MANIFEST: {:?}", path);
        let prefix = path
            .file_stem()
            .map(|s| format!("{}/", s.to_string_lossy()))
            .unwrap_or_default();
        let mut pending = Vec::new();
        RFile::read_file(path, &mut |mut file| {
            if args.with_prefix {
                file.path.insert_str(0, &prefix);
            }
            if args.filter.matches(&file) {
                pending.push(file);
            }
            true
        })?;
        for mut file in pending {
            add_file(&mut file, &mut inbundle, &mut outbundle, &mut resume, &mut ar, &args, &progress)
                .with_context(|| format!("rechunk {}", file.path))?;
            writer.write(&file)?;
        }
        progress.file_done(true);
    }

    outbundle.flush()?;
    resume.flush()?;
    progress.stop();
    Ok(())
}

fn add_file(
    file: &mut RFile,
    inbundle: &mut Cache,
    outbundle: &mut Cache,
    resume: &mut ResumeFile,
    ar: &mut Ar,
    args: &RemakeArgs,
    progress: &Progress,
) -> Result<()> {
    ensure!(file.link.is_empty(), "linked files cannot be rechunked");
    let old_id = file.file_id;
    if resume.restore(old_id, file) {
        return Ok(());
    }
    if file.time == 0 {
        file.time = chrono::Utc::now().timestamp() as u64;
    }

    // Materialise the file's bytes from the input bundle.
    progress.begin_file(&file.path, file.size);
    let mut buffer = vec![0u8; file.size as usize];
    if file.chunks.is_none() && file.size > 0 {
        let chunks = inbundle.get_chunks(file.file_id)?;
        ensure!(!chunks.is_empty(), "no chunk list for stripped file {}", file.file_id);
        file.chunks = Some(chunks);
    }
    let chunks = file.chunks.clone().unwrap_or_default();
    let missing = inbundle.get(chunks, |chunk, data| {
        let offset = chunk.uncompressed_offset as usize;
        buffer[offset..offset + data.len()].copy_from_slice(data);
        progress.advance(Phase::Read, data.len());
    })?;
    ensure!(missing.is_empty(), "input bundle is missing {} chunks", missing.len());

    // Re-chunk along container boundaries and ingest into the output bundle.
    let mut entries = Vec::new();
    ar.split(&buffer, &mut |entry| entries.push(entry))?;
    let mut new_chunks = Vec::with_capacity(entries.len());
    for entry in entries {
        let level = if entry.high_entropy && args.level_high_entropy != 0 {
            args.level_high_entropy
        } else {
            args.level
        };
        let src =
            outbundle.add_uncompressed(&buffer[entry.offset..entry.offset + entry.size], level)?;
        new_chunks.push(ChunkDst {
            src,
            hash_type: HashType::RitoHkdf,
            uncompressed_offset: entry.offset as u64,
        });
        progress.advance(Phase::Chunk, entry.size);
    }
    if !ar.errors.is_empty() {
        eprintln!("Smart chunking fell back for:");
        for error in &ar.errors {
            eprintln!("\t{}", error);
        }
        ar.errors.clear();
    }

    file.file_id = outbundle.add_chunks(&new_chunks, args.level)?;
    file.chunks = Some(new_chunks);
    if args.strip_chunks && file.chunks.as_ref().is_some_and(|c| c.len() > 1) {
        file.chunks = None;
    }
    resume.save(old_id, file)?;
    Ok(())
}

fn collect_manifests(inputs: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    for input in inputs {
        let md = std::fs::metadata(input).with_context(|| format!("stat {:?}", input))?;
        if md.is_file() {
            out.push(input.clone());
            continue;
        }
        for entry in WalkDir::new(input).into_iter().filter_map(|e| e.ok()) {
            if entry.file_type().is_file() {
                out.push(entry.path().to_path_buf());
            }
        }
    }
    out.sort();
    Ok(out)
}

fn ls(manifest: &Path, filter: &Match) -> Result<()> {
    RFile::read_file(manifest, &mut |file| {
        if filter.matches(&file) {
            println!("{},{},{},{}", file.path, file.size, file.file_id, file.langs);
        }
        true
    })?;
    Ok(())
}

fn bundle_ls(path: &Path) -> Result<()> {
    let mut file = File::open(path).with_context(|| format!("open {:?}", path))?;
    let bundle = Bundle::read(&mut file)?;
    let mut offset = 0u64;
    for chunk in &bundle.chunks {
        println!("{},{},{},{}", chunk.id, chunk.uncompressed_size, chunk.compressed_size, offset);
        offset += chunk.compressed_size as u64;
    }
    eprintln!("{} chunks, {} data bytes", bundle.chunks.len(), bundle.toc_offset);
    Ok(())
}

fn bundle_chk(path: &Path, verify_hash: bool) -> Result<()> {
    let mut file = File::open(path).with_context(|| format!("open {:?}", path))?;
    let bundle = Bundle::read(&mut file)?;
    let mut bad = 0usize;
    let mut offset = 0u64;
    // Read sequentially in batches, decompress and hash the batch in
    // parallel; batches keep memory bounded on multi-gigabyte bundles.
    for batch in bundle.chunks.chunks(256) {
        let mut raw = Vec::with_capacity(batch.len());
        for chunk in batch {
            raw.push(read_exact_at(&mut file, offset, chunk.compressed_size as usize)?);
            offset += chunk.compressed_size as u64;
        }
        let results: Vec<Option<String>> = batch
            .par_iter()
            .zip(&raw)
            .map(|(chunk, compressed)| {
                let plain =
                    match zstd::bulk::decompress(compressed, chunk.uncompressed_size as usize) {
                        Ok(p) if p.len() == chunk.uncompressed_size as usize => p,
                        _ => {
                            return Some(format!(
                                "BAD: {} does not decompress to its stated size",
                                chunk.id
                            ))
                        }
                    };
                if verify_hash && chunk::detect_hash_type(&plain, chunk.id) == HashType::None {
                    return Some(format!("BAD: {} does not hash to its id", chunk.id));
                }
                None
            })
            .collect();
        for message in results.into_iter().flatten() {
            eprintln!("{}", message);
            bad += 1;
        }
    }
    if bad > 0 {
        bail!("{} of {} chunks are bad", bad, bundle.chunks.len());
    }
    println!("OK: {} chunks", bundle.chunks.len());
    Ok(())
}

// ---- Safe I/O helpers ----

fn read_exact_at(f: &mut File, off: u64, len: usize) -> Result<Vec<u8>> {
    f.seek(SeekFrom::Start(off)).context("seek bundle")?;
    let mut buf = vec![0u8; len];
    f.read_exact(&mut buf).context("read bundle")?;
    Ok(buf)
}
