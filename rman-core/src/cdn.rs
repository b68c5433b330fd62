//! Chunk-aware CDN downloader.
//!
//! Sorted chunks are coalesced into runs that one ranged GET can serve: all
//! in the same bundle, each next chunk either byte-contiguous with the
//! previous or carrying the same id (duplicates fan out from one
//! decompression). A bounded worker pool fetches runs concurrently; each
//! response streams through the decompressor, delivering finished chunks as
//! soon as their compressed bytes are complete. Whatever was not delivered
//! by the end of a round is re-sorted and retried.

use std::io::Read;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use anyhow::Result;

use crate::cache::Cache;
use crate::chunk::ChunkDst;

pub const MAX_WORKERS: u32 = 64;
pub const MAX_RETRY: u32 = 8;

#[derive(Clone, Debug)]
pub struct CdnOptions {
    pub url: String,
    pub workers: u32,
    pub retry: u32,
    pub useragent: String,
    pub proxy: String,
}

impl Default for CdnOptions {
    fn default() -> Self {
        CdnOptions {
            url: String::new(),
            workers: 32,
            retry: 3,
            useragent: String::new(),
            proxy: String::new(),
        }
    }
}

pub struct Cdn {
    options: CdnOptions,
    agent: ureq::Agent,
}

/// Delivery sink shared by the workers; the lock also serialises cache
/// appends.
struct Sink<'a> {
    cache: Option<&'a mut Cache>,
    on_data: &'a mut (dyn FnMut(&ChunkDst, &[u8]) + Send),
    fatal: Option<anyhow::Error>,
}

impl Cdn {
    pub fn new(options: CdnOptions) -> Result<Cdn> {
        let mut builder = ureq::AgentBuilder::new();
        if !options.useragent.is_empty() {
            builder = builder.user_agent(&options.useragent);
        }
        if !options.proxy.is_empty() {
            builder = builder.proxy(ureq::Proxy::new(&options.proxy)?);
        }
        Ok(Cdn { options, agent: builder.build() })
    }

    pub fn url(&self) -> &str {
        &self.options.url
    }

    /// Fetch every chunk, writing decoded bytes through `on_data` (and the
    /// cache, when one is attached and writable). Returns the chunks that
    /// stayed unsatisfied after all retry rounds.
    pub fn get(
        &self,
        mut chunks: Vec<ChunkDst>,
        mut cache: Option<&mut Cache>,
        on_data: &mut (dyn FnMut(&ChunkDst, &[u8]) + Send),
    ) -> Result<Vec<ChunkDst>> {
        if let Some(cache) = cache.as_deref_mut() {
            chunks = cache.get(chunks, |chunk, data| on_data(chunk, data))?;
        }
        if chunks.is_empty() || self.options.url.is_empty() {
            return Ok(chunks);
        }

        let workers = self.options.workers.clamp(1, MAX_WORKERS) as usize;
        let retry = self.options.retry.min(MAX_RETRY);

        let sink = Mutex::new(Sink {
            cache: cache.filter(|c| c.can_write()),
            on_data,
            fatal: None,
        });

        for _round in 0..retry {
            if chunks.is_empty() {
                break;
            }
            chunks.sort_by_key(|c| {
                (c.bundle_id(), c.compressed_offset(), c.uncompressed_offset)
            });
            let runs = coalesce(&chunks);

            let next = AtomicUsize::new(0);
            let failed = Mutex::new(Vec::with_capacity(chunks.len()));
            let chunks_ref = &chunks;
            let runs_ref = &runs;
            let next_ref = &next;
            let failed_ref = &failed;
            let sink_ref = &sink;
            std::thread::scope(|scope| {
                for _ in 0..workers.min(runs.len()) {
                    scope.spawn(move || loop {
                        let i = next_ref.fetch_add(1, Ordering::Relaxed);
                        if i >= runs_ref.len() {
                            break;
                        }
                        let (start, len) = runs_ref[i];
                        let run = &chunks_ref[start..start + len];
                        let leftover = self.fetch_run(run, sink_ref);
                        if !leftover.is_empty() {
                            failed_ref.lock().unwrap().extend_from_slice(leftover);
                        }
                        if sink_ref.lock().unwrap().fatal.is_some() {
                            break;
                        }
                    });
                }
            });

            if let Some(err) = sink.lock().unwrap().fatal.take() {
                return Err(err);
            }
            chunks = failed.into_inner().unwrap();
        }
        Ok(chunks)
    }

    /// One ranged GET covering `run`; returns the chunks it failed to
    /// deliver.
    fn fetch_run<'c>(&self, run: &'c [ChunkDst], sink: &Mutex<Sink>) -> &'c [ChunkDst] {
        let first = &run[0];
        let last = &run[run.len() - 1];
        let url = format!("{}/bundles/{}.bundle", self.options.url, first.bundle_id());
        let range = format!(
            "bytes={}-{}",
            first.compressed_offset(),
            last.compressed_offset() + last.compressed_size() as u64 - 1
        );

        let response = match self.agent.get(&url).set("Range", &range).call() {
            Ok(r) => r,
            Err(_) => return run,
        };
        if response.status() != 206 && response.status() != 200 {
            return run;
        }

        let mut body = response.into_reader();
        let mut rest = run;
        let mut buffer: Vec<u8> = Vec::new();
        let mut recv = [0u8; 64 * 1024];
        loop {
            let n = match body.read(&mut recv) {
                Ok(0) => break,
                Ok(n) => n,
                Err(_) => break,
            };
            buffer.extend_from_slice(&recv[..n]);

            // Consume whole front chunks as their bytes complete.
            while let Some(front) = rest.first() {
                let compressed_size = front.compressed_size() as usize;
                if buffer.len() < compressed_size {
                    break;
                }
                let compressed = &buffer[..compressed_size];
                let plain = match zstd::bulk::decompress(
                    compressed,
                    front.uncompressed_size() as usize,
                ) {
                    Ok(p) => p,
                    Err(_) => return rest,
                };

                let mut sink = sink.lock().unwrap();
                if let Some(cache) = sink.cache.as_deref_mut() {
                    if let Err(err) = cache.add(&front.src.chunk, compressed) {
                        sink.fatal = Some(err);
                        drop(sink);
                        return rest;
                    }
                }
                // Duplicate ids fan out from this one decompression.
                let front_id = front.id();
                while let Some(chunk) = rest.first() {
                    if chunk.id() != front_id {
                        break;
                    }
                    (sink.on_data)(chunk, &plain);
                    rest = &rest[1..];
                }
                drop(sink);
                buffer.drain(..compressed_size);
            }
            if rest.is_empty() {
                break;
            }
        }
        rest
    }
}

/// Split a sorted chunk list into coalesced `(start, len)` runs.
fn coalesce(chunks: &[ChunkDst]) -> Vec<(usize, usize)> {
    let mut runs = Vec::new();
    let mut i = 0usize;
    while i < chunks.len() {
        let mut j = i + 1;
        while j < chunks.len() {
            // A run never crosses bundles.
            if chunks[j].bundle_id() != chunks[i].bundle_id() {
                break;
            }
            // Duplicates are allowed in place.
            if chunks[j].id() == chunks[j - 1].id() {
                j += 1;
                continue;
            }
            // Otherwise the next chunk must start where the previous ended.
            if chunks[j].compressed_offset()
                != chunks[j - 1].compressed_offset() + chunks[j - 1].compressed_size() as u64
            {
                break;
            }
            j += 1;
        }
        runs.push((i, j - i));
        i = j;
    }
    runs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{BundleId, Chunk, ChunkId, ChunkSrc, HashType};

    fn dst(bundle: u64, id: u64, offset: u64, csize: u32) -> ChunkDst {
        ChunkDst {
            src: ChunkSrc {
                chunk: Chunk {
                    id: ChunkId::from_raw(id),
                    uncompressed_size: csize * 2,
                    compressed_size: csize,
                },
                bundle_id: BundleId::from_raw(bundle),
                compressed_offset: offset,
            },
            hash_type: HashType::RitoHkdf,
            uncompressed_offset: 0,
        }
    }

    #[test]
    fn coalesce_groups_contiguous_same_bundle_chunks() {
        let chunks = vec![
            dst(1, 10, 0, 100),
            dst(1, 11, 100, 50),
            dst(1, 12, 150, 25),
            dst(1, 13, 400, 10), // gap
            dst(2, 14, 0, 10),   // other bundle
        ];
        let runs = coalesce(&chunks);
        assert_eq!(runs, vec![(0, 3), (3, 1), (4, 1)]);
    }

    #[test]
    fn coalesce_keeps_duplicates_in_one_run() {
        let chunks = vec![
            dst(1, 10, 0, 100),
            dst(1, 10, 0, 100),
            dst(1, 11, 100, 50),
        ];
        let runs = coalesce(&chunks);
        assert_eq!(runs, vec![(0, 3)]);
    }

    #[test]
    fn empty_url_returns_everything_unsatisfied() {
        let cdn = Cdn::new(CdnOptions::default()).unwrap();
        let chunks = vec![dst(1, 10, 0, 100)];
        let out = cdn.get(chunks.clone(), None, &mut |_, _| {}).unwrap();
        assert_eq!(out.len(), chunks.len());
    }

    #[test]
    fn zero_retry_never_dials() {
        let cdn = Cdn::new(CdnOptions {
            url: "http://127.0.0.1:9".into(), // discard port; must not be used
            retry: 0,
            ..Default::default()
        })
        .unwrap();
        let out = cdn.get(vec![dst(1, 10, 0, 100)], None, &mut |_, _| {}).unwrap();
        assert_eq!(out.len(), 1);
    }
}
