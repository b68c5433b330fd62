//! Stderr progress reporting for the download and remake pipelines.
//!
//! Bytes are attributed to the pipeline phase that satisfied them, so a
//! report line shows how much of the current file came from disk, from the
//! local cache, and from the CDN (or, during a remake, how much has been
//! materialised and re-chunked).

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// Which stage of the pipeline satisfied (or processed) a run of bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    /// Bytes already on disk that hashed to their chunk ids.
    Verify,
    /// Bytes decompressed out of the local bundle cache.
    Cache,
    /// Bytes fetched from the CDN.
    Download,
    /// Bytes materialised from the input bundle during a remake.
    Read,
    /// Bytes re-chunked into the output bundle during a remake.
    Chunk,
}

impl Phase {
    const ALL: [Phase; 5] =
        [Phase::Verify, Phase::Cache, Phase::Download, Phase::Read, Phase::Chunk];

    fn label(self) -> &'static str {
        match self {
            Phase::Verify => "verified",
            Phase::Cache => "cached",
            Phase::Download => "downloaded",
            Phase::Read => "read",
            Phase::Chunk => "chunked",
        }
    }
}

#[derive(Default)]
struct Counters {
    current: Mutex<String>,
    file_size: AtomicU64,
    phase_bytes: [AtomicU64; 5],
    files_done: AtomicUsize,
    files_failed: AtomicUsize,
    files_total: AtomicUsize,
    running: AtomicBool,
}

impl Counters {
    fn render(&self) -> String {
        let mut line = self.current.lock().unwrap().clone();
        if line.is_empty() {
            line.push('-');
        }
        let size = self.file_size.load(Ordering::Relaxed);
        for phase in Phase::ALL {
            let bytes = self.phase_bytes[phase as usize].load(Ordering::Relaxed);
            if bytes == 0 {
                continue;
            }
            if size > 0 {
                line.push_str(&format!(" | {} {}%", phase.label(), bytes * 100 / size));
            } else {
                line.push_str(&format!(" | {} {}", phase.label(), bytes));
            }
        }
        line.push_str(&format!(
            " | files {}/{}",
            self.files_done.load(Ordering::Relaxed),
            self.files_total.load(Ordering::Relaxed)
        ));
        let failed = self.files_failed.load(Ordering::Relaxed);
        if failed > 0 {
            line.push_str(&format!(" ({} failed)", failed));
        }
        line
    }
}

#[derive(Clone)]
pub struct Progress {
    enabled: bool,
    counters: Arc<Counters>,
}

impl Progress {
    pub fn new(enabled: bool) -> Self {
        Progress { enabled, counters: Arc::new(Counters::default()) }
    }

    pub fn set_files_total(&self, n: usize) {
        self.counters.files_total.store(n, Ordering::Relaxed);
    }

    /// Point the reporter at a new file and reset its per-phase counters.
    pub fn begin_file(&self, path: &str, size: u64) {
        *self.counters.current.lock().unwrap() = path.to_string();
        self.counters.file_size.store(size, Ordering::Relaxed);
        for bytes in &self.counters.phase_bytes {
            bytes.store(0, Ordering::Relaxed);
        }
    }

    /// Attribute `bytes` of the current file to `phase`.
    pub fn advance(&self, phase: Phase, bytes: usize) {
        self.counters.phase_bytes[phase as usize].fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn file_done(&self, complete: bool) {
        self.counters.files_done.fetch_add(1, Ordering::Relaxed);
        if !complete {
            self.counters.files_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn start(&self) {
        if !self.enabled {
            return;
        }
        self.counters.running.store(true, Ordering::Relaxed);
        let counters = self.counters.clone();
        thread::spawn(move || {
            let t0 = Instant::now();
            while counters.running.load(Ordering::Relaxed) {
                thread::sleep(Duration::from_secs(5));
                if !counters.running.load(Ordering::Relaxed) {
                    break;
                }
                eprintln!("[{:>4}s] {}", t0.elapsed().as_secs(), counters.render());
            }
        });
    }

    pub fn stop(&self) {
        if self.enabled {
            self.counters.running.store(false, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phases_are_attributed_separately() {
        let progress = Progress::new(false);
        progress.set_files_total(2);
        progress.begin_file("a/b.bin", 200);
        progress.advance(Phase::Verify, 100);
        progress.advance(Phase::Cache, 50);
        progress.advance(Phase::Download, 50);
        progress.file_done(true);

        let line = progress.counters.render();
        assert!(line.contains("a/b.bin"));
        assert!(line.contains("verified 50%"));
        assert!(line.contains("cached 25%"));
        assert!(line.contains("downloaded 25%"));
        assert!(line.contains("files 1/2"));
        assert!(!line.contains("failed"));
    }

    #[test]
    fn begin_file_resets_phase_counters() {
        let progress = Progress::new(false);
        progress.begin_file("first.bin", 100);
        progress.advance(Phase::Download, 100);
        progress.begin_file("second.bin", 100);
        let line = progress.counters.render();
        assert!(line.contains("second.bin"));
        assert!(!line.contains("downloaded"));
    }

    #[test]
    fn failed_files_show_in_the_tally() {
        let progress = Progress::new(false);
        progress.set_files_total(3);
        progress.file_done(true);
        progress.file_done(false);
        let line = progress.counters.render();
        assert!(line.contains("files 2/3"));
        assert!(line.contains("(1 failed)"));
    }
}
