//! Structural ("smart") chunking.
//!
//! A splitter walks an input and emits non-overlapping entries that tile it
//! exactly. Recognisers for known container formats commit stable boundaries
//! so identical payload regions chunk identically across versions; anything
//! unrecognised falls through to content-defined chunking.

use anyhow::{bail, Result};

pub mod bnk;
pub mod cdc;
pub mod fsb;
pub mod fsb5;
pub mod load;
pub mod mac;
pub mod mpq;
pub mod pe;
pub mod wad;
pub mod wpk;
pub mod zip;

/// A byte range of the input. `high_entropy` marks already-compressed data
/// (so ingest can use a cheaper compression level); `nest` allows recognisers
/// to run again inside the range.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Entry {
    pub offset: usize,
    pub size: usize,
    pub high_entropy: bool,
    pub nest: bool,
}

/// Outcome of one recogniser attempt: `Ok(None)` is "not my format",
/// `Err` is an internal assertion failure while parsing a matched container.
pub type Attempt = std::result::Result<Option<Vec<Entry>>, String>;

macro_rules! ar_assert {
    ($cond:expr) => {
        if !($cond) {
            return Err(concat!("assertion failed: ", stringify!($cond)).to_string());
        }
    };
}
pub(crate) use ar_assert;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Recognizer {
    Zip,
    Wad,
    Wpk,
    Bnk,
    Fsb,
    Fsb5,
    MacFat,
    MacExe,
    Pe,
    Mpq,
    Load,
}

impl Recognizer {
    /// Dispatch priority; earlier recognisers win.
    pub const ALL: [Recognizer; 11] = [
        Recognizer::Zip,
        Recognizer::Wad,
        Recognizer::Wpk,
        Recognizer::Bnk,
        Recognizer::Fsb,
        Recognizer::Fsb5,
        Recognizer::MacFat,
        Recognizer::MacExe,
        Recognizer::Pe,
        Recognizer::Mpq,
        Recognizer::Load,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Recognizer::Zip => "zip",
            Recognizer::Wad => "wad",
            Recognizer::Wpk => "wpk",
            Recognizer::Bnk => "bnk",
            Recognizer::Fsb => "fsb",
            Recognizer::Fsb5 => "fsb5",
            Recognizer::MacFat => "mac-fat",
            Recognizer::MacExe => "mac-exe",
            Recognizer::Pe => "pe",
            Recognizer::Mpq => "mpq",
            Recognizer::Load => "load",
        }
    }

    pub fn from_name(name: &str) -> Option<Recognizer> {
        Self::ALL.iter().copied().find(|r| r.name() == name)
    }
}

/// Fallback chunker used where no container is recognised.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CdcKind {
    #[default]
    Fixed,
    /// 64-byte rolling-window hash.
    Rolling,
}

impl CdcKind {
    pub fn from_name(name: &str) -> Option<CdcKind> {
        match name {
            "fixed" => Some(CdcKind::Fixed),
            "bup" => Some(CdcKind::Rolling),
            _ => None,
        }
    }
}

/// A recogniser failure captured during a run; the affected range fell back
/// to content-defined chunking unless `strict` was set.
#[derive(Clone, Debug)]
pub struct ArError {
    pub offset: usize,
    pub size: usize,
    pub recognizer: Recognizer,
    pub message: String,
}

impl std::fmt::Display for ArError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} at [{}, {}): {}",
            self.recognizer.name(),
            self.offset,
            self.offset + self.size,
            self.message
        )
    }
}

pub struct Ar {
    pub chunk_min: usize,
    pub chunk_max: usize,
    pub disabled: Vec<Recognizer>,
    pub cdc: CdcKind,
    pub strict: bool,
    /// Non-fatal recogniser failures collected over a run.
    pub errors: Vec<ArError>,
}

impl Default for Ar {
    fn default() -> Self {
        Ar {
            chunk_min: 4 * 1024,
            chunk_max: 1024 * 1024,
            disabled: Vec::new(),
            cdc: CdcKind::Fixed,
            strict: false,
            errors: Vec::new(),
        }
    }
}

impl Ar {
    /// Split the whole input, delivering entries in ascending offset order.
    pub fn split(&mut self, data: &[u8], cb: &mut dyn FnMut(Entry)) -> Result<()> {
        self.process(
            data,
            cb,
            Entry { offset: 0, size: data.len(), high_entropy: false, nest: true },
        )
    }

    fn process(&mut self, data: &[u8], cb: &mut dyn FnMut(Entry), top: Entry) -> Result<()> {
        if top.size == 0 {
            return Ok(());
        }
        if top.nest {
            for rec in Recognizer::ALL {
                if self.disabled.contains(&rec) {
                    continue;
                }
                match self.attempt(rec, data, &top) {
                    Ok(None) => continue,
                    Ok(Some(entries)) => return self.process_entries(data, cb, &top, entries),
                    Err(message) => {
                        if self.strict {
                            bail!(
                                "{}",
                                ArError {
                                    offset: top.offset,
                                    size: top.size,
                                    recognizer: rec,
                                    message,
                                }
                            );
                        }
                        self.errors.push(ArError {
                            offset: top.offset,
                            size: top.size,
                            recognizer: rec,
                            message,
                        });
                        break;
                    }
                }
            }
        }
        match self.cdc {
            CdcKind::Fixed => cdc::fixed(self.chunk_max, &top, cb),
            CdcKind::Rolling => cdc::rolling(data, self.chunk_min, self.chunk_max, &top, cb),
        }
        Ok(())
    }

    fn attempt(&self, rec: Recognizer, data: &[u8], top: &Entry) -> Attempt {
        match rec {
            Recognizer::Zip => zip::try_split(data, top),
            Recognizer::Wad => wad::try_split(data, top),
            Recognizer::Wpk => wpk::try_split(data, top),
            Recognizer::Bnk => bnk::try_split(data, top),
            Recognizer::Fsb => fsb::try_split(data, top),
            Recognizer::Fsb5 => fsb5::try_split(data, top),
            Recognizer::MacFat => mac::try_split_fat(data, top),
            Recognizer::MacExe => mac::try_split_exe(data, top, self.chunk_min),
            Recognizer::Pe => pe::try_split(data, top),
            Recognizer::Mpq => mpq::try_split(data, top),
            Recognizer::Load => load::try_split(data, top),
        }
    }

    /// Commit a recogniser's entries: sort, drop empties and overlaps, fill
    /// every gap with a leftover range inheriting the parent's entropy flag,
    /// and recurse into each entry.
    fn process_entries(
        &mut self,
        data: &[u8],
        cb: &mut dyn FnMut(Entry),
        top: &Entry,
        mut entries: Vec<Entry>,
    ) -> Result<()> {
        // Ascending offset; larger size first on ties so zero-length headers
        // at the same offset are handled deterministically.
        entries.sort_by(|l, r| l.offset.cmp(&r.offset).then(r.size.cmp(&l.size)));

        let mut cur = top.offset;
        for entry in entries {
            if entry.size == 0 {
                continue;
            }
            if entry.offset < cur {
                continue;
            }
            if entry.offset > cur {
                self.process(
                    data,
                    cb,
                    Entry {
                        offset: cur,
                        size: entry.offset - cur,
                        high_entropy: top.high_entropy,
                        nest: false,
                    },
                )?;
            }
            self.process(data, cb, entry)?;
            cur = entry.offset + entry.size;
        }
        let end = top.offset + top.size;
        if cur < end {
            self.process(
                data,
                cb,
                Entry {
                    offset: cur,
                    size: end - cur,
                    high_entropy: top.high_entropy,
                    nest: false,
                },
            )?;
        }
        Ok(())
    }
}
