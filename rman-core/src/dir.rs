//! Case-insensitive directory overlay over a manifest: the lookup side of a
//! read-only mount. Chunk lists are held eagerly, or lazily through a weak
//! handle that is refcounted by open/close and reloaded on demand.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};

use anyhow::Result;

use crate::chunk::{ChunkDst, FileId};
use crate::file::RFile;

pub struct ChunksHolder {
    file_id: FileId,
    size: u64,
    state: HolderState,
}

enum HolderState {
    Eager(Arc<Vec<ChunkDst>>),
    Lazy { cached: Mutex<Weak<Vec<ChunkDst>>>, refs: AtomicU32 },
}

impl ChunksHolder {
    pub fn file_id(&self) -> FileId {
        self.file_id
    }
}

#[derive(Default)]
pub struct DirEntry {
    name: String,
    time: u64,
    link: String,
    exec: bool,
    children: Vec<DirEntry>,
    chunks: Option<Arc<ChunksHolder>>,
}

fn cmp_ci(a: &str, b: &str) -> std::cmp::Ordering {
    a.bytes().map(|c| c.to_ascii_lowercase()).cmp(b.bytes().map(|c| c.to_ascii_lowercase()))
}

impl DirEntry {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn time(&self) -> u64 {
        self.time
    }

    pub fn link(&self) -> &str {
        &self.link
    }

    pub fn is_exec(&self) -> bool {
        self.exec
    }

    pub fn is_dir(&self) -> bool {
        self.chunks.is_none()
    }

    pub fn children(&self) -> &[DirEntry] {
        &self.children
    }

    /// File size for leaves, child count for directories.
    pub fn size(&self) -> u64 {
        match &self.chunks {
            Some(holder) => holder.size,
            None => self.children.len() as u64,
        }
    }

    pub fn holder(&self) -> Option<&Arc<ChunksHolder>> {
        self.chunks.as_ref()
    }

    /// Resolve the chunk list, loading through `loader` when the lazy cache
    /// is empty. The returned `Arc` keeps the list alive independently of
    /// open/close.
    pub fn chunks(
        &self,
        loader: impl FnOnce(FileId) -> Result<Vec<ChunkDst>>,
    ) -> Result<Option<Arc<Vec<ChunkDst>>>> {
        let Some(holder) = &self.chunks else { return Ok(None) };
        match &holder.state {
            HolderState::Eager(list) => Ok(Some(list.clone())),
            HolderState::Lazy { cached, .. } => {
                let mut cached = cached.lock().unwrap();
                if let Some(list) = cached.upgrade() {
                    return Ok(Some(list));
                }
                let list = Arc::new(loader(holder.file_id)?);
                *cached = Arc::downgrade(&list);
                Ok(Some(list))
            }
        }
    }

    /// Pin a lazy chunk list for the duration of an open file handle.
    pub fn open(&self) {
        if let Some(holder) = &self.chunks {
            if let HolderState::Lazy { refs, .. } = &holder.state {
                refs.fetch_add(1, Ordering::AcqRel);
            }
        }
    }

    /// Release one pin; the cached list is dropped with the last one.
    pub fn close(&self) {
        if let Some(holder) = &self.chunks {
            if let HolderState::Lazy { cached, refs } = &holder.state {
                if refs.fetch_sub(1, Ordering::AcqRel) == 1 {
                    *cached.lock().unwrap() = Weak::new();
                }
            }
        }
    }

    /// Case-insensitive lookup by `/`-separated path.
    pub fn find(&self, path: &str) -> Option<&DirEntry> {
        let mut cur = self;
        for name in path.split('/') {
            if name.is_empty() {
                continue;
            }
            let i = cur
                .children
                .binary_search_by(|child| cmp_ci(&child.name, name))
                .ok()?;
            cur = &cur.children[i];
        }
        Some(cur)
    }
}

/// Builds the tree from manifest files; duplicate chunk lists (same fileId)
/// are fused into one shared holder.
#[derive(Default)]
pub struct DirBuilder {
    root: DirEntry,
    shared: HashMap<FileId, Arc<ChunksHolder>>,
}

impl DirBuilder {
    pub fn new() -> DirBuilder {
        DirBuilder::default()
    }

    pub fn add(&mut self, file: RFile) {
        let mut cur = &mut self.root;
        for name in file.path.split('/') {
            if name.is_empty() {
                continue;
            }
            let i = match cur.children.binary_search_by(|child| cmp_ci(&child.name, name)) {
                Ok(i) => i,
                Err(i) => {
                    cur.children.insert(
                        i,
                        DirEntry { name: name.to_string(), time: file.time, ..Default::default() },
                    );
                    i
                }
            };
            cur = &mut cur.children[i];
        }
        if cur.chunks.is_some() {
            return;
        }
        let holder = self.shared.entry(file.file_id).or_insert_with(|| {
            let state = match file.chunks {
                Some(list) => HolderState::Eager(Arc::new(list)),
                None => HolderState::Lazy {
                    cached: Mutex::new(Weak::new()),
                    refs: AtomicU32::new(0),
                },
            };
            Arc::new(ChunksHolder { file_id: file.file_id, size: file.size, state })
        });
        cur.chunks = Some(holder.clone());
        cur.link = file.link;
        if file.permissions & 0o1 != 0 {
            cur.exec = true;
        }
    }

    pub fn finish(self) -> DirEntry {
        self.root
    }
}
