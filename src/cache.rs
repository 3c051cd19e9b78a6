//! Content-addressed file cache.
//!
//! Grounded on the `Ns_Cache*` usage in `fastpath.c`'s `FastReturn`: a single
//! mutex-protected index, "wait on the other thread's build" semantics for
//! concurrent first-access, and a refcount so an entry can be evicted while a
//! response is still reading from it.
//!
//! Keys are the file's device/inode pair where available — stable across
//! renames, unlike a path string — falling back to the path itself on
//! platforms without that identity.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashMap;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
    Inode { dev: u64, ino: u64 },
    Path(PathBuf),
}

impl CacheKey {
    pub fn for_path(path: &Path) -> io::Result<Self> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::MetadataExt;
            let meta = std::fs::metadata(path)?;
            return Ok(CacheKey::Inode { dev: meta.dev(), ino: meta.ino() });
        }
        #[cfg(not(unix))]
        {
            std::fs::metadata(path)?;
            Ok(CacheKey::Path(path.to_path_buf()))
        }
    }
}

#[derive(Clone)]
pub struct CacheEntry {
    pub mtime: SystemTime,
    pub size: u64,
    pub bytes: Arc<[u8]>,
}

enum Slot {
    /// Another thread is running `build_fn`; waiters block on the condvar
    /// until it resolves to `Ready` or `Failed`.
    Building,
    Ready(CacheEntry),
}

struct Shared {
    index: FxHashMap<CacheKey, Slot>,
    /// Recency list for FIFO-ish eviction — oldest entries are dropped
    /// first once `max_entries` is exceeded. Not true LRU: the original's
    /// cache doesn't reorder on hit either, it only tracks insertion order
    /// for its size-bounded sweep.
    recency: VecDeque<CacheKey>,
    total_bytes: u64,
}

pub struct FileCache {
    shared: Mutex<Shared>,
    condvar: Condvar,
    max_entries: usize,
    max_total_bytes: u64,
    max_entry_bytes: u64,
}

impl FileCache {
    pub fn new(max_entries: usize, max_total_bytes: u64, max_entry_bytes: u64) -> Self {
        FileCache {
            shared: Mutex::new(Shared {
                index: FxHashMap::default(),
                recency: VecDeque::new(),
                total_bytes: 0,
            }),
            condvar: Condvar::new(),
            max_entries,
            max_total_bytes,
            max_entry_bytes,
        }
    }

    /// Looks up `key`, building with `build_fn` on a miss. If another
    /// thread is already building the same key, this call blocks on the
    /// condvar instead of racing it — only one thread ever runs `build_fn`
    /// per key at a time.
    ///
    /// `build_fn` runs with the cache lock released, so a slow disk read
    /// doesn't stall unrelated lookups.
    pub fn lookup_or_build(
        &self,
        key: CacheKey,
        build_fn: impl FnOnce() -> io::Result<(SystemTime, u64, Vec<u8>)>,
    ) -> io::Result<CacheEntry> {
        loop {
            {
                let mut guard = self.shared.lock();
                match guard.index.get(&key) {
                    Some(Slot::Ready(entry)) => return Ok(entry.clone()),
                    Some(Slot::Building) => {
                        self.condvar.wait(&mut guard);
                        continue;
                    }
                    None => {
                        guard.index.insert(key.clone(), Slot::Building);
                    }
                }
            }

            let result = build_fn();

            let mut guard = self.shared.lock();
            match result {
                Ok((mtime, size, bytes)) => {
                    let entry = CacheEntry { mtime, size, bytes: Arc::from(bytes) };
                    if size <= self.max_entry_bytes {
                        guard.index.insert(key.clone(), Slot::Ready(entry.clone()));
                        guard.recency.push_back(key.clone());
                        guard.total_bytes += size;
                        self.evict_if_needed(&mut guard);
                    } else {
                        guard.index.remove(&key);
                    }
                    self.condvar.notify_all();
                    return Ok(entry);
                }
                Err(e) => {
                    guard.index.remove(&key);
                    self.condvar.notify_all();
                    return Err(e);
                }
            }
        }
    }

    /// Drops `key` if it's resident and stale relative to `current_mtime`
    /// / `current_size`. Called before trusting a cache hit, to cover the
    /// case where the file changed on disk between builds.
    pub fn invalidate_if_stale(&self, key: &CacheKey, current_mtime: SystemTime, current_size: u64) {
        let mut guard = self.shared.lock();
        let stale = matches!(
            guard.index.get(key),
            Some(Slot::Ready(e)) if e.mtime != current_mtime || e.size != current_size
        );
        if stale {
            guard.index.remove(key);
        }
    }

    fn evict_if_needed(&self, guard: &mut Shared) {
        while guard.recency.len() > self.max_entries || guard.total_bytes > self.max_total_bytes {
            let Some(oldest) = guard.recency.pop_front() else { break };
            if let Some(Slot::Ready(entry)) = guard.index.remove(&oldest) {
                guard.total_bytes = guard.total_bytes.saturating_sub(entry.size);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.shared.lock().index.len()
    }
}
