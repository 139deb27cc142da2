//! The content index: an append-only union of generations.
//!
//! Each generation is one index blob, held in memory as a sorted run.
//! Readers work on a copy-on-write snapshot of the generation list, so
//! lookups never take a lock while a writer registers a flush or a
//! compaction replaces the list.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use anyhow::Error;

use hbk_api_types::{BlobId, BlobMeta, ContentId, ContentRange};
use hbk_tools::task::TaskContext;

/// Entry is a tombstone: hidden from lookup, bytes preserved.
pub const ENTRY_FLAG_DELETED: u8 = 1;

/// Tombstone written by `forget`; compaction may drop it (and orphan
/// the bytes) after the short extra margin instead of the full safety
/// window.
pub const ENTRY_FLAG_SHORT_DROP: u8 = 2;

/// Current entry format version, recorded per entry.
pub const ENTRY_FORMAT_VERSION: u8 = 2;

/// One content→pack-location record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndexEntry {
    pub content: ContentId,
    /// Pack blob holding the payload; `None` on tombstones.
    pub pack: Option<BlobId>,
    /// Byte offset of the payload inside the pack.
    pub offset: u32,
    /// Stored (compressed and encrypted) payload length.
    pub stored_length: u32,
    /// Plaintext length before compression.
    pub original_length: u32,
    /// Compression header id, see [crate::compression].
    pub compression: u32,
    /// Epoch seconds; the entry with the greatest timestamp wins.
    pub timestamp: i64,
    pub flags: u8,
    pub format_version: u8,
}

impl IndexEntry {
    pub fn is_deleted(&self) -> bool {
        self.flags & ENTRY_FLAG_DELETED != 0
    }

    pub fn is_short_drop(&self) -> bool {
        self.flags & ENTRY_FLAG_SHORT_DROP != 0
    }

    /// Winner rule across generations: greatest timestamp, tombstone
    /// wins a timestamp tie.
    pub fn supersedes(&self, other: &IndexEntry) -> bool {
        if self.timestamp != other.timestamp {
            return self.timestamp > other.timestamp;
        }
        self.is_deleted() && !other.is_deleted()
    }
}

/// One live index blob, decoded and sorted.
pub struct Generation {
    meta: BlobMeta,
    entries: Vec<IndexEntry>,
}

impl Generation {
    pub fn new(meta: BlobMeta, mut entries: Vec<IndexEntry>) -> Self {
        entries.sort_by(|a, b| a.content.cmp(&b.content));
        Self { meta, entries }
    }

    pub fn meta(&self) -> &BlobMeta {
        &self.meta
    }

    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn lookup(&self, id: &ContentId) -> Option<&IndexEntry> {
        let pos = self
            .entries
            .binary_search_by(|entry| entry.content.cmp(id))
            .ok()?;
        Some(&self.entries[pos])
    }
}

/// Iteration scope for [IndexSet::iterate_contents].
#[derive(Clone, Copy, Debug)]
pub struct IterateOptions {
    pub range: ContentRange,
    pub include_deleted: bool,
}

impl Default for IterateOptions {
    fn default() -> Self {
        Self {
            range: ContentRange::all(),
            include_deleted: false,
        }
    }
}

/// The in-memory union of all live generations.
pub struct IndexSet {
    generations: RwLock<Arc<Vec<Arc<Generation>>>>,
    /// While set, `replace_all` becomes a no-op so long scans observe
    /// a stable generation list.
    refresh_disabled: AtomicBool,
}

impl Default for IndexSet {
    fn default() -> Self {
        Self::new()
    }
}

impl IndexSet {
    pub fn new() -> Self {
        Self {
            generations: RwLock::new(Arc::new(Vec::new())),
            refresh_disabled: AtomicBool::new(false),
        }
    }

    /// Cheap copy-on-write snapshot of the generation list.
    pub fn snapshot(&self) -> Arc<Vec<Arc<Generation>>> {
        self.generations.read().unwrap().clone()
    }

    /// Add one generation after a flush.
    pub fn register(&self, generation: Generation) {
        let mut guard = self.generations.write().unwrap();
        let mut list: Vec<Arc<Generation>> = guard.as_ref().clone();
        list.push(Arc::new(generation));
        *guard = Arc::new(list);
    }

    /// Swap in a freshly loaded generation list. Returns false while a
    /// scan holds the list frozen.
    pub fn replace_all(&self, generations: Vec<Generation>) -> bool {
        if self.refresh_disabled.load(Ordering::SeqCst) {
            return false;
        }
        let list: Vec<Arc<Generation>> = generations.into_iter().map(Arc::new).collect();
        *self.generations.write().unwrap() = Arc::new(list);
        true
    }

    pub fn set_refresh_disabled(&self, disabled: bool) {
        self.refresh_disabled.store(disabled, Ordering::SeqCst);
    }

    pub fn refresh_disabled(&self) -> bool {
        self.refresh_disabled.load(Ordering::SeqCst)
    }

    /// Metadata of all live index blobs.
    pub fn index_blobs(&self) -> Vec<BlobMeta> {
        self.snapshot()
            .iter()
            .map(|generation| generation.meta().clone())
            .collect()
    }

    /// Effective entry for `id`: the winner across all generations,
    /// tombstones included.
    pub fn lookup(&self, id: &ContentId) -> Option<IndexEntry> {
        let snapshot = self.snapshot();
        let mut winner: Option<&IndexEntry> = None;
        for generation in snapshot.iter() {
            if let Some(entry) = generation.lookup(id) {
                match winner {
                    Some(current) if !entry.supersedes(current) => {}
                    _ => winner = Some(entry),
                }
            }
        }
        winner.cloned()
    }

    /// Effective entries in `range`, keyed by content id.
    pub fn effective_entries(
        &self,
        opts: &IterateOptions,
        task: &dyn TaskContext,
    ) -> Result<BTreeMap<ContentId, IndexEntry>, Error> {
        let snapshot = self.snapshot();
        let mut merged: BTreeMap<ContentId, IndexEntry> = BTreeMap::new();
        for generation in snapshot.iter() {
            for entry in generation.entries() {
                task.check_abort()?;
                if !opts.range.contains(&entry.content) {
                    continue;
                }
                match merged.get(&entry.content) {
                    Some(current) if !entry.supersedes(current) => {}
                    _ => {
                        merged.insert(entry.content, entry.clone());
                    }
                }
            }
        }
        if !opts.include_deleted {
            merged.retain(|_, entry| !entry.is_deleted());
        }
        Ok(merged)
    }

    /// Visit effective entries in id order.
    pub fn iterate_contents(
        &self,
        opts: &IterateOptions,
        task: &dyn TaskContext,
        cb: &mut dyn FnMut(&IndexEntry) -> Result<(), Error>,
    ) -> Result<(), Error> {
        for entry in self.effective_entries(opts, task)?.values() {
            task.check_abort()?;
            cb(entry)?;
        }
        Ok(())
    }

    /// Visit effective entries on `threads` worker threads. The first
    /// callback error aborts the iteration.
    pub fn iterate_contents_parallel(
        &self,
        opts: &IterateOptions,
        threads: usize,
        task: &dyn TaskContext,
        cb: &(dyn Fn(&IndexEntry) -> Result<(), Error> + Send + Sync),
    ) -> Result<(), Error> {
        let entries = self.effective_entries(opts, task)?;
        if threads <= 1 {
            for entry in entries.values() {
                task.check_abort()?;
                cb(entry)?;
            }
            return Ok(());
        }

        let (sender, receiver) = crossbeam_channel::bounded::<IndexEntry>(threads * 8);
        let first_error: Mutex<Option<Error>> = Mutex::new(None);

        std::thread::scope(|scope| {
            for _ in 0..threads {
                let receiver = receiver.clone();
                let first_error = &first_error;
                scope.spawn(move || {
                    while let Ok(entry) = receiver.recv() {
                        if first_error.lock().unwrap().is_some() {
                            break;
                        }
                        if let Err(err) = cb(&entry) {
                            first_error.lock().unwrap().get_or_insert(err);
                            break;
                        }
                    }
                });
            }
            drop(receiver);

            for entry in entries.into_values() {
                if task.check_abort().is_err() || first_error.lock().unwrap().is_some() {
                    break;
                }
                if sender.send(entry).is_err() {
                    break;
                }
            }
            drop(sender);
        });

        task.check_abort()?;
        match first_error.into_inner().unwrap() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Union of the given generations with the winner rule applied,
/// tombstones included, sorted by content id. Used by compaction and
/// by index statistics.
pub fn merge_generations(
    generations: &[Arc<Generation>],
    task: &dyn TaskContext,
) -> Result<Vec<IndexEntry>, Error> {
    let mut merged: BTreeMap<ContentId, IndexEntry> = BTreeMap::new();
    for generation in generations {
        for entry in generation.entries() {
            task.check_abort()?;
            match merged.get(&entry.content) {
                Some(current) if !entry.supersedes(current) => {}
                _ => {
                    merged.insert(entry.content, entry.clone());
                }
            }
        }
    }
    Ok(merged.into_values().collect())
}
