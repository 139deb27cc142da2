//! Local bounded caches under a cache directory.
//!
//! Four named caches: `contents` (data blob ranges), `metadata`
//! (decrypted metadata payloads), `indexes` (index blob bodies) and
//! `blob-list` (time-bounded listings). Each cache is a flat directory
//! of files written via temp-then-rename; a background sweeper evicts
//! by age and LRU order down to the byte budget, never touching
//! entries younger than the minimum sweep age.

use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex};

use anyhow::{bail, Context, Error};
use serde::{Deserialize, Serialize};

use hbk_api_types::{BlobId, BlobKind, BlobMeta, CacheConfig, CacheLimits, ContentId};
use hbk_tools::task::TaskContext;

use crate::blob_store::{list_blobs, BlobStore};

pub const CACHE_CONTENTS: &str = "contents";
pub const CACHE_METADATA: &str = "metadata";
pub const CACHE_INDEXES: &str = "indexes";
pub const CACHE_BLOB_LIST: &str = "blob-list";

/// One named on-disk cache.
pub struct DiskCache {
    dir: PathBuf,
    limits: CacheLimits,
}

impl DiskCache {
    fn new(root: &PathBuf, name: &str, limits: CacheLimits) -> Result<Self, Error> {
        let dir = root.join(name);
        hbk_tools::fs::create_path(&dir)?;
        Ok(Self { dir, limits })
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.dir.join(key)
    }

    /// Cache hit refreshes the entry's age.
    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        let path = self.entry_path(key);
        match std::fs::read(&path) {
            Ok(data) => {
                let _ = hbk_tools::fs::set_file_mtime(&path, hbk_tools::time::epoch_i64());
                Some(data)
            }
            Err(_) => None,
        }
    }

    /// Best effort: a failed cache write only costs a re-fetch later.
    pub fn put(&self, key: &str, data: &[u8]) {
        if let Err(err) = hbk_tools::fs::replace_file(self.entry_path(key), data, false) {
            log::warn!("cache write for '{}' failed - {}", key, err);
        }
    }

    pub fn remove(&self, key: &str) {
        let _ = std::fs::remove_file(self.entry_path(key));
    }

    /// Evict by age and LRU order down to the byte budget.
    pub fn sweep(&self, now: i64) -> Result<(usize, u64), Error> {
        let mut entries: Vec<(PathBuf, i64, u64)> = Vec::new();
        let mut total: u64 = 0;
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let metadata = match entry.metadata() {
                Ok(metadata) if metadata.is_file() => metadata,
                _ => continue,
            };
            let mtime = metadata
                .modified()?
                .duration_since(std::time::UNIX_EPOCH)
                .map(|duration| duration.as_secs() as i64)
                .unwrap_or(0);
            total += metadata.len();
            entries.push((entry.path(), mtime, metadata.len()));
        }

        if total <= self.limits.max_bytes {
            return Ok((0, 0));
        }

        entries.sort_by_key(|(_, mtime, _)| *mtime);

        let mut removed = 0;
        let mut removed_bytes = 0;
        for (path, mtime, size) in entries {
            if total <= self.limits.max_bytes {
                break;
            }
            // entries younger than the minimum age survive even under
            // pressure
            if now - mtime < self.limits.min_sweep_age {
                continue;
            }
            if std::fs::remove_file(&path).is_ok() {
                total -= size;
                removed += 1;
                removed_bytes += size;
            }
        }
        Ok((removed, removed_bytes))
    }

    pub fn clear(&self) -> Result<(), Error> {
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                std::fs::remove_file(entry.path())?;
            }
        }
        Ok(())
    }
}

#[derive(Serialize, Deserialize)]
struct CachedListing {
    fetched: i64,
    blobs: Vec<BlobMeta>,
}

struct SweeperControl {
    stopped: Mutex<bool>,
    wakeup: Condvar,
}

// The sweeper thread owns this inner state, never the CacheLayer
// itself, so dropping the layer can always join the thread.
struct CacheShared {
    config: CacheConfig,
    contents: DiskCache,
    metadata: DiskCache,
    indexes: DiskCache,
    blob_list: DiskCache,
}

impl CacheShared {
    /// One sweep pass over every cache.
    fn sweep_all(&self) {
        let now = hbk_tools::time::epoch_i64();
        for (name, cache) in [
            (CACHE_CONTENTS, &self.contents),
            (CACHE_METADATA, &self.metadata),
            (CACHE_INDEXES, &self.indexes),
            (CACHE_BLOB_LIST, &self.blob_list),
        ] {
            match cache.sweep(now) {
                Ok((0, _)) => {}
                Ok((removed, removed_bytes)) => {
                    log::debug!(
                        "cache '{}': evicted {} entries ({} bytes)",
                        name,
                        removed,
                        removed_bytes
                    );
                }
                Err(err) => log::warn!("cache '{}' sweep failed - {}", name, err),
            }
        }
    }
}

/// All caches of one repository client, plus the background sweeper.
pub struct CacheLayer {
    root: PathBuf,
    shared: Arc<CacheShared>,
    control: Arc<SweeperControl>,
    sweeper: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl CacheLayer {
    pub fn new(root: impl Into<PathBuf>, config: CacheConfig) -> Result<Arc<Self>, Error> {
        let root: PathBuf = root.into();
        hbk_tools::fs::create_path(&root)?;

        let blob_list_limits = CacheLimits {
            max_bytes: 64 * 1024 * 1024,
            min_sweep_age: 0,
            sweep_interval: config.indexes.sweep_interval,
        };

        let shared = Arc::new(CacheShared {
            contents: DiskCache::new(&root, CACHE_CONTENTS, config.contents)?,
            metadata: DiskCache::new(&root, CACHE_METADATA, config.metadata)?,
            indexes: DiskCache::new(&root, CACHE_INDEXES, config.indexes)?,
            blob_list: DiskCache::new(&root, CACHE_BLOB_LIST, blob_list_limits)?,
            config,
        });
        let control = Arc::new(SweeperControl {
            stopped: Mutex::new(false),
            wakeup: Condvar::new(),
        });

        let interval = [
            config.contents.sweep_interval,
            config.metadata.sweep_interval,
            config.indexes.sweep_interval,
        ]
        .into_iter()
        .filter(|secs| *secs > 0)
        .min()
        .unwrap_or(60)
        .max(1) as u64;

        let thread_shared = shared.clone();
        let thread_control = control.clone();
        let handle = std::thread::Builder::new()
            .name("cache-sweeper".to_string())
            .spawn(move || loop {
                {
                    let stopped = thread_control.stopped.lock().unwrap();
                    let (stopped, _timeout) = thread_control
                        .wakeup
                        .wait_timeout(stopped, std::time::Duration::from_secs(interval))
                        .unwrap();
                    if *stopped {
                        return;
                    }
                }
                thread_shared.sweep_all();
            })
            .context("unable to spawn cache sweeper")?;

        Ok(Arc::new(Self {
            root,
            shared,
            control,
            sweeper: Mutex::new(Some(handle)),
        }))
    }

    pub fn root(&self) -> &PathBuf {
        &self.root
    }

    /// One immediate sweep pass over every cache.
    pub fn sweep_all(&self) {
        self.shared.sweep_all();
    }

    fn range_cache(&self, id: &BlobId) -> &DiskCache {
        match id.kind() {
            BlobKind::PackMetadata => &self.shared.metadata,
            _ => &self.shared.contents,
        }
    }

    fn range_key(id: &BlobId, offset: u64, length: u64) -> String {
        format!("{}.{}.{}", id, offset, length)
    }

    /// Read a blob range through the appropriate range cache.
    pub fn get_or_fetch_range(
        &self,
        store: &dyn BlobStore,
        id: &BlobId,
        offset: u64,
        length: u64,
    ) -> Result<Vec<u8>, Error> {
        let cache = self.range_cache(id);
        let key = Self::range_key(id, offset, length);
        if let Some(data) = cache.get(&key) {
            if data.len() as u64 == length {
                return Ok(data);
            }
            cache.remove(&key);
        }
        let data = store.get_blob(id, offset, Some(length))?;
        cache.put(&key, &data);
        Ok(data)
    }

    /// Decrypted metadata payloads, keyed by content id.
    pub fn get_metadata_content(&self, id: &ContentId) -> Option<Vec<u8>> {
        self.shared.metadata.get(&id.to_string())
    }

    pub fn put_metadata_content(&self, id: &ContentId, data: &[u8]) {
        self.shared.metadata.put(&id.to_string(), data)
    }

    /// Index blob bodies, keyed by blob id.
    pub fn get_or_fetch_index_blob(
        &self,
        store: &dyn BlobStore,
        id: &BlobId,
    ) -> Result<Vec<u8>, Error> {
        if let Some(data) = self.shared.indexes.get(id.as_str()) {
            return Ok(data);
        }
        let data = store.get_blob(id, 0, None)?;
        self.shared.indexes.put(id.as_str(), &data);
        Ok(data)
    }

    /// Blob listing with a TTL; a lookup past the TTL is a miss and
    /// refreshes.
    pub fn cached_blob_list(
        &self,
        store: &dyn BlobStore,
        prefix: &str,
        task: &dyn TaskContext,
    ) -> Result<Vec<BlobMeta>, Error> {
        let key = format!("list-{}", prefix);
        let now = hbk_tools::time::epoch_i64();

        if let Some(data) = self.shared.blob_list.get(&key) {
            if let Ok(cached) = serde_json::from_slice::<CachedListing>(&data) {
                if now - cached.fetched <= self.shared.config.blob_list_ttl {
                    return Ok(cached.blobs);
                }
            }
        }

        let blobs = list_blobs(store, prefix, task)?;
        let cached = CachedListing {
            fetched: now,
            blobs: blobs.clone(),
        };
        if let Ok(data) = serde_json::to_vec(&cached) {
            self.shared.blob_list.put(&key, &data);
        }
        Ok(blobs)
    }

    /// Drop all cached listings, e.g. after this client changed the
    /// blob set itself.
    pub fn invalidate_blob_lists(&self) {
        let _ = self.shared.blob_list.clear();
    }

    /// Wipe one named cache, or all of them.
    pub fn clear(&self, partial: Option<&str>) -> Result<(), Error> {
        match partial {
            None => {
                self.shared.contents.clear()?;
                self.shared.metadata.clear()?;
                self.shared.indexes.clear()?;
                self.shared.blob_list.clear()?;
            }
            Some(CACHE_CONTENTS) => self.shared.contents.clear()?,
            Some(CACHE_METADATA) => self.shared.metadata.clear()?,
            Some(CACHE_INDEXES) => self.shared.indexes.clear()?,
            Some(CACHE_BLOB_LIST) => self.shared.blob_list.clear()?,
            Some(other) => bail!("unknown cache '{}'", other),
        }
        Ok(())
    }

    fn shutdown(&self) {
        {
            let mut stopped = self.control.stopped.lock().unwrap();
            *stopped = true;
            self.control.wakeup.notify_all();
        }
        if let Some(handle) = self.sweeper.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for CacheLayer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::backend::MemoryStore;
    use crate::blob_store::PutOptions;
    use hbk_tools::task::SimpleTask;

    fn test_config() -> CacheConfig {
        CacheConfig {
            contents: CacheLimits {
                max_bytes: 1024,
                min_sweep_age: 0,
                sweep_interval: 3600,
            },
            metadata: CacheLimits::new(1024 * 1024),
            indexes: CacheLimits::new(1024 * 1024),
            blob_list_ttl: 3600,
        }
    }

    #[test]
    fn range_cache_hits_after_fetch() -> Result<(), Error> {
        let dir = tempfile::tempdir()?;
        let layer = CacheLayer::new(dir.path(), test_config())?;
        let store = MemoryStore::new();

        let id = BlobId::from("pdeadbeef");
        store.put_blob(&id, b"0123456789", &PutOptions::default())?;

        assert_eq!(layer.get_or_fetch_range(&store, &id, 2, 4)?, b"2345");

        // served from cache even after the blob is gone
        store.delete_blob(&id)?;
        assert_eq!(layer.get_or_fetch_range(&store, &id, 2, 4)?, b"2345");
        Ok(())
    }

    #[test]
    fn sweep_respects_budget_and_min_age() -> Result<(), Error> {
        let dir = tempfile::tempdir()?;
        let layer = CacheLayer::new(dir.path(), test_config())?;

        for i in 0..10 {
            layer.shared.contents.put(&format!("entry-{}", i), &[0u8; 256]);
        }
        let now = hbk_tools::time::epoch_i64();

        // young entries survive when min age protects them
        let protective = DiskCache {
            dir: layer.shared.contents.dir.clone(),
            limits: CacheLimits {
                max_bytes: 1024,
                min_sweep_age: 3600,
                sweep_interval: 3600,
            },
        };
        let (removed, _) = protective.sweep(now)?;
        assert_eq!(removed, 0);

        // without protection the budget is enforced
        let (removed, removed_bytes) = layer.shared.contents.sweep(now + 10)?;
        assert_eq!(removed, 6);
        assert_eq!(removed_bytes, 6 * 256);
        Ok(())
    }

    #[test]
    fn blob_list_ttl() -> Result<(), Error> {
        let dir = tempfile::tempdir()?;
        let layer = CacheLayer::new(dir.path(), test_config())?;
        let store = MemoryStore::new();
        let task = SimpleTask::new("test");

        store.put_blob(&BlobId::from("p1"), b"x", &PutOptions::default())?;
        assert_eq!(layer.cached_blob_list(&store, "p", &task)?.len(), 1);

        // within the TTL the stale listing is served
        store.put_blob(&BlobId::from("p2"), b"y", &PutOptions::default())?;
        assert_eq!(layer.cached_blob_list(&store, "p", &task)?.len(), 1);

        layer.invalidate_blob_lists();
        assert_eq!(layer.cached_blob_list(&store, "p", &task)?.len(), 2);
        Ok(())
    }

    #[test]
    fn clear_partial() -> Result<(), Error> {
        let dir = tempfile::tempdir()?;
        let layer = CacheLayer::new(dir.path(), test_config())?;

        layer.shared.contents.put("a", b"1");
        layer.shared.indexes.put("b", b"2");
        layer.clear(Some(CACHE_CONTENTS))?;
        assert!(layer.shared.contents.get("a").is_none());
        assert!(layer.shared.indexes.get("b").is_some());

        layer.clear(None)?;
        assert!(layer.shared.indexes.get("b").is_none());
        assert!(layer.clear(Some("bogus")).is_err());
        Ok(())
    }
}
