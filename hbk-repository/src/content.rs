//! The content manager: public content read/write/delete API.
//!
//! Writes are deduplicated against the index and the open session; two
//! concurrent writes of the same bytes coalesce on a per-content
//! single-flight so exactly one pack append happens. Reads verify the
//! recomputed digest against the content id, so corruption is caught
//! on every pack read.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};

use anyhow::{bail, Error};

use hbk_api_types::{ContentId, ContentRange, ContentStats, VerifyStats};
use hbk_tools::crypt_config::CryptConfig;
use hbk_tools::task::TaskContext;
use hbk_tools::task_warn;

use crate::blob_store::BlobStore;
use crate::cache::CacheLayer;
use crate::compression;
use crate::error::{RepoError, StoreError};
use crate::index::{IndexEntry, IndexSet, IterateOptions};
use crate::pack::{content_ad, IndexNamer, PackBuilder};

struct Flight {
    done: Mutex<bool>,
    cond: Condvar,
}

enum FlightRole {
    Leader,
    Follower(Arc<Flight>),
}

/// Per-content write coalescing: a map from content id to a pending
/// flight, not a lock over the whole index.
#[derive(Default)]
struct SingleFlight {
    inflight: Mutex<HashMap<ContentId, Arc<Flight>>>,
}

impl SingleFlight {
    fn begin(&self, id: ContentId) -> FlightRole {
        let mut inflight = self.inflight.lock().unwrap();
        match inflight.get(&id) {
            Some(flight) => FlightRole::Follower(flight.clone()),
            None => {
                inflight.insert(
                    id,
                    Arc::new(Flight {
                        done: Mutex::new(false),
                        cond: Condvar::new(),
                    }),
                );
                FlightRole::Leader
            }
        }
    }

    fn finish(&self, id: &ContentId) {
        let flight = self.inflight.lock().unwrap().remove(id);
        if let Some(flight) = flight {
            *flight.done.lock().unwrap() = true;
            flight.cond.notify_all();
        }
    }

    fn wait(flight: &Flight) {
        let mut done = flight.done.lock().unwrap();
        while !*done {
            done = flight.cond.wait(done).unwrap();
        }
    }
}

/// Scope and sampling of a verification pass.
#[derive(Clone, Copy, Debug)]
pub struct VerifyOptions {
    /// Re-read and decrypt this percentage of entries (0..=100).
    pub percent: u8,
    pub include_deleted: bool,
    /// Worker threads; 1 means sequential.
    pub parallel: usize,
    pub range: ContentRange,
}

impl Default for VerifyOptions {
    fn default() -> Self {
        Self {
            percent: 0,
            include_deleted: false,
            parallel: 1,
            range: ContentRange::all(),
        }
    }
}

/// Public content API, orchestrating the pack builder and the index.
pub struct ContentManager {
    store: Arc<dyn BlobStore>,
    crypt: Arc<CryptConfig>,
    indexes: Arc<IndexSet>,
    builder: Mutex<PackBuilder>,
    cache: Option<Arc<CacheLayer>>,
    write_flight: SingleFlight,
}

impl ContentManager {
    pub fn new(
        store: Arc<dyn BlobStore>,
        crypt: Arc<CryptConfig>,
        indexes: Arc<IndexSet>,
        namer: Arc<dyn IndexNamer>,
        max_pack_size: u64,
        cache: Option<Arc<CacheLayer>>,
    ) -> Self {
        let builder = PackBuilder::new(store.clone(), crypt.clone(), namer, max_pack_size);
        Self {
            store,
            crypt,
            indexes,
            builder: Mutex::new(builder),
            cache,
            write_flight: SingleFlight::default(),
        }
    }

    pub fn store(&self) -> &Arc<dyn BlobStore> {
        &self.store
    }

    pub fn crypt(&self) -> &Arc<CryptConfig> {
        &self.crypt
    }

    pub fn indexes(&self) -> &Arc<IndexSet> {
        &self.indexes
    }

    pub fn cache(&self) -> Option<&Arc<CacheLayer>> {
        self.cache.as_ref()
    }

    /// The id `data` would be stored under.
    pub fn content_id_for(&self, prefix: u8, data: &[u8]) -> Result<ContentId, Error> {
        ContentId::new(prefix, self.crypt.compute_digest(data))
    }

    /// Effective entry including tombstones, session writes first.
    pub fn lookup_entry(&self, id: &ContentId) -> Option<IndexEntry> {
        if let Some(entry) = self.builder.lock().unwrap().pending_entry(id) {
            return Some(entry);
        }
        self.indexes.lookup(id)
    }

    fn live_entry(&self, id: &ContentId) -> Option<IndexEntry> {
        self.lookup_entry(id).filter(|entry| !entry.is_deleted())
    }

    pub fn contains_content(&self, id: &ContentId) -> bool {
        self.live_entry(id).is_some()
    }

    /// Store `data` under its digest. Deduplicated: no I/O when the
    /// content already exists; concurrent writers of the same bytes
    /// coalesce into one pack append.
    pub fn write_content(
        &self,
        prefix: u8,
        data: &[u8],
        task: &dyn TaskContext,
    ) -> Result<ContentId, Error> {
        let id = self.content_id_for(prefix, data)?;

        loop {
            task.check_abort()?;
            if self.live_entry(&id).is_some() {
                return Ok(id);
            }

            match self.write_flight.begin(id) {
                FlightRole::Follower(flight) => {
                    SingleFlight::wait(&flight);
                    // leader finished; re-check and fall out via dedup
                }
                FlightRole::Leader => {
                    let result: Result<(), Error> = (|| {
                        if self.live_entry(&id).is_none() {
                            // a tombstone with a future timestamp must
                            // not outrank the fresh entry
                            let min_timestamp = match self.indexes.lookup(&id) {
                                Some(old) if old.is_deleted() => old.timestamp + 1,
                                _ => 0,
                            };
                            self.builder.lock().unwrap().add_entry(
                                id,
                                data,
                                0,
                                false,
                                min_timestamp,
                                task,
                            )?;
                        }
                        Ok(())
                    })();
                    self.write_flight.finish(&id);
                    result?;
                    return Ok(id);
                }
            }
        }
    }

    fn read_pack_payload(&self, id: &ContentId, entry: &IndexEntry) -> Result<Vec<u8>, Error> {
        let pack = match entry.pack {
            Some(ref pack) => pack.clone(),
            None => bail!(RepoError::ContentCorrupt(*id)),
        };

        if let Some(data) = self.builder.lock().unwrap().read_pending_payload(entry) {
            return Ok(data);
        }

        let result = match self.cache {
            Some(ref cache) => cache.get_or_fetch_range(
                self.store.as_ref(),
                &pack,
                entry.offset as u64,
                entry.stored_length as u64,
            ),
            None => self.store.get_blob(
                &pack,
                entry.offset as u64,
                Some(entry.stored_length as u64),
            ),
        };

        result.map_err(|err| match err.downcast_ref::<StoreError>() {
            Some(StoreError::NotFound(_)) => RepoError::ContentLost(*id, pack).into(),
            _ => err,
        })
    }

    fn decode_payload(&self, id: &ContentId, entry: &IndexEntry, ciphertext: &[u8]) -> Result<Vec<u8>, Error> {
        let payload = self
            .crypt
            .decrypt(&content_ad(id), ciphertext)
            .map_err(|_| RepoError::ContentCorrupt(*id))?;
        let plaintext = compression::decompress(&payload, entry.compression)?;
        if self.crypt.compute_digest(&plaintext) != *id.digest() {
            bail!(RepoError::ContentCorrupt(*id));
        }
        Ok(plaintext)
    }

    /// Fetch and verify one content.
    pub fn get_content(&self, id: &ContentId, task: &dyn TaskContext) -> Result<Vec<u8>, Error> {
        task.check_abort()?;
        let entry = match self.lookup_entry(id) {
            Some(entry) if !entry.is_deleted() => entry,
            _ => bail!(RepoError::ContentNotFound(*id)),
        };

        // decrypted metadata payloads are cached by content id; the
        // id is its own integrity proof there
        if id.is_metadata() {
            if let Some(ref cache) = self.cache {
                if let Some(data) = cache.get_metadata_content(id) {
                    return Ok(data);
                }
            }
        }

        let ciphertext = self.read_pack_payload(id, &entry)?;
        let plaintext = self.decode_payload(id, &entry, &ciphertext)?;

        if id.is_metadata() {
            if let Some(ref cache) = self.cache {
                cache.put_metadata_content(id, &plaintext);
            }
        }
        Ok(plaintext)
    }

    /// Hide `id` behind a tombstone. The pack bytes stay in place
    /// until maintenance reclaims them past the safety window.
    pub fn delete_content(&self, id: &ContentId) -> Result<(), Error> {
        if self.live_entry(id).is_none() {
            bail!(RepoError::ContentNotFound(*id));
        }
        self.builder.lock().unwrap().add_tombstone(*id, false);
        Ok(())
    }

    /// Like [delete_content](Self::delete_content), but marks the
    /// tombstone for early reclamation. Explicitly unsafe under
    /// concurrent writers; callers hold the advanced capability.
    pub fn forget_content(&self, id: &ContentId) -> Result<(), Error> {
        if self.lookup_entry(id).is_none() {
            bail!(RepoError::ContentNotFound(*id));
        }
        self.builder.lock().unwrap().add_tombstone(*id, true);
        Ok(())
    }

    /// Read `id` (tombstoned or not) and write it into a fresh pack
    /// with a superseding timestamp. Used to defragment short packs
    /// and to migrate entry formats.
    pub fn rewrite_content(&self, id: &ContentId, task: &dyn TaskContext) -> Result<(), Error> {
        let entry = self
            .lookup_entry(id)
            .ok_or(RepoError::ContentNotFound(*id))?;
        if entry.pack.is_none() {
            bail!("content '{}' has no stored bytes to rewrite", id);
        }

        let ciphertext = self.read_pack_payload(id, &entry)?;
        let plaintext = self.decode_payload(id, &entry, &ciphertext)?;

        self.builder.lock().unwrap().add_entry(
            *id,
            &plaintext,
            entry.flags,
            true,
            entry.timestamp + 1,
            task,
        )?;
        Ok(())
    }

    /// Warm the cache for the packs holding `ids`. Best effort.
    pub fn prefetch_contents(&self, ids: &[ContentId], task: &dyn TaskContext) -> usize {
        let cache = match self.cache {
            Some(ref cache) => cache,
            None => return 0,
        };

        let mut warmed = 0;
        for id in ids {
            if task.check_abort().is_err() {
                break;
            }
            let entry = match self.live_entry(id) {
                Some(entry) => entry,
                None => continue,
            };
            let pack = match entry.pack {
                Some(ref pack) => pack.clone(),
                None => continue,
            };
            match cache.get_or_fetch_range(
                self.store.as_ref(),
                &pack,
                entry.offset as u64,
                entry.stored_length as u64,
            ) {
                Ok(_) => warmed += 1,
                Err(err) => {
                    task_warn!(task, "prefetch of '{}' failed - {}", id, err);
                }
            }
        }
        warmed
    }

    fn verify_entry(
        &self,
        entry: &IndexEntry,
        percent: u8,
        pack_lengths: &Mutex<HashMap<String, Option<u64>>>,
        stats: &Mutex<VerifyStats>,
        task: &dyn TaskContext,
    ) {
        stats.lock().unwrap().checked += 1;

        let pack = match entry.pack {
            Some(ref pack) => pack.clone(),
            None => return, // tombstone, nothing behind it
        };

        let known_length = {
            let mut lengths = pack_lengths.lock().unwrap();
            match lengths.get(pack.as_str()) {
                Some(length) => *length,
                None => {
                    let length = self.store.get_metadata(&pack).ok().map(|meta| meta.length);
                    lengths.insert(pack.as_str().to_string(), length);
                    length
                }
            }
        };

        match known_length {
            None => {
                task_warn!(
                    task,
                    "content '{}': pack blob '{}' is missing",
                    entry.content,
                    pack
                );
                stats.lock().unwrap().missing += 1;
                return;
            }
            Some(length) => {
                if entry.offset as u64 + entry.stored_length as u64 > length {
                    task_warn!(
                        task,
                        "content '{}': pack blob '{}' is too short",
                        entry.content,
                        pack
                    );
                    stats.lock().unwrap().missing += 1;
                    return;
                }
            }
        }

        // deterministic sampling keyed by the digest
        let sample = u32::from_le_bytes(entry.content.digest()[0..4].try_into().unwrap()) % 100;
        if percent > 0 && sample < percent as u32 {
            let result = self
                .read_pack_payload(&entry.content, entry)
                .and_then(|ciphertext| self.decode_payload(&entry.content, entry, &ciphertext));
            match result {
                Ok(_) => stats.lock().unwrap().reread += 1,
                Err(err) => {
                    task_warn!(
                        task,
                        "content '{}' failed verification - {}",
                        entry.content,
                        err
                    );
                    stats.lock().unwrap().corrupt += 1;
                }
            }
        }
    }

    /// Check that every effective entry's pack exists with sufficient
    /// length; re-read a sample. Reports failures but runs to
    /// completion.
    pub fn verify_contents(
        &self,
        opts: &VerifyOptions,
        task: &dyn TaskContext,
    ) -> Result<VerifyStats, Error> {
        let iterate = IterateOptions {
            range: opts.range,
            include_deleted: opts.include_deleted,
        };
        let stats = Mutex::new(VerifyStats::default());
        let pack_lengths: Mutex<HashMap<String, Option<u64>>> = Mutex::new(HashMap::new());

        let percent = opts.percent.min(100);
        if opts.parallel > 1 {
            self.indexes.iterate_contents_parallel(
                &iterate,
                opts.parallel,
                task,
                &|entry| {
                    self.verify_entry(entry, percent, &pack_lengths, &stats, task);
                    Ok(())
                },
            )?;
        } else {
            self.indexes.iterate_contents(&iterate, task, &mut |entry| {
                self.verify_entry(entry, percent, &pack_lengths, &stats, task);
                Ok(())
            })?;
        }

        Ok(stats.into_inner().unwrap())
    }

    /// Aggregate statistics over the effective index.
    pub fn content_stats(&self, task: &dyn TaskContext) -> Result<ContentStats, Error> {
        let iterate = IterateOptions {
            range: ContentRange::all(),
            include_deleted: true,
        };
        let mut stats = ContentStats::default();
        self.indexes.iterate_contents(&iterate, task, &mut |entry| {
            if entry.is_deleted() {
                stats.deleted_count += 1;
            } else {
                stats.count += 1;
                stats.packed_bytes += entry.stored_length as u64;
                stats.original_bytes += entry.original_length as u64;
            }
            Ok(())
        })?;
        Ok(stats)
    }

    /// Freeze (or thaw) the generation list for long consistent scans.
    pub fn set_index_refresh_disabled(&self, disabled: bool) {
        self.indexes.set_refresh_disabled(disabled);
    }

    /// Publish all pending writes: packs first, then the session's
    /// index blob, then the new generation becomes visible.
    pub fn flush(&self, task: &dyn TaskContext) -> Result<(), Error> {
        let generation = self.builder.lock().unwrap().flush(task)?;
        if let Some(generation) = generation {
            self.indexes.register(generation);
            if let Some(ref cache) = self.cache {
                cache.invalidate_blob_lists();
            }
        }
        Ok(())
    }

    /// Flush, or abandon the session leaving a marker blob.
    pub fn close(&self, abort: bool, task: &dyn TaskContext) -> Result<(), Error> {
        let generation = self.builder.lock().unwrap().close(abort, task)?;
        if let Some(generation) = generation {
            self.indexes.register(generation);
        }
        Ok(())
    }

    /// Pending (unflushed) entry count, used by tests and stats.
    pub fn has_pending_writes(&self) -> bool {
        self.builder.lock().unwrap().has_pending()
    }

    /// The session's effective pack size bound.
    pub fn max_pack_size(&self) -> u64 {
        self.builder.lock().unwrap().max_pack_size()
    }

    /// Reload the generation list from the stored index blobs. Returns
    /// the number of live generations, or `None` while a scan holds
    /// the list frozen.
    pub fn refresh_indexes(&self, task: &dyn TaskContext) -> Result<Option<usize>, Error> {
        if self.indexes.refresh_disabled() {
            return Ok(None);
        }

        let mut metas = Vec::new();
        for prefix in [
            hbk_api_types::INDEX_BLOB_PREFIX,
            hbk_api_types::EPOCH_INDEX_BLOB_PREFIX,
        ] {
            let listed = match self.cache {
                Some(ref cache) => cache.cached_blob_list(self.store.as_ref(), prefix, task)?,
                None => crate::blob_store::list_blobs(self.store.as_ref(), prefix, task)?,
            };
            metas.extend(listed);
        }
        metas.sort_by(|a, b| a.id.cmp(&b.id));
        metas.dedup_by(|a, b| a.id == b.id);

        let mut generations = Vec::with_capacity(metas.len());
        for meta in metas {
            task.check_abort()?;
            let data = match self.cache {
                Some(ref cache) => cache.get_or_fetch_index_blob(self.store.as_ref(), &meta.id),
                None => self.store.get_blob(&meta.id, 0, None),
            };
            let data = match data {
                Ok(data) => data,
                Err(err) if crate::error::is_blob_not_found(&err) => {
                    // compacted away between listing and read
                    task_warn!(task, "index blob '{}' vanished during refresh", meta.id);
                    continue;
                }
                Err(err) => return Err(err),
            };
            let entries = crate::index_blob::decode_index_blob(&data)?;
            generations.push(crate::index::Generation::new(meta, entries));
        }

        let count = generations.len();
        if self.indexes.replace_all(generations) {
            Ok(Some(count))
        } else {
            Ok(None)
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::backend::MemoryStore;
    use crate::blob_store::list_blobs;
    use crate::crypto;
    use crate::pack::LegacyIndexNamer;
    use hbk_api_types::CONTENT_PREFIX_DATA;
    use hbk_tools::task::SimpleTask;

    fn test_manager(store: Arc<MemoryStore>) -> ContentManager {
        let crypt = Arc::new(
            crypto::crypt_config_for(
                crypto::DEFAULT_HASH,
                crypto::DEFAULT_ENCRYPTION,
                [1u8; 32],
                [2u8; 32],
            )
            .unwrap(),
        );
        ContentManager::new(
            store,
            crypt,
            Arc::new(IndexSet::new()),
            Arc::new(LegacyIndexNamer),
            0,
            None,
        )
    }

    #[test]
    fn write_dedup_uploads_once() -> Result<(), Error> {
        let task = SimpleTask::new("test");
        let store = Arc::new(MemoryStore::new());
        let manager = test_manager(store.clone());

        let id1 = manager.write_content(CONTENT_PREFIX_DATA, b"hello", &task)?;
        let id2 = manager.write_content(CONTENT_PREFIX_DATA, b"hello", &task)?;
        assert_eq!(id1, id2);
        manager.flush(&task)?;

        assert_eq!(list_blobs(&**manager.store(), "p", &task)?.len(), 1);

        // still deduplicated against the registered index
        let id3 = manager.write_content(CONTENT_PREFIX_DATA, b"hello", &task)?;
        assert_eq!(id1, id3);
        manager.flush(&task)?;
        assert_eq!(list_blobs(&**manager.store(), "p", &task)?.len(), 1);
        Ok(())
    }

    #[test]
    fn read_your_writes_before_flush() -> Result<(), Error> {
        let task = SimpleTask::new("test");
        let store = Arc::new(MemoryStore::new());
        let manager = test_manager(store);

        let id = manager.write_content(CONTENT_PREFIX_DATA, b"unflushed", &task)?;
        assert_eq!(manager.get_content(&id, &task)?, b"unflushed");

        manager.flush(&task)?;
        assert_eq!(manager.get_content(&id, &task)?, b"unflushed");
        Ok(())
    }

    #[test]
    fn delete_hides_but_iterates() -> Result<(), Error> {
        let task = SimpleTask::new("test");
        let store = Arc::new(MemoryStore::new());
        let manager = test_manager(store);

        let id = manager.write_content(CONTENT_PREFIX_DATA, b"doomed", &task)?;
        manager.flush(&task)?;

        manager.delete_content(&id)?;
        manager.flush(&task)?;

        let err = manager.get_content(&id, &task).unwrap_err();
        assert!(crate::error::is_content_not_found(&err));

        let stats = manager.content_stats(&task)?;
        assert_eq!(stats.count, 0);
        assert_eq!(stats.deleted_count, 1);

        // deleting twice is an error
        assert!(manager.delete_content(&id).is_err());
        Ok(())
    }

    #[test]
    fn rewrite_after_delete_revives() -> Result<(), Error> {
        let task = SimpleTask::new("test");
        let store = Arc::new(MemoryStore::new());
        let manager = test_manager(store);

        let id = manager.write_content(CONTENT_PREFIX_DATA, b"phoenix", &task)?;
        manager.flush(&task)?;
        manager.delete_content(&id)?;
        manager.flush(&task)?;

        // write after delete resurrects the content
        let id2 = manager.write_content(CONTENT_PREFIX_DATA, b"phoenix", &task)?;
        assert_eq!(id, id2);
        manager.flush(&task)?;
        assert_eq!(manager.get_content(&id, &task)?, b"phoenix");
        Ok(())
    }

    #[test]
    fn verify_detects_missing_pack() -> Result<(), Error> {
        let task = SimpleTask::new("test");
        let store = Arc::new(MemoryStore::new());
        let manager = test_manager(store.clone());

        let id = manager.write_content(CONTENT_PREFIX_DATA, b"fragile", &task)?;
        manager.flush(&task)?;

        let stats = manager.verify_contents(
            &VerifyOptions {
                percent: 100,
                ..Default::default()
            },
            &task,
        )?;
        assert!(stats.is_ok());
        assert_eq!(stats.checked, 1);
        assert_eq!(stats.reread, 1);

        // drop the pack blob behind the index's back
        let entry = manager.lookup_entry(&id).unwrap();
        store.delete_blob(entry.pack.as_ref().unwrap())?;

        let stats = manager.verify_contents(&VerifyOptions::default(), &task)?;
        assert_eq!(stats.missing, 1);

        let err = manager.get_content(&id, &task).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RepoError>(),
            Some(RepoError::ContentLost(_, _))
        ));
        Ok(())
    }

    #[test]
    fn parallel_verify() -> Result<(), Error> {
        let task = SimpleTask::new("test");
        let store = Arc::new(MemoryStore::new());
        let manager = test_manager(store);

        for i in 0u32..50 {
            manager.write_content(CONTENT_PREFIX_DATA, &i.to_le_bytes(), &task)?;
        }
        manager.flush(&task)?;

        let stats = manager.verify_contents(
            &VerifyOptions {
                percent: 100,
                parallel: 4,
                ..Default::default()
            },
            &task,
        )?;
        assert_eq!(stats.checked, 50);
        assert_eq!(stats.reread, 50);
        assert!(stats.is_ok());
        Ok(())
    }

    #[test]
    fn corrupted_payload_detected() -> Result<(), Error> {
        let task = SimpleTask::new("test");
        let store = Arc::new(MemoryStore::new());
        let manager = test_manager(store.clone());

        let id = manager.write_content(CONTENT_PREFIX_DATA, b"pristine", &task)?;
        manager.flush(&task)?;

        let entry = manager.lookup_entry(&id).unwrap();
        let pack = entry.pack.clone().unwrap();
        let mut data = store.get_blob(&pack, 0, None)?;
        data[entry.offset as usize] ^= 0xff;
        store.put_blob(&pack, &data, &crate::blob_store::PutOptions::default())?;

        let err = manager.get_content(&id, &task).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RepoError>(),
            Some(RepoError::ContentCorrupt(_))
        ));
        Ok(())
    }
}
