//! The maintenance engine: index compaction, short-pack rewriting,
//! unreferenced-blob GC, index recovery and log retention.
//!
//! Maintenance is a single-owner process. Ownership is the observed
//! lease recorded in the maintenance params blob; a competing
//! participant seeing a fresh lease of another `user@host` declines to
//! run. The lease staleness tolerance equals `blob_delete_min_age`,
//! which also bounds the clock skew the safety margins absorb.
//! Operators must not run more than one maintainer against the same
//! repository concurrently.
//!
//! Every destructive step observes [SafetyParameters]: an object
//! younger than the relevant margin is never deleted, even when it
//! looks unreferenced, because a racing writer may still be about to
//! publish an index referencing it.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use anyhow::{bail, format_err, Error};
use humansize::{format_size, BINARY};

use hbk_api_types::{
    BlobId, BlobKind, BlobMeta, GcStatus, LogRetention, MaintenanceCycle, MaintenanceParams,
    MaintenanceRun, RewriteStats, SafetyParameters, EPOCH_INDEX_BLOB_PREFIX, INDEX_BLOB_PREFIX,
    LOG_BLOB_PREFIX, MAINTENANCE_BLOB_NAME, PACK_DATA_BLOB_PREFIX, PACK_METADATA_BLOB_PREFIX,
    RESERVE_BLOB_NAME, SESSION_BLOB_PREFIX,
};
use hbk_tools::task::TaskContext;
use hbk_tools::{task_log, task_warn};

use crate::blob_store::{list_blobs, BlobStore, PutOptions};
use crate::content::ContentManager;
use crate::epoch::EpochManager;
use crate::error::StoreError;
use crate::index::{merge_generations, Generation, IndexEntry, IterateOptions,
    ENTRY_FORMAT_VERSION};
use crate::index_blob::{encode_index_blob, INDEX_VERSION_2};
use crate::manifest::ManifestStore;
use crate::pack::{read_pack_footer, IndexNamer};

/// Per-run switches; `safety` gates every destructive step.
#[derive(Clone, Copy, Debug)]
pub struct MaintenanceOptions {
    pub dry_run: bool,
    pub safety: SafetyParameters,
}

impl Default for MaintenanceOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            safety: SafetyParameters::full(),
        }
    }
}

/// Counters reported by one maintenance run.
#[derive(Clone, Debug, Default)]
pub struct MaintenanceSummary {
    pub compacted_index_blobs: usize,
    pub deleted_logs: usize,
    pub extended_locks: usize,
    pub rewrite: RewriteStats,
    pub gc: GcStatus,
    pub dropped_manifest_records: usize,
}

/// Short packs are rewritten below this fraction of the pack size
/// bound.
const SHORT_PACK_FRACTION: f64 = 0.6;

/// Size of the recovery reserve blob.
pub const RECOVERY_RESERVE_SIZE: usize = 4 * 1024 * 1024;

/// Write the recovery reserve blob if it is missing. Returns whether a
/// new reserve was written.
///
/// The reserve keeps a slab of storage claimed so cleanup can still
/// proceed on a full backend: a delete failing with insufficient space
/// frees the reserve and retries, and the next owned maintenance run
/// restores it.
pub fn ensure_recovery_reserve(store: &dyn BlobStore) -> Result<bool, Error> {
    let id = BlobId::from(RESERVE_BLOB_NAME);
    match store.get_metadata(&id) {
        Ok(_) => Ok(false),
        Err(err) => match err.downcast_ref::<StoreError>() {
            Some(StoreError::NotFound(_)) => {
                store.put_blob(&id, &vec![0u8; RECOVERY_RESERVE_SIZE], &PutOptions::default())?;
                Ok(true)
            }
            _ => Err(err),
        },
    }
}

/// Task wrapper buffering log lines for upload as a `_log_` blob.
struct RecordingTask<'a> {
    inner: &'a dyn TaskContext,
    buffer: Mutex<String>,
}

impl<'a> RecordingTask<'a> {
    fn new(inner: &'a dyn TaskContext) -> Self {
        Self {
            inner,
            buffer: Mutex::new(String::new()),
        }
    }

    fn take(&self) -> String {
        std::mem::take(&mut self.buffer.lock().unwrap())
    }
}

impl TaskContext for RecordingTask<'_> {
    fn check_abort(&self) -> Result<(), Error> {
        self.inner.check_abort()
    }

    fn log(&self, level: log::Level, message: &std::fmt::Arguments) {
        {
            let mut buffer = self.buffer.lock().unwrap();
            buffer.push_str(&format!(
                "{} {}: {}\n",
                hbk_tools::time::epoch_i64(),
                level,
                message
            ));
        }
        self.inner.log(level, message);
    }
}

/// Runs maintenance cycles over one repository.
pub struct MaintenanceEngine {
    contents: Arc<ContentManager>,
    manifests: Option<Arc<ManifestStore>>,
    epoch: Option<Arc<EpochManager>>,
    namer: Arc<dyn IndexNamer>,
    identity: String,
}

impl MaintenanceEngine {
    pub fn new(
        contents: Arc<ContentManager>,
        manifests: Option<Arc<ManifestStore>>,
        epoch: Option<Arc<EpochManager>>,
        namer: Arc<dyn IndexNamer>,
        identity: String,
    ) -> Self {
        Self {
            contents,
            manifests,
            epoch,
            namer,
            identity,
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Load the maintenance params blob, falling back to defaults on a
    /// fresh repository.
    pub fn load_params(&self) -> Result<MaintenanceParams, Error> {
        let id = BlobId::from(MAINTENANCE_BLOB_NAME);
        let data = match self.contents.store().get_blob(&id, 0, None) {
            Ok(data) => data,
            Err(err) => {
                return match err.downcast_ref::<StoreError>() {
                    Some(StoreError::NotFound(_)) => Ok(MaintenanceParams::default()),
                    _ => Err(err),
                };
            }
        };
        let plain = self
            .contents
            .crypt()
            .decrypt(id.as_str().as_bytes(), &data)?;
        Ok(serde_json::from_slice(&plain)?)
    }

    pub fn store_params(&self, params: &MaintenanceParams) -> Result<(), Error> {
        let id = BlobId::from(MAINTENANCE_BLOB_NAME);
        let data = self
            .contents
            .crypt()
            .encrypt(id.as_str().as_bytes(), &serde_json::to_vec(params)?)?;
        self.contents
            .store()
            .put_blob(&id, &data, &PutOptions::default())
    }

    /// Delete a blob, observing the recovery-reserve check: when the
    /// backend reports insufficient space for the delete itself, free
    /// the reserve blob and retry once.
    fn delete_blob_making_space(&self, id: &BlobId, task: &dyn TaskContext) -> Result<(), Error> {
        let store = self.contents.store();
        match store.delete_blob(id) {
            Err(err)
                if matches!(
                    err.downcast_ref::<StoreError>(),
                    Some(StoreError::InsufficientSpace)
                ) =>
            {
                task_warn!(
                    task,
                    "storage full while deleting '{}', freeing the recovery reserve",
                    id
                );
                store.delete_blob(&BlobId::from(RESERVE_BLOB_NAME))?;
                store.delete_blob(id)
            }
            other => other,
        }
    }

    /// Take or refresh the maintenance lease. Declines when another
    /// participant holds a fresh one.
    fn claim_lease(
        &self,
        params: &mut MaintenanceParams,
        now: i64,
        safety: &SafetyParameters,
        task: &dyn TaskContext,
    ) -> Result<bool, Error> {
        if let Some(ref owner) = params.owner {
            if owner != &self.identity && now - params.owner_checkin < safety.blob_delete_min_age {
                task_log!(
                    task,
                    "maintenance lease is held by '{}' (checked in {}s ago), not running",
                    owner,
                    now - params.owner_checkin
                );
                return Ok(false);
            }
        }
        params.owner = Some(self.identity.clone());
        params.owner_checkin = now;
        self.store_params(params)?;
        Ok(true)
    }

    /// Run one cycle under the ownership lease and record it in the
    /// params history. Returns `None` when the lease was declined.
    pub fn run(
        &self,
        cycle: MaintenanceCycle,
        opts: &MaintenanceOptions,
        task: &dyn TaskContext,
    ) -> Result<Option<MaintenanceSummary>, Error> {
        let started = hbk_tools::time::epoch_i64();
        let mut params = self.load_params()?;
        if !self.claim_lease(&mut params, started, &opts.safety, task)? {
            return Ok(None);
        }

        let run_id = uuid::Uuid::new_v4().simple().to_string();
        let recording = RecordingTask::new(task);
        task_log!(&recording, "starting {} maintenance (run {})", cycle, run_id);

        let result = self.run_cycle(cycle, opts, &params, &recording);

        let finished = hbk_tools::time::epoch_i64();
        params.record_run(MaintenanceRun {
            cycle,
            start: started,
            end: finished,
            success: result.is_ok(),
            message: result.as_ref().err().map(|err| err.to_string()),
        });
        if let Err(err) = self.store_params(&params) {
            task_warn!(task, "unable to record maintenance run - {}", err);
        }

        if !opts.dry_run {
            // a delete flow may have sacrificed the reserve; restore
            // it now that cleanup freed space
            if let Err(err) = ensure_recovery_reserve(self.contents.store().as_ref()) {
                task_warn!(task, "unable to restore the recovery reserve - {}", err);
            }

            let log_id = BlobId::from(format!("{}{}", LOG_BLOB_PREFIX, run_id));
            let log_data = recording.take();
            if let Ok(payload) = self
                .contents
                .crypt()
                .encrypt(log_id.as_str().as_bytes(), log_data.as_bytes())
            {
                if let Err(err) =
                    self.contents
                        .store()
                        .put_blob(&log_id, &payload, &PutOptions::default())
                {
                    task_warn!(task, "unable to upload maintenance log - {}", err);
                }
            }
        }

        result.map(Some)
    }

    fn run_cycle(
        &self,
        cycle: MaintenanceCycle,
        opts: &MaintenanceOptions,
        params: &MaintenanceParams,
        task: &dyn TaskContext,
    ) -> Result<MaintenanceSummary, Error> {
        let mut summary = MaintenanceSummary::default();

        summary.compacted_index_blobs = self.compact_indexes(opts, task)?;
        summary.deleted_logs = self.retain_logs(&params.log_retention, opts.dry_run, task)?;
        if params.extend_object_locks {
            summary.extended_locks =
                self.extend_object_locks(opts.safety.extend_object_locks_margin, task)?;
        }

        if cycle == MaintenanceCycle::Full {
            let (rewrite, drained) = self.rewrite_short_packs_inner(opts, task)?;
            summary.rewrite = rewrite;
            if let Some(ref manifests) = self.manifests {
                if !opts.dry_run {
                    summary.dropped_manifest_records = manifests.compact(
                        opts.safety.blob_delete_min_age
                            + opts.safety.drop_content_from_index_extra_margin,
                        task,
                    )?;
                    self.contents.flush(task)?;
                }
            }
            summary.gc = self.gc_with_exclusions(opts, &drained, task)?;
        }

        task_log!(task, "{} maintenance finished", cycle);
        Ok(summary)
    }

    /// Whether a tombstone may be dropped from the index entirely.
    ///
    /// A `forget` tombstone (short-drop flag) waits only for the extra
    /// margin; a regular delete waits for the full safety window plus
    /// the extra margin.
    fn droppable(entry: &IndexEntry, now: i64, safety: &SafetyParameters) -> bool {
        if !entry.is_deleted() {
            return false;
        }
        let age = now - entry.timestamp;
        if entry.is_short_drop() {
            age >= safety.drop_content_from_index_extra_margin
        } else {
            age >= safety.blob_delete_min_age + safety.drop_content_from_index_extra_margin
        }
    }

    /// Compact index generations into fewer, larger blobs.
    ///
    /// Only generations older than the safety window are taken: any
    /// reader that listed blobs before the compaction has had the
    /// whole window to load them, and readers holding in-memory
    /// snapshots are unaffected by the deletion.
    pub fn compact_indexes(
        &self,
        opts: &MaintenanceOptions,
        task: &dyn TaskContext,
    ) -> Result<usize, Error> {
        self.contents.refresh_indexes(task)?;
        let now = hbk_tools::time::epoch_i64();

        match self.epoch {
            Some(ref epoch) => self.compact_epochs(epoch, opts, now, task),
            None => self.compact_legacy(opts, now, task),
        }
    }

    fn write_compacted(
        &self,
        id: &BlobId,
        entries: &[IndexEntry],
        inputs: &[BlobMeta],
        task: &dyn TaskContext,
    ) -> Result<(), Error> {
        let data = encode_index_blob(entries, INDEX_VERSION_2)?;
        self.contents
            .store()
            .put_blob(id, &data, &PutOptions::default())?;
        for input in inputs {
            if let Err(err) = self.delete_blob_making_space(&input.id, task) {
                task_warn!(task, "unable to delete index blob '{}' - {}", input.id, err);
            }
        }
        task_log!(
            task,
            "compacted {} index blobs into '{}' ({} entries)",
            inputs.len(),
            id,
            entries.len()
        );
        Ok(())
    }

    fn compact_legacy(
        &self,
        opts: &MaintenanceOptions,
        now: i64,
        task: &dyn TaskContext,
    ) -> Result<usize, Error> {
        let snapshot = self.contents.indexes().snapshot();
        let candidates: Vec<Arc<Generation>> = snapshot
            .iter()
            .filter(|generation| {
                now - generation.meta().timestamp >= opts.safety.blob_delete_min_age
            })
            .cloned()
            .collect();
        if candidates.len() < 2 {
            return Ok(0);
        }

        let mut merged = merge_generations(&candidates, task)?;
        merged.retain(|entry| !Self::droppable(entry, now, &opts.safety));

        if opts.dry_run {
            task_log!(
                task,
                "dry run: would compact {} index blobs ({} entries)",
                candidates.len(),
                merged.len()
            );
            return Ok(candidates.len());
        }

        let id = self.namer.next_index_blob_id()?;
        let inputs: Vec<BlobMeta> = candidates
            .iter()
            .map(|generation| generation.meta().clone())
            .collect();
        self.write_compacted(&id, &merged, &inputs, task)?;

        if let Some(cache) = self.contents.cache() {
            cache.invalidate_blob_lists();
        }
        self.contents.refresh_indexes(task)?;
        Ok(inputs.len())
    }

    fn compact_epochs(
        &self,
        epoch: &EpochManager,
        opts: &MaintenanceOptions,
        now: i64,
        task: &dyn TaskContext,
    ) -> Result<usize, Error> {
        epoch.refresh(task)?;
        let blobs = list_blobs(
            self.contents.store().as_ref(),
            EPOCH_INDEX_BLOB_PREFIX,
            task,
        )?;
        let compactable = epoch.compactable_epochs(&blobs, now, opts.safety.blob_delete_min_age);

        let mut compacted = 0;
        for number in compactable {
            task.check_abort()?;
            let inputs: Vec<BlobMeta> = blobs
                .iter()
                .filter(|meta| EpochManager::epoch_of(&meta.id) == Some(number))
                .cloned()
                .collect();

            let mut generations = Vec::with_capacity(inputs.len());
            for meta in &inputs {
                let data = self.contents.store().get_blob(&meta.id, 0, None)?;
                let entries = crate::index_blob::decode_index_blob(&data)?;
                generations.push(Arc::new(Generation::new(meta.clone(), entries)));
            }
            let mut merged = merge_generations(&generations, task)?;
            merged.retain(|entry| !Self::droppable(entry, now, &opts.safety));

            if opts.dry_run {
                task_log!(
                    task,
                    "dry run: would compact epoch {} ({} blobs)",
                    number,
                    inputs.len()
                );
                compacted += inputs.len();
                continue;
            }

            let id = epoch.compacted_blob_id(number);
            self.write_compacted(&id, &merged, &inputs, task)?;
            compacted += inputs.len();
        }

        if compacted > 0 && !opts.dry_run {
            if let Some(cache) = self.contents.cache() {
                cache.invalidate_blob_lists();
            }
            self.contents.refresh_indexes(task)?;
        }
        Ok(compacted)
    }

    /// Rewrite every live content of packs below the short-pack
    /// threshold into fresh packs. The drained packs become
    /// unreferenced once the rewrite flush is published and are
    /// reclaimed by a later GC pass.
    pub fn rewrite_short_packs(
        &self,
        opts: &MaintenanceOptions,
        task: &dyn TaskContext,
    ) -> Result<RewriteStats, Error> {
        Ok(self.rewrite_short_packs_inner(opts, task)?.0)
    }

    fn rewrite_short_packs_inner(
        &self,
        opts: &MaintenanceOptions,
        task: &dyn TaskContext,
    ) -> Result<(RewriteStats, HashSet<String>), Error> {
        let threshold = (self.contents.max_pack_size() as f64 * SHORT_PACK_FRACTION) as u64;
        let mut stats = RewriteStats::default();
        let mut drained: HashSet<String> = HashSet::new();

        // live entries grouped by their pack
        let mut by_pack: HashMap<BlobId, Vec<IndexEntry>> = HashMap::new();
        self.contents.indexes().iterate_contents(
            &IterateOptions::default(),
            task,
            &mut |entry| {
                if let Some(ref pack) = entry.pack {
                    by_pack.entry(pack.clone()).or_default().push(entry.clone());
                }
                Ok(())
            },
        )?;

        for (pack, entries) in by_pack {
            task.check_abort()?;
            stats.packs_examined += 1;

            let meta = match self.contents.store().get_metadata(&pack) {
                Ok(meta) => meta,
                Err(err) => {
                    task_warn!(task, "unable to stat pack blob '{}' - {}", pack, err);
                    continue;
                }
            };
            if meta.length >= threshold {
                continue;
            }

            task_log!(
                task,
                "{}pack blob '{}' is short ({} < {}), rewriting {} contents",
                if opts.dry_run { "dry run: " } else { "" },
                pack,
                format_size(meta.length, BINARY),
                format_size(threshold, BINARY),
                entries.len()
            );
            stats.packs_rewritten += 1;
            drained.insert(pack.as_str().to_string());
            for entry in entries {
                task.check_abort()?;
                stats.contents_rewritten += 1;
                stats.bytes_rewritten += entry.original_length as u64;
                if !opts.dry_run {
                    self.contents.rewrite_content(&entry.content, task)?;
                }
            }
        }

        if !opts.dry_run && stats.contents_rewritten > 0 {
            self.contents.flush(task)?;
        }
        Ok((stats, drained))
    }

    /// Delete pack blobs no index entry references, session markers
    /// and packs of abandoned sessions, once they are older than the
    /// safety margins.
    pub fn gc_unreferenced_blobs(
        &self,
        opts: &MaintenanceOptions,
        task: &dyn TaskContext,
    ) -> Result<GcStatus, Error> {
        self.gc_with_exclusions(opts, &HashSet::new(), task)
    }

    fn gc_with_exclusions(
        &self,
        opts: &MaintenanceOptions,
        just_drained: &HashSet<String>,
        task: &dyn TaskContext,
    ) -> Result<GcStatus, Error> {
        self.contents.refresh_indexes(task)?;
        let now = hbk_tools::time::epoch_i64();
        // a pack drained by rewriting must additionally outwait the
        // rewrite-to-orphan delay
        let min_age = opts
            .safety
            .blob_delete_min_age
            .max(opts.safety.min_rewrite_to_orphan_deletion_delay);

        let mut referenced: HashSet<String> = HashSet::new();
        self.contents.indexes().iterate_contents(
            &IterateOptions {
                include_deleted: true,
                ..Default::default()
            },
            task,
            &mut |entry| {
                if let Some(ref pack) = entry.pack {
                    referenced.insert(pack.as_str().to_string());
                }
                Ok(())
            },
        )?;

        let mut status = GcStatus::default();
        for prefix in [
            PACK_DATA_BLOB_PREFIX,
            PACK_METADATA_BLOB_PREFIX,
            SESSION_BLOB_PREFIX,
        ] {
            let blobs = list_blobs(self.contents.store().as_ref(), prefix, task)?;
            for meta in blobs {
                task.check_abort()?;
                let is_pack = meta.id.kind() != BlobKind::Session;
                status.examined_blobs += 1;

                if is_pack && referenced.contains(meta.id.as_str()) {
                    status.referenced_blobs += 1;
                    continue;
                }
                // a pack drained by this very run waits for the
                // rewrite-to-orphan delay measured from now
                if just_drained.contains(meta.id.as_str())
                    && opts.safety.min_rewrite_to_orphan_deletion_delay > 0
                {
                    status.pending_blobs += 1;
                    status.pending_bytes += meta.length;
                    continue;
                }
                if now - meta.timestamp < min_age {
                    status.pending_blobs += 1;
                    status.pending_bytes += meta.length;
                    continue;
                }
                if opts.dry_run {
                    task_log!(task, "dry run: would delete unreferenced blob '{}'", meta.id);
                    status.deleted_blobs += 1;
                    status.deleted_bytes += meta.length;
                    continue;
                }
                match self.delete_blob_making_space(&meta.id, task) {
                    Ok(()) => {
                        status.deleted_blobs += 1;
                        status.deleted_bytes += meta.length;
                    }
                    Err(err) => {
                        task_warn!(task, "unable to delete blob '{}' - {}", meta.id, err)
                    }
                }
            }
        }

        task_log!(
            task,
            "GC examined {} blobs, deleted {} ({}), kept {} pending ({})",
            status.examined_blobs,
            status.deleted_blobs,
            format_size(status.deleted_bytes, BINARY),
            status.pending_blobs,
            format_size(status.pending_bytes, BINARY)
        );
        Ok(status)
    }

    /// Synthesize index entries from one pack's footer.
    pub fn recover_index_from_pack(
        &self,
        pack: &BlobId,
        task: &dyn TaskContext,
    ) -> Result<Vec<IndexEntry>, Error> {
        let meta = self.contents.store().get_metadata(pack)?;
        let footer = read_pack_footer(self.contents.store().as_ref(), self.contents.crypt(), &meta)?;
        task_log!(
            task,
            "recovered {} entries from pack blob '{}'",
            footer.len(),
            pack
        );
        Ok(footer
            .into_iter()
            .map(|entry| IndexEntry {
                content: entry.content,
                pack: Some(pack.clone()),
                offset: entry.offset,
                stored_length: entry.stored_length,
                original_length: entry.original_length,
                compression: entry.compression,
                timestamp: meta.timestamp,
                flags: 0,
                format_version: ENTRY_FORMAT_VERSION,
            })
            .collect())
    }

    /// Rebuild the index from every pack footer in the store. With
    /// `commit` a single fresh index blob is written; without, the
    /// recovered entries are only counted.
    pub fn recover_indexes(&self, commit: bool, task: &dyn TaskContext) -> Result<usize, Error> {
        let mut recovered: HashMap<hbk_api_types::ContentId, IndexEntry> = HashMap::new();

        for prefix in [PACK_DATA_BLOB_PREFIX, PACK_METADATA_BLOB_PREFIX] {
            let packs = list_blobs(self.contents.store().as_ref(), prefix, task)?;
            for meta in packs {
                task.check_abort()?;
                let entries = match self.recover_index_from_pack(&meta.id, task) {
                    Ok(entries) => entries,
                    Err(err) => {
                        task_warn!(task, "skipping pack blob '{}' - {}", meta.id, err);
                        continue;
                    }
                };
                for entry in entries {
                    // the same content may live in several packs after
                    // rewrites; keep the copy from the newest pack
                    match recovered.get(&entry.content) {
                        Some(current) if !entry.supersedes(current) => {}
                        _ => {
                            recovered.insert(entry.content, entry);
                        }
                    }
                }
            }
        }

        let count = recovered.len();
        if !commit {
            task_log!(task, "dry run: would recover {} index entries", count);
            return Ok(count);
        }
        if count == 0 {
            bail!("no recoverable pack footers found");
        }

        let mut entries: Vec<IndexEntry> = recovered.into_values().collect();
        entries.sort_by(|a, b| a.content.cmp(&b.content));
        let data = encode_index_blob(&entries, INDEX_VERSION_2)?;
        let id = self.namer.next_index_blob_id()?;
        self.contents
            .store()
            .put_blob(&id, &data, &PutOptions::default())
            .map_err(|err| format_err!("unable to write recovered index blob - {}", err))?;
        task_log!(task, "wrote recovered index blob '{}' ({} entries)", id, count);

        if let Some(cache) = self.contents.cache() {
            cache.invalidate_blob_lists();
        }
        self.contents.refresh_indexes(task)?;
        Ok(count)
    }

    /// Cap retained `_log_` blobs by count, age and total size.
    pub fn retain_logs(
        &self,
        retention: &LogRetention,
        dry_run: bool,
        task: &dyn TaskContext,
    ) -> Result<usize, Error> {
        let mut logs = list_blobs(self.contents.store().as_ref(), LOG_BLOB_PREFIX, task)?;
        // newest first
        logs.sort_by_key(|meta| std::cmp::Reverse(meta.timestamp));

        let now = hbk_tools::time::epoch_i64();
        let mut total = 0u64;
        let mut deleted = 0;
        for (pos, meta) in logs.iter().enumerate() {
            task.check_abort()?;
            total += meta.length;
            let keep = pos < retention.max_count
                && total <= retention.max_total_bytes
                && now - meta.timestamp <= retention.max_age;
            if keep {
                continue;
            }
            if dry_run {
                deleted += 1;
                continue;
            }
            match self.delete_blob_making_space(&meta.id, task) {
                Ok(()) => deleted += 1,
                Err(err) => task_warn!(task, "unable to delete log blob '{}' - {}", meta.id, err),
            }
        }
        if deleted > 0 {
            task_log!(task, "log retention deleted {} log blobs", deleted);
        }
        Ok(deleted)
    }

    /// Extend object-lock retention on pack and index blobs. An index
    /// blob outliving its packs is useless, so both sets get the same
    /// margin.
    pub fn extend_object_locks(
        &self,
        margin: i64,
        task: &dyn TaskContext,
    ) -> Result<usize, Error> {
        let retain_until = hbk_tools::time::epoch_i64() + margin;
        let mut extended = 0;
        for prefix in [
            PACK_DATA_BLOB_PREFIX,
            PACK_METADATA_BLOB_PREFIX,
            INDEX_BLOB_PREFIX,
            EPOCH_INDEX_BLOB_PREFIX,
        ] {
            let blobs = list_blobs(self.contents.store().as_ref(), prefix, task)?;
            for meta in blobs {
                task.check_abort()?;
                match self.contents.store().extend_retention(&meta.id, retain_until) {
                    Ok(()) => extended += 1,
                    Err(err) => {
                        if matches!(
                            err.downcast_ref::<StoreError>(),
                            Some(StoreError::RetentionUnsupported)
                        ) {
                            task_log!(task, "storage backend does not support object locks");
                            return Ok(extended);
                        }
                        task_warn!(task, "unable to extend lock on '{}' - {}", meta.id, err);
                    }
                }
            }
        }
        task_log!(task, "extended object locks on {} blobs", extended);
        Ok(extended)
    }
}
