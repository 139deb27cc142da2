//! Opening repositories and the capability fan-out.
//!
//! Callers receive the richest capability they are entitled to and
//! pass narrower trait objects down: a read capability exposes lookup
//! and get, a write capability adds put/delete/flush, and the full
//! [Repository] additionally hands out blob-store and format handles
//! plus the maintenance engine. CLI verbs declare the minimum
//! capability they need and the host enforces it by type.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{bail, format_err, Context, Error};

use hbk_api_types::{
    BlobKindStats, CacheConfig, ContentId, ContentStats, Kdf, ManifestId, SafetyParameters,
    VerifyStats,
};
use hbk_repository::blob_store::BlobStore;
use hbk_repository::content::{ContentManager, VerifyOptions};
use hbk_repository::epoch::{EpochManager, EpochParams};
use hbk_repository::format::FormatBlob;
use hbk_repository::index::{IndexEntry, IndexSet, IterateOptions};
use hbk_repository::maintenance::MaintenanceEngine;
use hbk_repository::manifest::{ManifestInfo, ManifestStore};
use hbk_repository::pack::{IndexNamer, LegacyIndexNamer, DEFAULT_MAX_PACK_SIZE};
use hbk_repository::{crypto, CacheLayer, RetryingStore};
use hbk_tools::task::TaskContext;

fn default_identity() -> String {
    let user = std::env::var("USER").unwrap_or_else(|_| "root".to_string());
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
    format!("{}@{}", user, host)
}

/// Options for opening a repository.
#[derive(Clone)]
pub struct RepositoryOptions {
    pub max_pack_size: u64,
    /// Cache directory and limits; `None` disables local caching.
    pub cache: Option<(PathBuf, CacheConfig)>,
    pub safety: SafetyParameters,
    /// Name index blobs per epoch (`xn…`) instead of flat (`n…`).
    pub use_epoch_manager: bool,
    /// `user@host` recorded when this client runs maintenance.
    pub identity: String,
}

impl Default for RepositoryOptions {
    fn default() -> Self {
        Self {
            max_pack_size: DEFAULT_MAX_PACK_SIZE,
            cache: None,
            safety: SafetyParameters::full(),
            use_epoch_manager: false,
            identity: default_identity(),
        }
    }
}

/// Initialize a fresh repository on the given store.
pub fn create_repository(
    store: &dyn BlobStore,
    password: &str,
    kdf: Kdf,
    hash: &str,
    encryption: &str,
) -> Result<(), Error> {
    if FormatBlob::exists(store)? {
        bail!(
            "store '{}' already holds a repository",
            store.display_name()
        );
    }
    let (format, _keys) = FormatBlob::create(password, kdf, hash, encryption)?;
    format.store(store)?;
    hbk_repository::maintenance::ensure_recovery_reserve(store)?;
    Ok(())
}

/// Read capability: lookup and fetch, no mutation.
pub trait RepositoryReader: Send + Sync {
    fn contains_content(&self, id: &ContentId) -> bool;
    fn get_content(&self, id: &ContentId, task: &dyn TaskContext) -> Result<Vec<u8>, Error>;
    fn iterate_contents(
        &self,
        opts: &IterateOptions,
        task: &dyn TaskContext,
        cb: &mut dyn FnMut(&IndexEntry) -> Result<(), Error>,
    ) -> Result<(), Error>;
    fn get_manifest(
        &self,
        id: &ManifestId,
        task: &dyn TaskContext,
    ) -> Result<(BTreeMap<String, String>, Vec<u8>), Error>;
    fn find_manifests(&self, labels: &BTreeMap<String, String>) -> Vec<ManifestInfo>;
}

/// Write capability: everything a snapshotter needs.
pub trait RepositoryWriter: RepositoryReader {
    fn write_content(
        &self,
        prefix: u8,
        data: &[u8],
        task: &dyn TaskContext,
    ) -> Result<ContentId, Error>;
    fn delete_content(&self, id: &ContentId) -> Result<(), Error>;
    fn put_manifest(
        &self,
        labels: BTreeMap<String, String>,
        payload: Vec<u8>,
        task: &dyn TaskContext,
    ) -> Result<ManifestId, Error>;
    fn delete_manifest(&self, id: &ManifestId, task: &dyn TaskContext) -> Result<(), Error>;
    fn flush(&self, task: &dyn TaskContext) -> Result<(), Error>;
}

/// An opened repository with direct access to every subsystem.
pub struct Repository {
    store: Arc<dyn BlobStore>,
    format: Mutex<FormatBlob>,
    contents: Arc<ContentManager>,
    manifests: Arc<ManifestStore>,
    epoch: Option<Arc<EpochManager>>,
    namer: Arc<dyn IndexNamer>,
    options: RepositoryOptions,
}

impl std::fmt::Debug for Repository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repository").finish_non_exhaustive()
    }
}

/// Open an existing repository. Fails with `InvalidPassword` on a
/// wrong password and with a not-found error when the store holds no
/// repository.
pub fn open_repository(
    store: Arc<dyn BlobStore>,
    password: &str,
    options: RepositoryOptions,
    task: &dyn TaskContext,
) -> Result<Repository, Error> {
    let store: Arc<dyn BlobStore> = Arc::new(RetryingStore::new(store));

    let format = FormatBlob::load(store.as_ref()).map_err(|err| {
        if hbk_repository::error::is_blob_not_found(&err) {
            format_err!("store '{}' does not hold a repository", store.display_name())
        } else {
            err
        }
    })?;
    let keys = format.unlock(password)?;
    let crypt = Arc::new(keys.crypt_config(&format)?);

    let cache = match options.cache {
        Some((ref dir, config)) => Some(CacheLayer::new(dir.clone(), config)?),
        None => None,
    };

    let (namer, epoch): (Arc<dyn IndexNamer>, Option<Arc<EpochManager>>) =
        if options.use_epoch_manager {
            let epoch = Arc::new(EpochManager::new(store.clone(), EpochParams::default()));
            epoch.refresh(task)?;
            (epoch.clone(), Some(epoch))
        } else {
            (Arc::new(LegacyIndexNamer), None)
        };

    let contents = Arc::new(ContentManager::new(
        store.clone(),
        crypt,
        Arc::new(IndexSet::new()),
        namer.clone(),
        options.max_pack_size,
        cache,
    ));
    contents
        .refresh_indexes(task)
        .context("unable to load the content index")?;

    let manifests = Arc::new(ManifestStore::new(contents.clone()));
    manifests.reload(task)?;

    Ok(Repository {
        store,
        format: Mutex::new(format),
        contents,
        manifests,
        epoch,
        namer,
        options,
    })
}

impl Repository {
    /// The (retry-wrapped) blob store handle.
    pub fn blob_store(&self) -> &Arc<dyn BlobStore> {
        &self.store
    }

    pub fn contents(&self) -> &Arc<ContentManager> {
        &self.contents
    }

    pub fn manifests(&self) -> &Arc<ManifestStore> {
        &self.manifests
    }

    pub fn epoch_manager(&self) -> Option<&Arc<EpochManager>> {
        self.epoch.as_ref()
    }

    pub fn options(&self) -> &RepositoryOptions {
        &self.options
    }

    pub fn unique_id(&self) -> Vec<u8> {
        self.format.lock().unwrap().unique_id().to_vec()
    }

    /// The splitter the snapshot walker must cut streams with.
    pub fn splitter(&self) -> Result<Box<dyn hbk_repository::Splitter>, Error> {
        let format = self.format.lock().unwrap();
        hbk_repository::splitter::splitter_by_name(format.splitter())
    }

    /// The maintenance engine bound to this client's identity.
    pub fn maintenance(&self) -> MaintenanceEngine {
        MaintenanceEngine::new(
            self.contents.clone(),
            Some(self.manifests.clone()),
            self.epoch.clone(),
            self.namer.clone(),
            self.options.identity.clone(),
        )
    }

    /// Re-wrap the repository keys under a new password. Stored data
    /// is untouched; the old password stops working immediately.
    pub fn change_password(&self, old_password: &str, new_password: &str) -> Result<(), Error> {
        let mut format = self.format.lock().unwrap();
        format.change_password(old_password, new_password)?;
        format.store(self.store.as_ref())
    }

    /// Advanced: hide a content and allow early reclamation of its
    /// bytes. Unsafe under concurrent writers.
    pub fn forget_content(&self, id: &ContentId) -> Result<(), Error> {
        self.contents.forget_content(id)
    }

    /// Rewrite one content into a fresh pack.
    pub fn rewrite_content(&self, id: &ContentId, task: &dyn TaskContext) -> Result<(), Error> {
        self.contents.rewrite_content(id, task)
    }

    pub fn verify_contents(
        &self,
        opts: &VerifyOptions,
        task: &dyn TaskContext,
    ) -> Result<VerifyStats, Error> {
        self.contents.verify_contents(opts, task)
    }

    pub fn prefetch_contents(&self, ids: &[ContentId], task: &dyn TaskContext) -> usize {
        self.contents.prefetch_contents(ids, task)
    }

    pub fn content_stats(&self, task: &dyn TaskContext) -> Result<ContentStats, Error> {
        self.contents.content_stats(task)
    }

    pub fn blob_stats(&self, task: &dyn TaskContext) -> Result<Vec<BlobKindStats>, Error> {
        hbk_repository::stats::blob_kind_stats(self.store.as_ref(), task)
    }

    /// Pick up index generations written by other clients.
    pub fn refresh_indexes(&self, task: &dyn TaskContext) -> Result<(), Error> {
        self.contents.refresh_indexes(task)?;
        Ok(())
    }

    /// Freeze the generation list for a long consistent scan.
    pub fn set_index_refresh_disabled(&self, disabled: bool) {
        self.contents.set_index_refresh_disabled(disabled);
    }

    /// Flush (or on `abort` abandon) the write session.
    pub fn close(&self, abort: bool, task: &dyn TaskContext) -> Result<(), Error> {
        self.contents.close(abort, task)
    }
}

impl RepositoryReader for Repository {
    fn contains_content(&self, id: &ContentId) -> bool {
        self.contents.contains_content(id)
    }

    fn get_content(&self, id: &ContentId, task: &dyn TaskContext) -> Result<Vec<u8>, Error> {
        self.contents.get_content(id, task)
    }

    fn iterate_contents(
        &self,
        opts: &IterateOptions,
        task: &dyn TaskContext,
        cb: &mut dyn FnMut(&IndexEntry) -> Result<(), Error>,
    ) -> Result<(), Error> {
        self.contents.indexes().iterate_contents(opts, task, cb)
    }

    fn get_manifest(
        &self,
        id: &ManifestId,
        task: &dyn TaskContext,
    ) -> Result<(BTreeMap<String, String>, Vec<u8>), Error> {
        self.manifests.get(id, task)
    }

    fn find_manifests(&self, labels: &BTreeMap<String, String>) -> Vec<ManifestInfo> {
        self.manifests.find(labels)
    }
}

impl RepositoryWriter for Repository {
    fn write_content(
        &self,
        prefix: u8,
        data: &[u8],
        task: &dyn TaskContext,
    ) -> Result<ContentId, Error> {
        self.contents.write_content(prefix, data, task)
    }

    fn delete_content(&self, id: &ContentId) -> Result<(), Error> {
        self.contents.delete_content(id)
    }

    fn put_manifest(
        &self,
        labels: BTreeMap<String, String>,
        payload: Vec<u8>,
        task: &dyn TaskContext,
    ) -> Result<ManifestId, Error> {
        self.manifests.put(labels, payload, task)
    }

    fn delete_manifest(&self, id: &ManifestId, task: &dyn TaskContext) -> Result<(), Error> {
        self.manifests.delete(id, task)
    }

    fn flush(&self, task: &dyn TaskContext) -> Result<(), Error> {
        self.contents.flush(task)
    }
}

/// Open a repository described by a client config document: build the
/// storage backend from the tagged connection info, evaluate the
/// password source and wire up the configured cache.
pub fn connect(
    config: &hbk_config::ClientConfig,
    password: &hbk_config::PasswordSource,
    task: &dyn TaskContext,
) -> Result<Repository, Error> {
    use hbk_config::StorageConnection;
    use hbk_repository::backend::{FilesystemStore, MemoryStore};

    let store: Arc<dyn BlobStore> = match config.storage {
        StorageConnection::Filesystem { ref path } => {
            Arc::new(FilesystemStore::open(path.clone())?)
        }
        StorageConnection::Memory => Arc::new(MemoryStore::new()),
    };

    let password = password.evaluate()?;
    let cache = config
        .cache
        .resolve_directory()
        .ok()
        .map(|dir| (dir, config.cache.limits));

    let options = RepositoryOptions {
        cache,
        identity: config.client.identity(),
        ..Default::default()
    };
    open_repository(store, &password, options, task)
}

/// Convenience: create with default algorithms.
pub fn create_repository_with_defaults(
    store: &dyn BlobStore,
    password: &str,
) -> Result<(), Error> {
    create_repository(
        store,
        password,
        Kdf::PBKDF2,
        crypto::DEFAULT_HASH,
        crypto::DEFAULT_ENCRYPTION,
    )
}

/// Quick storage self-test: write, stat, read, list and delete a probe
/// blob through the adapter.
pub fn validate_provider(store: &dyn BlobStore, task: &dyn TaskContext) -> Result<(), Error> {
    use hbk_api_types::BlobId;
    use hbk_repository::blob_store::PutOptions;

    let probe = BlobId::from(format!("z-validate-{}", uuid::Uuid::new_v4().simple()));
    let payload = b"storage validation probe";

    store
        .put_blob(&probe, payload, &PutOptions::default())
        .context("provider validation: put failed")?;
    let meta = store
        .get_metadata(&probe)
        .context("provider validation: stat failed")?;
    if meta.length != payload.len() as u64 {
        bail!("provider validation: stat reports wrong length");
    }
    let read = store
        .get_blob(&probe, 0, None)
        .context("provider validation: get failed")?;
    if read != payload {
        bail!("provider validation: read returned wrong bytes");
    }

    let mut seen = false;
    store.list(probe.as_str(), task, &mut |listed| {
        seen = seen || listed.id == probe;
        Ok(())
    })?;
    if !seen {
        bail!("provider validation: probe blob missing from listing");
    }

    store
        .delete_blob(&probe)
        .context("provider validation: delete failed")?;
    match store.get_metadata(&probe) {
        Err(err) if hbk_repository::error::is_blob_not_found(&err) => Ok(()),
        Err(err) => Err(err),
        Ok(_) => bail!("provider validation: blob still present after delete"),
    }
}
