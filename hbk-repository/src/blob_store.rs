use std::sync::Arc;
use std::time::Duration;

use anyhow::Error;

use hbk_api_types::{BlobId, BlobMeta};
use hbk_tools::task::TaskContext;

use crate::error::StoreError;

/// Options for [BlobStore::put_blob].
#[derive(Clone, Copy, Debug, Default)]
pub struct PutOptions {
    /// Override the storage timestamp (epoch seconds). Backends that
    /// cannot honor this fail with [StoreError::SetTimeUnsupported].
    pub set_mod_time: Option<i64>,
    /// Keep the blob immutable and undeletable until this time.
    pub retain_until: Option<i64>,
}

/// Key→bytes object store, the only interface the repository core uses
/// to talk to storage.
///
/// Contracts: `list` is prefix-complete; `put_blob` is atomic per blob;
/// concurrent writers to the same name are allowed and the last
/// writer's bytes win; timestamps come from storage, not from the
/// caller, and are not monotonic across writers. The store is trusted
/// for integrity at the name level only; tampered bytes are caught by
/// decryption, not here.
pub trait BlobStore: Send + Sync {
    /// Human readable description for error messages and logs.
    fn display_name(&self) -> String;

    /// Call `cb` for every blob whose name starts with `prefix`.
    fn list(
        &self,
        prefix: &str,
        task: &dyn TaskContext,
        cb: &mut dyn FnMut(BlobMeta) -> Result<(), Error>,
    ) -> Result<(), Error>;

    /// Read `length` bytes at `offset` (or the rest of the blob when
    /// `length` is `None`).
    fn get_blob(&self, id: &BlobId, offset: u64, length: Option<u64>) -> Result<Vec<u8>, Error>;

    fn get_metadata(&self, id: &BlobId) -> Result<BlobMeta, Error>;

    fn put_blob(&self, id: &BlobId, data: &[u8], opts: &PutOptions) -> Result<(), Error>;

    /// Atomic name removal.
    fn delete_blob(&self, id: &BlobId) -> Result<(), Error>;

    /// Extend an object-lock retention period, where supported.
    fn extend_retention(&self, _id: &BlobId, _retain_until: i64) -> Result<(), Error> {
        Err(StoreError::RetentionUnsupported.into())
    }
}

/// Collect a listing into memory.
pub fn list_blobs(
    store: &dyn BlobStore,
    prefix: &str,
    task: &dyn TaskContext,
) -> Result<Vec<BlobMeta>, Error> {
    let mut blobs = Vec::new();
    store.list(prefix, task, &mut |meta| {
        blobs.push(meta);
        Ok(())
    })?;
    Ok(blobs)
}

/// Decorator retrying transient storage errors with exponential
/// backoff. Listings are passed through unchanged since the callback
/// may already have observed entries.
pub struct RetryingStore {
    inner: Arc<dyn BlobStore>,
    max_attempts: usize,
    base_delay: Duration,
}

impl RetryingStore {
    pub fn new(inner: Arc<dyn BlobStore>) -> Self {
        Self {
            inner,
            max_attempts: 4,
            base_delay: Duration::from_millis(100),
        }
    }

    fn retry<T>(&self, mut op: impl FnMut() -> Result<T, Error>) -> Result<T, Error> {
        let mut delay = self.base_delay;
        let mut attempt = 1;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(err) => {
                    let transient =
                        matches!(err.downcast_ref::<StoreError>(), Some(StoreError::Transient(_)));
                    if !transient || attempt >= self.max_attempts {
                        return Err(err);
                    }
                    log::warn!(
                        "transient storage error on {} (attempt {}/{}) - {}",
                        self.inner.display_name(),
                        attempt,
                        self.max_attempts,
                        err
                    );
                    std::thread::sleep(delay);
                    delay *= 2;
                    attempt += 1;
                }
            }
        }
    }
}

impl BlobStore for RetryingStore {
    fn display_name(&self) -> String {
        self.inner.display_name()
    }

    fn list(
        &self,
        prefix: &str,
        task: &dyn TaskContext,
        cb: &mut dyn FnMut(BlobMeta) -> Result<(), Error>,
    ) -> Result<(), Error> {
        self.inner.list(prefix, task, cb)
    }

    fn get_blob(&self, id: &BlobId, offset: u64, length: Option<u64>) -> Result<Vec<u8>, Error> {
        self.retry(|| self.inner.get_blob(id, offset, length))
    }

    fn get_metadata(&self, id: &BlobId) -> Result<BlobMeta, Error> {
        self.retry(|| self.inner.get_metadata(id))
    }

    fn put_blob(&self, id: &BlobId, data: &[u8], opts: &PutOptions) -> Result<(), Error> {
        self.retry(|| self.inner.put_blob(id, data, opts))
    }

    fn delete_blob(&self, id: &BlobId) -> Result<(), Error> {
        self.retry(|| self.inner.delete_blob(id))
    }

    fn extend_retention(&self, id: &BlobId, retain_until: i64) -> Result<(), Error> {
        self.retry(|| self.inner.extend_retention(id, retain_until))
    }
}
