use std::collections::BTreeMap;
use std::sync::Mutex;

use anyhow::{bail, Error};

use hbk_api_types::{BlobId, BlobMeta};
use hbk_tools::task::TaskContext;

use crate::blob_store::{BlobStore, PutOptions};
use crate::error::StoreError;

struct MemoryBlob {
    data: Vec<u8>,
    timestamp: i64,
    retain_until: Option<i64>,
}

/// Volatile in-memory blob store.
///
/// Supports timestamp manipulation so tests can age blobs past safety
/// windows without sleeping.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<BTreeMap<String, MemoryBlob>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored blobs.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Backdate (or forward-date) a stored blob.
    pub fn set_timestamp(&self, id: &BlobId, timestamp: i64) -> Result<(), Error> {
        let mut inner = self.inner.lock().unwrap();
        match inner.get_mut(id.as_str()) {
            Some(blob) => {
                blob.timestamp = timestamp;
                Ok(())
            }
            None => Err(StoreError::NotFound(id.clone()).into()),
        }
    }

    /// Backdate every stored blob whose name starts with `prefix`.
    pub fn set_timestamps_by_prefix(&self, prefix: &str, timestamp: i64) {
        let mut inner = self.inner.lock().unwrap();
        for (name, blob) in inner.iter_mut() {
            if name.starts_with(prefix) {
                blob.timestamp = timestamp;
            }
        }
    }
}

impl BlobStore for MemoryStore {
    fn display_name(&self) -> String {
        "memory".to_string()
    }

    fn list(
        &self,
        prefix: &str,
        task: &dyn TaskContext,
        cb: &mut dyn FnMut(BlobMeta) -> Result<(), Error>,
    ) -> Result<(), Error> {
        // collect under the lock, call back without it
        let matches: Vec<BlobMeta> = {
            let inner = self.inner.lock().unwrap();
            inner
                .iter()
                .filter(|(name, _)| name.starts_with(prefix))
                .map(|(name, blob)| BlobMeta {
                    id: BlobId::from(name.as_str()),
                    length: blob.data.len() as u64,
                    timestamp: blob.timestamp,
                })
                .collect()
        };
        for meta in matches {
            task.check_abort()?;
            cb(meta)?;
        }
        Ok(())
    }

    fn get_blob(&self, id: &BlobId, offset: u64, length: Option<u64>) -> Result<Vec<u8>, Error> {
        let inner = self.inner.lock().unwrap();
        let blob = inner
            .get(id.as_str())
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;
        let offset = offset as usize;
        if offset > blob.data.len() {
            bail!("read beyond end of blob '{}'", id);
        }
        let end = match length {
            Some(length) => {
                let end = offset + length as usize;
                if end > blob.data.len() {
                    bail!("read beyond end of blob '{}'", id);
                }
                end
            }
            None => blob.data.len(),
        };
        Ok(blob.data[offset..end].to_vec())
    }

    fn get_metadata(&self, id: &BlobId) -> Result<BlobMeta, Error> {
        let inner = self.inner.lock().unwrap();
        let blob = inner
            .get(id.as_str())
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;
        Ok(BlobMeta {
            id: id.clone(),
            length: blob.data.len() as u64,
            timestamp: blob.timestamp,
        })
    }

    fn put_blob(&self, id: &BlobId, data: &[u8], opts: &PutOptions) -> Result<(), Error> {
        let mut inner = self.inner.lock().unwrap();
        let timestamp = opts
            .set_mod_time
            .unwrap_or_else(hbk_tools::time::epoch_i64);
        inner.insert(
            id.as_str().to_string(),
            MemoryBlob {
                data: data.to_vec(),
                timestamp,
                retain_until: opts.retain_until,
            },
        );
        Ok(())
    }

    fn delete_blob(&self, id: &BlobId) -> Result<(), Error> {
        let mut inner = self.inner.lock().unwrap();
        match inner.get(id.as_str()) {
            None => return Err(StoreError::NotFound(id.clone()).into()),
            Some(blob) => {
                if let Some(retain_until) = blob.retain_until {
                    if hbk_tools::time::epoch_i64() < retain_until {
                        bail!("blob '{}' is retention locked", id);
                    }
                }
            }
        }
        inner.remove(id.as_str());
        Ok(())
    }

    fn extend_retention(&self, id: &BlobId, retain_until: i64) -> Result<(), Error> {
        let mut inner = self.inner.lock().unwrap();
        let blob = inner
            .get_mut(id.as_str())
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;
        if blob.retain_until.unwrap_or(0) < retain_until {
            blob.retain_until = Some(retain_until);
        }
        Ok(())
    }
}
