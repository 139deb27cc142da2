//! The epoch manager: ordered index generations for lock-free
//! concurrent writers.
//!
//! Index blobs written under this regime are named `xn<epoch>…` with a
//! monotonic epoch number. Compaction proceeds one finalized epoch at
//! a time, so a compactor never races the writers flushing into the
//! current epoch; this replaces any global write lock between writers
//! and compactors.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use anyhow::Error;

use hbk_api_types::{BlobId, BlobMeta, EPOCH_INDEX_BLOB_PREFIX};
use hbk_tools::task::TaskContext;

use crate::blob_store::{list_blobs, BlobStore};
use crate::pack::IndexNamer;

/// When the current epoch is advanced.
#[derive(Clone, Copy, Debug)]
pub struct EpochParams {
    /// Advance once the oldest blob in the current epoch is this old
    /// (seconds).
    pub min_epoch_duration: i64,
    /// Advance once the current epoch holds this many index blobs.
    pub epoch_advance_blob_count: usize,
}

impl Default for EpochParams {
    fn default() -> Self {
        Self {
            min_epoch_duration: 15 * 60,
            epoch_advance_blob_count: 20,
        }
    }
}

#[derive(Default)]
struct EpochState {
    current: u64,
    blobs_in_current: usize,
    oldest_in_current: Option<i64>,
}

/// Tracks the current epoch and names index blobs accordingly.
pub struct EpochManager {
    store: Arc<dyn BlobStore>,
    params: EpochParams,
    state: Mutex<EpochState>,
}

impl EpochManager {
    pub fn new(store: Arc<dyn BlobStore>, params: EpochParams) -> Self {
        Self {
            store,
            params,
            state: Mutex::new(EpochState::default()),
        }
    }

    /// Epoch number embedded in an `xn…` blob name.
    pub fn epoch_of(id: &BlobId) -> Option<u64> {
        let name = id.as_str();
        let hex = name.strip_prefix(EPOCH_INDEX_BLOB_PREFIX)?.get(0..8)?;
        u64::from_str_radix(hex, 16).ok()
    }

    /// Re-derive the epoch state from the stored index blobs.
    pub fn refresh(&self, task: &dyn TaskContext) -> Result<(), Error> {
        let blobs = list_blobs(self.store.as_ref(), EPOCH_INDEX_BLOB_PREFIX, task)?;

        let mut current = 0;
        for meta in &blobs {
            if let Some(epoch) = Self::epoch_of(&meta.id) {
                current = current.max(epoch);
            }
        }

        let mut blobs_in_current = 0;
        let mut oldest_in_current = None;
        for meta in &blobs {
            if Self::epoch_of(&meta.id) == Some(current) {
                blobs_in_current += 1;
                oldest_in_current = match oldest_in_current {
                    None => Some(meta.timestamp),
                    Some(oldest) => Some(meta.timestamp.min(oldest)),
                };
            }
        }

        let mut state = self.state.lock().unwrap();
        state.current = current;
        state.blobs_in_current = blobs_in_current;
        state.oldest_in_current = oldest_in_current;
        Ok(())
    }

    pub fn current_epoch(&self) -> u64 {
        self.state.lock().unwrap().current
    }

    fn maybe_advance(&self, state: &mut EpochState, now: i64) {
        if state.blobs_in_current == 0 {
            return;
        }
        let too_many = state.blobs_in_current >= self.params.epoch_advance_blob_count;
        let too_old = state
            .oldest_in_current
            .map(|oldest| now - oldest >= self.params.min_epoch_duration)
            .unwrap_or(false);
        if too_many || too_old {
            state.current += 1;
            state.blobs_in_current = 0;
            state.oldest_in_current = None;
        }
    }

    /// Epochs strictly below the current one; no writer flushes into
    /// them anymore.
    pub fn finalized_epochs(&self) -> Vec<u64> {
        (0..self.current_epoch()).collect()
    }

    /// Finalized epochs holding more than one blob whose newest blob
    /// is older than the safety window; compacting them cannot race a
    /// slow writer.
    pub fn compactable_epochs(&self, blobs: &[BlobMeta], now: i64, safety_window: i64) -> Vec<u64> {
        let current = self.current_epoch();

        let mut per_epoch: BTreeMap<u64, (usize, i64)> = BTreeMap::new();
        for meta in blobs {
            if let Some(epoch) = Self::epoch_of(&meta.id) {
                let slot = per_epoch.entry(epoch).or_insert((0, i64::MIN));
                slot.0 += 1;
                slot.1 = slot.1.max(meta.timestamp);
            }
        }

        per_epoch
            .into_iter()
            .filter(|(epoch, (count, newest))| {
                *epoch < current && *count > 1 && now - *newest >= safety_window
            })
            .map(|(epoch, _)| epoch)
            .collect()
    }

    /// Name for the single blob replacing a compacted epoch.
    pub fn compacted_blob_id(&self, epoch: u64) -> BlobId {
        BlobId::from(format!(
            "{}{:08x}c{}",
            EPOCH_INDEX_BLOB_PREFIX,
            epoch,
            uuid::Uuid::new_v4().simple()
        ))
    }
}

impl IndexNamer for EpochManager {
    fn next_index_blob_id(&self) -> Result<BlobId, Error> {
        let now = hbk_tools::time::epoch_i64();
        let mut state = self.state.lock().unwrap();
        self.maybe_advance(&mut state, now);

        state.blobs_in_current += 1;
        if state.oldest_in_current.is_none() {
            state.oldest_in_current = Some(now);
        }
        Ok(BlobId::from(format!(
            "{}{:08x}_{}",
            EPOCH_INDEX_BLOB_PREFIX,
            state.current,
            uuid::Uuid::new_v4().simple()
        )))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::backend::MemoryStore;
    use crate::blob_store::PutOptions;
    use hbk_tools::task::SimpleTask;

    #[test]
    fn epoch_parsing() {
        assert_eq!(
            EpochManager::epoch_of(&BlobId::from("xn00000003_abcdef")),
            Some(3)
        );
        assert_eq!(
            EpochManager::epoch_of(&BlobId::from("xn0000000ac9fe")),
            Some(10)
        );
        assert_eq!(EpochManager::epoch_of(&BlobId::from("nabcdef")), None);
        assert_eq!(EpochManager::epoch_of(&BlobId::from("xn12")), None);
    }

    #[test]
    fn advance_by_count() -> Result<(), Error> {
        let manager = EpochManager::new(
            Arc::new(MemoryStore::new()),
            EpochParams {
                min_epoch_duration: 3600,
                epoch_advance_blob_count: 3,
            },
        );

        let mut names = Vec::new();
        for _ in 0..7 {
            names.push(manager.next_index_blob_id()?);
        }
        let epochs: Vec<u64> = names
            .iter()
            .map(|id| EpochManager::epoch_of(id).unwrap())
            .collect();
        assert_eq!(epochs, [0, 0, 0, 1, 1, 1, 2]);
        Ok(())
    }

    #[test]
    fn refresh_from_store() -> Result<(), Error> {
        let task = SimpleTask::new("test");
        let store = Arc::new(MemoryStore::new());
        for name in ["xn00000000_a", "xn00000001_b", "xn00000001_c"] {
            store.put_blob(&BlobId::from(name), b"x", &PutOptions::default())?;
        }

        let manager = EpochManager::new(store, EpochParams::default());
        manager.refresh(&task)?;
        assert_eq!(manager.current_epoch(), 1);
        assert_eq!(manager.finalized_epochs(), [0]);
        Ok(())
    }

    #[test]
    fn compactable_respects_safety_window() {
        let manager = EpochManager::new(Arc::new(MemoryStore::new()), EpochParams::default());
        {
            let mut state = manager.state.lock().unwrap();
            state.current = 2;
        }

        let meta = |name: &str, timestamp: i64| BlobMeta {
            id: BlobId::from(name),
            length: 1,
            timestamp,
        };
        let blobs = vec![
            meta("xn00000000_a", 100),
            meta("xn00000000_b", 150),
            meta("xn00000001_c", 950),
            meta("xn00000001_d", 990),
            meta("xn00000002_e", 995),
        ];

        // epoch 0 old enough, epoch 1 too fresh, epoch 2 current
        assert_eq!(manager.compactable_epochs(&blobs, 1000, 100), [0]);
        // with no window both finalized epochs qualify
        assert_eq!(manager.compactable_epochs(&blobs, 1000, 0), [0, 1]);
    }
}
