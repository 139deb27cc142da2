//! Aggregate statistics over stored blobs.

use std::collections::BTreeMap;

use anyhow::Error;

use hbk_api_types::BlobKindStats;
use hbk_tools::task::TaskContext;

use crate::blob_store::BlobStore;

/// Count and size of stored blobs, grouped by kind.
pub fn blob_kind_stats(
    store: &dyn BlobStore,
    task: &dyn TaskContext,
) -> Result<Vec<BlobKindStats>, Error> {
    let mut by_kind: BTreeMap<&'static str, (usize, u64)> = BTreeMap::new();
    store.list("", task, &mut |meta| {
        let slot = by_kind.entry(meta.id.kind().as_str()).or_insert((0, 0));
        slot.0 += 1;
        slot.1 += meta.length;
        Ok(())
    })?;

    Ok(by_kind
        .into_iter()
        .map(|(kind, (count, bytes))| BlobKindStats {
            kind: kind.to_string(),
            count,
            bytes,
        })
        .collect())
}
