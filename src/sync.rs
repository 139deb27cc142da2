//! Mirror one repository's blob set onto another store.

use anyhow::{bail, Error};

use hbk_api_types::{BlobKind, BlobMeta};
use hbk_repository::blob_store::{list_blobs, BlobStore, PutOptions};
use hbk_repository::format::FormatBlob;
use hbk_tools::task::TaskContext;
use hbk_tools::task_log;

/// Counters reported by one sync run.
#[derive(Clone, Debug, Default)]
pub struct SyncStats {
    pub copied: usize,
    pub copied_bytes: u64,
    pub deleted: usize,
    pub kept: usize,
}

fn is_mutable(meta: &BlobMeta) -> bool {
    matches!(meta.id.kind(), BlobKind::Format | BlobKind::Maintenance)
}

/// Copy every blob of `src` into `dst`; with `delete` also remove
/// blobs only present in `dst` so the sets end up equal.
///
/// Refuses to touch a destination that already holds a different
/// repository (distinct unique id): syncing two repositories into one
/// store would corrupt both.
pub fn sync_to(
    src: &dyn BlobStore,
    dst: &dyn BlobStore,
    delete: bool,
    task: &dyn TaskContext,
) -> Result<SyncStats, Error> {
    let src_format = FormatBlob::load(src)?;
    if FormatBlob::exists(dst)? {
        let dst_format = FormatBlob::load(dst)?;
        if dst_format.unique_id() != src_format.unique_id() {
            bail!(
                "destination '{}' holds an incompatible repository (unique id mismatch)",
                dst.display_name()
            );
        }
    }

    let src_blobs = list_blobs(src, "", task)?;
    let dst_blobs = list_blobs(dst, "", task)?;

    let dst_names: std::collections::HashMap<&str, u64> = dst_blobs
        .iter()
        .map(|meta| (meta.id.as_str(), meta.length))
        .collect();
    let src_names: std::collections::HashSet<&str> =
        src_blobs.iter().map(|meta| meta.id.as_str()).collect();

    // the format and maintenance blobs are the only names whose bytes
    // may change; they are always re-copied and written last
    let (mutable, immutable): (Vec<&BlobMeta>, Vec<&BlobMeta>) =
        src_blobs.iter().partition(|meta| is_mutable(meta));

    let mut stats = SyncStats::default();
    for meta in immutable.into_iter().chain(mutable) {
        task.check_abort()?;
        let skip = !is_mutable(meta) && dst_names.get(meta.id.as_str()) == Some(&meta.length);
        if skip {
            stats.kept += 1;
            continue;
        }
        let data = src.get_blob(&meta.id, 0, None)?;
        dst.put_blob(&meta.id, &data, &PutOptions::default())?;
        stats.copied += 1;
        stats.copied_bytes += data.len() as u64;
    }

    if delete {
        for meta in &dst_blobs {
            task.check_abort()?;
            if !src_names.contains(meta.id.as_str()) {
                dst.delete_blob(&meta.id)?;
                stats.deleted += 1;
            }
        }
    }

    task_log!(
        task,
        "sync finished: {} copied, {} kept, {} deleted",
        stats.copied,
        stats.kept,
        stats.deleted
    );
    Ok(stats)
}
