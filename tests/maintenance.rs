use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Error;

use hbk_api_types::{
    BlobId, BlobMeta, MaintenanceCycle, SafetyParameters, CONTENT_PREFIX_DATA, RESERVE_BLOB_NAME,
};
use hbk_repository::backend::MemoryStore;
use hbk_repository::blob_store::{list_blobs, BlobStore, PutOptions};
use hbk_repository::error::{is_content_not_found, StoreError};
use hbk_repository::{MaintenanceOptions, VerifyOptions};
use hbk_tools::task::{SimpleTask, TaskContext};

use hoard_backup::{
    create_repository_with_defaults, open_repository, Repository, RepositoryOptions,
    RepositoryReader, RepositoryWriter,
};

fn options(identity: &str) -> RepositoryOptions {
    RepositoryOptions {
        safety: SafetyParameters::none(),
        identity: identity.to_string(),
        ..Default::default()
    }
}

fn new_repo(store: &Arc<MemoryStore>) -> Result<Repository, Error> {
    let task = SimpleTask::new("open");
    create_repository_with_defaults(store.as_ref(), "secret")?;
    open_repository(store.clone(), "secret", options("tester@localhost"), &task)
}

fn no_safety() -> MaintenanceOptions {
    MaintenanceOptions {
        dry_run: false,
        safety: SafetyParameters::none(),
    }
}

#[test]
fn short_pack_rewrite() -> Result<(), Error> {
    let task = SimpleTask::new("test");
    let store = Arc::new(MemoryStore::new());
    let repo = new_repo(&store)?;

    // five small contents end up in one pack of a few KiB, far below
    // the 60% threshold of the 20 MiB bound
    let mut ids = Vec::new();
    for i in 0u8..5 {
        ids.push(repo.write_content(CONTENT_PREFIX_DATA, &vec![i; 1024], &task)?);
    }
    repo.flush(&task)?;

    let original_pack = repo.contents().lookup_entry(&ids[0]).unwrap().pack.unwrap();
    assert_eq!(list_blobs(store.as_ref(), "p", &task)?.len(), 1);

    let summary = repo
        .maintenance()
        .run(MaintenanceCycle::Full, &no_safety(), &task)?
        .expect("lease should be free");
    assert_eq!(summary.rewrite.packs_rewritten, 1);
    assert_eq!(summary.rewrite.contents_rewritten, 5);

    // the drained pack is gone, one fresh pack holds all contents
    let packs = list_blobs(store.as_ref(), "p", &task)?;
    assert_eq!(packs.len(), 1);
    assert_ne!(packs[0].id, original_pack);

    for (i, id) in ids.iter().enumerate() {
        assert_eq!(repo.get_content(id, &task)?, vec![i as u8; 1024]);
    }
    Ok(())
}

#[test]
fn unreferenced_blob_gc() -> Result<(), Error> {
    let task = SimpleTask::new("test");
    let store = Arc::new(MemoryStore::new());
    let repo = new_repo(&store)?;

    let id = repo.write_content(CONTENT_PREFIX_DATA, b"referenced", &task)?;
    repo.flush(&task)?;
    let referenced_pack = repo.contents().lookup_entry(&id).unwrap().pack.unwrap();

    // a stray upload that no index entry references
    let stray = BlobId::from("p00000000000000000000000000deadbeef");
    store.put_blob(&stray, b"orphan bytes", &PutOptions::default())?;

    let engine = repo.maintenance();

    // dry run only prints plans
    let dry = engine.gc_unreferenced_blobs(
        &MaintenanceOptions {
            dry_run: true,
            safety: SafetyParameters::none(),
        },
        &task,
    )?;
    assert_eq!(dry.deleted_blobs, 1);
    assert!(store.get_metadata(&stray).is_ok());

    let status = engine.gc_unreferenced_blobs(&no_safety(), &task)?;
    assert_eq!(status.deleted_blobs, 1);
    assert_eq!(status.referenced_blobs, 1);
    assert!(store.get_metadata(&stray).is_err());
    assert!(store.get_metadata(&referenced_pack).is_ok());
    assert_eq!(repo.get_content(&id, &task)?, b"referenced");
    Ok(())
}

#[test]
fn gc_respects_safety_window() -> Result<(), Error> {
    let task = SimpleTask::new("test");
    let store = Arc::new(MemoryStore::new());
    let repo = new_repo(&store)?;

    // simulates a concurrent writer: a young pack whose index blob is
    // not published yet
    let young = BlobId::from("p11111111111111111111111111111111");
    store.put_blob(&young, b"racing writer pack", &PutOptions::default())?;

    let status = repo.maintenance().gc_unreferenced_blobs(
        &MaintenanceOptions {
            dry_run: false,
            safety: SafetyParameters::full(),
        },
        &task,
    )?;
    assert_eq!(status.deleted_blobs, 0);
    assert_eq!(status.pending_blobs, 1);
    assert!(store.get_metadata(&young).is_ok());

    // once the blob is older than the window it goes
    store.set_timestamp(&young, hbk_tools::time::epoch_i64() - 48 * 3600)?;
    let status = repo.maintenance().gc_unreferenced_blobs(
        &MaintenanceOptions {
            dry_run: false,
            safety: SafetyParameters::full(),
        },
        &task,
    )?;
    assert_eq!(status.deleted_blobs, 1);
    Ok(())
}

#[test]
fn index_recovery_from_pack_footers() -> Result<(), Error> {
    let task = SimpleTask::new("test");
    let store = Arc::new(MemoryStore::new());
    let repo = new_repo(&store)?;

    let mut ids = Vec::new();
    for i in 0u32..100 {
        ids.push(repo.write_content(CONTENT_PREFIX_DATA, format!("content #{}", i).as_bytes(), &task)?);
    }
    repo.flush(&task)?;

    // wipe every index blob behind the repository's back
    for meta in list_blobs(store.as_ref(), "n", &task)? {
        store.delete_blob(&meta.id)?;
    }
    repo.refresh_indexes(&task)?;
    assert!(is_content_not_found(
        &repo.get_content(&ids[0], &task).unwrap_err()
    ));

    let engine = repo.maintenance();
    // without commit nothing is written
    assert_eq!(engine.recover_indexes(false, &task)?, 100);
    assert!(list_blobs(store.as_ref(), "n", &task)?.is_empty());

    let recovered = engine.recover_indexes(true, &task)?;
    assert_eq!(recovered, 100);
    assert_eq!(list_blobs(store.as_ref(), "n", &task)?.len(), 1);

    let stats = repo.content_stats(&task)?;
    assert_eq!(stats.count, 100);
    for (i, id) in ids.iter().enumerate() {
        assert_eq!(repo.get_content(id, &task)?, format!("content #{}", i).as_bytes());
    }

    let verify = repo.verify_contents(
        &VerifyOptions {
            percent: 100,
            ..Default::default()
        },
        &task,
    )?;
    assert!(verify.is_ok());
    assert_eq!(verify.checked, 100);
    Ok(())
}

#[test]
fn tombstone_dropped_and_bytes_reclaimed() -> Result<(), Error> {
    let task = SimpleTask::new("test");
    let store = Arc::new(MemoryStore::new());
    let repo = new_repo(&store)?;

    let keep = repo.write_content(CONTENT_PREFIX_DATA, b"keep me", &task)?;
    repo.flush(&task)?;
    let gone = repo.write_content(CONTENT_PREFIX_DATA, b"drop me", &task)?;
    repo.flush(&task)?;

    repo.delete_content(&gone)?;
    repo.flush(&task)?;

    let summary = repo
        .maintenance()
        .run(MaintenanceCycle::Full, &no_safety(), &task)?
        .expect("lease should be free");
    assert!(summary.compacted_index_blobs >= 2);

    // without safety margins the tombstone is dropped outright and
    // the drained pack reclaimed
    let mut seen = 0;
    repo.iterate_contents(
        &hbk_repository::IterateOptions {
            include_deleted: true,
            ..Default::default()
        },
        &task,
        &mut |entry| {
            assert_ne!(entry.content, gone);
            seen += 1;
            Ok(())
        },
    )?;
    assert!(seen >= 1);
    assert_eq!(repo.get_content(&keep, &task)?, b"keep me");
    Ok(())
}

#[test]
fn competing_maintainer_declines() -> Result<(), Error> {
    let task = SimpleTask::new("test");
    let store = Arc::new(MemoryStore::new());
    create_repository_with_defaults(store.as_ref(), "secret")?;

    let repo_a = open_repository(store.clone(), "secret", options("a@host1"), &task)?;
    let repo_b = open_repository(store.clone(), "secret", options("b@host2"), &task)?;

    let guarded = MaintenanceOptions {
        dry_run: false,
        safety: SafetyParameters::full(),
    };

    // A takes the lease
    let first = repo_a
        .maintenance()
        .run(MaintenanceCycle::Quick, &guarded, &task)?;
    assert!(first.is_some());

    // B observes a fresh lease and declines
    let second = repo_b
        .maintenance()
        .run(MaintenanceCycle::Quick, &guarded, &task)?;
    assert!(second.is_none());

    // A itself may run again
    let third = repo_a
        .maintenance()
        .run(MaintenanceCycle::Quick, &guarded, &task)?;
    assert!(third.is_some());
    Ok(())
}

/// Store that reports insufficient space for every delete except the
/// recovery reserve; freeing the reserve makes room again.
struct FullStore {
    inner: MemoryStore,
    full: AtomicBool,
}

impl FullStore {
    fn new() -> Self {
        Self {
            inner: MemoryStore::new(),
            full: AtomicBool::new(false),
        }
    }
}

impl BlobStore for FullStore {
    fn display_name(&self) -> String {
        "full".to_string()
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
        self.inner.get_blob(id, offset, length)
    }

    fn get_metadata(&self, id: &BlobId) -> Result<BlobMeta, Error> {
        self.inner.get_metadata(id)
    }

    fn put_blob(&self, id: &BlobId, data: &[u8], opts: &PutOptions) -> Result<(), Error> {
        if self.full.load(Ordering::SeqCst) {
            return Err(StoreError::InsufficientSpace.into());
        }
        self.inner.put_blob(id, data, opts)
    }

    fn delete_blob(&self, id: &BlobId) -> Result<(), Error> {
        if id.as_str() == RESERVE_BLOB_NAME {
            self.inner.delete_blob(id)?;
            self.full.store(false, Ordering::SeqCst);
            return Ok(());
        }
        if self.full.load(Ordering::SeqCst) {
            return Err(StoreError::InsufficientSpace.into());
        }
        self.inner.delete_blob(id)
    }
}

#[test]
fn full_storage_frees_recovery_reserve() -> Result<(), Error> {
    let task = SimpleTask::new("test");
    let store = Arc::new(FullStore::new());
    create_repository_with_defaults(store.as_ref(), "secret")?;
    let repo = open_repository(store.clone(), "secret", options("tester@localhost"), &task)?;

    let reserve = BlobId::from(RESERVE_BLOB_NAME);
    assert!(store.get_metadata(&reserve).is_ok());

    let stray = BlobId::from("p22222222222222222222222222222222");
    store.put_blob(&stray, b"orphan bytes", &PutOptions::default())?;

    // the backend fills up; a plain delete would fail now
    store.full.store(true, Ordering::SeqCst);

    let status = repo
        .maintenance()
        .gc_unreferenced_blobs(&no_safety(), &task)?;
    assert_eq!(status.deleted_blobs, 1);
    assert!(store.get_metadata(&stray).is_err());
    // the reserve was sacrificed to make room for the cleanup
    assert!(store.get_metadata(&reserve).is_err());

    // the next owned run restores it
    repo.maintenance()
        .run(MaintenanceCycle::Quick, &no_safety(), &task)?;
    assert!(store.get_metadata(&reserve).is_ok());
    Ok(())
}

#[test]
fn maintenance_params_survive_runs() -> Result<(), Error> {
    let task = SimpleTask::new("test");
    let store = Arc::new(MemoryStore::new());
    let repo = new_repo(&store)?;

    let engine = repo.maintenance();
    engine.run(MaintenanceCycle::Quick, &no_safety(), &task)?;
    engine.run(MaintenanceCycle::Full, &no_safety(), &task)?;

    let params = engine.load_params()?;
    assert_eq!(params.owner.as_deref(), Some("tester@localhost"));
    assert!(params.last_run(MaintenanceCycle::Quick).is_some());
    assert!(params.last_run(MaintenanceCycle::Full).is_some());
    assert!(params.runs.iter().all(|run| run.success));

    // runs also uploaded their task logs
    assert_eq!(list_blobs(store.as_ref(), "_log_", &task)?.len(), 2);
    Ok(())
}
