use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::Error;

use hbk_api_types::{BlobId, SafetyParameters, CONTENT_PREFIX_DATA};
use hbk_repository::backend::MemoryStore;
use hbk_repository::blob_store::{list_blobs, BlobStore, PutOptions};
use hbk_repository::format::FormatBlob;
use hbk_tools::task::SimpleTask;

use hoard_backup::{
    create_repository_with_defaults, open_repository, sync_to, RepositoryOptions,
    RepositoryReader, RepositoryWriter,
};

fn options() -> RepositoryOptions {
    RepositoryOptions {
        safety: SafetyParameters::none(),
        identity: "tester@localhost".to_string(),
        ..Default::default()
    }
}

fn blob_names(store: &MemoryStore, task: &SimpleTask) -> Result<BTreeSet<String>, Error> {
    Ok(list_blobs(store, "", task)?
        .into_iter()
        .map(|meta| meta.id.as_str().to_string())
        .collect())
}

#[test]
fn sync_copies_and_deletes() -> Result<(), Error> {
    let task = SimpleTask::new("test");
    let src = Arc::new(MemoryStore::new());
    let dst = MemoryStore::new();

    create_repository_with_defaults(src.as_ref(), "secret")?;
    let repo = open_repository(src.clone(), "secret", options(), &task)?;
    let id = repo.write_content(CONTENT_PREFIX_DATA, b"mirrored bytes", &task)?;
    repo.flush(&task)?;

    // first sync: destination becomes a superset (here: equal)
    let stats = sync_to(src.as_ref(), &dst, false, &task)?;
    assert!(stats.copied > 0);
    assert_eq!(blob_names(src.as_ref(), &task)?, blob_names(&dst, &task)?);

    // unique ids match afterwards
    let src_format = FormatBlob::load(src.as_ref())?;
    let dst_format = FormatBlob::load(&dst)?;
    assert_eq!(src_format.unique_id(), dst_format.unique_id());

    // a stray blob in dst survives without --delete
    let stray = BlobId::from("p000000000000000000000000000000ff");
    dst.put_blob(&stray, b"stray", &PutOptions::default())?;
    sync_to(src.as_ref(), &dst, false, &task)?;
    assert!(dst.get_metadata(&stray).is_ok());
    let src_names = blob_names(src.as_ref(), &task)?;
    let dst_names = blob_names(&dst, &task)?;
    assert!(dst_names.is_superset(&src_names));

    // with delete the sets end up equal
    let stats = sync_to(src.as_ref(), &dst, true, &task)?;
    assert_eq!(stats.deleted, 1);
    assert_eq!(blob_names(src.as_ref(), &task)?, blob_names(&dst, &task)?);

    // the mirror is a fully working repository
    let mirror = open_repository(Arc::new(dst), "secret", options(), &task)?;
    assert_eq!(mirror.get_content(&id, &task)?, b"mirrored bytes");
    Ok(())
}

#[test]
fn sync_refuses_foreign_destination() -> Result<(), Error> {
    let task = SimpleTask::new("test");
    let src = Arc::new(MemoryStore::new());
    let dst = Arc::new(MemoryStore::new());

    create_repository_with_defaults(src.as_ref(), "secret")?;
    create_repository_with_defaults(dst.as_ref(), "other")?;

    let repo = open_repository(src.clone(), "secret", options(), &task)?;
    repo.write_content(CONTENT_PREFIX_DATA, b"never arrives", &task)?;
    repo.flush(&task)?;

    let before = blob_names(dst.as_ref(), &task)?;
    let err = sync_to(src.as_ref(), dst.as_ref(), true, &task).unwrap_err();
    assert!(err.to_string().contains("incompatible"));
    // nothing was written or deleted
    assert_eq!(blob_names(dst.as_ref(), &task)?, before);
    Ok(())
}

#[test]
fn sync_is_incremental() -> Result<(), Error> {
    let task = SimpleTask::new("test");
    let src = Arc::new(MemoryStore::new());
    let dst = MemoryStore::new();

    create_repository_with_defaults(src.as_ref(), "secret")?;
    let repo = open_repository(src.clone(), "secret", options(), &task)?;
    repo.write_content(CONTENT_PREFIX_DATA, b"round one", &task)?;
    repo.flush(&task)?;

    let first = sync_to(src.as_ref(), &dst, false, &task)?;
    let copied_first = first.copied;

    repo.write_content(CONTENT_PREFIX_DATA, b"round two", &task)?;
    repo.flush(&task)?;

    let second = sync_to(src.as_ref(), &dst, false, &task)?;
    // only the new pack, the new index blob and the mutable blobs move
    assert!(second.copied < copied_first + 3);
    assert!(second.kept > 0);
    Ok(())
}
