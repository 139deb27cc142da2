use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Error;

use hbk_api_types::{ContentRange, SafetyParameters, CONTENT_PREFIX_DATA};
use hbk_repository::backend::MemoryStore;
use hbk_repository::blob_store::{list_blobs, BlobStore};
use hbk_repository::error::{is_content_not_found, is_invalid_password};
use hbk_repository::index::IterateOptions;
use hbk_repository::Splitter;
use hbk_tools::task::SimpleTask;

use hoard_backup::{
    create_repository_with_defaults, open_repository, validate_provider, Repository,
    RepositoryOptions, RepositoryReader, RepositoryWriter,
};

fn test_options() -> RepositoryOptions {
    RepositoryOptions {
        safety: SafetyParameters::none(),
        identity: "tester@localhost".to_string(),
        ..Default::default()
    }
}

fn new_repo(store: &Arc<MemoryStore>, password: &str) -> Result<Repository, Error> {
    let task = SimpleTask::new("open");
    create_repository_with_defaults(store.as_ref(), password)?;
    open_repository(store.clone(), password, test_options(), &task)
}

#[test]
fn dedup_writes_one_pack_blob() -> Result<(), Error> {
    let task = SimpleTask::new("test");
    let store = Arc::new(MemoryStore::new());
    let repo = new_repo(&store, "secret")?;

    let id1 = repo.write_content(CONTENT_PREFIX_DATA, b"hello", &task)?;
    let id2 = repo.write_content(CONTENT_PREFIX_DATA, b"hello", &task)?;
    assert_eq!(id1, id2);
    repo.flush(&task)?;

    assert_eq!(list_blobs(store.as_ref(), "p", &task)?.len(), 1);

    let stats = repo.content_stats(&task)?;
    assert_eq!(stats.count, 1);

    // dedup also holds against the published index
    let id3 = repo.write_content(CONTENT_PREFIX_DATA, b"hello", &task)?;
    assert_eq!(id1, id3);
    repo.flush(&task)?;
    assert_eq!(list_blobs(store.as_ref(), "p", &task)?.len(), 1);
    Ok(())
}

#[test]
fn roundtrip_across_sessions() -> Result<(), Error> {
    let task = SimpleTask::new("test");
    let store = Arc::new(MemoryStore::new());
    let repo = new_repo(&store, "secret")?;

    let compressible = vec![0x2au8; 256 * 1024];
    let id_small = repo.write_content(CONTENT_PREFIX_DATA, b"tiny", &task)?;
    let id_large = repo.write_content(CONTENT_PREFIX_DATA, &compressible, &task)?;

    // read-your-writes before any flush
    assert_eq!(repo.get_content(&id_small, &task)?, b"tiny");
    repo.flush(&task)?;
    assert_eq!(repo.get_content(&id_large, &task)?, compressible);

    // a second client sees the published state
    let other = open_repository(store.clone(), "secret", test_options(), &task)?;
    assert_eq!(other.get_content(&id_small, &task)?, b"tiny");
    assert_eq!(other.get_content(&id_large, &task)?, compressible);
    assert!(other.contains_content(&id_large));
    Ok(())
}

#[test]
fn open_errors() -> Result<(), Error> {
    let task = SimpleTask::new("test");
    let store = Arc::new(MemoryStore::new());

    // not a repository yet
    assert!(open_repository(store.clone(), "pw", test_options(), &task).is_err());

    create_repository_with_defaults(store.as_ref(), "alpha")?;
    // double create refused
    assert!(create_repository_with_defaults(store.as_ref(), "other").is_err());

    let err = open_repository(store.clone(), "beta", test_options(), &task).unwrap_err();
    assert!(is_invalid_password(&err));

    open_repository(store, "alpha", test_options(), &task)?;
    Ok(())
}

#[test]
fn password_change_transparency() -> Result<(), Error> {
    let task = SimpleTask::new("test");
    let store = Arc::new(MemoryStore::new());
    let repo = new_repo(&store, "alpha")?;

    let id = repo.write_content(CONTENT_PREFIX_DATA, b"payload before change", &task)?;
    repo.flush(&task)?;

    repo.change_password("alpha", "beta")?;

    let err = open_repository(store.clone(), "alpha", test_options(), &task).unwrap_err();
    assert!(is_invalid_password(&err));

    let reopened = open_repository(store, "beta", test_options(), &task)?;
    assert_eq!(reopened.get_content(&id, &task)?, b"payload before change");
    Ok(())
}

#[test]
fn delete_hides_but_preserves() -> Result<(), Error> {
    let task = SimpleTask::new("test");
    let store = Arc::new(MemoryStore::new());
    let repo = new_repo(&store, "secret")?;

    let id = repo.write_content(CONTENT_PREFIX_DATA, b"short lived", &task)?;
    repo.flush(&task)?;
    let pack = repo.contents().lookup_entry(&id).unwrap().pack.unwrap();

    repo.delete_content(&id)?;
    repo.flush(&task)?;

    let err = repo.get_content(&id, &task).unwrap_err();
    assert!(is_content_not_found(&err));

    // a quick cycle under production safety margins must not reclaim
    // anything this young
    let engine = repo.maintenance();
    engine.run(
        hbk_api_types::MaintenanceCycle::Quick,
        &hbk_repository::MaintenanceOptions {
            dry_run: false,
            safety: SafetyParameters::full(),
        },
        &task,
    )?;

    let mut deleted_seen = false;
    repo.iterate_contents(
        &IterateOptions {
            range: ContentRange::all(),
            include_deleted: true,
        },
        &task,
        &mut |entry| {
            deleted_seen = deleted_seen || (entry.content == id && entry.is_deleted());
            Ok(())
        },
    )?;
    assert!(deleted_seen);

    // pack bytes untouched
    assert!(store.get_metadata(&pack).is_ok());
    Ok(())
}

#[test]
fn manifests_survive_reopen() -> Result<(), Error> {
    let task = SimpleTask::new("test");
    let store = Arc::new(MemoryStore::new());
    let repo = new_repo(&store, "secret")?;

    let mut labels = BTreeMap::new();
    labels.insert("type".to_string(), "snapshot".to_string());
    labels.insert("host".to_string(), "backup1".to_string());
    let id = repo.put_manifest(labels.clone(), b"snapshot body".to_vec(), &task)?;
    repo.flush(&task)?;

    let reopened = open_repository(store, "secret", test_options(), &task)?;
    let found = reopened.find_manifests(&labels);
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].id, id);

    let (got_labels, payload) = reopened.get_manifest(&id, &task)?;
    assert_eq!(got_labels, labels);
    assert_eq!(payload, b"snapshot body");
    Ok(())
}

#[test]
fn epoch_manager_names_index_blobs() -> Result<(), Error> {
    let task = SimpleTask::new("test");
    let store = Arc::new(MemoryStore::new());
    create_repository_with_defaults(store.as_ref(), "secret")?;

    let options = RepositoryOptions {
        use_epoch_manager: true,
        ..test_options()
    };
    let repo = open_repository(store.clone(), "secret", options.clone(), &task)?;

    let id = repo.write_content(CONTENT_PREFIX_DATA, b"epoch scoped", &task)?;
    repo.flush(&task)?;

    assert_eq!(list_blobs(store.as_ref(), "xn", &task)?.len(), 1);
    assert!(list_blobs(store.as_ref(), "n", &task)?.is_empty());

    let reopened = open_repository(store, "secret", options, &task)?;
    assert_eq!(reopened.get_content(&id, &task)?, b"epoch scoped");
    Ok(())
}

#[test]
fn capabilities_narrow_by_type() -> Result<(), Error> {
    fn count_contents(reader: &dyn RepositoryReader, task: &SimpleTask) -> Result<usize, Error> {
        let mut count = 0;
        reader.iterate_contents(&IterateOptions::default(), task, &mut |_| {
            count += 1;
            Ok(())
        })?;
        Ok(count)
    }

    fn store_one(writer: &dyn RepositoryWriter, task: &SimpleTask) -> Result<(), Error> {
        writer.write_content(CONTENT_PREFIX_DATA, b"via trait", task)?;
        writer.flush(task)
    }

    let task = SimpleTask::new("test");
    let store = Arc::new(MemoryStore::new());
    let repo = new_repo(&store, "secret")?;

    store_one(&repo, &task)?;
    assert_eq!(count_contents(&repo, &task)?, 1);
    Ok(())
}

#[test]
fn connect_via_client_config() -> Result<(), Error> {
    let task = SimpleTask::new("test");
    let dir = tempfile::tempdir()?;
    let repo_dir = dir.path().join("repo");
    let cache_dir = dir.path().join("cache");

    let store = hbk_repository::backend::FilesystemStore::open(repo_dir.clone())?;
    create_repository_with_defaults(&store, "secret")?;
    drop(store);

    let config = hbk_config::ClientConfig {
        storage: hbk_config::StorageConnection::Filesystem { path: repo_dir },
        cache: hbk_config::CacheOptions {
            directory: Some(cache_dir.clone()),
            limits: Default::default(),
        },
        client: hbk_config::ClientOptions {
            hostname: "backup1".to_string(),
            username: "root".to_string(),
            readonly: false,
            enable_actions: false,
            description: None,
            format_blob_cache_ttl: 900,
        },
    };

    let repo = hoard_backup::connect(
        &config,
        &hbk_config::PasswordSource::Plain {
            password: "secret".to_string(),
        },
        &task,
    )?;
    let id = repo.write_content(CONTENT_PREFIX_DATA, b"via config", &task)?;
    repo.flush(&task)?;
    assert_eq!(repo.get_content(&id, &task)?, b"via config");

    // the configured cache directory is in use
    assert!(cache_dir.join("contents").exists());
    Ok(())
}

#[test]
fn provider_validation() -> Result<(), Error> {
    let task = SimpleTask::new("test");
    let store = MemoryStore::new();
    validate_provider(&store, &task)?;
    assert!(store.is_empty());
    Ok(())
}

#[test]
fn format_records_the_splitter() -> Result<(), Error> {
    let store = Arc::new(MemoryStore::new());
    let repo = new_repo(&store, "secret")?;

    let mut splitter = repo.splitter()?;
    assert!(splitter.max_segment_size() > 0);
    // a fixed-size probe stream yields at least one boundary
    let data = vec![0u8; splitter.max_segment_size() + 1];
    assert!(splitter.scan(&data) > 0);
    Ok(())
}
