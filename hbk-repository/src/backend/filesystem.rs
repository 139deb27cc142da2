use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use anyhow::{bail, format_err, Context, Error};
use serde::{Deserialize, Serialize};

use hbk_api_types::{BlobId, BlobKind, BlobMeta};
use hbk_tools::task::TaskContext;

use crate::blob_store::{BlobStore, PutOptions};
use crate::error::StoreError;

/// Descriptor file recording the sharding scheme of a directory store.
pub const SHARDS_FILE: &str = ".shards";

/// How blob names are split into subdirectories.
///
/// Each segment takes that many leading characters of the blob name as
/// one directory level, e.g. `[3, 3]` places `pabcdef…` under
/// `pab/cde/`. Well-known blobs (format, maintenance, logs) stay
/// unsharded at the root so they are easy to find by hand.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardScheme {
    pub segments: Vec<usize>,
}

impl Default for ShardScheme {
    fn default() -> Self {
        Self { segments: vec![3, 3] }
    }
}

impl ShardScheme {
    fn is_sharded(id: &BlobId) -> bool {
        matches!(
            id.kind(),
            BlobKind::PackData
                | BlobKind::PackMetadata
                | BlobKind::Index
                | BlobKind::EpochIndex
                | BlobKind::Session
        )
    }

    /// Relative path of a blob under this scheme.
    pub fn path_for(&self, id: &BlobId) -> PathBuf {
        let name = id.as_str();
        let mut path = PathBuf::new();
        if Self::is_sharded(id) {
            let total: usize = self.segments.iter().sum();
            if name.len() > total {
                let mut used = 0;
                for segment in &self.segments {
                    path.push(&name[used..used + segment]);
                    used += segment;
                }
            }
        }
        path.push(name);
        path
    }
}

/// Blob store over a sharded directory tree on a local filesystem.
///
/// Writes go through write-to-temp-then-rename with fsync, so a crash
/// never leaves a partially visible blob.
pub struct FilesystemStore {
    base: PathBuf,
    scheme: ShardScheme,
}

impl FilesystemStore {
    /// Open an existing store, or initialize `base` with the default
    /// sharding scheme.
    pub fn open(base: impl Into<PathBuf>) -> Result<Self, Error> {
        let base: PathBuf = base.into();
        if !base.is_absolute() {
            bail!("expected absolute path - got {:?}", base);
        }
        hbk_tools::fs::create_path(&base)?;

        let shards_path = base.join(SHARDS_FILE);
        let scheme = match std::fs::metadata(&shards_path) {
            Ok(_) => {
                let data = hbk_tools::fs::file_get_contents(&shards_path)?;
                serde_json::from_slice(&data)
                    .with_context(|| format!("unable to parse {:?}", shards_path))?
            }
            Err(_) => {
                let scheme = ShardScheme::default();
                hbk_tools::fs::replace_file(&shards_path, &serde_json::to_vec_pretty(&scheme)?, true)?;
                scheme
            }
        };

        Ok(Self { base, scheme })
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn scheme(&self) -> &ShardScheme {
        &self.scheme
    }

    fn blob_path(&self, id: &BlobId) -> PathBuf {
        self.base.join(self.scheme.path_for(id))
    }

    /// Re-shard the store in place and record the new scheme.
    ///
    /// This is the operator tool behind `blob shards modify`; it moves
    /// every blob file to its new location before rewriting the
    /// descriptor, so a crash midway is repaired by running it again.
    pub fn modify_shards(
        &mut self,
        scheme: ShardScheme,
        task: &dyn TaskContext,
    ) -> Result<(), Error> {
        let old = std::mem::replace(&mut self.scheme, scheme);

        for entry in walkdir::WalkDir::new(&self.base) {
            task.check_abort()?;
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                continue;
            }
            let id = BlobId::from(name);
            let target = self.blob_path(&id);
            if entry.path() == target {
                continue;
            }
            if let Some(parent) = target.parent() {
                hbk_tools::fs::create_path(parent)?;
            }
            std::fs::rename(entry.path(), &target)
                .with_context(|| format!("unable to move blob '{}' while re-sharding", id))?;
        }

        let shards_path = self.base.join(SHARDS_FILE);
        hbk_tools::fs::replace_file(&shards_path, &serde_json::to_vec_pretty(&self.scheme)?, true)
            .map_err(|err| {
                self.scheme = old;
                err
            })?;
        Ok(())
    }

}

impl BlobStore for FilesystemStore {
    fn display_name(&self) -> String {
        format!("filesystem:{}", self.base.display())
    }

    fn list(
        &self,
        prefix: &str,
        task: &dyn TaskContext,
        cb: &mut dyn FnMut(BlobMeta) -> Result<(), Error>,
    ) -> Result<(), Error> {
        for entry in walkdir::WalkDir::new(&self.base).sort_by_file_name() {
            task.check_abort()?;
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => bail!("listing '{}' failed - {}", self.display_name(), err),
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy();
            // temp files and the shards descriptor are not blobs
            if name.starts_with('.') {
                continue;
            }
            if !name.starts_with(prefix) {
                continue;
            }
            let metadata = entry.metadata()?;
            let timestamp = metadata
                .modified()?
                .duration_since(std::time::UNIX_EPOCH)
                .map(|duration| duration.as_secs() as i64)
                .unwrap_or(0);
            cb(BlobMeta {
                id: BlobId::from(name.into_owned()),
                length: metadata.len(),
                timestamp,
            })?;
        }
        Ok(())
    }

    fn get_blob(&self, id: &BlobId, offset: u64, length: Option<u64>) -> Result<Vec<u8>, Error> {
        let path = self.blob_path(id);
        let mut file = match std::fs::File::open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(id.clone()).into());
            }
            Err(err) => return Err(format_err!("unable to open blob '{}' - {}", id, err)),
        };

        if offset > 0 {
            file.seek(SeekFrom::Start(offset))?;
        }
        match length {
            Some(length) => {
                let mut data = vec![0u8; length as usize];
                file.read_exact(&mut data)
                    .with_context(|| format!("short read on blob '{}'", id))?;
                Ok(data)
            }
            None => {
                let mut data = Vec::new();
                file.read_to_end(&mut data)?;
                Ok(data)
            }
        }
    }

    fn get_metadata(&self, id: &BlobId) -> Result<BlobMeta, Error> {
        let path = self.blob_path(id);
        let metadata = match std::fs::metadata(&path) {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(id.clone()).into());
            }
            Err(err) => return Err(format_err!("unable to stat blob '{}' - {}", id, err)),
        };
        let timestamp = metadata
            .modified()?
            .duration_since(std::time::UNIX_EPOCH)
            .map(|duration| duration.as_secs() as i64)
            .unwrap_or(0);
        Ok(BlobMeta {
            id: id.clone(),
            length: metadata.len(),
            timestamp,
        })
    }

    fn put_blob(&self, id: &BlobId, data: &[u8], opts: &PutOptions) -> Result<(), Error> {
        let path = self.blob_path(id);
        if let Some(parent) = path.parent() {
            hbk_tools::fs::create_path(parent)?;
        }
        hbk_tools::fs::replace_file(&path, data, true)
            .map_err(|err| format_err!("storing blob '{}' failed - {}", id, err))?;
        if let Some(mod_time) = opts.set_mod_time {
            hbk_tools::fs::set_file_mtime(&path, mod_time)?;
        }
        Ok(())
    }

    fn delete_blob(&self, id: &BlobId) -> Result<(), Error> {
        let path = self.blob_path(id);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(id.clone()).into())
            }
            Err(err) => Err(format_err!("unable to delete blob '{}' - {}", id, err)),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use hbk_tools::task::SimpleTask;

    #[test]
    fn shard_paths() {
        let scheme = ShardScheme::default();
        assert_eq!(
            scheme.path_for(&BlobId::from("pabcdef012345")),
            PathBuf::from("pab/cde/pabcdef012345")
        );
        // well-known names are unsharded
        assert_eq!(
            scheme.path_for(&BlobId::from("hoard.repository")),
            PathBuf::from("hoard.repository")
        );
        assert_eq!(
            scheme.path_for(&BlobId::from("_log_0001")),
            PathBuf::from("_log_0001")
        );
        // names shorter than the shard width stay flat
        assert_eq!(scheme.path_for(&BlobId::from("pabc")), PathBuf::from("pabc"));
    }

    #[test]
    fn roundtrip_and_list() -> Result<(), Error> {
        let dir = tempfile::tempdir()?;
        let store = FilesystemStore::open(dir.path())?;
        let task = SimpleTask::new("test");

        let id = BlobId::from("pabcdef012345");
        store.put_blob(&id, b"payload", &PutOptions::default())?;
        assert_eq!(store.get_blob(&id, 0, None)?, b"payload");
        assert_eq!(store.get_blob(&id, 3, Some(4))?, b"load");
        assert_eq!(store.get_metadata(&id)?.length, 7);

        let blobs = crate::blob_store::list_blobs(&store, "p", &task)?;
        assert_eq!(blobs.len(), 1);
        assert_eq!(blobs[0].id, id);

        store.delete_blob(&id)?;
        assert!(crate::error::is_blob_not_found(
            &store.get_metadata(&id).unwrap_err()
        ));
        Ok(())
    }

    #[test]
    fn set_mod_time() -> Result<(), Error> {
        let dir = tempfile::tempdir()?;
        let store = FilesystemStore::open(dir.path())?;

        let id = BlobId::from("pabcdef012345");
        store.put_blob(
            &id,
            b"x",
            &PutOptions {
                set_mod_time: Some(1_600_000_000),
                ..Default::default()
            },
        )?;
        assert_eq!(store.get_metadata(&id)?.timestamp, 1_600_000_000);
        Ok(())
    }

    #[test]
    fn reshard_moves_blobs() -> Result<(), Error> {
        let dir = tempfile::tempdir()?;
        let mut store = FilesystemStore::open(dir.path())?;
        let task = SimpleTask::new("test");

        let id = BlobId::from("pabcdef012345");
        store.put_blob(&id, b"payload", &PutOptions::default())?;

        store.modify_shards(
            ShardScheme {
                segments: vec![1, 2],
            },
            &task,
        )?;
        assert_eq!(store.get_blob(&id, 0, None)?, b"payload");
        assert!(dir.path().join("p/ab").join(id.as_str()).exists());

        // scheme persists across re-open
        drop(store);
        let store = FilesystemStore::open(dir.path())?;
        assert_eq!(store.scheme().segments, vec![1, 2]);
        assert_eq!(store.get_blob(&id, 0, None)?, b"payload");
        Ok(())
    }
}
