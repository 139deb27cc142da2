//! Filesystem helpers with atomic replace semantics.

use std::fs::File;
use std::io::{Read, Write};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{format_err, Context, Error};

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

fn tmp_path(path: &Path) -> PathBuf {
    let counter = TMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(
        ".{}.tmp_{}_{}",
        file_name,
        std::process::id(),
        counter
    ))
}

/// Atomically replace `path` with `data` via write-to-temp-then-rename.
///
/// With `fsync` set, the file contents and the directory entry are
/// flushed to disk before returning.
pub fn replace_file(path: impl AsRef<Path>, data: &[u8], fsync: bool) -> Result<(), Error> {
    let path = path.as_ref();
    let tmp = tmp_path(path);

    let result = (|| {
        let mut file =
            File::create(&tmp).with_context(|| format!("unable to create {:?}", tmp))?;
        file.write_all(data)?;
        if fsync {
            file.sync_all()?;
        }
        drop(file);
        std::fs::rename(&tmp, path)
            .with_context(|| format!("unable to rename {:?} to {:?}", tmp, path))?;
        if fsync {
            if let Some(dir) = path.parent() {
                fsync_dir(dir)?;
            }
        }
        Ok(())
    })();

    if result.is_err() {
        let _ = std::fs::remove_file(&tmp);
    }
    result
}

/// Read a whole file into memory.
pub fn file_get_contents(path: impl AsRef<Path>) -> Result<Vec<u8>, Error> {
    let path = path.as_ref();
    let mut file = File::open(path).with_context(|| format!("unable to open {:?}", path))?;
    let mut data = Vec::new();
    file.read_to_end(&mut data)
        .with_context(|| format!("unable to read {:?}", path))?;
    Ok(data)
}

/// Flush a directory entry to disk.
pub fn fsync_dir(path: impl AsRef<Path>) -> Result<(), Error> {
    let path = path.as_ref();
    let dir = File::open(path).with_context(|| format!("unable to open dir {:?}", path))?;
    nix::unistd::fsync(dir.as_raw_fd())
        .map_err(|err| format_err!("fsync on {:?} failed - {}", path, err))?;
    Ok(())
}

/// Create a directory and all of its parents.
pub fn create_path(path: impl AsRef<Path>) -> Result<(), Error> {
    let path = path.as_ref();
    std::fs::create_dir_all(path).with_context(|| format!("unable to create {:?}", path))?;
    Ok(())
}

/// Set both file times to `mtime` (epoch seconds).
pub fn set_file_mtime(path: impl AsRef<Path>, mtime: i64) -> Result<(), Error> {
    use nix::sys::stat::{utimensat, UtimensatFlags};
    use nix::sys::time::TimeSpec;

    let path = path.as_ref();
    let times = TimeSpec::new(mtime, 0);
    utimensat(None, path, &times, &times, UtimensatFlags::FollowSymlink)
        .map_err(|err| format_err!("unable to set mtime on {:?} - {}", path, err))?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn replace_file_atomic() -> Result<(), Error> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("target");

        replace_file(&path, b"first", false)?;
        assert_eq!(file_get_contents(&path)?, b"first");

        replace_file(&path, b"second", true)?;
        assert_eq!(file_get_contents(&path)?, b"second");

        // no temp files left behind
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())?
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name() != "target")
            .collect();
        assert!(leftovers.is_empty());

        Ok(())
    }
}
