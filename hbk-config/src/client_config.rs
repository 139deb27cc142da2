use std::path::{Path, PathBuf};

use anyhow::{format_err, Context, Error};
use serde::{Deserialize, Serialize};

use hbk_api_types::CacheConfig;

/// Environment variable overriding the cache directory.
pub const CACHE_DIRECTORY_ENV: &str = "HOARD_CACHE_DIRECTORY";

/// Storage connection info, persisted as a tagged JSON document so new
/// backends can be added without breaking old configs.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum StorageConnection {
    /// Blobs in a sharded directory tree on a local filesystem.
    Filesystem { path: PathBuf },
    /// Volatile in-memory store, only useful for tests.
    Memory,
}

/// Client options independent of the storage backend.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ClientOptions {
    pub hostname: String,
    pub username: String,
    #[serde(default)]
    pub readonly: bool,
    #[serde(default)]
    pub enable_actions: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Seconds the cached format blob stays valid.
    #[serde(default = "default_format_blob_cache_ttl")]
    pub format_blob_cache_ttl: i64,
}

fn default_format_blob_cache_ttl() -> i64 {
    900
}

impl ClientOptions {
    /// `user@host` identity used for maintenance ownership.
    pub fn identity(&self) -> String {
        format!("{}@{}", self.username, self.hostname)
    }
}

/// Cache options: where the caches live and how big they may grow.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CacheOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub directory: Option<PathBuf>,
    #[serde(default)]
    pub limits: CacheConfig,
}

impl CacheOptions {
    /// Resolve the effective cache directory, honoring the environment
    /// override.
    pub fn resolve_directory(&self) -> Result<PathBuf, Error> {
        if let Ok(dir) = std::env::var(CACHE_DIRECTORY_ENV) {
            if !dir.is_empty() {
                return Ok(PathBuf::from(dir));
            }
        }
        self.directory
            .clone()
            .ok_or_else(|| format_err!("no cache directory configured"))
    }
}

/// The client config file written on `repository connect`.
///
/// The password is never stored here; it is persisted separately via
/// the configured [PasswordSource](crate::PasswordSource).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ClientConfig {
    pub storage: StorageConnection,
    pub cache: CacheOptions,
    pub client: ClientOptions,
}

impl ClientConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let data = hbk_tools::fs::file_get_contents(path)?;
        serde_json::from_slice(&data)
            .with_context(|| format!("unable to parse client config {:?}", path))
    }

    pub fn store(&self, path: impl AsRef<Path>) -> Result<(), Error> {
        let data = serde_json::to_vec_pretty(self)?;
        hbk_tools::fs::replace_file(path, &data, true)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn sample() -> ClientConfig {
        ClientConfig {
            storage: StorageConnection::Filesystem {
                path: PathBuf::from("/tank/repo"),
            },
            cache: CacheOptions {
                directory: Some(PathBuf::from("/var/cache/hoard")),
                limits: CacheConfig::default(),
            },
            client: ClientOptions {
                hostname: "backup1".into(),
                username: "root".into(),
                readonly: false,
                enable_actions: false,
                description: Some("lab repo".into()),
                format_blob_cache_ttl: 900,
            },
        }
    }

    #[test]
    fn config_roundtrip() -> Result<(), Error> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("repository.config");

        let config = sample();
        config.store(&path)?;
        let loaded = ClientConfig::load(&path)?;
        assert_eq!(loaded, config);

        // storage connection is a tagged document
        let text = std::fs::read_to_string(&path)?;
        assert!(text.contains(r#""type": "filesystem"#));
        Ok(())
    }

    #[test]
    fn identity_format() {
        assert_eq!(sample().client.identity(), "root@backup1");
    }
}
