use serde::{Deserialize, Serialize};

/// Limits of one named on-disk cache.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CacheLimits {
    /// Byte budget; the sweeper evicts down to this size.
    pub max_bytes: u64,
    /// Entries younger than this (seconds) are never evicted.
    pub min_sweep_age: i64,
    /// Seconds between background sweeps.
    pub sweep_interval: i64,
}

impl CacheLimits {
    pub fn new(max_bytes: u64) -> Self {
        Self {
            max_bytes,
            min_sweep_age: 600,
            sweep_interval: 60,
        }
    }
}

/// Limits for all caches of one repository client.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CacheConfig {
    pub contents: CacheLimits,
    pub metadata: CacheLimits,
    pub indexes: CacheLimits,
    /// Seconds a cached blob listing stays valid.
    pub blob_list_ttl: i64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            contents: CacheLimits::new(5 * 1024 * 1024 * 1024),
            metadata: CacheLimits::new(5 * 1024 * 1024 * 1024),
            indexes: CacheLimits::new(1024 * 1024 * 1024),
            blob_list_ttl: 60,
        }
    }
}
