use serde::{Deserialize, Serialize};

/// Result counters of one unreferenced-blob GC pass.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct GcStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    /// Number of blobs examined.
    pub examined_blobs: usize,
    /// Number of blobs referenced by at least one index entry.
    pub referenced_blobs: usize,
    /// Number of deleted blobs.
    pub deleted_blobs: usize,
    /// Sum of deleted bytes.
    pub deleted_bytes: u64,
    /// Unreferenced blobs kept because they are younger than the safety
    /// window.
    pub pending_blobs: usize,
    pub pending_bytes: u64,
}

/// Aggregate content statistics computed from the index.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ContentStats {
    pub count: usize,
    pub deleted_count: usize,
    /// Bytes as stored inside packs (after compression and encryption).
    pub packed_bytes: u64,
    /// Bytes before compression.
    pub original_bytes: u64,
}

impl ContentStats {
    pub fn compression_ratio(&self) -> f64 {
        if self.packed_bytes == 0 {
            return 1.0;
        }
        self.original_bytes as f64 / self.packed_bytes as f64
    }
}

/// Per-kind blob counters.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct BlobKindStats {
    pub kind: String,
    pub count: usize,
    pub bytes: u64,
}

/// Result counters of a content verification pass.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct VerifyStats {
    pub checked: usize,
    /// Entries whose pack blob is missing or too short.
    pub missing: usize,
    /// Entries that failed decryption or digest verification.
    pub corrupt: usize,
    /// Entries that were fully re-read and decrypted.
    pub reread: usize,
}

impl VerifyStats {
    pub fn is_ok(&self) -> bool {
        self.missing == 0 && self.corrupt == 0
    }
}

/// Result counters of a short-pack rewrite pass.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RewriteStats {
    pub packs_examined: usize,
    pub packs_rewritten: usize,
    pub contents_rewritten: usize,
    pub bytes_rewritten: u64,
}
