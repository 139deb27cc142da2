use std::fmt;
use std::str::FromStr;

use anyhow::{bail, format_err, Error};
use serde::{Deserialize, Serialize};

/// Well-known name of the format blob (root of trust).
pub const FORMAT_BLOB_NAME: &str = "hoard.repository";

/// Well-known name of the maintenance params blob.
pub const MAINTENANCE_BLOB_NAME: &str = "hoard.maintenance";

/// Well-known name of the recovery reserve blob, freed to make room
/// for cleanup when the backend runs out of space.
pub const RESERVE_BLOB_NAME: &str = "hoard.reserve";

/// Name prefix for pack blobs holding data contents.
pub const PACK_DATA_BLOB_PREFIX: &str = "p";

/// Name prefix for pack blobs holding metadata contents.
pub const PACK_METADATA_BLOB_PREFIX: &str = "q";

/// Name prefix for legacy index blobs.
pub const INDEX_BLOB_PREFIX: &str = "n";

/// Name prefix for index blobs written under the epoch manager.
pub const EPOCH_INDEX_BLOB_PREFIX: &str = "xn";

/// Name prefix for session marker blobs.
pub const SESSION_BLOB_PREFIX: &str = "s";

/// Name prefix for uploaded task log segments.
pub const LOG_BLOB_PREFIX: &str = "_log_";

/// Content id prefix for data contents.
pub const CONTENT_PREFIX_DATA: u8 = b'p';

/// Content id prefix for generic metadata contents.
pub const CONTENT_PREFIX_METADATA: u8 = b'q';

/// Content id prefix for manifest contents.
pub const CONTENT_PREFIX_MANIFEST: u8 = b'm';

/// Content identifier: a one-letter namespace prefix plus the 32 byte
/// digest of the content.
///
/// The prefix is part of the key, so the same bytes written as data and
/// as metadata produce two distinct contents.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContentId {
    prefix: u8,
    digest: [u8; 32],
}

impl ContentId {
    pub fn new(prefix: u8, digest: [u8; 32]) -> Result<Self, Error> {
        if !prefix.is_ascii_lowercase() {
            bail!("invalid content id prefix {:?}", prefix as char);
        }
        Ok(Self { prefix, digest })
    }

    /// Shortcut for data contents (`p` prefix).
    pub fn data(digest: [u8; 32]) -> Self {
        Self {
            prefix: CONTENT_PREFIX_DATA,
            digest,
        }
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    pub fn digest(&self) -> &[u8; 32] {
        &self.digest
    }

    /// Metadata contents go into `q` packs, data contents into `p` packs.
    pub fn is_metadata(&self) -> bool {
        self.prefix != CONTENT_PREFIX_DATA
    }

    /// Smallest possible id with the given prefix.
    pub fn min_for_prefix(prefix: u8) -> Self {
        Self {
            prefix,
            digest: [0u8; 32],
        }
    }

    /// Largest possible id with the given prefix.
    pub fn max_for_prefix(prefix: u8) -> Self {
        Self {
            prefix,
            digest: [0xffu8; 32],
        }
    }
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.prefix as char, hex::encode(self.digest))
    }
}

impl fmt::Debug for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl FromStr for ContentId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        let bytes = s.as_bytes();
        if bytes.len() != 65 || !s.is_ascii() {
            bail!("invalid content id '{}'", s);
        }
        let mut digest = [0u8; 32];
        hex::decode_to_slice(&s[1..], &mut digest)
            .map_err(|err| format_err!("invalid content id '{}' - {}", s, err))?;
        ContentId::new(bytes[0], digest)
    }
}

impl Serialize for ContentId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ContentId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Inclusive range of content ids, used to scope iteration.
#[derive(Clone, Copy, Debug)]
pub struct ContentRange {
    pub lo: ContentId,
    pub hi: ContentId,
}

impl ContentRange {
    /// All contents of every namespace.
    pub fn all() -> Self {
        Self {
            lo: ContentId::min_for_prefix(b'a'),
            hi: ContentId::max_for_prefix(b'z'),
        }
    }

    /// All contents with the given prefix.
    pub fn prefix(prefix: u8) -> Self {
        Self {
            lo: ContentId::min_for_prefix(prefix),
            hi: ContentId::max_for_prefix(prefix),
        }
    }

    pub fn contains(&self, id: &ContentId) -> bool {
        *id >= self.lo && *id <= self.hi
    }
}

/// Kind of a blob, derived from its name.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BlobKind {
    PackData,
    PackMetadata,
    Index,
    EpochIndex,
    Session,
    Format,
    Maintenance,
    Reserve,
    Log,
    Other,
}

impl BlobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlobKind::PackData => "pack-data",
            BlobKind::PackMetadata => "pack-metadata",
            BlobKind::Index => "index",
            BlobKind::EpochIndex => "epoch-index",
            BlobKind::Session => "session",
            BlobKind::Format => "format",
            BlobKind::Maintenance => "maintenance",
            BlobKind::Reserve => "reserve",
            BlobKind::Log => "log",
            BlobKind::Other => "other",
        }
    }
}

/// Name of a stored blob.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlobId(String);

impl BlobId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn kind(&self) -> BlobKind {
        let name = self.0.as_str();
        if name == FORMAT_BLOB_NAME {
            BlobKind::Format
        } else if name == MAINTENANCE_BLOB_NAME {
            BlobKind::Maintenance
        } else if name == RESERVE_BLOB_NAME {
            BlobKind::Reserve
        } else if name.starts_with(LOG_BLOB_PREFIX) {
            BlobKind::Log
        } else if name.starts_with(EPOCH_INDEX_BLOB_PREFIX) {
            BlobKind::EpochIndex
        } else if name.starts_with(PACK_DATA_BLOB_PREFIX) {
            BlobKind::PackData
        } else if name.starts_with(PACK_METADATA_BLOB_PREFIX) {
            BlobKind::PackMetadata
        } else if name.starts_with(INDEX_BLOB_PREFIX) {
            BlobKind::Index
        } else if name.starts_with(SESSION_BLOB_PREFIX) {
            BlobKind::Session
        } else {
            BlobKind::Other
        }
    }
}

impl fmt::Display for BlobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for BlobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

impl From<&str> for BlobId {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

impl From<String> for BlobId {
    fn from(name: String) -> Self {
        Self(name)
    }
}

/// Blob name, length and storage timestamp as reported by the adapter.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobMeta {
    pub id: BlobId,
    pub length: u64,
    /// Epoch seconds, assigned by the storage backend.
    pub timestamp: i64,
}

/// Identifier of a manifest record.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ManifestId(String);

impl ManifestId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ManifestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for ManifestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.0)
    }
}
