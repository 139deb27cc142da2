//! This crate implements the repository core: the storage and access
//! layer below snapshots and policies.
//!
//! # Data formats
//!
//! User data is split into small immutable contents, stored
//! deduplicated in a content addressable format. A content id is the
//! keyed digest of its bytes plus a one letter namespace prefix; the
//! bytes themselves are compressed, encrypted and appended into pack
//! blobs of bounded size. Each pack ends with an authenticated footer
//! locating every content inside it, so the index can be rebuilt from
//! pack bodies alone.
//!
//! The location of every content is kept in index blobs. An index
//! blob is one sorted generation of `content id → (pack, offset,
//! length)` entries; the global index is the union of all live
//! generations, where the entry with the greatest timestamp wins.
//! Deletion writes a tombstone entry; the pack bytes stay behind it
//! until maintenance reclaims them.
//!
//! Manifests (snapshots, policies, ACLs as far as the core is
//! concerned: opaque labeled JSON payloads) are stored as metadata
//! contents and indexed by their labels in memory.
//!
//! The root of trust is the format blob: a single well-known JSON
//! blob holding the repository id, algorithm names and the
//! password-wrapped keys. Everything else is encrypted under the
//! master key, with the content id (or blob name) bound into the AEAD
//! associated data.
//!
//! # Garbage collection
//!
//! Nothing is deleted inline. Maintenance computes the set of pack
//! blobs reachable from the index and deletes the rest, but only once
//! a blob is older than the safety window: a racing writer uploads
//! packs before publishing its index blob, so a young unreferenced
//! pack may become referenced a moment later. The same window guards
//! index compaction and the dropping of tombstones.
//!
//! # Locking
//!
//! There is no global lock. Readers work on copy-on-write snapshots
//! of the generation list; writers buffer into a session-private pack
//! builder and coalesce duplicate writes on a per-content
//! single-flight; maintenance claims a lease recorded in the
//! maintenance params blob and every competing participant observing
//! a fresh lease declines to run.

#![deny(unsafe_op_in_unsafe_fn)]

pub mod backend;
pub mod blob_store;
pub mod cache;
pub mod compression;
pub mod content;
pub mod crypto;
pub mod epoch;
pub mod error;
pub mod format;
pub mod index;
pub mod index_blob;
pub mod maintenance;
pub mod manifest;
pub mod pack;
pub mod splitter;
pub mod stats;

pub use blob_store::{BlobStore, PutOptions, RetryingStore};
pub use cache::CacheLayer;
pub use content::{ContentManager, VerifyOptions};
pub use epoch::{EpochManager, EpochParams};
pub use error::{RepoError, StoreError};
pub use format::{FormatBlob, RepositoryKeys};
pub use index::{IndexEntry, IndexSet, IterateOptions};
pub use maintenance::{MaintenanceEngine, MaintenanceOptions, MaintenanceSummary};
pub use manifest::{ManifestInfo, ManifestStore};
pub use pack::{IndexNamer, LegacyIndexNamer, PackBuilder, DEFAULT_MAX_PACK_SIZE};
pub use splitter::{Splitter, DEFAULT_SPLITTER};
