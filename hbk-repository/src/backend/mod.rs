//! Blob store backends shipped with the core. Cloud drivers implement
//! the same [BlobStore](crate::blob_store::BlobStore) trait out of
//! tree.

mod filesystem;
pub use filesystem::{FilesystemStore, ShardScheme, SHARDS_FILE};

mod memory;
pub use memory::MemoryStore;
