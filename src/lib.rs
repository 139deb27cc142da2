//! Hoard Backup: a deduplicating, encrypted, content-addressed backup
//! repository.
//!
//! This crate is the client-facing assembly of the repository core in
//! [hbk_repository]: opening and creating repositories, the capability
//! fan-out handed to snapshotters and CLI verbs, password changes,
//! repository-to-repository sync and provider validation.

pub mod repository;
pub use repository::{
    connect, create_repository, create_repository_with_defaults, open_repository,
    validate_provider, Repository, RepositoryOptions, RepositoryReader, RepositoryWriter,
};

pub mod sync;
pub use sync::{sync_to, SyncStats};
