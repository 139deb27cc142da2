use hbk_api_types::{BlobId, ContentId};

/// Errors reported by blob store adapters.
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("blob '{0}' not found")]
    NotFound(BlobId),
    #[error("storage backend does not support setting modification times")]
    SetTimeUnsupported,
    #[error("storage backend does not support retention locks")]
    RetentionUnsupported,
    #[error("insufficient space on storage backend")]
    InsufficientSpace,
    /// Timeouts, throttling and similar conditions worth retrying.
    #[error("transient storage error: {0}")]
    Transient(String),
}

/// Errors reported by the repository core on top of storage errors.
#[derive(thiserror::Error, Debug)]
pub enum RepoError {
    #[error("invalid repository password")]
    InvalidPassword,
    #[error("unsupported repository format version {0}")]
    UnsupportedFormat(u32),
    #[error("content '{0}' not found")]
    ContentNotFound(ContentId),
    /// Stored bytes exist but fail authentication or digest
    /// verification. Never retried or repaired automatically.
    #[error("content '{0}' is corrupt")]
    ContentCorrupt(ContentId),
    /// The index references a pack blob that no longer exists. Index
    /// recovery is the only repair path.
    #[error("content '{0}' lost - pack blob '{1}' is missing")]
    ContentLost(ContentId, BlobId),
}

/// Whether `err` is (or wraps) a blob-not-found condition.
pub fn is_blob_not_found(err: &anyhow::Error) -> bool {
    matches!(err.downcast_ref::<StoreError>(), Some(StoreError::NotFound(_)))
}

/// Whether `err` is (or wraps) a content-not-found condition.
pub fn is_content_not_found(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<RepoError>(),
        Some(RepoError::ContentNotFound(_))
    )
}

/// Whether `err` reports an invalid password.
pub fn is_invalid_password(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<RepoError>(),
        Some(RepoError::InvalidPassword)
    )
}
