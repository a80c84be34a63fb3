//! IPAM error types.

use thiserror::Error;

/// Errors returned by an [`IpamStore`](crate::IpamStore).
#[derive(Debug, Error)]
pub enum StoreError {
    /// Resource does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// A resource with the same name already exists
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Optimistic concurrency check failed (stale resourceVersion)
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[source] kube::Error),

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<kube::Error> for StoreError {
    fn from(e: kube::Error) -> Self {
        match &e {
            kube::Error::Api(resp) if resp.code == 404 => StoreError::NotFound(resp.message.clone()),
            kube::Error::Api(resp) if resp.code == 409 && resp.reason == "AlreadyExists" => {
                StoreError::AlreadyExists(resp.message.clone())
            }
            kube::Error::Api(resp) if resp.code == 409 => StoreError::Conflict(resp.message.clone()),
            _ => StoreError::Kube(e),
        }
    }
}

/// Errors that can occur while allocating blocks or addresses.
#[derive(Debug, Error)]
pub enum IpamError {
    /// Resource store error, propagated as-is
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The pool has no free block left (or is being deleted)
    #[error("No free block in pool: {0}")]
    ExhaustedPool(String),

    /// No controller answered the block request in time
    #[error("Timed out waiting for a block from pool: {0}")]
    Timeout(String),

    /// The pool definition cannot be used
    #[error("Invalid pool: {0}")]
    InvalidPool(String),

    /// In-memory bookkeeping no longer matches the store
    #[error("IPAM invariant violated: {0}")]
    Invariant(String),

    /// A lock was poisoned by a panicking holder
    #[error("Failed to acquire lock")]
    LockPoisoned,
}

impl IpamError {
    /// Whether the error reports pool exhaustion
    pub fn is_exhausted(&self) -> bool {
        matches!(self, IpamError::ExhaustedPool(_))
    }

    /// Whether the error reports a block request timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, IpamError::Timeout(_))
    }
}
