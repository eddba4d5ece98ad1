//! Error types for the sync engine.

use thiserror::Error;
use wscache_protocol::{ClientError, RemoteId};

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Result of a whole sync run: the recoverable per-object failures, or the
/// error that stopped the run.
pub type BatchResult = SyncResult<Vec<FailedObject>>;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors raised by a [`CacheStore`](crate::CacheStore) implementation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The requested row does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The stored data is inconsistent.
    #[error("cache corrupted: {0}")]
    Corrupted(String),

    /// A write violated a store constraint.
    #[error("constraint violation: {0}")]
    Constraint(String),

    /// The store has been closed.
    #[error("store closed")]
    Closed,

    /// Any other store failure.
    #[error("store error: {0}")]
    Other(String),
}

/// Errors that stop a sync run.
#[derive(Error, Debug, Clone)]
pub enum SyncError {
    /// A request failed in a way that is not specific to one object.
    #[error("network error: {0}")]
    Network(#[from] ClientError),

    /// The local store failed.
    #[error("cache error: {0}")]
    Store(#[from] StoreError),

    /// The run was canceled by the caller.
    #[error("sync canceled")]
    Canceled,

    /// A single change does not fit in a changeset.
    #[error("changeset of {size} bytes exceeds the limit of {limit} bytes")]
    ChangesetTooLarge {
        /// Serialized size of the change.
        size: usize,
        /// Configured limit.
        limit: usize,
    },

    /// An instance required by the run is not in the cache.
    #[error("instance {0} is not cached")]
    InstanceNotCached(RemoteId),

    /// A cached query response required by the run is missing.
    #[error("response {0} is not cached")]
    ResponseNotCached(String),

    /// The cache access thread is gone.
    #[error("cache access thread stopped")]
    AccessThreadStopped,

    /// Broken internal invariant.
    #[error("internal error: {0}")]
    Internal(String),
}

impl SyncError {
    /// Returns true if this error represents a cancellation.
    pub fn is_canceled(&self) -> bool {
        match self {
            SyncError::Canceled => true,
            SyncError::Network(err) => err.is_canceled(),
            _ => false,
        }
    }
}

/// Why a single object could not be synced.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ObjectError {
    /// The server refused the request for this object.
    #[error("rejected by server: {0}")]
    Rejected(ClientError),

    /// An object this change depends on was not synced.
    #[error("dependency not synced")]
    DependencyNotSynced,
}

/// A recoverable failure for one object. The run continues past it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedObject {
    /// The object that failed.
    pub id: RemoteId,
    /// Display label of the object, empty if unknown.
    pub label: String,
    /// Failure cause.
    pub error: ObjectError,
}

impl FailedObject {
    /// Creates a failed object.
    pub fn new(id: RemoteId, label: impl Into<String>, error: ObjectError) -> Self {
        Self {
            id,
            label: label.into(),
            error,
        }
    }

    /// Creates a failed object for a server refusal.
    pub fn rejected(id: RemoteId, label: impl Into<String>, error: ClientError) -> Self {
        Self::new(id, label, ObjectError::Rejected(error))
    }
}
