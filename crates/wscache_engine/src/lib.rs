//! # wscache Engine
//!
//! Offline cache synchronization engine: keeps a local transactional cache
//! consistent with a remote object repository, in both directions.
//!
//! This crate provides:
//! - Cancelable sync runs with abort-on-first-error and recoverable
//!   per-object failures
//! - Change dependency graph for pending local edits
//! - Local-change push with changeset batching
//! - Navigation-tree and query-provider pull caching
//! - Deduplicated, bounded-concurrency file downloads
//! - Throttled progress reporting
//!
//! ## Architecture
//!
//! The store and the repository client are external collaborators behind
//! the [`CacheStore`] and [`RepositoryClient`] traits. Every store access
//! runs on one dedicated thread per cache ([`CacheAccess`]), one transaction
//! at a time; network requests run on the async runtime.
//!
//! ## Key Invariants
//!
//! - A change group is sent only after every group it depends on is synced
//! - Each commit is scoped; a failed run keeps what it committed so far
//! - At most one transfer per remote file is in flight
//! - A parent's children are processed only after the parent was cached

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod changes;
mod client;
mod config;
mod data_source;
mod error;
mod files;
mod navigation;
mod progress;
mod pull;
mod push;
mod query_sync;
mod store;
mod task;

pub use changes::{ChangeGraph, ChangeGroup, GroupId};
pub use client::RepositoryClient;
pub use config::{
    CacheSyncConfig, ChangesetLimits, NavigationOptions, SyncOptions,
    DEFAULT_MAX_CONCURRENT_DOWNLOADS, DEFAULT_MAX_CONCURRENT_FETCHES, DEFAULT_PROGRESS_INTERVAL,
};
pub use data_source::{CachingDataSource, DataOrigin, ObjectResult, ObjectsResult};
pub use error::{
    BatchResult, FailedObject, ObjectError, StoreError, StoreResult, SyncError, SyncResult,
};
pub use files::FileTransfer;
pub use navigation::{NavigationSync, NAVIGATION_QUERY};
pub use progress::{
    ByteAggregator, ByteProgress, ProgressHandler, ProgressReporter, SyncProgress,
    TransferProgress,
};
pub use push::{LocalChangesSync, PushState};
pub use query_sync::{CachedDataSync, ProviderQuery, QueryProvider};
pub use store::{
    CacheAccess, CacheStore, CachedInstance, CachedQueryKey, ChangeStatus, FileChange, LocalKey,
    ObjectChange, PendingChanges, RelationshipChange, Revision, Transaction,
};
pub use task::SyncTask;
pub use tokio_util::sync::CancellationToken;
