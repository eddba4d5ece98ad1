//! Interface to the local store.
//!
//! The store itself is an external collaborator: an embedded transactional
//! cache with read, write and query primitives. The engine only talks to it
//! through [`CacheStore`], and only from the cache access thread.

mod access;
mod types;

pub use access::CacheAccess;
pub use types::{
    CachedInstance, CachedQueryKey, ChangeStatus, FileChange, LocalKey, ObjectChange,
    PendingChanges, RelationshipChange, Revision,
};

use crate::error::StoreResult;
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use wscache_protocol::{ObjectsResponse, Query, RemoteId, RemoteInstance};

/// A transactional local cache.
///
/// Implementations are used from a single thread and need no internal
/// locking. Every call other than the transaction primitives happens between
/// [`begin`](Self::begin) and [`commit`](Self::commit) or
/// [`rollback`](Self::rollback).
pub trait CacheStore: Send + 'static {
    /// Starts a transaction.
    fn begin(&mut self) -> StoreResult<()>;

    /// Commits the current transaction.
    fn commit(&mut self) -> StoreResult<()>;

    /// Discards the current transaction.
    fn rollback(&mut self);

    /// Finds the row of a remote instance.
    fn find_instance(&self, id: &RemoteId) -> StoreResult<Option<LocalKey>>;

    /// Finds the remote id of a row.
    fn find_remote_id(&self, key: LocalKey) -> StoreResult<Option<RemoteId>>;

    /// Reads a cached instance.
    fn read_instance(&self, key: LocalKey) -> StoreResult<Option<CachedInstance>>;

    /// Reads the validation tag of a cached instance.
    fn read_instance_cache_tag(&self, key: LocalKey) -> StoreResult<Option<String>>;

    /// Inserts or replaces an instance.
    fn update_instance(
        &mut self,
        instance: &RemoteInstance,
        cache_tag: Option<&str>,
    ) -> StoreResult<LocalKey>;

    /// Removes an instance and every response entry pointing at it.
    fn remove_instance(&mut self, key: LocalKey) -> StoreResult<()>;

    /// Reads the validation tag of a cached response.
    fn read_response_cache_tag(&self, key: &CachedQueryKey) -> StoreResult<Option<String>>;

    /// Reads the instances of a cached response, `None` if never cached.
    fn read_response_instances(&self, key: &CachedQueryKey) -> StoreResult<Option<Vec<LocalKey>>>;

    /// Caches a response and its instances.
    ///
    /// When `query` selects only some properties, instances that are not
    /// already cached in full cannot be stored from the partial data. They are
    /// listed in the response but returned as rejected, and the caller has to
    /// fetch them in full.
    fn cache_response(
        &mut self,
        key: &CachedQueryKey,
        response: &ObjectsResponse,
        query: Option<&Query>,
    ) -> StoreResult<Vec<RemoteId>>;

    /// Path of the cached file of an instance.
    fn read_file_path(&self, id: &RemoteId) -> StoreResult<Option<PathBuf>>;

    /// Validation tag of the cached file of an instance.
    fn read_file_cache_tag(&self, id: &RemoteId) -> StoreResult<Option<String>>;

    /// Where a download of the file of `id` should be written.
    fn file_download_path(&self, id: &RemoteId) -> StoreResult<PathBuf>;

    /// Records a downloaded file and returns its cached path.
    fn cache_file(&mut self, id: &RemoteId, path: &Path, cache_tag: Option<&str>)
        -> StoreResult<PathBuf>;

    /// Reads every pending local change.
    fn read_pending_changes(&self) -> StoreResult<PendingChanges>;

    /// Reads what has to be sent for one changed entity.
    fn read_revision(&self, key: LocalKey) -> StoreResult<Revision>;

    /// Marks a change of an entity as synced.
    ///
    /// `assigned` is the id the server knows the entity by. `refreshed`, when
    /// present, replaces the cached data of a created instance. Returns the
    /// row key of the entity from now on, which differs from `key` when the
    /// store had to move the row.
    fn commit_revision(
        &mut self,
        key: LocalKey,
        assigned: &RemoteId,
        refreshed: Option<&RemoteInstance>,
    ) -> StoreResult<LocalKey>;

    /// Marks the file change of an object as synced.
    fn commit_file_revision(&mut self, key: LocalKey) -> StoreResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransactionState {
    Active,
    Committed,
    RolledBack,
}

/// A scoped store transaction.
///
/// Dropping an active transaction rolls it back.
pub struct Transaction<'a, S: CacheStore + ?Sized> {
    store: &'a mut S,
    state: TransactionState,
}

impl<'a, S: CacheStore + ?Sized> Transaction<'a, S> {
    /// Begins a transaction on `store`.
    pub fn begin(store: &'a mut S) -> StoreResult<Self> {
        store.begin()?;
        Ok(Self {
            store,
            state: TransactionState::Active,
        })
    }

    /// Commits the transaction. A failed commit is rolled back.
    pub fn commit(mut self) -> StoreResult<()> {
        self.store.commit()?;
        self.state = TransactionState::Committed;
        Ok(())
    }

    /// Rolls the transaction back.
    pub fn rollback(mut self) {
        self.state = TransactionState::RolledBack;
        self.store.rollback();
    }
}

impl<S: CacheStore + ?Sized> Deref for Transaction<'_, S> {
    type Target = S;

    fn deref(&self) -> &S {
        self.store
    }
}

impl<S: CacheStore + ?Sized> DerefMut for Transaction<'_, S> {
    fn deref_mut(&mut self) -> &mut S {
        self.store
    }
}

impl<S: CacheStore + ?Sized> Drop for Transaction<'_, S> {
    fn drop(&mut self) {
        if self.state == TransactionState::Active {
            self.store.rollback();
        }
    }
}
