//! The cache access thread.
//!
//! Every cache instance owns exactly one thread, and every read or write
//! against its store runs there, one transaction at a time. Async callers
//! hand closures over a queue and await the result on a oneshot channel.

use super::{CacheStore, Transaction};
use crate::error::{SyncError, SyncResult};
use std::thread;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

type Job<S> = Box<dyn FnOnce(&mut S) + Send>;

/// Handle to the thread that owns a store.
///
/// Handles are cheap to clone. The thread stops once every handle is dropped.
pub struct CacheAccess<S: CacheStore> {
    sender: mpsc::UnboundedSender<Job<S>>,
}

impl<S: CacheStore> CacheAccess<S> {
    /// Moves `store` onto a new thread named `name`.
    pub fn spawn(store: S, name: &str) -> SyncResult<Self> {
        let (sender, mut receiver) = mpsc::unbounded_channel::<Job<S>>();
        let thread_name = name.to_string();
        thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                let mut store = store;
                debug!(thread = %thread_name, "cache access thread started");
                while let Some(job) = receiver.blocking_recv() {
                    job(&mut store);
                }
                debug!(thread = %thread_name, "cache access thread stopped");
            })
            .map_err(|err| SyncError::Internal(format!("failed to start access thread: {err}")))?;
        Ok(Self { sender })
    }

    /// Runs `f` in a transaction and commits it if `f` succeeds.
    pub async fn write<T, F>(&self, f: F) -> SyncResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut S) -> SyncResult<T> + Send + 'static,
    {
        self.run(move |store| {
            let mut txn = Transaction::begin(store)?;
            let value = f(&mut *txn)?;
            txn.commit()?;
            Ok(value)
        })
        .await
    }

    /// Runs `f` in a transaction that is always rolled back.
    pub async fn read<T, F>(&self, f: F) -> SyncResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut S) -> SyncResult<T> + Send + 'static,
    {
        self.run(move |store| {
            let mut txn = Transaction::begin(store)?;
            f(&mut *txn)
        })
        .await
    }

    async fn run<T, F>(&self, f: F) -> SyncResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut S) -> SyncResult<T> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job: Job<S> = Box::new(move |store| {
            // The caller may have gone away; the result is dropped then.
            let _ = tx.send(f(store));
        });
        self.sender
            .send(job)
            .map_err(|_| SyncError::AccessThreadStopped)?;
        trace!("cache job queued");
        rx.await.map_err(|_| SyncError::AccessThreadStopped)?
    }
}

impl<S: CacheStore> Clone for CacheAccess<S> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl<S: CacheStore> std::fmt::Debug for CacheAccess<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheAccess")
            .field("closed", &self.sender.is_closed())
            .finish()
    }
}
