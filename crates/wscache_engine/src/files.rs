//! File transfer layer.
//!
//! Downloads are deduplicated per remote file: the first request starts a
//! transfer and every concurrent request for the same file joins it as
//! another listener. A listener that cancels only detaches itself; the
//! transfer stops once no listener is left. The outcome, success or failure,
//! is sent to every listener still attached.
//!
//! Transfers take a slot from one semaphore per cache before they reach the
//! network, so concurrent batches and single requests share the ceiling.

use crate::client::RepositoryClient;
use crate::error::{FailedObject, SyncError, SyncResult};
use crate::progress::{ByteAggregator, ByteProgress, TransferProgress};
use crate::store::{CacheAccess, CacheStore};
use crate::task::SyncTask;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{oneshot, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use wscache_protocol::RemoteId;

type DownloadResult = SyncResult<PathBuf>;

struct Listener {
    sender: oneshot::Sender<DownloadResult>,
    progress: Option<TransferProgress>,
}

/// A transfer in progress and everyone waiting for it.
struct InFlightDownload {
    transfer_id: u64,
    cancel: CancellationToken,
    progress: ByteProgress,
    listeners: HashMap<u64, Listener>,
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    downloads: HashMap<RemoteId, InFlightDownload>,
}

impl Registry {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

struct Inner<S: CacheStore, C: RepositoryClient> {
    cache: CacheAccess<S>,
    client: Arc<C>,
    registry: Mutex<Registry>,
    slots: Semaphore,
    max_concurrent: usize,
}

/// Deduplicating file downloader shared by every run of a cache.
pub struct FileTransfer<S: CacheStore, C: RepositoryClient> {
    inner: Arc<Inner<S, C>>,
}

impl<S: CacheStore, C: RepositoryClient> Clone for FileTransfer<S, C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: CacheStore, C: RepositoryClient> FileTransfer<S, C> {
    /// Creates a transfer layer running at most `max_concurrent` transfers
    /// at once, however many callers and batches ask for files.
    pub fn new(cache: CacheAccess<S>, client: Arc<C>, max_concurrent: usize) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            inner: Arc::new(Inner {
                cache,
                client,
                registry: Mutex::new(Registry::default()),
                slots: Semaphore::new(max_concurrent),
                max_concurrent,
            }),
        }
    }

    /// Number of files currently being transferred.
    pub fn active_transfers(&self) -> usize {
        self.inner.registry.lock().downloads.len()
    }

    /// Downloads the file of `id` into the cache and returns its path.
    ///
    /// Joins the transfer already running for `id` if there is one.
    /// `destination` is only used when a new transfer starts; by default the
    /// store picks the path. Canceling `cancel` detaches this caller only.
    pub async fn download_and_cache(
        &self,
        id: &RemoteId,
        destination: Option<PathBuf>,
        progress: Option<TransferProgress>,
        cancel: &CancellationToken,
    ) -> SyncResult<PathBuf> {
        if cancel.is_cancelled() {
            return Err(SyncError::Canceled);
        }

        let (sender, receiver) = oneshot::channel();
        let (listener_id, replay) = {
            let mut registry = self.inner.registry.lock();
            let listener_id = registry.next_id();
            let mut replay = None;
            match registry.downloads.get_mut(id) {
                Some(download) => {
                    debug!(%id, listeners = download.listeners.len() + 1, "joining transfer");
                    replay = progress.clone().map(|progress| (progress, download.progress));
                    download
                        .listeners
                        .insert(listener_id, Listener { sender, progress });
                }
                None => {
                    let transfer_id = registry.next_id();
                    let token = CancellationToken::new();
                    let mut listeners = HashMap::new();
                    listeners.insert(listener_id, Listener { sender, progress });
                    registry.downloads.insert(
                        id.clone(),
                        InFlightDownload {
                            transfer_id,
                            cancel: token.clone(),
                            progress: ByteProgress::default(),
                            listeners,
                        },
                    );
                    debug!(%id, "starting transfer");
                    tokio::spawn(Self::transfer(
                        Arc::clone(&self.inner),
                        id.clone(),
                        transfer_id,
                        destination,
                        token,
                    ));
                }
            }
            (listener_id, replay)
        };
        // Callbacks may call back into the transfer layer, so they never run
        // under the registry lock.
        if let Some((progress, bytes)) = replay {
            progress(bytes);
        }

        tokio::select! {
            biased;
            result = receiver => result.unwrap_or(Err(SyncError::Canceled)),
            () = cancel.cancelled() => {
                self.detach(id, listener_id);
                Err(SyncError::Canceled)
            }
        }
    }

    /// Downloads many files, at most `max_concurrent` at a time across
    /// every batch of the cache.
    ///
    /// Files the server answers for with an error are recorded on the task;
    /// any other failure aborts the task. `progress` receives the byte
    /// counters summed over all files.
    pub async fn download_batch(
        &self,
        ids: Vec<RemoteId>,
        skip_cached: bool,
        task: &SyncTask,
        progress: Option<TransferProgress>,
    ) -> SyncResult<()> {
        let mut unique = HashSet::new();
        let mut ids: Vec<RemoteId> = ids.into_iter().filter(|id| unique.insert(id.clone())).collect();
        if skip_cached {
            let candidates = ids;
            ids = self
                .inner
                .cache
                .read(move |store| {
                    let mut missing = Vec::new();
                    for id in candidates {
                        if store.read_file_path(&id)?.is_none() {
                            missing.push(id);
                        }
                    }
                    Ok(missing)
                })
                .await?;
        }
        info!(files = ids.len(), max_concurrent = self.inner.max_concurrent, "downloading files");

        let aggregator = Arc::new(ByteAggregator::new());
        stream::iter(ids)
            .for_each_concurrent(self.inner.max_concurrent, |id| {
                let aggregator = Arc::clone(&aggregator);
                let progress = progress.clone();
                async move {
                    if task.is_canceled() {
                        return;
                    }
                    let file_progress: TransferProgress = {
                        let aggregator = Arc::clone(&aggregator);
                        let progress = progress.clone();
                        let key = id.clone();
                        Arc::new(move |bytes: ByteProgress| {
                            let total = aggregator.update(key.clone(), bytes);
                            if let Some(progress) = &progress {
                                progress(total);
                            }
                        })
                    };

                    match self
                        .download_and_cache(&id, None, Some(file_progress), task.token())
                        .await
                    {
                        Ok(path) => {
                            trace!(%id, path = %path.display(), "file cached");
                            let total = aggregator.complete(id);
                            if let Some(progress) = &progress {
                                progress(total);
                            }
                        }
                        Err(SyncError::Network(err)) if err.is_server_response() => {
                            let label = self.label_of(&id).await;
                            task.add_failed_object(FailedObject::rejected(id, label, err));
                        }
                        Err(err) if err.is_canceled() => {}
                        Err(err) => task.set_error(err),
                    }
                }
            })
            .await;

        task.check_canceled()
    }

    async fn label_of(&self, id: &RemoteId) -> String {
        let lookup = id.clone();
        let label = self
            .inner
            .cache
            .read(move |store| match store.find_instance(&lookup)? {
                Some(key) => Ok(store.read_instance(key)?.map(|i| i.label)),
                None => Ok(None),
            })
            .await;
        match label {
            Ok(Some(label)) => label,
            _ => id.to_string(),
        }
    }

    /// Removes one listener. The transfer is canceled with its last listener.
    fn detach(&self, id: &RemoteId, listener_id: u64) {
        let mut registry = self.inner.registry.lock();
        let Some(download) = registry.downloads.get_mut(id) else {
            return;
        };
        if download.listeners.remove(&listener_id).is_none() {
            return;
        }
        if download.listeners.is_empty() {
            debug!(%id, "last listener left, canceling transfer");
            download.cancel.cancel();
            registry.downloads.remove(id);
        } else {
            trace!(%id, listeners = download.listeners.len(), "listener left");
        }
    }

    async fn transfer(
        inner: Arc<Inner<S, C>>,
        id: RemoteId,
        transfer_id: u64,
        destination: Option<PathBuf>,
        cancel: CancellationToken,
    ) {
        let result = Self::fetch(&inner, &id, transfer_id, destination, &cancel).await;
        if let Err(err) = &result {
            if !err.is_canceled() {
                warn!(%id, error = %err, "transfer failed");
            }
        }

        let listeners = {
            let mut registry = inner.registry.lock();
            match registry.downloads.get(&id) {
                Some(download) if download.transfer_id == transfer_id => registry
                    .downloads
                    .remove(&id)
                    .map(|download| download.listeners)
                    .unwrap_or_default(),
                _ => HashMap::new(),
            }
        };
        debug!(%id, listeners = listeners.len(), "transfer finished");
        for listener in listeners.into_values() {
            // A listener whose receiver is gone has stopped waiting.
            let _ = listener.sender.send(result.clone());
        }
    }

    async fn fetch(
        inner: &Arc<Inner<S, C>>,
        id: &RemoteId,
        transfer_id: u64,
        destination: Option<PathBuf>,
        cancel: &CancellationToken,
    ) -> DownloadResult {
        let (cached_path, cache_tag, default_destination) = {
            let id = id.clone();
            inner
                .cache
                .read(move |store| {
                    Ok((
                        store.read_file_path(&id)?,
                        store.read_file_cache_tag(&id)?,
                        store.file_download_path(&id)?,
                    ))
                })
                .await?
        };
        let destination = destination.unwrap_or(default_destination);
        let cache_tag = cached_path.as_ref().and(cache_tag);

        let progress: TransferProgress = {
            let weak = Arc::downgrade(inner);
            let id = id.clone();
            Arc::new(move |bytes: ByteProgress| {
                if let Some(inner) = weak.upgrade() {
                    Self::broadcast_progress(&inner, &id, transfer_id, bytes);
                }
            })
        };

        let _slot = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(SyncError::Canceled),
            slot = inner.slots.acquire() => slot
                .map_err(|_| SyncError::Internal("download slots closed".into()))?,
        };
        trace!(%id, free = inner.slots.available_permits(), "transfer slot taken");

        let response = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(SyncError::Canceled),
            response = inner.client.get_file(
                id,
                &destination,
                cache_tag.as_deref(),
                Some(progress),
                cancel,
            ) => response?,
        };
        if cancel.is_cancelled() {
            return Err(SyncError::Canceled);
        }

        if response.not_modified {
            return cached_path.ok_or_else(|| SyncError::InstanceNotCached(id.clone()));
        }
        let id = id.clone();
        inner
            .cache
            .write(move |store| {
                Ok(store.cache_file(&id, &response.path, response.cache_tag.as_deref())?)
            })
            .await
    }

    fn broadcast_progress(inner: &Inner<S, C>, id: &RemoteId, transfer_id: u64, bytes: ByteProgress) {
        let callbacks: Vec<TransferProgress> = {
            let mut registry = inner.registry.lock();
            let Some(download) = registry
                .downloads
                .get_mut(id)
                .filter(|d| d.transfer_id == transfer_id)
            else {
                return;
            };
            download.progress = bytes;
            download
                .listeners
                .values()
                .filter_map(|l| l.progress.clone())
                .collect()
        };
        for callback in callbacks {
            callback(bytes);
        }
    }
}
