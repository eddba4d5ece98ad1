//! The caching data source: one cache, one repository, every sync entry
//! point.

use crate::client::RepositoryClient;
use crate::config::{CacheSyncConfig, NavigationOptions, SyncOptions};
use crate::error::{BatchResult, ObjectError, SyncError, SyncResult};
use crate::files::FileTransfer;
use crate::navigation::NavigationSync;
use crate::progress::{ByteProgress, ProgressHandler, ProgressReporter, TransferProgress};
use crate::pull::{fetch_all_pages, read_cached_instances, refetch_rejected, sync_instance};
use crate::push::LocalChangesSync;
use crate::query_sync::{CachedDataSync, ProviderQuery, QueryProvider};
use crate::store::{CacheAccess, CacheStore, CachedInstance, CachedQueryKey, LocalKey};
use crate::task::SyncTask;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use wscache_protocol::{Query, RemoteId};

/// Where [`CachingDataSource::get_objects`] takes its data from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataOrigin {
    /// Only the cache.
    CachedData,
    /// Only the server; the answer is cached.
    RemoteData,
    /// The cache, or the server if the response was never cached.
    CachedOrRemoteData,
    /// The server, or the cache if the server cannot be reached.
    RemoteOrCachedData,
}

/// Instances returned by [`CachingDataSource::get_objects`].
#[derive(Debug, Clone)]
pub struct ObjectsResult {
    /// The instances, in response order.
    pub instances: Vec<CachedInstance>,
    /// Where they came from: [`DataOrigin::CachedData`] or
    /// [`DataOrigin::RemoteData`].
    pub origin: DataOrigin,
}

/// Instance returned by [`CachingDataSource::get_object`].
#[derive(Debug, Clone)]
pub struct ObjectResult {
    /// The instance as cached.
    pub instance: CachedInstance,
    /// [`DataOrigin::CachedData`] or [`DataOrigin::RemoteData`].
    pub origin: DataOrigin,
}

/// Keeps a local cache in sync with a remote repository.
///
/// Owns the cache access thread; dropping the data source stops it once
/// the runs still holding a handle finish.
pub struct CachingDataSource<S: CacheStore, C: RepositoryClient> {
    cache: CacheAccess<S>,
    client: Arc<C>,
    files: FileTransfer<S, C>,
    config: CacheSyncConfig,
}

impl<S: CacheStore, C: RepositoryClient> CachingDataSource<S, C> {
    /// Creates a data source and starts its cache access thread.
    pub fn new(store: S, client: C, config: CacheSyncConfig) -> SyncResult<Self> {
        let cache = CacheAccess::spawn(store, &config.access_thread_name)?;
        let client = Arc::new(client);
        let files = FileTransfer::new(
            cache.clone(),
            Arc::clone(&client),
            config.max_concurrent_downloads,
        );
        Ok(Self {
            cache,
            client,
            files,
            config,
        })
    }

    /// Handle to the cache access thread.
    pub fn cache(&self) -> &CacheAccess<S> {
        &self.cache
    }

    /// The repository client.
    pub fn client(&self) -> &Arc<C> {
        &self.client
    }

    /// The file transfer layer.
    pub fn files(&self) -> &FileTransfer<S, C> {
        &self.files
    }

    /// The configuration.
    pub fn config(&self) -> &CacheSyncConfig {
        &self.config
    }

    /// Sends every pending local change to the server.
    pub async fn sync_local_changes(
        &self,
        options: SyncOptions,
        cancel: CancellationToken,
        progress: Option<ProgressHandler>,
    ) -> BatchResult {
        self.push(None, options, cancel, progress).await
    }

    /// Sends the pending changes of the given rows only.
    pub async fn sync_local_changes_for(
        &self,
        keys: Vec<LocalKey>,
        options: SyncOptions,
        cancel: CancellationToken,
        progress: Option<ProgressHandler>,
    ) -> BatchResult {
        self.push(Some(keys), options, cancel, progress).await
    }

    async fn push(
        &self,
        only: Option<Vec<LocalKey>>,
        options: SyncOptions,
        cancel: CancellationToken,
        progress: Option<ProgressHandler>,
    ) -> BatchResult {
        let task = SyncTask::new(cancel);
        let reporter = self.reporter(progress);
        let mut sync = LocalChangesSync::new(
            &self.cache,
            &*self.client,
            &task,
            &reporter,
            options,
            self.config.changeset_limits,
        );
        let result = sync.run(only).await;
        self.finish(&task, &reporter, result)
    }

    /// Caches the navigation trees below `roots`.
    pub async fn cache_navigation(
        &self,
        roots: Vec<RemoteId>,
        options: NavigationOptions,
        cancel: CancellationToken,
        progress: Option<ProgressHandler>,
    ) -> BatchResult {
        let task = SyncTask::new(cancel);
        let reporter = self.reporter(progress);
        let sync = NavigationSync::new(
            &self.cache,
            &*self.client,
            &self.files,
            &task,
            &reporter,
            options,
            self.config.max_concurrent_fetches,
        );
        let result = sync.run(roots).await;
        self.finish(&task, &reporter, result)
    }

    /// Caches `instances` and `queries` and whatever `providers` ask for.
    pub async fn sync_cached_data(
        &self,
        instances: Vec<RemoteId>,
        queries: Vec<ProviderQuery>,
        providers: Vec<Arc<dyn QueryProvider>>,
        cancel: CancellationToken,
        progress: Option<ProgressHandler>,
    ) -> BatchResult {
        let task = SyncTask::new(cancel);
        let reporter = self.reporter(progress);
        let sync = CachedDataSync::new(
            &self.cache,
            &*self.client,
            &self.files,
            &task,
            &reporter,
            providers,
        );
        let result = sync.run(instances, queries).await;
        self.finish(&task, &reporter, result)
    }

    /// Downloads the files of `ids` into the cache.
    pub async fn cache_files(
        &self,
        ids: Vec<RemoteId>,
        skip_cached: bool,
        cancel: CancellationToken,
        progress: Option<ProgressHandler>,
    ) -> BatchResult {
        let task = SyncTask::new(cancel);
        let reporter = self.reporter(progress);
        let bytes: TransferProgress = {
            let reporter = Arc::clone(&reporter);
            Arc::new(move |bytes: ByteProgress| {
                reporter.update(|progress| {
                    progress.bytes = progress.bytes.merge(bytes);
                    let fraction = if progress.bytes.total == 0 {
                        0.0
                    } else {
                        progress.bytes.current as f64 / progress.bytes.total as f64
                    };
                    progress.fraction = fraction.clamp(0.0, 1.0).max(progress.fraction);
                });
            })
        };
        let result = self
            .files
            .download_batch(ids, skip_cached, &task, Some(bytes))
            .await;
        self.finish(&task, &reporter, result)
    }

    /// Downloads one file into the cache and returns its path.
    pub async fn get_file(
        &self,
        id: &RemoteId,
        progress: Option<TransferProgress>,
        cancel: &CancellationToken,
    ) -> SyncResult<PathBuf> {
        self.files
            .download_and_cache(id, None, progress, cancel)
            .await
    }

    /// Reads the instances of a query from the cache, the server, or both.
    pub async fn get_objects(
        &self,
        key: CachedQueryKey,
        query: Query,
        origin: DataOrigin,
        cancel: &CancellationToken,
    ) -> SyncResult<ObjectsResult> {
        match origin {
            DataOrigin::CachedData => self.cached_objects(&key).await?.ok_or_else(|| {
                SyncError::ResponseNotCached(key.to_string())
            }),
            DataOrigin::RemoteData => self.remote_objects(&key, &query, cancel).await,
            DataOrigin::CachedOrRemoteData => match self.cached_objects(&key).await? {
                Some(result) => Ok(result),
                None => self.remote_objects(&key, &query, cancel).await,
            },
            DataOrigin::RemoteOrCachedData => {
                match self.remote_objects(&key, &query, cancel).await {
                    Err(SyncError::Network(err)) if !err.is_server_response() && !err.is_canceled() => {
                        debug!(%key, error = %err, "server unreachable, using cache");
                        self.cached_objects(&key)
                            .await?
                            .ok_or(SyncError::Network(err))
                    }
                    other => other,
                }
            }
        }
    }

    /// Reads one instance from the cache, the server, or both.
    ///
    /// A remote read caches the instance; an instance the server no longer
    /// has is removed from the cache.
    pub async fn get_object(
        &self,
        id: &RemoteId,
        origin: DataOrigin,
        cancel: &CancellationToken,
    ) -> SyncResult<ObjectResult> {
        match origin {
            DataOrigin::CachedData => self
                .cached_object(id)
                .await?
                .ok_or_else(|| SyncError::InstanceNotCached(id.clone())),
            DataOrigin::RemoteData => self.remote_object(id, cancel).await,
            DataOrigin::CachedOrRemoteData => match self.cached_object(id).await? {
                Some(result) => Ok(result),
                None => self.remote_object(id, cancel).await,
            },
            DataOrigin::RemoteOrCachedData => match self.remote_object(id, cancel).await {
                Err(SyncError::Network(err)) if !err.is_server_response() && !err.is_canceled() => {
                    debug!(%id, error = %err, "server unreachable, using cache");
                    self.cached_object(id)
                        .await?
                        .ok_or(SyncError::Network(err))
                }
                other => other,
            },
        }
    }

    async fn cached_object(&self, id: &RemoteId) -> SyncResult<Option<ObjectResult>> {
        let id = id.clone();
        let instance = self
            .cache
            .read(move |store| match store.find_instance(&id)? {
                Some(key) => Ok(store.read_instance(key)?),
                None => Ok(None),
            })
            .await?;
        Ok(instance.map(|instance| ObjectResult {
            instance,
            origin: DataOrigin::CachedData,
        }))
    }

    async fn remote_object(
        &self,
        id: &RemoteId,
        cancel: &CancellationToken,
    ) -> SyncResult<ObjectResult> {
        let task = SyncTask::new(cancel.clone());
        let synced = sync_instance(&self.cache, &*self.client, &task, id)
            .await
            .map_err(|err| if err.is_canceled() { SyncError::Canceled } else { err })?;
        task.check_canceled()?;
        if let Some(instance) = synced {
            return Ok(ObjectResult {
                instance,
                origin: DataOrigin::RemoteData,
            });
        }
        // The server answered with an error, which the task recorded.
        let failed = task.finish()?.into_iter().next();
        Err(match failed.map(|failed| failed.error) {
            Some(ObjectError::Rejected(err)) => SyncError::Network(err),
            _ => SyncError::InstanceNotCached(id.clone()),
        })
    }

    async fn cached_objects(&self, key: &CachedQueryKey) -> SyncResult<Option<ObjectsResult>> {
        let key = key.clone();
        let instances = self
            .cache
            .read(move |store| {
                if store.read_response_instances(&key)?.is_none() {
                    return Ok(None);
                }
                read_cached_instances(&*store, &key).map(Some)
            })
            .await?;
        Ok(instances.map(|instances| ObjectsResult {
            instances,
            origin: DataOrigin::CachedData,
        }))
    }

    async fn remote_objects(
        &self,
        key: &CachedQueryKey,
        query: &Query,
        cancel: &CancellationToken,
    ) -> SyncResult<ObjectsResult> {
        let task = SyncTask::new(cancel.clone());
        let cache_tag = {
            let key = key.clone();
            self.cache
                .read(move |store| Ok(store.read_response_cache_tag(&key)?))
                .await?
        };
        let response = fetch_all_pages(&*self.client, query, cache_tag.as_deref(), task.token()).await?;
        task.check_canceled()?;

        let rejected = if response.not_modified {
            Vec::new()
        } else {
            let key = key.clone();
            let query = query.clone();
            self.cache
                .write(move |store| Ok(store.cache_response(&key, &response, Some(&query))?))
                .await?
        };
        refetch_rejected(&self.cache, &*self.client, &task, rejected).await?;

        let key = key.clone();
        let instances = self
            .cache
            .read(move |store| read_cached_instances(&*store, &key))
            .await?;
        Ok(ObjectsResult {
            instances,
            origin: DataOrigin::RemoteData,
        })
    }

    fn reporter(&self, handler: Option<ProgressHandler>) -> Arc<ProgressReporter> {
        let reporter = Arc::new(ProgressReporter::new(handler, self.config.progress_interval));
        reporter.flush();
        reporter
    }

    fn finish(&self, task: &SyncTask, reporter: &ProgressReporter, result: SyncResult<()>) -> BatchResult {
        if let Err(err) = result {
            task.set_error(err);
        } else {
            reporter.set_fraction(1.0, None);
        }
        reporter.flush();
        let result = task.finish();
        match &result {
            Ok(failed) => info!(failed = failed.len(), "sync run finished"),
            Err(err) => info!(error = %err, "sync run stopped"),
        }
        result
    }
}
