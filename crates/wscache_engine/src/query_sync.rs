//! Query-provider-driven caching.
//!
//! Starting from seed instances and queries, every cached instance is
//! offered to the registered [`QueryProvider`]s, which name the follow-up
//! queries to cache and whether the instance's file needs refreshing.
//! Instances found by recursive queries are offered in turn.

use crate::client::RepositoryClient;
use crate::error::SyncResult;
use crate::files::FileTransfer;
use crate::progress::{ByteProgress, ProgressReporter, TransferProgress};
use crate::pull::{fetch_all_pages, sync_instance, sync_response};
use crate::store::{CacheAccess, CacheStore, CachedInstance, CachedQueryKey};
use crate::task::SyncTask;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, info};
use wscache_protocol::{Query, RemoteId};

/// A query to cache on behalf of an instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderQuery {
    /// Where the response is cached.
    pub key: CachedQueryKey,
    /// The query to run.
    pub query: Query,
    /// Offer the returned instances to the providers as well.
    pub sync_recursively: bool,
}

impl ProviderQuery {
    /// Creates a recursive query.
    pub fn new(key: CachedQueryKey, query: Query) -> Self {
        Self {
            key,
            query,
            sync_recursively: true,
        }
    }

    /// Sets whether returned instances are offered to the providers.
    pub fn with_recursion(mut self, recursive: bool) -> Self {
        self.sync_recursively = recursive;
        self
    }
}

/// Decides what else to cache for an instance.
pub trait QueryProvider: Send + Sync {
    /// Queries to cache for `instance`.
    fn queries(&self, instance: &CachedInstance) -> Vec<ProviderQuery>;

    /// Returns true if the file of `instance` should be downloaded.
    fn update_file(&self, _instance: &CachedInstance) -> bool {
        false
    }
}

struct QueuedQuery {
    owner: Option<RemoteId>,
    label: String,
    query: ProviderQuery,
}

/// Bookkeeping of one run: who was offered, what is left.
#[derive(Default)]
struct Walk {
    queue: VecDeque<QueuedQuery>,
    offered: HashSet<RemoteId>,
    file_checked: HashSet<RemoteId>,
    files: Vec<RemoteId>,
    outstanding: HashMap<RemoteId, usize>,
    seen: usize,
    settled: usize,
}

/// One query-provider caching run.
pub struct CachedDataSync<'a, S: CacheStore, C: RepositoryClient> {
    cache: &'a CacheAccess<S>,
    client: &'a C,
    files: &'a FileTransfer<S, C>,
    task: &'a SyncTask,
    progress: &'a Arc<ProgressReporter>,
    providers: Vec<Arc<dyn QueryProvider>>,
}

impl<'a, S: CacheStore, C: RepositoryClient> CachedDataSync<'a, S, C> {
    /// Creates a run.
    pub fn new(
        cache: &'a CacheAccess<S>,
        client: &'a C,
        files: &'a FileTransfer<S, C>,
        task: &'a SyncTask,
        progress: &'a Arc<ProgressReporter>,
        providers: Vec<Arc<dyn QueryProvider>>,
    ) -> Self {
        Self {
            cache,
            client,
            files,
            task,
            progress,
            providers,
        }
    }

    /// Caches `instances` and `queries` and everything the providers ask
    /// for in turn.
    pub async fn run(&self, instances: Vec<RemoteId>, queries: Vec<ProviderQuery>) -> SyncResult<()> {
        info!(
            instances = instances.len(),
            queries = queries.len(),
            providers = self.providers.len(),
            "syncing cached data"
        );
        self.task.check_canceled()?;
        let mut walk = Walk::default();
        for query in queries {
            walk.queue.push_back(QueuedQuery {
                owner: None,
                label: query.key.name.clone(),
                query,
            });
        }

        for instance in self.sync_initial(instances).await? {
            self.offer(&mut walk, instance, true);
        }
        self.report(&walk, None);

        while let Some(queued) = walk.queue.pop_front() {
            self.task.check_canceled()?;
            let QueuedQuery { owner, label, query } = queued;
            let owner_id = owner.clone().unwrap_or_default();
            let found = sync_response(
                self.cache,
                self.client,
                self.task,
                &query.key,
                &query.query,
                (&owner_id, &label),
            )
            .await?
            .unwrap_or_default();

            for instance in found {
                self.offer(&mut walk, instance, query.sync_recursively);
            }
            if let Some(owner) = owner {
                walk.query_done(&owner);
            }
            self.report(&walk, Some(label));
        }

        debug!(
            instances = walk.seen,
            files = walk.files.len(),
            "cached data walked"
        );
        if !walk.files.is_empty() {
            let reporter = Arc::clone(self.progress);
            let bytes: TransferProgress =
                Arc::new(move |progress: ByteProgress| reporter.set_bytes(progress));
            let files = std::mem::take(&mut walk.files);
            self.files
                .download_batch(files, false, self.task, Some(bytes))
                .await?;
        }
        Ok(())
    }

    /// Brings the seed instances up to date.
    ///
    /// One query by ids when the server supports it, one request per
    /// instance otherwise and for anything the query left out.
    async fn sync_initial(&self, ids: Vec<RemoteId>) -> SyncResult<Vec<CachedInstance>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let server = self.client.server_info().await?;
        let mut synced = Vec::with_capacity(ids.len());
        let mut remaining = ids;

        if server.supports_instance_queries {
            let query = Query::by_ids(remaining.clone());
            match fetch_all_pages(self.client, &query, None, self.task.token()).await {
                Ok(response) => {
                    self.task.check_canceled()?;
                    let cached = self
                        .cache
                        .write(move |store| {
                            let mut cached = Vec::with_capacity(response.instances.len());
                            for instance in &response.instances {
                                let key = store.update_instance(instance, None)?;
                                if let Some(instance) = store.read_instance(key)? {
                                    cached.push(instance);
                                }
                            }
                            Ok(cached)
                        })
                        .await?;
                    let returned: HashSet<&RemoteId> = cached.iter().map(|i| &i.id).collect();
                    remaining.retain(|id| !returned.contains(id));
                    synced.extend(cached);
                }
                Err(err) if err.is_server_response() => {
                    debug!(error = %err, "instance query failed, fetching one by one");
                }
                Err(err) => return Err(err.into()),
            }
        }

        for id in remaining {
            self.task.check_canceled()?;
            if let Some(instance) = sync_instance(self.cache, self.client, self.task, &id).await? {
                synced.push(instance);
            }
        }
        Ok(synced)
    }

    /// Offers an instance to the providers, at most once per run.
    ///
    /// Instances found by a non-recursive query only get their file checked.
    fn offer(&self, walk: &mut Walk, instance: CachedInstance, recursive: bool) {
        if walk.file_checked.insert(instance.id.clone())
            && self.providers.iter().any(|p| p.update_file(&instance))
        {
            walk.files.push(instance.id.clone());
        }
        if !recursive || !walk.offered.insert(instance.id.clone()) {
            return;
        }

        walk.seen += 1;
        let mut count = 0;
        for provider in &self.providers {
            for query in provider.queries(&instance) {
                walk.queue.push_back(QueuedQuery {
                    owner: Some(instance.id.clone()),
                    label: instance.label.clone(),
                    query,
                });
                count += 1;
            }
        }
        if count == 0 {
            walk.settled += 1;
        } else {
            walk.outstanding.insert(instance.id, count);
        }
    }

    fn report(&self, walk: &Walk, label: Option<String>) {
        let fraction = if walk.seen == 0 {
            0.0
        } else {
            walk.settled as f64 / walk.seen as f64
        };
        self.progress.set_fraction(fraction, label);
    }
}

impl Walk {
    fn query_done(&mut self, owner: &RemoteId) {
        if let Some(count) = self.outstanding.get_mut(owner) {
            *count -= 1;
            if *count == 0 {
                self.outstanding.remove(owner);
                self.settled += 1;
            }
        }
    }
}
