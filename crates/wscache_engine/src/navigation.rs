//! Navigation-tree caching.
//!
//! Walks the navigation tree below a set of roots and caches every level.
//! Up to `max_concurrent_fetches` children queries are in flight at once.
//! A node's children are queued only after the transaction caching them
//! committed. When the server reports a level as unchanged, the cached
//! children are queued again instead, so the walk still reaches every
//! descendant whose own level may have changed.

use crate::client::RepositoryClient;
use crate::config::NavigationOptions;
use crate::error::SyncResult;
use crate::files::FileTransfer;
use crate::progress::{ByteProgress, ProgressReporter, TransferProgress};
use crate::pull::{sync_instance, sync_response};
use crate::store::{CacheAccess, CacheStore, CachedInstance, CachedQueryKey, LocalKey};
use crate::task::SyncTask;
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, info};
use wscache_protocol::{Query, RemoteId};

/// Name under which navigation children are cached for each parent.
pub const NAVIGATION_QUERY: &str = "navigation";

#[derive(Debug, Clone)]
struct Node {
    key: LocalKey,
    id: RemoteId,
    label: String,
}

impl From<CachedInstance> for Node {
    fn from(instance: CachedInstance) -> Self {
        Self {
            key: instance.key,
            id: instance.id,
            label: instance.label,
        }
    }
}

/// One navigation caching run.
pub struct NavigationSync<'a, S: CacheStore, C: RepositoryClient> {
    cache: &'a CacheAccess<S>,
    client: &'a C,
    files: &'a FileTransfer<S, C>,
    task: &'a SyncTask,
    progress: &'a Arc<ProgressReporter>,
    options: NavigationOptions,
    max_fetches: usize,
}

impl<'a, S: CacheStore, C: RepositoryClient> NavigationSync<'a, S, C> {
    /// Creates a run.
    pub fn new(
        cache: &'a CacheAccess<S>,
        client: &'a C,
        files: &'a FileTransfer<S, C>,
        task: &'a SyncTask,
        progress: &'a Arc<ProgressReporter>,
        options: NavigationOptions,
        default_max_fetches: usize,
    ) -> Self {
        let max_fetches = options
            .max_concurrent_fetches
            .unwrap_or(default_max_fetches)
            .max(1);
        Self {
            cache,
            client,
            files,
            task,
            progress,
            options,
            max_fetches,
        }
    }

    /// Caches the trees below `roots`. [`RemoteId::root`] names the top of
    /// the repository.
    pub async fn run(&self, roots: Vec<RemoteId>) -> SyncResult<()> {
        info!(roots = roots.len(), max_fetches = self.max_fetches, "caching navigation");

        let mut queue = VecDeque::new();
        let mut visited = HashSet::new();
        let mut downloads = Vec::new();
        let mut download_set = HashSet::new();

        for root in roots {
            self.task.check_canceled()?;
            if root.is_root() {
                queue.push_back(Node {
                    key: LocalKey::ROOT,
                    id: root,
                    label: String::new(),
                });
                continue;
            }
            if let Some(instance) = self.cached_root(&root).await? {
                self.enqueue(instance, &mut queue, &mut downloads, &mut download_set);
            }
        }

        let mut seen = queue.len();
        let mut done = 0usize;
        let mut in_flight = FuturesUnordered::new();
        loop {
            self.task.check_canceled()?;
            while in_flight.len() < self.max_fetches {
                let Some(node) = queue.pop_front() else {
                    break;
                };
                if visited.insert(node.id.clone()) {
                    in_flight.push(self.fetch_children(node));
                } else {
                    done += 1;
                }
            }

            let Some(result) = in_flight.next().await else {
                break;
            };
            let (node, children) = result?;
            done += 1;
            for child in children {
                if visited.contains(&child.id) {
                    continue;
                }
                seen += 1;
                self.enqueue(child, &mut queue, &mut downloads, &mut download_set);
            }
            self.progress
                .set_fraction(done as f64 / seen.max(1) as f64, Some(node.label));
        }

        debug!(levels = done, files = downloads.len(), "navigation walked");
        if !downloads.is_empty() {
            let reporter = Arc::clone(self.progress);
            let bytes: TransferProgress =
                Arc::new(move |progress: ByteProgress| reporter.set_bytes(progress));
            self.files
                .download_batch(downloads, false, self.task, Some(bytes))
                .await?;
        }
        Ok(())
    }

    /// Returns the cached instance of a root, fetching it first if needed.
    async fn cached_root(&self, id: &RemoteId) -> SyncResult<Option<CachedInstance>> {
        let cached = {
            let id = id.clone();
            self.cache
                .read(move |store| match store.find_instance(&id)? {
                    Some(key) => Ok(store.read_instance(key)?),
                    None => Ok(None),
                })
                .await?
        };
        match cached {
            Some(instance) => Ok(Some(instance)),
            None => sync_instance(self.cache, self.client, self.task, id).await,
        }
    }

    /// File-backed children are leaves: their file is downloaded, their
    /// children are never fetched.
    fn enqueue(
        &self,
        instance: CachedInstance,
        queue: &mut VecDeque<Node>,
        downloads: &mut Vec<RemoteId>,
        download_set: &mut HashSet<RemoteId>,
    ) {
        if instance.is_file_backed() {
            if self.options.download_files && download_set.insert(instance.id.clone()) {
                downloads.push(instance.id);
            }
            return;
        }
        queue.push_back(Node::from(instance));
    }

    async fn fetch_children(&self, node: Node) -> SyncResult<(Node, Vec<CachedInstance>)> {
        let key = CachedQueryKey::new(node.key, NAVIGATION_QUERY);
        let mut query = Query::navigation(node.id.clone());
        if let Some(properties) = &self.options.property_filter {
            query = query.with_select(properties.clone());
        }
        let children = sync_response(
            self.cache,
            self.client,
            self.task,
            &key,
            &query,
            (&node.id, &node.label),
        )
        .await?
        .unwrap_or_default();
        Ok((node, children))
    }
}
