//! Helpers shared by the pull engines.

use crate::client::RepositoryClient;
use crate::error::{FailedObject, SyncError, SyncResult};
use crate::store::{CacheAccess, CacheStore, CachedInstance, CachedQueryKey};
use crate::task::SyncTask;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};
use wscache_protocol::{ClientError, ClientErrorKind, ClientResult, ObjectsResponse, Query, RemoteId};

/// Runs `query` and follows skip tokens until every page is in.
///
/// Only the first request carries the cache tag; a "not modified" answer is
/// returned as is.
pub(crate) async fn fetch_all_pages<C: RepositoryClient + ?Sized>(
    client: &C,
    query: &Query,
    cache_tag: Option<&str>,
    cancel: &CancellationToken,
) -> ClientResult<ObjectsResponse> {
    let mut response = client.query(query, cache_tag, None, cancel).await?;
    if response.not_modified {
        return Ok(response);
    }
    while let Some(token) = response.skip_token.take() {
        trace!(skip_token = %token, "fetching next page");
        let page = client.query(query, None, Some(&token), cancel).await?;
        response.instances.extend(page.instances);
        response.skip_token = page.skip_token;
    }
    Ok(response)
}

/// Records a failed request for one object.
///
/// Any answer from the server only concerns that object. Connection loss and
/// cancellation stop the run and are returned.
pub(crate) fn record_failure(
    task: &SyncTask,
    id: &RemoteId,
    label: &str,
    err: ClientError,
) -> SyncResult<()> {
    if err.is_server_response() {
        task.add_failed_object(FailedObject::rejected(id.clone(), label, err));
        Ok(())
    } else {
        Err(err.into())
    }
}

/// Fetches one instance and caches it.
///
/// Sends the cached tag so an unchanged instance costs no write. An instance
/// the server no longer has, or no longer shows, is removed from the cache.
/// Returns `None` when the instance failed.
pub(crate) async fn sync_instance<S: CacheStore, C: RepositoryClient + ?Sized>(
    cache: &CacheAccess<S>,
    client: &C,
    task: &SyncTask,
    id: &RemoteId,
) -> SyncResult<Option<CachedInstance>> {
    let cached = {
        let id = id.clone();
        cache
            .read(move |store| {
                let Some(key) = store.find_instance(&id)? else {
                    return Ok(None);
                };
                Ok(Some((key, store.read_instance_cache_tag(key)?)))
            })
            .await?
    };
    let cache_tag = cached.as_ref().and_then(|(_, tag)| tag.clone());

    let response = match client.get_object(id, cache_tag.as_deref(), task.token()).await {
        Ok(response) => response,
        Err(err) => {
            if matches!(
                err.kind,
                ClientErrorKind::NotFound | ClientErrorKind::Forbidden
            ) {
                if let Some((key, _)) = cached {
                    debug!(%id, "removing instance the server no longer shows");
                    cache
                        .write(move |store| Ok(store.remove_instance(key)?))
                        .await?;
                }
            }
            record_failure(task, id, &id.to_string(), err)?;
            return Ok(None);
        }
    };
    task.check_canceled()?;

    if response.not_modified {
        let Some((key, _)) = cached else {
            return Err(SyncError::InstanceNotCached(id.clone()));
        };
        return cache.read(move |store| Ok(store.read_instance(key)?)).await;
    }

    let Some(instance) = response.instances.into_iter().next() else {
        record_failure(task, id, &id.to_string(), ClientError::not_found("empty response"))?;
        return Ok(None);
    };
    let cache_tag = response.cache_tag;
    cache
        .write(move |store| {
            let key = store.update_instance(&instance, cache_tag.as_deref())?;
            Ok(store.read_instance(key)?)
        })
        .await
}

/// Fetches in full the instances a partial response could not cache.
pub(crate) async fn refetch_rejected<S: CacheStore, C: RepositoryClient + ?Sized>(
    cache: &CacheAccess<S>,
    client: &C,
    task: &SyncTask,
    rejected: Vec<RemoteId>,
) -> SyncResult<()> {
    for id in rejected {
        task.check_canceled()?;
        debug!(%id, "fetching rejected partial instance");
        sync_instance(cache, client, task, &id).await?;
    }
    Ok(())
}

/// Reads the cached instances of a response, in response order.
pub(crate) fn read_cached_instances<S: CacheStore>(
    store: &S,
    key: &CachedQueryKey,
) -> SyncResult<Vec<CachedInstance>> {
    let keys = store.read_response_instances(key)?.unwrap_or_default();
    let mut instances = Vec::with_capacity(keys.len());
    for key in keys {
        if let Some(instance) = store.read_instance(key)? {
            instances.push(instance);
        }
    }
    Ok(instances)
}

/// Fetches a response, caches it and returns its instances.
///
/// Returns `None` when the query failed for a reason that only concerns
/// `owner`; the failure is recorded on the task.
pub(crate) async fn sync_response<S: CacheStore, C: RepositoryClient + ?Sized>(
    cache: &CacheAccess<S>,
    client: &C,
    task: &SyncTask,
    key: &CachedQueryKey,
    query: &Query,
    owner: (&RemoteId, &str),
) -> SyncResult<Option<Vec<CachedInstance>>> {
    let cache_tag = {
        let key = key.clone();
        cache
            .read(move |store| Ok(store.read_response_cache_tag(&key)?))
            .await?
    };

    let response = match fetch_all_pages(client, query, cache_tag.as_deref(), task.token()).await {
        Ok(response) => response,
        Err(err) => {
            record_failure(task, owner.0, owner.1, err)?;
            return Ok(None);
        }
    };
    task.check_canceled()?;

    let key = key.clone();
    if response.not_modified {
        trace!(%key, "response not modified");
        return cache
            .read(move |store| read_cached_instances(&*store, &key))
            .await
            .map(Some);
    }

    let query = query.clone();
    let (rejected, instances) = {
        let key = key.clone();
        cache
            .write(move |store| {
                let rejected = store.cache_response(&key, &response, Some(&query))?;
                let instances = read_cached_instances(&*store, &key)?;
                Ok((rejected, instances))
            })
            .await?
    };
    if rejected.is_empty() {
        return Ok(Some(instances));
    }

    refetch_rejected(cache, client, task, rejected).await?;
    cache
        .read(move |store| read_cached_instances(&*store, &key))
        .await
        .map(Some)
}
