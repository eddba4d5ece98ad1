//! Integration tests for navigation caching, query-provider caching and
//! cached reads.

use std::sync::Arc;
use tokio::sync::Semaphore;
use wscache_engine::{
    CachedInstance, CachedQueryKey, CancellationToken, DataOrigin, LocalKey, NavigationOptions,
    ObjectError, ProviderQuery, QueryProvider, SyncError, NAVIGATION_QUERY,
};
use wscache_protocol::{ClientError, ClientErrorKind, Query, RemoteId, ServerInfo};
use wscache_testkit::prelude::*;

fn root_key() -> CachedQueryKey {
    CachedQueryKey::new(LocalKey::ROOT, NAVIGATION_QUERY)
}

fn navigation_requests(server: &MockRepository, parent: &RemoteId) -> usize {
    server
        .requests()
        .iter()
        .filter(|r| matches!(r, Request::Query(q) if q.parent.as_ref() == Some(parent)))
        .count()
}

/// root -> P1, P2; P1 -> C1, F1 (file); P2 and C1 are empty.
fn seed_tree(server: &MockRepository) {
    server.set_children(&RemoteId::root(), vec![test_instance("P1"), test_instance("P2")]);
    server.set_children(
        &test_id("P1"),
        vec![test_instance("C1"), test_file_instance("F1", 4)],
    );
    server.set_file(&test_id("F1"), b"data".to_vec());
}

#[tokio::test]
async fn navigation_caches_every_level() {
    let mut env = TestEnv::new();
    seed_tree(env.server());
    let source = env.data_source();

    let failed = source
        .cache_navigation(
            vec![RemoteId::root()],
            NavigationOptions::new().with_file_downloads(true),
            CancellationToken::new(),
            None,
        )
        .await
        .unwrap();

    assert!(failed.is_empty());
    assert_eq!(
        env.store.response_ids(&root_key()),
        Some(vec![test_id("P1"), test_id("P2")])
    );
    let p1 = env.store.instance_by_id(&test_id("P1")).unwrap();
    assert_eq!(
        env.store.response_ids(&CachedQueryKey::new(p1.key, NAVIGATION_QUERY)),
        Some(vec![test_id("C1"), test_id("F1")])
    );
    assert!(env.store.cached_file(&test_id("F1")).is_some());

    let server = source.client();
    for parent in [RemoteId::root(), test_id("P1"), test_id("P2"), test_id("C1")] {
        assert_eq!(navigation_requests(server, &parent), 1, "{parent}");
    }
    // File-backed instances are leaves.
    assert_eq!(navigation_requests(server, &test_id("F1")), 0);
}

#[tokio::test]
async fn unchanged_tree_costs_no_writes() {
    let mut env = TestEnv::new();
    seed_tree(env.server());
    let source = env.data_source();
    let options = NavigationOptions::new().with_file_downloads(true);

    source
        .cache_navigation(
            vec![RemoteId::root()],
            options.clone(),
            CancellationToken::new(),
            None,
        )
        .await
        .unwrap();
    let writes = env.store.write_count();
    let queries = source.client().request_count(Op::Query);

    let failed = source
        .cache_navigation(vec![RemoteId::root()], options, CancellationToken::new(), None)
        .await
        .unwrap();

    assert!(failed.is_empty());
    assert_eq!(env.store.write_count(), writes);
    // Every level is still asked for, since a deeper one may have changed.
    assert_eq!(source.client().request_count(Op::Query), queries * 2);
    assert_eq!(source.client().file_stats().calls[&test_id("F1")], 1);
}

#[tokio::test]
async fn changes_below_an_unchanged_level_are_found() {
    let mut env = TestEnv::new();
    seed_tree(env.server());
    let source = env.data_source();

    source
        .cache_navigation(
            vec![RemoteId::root()],
            NavigationOptions::new(),
            CancellationToken::new(),
            None,
        )
        .await
        .unwrap();
    source
        .client()
        .set_children(&test_id("C1"), vec![test_instance("G1")]);

    source
        .cache_navigation(
            vec![RemoteId::root()],
            NavigationOptions::new(),
            CancellationToken::new(),
            None,
        )
        .await
        .unwrap();

    let c1 = env.store.instance_by_id(&test_id("C1")).unwrap();
    assert_eq!(
        env.store.response_ids(&CachedQueryKey::new(c1.key, NAVIGATION_QUERY)),
        Some(vec![test_id("G1")])
    );
    assert!(env.store.instance_by_id(&test_id("G1")).is_some());
}

#[tokio::test]
async fn cycles_are_walked_once() {
    let mut env = TestEnv::new();
    seed_tree(env.server());
    // C1 lists its grandparent as a child.
    env.server().set_children(&test_id("C1"), vec![test_instance("P1")]);
    let source = env.data_source();

    let failed = source
        .cache_navigation(
            vec![RemoteId::root()],
            NavigationOptions::new(),
            CancellationToken::new(),
            None,
        )
        .await
        .unwrap();

    assert!(failed.is_empty());
    assert_eq!(navigation_requests(source.client(), &test_id("P1")), 1);
}

#[tokio::test]
async fn refused_level_is_reported_and_the_walk_continues() {
    let mut env = TestEnv::new();
    seed_tree(env.server());
    env.server()
        .fail(Op::Query, Target::Id(test_id("P2")), ClientError::forbidden("no access"));
    let source = env.data_source();

    let failed = source
        .cache_navigation(
            vec![RemoteId::root()],
            NavigationOptions::new(),
            CancellationToken::new(),
            None,
        )
        .await
        .unwrap();

    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].id, test_id("P2"));
    assert_eq!(failed[0].label, "P2");
    assert!(matches!(
        &failed[0].error,
        ObjectError::Rejected(err) if err.kind == ClientErrorKind::Forbidden
    ));
    assert_eq!(navigation_requests(source.client(), &test_id("C1")), 1);
}

#[tokio::test]
async fn lost_connection_stops_the_walk() {
    let mut env = TestEnv::new();
    seed_tree(env.server());
    env.server()
        .fail(Op::Query, Target::Id(test_id("P1")), ClientError::connection("offline"));
    let source = env.data_source();

    let result = source
        .cache_navigation(
            vec![RemoteId::root()],
            NavigationOptions::new(),
            CancellationToken::new(),
            None,
        )
        .await;

    assert!(matches!(result, Err(SyncError::Network(_))));
}

#[tokio::test]
async fn navigation_from_an_uncached_root_fetches_it_first() {
    let mut env = TestEnv::new();
    seed_tree(env.server());
    let source = env.data_source();

    let failed = source
        .cache_navigation(
            vec![test_id("P1")],
            NavigationOptions::new(),
            CancellationToken::new(),
            None,
        )
        .await
        .unwrap();

    assert!(failed.is_empty());
    assert_eq!(source.client().request_count(Op::GetObject), 1);
    assert!(env.store.instance_by_id(&test_id("C1")).is_some());
    assert!(env.store.instance_by_id(&test_id("P2")).is_none());
    // Downloads were not requested.
    assert!(env.store.cached_file(&test_id("F1")).is_none());
}

#[tokio::test]
async fn navigation_progress_reaches_one() {
    let mut env = TestEnv::new();
    seed_tree(env.server());
    let source = env.data_source();
    let log = ProgressLog::new();

    source
        .cache_navigation(
            vec![RemoteId::root()],
            NavigationOptions::new().with_max_concurrent_fetches(2),
            CancellationToken::new(),
            Some(log.handler()),
        )
        .await
        .unwrap();

    assert!(log.is_monotonic());
    assert_eq!(log.fractions().last().copied(), Some(1.0));
}

#[tokio::test]
async fn canceled_walk_writes_nothing_more() {
    let mut env = TestEnv::new();
    seed_tree(env.server());
    // Only the root level gets an answer; P1 and P2 stay in flight.
    env.server().gate_queries(Arc::new(Semaphore::new(1)));
    let source = env.data_source();
    let cancel = CancellationToken::new();

    let run = source.cache_navigation(
        vec![RemoteId::root()],
        NavigationOptions::new(),
        cancel.clone(),
        None,
    );
    let driver = async {
        wait_until(|| source.client().request_count(Op::Query) == 3).await;
        let writes = env.store.write_count();
        cancel.cancel();
        writes
    };
    let (result, writes) = tokio::join!(run, driver);

    assert!(matches!(result, Err(SyncError::Canceled)));
    assert_eq!(env.store.write_count(), writes);
    assert_eq!(
        env.store.response_ids(&root_key()),
        Some(vec![test_id("P1"), test_id("P2")])
    );
    let p1 = env.store.instance_by_id(&test_id("P1")).unwrap();
    assert_eq!(
        env.store.response_ids(&CachedQueryKey::new(p1.key, NAVIGATION_QUERY)),
        None
    );
    assert_eq!(navigation_requests(source.client(), &test_id("C1")), 0);
}

/// Caches the navigation children of every instance; downloads every file.
struct ChildrenProvider;

impl QueryProvider for ChildrenProvider {
    fn queries(&self, instance: &CachedInstance) -> Vec<ProviderQuery> {
        if instance.is_file_backed() {
            return Vec::new();
        }
        vec![ProviderQuery::new(
            CachedQueryKey::new(instance.key, "related"),
            Query::navigation(instance.id.clone()),
        )]
    }

    fn update_file(&self, instance: &CachedInstance) -> bool {
        instance.is_file_backed()
    }
}

#[tokio::test]
async fn providers_drive_recursive_caching() {
    let mut env = TestEnv::new();
    let server = env.server();
    server.insert(test_instance("A"));
    server.set_children(&test_id("A"), vec![test_instance("B"), test_file_instance("F", 3)]);
    server.set_children(&test_id("B"), vec![test_instance("C")]);
    server.set_file(&test_id("F"), b"abc".to_vec());
    let source = env.data_source();

    let failed = source
        .sync_cached_data(
            vec![test_id("A")],
            Vec::new(),
            vec![Arc::new(ChildrenProvider)],
            CancellationToken::new(),
            None,
        )
        .await
        .unwrap();

    assert!(failed.is_empty());
    let a = env.store.instance_by_id(&test_id("A")).unwrap();
    assert_eq!(
        env.store.response_ids(&CachedQueryKey::new(a.key, "related")),
        Some(vec![test_id("B"), test_id("F")])
    );
    assert!(env.store.instance_by_id(&test_id("C")).is_some());
    assert!(env.store.cached_file(&test_id("F")).is_some());
    // Seeds go out as one query by ids.
    assert_eq!(source.client().request_count(Op::GetObject), 0);
}

#[tokio::test]
async fn non_recursive_queries_stop_the_walk() {
    let mut env = TestEnv::new();
    let server = env.server();
    server.insert(test_instance("A"));
    server.set_children(&test_id("A"), vec![test_instance("B")]);
    server.set_children(&test_id("B"), vec![test_instance("C")]);
    let source = env.data_source();
    let seed = ProviderQuery::new(
        CachedQueryKey::new(LocalKey::ROOT, "seed"),
        Query::navigation(test_id("A")),
    )
    .with_recursion(false);

    source
        .sync_cached_data(
            Vec::new(),
            vec![seed],
            vec![Arc::new(ChildrenProvider)],
            CancellationToken::new(),
            None,
        )
        .await
        .unwrap();

    assert!(env.store.instance_by_id(&test_id("B")).is_some());
    assert!(env.store.instance_by_id(&test_id("C")).is_none());
}

#[tokio::test]
async fn seeds_are_fetched_one_by_one_without_instance_queries() {
    let mut env = TestEnv::with_server(ServerInfo::full().with_instance_queries(false));
    env.server().insert(test_instance("A"));
    env.server().insert(test_instance("B"));
    let source = env.data_source();

    let failed = source
        .sync_cached_data(
            vec![test_id("A"), test_id("B"), test_id("Gone")],
            Vec::new(),
            Vec::new(),
            CancellationToken::new(),
            None,
        )
        .await
        .unwrap();

    assert_eq!(source.client().request_count(Op::GetObject), 3);
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].id, test_id("Gone"));
    assert!(env.store.instance_by_id(&test_id("B")).is_some());
}

#[tokio::test]
async fn paged_seed_answers_are_followed() {
    let mut env = TestEnv::new();
    for name in ["A", "B", "C"] {
        env.server().insert(test_instance(name));
    }
    env.server().set_page_size(1);
    let source = env.data_source();

    let failed = source
        .sync_cached_data(
            vec![test_id("A"), test_id("B"), test_id("C")],
            Vec::new(),
            Vec::new(),
            CancellationToken::new(),
            None,
        )
        .await
        .unwrap();

    assert!(failed.is_empty());
    assert_eq!(source.client().request_count(Op::Query), 3);
    assert_eq!(source.client().request_count(Op::GetObject), 0);
    for name in ["A", "B", "C"] {
        assert!(env.store.instance_by_id(&test_id(name)).is_some(), "{name}");
    }
}

#[tokio::test]
async fn canceled_cached_data_sync_sends_nothing() {
    let mut env = TestEnv::new();
    env.server().insert(test_instance("A"));
    let source = env.data_source();
    let cancel = CancellationToken::new();
    cancel.cancel();
    let seed = ProviderQuery::new(
        CachedQueryKey::new(LocalKey::ROOT, "seed"),
        Query::navigation(test_id("A")),
    );

    let result = source
        .sync_cached_data(
            vec![test_id("A")],
            vec![seed],
            vec![Arc::new(ChildrenProvider)],
            cancel,
            None,
        )
        .await;

    assert!(matches!(result, Err(SyncError::Canceled)));
    assert!(source.client().requests().is_empty());
    assert_eq!(env.store.write_count(), 0);
}

#[tokio::test]
async fn instance_gone_from_the_server_leaves_the_cache() {
    let mut env = TestEnv::with_server(ServerInfo::basic());
    env.store.insert_cached(test_instance("Old"));
    let source = env.data_source();

    let failed = source
        .sync_cached_data(
            vec![test_id("Old")],
            Vec::new(),
            Vec::new(),
            CancellationToken::new(),
            None,
        )
        .await
        .unwrap();

    assert_eq!(failed.len(), 1);
    assert!(env.store.instance_by_id(&test_id("Old")).is_none());
}

#[tokio::test]
async fn get_objects_honours_the_origin() {
    let mut env = TestEnv::new();
    env.server()
        .set_children(&test_id("P"), vec![test_instance("X"), test_instance("Y")]);
    env.server().insert(test_instance("P"));
    let source = env.data_source();
    let key = CachedQueryKey::new(LocalKey::ROOT, "p-children");
    let query = Query::navigation(test_id("P"));
    let cancel = CancellationToken::new();

    let cached = source
        .get_objects(key.clone(), query.clone(), DataOrigin::CachedData, &cancel)
        .await;
    assert!(matches!(cached, Err(SyncError::ResponseNotCached(_))));

    let first = source
        .get_objects(key.clone(), query.clone(), DataOrigin::CachedOrRemoteData, &cancel)
        .await
        .unwrap();
    assert_eq!(first.origin, DataOrigin::RemoteData);
    let labels: Vec<_> = first.instances.iter().map(|i| i.label.as_str()).collect();
    assert_eq!(labels, ["X", "Y"]);

    let queries = source.client().request_count(Op::Query);
    let second = source
        .get_objects(key.clone(), query.clone(), DataOrigin::CachedOrRemoteData, &cancel)
        .await
        .unwrap();
    assert_eq!(second.origin, DataOrigin::CachedData);
    assert_eq!(source.client().request_count(Op::Query), queries);

    source
        .client()
        .fail(Op::Query, Target::Any, ClientError::connection("offline"));
    let offline = source
        .get_objects(key.clone(), query.clone(), DataOrigin::RemoteOrCachedData, &cancel)
        .await
        .unwrap();
    assert_eq!(offline.origin, DataOrigin::CachedData);
    assert_eq!(offline.instances.len(), 2);

    let remote = source
        .get_objects(key, query, DataOrigin::RemoteData, &cancel)
        .await;
    assert!(matches!(remote, Err(SyncError::Network(_))));
}

#[tokio::test]
async fn partial_answers_refetch_uncached_instances() {
    let mut env = TestEnv::new();
    env.server().set_children(&test_id("P"), vec![test_instance("X")]);
    env.server().insert(test_instance("P"));
    let source = env.data_source();
    let query = Query::navigation(test_id("P")).with_select(vec!["Name".into()]);

    let result = source
        .get_objects(
            CachedQueryKey::new(LocalKey::ROOT, "partial"),
            query,
            DataOrigin::RemoteData,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(result.instances.len(), 1);
    assert_eq!(source.client().request_count(Op::GetObject), 1);
    assert_eq!(result.instances[0].label, "X");
}

#[tokio::test]
async fn get_object_honours_the_origin() {
    let mut env = TestEnv::new();
    env.server().insert(test_instance("A"));
    env.server().insert(test_instance("B"));
    let source = env.data_source();
    let cancel = CancellationToken::new();
    let a = test_id("A");

    let cached = source.get_object(&a, DataOrigin::CachedData, &cancel).await;
    assert!(matches!(cached, Err(SyncError::InstanceNotCached(_))));

    let first = source
        .get_object(&a, DataOrigin::CachedOrRemoteData, &cancel)
        .await
        .unwrap();
    assert_eq!(first.origin, DataOrigin::RemoteData);
    assert_eq!(first.instance.label, "A");
    assert_eq!(source.client().request_count(Op::GetObject), 1);

    let second = source
        .get_object(&a, DataOrigin::CachedOrRemoteData, &cancel)
        .await
        .unwrap();
    assert_eq!(second.origin, DataOrigin::CachedData);
    assert_eq!(source.client().request_count(Op::GetObject), 1);

    let writes = env.store.write_count();
    let remote = source
        .get_object(&a, DataOrigin::RemoteData, &cancel)
        .await
        .unwrap();
    assert_eq!(remote.origin, DataOrigin::RemoteData);
    assert_eq!(remote.instance.key, first.instance.key);
    assert_eq!(source.client().request_count(Op::GetObject), 2);
    // The server answered "not modified".
    assert_eq!(env.store.write_count(), writes);

    source
        .client()
        .fail(Op::GetObject, Target::Id(a.clone()), ClientError::connection("offline"));
    let offline = source
        .get_object(&a, DataOrigin::RemoteOrCachedData, &cancel)
        .await
        .unwrap();
    assert_eq!(offline.origin, DataOrigin::CachedData);
    assert_eq!(offline.instance.label, "A");

    let remote = source.get_object(&a, DataOrigin::RemoteData, &cancel).await;
    assert!(matches!(
        remote,
        Err(SyncError::Network(err)) if err.kind == ClientErrorKind::Connection
    ));

    // Only connection loss falls back to the cache.
    let gone = source
        .get_object(&test_id("Gone"), DataOrigin::RemoteOrCachedData, &cancel)
        .await;
    assert!(matches!(
        gone,
        Err(SyncError::Network(err)) if err.kind == ClientErrorKind::NotFound
    ));

    source
        .client()
        .fail(Op::GetObject, Target::Any, ClientError::connection("offline"));
    let uncached = source
        .get_object(&test_id("B"), DataOrigin::RemoteOrCachedData, &cancel)
        .await;
    assert!(matches!(
        uncached,
        Err(SyncError::Network(err)) if err.kind == ClientErrorKind::Connection
    ));
}
