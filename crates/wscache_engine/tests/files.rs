//! Integration tests for the deduplicating file transfer layer.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use parking_lot::Mutex;
use wscache_engine::{
    ByteProgress, CacheSyncConfig, CancellationToken, ObjectError, SyncError, TransferProgress,
};
use wscache_protocol::{ClientErrorKind, RemoteId};
use wscache_testkit::prelude::*;

fn seed_files(server: &MockRepository, names: &[&str]) -> Vec<RemoteId> {
    names
        .iter()
        .map(|name| {
            let id = server.insert(test_file_instance(name, 8));
            server.set_file(&id, format!("{name:>8}").into_bytes());
            id
        })
        .collect()
}

#[tokio::test]
async fn concurrent_requests_share_one_transfer() {
    let mut env = TestEnv::new();
    let id = seed_files(env.server(), &["F"]).remove(0);
    let gate = Arc::new(Semaphore::new(0));
    env.server().gate_files(Arc::clone(&gate));
    let source = env.data_source();
    let cancel = CancellationToken::new();

    let requests =
        futures::future::join_all((0..5).map(|_| source.get_file(&id, None, &cancel)));
    let release = async {
        wait_until(|| source.client().file_stats().active == 1).await;
        assert_eq!(source.files().active_transfers(), 1);
        gate.add_permits(1);
    };
    let (results, ()) = tokio::join!(requests, release);

    let paths: Vec<_> = results.into_iter().map(Result::unwrap).collect();
    assert!(paths.windows(2).all(|w| w[0] == w[1]));
    assert_eq!(std::fs::read(&paths[0]).unwrap(), b"       F");
    assert_eq!(source.client().file_stats().calls[&id], 1);
    assert_eq!(source.files().active_transfers(), 0);
    assert_eq!(env.store.cached_file(&id), Some(paths[0].clone()));
}

#[tokio::test]
async fn canceled_listener_leaves_the_transfer_running() {
    let mut env = TestEnv::new();
    let id = seed_files(env.server(), &["F"]).remove(0);
    let gate = Arc::new(Semaphore::new(0));
    env.server().gate_files(Arc::clone(&gate));
    let source = env.data_source();
    let leaving = CancellationToken::new();
    let staying = CancellationToken::new();

    let first = source.get_file(&id, None, &leaving);
    let second = source.get_file(&id, None, &staying);
    let driver = async {
        wait_until(|| source.client().file_stats().active == 1).await;
        leaving.cancel();
        tokio::task::yield_now().await;
        assert!(source.client().file_stats().canceled.is_empty());
        gate.add_permits(1);
    };
    let (first, second, ()) = tokio::join!(first, second, driver);

    assert!(matches!(first, Err(SyncError::Canceled)));
    assert!(second.is_ok());
    assert_eq!(source.client().file_stats().finished, vec![id]);
}

#[tokio::test]
async fn last_listener_leaving_cancels_the_transfer() {
    let mut env = TestEnv::new();
    let id = seed_files(env.server(), &["F"]).remove(0);
    let gate = Arc::new(Semaphore::new(0));
    env.server().gate_files(Arc::clone(&gate));
    let source = env.data_source();
    let cancel = CancellationToken::new();

    let request = source.get_file(&id, None, &cancel);
    let driver = async {
        wait_until(|| source.client().file_stats().active == 1).await;
        cancel.cancel();
    };
    let (result, ()) = tokio::join!(request, driver);

    assert!(matches!(result, Err(SyncError::Canceled)));
    wait_until(|| source.client().file_stats().canceled == vec![id.clone()]).await;
    assert_eq!(source.files().active_transfers(), 0);
    assert!(env.store.cached_file(&id).is_none());
}

#[tokio::test]
async fn canceled_before_start_sends_nothing() {
    let mut env = TestEnv::new();
    let id = seed_files(env.server(), &["F"]).remove(0);
    let source = env.data_source();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let result = source.get_file(&id, None, &cancel).await;

    assert!(matches!(result, Err(SyncError::Canceled)));
    assert!(source.client().requests().is_empty());
}

#[tokio::test]
async fn unchanged_file_is_not_downloaded_again() {
    let mut env = TestEnv::new();
    let id = seed_files(env.server(), &["F"]).remove(0);
    let source = env.data_source();
    let cancel = CancellationToken::new();

    let first = source.get_file(&id, None, &cancel).await.unwrap();
    let writes = env.store.write_count();
    let second = source.get_file(&id, None, &cancel).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(source.client().request_count(Op::GetFile), 2);
    assert_eq!(source.client().file_stats().calls[&id], 1);
    assert_eq!(env.store.write_count(), writes);
}

#[tokio::test]
async fn batch_with_limit_two_starts_the_third_file_after_a_slot_frees() {
    let mut env = TestEnv::new().with_config(
        CacheSyncConfig::new()
            .with_progress_interval(Duration::ZERO)
            .with_max_concurrent_downloads(2),
    );
    let ids = seed_files(env.server(), &["F1", "F2", "F3"]);
    env.server().delay_files(Duration::from_millis(20));
    let source = env.data_source();
    let log = ProgressLog::new();

    let failed = source
        .cache_files(ids.clone(), false, CancellationToken::new(), Some(log.handler()))
        .await
        .unwrap();

    assert!(failed.is_empty());
    let stats = source.client().file_stats();
    assert_eq!(stats.max_active, 2);
    assert!(stats.started[..2].contains(&ids[0]) && stats.started[..2].contains(&ids[1]));
    assert_eq!(stats.started[2], ids[2]);
    assert!(ids.iter().all(|id| env.store.cached_file(id).is_some()));

    let bytes: Vec<u64> = log.reports().iter().map(|p| p.bytes.current).collect();
    assert!(bytes.windows(2).all(|w| w[0] <= w[1]));
    let last = log.reports().last().cloned().unwrap();
    assert_eq!(last.bytes.current, 24);
    assert_eq!(last.bytes.total, 24);
    assert!(log.is_monotonic());
    assert_eq!(last.fraction, 1.0);
}

#[tokio::test]
async fn overlapping_batches_share_the_download_limit() {
    let mut env = TestEnv::new().with_config(
        CacheSyncConfig::new()
            .with_progress_interval(Duration::ZERO)
            .with_max_concurrent_downloads(2),
    );
    let first = seed_files(env.server(), &["A1", "A2", "A3"]);
    let second = seed_files(env.server(), &["B1", "B2", "B3"]);
    env.server().delay_files(Duration::from_millis(20));
    let source = env.data_source();

    let (first, second) = tokio::join!(
        source.cache_files(first, false, CancellationToken::new(), None),
        source.cache_files(second, false, CancellationToken::new(), None),
    );

    assert!(first.unwrap().is_empty());
    assert!(second.unwrap().is_empty());
    let stats = source.client().file_stats();
    assert!(stats.max_active <= 2, "max active {}", stats.max_active);
    assert_eq!(stats.finished.len(), 6);
}

#[tokio::test]
async fn joining_listener_callback_may_use_the_transfer_layer() {
    let mut env = TestEnv::new();
    let id = seed_files(env.server(), &["F"]).remove(0);
    let gate = Arc::new(Semaphore::new(0));
    env.server().gate_files(Arc::clone(&gate));
    let source = env.data_source();
    let cancel = CancellationToken::new();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let progress: TransferProgress = {
        let files = source.files().clone();
        let seen = Arc::clone(&seen);
        Arc::new(move |bytes: ByteProgress| seen.lock().push((bytes, files.active_transfers())))
    };

    let first = source.get_file(&id, None, &cancel);
    let second = async {
        wait_until(|| source.client().file_stats().active == 1).await;
        let joined = source.get_file(&id, Some(progress), &cancel);
        let release = async {
            wait_until(|| !seen.lock().is_empty()).await;
            gate.add_permits(1);
        };
        let (result, ()) = tokio::join!(joined, release);
        result
    };
    let (first, second) = tokio::join!(first, second);

    assert_eq!(first.unwrap(), second.unwrap());
    let seen = seen.lock();
    // The joiner first hears where the transfer already is.
    assert_eq!(seen[0], (ByteProgress::new(0, 8), 1));
    assert_eq!(seen.last().map(|(bytes, _)| *bytes), Some(ByteProgress::new(8, 8)));
    assert_eq!(source.client().file_stats().calls[&id], 1);
}

#[tokio::test]
async fn default_batch_limit_is_ten() {
    let mut env = TestEnv::new();
    let names: Vec<String> = (0..25).map(|n| format!("F{n}")).collect();
    let names: Vec<&str> = names.iter().map(String::as_str).collect();
    let ids = seed_files(env.server(), &names);
    env.server().delay_files(Duration::from_millis(10));
    let source = env.data_source();

    let failed = source
        .cache_files(ids, false, CancellationToken::new(), None)
        .await
        .unwrap();

    assert!(failed.is_empty());
    let stats = source.client().file_stats();
    assert!(stats.max_active <= 10, "max active {}", stats.max_active);
    assert!(stats.max_active > 1);
    assert_eq!(stats.finished.len(), 25);
}

#[tokio::test]
async fn batch_reports_missing_files_and_skips_cached_ones() {
    let mut env = TestEnv::new();
    let mut ids = seed_files(env.server(), &["A", "B"]);
    let missing = env.server().insert(test_file_instance("Missing", 1));
    env.store.insert_cached(test_file_instance("Missing", 1));
    ids.push(missing.clone());
    let source = env.data_source();

    let failed = source
        .cache_files(ids.clone(), true, CancellationToken::new(), None)
        .await
        .unwrap();

    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].id, missing);
    assert_eq!(failed[0].label, "Missing");
    assert!(matches!(
        &failed[0].error,
        ObjectError::Rejected(err) if err.kind == ClientErrorKind::NotFound
    ));

    let requests = source.client().request_count(Op::GetFile);
    source
        .cache_files(ids[..2].to_vec(), true, CancellationToken::new(), None)
        .await
        .unwrap();
    assert_eq!(source.client().request_count(Op::GetFile), requests);
}

#[tokio::test]
async fn connection_loss_fails_the_batch() {
    let mut env = TestEnv::new();
    let ids = seed_files(env.server(), &["A", "B", "C"]);
    env.server().fail(
        Op::GetFile,
        Target::Id(ids[1].clone()),
        wscache_protocol::ClientError::connection("offline"),
    );
    let source = env.data_source();

    let result = source
        .cache_files(ids, false, CancellationToken::new(), None)
        .await;

    assert!(matches!(result, Err(SyncError::Network(_))));
}
