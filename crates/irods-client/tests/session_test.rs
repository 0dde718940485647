//! Tests for irods-client session module

use irods_client::prelude::*;
use irods_client::testing::{test_account, MockConnectionFactory};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

fn session_config(max_cap: usize) -> SessionConfig {
    SessionConfig::new(ConnectionPoolConfig::new().with_max_cap(max_cap))
}

async fn new_session(factory: &MockConnectionFactory, config: SessionConfig) -> IrodsSession {
    IrodsSession::new(test_account(), config, Arc::new(factory.clone()))
        .await
        .expect("session should be created")
}

// ==================== Sharing under pressure ====================

#[tokio::test]
async fn test_sixth_acquisition_shares_instead_of_failing() {
    let factory = MockConnectionFactory::new();
    let session = new_session(&factory, session_config(5)).await;

    let mut conns = Vec::new();
    for _ in 0..5 {
        conns.push(session.acquire_connection().await.unwrap());
    }
    let distinct: HashSet<ConnectionId> = conns.iter().map(|c| c.id()).collect();
    assert_eq!(distinct.len(), 5);
    assert_eq!(session.connection_total(), 5);
    for conn in &conns {
        assert_eq!(session.share_count(conn), 1);
    }

    let shared = session.acquire_connection().await.unwrap();
    assert!(distinct.contains(&shared.id()));
    assert_eq!(session.share_count(&shared), 2);
    assert_eq!(session.connection_total(), 5);
    assert_eq!(factory.created_count(), 5);
    assert!(session.metrics().snapshot().connection_pool_failures >= 1);

    // Ties go to the oldest connection
    assert_eq!(shared, conns[0]);

    session.release().await;
}

#[tokio::test]
async fn test_share_accounting_round_trip() {
    let factory = MockConnectionFactory::new();
    let session = new_session(&factory, session_config(2)).await;

    let a = session.acquire_connection().await.unwrap();
    let b = session.acquire_connection().await.unwrap();
    let c = session.acquire_connection().await.unwrap();
    let d = session.acquire_connection().await.unwrap();

    assert_eq!(session.share_count(&a), 2);
    assert_eq!(session.share_count(&b), 2);
    assert_eq!(c, a);
    assert_eq!(d, b);

    session.return_connection(&c).await.unwrap();
    assert_eq!(session.share_count(&a), 1);
    assert_eq!(session.occupied_connections(), 2);

    session.return_connection(&a).await.unwrap();
    assert_eq!(session.share_count(&a), 0);
    assert_eq!(session.occupied_connections(), 1);
    assert_eq!(session.idle_connections(), 1);

    session.return_connection(&b).await.unwrap();
    session.return_connection(&d).await.unwrap();
    assert_eq!(session.shared_connections(), 0);
    assert_eq!(session.occupied_connections(), 0);
    assert_eq!(session.idle_connections(), 2);

    session.release().await;
}

#[tokio::test]
async fn test_shared_connection_survives_early_discard() {
    let factory = MockConnectionFactory::new();
    let session = new_session(&factory, session_config(1)).await;

    let first = session.acquire_connection().await.unwrap();
    let second = session.acquire_connection().await.unwrap();
    assert_eq!(first, second);

    session.discard_connection(&second).await.unwrap();
    assert!(first.is_connected());
    assert_eq!(session.share_count(&first), 1);

    session.return_connection(&first).await.unwrap();
    assert_eq!(session.idle_connections(), 1);

    session.release().await;
}

#[tokio::test]
async fn test_exhausted_when_nothing_to_share() {
    let factory = MockConnectionFactory::new();
    let session = new_session(&factory, session_config(2)).await;

    // Occupy the pool behind the session's back
    let (x, _) = session.pool().get().await.unwrap();
    let (y, _) = session.pool().get().await.unwrap();

    let err = session.acquire_connection().await.unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Exhausted);
    assert!(!err.is_retriable());

    let err = session.acquire_connections_multi(2).await.unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Exhausted);

    session.pool().return_connection(&x).await.unwrap();
    session.pool().return_connection(&y).await.unwrap();
    assert!(session.acquire_connection().await.is_ok());

    session.release().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_acquire_and_return() {
    let factory = MockConnectionFactory::new();
    let session = Arc::new(new_session(&factory, session_config(4)).await);

    let mut tasks = Vec::new();
    for _ in 0..16 {
        let session = session.clone();
        tasks.push(tokio::spawn(async move {
            for _ in 0..20 {
                let conn = session.acquire_connection().await.unwrap();
                assert!(conn.is_connected());
                tokio::task::yield_now().await;
                session.return_connection(&conn).await.unwrap();
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(session.shared_connections(), 0);
    assert_eq!(session.occupied_connections(), 0);
    assert!(session.connection_total() <= 4);
    assert_eq!(factory.connected_count(), session.connection_total());

    session.release().await;
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_acquire_waits_for_inflight_connect() {
    let factory = MockConnectionFactory::new().with_connect_delay(Duration::from_millis(50));
    let session = new_session(&factory, session_config(1)).await;

    let first = session.acquire_connection().await.unwrap();
    session.discard_connection(&first).await.unwrap();
    assert_eq!(session.connection_total(), 0);

    let (a, b) = tokio::join!(session.acquire_connection(), session.acquire_connection());
    let a = a.unwrap();
    let b = b.unwrap();

    assert_eq!(a, b);
    assert_eq!(session.share_count(&a), 2);
    assert_eq!(session.connection_total(), 1);
    assert_eq!(factory.created_count(), 2);

    session.return_connection(&a).await.unwrap();
    session.return_connection(&b).await.unwrap();
    assert_eq!(session.idle_connections(), 1);

    session.release().await;
}

#[tokio::test(start_paused = true)]
async fn test_abandoned_acquire_leaves_session_usable() {
    let factory = MockConnectionFactory::new().with_connect_delay(Duration::from_millis(100));
    let session = new_session(&factory, session_config(1)).await;

    let first = session.acquire_connection().await.unwrap();
    session.discard_connection(&first).await.unwrap();

    let abandoned =
        tokio::time::timeout(Duration::from_millis(10), session.acquire_connection()).await;
    assert!(abandoned.is_err());
    assert_eq!(session.shared_connections(), 0);
    assert_eq!(session.pool().available_connections(), 1);

    let conn = session.acquire_connection().await.unwrap();
    assert!(conn.is_connected());
    assert_eq!(session.share_count(&conn), 1);

    session.release().await;
}

// ==================== Batch acquisition ====================

#[tokio::test]
async fn test_multi_acquire_round_robin() {
    let factory = MockConnectionFactory::new();
    let session = new_session(&factory, session_config(3)).await;

    let conns = session.acquire_connections_multi(5).await.unwrap();
    assert_eq!(conns.len(), 5);

    let distinct: HashSet<ConnectionId> = conns.iter().map(|c| c.id()).collect();
    assert_eq!(distinct.len(), 3);
    assert_eq!(session.connection_total(), 3);

    let mut counts: Vec<usize> = conns[..3].iter().map(|c| session.share_count(c)).collect();
    counts.sort_unstable();
    assert_eq!(counts, vec![1, 2, 2]);
    assert_eq!(conns[3], conns[0]);
    assert_eq!(conns[4], conns[1]);

    for conn in &conns {
        session.return_connection(conn).await.unwrap();
    }
    assert_eq!(session.shared_connections(), 0);
    assert_eq!(session.idle_connections(), 3);

    session.release().await;
}

#[tokio::test]
async fn test_multi_acquire_within_capacity_is_exclusive() {
    let factory = MockConnectionFactory::new();
    let session = new_session(&factory, session_config(4)).await;

    let conns = session.acquire_connections_multi(3).await.unwrap();
    let distinct: HashSet<ConnectionId> = conns.iter().map(|c| c.id()).collect();
    assert_eq!(distinct.len(), 3);
    assert_eq!(session.metrics().snapshot().connection_pool_failures, 0);

    session.release().await;
}

#[tokio::test]
async fn test_multi_acquire_returns_partial_batch_on_connect_failure() {
    let factory = MockConnectionFactory::new();
    let session = new_session(&factory, session_config(4)).await;

    factory.set_fail_connect(true);
    let err = session.acquire_connections_multi(3).await.unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Connection);

    // The one idle connection was handed out, then given back
    assert_eq!(session.shared_connections(), 0);
    assert_eq!(session.occupied_connections(), 0);
    assert_eq!(session.idle_connections(), 1);

    session.release().await;
}

// ==================== Transaction refresh ====================

#[tokio::test]
async fn test_reused_connection_is_refreshed() {
    let factory = MockConnectionFactory::new();
    let session = new_session(&factory, session_config(3)).await;
    assert_eq!(session.refresh_capability(), RefreshCapability::Supported);

    let conn = session.acquire_connection().await.unwrap();
    let state = factory.connection(0).unwrap();
    // One refresh from the capability check, one for this reuse
    assert_eq!(state.rollback_calls(), 2);

    // Newly opened connections skip the refresh
    let fresh = session.acquire_connection().await.unwrap();
    assert_eq!(factory.connection(1).unwrap().rollback_calls(), 0);

    session.return_connection(&conn).await.unwrap();
    session.return_connection(&fresh).await.unwrap();
    session.release().await;
}

#[tokio::test]
async fn test_refresh_disabled_by_config() {
    let factory = MockConnectionFactory::new();
    let session = new_session(
        &factory,
        session_config(3).with_start_new_transaction(false),
    )
    .await;

    assert_eq!(session.refresh_capability(), RefreshCapability::NotChecked);
    let conn = session.acquire_connection().await.unwrap();
    session.return_connection(&conn).await.unwrap();
    assert_eq!(factory.connection(0).unwrap().rollback_calls(), 0);

    session.release().await;
}

#[tokio::test]
async fn test_refresh_failure_is_sticky() {
    let factory = MockConnectionFactory::new();
    let session = new_session(&factory, session_config(3)).await;

    let conn = session.acquire_connection().await.unwrap();
    session.return_connection(&conn).await.unwrap();
    assert_eq!(session.idle_connections(), 1);

    factory.set_fail_rollback(true);
    let replacement = session.acquire_connection().await.unwrap();

    assert_ne!(replacement, conn);
    assert!(replacement.is_connected());
    assert!(!factory.connection(0).unwrap().is_connected());
    assert_eq!(session.refresh_capability(), RefreshCapability::Unsupported);
    assert_eq!(session.metrics().snapshot().transaction_refresh_failures, 1);

    // Returns now discard rather than pool
    session.return_connection(&replacement).await.unwrap();
    assert!(!replacement.is_connected());
    assert_eq!(session.idle_connections(), 0);

    // Recovering server does not re-enable refresh
    factory.set_fail_rollback(false);
    let next = session.acquire_connection().await.unwrap();
    assert_eq!(session.refresh_capability(), RefreshCapability::Unsupported);
    session.return_connection(&next).await.unwrap();

    session.release().await;
}

#[tokio::test]
async fn test_refresh_check_failure_degrades_without_failing() {
    let factory = MockConnectionFactory::new().with_rollback_failure(true);
    let session = new_session(
        &factory,
        SessionConfig::new(
            ConnectionPoolConfig::new()
                .with_max_cap(3)
                .with_initial_cap(2),
        ),
    )
    .await;

    assert_eq!(session.refresh_capability(), RefreshCapability::Unsupported);
    // The checked connection is gone, the other initial one is still idle
    assert_eq!(session.idle_connections(), 1);
    assert_eq!(factory.connected_count(), 1);

    // Reusing the idle connection replaces it with a fresh one
    let conn = session.acquire_connection().await.unwrap();
    assert!(!factory.connection(0).unwrap().is_connected());
    assert_eq!(factory.created_count(), 3);
    assert_eq!(factory.connection(2).unwrap().rollback_calls(), 0);

    session.return_connection(&conn).await.unwrap();
    assert_eq!(factory.connected_count(), 0);

    session.release().await;
}

// ==================== Unmanaged connections ====================

#[tokio::test]
async fn test_unmanaged_connection_lifecycle() {
    let factory = MockConnectionFactory::new();
    let session = new_session(&factory, session_config(2)).await;
    let total_before = session.connection_total();

    let conn = session.acquire_unmanaged_connection().await.unwrap();
    assert!(conn.is_connected());
    assert_eq!(session.connection_total(), total_before);
    assert_eq!(session.share_count(&conn), 0);
    assert_eq!(session.metrics().snapshot().connections_opened, 2);

    session.return_connection(&conn).await.unwrap();
    assert!(!conn.is_connected());
    assert_eq!(session.idle_connections(), 1);
    assert_eq!(session.metrics().snapshot().connections_opened, 1);

    session.release().await;
}

#[tokio::test]
async fn test_unmanaged_ignores_pool_capacity() {
    let factory = MockConnectionFactory::new();
    let session = new_session(&factory, session_config(1)).await;

    let pooled = session.acquire_connection().await.unwrap();
    let unmanaged = session.acquire_unmanaged_connection().await.unwrap();
    assert_ne!(pooled, unmanaged);

    session.discard_connection(&unmanaged).await.unwrap();
    session.return_connection(&pooled).await.unwrap();
    session.release().await;
}

// ==================== Discard and release ====================

#[tokio::test]
async fn test_discard_connection() {
    let factory = MockConnectionFactory::new();
    let session = new_session(&factory, session_config(3)).await;

    let conn = session.acquire_connection().await.unwrap();
    session.discard_connection(&conn).await.unwrap();

    assert!(!conn.is_connected());
    assert_eq!(session.connection_total(), 0);
    assert_eq!(session.shared_connections(), 0);

    session.release().await;
}

#[tokio::test]
async fn test_release_is_idempotent() {
    let factory = MockConnectionFactory::new();
    let session = new_session(&factory, session_config(3)).await;
    let conn = session.acquire_connection().await.unwrap();

    session.release().await;
    session.release().await;

    assert_eq!(session.connection_total(), 0);
    assert!(!conn.is_connected());
    assert_eq!(factory.connected_count(), 0);
    assert_eq!(session.metrics().snapshot().connections_opened, 0);

    assert!(matches!(session.acquire_connection().await, Err(Error::Released)));
    assert!(matches!(
        session.acquire_unmanaged_connection().await,
        Err(Error::Released)
    ));
}

#[tokio::test]
async fn test_release_keeps_unmanaged_connections_counted() {
    let factory = MockConnectionFactory::new();
    let session = new_session(&factory, session_config(2)).await;

    let pooled = session.acquire_connection().await.unwrap();
    let unmanaged = session.acquire_unmanaged_connection().await.unwrap();
    assert_eq!(session.metrics().snapshot().connections_opened, 2);

    session.release().await;
    assert!(!pooled.is_connected());
    assert!(unmanaged.is_connected());

    let snapshot = session.metrics().snapshot();
    assert_eq!(snapshot.connections_opened, 1);
    assert_eq!(snapshot.connections_occupied, 0);

    session.return_connection(&unmanaged).await.unwrap();
    assert!(!unmanaged.is_connected());
    assert_eq!(session.metrics().snapshot().connections_opened, 0);
}

// ==================== Creation ====================

#[tokio::test]
async fn test_creation_fails_when_server_unreachable() {
    let factory = MockConnectionFactory::new();
    factory.set_fail_connect(true);

    let err = IrodsSession::new(test_account(), session_config(3), Arc::new(factory.clone()))
        .await
        .unwrap_err();

    assert_eq!(err.category(), ErrorCategory::Connection);
    assert!(err.is_retriable());
    assert_eq!(factory.connected_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_creation_times_out() {
    let factory = MockConnectionFactory::new().with_connect_delay(Duration::from_secs(10));
    let config = SessionConfig::new(
        ConnectionPoolConfig::new().with_connect_timeout(Duration::from_secs(1)),
    );

    let result = IrodsSession::new(test_account(), config, Arc::new(factory.clone())).await;

    assert!(result.is_err());
    assert_eq!(factory.connected_count(), 0);
}

#[tokio::test]
async fn test_parallel_upload_flag_is_detected() {
    let factory = MockConnectionFactory::new();
    let session = new_session(&factory, session_config(2)).await;
    assert!(!session.supports_parallel_upload());
    session.release().await;

    let factory = MockConnectionFactory::new().with_parallel_upload(true);
    let session = new_session(&factory, session_config(2)).await;
    assert!(session.supports_parallel_upload());
    session.release().await;
}
