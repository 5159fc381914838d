//! Tests for the connection pool.
//!
//! These tests drive the pool through scripted connections and check the
//! bound on concurrent borrows, replacement of dead connections and
//! shutdown behavior.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use nowpilot::error::PilotError;
use nowpilot::pool::ConnectionPool;

use crate::common::{pool_settings, ScriptedConnector, Step};

async fn pool_with(size: usize, connector: &ScriptedConnector) -> ConnectionPool {
    ConnectionPool::initialize(&pool_settings(size), Arc::new(connector.clone()))
        .await
        .unwrap()
}

#[tokio::test]
async fn test_initialize_opens_every_connection() {
    let connector = ScriptedConnector::default();
    let pool = pool_with(3, &connector).await;

    assert_eq!(connector.state.opened.load(Ordering::SeqCst), 3);
    let stats = pool.stats();
    assert_eq!(stats.total, 3);
    assert_eq!(stats.available, 3);
    assert_eq!(stats.in_use, 0);
}

#[tokio::test]
async fn test_concurrent_borrows_never_exceed_size() {
    let connector = ScriptedConnector::new(
        (0..12).map(|_| Step::Slow(Duration::from_millis(15), json!({"ok": true}))),
    );
    let mut settings = pool_settings(3);
    settings.acquire_timeout = Duration::from_secs(5);
    let pool = ConnectionPool::initialize(&settings, Arc::new(connector.clone()))
        .await
        .unwrap();

    let mut tasks = Vec::new();
    for _ in 0..12 {
        let pool = pool.clone();
        tasks.push(tokio::spawn(async move {
            let mut guard = pool.acquire().await.unwrap();
            assert!(pool.stats().in_use <= 3);
            guard
                .connection()
                .call_tool("get_incident", &json!({}), None)
                .await
                .unwrap();
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert!(connector.state.max_in_flight.load(Ordering::SeqCst) <= 3);
    assert_eq!(connector.state.calls().len(), 12);
    let stats = pool.stats();
    assert_eq!(stats.in_use, 0);
    assert_eq!(stats.available, 3);
    assert_eq!(stats.total, 3);
}

#[tokio::test]
async fn test_acquire_times_out_when_exhausted() {
    let connector = ScriptedConnector::default();
    let pool = pool_with(1, &connector).await;

    let _held = pool.acquire().await.unwrap();
    let err = pool.acquire().await.unwrap_err();

    assert!(matches!(err, PilotError::PoolExhausted { .. }));
    assert!(err.is_retryable());
    assert_eq!(pool.stats().waiting, 0);
}

#[tokio::test]
async fn test_released_connection_is_reused() {
    let connector = ScriptedConnector::default();
    let pool = pool_with(1, &connector).await;

    let first = pool.acquire().await.unwrap();
    let id = first.id();
    first.release();

    let second = pool.acquire().await.unwrap();
    assert_eq!(second.id(), id);
    assert_eq!(connector.state.opened.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_dead_connection_is_replaced_on_next_acquire() {
    let connector = ScriptedConnector::new([Step::Transport]);
    let pool = pool_with(1, &connector).await;

    let mut guard = pool.acquire().await.unwrap();
    let dead = guard.id();
    let err = guard
        .connection()
        .call_tool("create_incident", &json!({}), None)
        .await
        .unwrap_err();
    assert!(err.poisons_connection());
    drop(guard);

    let fresh = pool.acquire().await.unwrap();
    assert_ne!(fresh.id(), dead);
    assert_eq!(connector.state.opened.load(Ordering::SeqCst), 2);
    assert_eq!(pool.stats().total, 1);
}

#[tokio::test]
async fn test_marked_unhealthy_connection_is_not_reused() {
    let connector = ScriptedConnector::default();
    let pool = pool_with(1, &connector).await;

    let mut guard = pool.acquire().await.unwrap();
    let first = guard.id();
    guard.mark_unhealthy();
    drop(guard);

    let guard = pool.acquire().await.unwrap();
    assert_ne!(guard.id(), first);
}

#[tokio::test]
async fn test_health_check_replaces_dead_idle_connections() {
    let connector = ScriptedConnector::new([Step::Transport]);
    let pool = pool_with(2, &connector).await;

    // Kill one connection and return it without marking it
    {
        let mut guard = pool.acquire().await.unwrap();
        let _ = guard
            .connection()
            .call_tool("get_incident", &json!({}), None)
            .await;
    }

    // The dead one was discarded on release; the survivor pings fine
    assert_eq!(pool.check_health().await, 0);
    assert_eq!(pool.stats().total, 1);
    assert_eq!(pool.stats().available, 2);
}

#[tokio::test]
async fn test_discover_tools_lists_server_tools() {
    let connector = ScriptedConnector::default();
    let pool = pool_with(1, &connector).await;

    let tools = pool.discover_tools().await.unwrap();
    let names: Vec<_> = tools.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(names, ["create_incident", "get_incident", "delete_record"]);
    assert_eq!(pool.stats().in_use, 0);
}

#[tokio::test]
async fn test_shutdown_closes_idle_and_refuses_acquire() {
    let connector = ScriptedConnector::default();
    let pool = pool_with(2, &connector).await;

    let abandoned = pool.shutdown(Duration::from_millis(50)).await;

    assert_eq!(abandoned, 0);
    assert!(pool.is_closed());
    assert_eq!(connector.state.closed.load(Ordering::SeqCst), 2);
    assert!(matches!(
        pool.acquire().await.unwrap_err(),
        PilotError::PoolClosed
    ));
}

#[tokio::test]
async fn test_shutdown_waits_for_borrowed_connection() {
    let connector = ScriptedConnector::default();
    let pool = pool_with(1, &connector).await;

    let guard = pool.acquire().await.unwrap();
    let returner = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(guard);
    });

    let abandoned = pool.shutdown(Duration::from_secs(2)).await;
    returner.await.unwrap();

    assert_eq!(abandoned, 0);
    assert_eq!(pool.stats().in_use, 0);
}

#[tokio::test]
async fn test_shutdown_reports_connections_held_past_grace() {
    let connector = ScriptedConnector::default();
    let pool = pool_with(1, &connector).await;

    let _held = pool.acquire().await.unwrap();
    let abandoned = pool.shutdown(Duration::from_millis(20)).await;

    assert_eq!(abandoned, 1);
}
