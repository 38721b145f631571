//! Integration tests for per-context holds and transactions.

mod common;

use common::MockPool;
use db_router::db::{ContextId, LifecycleErrorPolicy, Router, TransactionManager};
use db_router::error::DbError;
use db_router::models::QueryParam;
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tokio_test::assert_ok;

async fn manager_with_pool() -> (TransactionManager, Arc<MockPool>) {
    let router = Arc::new(Router::new());
    let pool = MockPool::new();
    router.add_backend("mock", pool.clone()).await.unwrap();
    (TransactionManager::new(router), pool)
}

#[tokio::test]
async fn test_nested_holds_share_one_connection() {
    let (manager, pool) = manager_with_pool().await;
    let ctx = ContextId::new();

    assert_ok!(manager.hold_connection(&ctx).await);
    assert_ok!(manager.hold_connection(&ctx).await);
    assert_ok!(manager.begin_transaction(&ctx).await);
    assert_eq!(manager.hold_count(&ctx).await, 3);
    assert!(manager.is_in_transaction(&ctx).await);

    let first = manager.query(&ctx, "SELECT 1", &[]).await.unwrap();
    let second = manager.query(&ctx, "SELECT 2", &[]).await.unwrap();
    assert_eq!(first[0]["connection"], second[0]["connection"]);

    assert_ok!(manager.release_connection(&ctx).await);
    assert_ok!(manager.release_connection(&ctx).await);
    assert_eq!(pool.stats.closes(), 0);
    assert_ok!(manager.release_connection(&ctx).await);

    assert_eq!(pool.acquires(), 1);
    assert_eq!(pool.stats.opened(), 1);
    assert_eq!(pool.stats.closes(), 1);
    // Last release committed the open transaction
    assert_eq!(pool.stats.commits(), 1);
    assert!(!manager.is_connection_held(&ctx).await);
    assert_eq!(manager.context_count().await, 0);
}

#[tokio::test]
async fn test_paired_holds_close_on_last_release() {
    let (manager, pool) = manager_with_pool().await;
    let ctx = ContextId::new();

    manager.hold_connection(&ctx).await.unwrap();
    manager.hold_connection(&ctx).await.unwrap();
    manager.release_connection(&ctx).await.unwrap();
    assert!(manager.is_connection_held(&ctx).await);
    assert_eq!(pool.stats.closes(), 0);
    manager.release_connection(&ctx).await.unwrap();

    assert_eq!(pool.acquires(), 1);
    assert_eq!(pool.stats.closes(), 1);
    assert_eq!(pool.stats.commits(), 0);
    assert!(!manager.is_connection_held(&ctx).await);
}

#[tokio::test]
async fn test_commit_after_nested_begin_ends_context() {
    let (manager, pool) = manager_with_pool().await;
    let ctx = ContextId::new();

    manager.begin_transaction(&ctx).await.unwrap();
    manager.begin_transaction(&ctx).await.unwrap();
    assert_eq!(manager.hold_count(&ctx).await, 2);
    manager.commit_transaction(&ctx).await.unwrap();

    assert_eq!(pool.acquires(), 1);
    assert_eq!(pool.stats.commits(), 1);
    assert_eq!(pool.stats.closes(), 1);
    let result = manager.release_connection(&ctx).await;
    assert!(matches!(result, Err(DbError::NoCurrentTransaction { .. })));
}

#[tokio::test]
async fn test_plain_hold_release_does_not_commit() {
    let (manager, pool) = manager_with_pool().await;
    let ctx = ContextId::new();

    manager.hold_connection(&ctx).await.unwrap();
    assert!(!manager.is_in_transaction(&ctx).await);
    manager.release_connection(&ctx).await.unwrap();

    assert_eq!(pool.stats.commits(), 0);
    assert_eq!(pool.stats.closes(), 1);
}

#[tokio::test]
async fn test_commit_is_terminal_for_the_context() {
    let (manager, pool) = manager_with_pool().await;
    let ctx = ContextId::new();

    manager.hold_connection(&ctx).await.unwrap();
    manager.begin_transaction(&ctx).await.unwrap();
    manager.execute(&ctx, "UPDATE t SET x = 1", &[]).await.unwrap();
    manager.commit_transaction(&ctx).await.unwrap();

    assert_eq!(pool.stats.commits(), 1);
    assert_eq!(pool.stats.closes(), 1);
    assert!(!manager.is_connection_held(&ctx).await);

    // The outer hold has nothing left to release
    let result = manager.release_connection(&ctx).await;
    assert!(matches!(result, Err(DbError::NoCurrentTransaction { .. })));
    let result = manager.commit_transaction(&ctx).await;
    assert!(matches!(result, Err(DbError::NoCurrentTransaction { .. })));
}

#[tokio::test]
async fn test_rollback_finishes_transaction() {
    let (manager, pool) = manager_with_pool().await;
    let ctx = ContextId::new();

    manager.begin_transaction(&ctx).await.unwrap();
    manager.rollback_transaction(&ctx).await.unwrap();

    assert_eq!(pool.stats.rollbacks(), 1);
    assert_eq!(pool.stats.commits(), 0);
    assert_eq!(pool.stats.closes(), 1);
    assert_eq!(manager.context_count().await, 0);
}

#[tokio::test]
async fn test_commit_requires_a_transaction() {
    let (manager, pool) = manager_with_pool().await;
    let ctx = ContextId::new();

    manager.hold_connection(&ctx).await.unwrap();
    let result = manager.commit_transaction(&ctx).await;
    assert!(matches!(result, Err(DbError::NoCurrentTransaction { .. })));
    let result = manager.rollback_transaction(&ctx).await;
    assert!(matches!(result, Err(DbError::NoCurrentTransaction { .. })));

    // Hold is untouched by the failed attempts
    assert_eq!(manager.hold_count(&ctx).await, 1);
    manager.release_connection(&ctx).await.unwrap();
    assert_eq!(pool.stats.closes(), 1);
}

#[tokio::test]
async fn test_failed_commit_on_release_still_closes() {
    let (manager, pool) = manager_with_pool().await;
    let ctx = ContextId::new();
    pool.stats.fail_commit.store(true, Ordering::SeqCst);

    manager.begin_transaction(&ctx).await.unwrap();
    assert_ok!(manager.release_connection(&ctx).await);

    assert_eq!(pool.stats.commits(), 1);
    assert_eq!(pool.stats.rollbacks(), 0);
    assert_eq!(pool.stats.closes(), 1);
}

#[tokio::test]
async fn test_lifecycle_errors_swallowed_by_default() {
    let router = Arc::new(Router::new());
    router.add_backend("down", MockPool::failing()).await.unwrap();
    let manager = TransactionManager::new(router);
    let ctx = ContextId::new();

    assert_ok!(manager.begin_transaction(&ctx).await);
    assert_ok!(manager.hold_connection(&ctx).await);
    assert!(!manager.is_connection_held(&ctx).await);

    // Statements still surface the failure
    let result = manager.execute(&ctx, "INSERT INTO t VALUES (1)", &[]).await;
    assert!(matches!(result, Err(DbError::Statement { .. })));
}

#[tokio::test]
async fn test_lifecycle_errors_propagated_when_configured() {
    let router = Arc::new(Router::new());
    router.add_backend("down", MockPool::failing()).await.unwrap();
    let manager = TransactionManager::with_policy(router, LifecycleErrorPolicy::Propagate);
    let ctx = ContextId::new();

    let result = manager.begin_transaction(&ctx).await;
    assert!(matches!(result, Err(DbError::NoConnectionAvailable { .. })));
    assert_eq!(manager.context_count().await, 0);
}

#[tokio::test]
async fn test_unheld_statements_use_fresh_connections() {
    let (manager, pool) = manager_with_pool().await;
    let ctx = ContextId::new();

    let affected = manager.execute(&ctx, "DELETE FROM t", &[]).await.unwrap();
    assert_eq!(affected, 1);
    let rows = manager
        .query(&ctx, "SELECT * FROM t WHERE id = ?", &[QueryParam::from(5)])
        .await
        .unwrap();
    assert_eq!(rows[0]["params"], json!(1));

    assert_eq!(pool.acquires(), 2);
    assert_eq!(pool.stats.closes(), 2);
    assert!(!manager.is_connection_held(&ctx).await);
}

#[tokio::test]
async fn test_empty_results_are_none() {
    let (manager, _pool) = manager_with_pool().await;
    let ctx = ContextId::new();

    let row = manager.query_optional(&ctx, "SELECT NOTHING", &[]).await.unwrap();
    assert!(row.is_none());
    let value = manager.query_scalar(&ctx, "SELECT NOTHING", &[]).await.unwrap();
    assert!(value.is_none());

    // First column of the mock row is the id of the third connection opened
    let value = manager.query_scalar(&ctx, "SELECT 1", &[]).await.unwrap();
    assert_eq!(value, Some(json!(3)));
}

#[tokio::test]
async fn test_statement_failure_carries_sql() {
    let (manager, pool) = manager_with_pool().await;
    let ctx = ContextId::new();
    pool.stats.fail_statements.store(true, Ordering::SeqCst);

    manager.hold_connection(&ctx).await.unwrap();
    let err = manager
        .execute(&ctx, "UPDATE broken SET", &[])
        .await
        .err()
        .expect("statement should fail");
    match &err {
        DbError::Statement { sql, source } => {
            assert_eq!(sql, "UPDATE broken SET");
            assert!(matches!(**source, DbError::Database { .. }));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(err.to_string().contains("UPDATE broken SET"));

    // Held connection survives a failed statement
    assert!(manager.is_connection_held(&ctx).await);
    manager.release_connection(&ctx).await.unwrap();
}

#[tokio::test]
async fn test_last_insert_id_on_held_connection() {
    let (manager, _pool) = manager_with_pool().await;
    let first = ContextId::new();
    let second = ContextId::new();

    manager.hold_connection(&first).await.unwrap();
    manager.hold_connection(&second).await.unwrap();

    // Mock connection 1 reports no id, connection 2 reports its number
    assert_eq!(manager.last_insert_id(&first).await.unwrap(), 0);
    assert_eq!(manager.last_insert_id(&second).await.unwrap(), 2);

    assert_eq!(manager.shutdown().await, 2);
}

#[tokio::test]
async fn test_contexts_are_independent() {
    let (manager, pool) = manager_with_pool().await;
    let a = ContextId::new();
    let b = ContextId::new();

    manager.begin_transaction(&a).await.unwrap();
    manager.hold_connection(&b).await.unwrap();
    assert_eq!(pool.acquires(), 2);

    let infos = manager.list_contexts().await;
    assert_eq!(infos.len(), 2);
    let info_a = infos
        .iter()
        .find(|i| i.context_id == a.to_string())
        .expect("context a listed");
    assert!(!info_a.auto_commit);
    assert_eq!(info_a.hold_count, 1);

    manager.rollback_transaction(&a).await.unwrap();
    assert!(manager.is_connection_held(&b).await);
    assert!(!manager.is_connection_held(&a).await);
    manager.release_connection(&b).await.unwrap();
}

#[tokio::test]
async fn test_shutdown_closes_remaining_contexts() {
    let (manager, pool) = manager_with_pool().await;
    for _ in 0..3 {
        let ctx = ContextId::new();
        manager.hold_connection(&ctx).await.unwrap();
    }

    assert_eq!(manager.shutdown().await, 3);
    assert_eq!(pool.stats.closes(), 3);
    assert_eq!(manager.context_count().await, 0);
    assert_eq!(manager.shutdown().await, 0);
}

#[tokio::test]
async fn test_concurrent_contexts() {
    let (manager, pool) = manager_with_pool().await;
    let manager = Arc::new(manager);

    let mut handles = Vec::new();
    for _ in 0..8 {
        let manager = Arc::clone(&manager);
        handles.push(tokio::spawn(async move {
            let ctx = ContextId::new();
            manager.begin_transaction(&ctx).await.unwrap();
            manager.hold_connection(&ctx).await.unwrap();
            manager.execute(&ctx, "INSERT INTO t VALUES (1)", &[]).await.unwrap();
            manager.release_connection(&ctx).await.unwrap();
            manager.release_connection(&ctx).await.unwrap();
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(pool.acquires(), 8);
    assert_eq!(pool.stats.closes(), 8);
    assert_eq!(pool.stats.commits(), 8);
    assert_eq!(manager.context_count().await, 0);
}
