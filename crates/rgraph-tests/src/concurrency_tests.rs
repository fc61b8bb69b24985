//! Concurrent transactions: conflict detection and transparent retry.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use rgraph_client::{FieldId, FieldType, GraphError, ResourceType, RetryConfig, TxOptions};
use tokio::sync::Barrier;

use crate::harness::{test_config, TestEnv};

fn int_type() -> ResourceType {
    ResourceType::new("Int", "1")
}

#[tokio::test]
async fn test_concurrent_writers_one_conflicts() {
    let env = TestEnv::new().await.unwrap();
    let root = env.client.client_root().unwrap();
    let field = FieldId::new(root, "contended");

    let s1 = env.client.open_tx("writer-1", true).await.unwrap();
    let s2 = env.client.open_tx("writer-2", true).await.unwrap();
    assert_ne!(s1.local_tx_id(), s2.local_tx_id());
    assert!(!s1.field_exists(field.clone()).await.unwrap());
    assert!(!s2.field_exists(field.clone()).await.unwrap());

    for (session, value) in [(&s1, "1"), (&s2, "2")] {
        let v = session.create_value(int_type(), value, false).unwrap();
        session.create_field(field.clone(), FieldType::Dynamic).unwrap();
        session.set_field(field.clone(), &v).unwrap();
    }

    s1.commit().await.unwrap();
    let err = s2.commit().await.unwrap_err();
    assert!(err.is_commit_conflict());
    assert!(matches!(err, GraphError::TxCommitConflict { ref tx_name } if tx_name == "writer-2"));
    s1.finished().await.unwrap();
    s2.finished().await.unwrap();

    assert_eq!(env.server.stats().conflicts, 1);
    assert!(env.server.field_value(root, "contended").is_some());
}

#[tokio::test]
async fn test_runner_retries_conflicting_writer() {
    let env = TestEnv::new().await.unwrap();
    let barrier = Arc::new(Barrier::new(2));

    let writer = |label: &'static str| {
        let barrier = barrier.clone();
        let calls = Arc::new(AtomicU32::new(0));
        let counted = calls.clone();
        let client = env.client.clone();
        async move {
            let result = client
                .with_write_tx(label, TxOptions::default(), move |tx| {
                    let barrier = barrier.clone();
                    let call = counted.fetch_add(1, Ordering::SeqCst);
                    async move {
                        let field = FieldId::new(tx.client_root(), "shared");
                        let exists = tx.field_exists(field.clone()).await?;
                        if call == 0 {
                            // Both writers read before either commits.
                            barrier.wait().await;
                        }
                        let value = tx.create_value(int_type(), label, false)?;
                        if !exists {
                            tx.create_field(field.clone(), FieldType::Dynamic)?;
                        }
                        tx.set_field(field, &value)?;
                        tx.commit().await?;
                        value.global().await
                    }
                })
                .await;
            (result, calls.load(Ordering::SeqCst))
        }
    };

    let ((r1, calls1), (r2, calls2)) = tokio::join!(writer("left"), writer("right"));
    let v1 = r1.unwrap();
    let v2 = r2.unwrap();
    assert_ne!(v1, v2);
    // Exactly one of the two first attempts lost.
    assert_eq!(calls1 + calls2, 3);
    assert_eq!(env.server.stats().conflicts, 1);
    assert_eq!(env.client.stats().retries, 1);

    let root = env.client.client_root().unwrap();
    let last = if calls1 == 2 { v1 } else { v2 };
    assert_eq!(env.server.field_value(root, "shared"), Some(last));
}

#[tokio::test]
async fn test_concurrent_counter_increments() {
    const WRITERS: u64 = 8;
    let env = TestEnv::new().await.unwrap();
    env.client
        .with_write_tx("init-counter", TxOptions::default(), |tx| async move {
            tx.set_kv_json(tx.client_root(), "counter", &0u64)
        })
        .await
        .unwrap();

    let options = TxOptions::default().with_retry(RetryConfig {
        max_attempts: 20,
        ..test_config().retry
    });
    let mut handles = Vec::new();
    for i in 0..WRITERS {
        let client = env.client.clone();
        let options = options.clone();
        handles.push(tokio::spawn(async move {
            client
                .with_write_tx(&format!("inc-{i}"), options, |tx| async move {
                    let root = tx.client_root();
                    let current: u64 = tx.get_kv_json(root, "counter").await?;
                    tx.set_kv_json(root, "counter", &(current + 1))
                })
                .await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let total: u64 = env
        .client
        .with_read_tx("read-counter", |tx| async move {
            tx.get_kv_json(tx.client_root(), "counter").await
        })
        .await
        .unwrap();
    assert_eq!(total, WRITERS);
    assert_eq!(env.client.stats().retries, env.server.stats().conflicts);
}

#[tokio::test]
async fn test_local_tx_ids_released_after_transactions() {
    let env = TestEnv::new().await.unwrap();
    let mut handles = Vec::new();
    for i in 0..16 {
        let client = env.client.clone();
        handles.push(tokio::spawn(async move {
            client
                .with_read_tx(&format!("reader-{i}"), |tx| async move {
                    tx.resource_exists(tx.client_root()).await
                })
                .await
        }));
    }
    for handle in handles {
        assert!(handle.await.unwrap().unwrap());
    }
    assert_eq!(env.client.transport_client().local_tx_ids().in_use(), 0);
}
