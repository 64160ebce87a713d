/// Concurrent handle tests
///
/// Copied and cloned handles used from many tasks at once
/// Run with: cargo test --test concurrent_handles_tests

use docsession::{
    Collection, Document, MASTER_SESSION, MemoryReplicaSet, SessionError, SessionManager,
    StoreConfig, execute,
};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::Barrier;

const DATABASE: &str = "test";
const READINGS: &str = "buoy_readings";

fn doc(value: serde_json::Value) -> Document {
    value.as_object().cloned().unwrap()
}

fn seeded_set(count: u64) -> MemoryReplicaSet {
    let set = MemoryReplicaSet::new()
        .with_primary("localhost:27017")
        .with_secondary("localhost:27018");
    let readings = (0..count)
        .map(|seq| doc(json!({"seq": seq, "wave_height": seq % 7})))
        .collect();
    set.seed(DATABASE, READINGS, readings).unwrap();
    set
}

async fn started(set: &MemoryReplicaSet, config: StoreConfig) -> Arc<SessionManager> {
    let mut manager = SessionManager::with_config(set.clone(), config);
    manager.startup("test").await.unwrap();
    Arc::new(manager)
}

fn config() -> StoreConfig {
    StoreConfig::new("localhost:27017,localhost:27018", DATABASE)
}

fn seq(document: &Document) -> u64 {
    document["seq"].as_u64().unwrap()
}

#[tokio::test]
async fn test_clone_cursor_unaffected_by_copies() {
    let set = seeded_set(100);
    let manager = started(&set, config()).await;

    let mut clone = manager.clone_master_session("reader").unwrap();
    let mut cursor = clone
        .collection(DATABASE, READINGS)
        .unwrap()
        .find_iter(Document::new(), 10)
        .await
        .unwrap();

    let mut seen = Vec::new();
    for _ in 0..5 {
        seen.push(seq(&cursor.next().await.unwrap().unwrap()));
    }

    let num_tasks = 8;
    let barrier = Arc::new(Barrier::new(num_tasks + 1));
    let mut handles = vec![];

    for task_id in 0..num_tasks {
        let manager = Arc::clone(&manager);
        let barrier = Arc::clone(&barrier);

        handles.push(tokio::spawn(async move {
            let caller_id = format!("copy-{}", task_id);
            let mut copy = manager.copy_master_session(&caller_id).unwrap();
            barrier.wait().await;

            for _ in 0..10 {
                let read_all = |readings: Collection| async move {
                    let cursor = readings.find_iter(Document::new(), 7).await?;
                    Ok::<_, SessionError>(cursor.collect().await?)
                };
                let all = execute(&caller_id, &copy, DATABASE, READINGS, read_all).await.unwrap();
                assert_eq!(all.len(), 100, "Task {} read incorrect count", task_id);
                tokio::task::yield_now().await;
            }

            manager.close_session(&caller_id, Some(&mut copy));
        }));
    }

    barrier.wait().await;
    while let Some(document) = cursor.next().await.unwrap() {
        seen.push(seq(&document));
        tokio::task::yield_now().await;
    }

    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(seen, (0..100).collect::<Vec<u64>>());
    assert_eq!(manager.stats()[MASTER_SESSION].dedicated_sockets, 1);

    manager.close_session("reader", Some(&mut clone));
    assert_eq!(manager.stats()[MASTER_SESSION].dedicated_sockets, 0);
    assert_eq!(manager.stats()[MASTER_SESSION].pooled_in_use(), 0);
}

#[tokio::test]
async fn test_copies_share_a_bounded_pool() {
    let set = seeded_set(0);
    let manager = started(&set, config().max_pool_size(2)).await;

    let num_tasks = 10;
    let barrier = Arc::new(Barrier::new(num_tasks));
    let mut handles = vec![];

    for task_id in 0..num_tasks {
        let manager = Arc::clone(&manager);
        let barrier = Arc::clone(&barrier);

        handles.push(tokio::spawn(async move {
            let caller_id = format!("writer-{}", task_id);
            let mut copy = manager.copy_master_session(&caller_id).unwrap();
            barrier.wait().await;

            execute(&caller_id, &copy, DATABASE, READINGS, |readings: Collection| async move {
                Ok::<_, SessionError>(readings.insert(doc(json!({"seq": task_id}))).await?)
            })
            .await
            .unwrap();

            manager.close_session(&caller_id, Some(&mut copy));
        }));
    }

    for handle in handles {
        handle.await.unwrap();
    }

    let all_stats = manager.stats();
    let stats = &all_stats[MASTER_SESSION];
    assert!(stats.pools.iter().all(|pool| pool.total_sockets <= 2));
    assert_eq!(stats.pooled_in_use(), 0);

    let check = manager.copy_master_session("check").unwrap();
    let total = execute("check", &check, DATABASE, READINGS, |readings: Collection| async move {
        Ok::<_, SessionError>(readings.count(Document::new()).await?)
    })
    .await
    .unwrap();
    assert_eq!(total, num_tasks as u64);
}

#[tokio::test]
async fn test_clones_never_touch_the_pool() {
    let set = seeded_set(10);
    let manager = started(&set, config()).await;
    let pooled_before = manager.stats()[MASTER_SESSION].pooled_total();

    let num_tasks = 6;
    let barrier = Arc::new(Barrier::new(num_tasks + 1));
    let done = Arc::new(Barrier::new(num_tasks + 1));
    let mut handles = vec![];

    for task_id in 0..num_tasks {
        let manager = Arc::clone(&manager);
        let barrier = Arc::clone(&barrier);
        let done = Arc::clone(&done);

        handles.push(tokio::spawn(async move {
            let caller_id = format!("clone-{}", task_id);
            let mut clone = manager.clone_master_session(&caller_id).unwrap();

            let count_all = |readings: Collection| async move {
                Ok::<_, SessionError>(readings.count(Document::new()).await?)
            };
            let count = execute(&caller_id, &clone, DATABASE, READINGS, count_all).await.unwrap();
            assert_eq!(count, 10);

            // Hold the socket until every clone has one.
            barrier.wait().await;
            done.wait().await;
            manager.close_session(&caller_id, Some(&mut clone));
        }));
    }

    barrier.wait().await;
    let all_stats = manager.stats();
    let stats = &all_stats[MASTER_SESSION];
    assert_eq!(stats.dedicated_sockets, num_tasks);
    assert_eq!(stats.pooled_in_use(), 0);
    assert_eq!(stats.pooled_total(), pooled_before);
    done.wait().await;

    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(manager.stats()[MASTER_SESSION].dedicated_sockets, 0);
}

#[tokio::test]
async fn test_monotonic_handles_are_isolated() {
    let set = seeded_set(3).with_replication_lag();
    let manager = started(&set, config()).await;

    let mut writer = manager.copy_monotonic_session("writer").unwrap();
    let mut reader = manager.copy_monotonic_session("reader").unwrap();

    let read = |readings: Collection| async move {
        Ok::<_, SessionError>(readings.count(Document::new()).await?)
    };

    assert_eq!(execute("reader", &reader, DATABASE, READINGS, read).await.unwrap(), 3);

    let written = execute("writer", &writer, DATABASE, READINGS, |readings: Collection| async move {
        readings.insert(doc(json!({"seq": 3}))).await?;
        Ok::<_, SessionError>(readings.count(Document::new()).await?)
    })
    .await
    .unwrap();
    assert_eq!(written, 4);

    // The reader stays on its secondary until replication catches up.
    assert_eq!(execute("reader", &reader, DATABASE, READINGS, read).await.unwrap(), 3);
    set.replicate().unwrap();
    assert_eq!(execute("reader", &reader, DATABASE, READINGS, read).await.unwrap(), 4);

    manager.close_session("writer", Some(&mut writer));
    manager.close_session("reader", Some(&mut reader));
}
