//! Stale-delivery recovery against the real clock.

use std::time::Duration;

use bytes::Bytes;
use tokio::time::sleep;
use uuid::Uuid;

use reliq::core::store::{BlockMode, PopOutcome};
use reliq::QueueStore;

fn pop_one(store: &QueueStore, queue: &str) -> reliq::core::id::MessageId {
    match store
        .pop(&[queue.to_string()], 1, BlockMode::None, Uuid::new_v4())
        .unwrap()
    {
        PopOutcome::Items(items) => items[0].id,
        PopOutcome::Pending(_) => panic!("non-blocking pop must not park"),
    }
}

#[tokio::test]
async fn stale_deliveries_come_back_oldest_first() {
    let store = QueueStore::new();
    store
        .push(
            "jobs",
            vec![
                Bytes::from_static(b"a"),
                Bytes::from_static(b"b"),
                Bytes::from_static(b"c"),
            ],
        )
        .unwrap();

    let a = pop_one(&store, "jobs");
    sleep(Duration::from_millis(60)).await;
    let b = pop_one(&store, "jobs");
    sleep(Duration::from_millis(60)).await;
    let c = pop_one(&store, "jobs");
    sleep(Duration::from_millis(60)).await;

    // All three deliveries are at least 60ms old by now.
    let recovered = store.recover("jobs", 10, 20).unwrap();
    assert_eq!(
        recovered.iter().map(|m| m.id).collect::<Vec<_>>(),
        vec![a, b, c],
        "recovery order must follow delivery age, oldest first"
    );
    assert!(recovered.iter().all(|m| m.deliveries == 2));

    // Freshly re-stamped: nothing qualifies right away.
    assert!(store.recover("jobs", 10, 20).unwrap().is_empty());
    assert_eq!(store.info("jobs").unwrap().delivered, 3);
}

#[tokio::test]
async fn young_deliveries_are_left_alone() {
    let store = QueueStore::new();
    store.push("jobs", vec![Bytes::from_static(b"a")]).unwrap();
    pop_one(&store, "jobs");

    let recovered = store.recover("jobs", 10, 60_000).unwrap();
    assert!(recovered.is_empty());
    assert_eq!(store.info("jobs").unwrap().delivered, 1);
}

#[tokio::test]
async fn recovered_message_can_be_acknowledged() {
    let store = QueueStore::new();
    store.push("jobs", vec![Bytes::from_static(b"a")]).unwrap();
    let id = pop_one(&store, "jobs");
    sleep(Duration::from_millis(40)).await;

    let recovered = store.recover("jobs", 1, 10).unwrap();
    assert_eq!(recovered[0].id, id);

    assert_eq!(store.ack("jobs", &[id]).unwrap(), vec![id]);
    let info = store.info("jobs").unwrap();
    assert_eq!(info.delivered, 0);
    assert_eq!(info.memory_used, 0);
}
