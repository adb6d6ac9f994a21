//! End-to-end sessions against a served broker over real sockets.

mod common;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::TcpListener;
use tokio::time::timeout;

use reliq::broker::client::BrokerClient;
use reliq::broker::server::serve_on;
use reliq::{Config, QueueStore};

async fn start_broker() -> (SocketAddr, Arc<QueueStore>) {
    common::init_logging();
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let store = Arc::new(QueueStore::new());
    let serve_store = Arc::clone(&store);
    tokio::spawn(async move {
        let _ = serve_on(listener, serve_store, Config::default()).await;
    });
    (addr, store)
}

#[tokio::test]
async fn full_command_surface_over_tcp() {
    let (addr, _store) = start_broker().await;
    let mut client = BrokerClient::connect(addr).await.expect("connect");

    let ids = client
        .push(
            "jobs",
            vec![Bytes::from_static(b"alpha"), Bytes::from_static(b"beta")],
        )
        .await
        .expect("push");
    assert_eq!(ids.len(), 2);
    assert!(ids[0] < ids[1]);

    let listed = client.range("jobs", false, 0, 10).await.expect("range");
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[0].payload, Bytes::from_static(b"alpha"));

    let items = client
        .pop(vec!["jobs".into()], 2, 0)
        .await
        .expect("pop");
    assert_eq!(items.len(), 2);
    assert_eq!(items[0].id, ids[0]);
    assert_eq!(items[0].queue, "jobs");

    let pending = client.range("jobs", true, 0, 10).await.expect("range pending");
    assert_eq!(pending.len(), 2);
    assert_eq!(pending[0].deliveries, 1);

    let info = client.info("jobs").await.expect("info");
    assert_eq!(info.undelivered, 0);
    assert_eq!(info.delivered, 2);
    assert_eq!(info.last_id, ids[1]);

    let acked = client.ack("jobs", ids.clone()).await.expect("ack");
    assert_eq!(acked, ids);
    let info = client.info("jobs").await.expect("info after ack");
    assert_eq!(info.delivered, 0);
}

#[tokio::test]
async fn blocked_consumer_is_woken_by_another_connection() {
    let (addr, _store) = start_broker().await;

    let mut consumer = BrokerClient::connect(addr).await.expect("connect consumer");
    let popper = tokio::spawn(async move {
        consumer
            .pop(vec!["work".into()], 1, 5_000)
            .await
            .expect("blocking pop")
    });

    // Let the consumer reach the broker and park before pushing.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut producer = BrokerClient::connect(addr).await.expect("connect producer");
    producer
        .push("work", vec![Bytes::from_static(b"payload")])
        .await
        .expect("push");

    let items = timeout(Duration::from_secs(2), popper)
        .await
        .expect("woken in time")
        .expect("task");
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].queue, "work");
    assert_eq!(items[0].payload, Bytes::from_static(b"payload"));
}

#[tokio::test]
async fn blocking_pop_timeout_yields_empty_reply() {
    let (addr, _store) = start_broker().await;
    let mut client = BrokerClient::connect(addr).await.expect("connect");

    let items = client
        .pop(vec!["idle".into()], 1, 80)
        .await
        .expect("timed-out pop is a success");
    assert!(items.is_empty());
}

#[tokio::test]
async fn recover_over_tcp_redelivers() {
    let (addr, _store) = start_broker().await;
    let mut client = BrokerClient::connect(addr).await.expect("connect");

    client
        .push("jobs", vec![Bytes::from_static(b"crashy")])
        .await
        .expect("push");
    let items = client.pop(vec!["jobs".into()], 1, 0).await.expect("pop");
    assert_eq!(items.len(), 1);

    tokio::time::sleep(Duration::from_millis(60)).await;
    let recovered = client.recover("jobs", 10, 20).await.expect("recover");
    assert_eq!(recovered.len(), 1);
    assert_eq!(recovered[0].id, items[0].id);
    assert_eq!(recovered[0].deliveries, 2);
    assert!(recovered[0].age_ms >= 0);
}

#[tokio::test]
async fn broker_errors_carry_through_to_the_client() {
    let (addr, _store) = start_broker().await;
    let mut client = BrokerClient::connect(addr).await.expect("connect");

    let err = client
        .info("never-created")
        .await
        .expect_err("info on an absent queue is an error");
    assert!(err.to_string().contains("no such queue"));

    let err = client
        .pop(vec!["jobs".into()], 0, 0)
        .await
        .expect_err("zero count is rejected");
    assert!(err.to_string().contains("count"));

    // The connection survives rejected commands.
    let ids = client
        .push("jobs", vec![Bytes::from_static(b"ok")])
        .await
        .expect("push after errors");
    assert_eq!(ids.len(), 1);
}

#[tokio::test]
async fn acknowledging_unknown_ids_is_a_quiet_no_op() {
    let (addr, _store) = start_broker().await;
    let mut client = BrokerClient::connect(addr).await.expect("connect");

    client
        .push("jobs", vec![Bytes::from_static(b"a")])
        .await
        .expect("push");
    let items = client.pop(vec!["jobs".into()], 1, 0).await.expect("pop");

    let bogus = "99999999999-42".parse().expect("id literal");
    let acked = client
        .ack("jobs", vec![items[0].id, bogus])
        .await
        .expect("ack");
    assert_eq!(acked, vec![items[0].id]);
}
