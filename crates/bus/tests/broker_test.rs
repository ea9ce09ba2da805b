//! Integration tests for the broker: forwarding, health probes and
//! attaching to a bus that comes up late.

use std::time::Duration;

use tokio::time::timeout;

use datasource_bus::{
    probe_health, BusConfig, BusSession, EventBroker, EventPublisher, EventSubscriber, Message,
    RetryPolicy, Transport, ZmqPublisher, ZmqSubscriber,
};

const TIMEOUT: Duration = Duration::from_secs(5);
const SETTLE: Duration = Duration::from_millis(200);

fn spawn_broker(bus: &BusConfig) -> tokio::task::JoinHandle<()> {
    let cfg = bus.broker_config().unwrap();
    tokio::spawn(async move {
        let _ = EventBroker::new(cfg).run().await;
    })
}

#[tokio::test]
async fn forwards_between_publishers_and_subscribers() {
    let bus = BusConfig::tcp("127.0.0.1", 16100);
    let handle = spawn_broker(&bus);
    tokio::time::sleep(SETTLE).await;

    let frontend = bus.frontend_transport().unwrap();
    let backend = bus.backend_transport().unwrap();

    let pub1 = ZmqPublisher::connect(&frontend).await.unwrap();
    let pub2 = ZmqPublisher::connect(&frontend).await.unwrap();

    let sub = ZmqSubscriber::connect(&backend).await.unwrap();
    sub.subscribe("response_").await.unwrap();
    tokio::time::sleep(SETTLE).await;

    pub1.publish(Message::raw("response_a", br#"{"n":1}"#.to_vec()))
        .await
        .unwrap();
    pub2.publish(Message::raw("response_b", br#"{"n":2}"#.to_vec()))
        .await
        .unwrap();
    pub2.publish(Message::raw("datasource_progress", br#"{"n":3}"#.to_vec()))
        .await
        .unwrap();

    let mut topics = Vec::new();
    for _ in 0..2 {
        let msg = timeout(TIMEOUT, sub.recv()).await.expect("timed out").unwrap();
        topics.push(msg.topic);
    }
    topics.sort();
    assert_eq!(topics, vec!["response_a".to_string(), "response_b".to_string()]);

    let filtered = timeout(Duration::from_millis(300), sub.recv()).await;
    assert!(filtered.is_err(), "progress topic must be filtered out");

    handle.abort();
}

#[tokio::test]
async fn fan_out_to_multiple_subscribers() {
    let bus = BusConfig::tcp("127.0.0.1", 16110);
    let handle = spawn_broker(&bus);
    tokio::time::sleep(SETTLE).await;

    let publisher = ZmqPublisher::connect(&bus.frontend_transport().unwrap()).await.unwrap();
    let sub1 = ZmqSubscriber::connect(&bus.backend_transport().unwrap()).await.unwrap();
    let sub2 = ZmqSubscriber::connect(&bus.backend_transport().unwrap()).await.unwrap();
    sub1.subscribe("progress_x").await.unwrap();
    sub2.subscribe("progress_x").await.unwrap();
    tokio::time::sleep(SETTLE).await;

    let msg = Message::raw("progress_x", br#"{"progress":40}"#.to_vec());
    publisher.publish(msg.clone()).await.unwrap();

    let r1 = timeout(TIMEOUT, sub1.recv()).await.expect("sub1 timed out").unwrap();
    let r2 = timeout(TIMEOUT, sub2.recv()).await.expect("sub2 timed out").unwrap();
    assert_eq!(r1, msg);
    assert_eq!(r2, msg);

    handle.abort();
}

#[tokio::test]
async fn health_probe_answers_ok() {
    let bus = BusConfig::tcp("127.0.0.1", 16120);
    let handle = spawn_broker(&bus);
    tokio::time::sleep(SETTLE).await;

    probe_health(&bus.health_transport().unwrap(), Duration::from_secs(2))
        .await
        .expect("broker should answer health probe");

    handle.abort();
}

#[tokio::test]
async fn attaches_once_broker_comes_up() {
    let bus = BusConfig::tcp("127.0.0.1", 16130);

    let connect_bus = bus.clone();
    let attach = tokio::spawn(async move {
        BusSession::connect_with_retry(&connect_bus, RetryPolicy::forever(Duration::from_millis(100)))
            .await
    });

    // Nothing is listening yet; the session must keep retrying, not fail.
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert!(!attach.is_finished(), "should still be retrying");

    let handle = spawn_broker(&bus);

    let session = timeout(TIMEOUT, attach)
        .await
        .expect("should attach after broker starts")
        .expect("task should not panic")
        .expect("connect should succeed");

    session.subscriber.subscribe("datasource_progress").await.unwrap();
    tokio::time::sleep(SETTLE).await;
    let msg = Message::raw("datasource_progress", br#"{"progress":100}"#.to_vec());
    session.publisher.publish(msg.clone()).await.unwrap();
    let received = timeout(TIMEOUT, session.subscriber.recv())
        .await
        .expect("timed out")
        .unwrap();
    assert_eq!(received, msg);

    handle.abort();
}

#[tokio::test]
async fn retry_policy_with_limit_gives_up() {
    let bus = BusConfig::tcp("127.0.0.1", 16140);
    let result =
        BusSession::connect_with_retry(&bus, RetryPolicy::attempts(2, Duration::from_millis(50))).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn invalid_config_is_not_retried() {
    let bus = BusConfig {
        frontend: "udp://127.0.0.1:1".into(),
        ..BusConfig::default()
    };
    let result = timeout(
        Duration::from_secs(1),
        BusSession::connect_with_retry(&bus, RetryPolicy::forever(Duration::from_millis(50))),
    )
    .await
    .expect("config errors must return immediately");
    assert!(result.is_err());
}

#[test]
fn transport_parse_matches_config() {
    let bus = BusConfig::tcp("127.0.0.1", 16150);
    assert_eq!(bus.frontend_transport().unwrap(), Transport::tcp("127.0.0.1", 16150));
}
