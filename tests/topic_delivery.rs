mod common;

use std::collections::HashSet;
use std::time::Duration;

use common::{body, test_config, TestServer};
use stompd::core::frame::header;
use stompd::Command;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn subscriber_receives_hundred_frames_in_send_order() {
    let srv = TestServer::start(test_config()).await;

    let mut a = srv.connected_client().await;
    a.subscribe("/topic/t", "a-1", "auto").await;

    let mut b = srv.connected_client().await;
    for i in 0..100 {
        b.send_text("/topic/t", &format!("frame-{i}")).await;
    }

    let mut ids = HashSet::new();
    for i in 0..100 {
        let msg = a.expect(Command::Message).await;
        assert_eq!(body(&msg), format!("frame-{i}"));
        assert_eq!(msg.header(header::DESTINATION), Some("/topic/t"));
        assert_eq!(msg.header(header::SUBSCRIPTION), Some("a-1"));
        assert!(msg.header(header::ACK).is_none());
        let id = msg.header(header::MESSAGE_ID).expect("message-id").to_string();
        assert!(!id.is_empty());
        assert!(ids.insert(id), "duplicate message-id");
    }

    a.disconnect().await;
    let registry = srv.server.topic_registry().clone();
    assert!(common::eventually(|| registry.subscriber_count("/topic/t") == 0).await);

    // Nobody is listening any more: the send still succeeds quietly.
    b.send_confirmed("/topic/t", "into the void").await;
    assert!(b.recv_within(Duration::from_millis(100)).await.is_none());
    b.disconnect().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn broadcast_reaches_every_live_subscriber_only() {
    let srv = TestServer::start(test_config()).await;

    let mut subscribers = Vec::new();
    for i in 0..3 {
        let mut client = srv.connected_client().await;
        client.subscribe("/topic/fan", &format!("s{i}"), "auto").await;
        subscribers.push(client);
    }

    let mut publisher = srv.connected_client().await;
    publisher.send_confirmed("/topic/fan", "hello all").await;

    let mut late = srv.connected_client().await;
    late.subscribe("/topic/fan", "late", "auto").await;

    for client in &mut subscribers {
        let msg = client.expect(Command::Message).await;
        assert_eq!(body(&msg), "hello all");
    }
    assert!(late.recv_within(Duration::from_millis(100)).await.is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn client_mode_topic_messages_carry_ack_header() {
    let srv = TestServer::start(test_config()).await;
    let mut sub = srv.connected_client().await;
    sub.subscribe("/topic/acked", "c", "client").await;

    let mut publisher = srv.connected_client().await;
    publisher.send_confirmed("/topic/acked", "x").await;

    let msg = sub.expect(Command::Message).await;
    let id = msg.header(header::MESSAGE_ID).expect("message-id");
    assert_eq!(msg.header(header::ACK), Some(id));
    // Topic messages are not tracked; acknowledging them is harmless.
    let id = id.to_string();
    sub.ack(&id).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unsubscribe_stops_topic_delivery() {
    let srv = TestServer::start(test_config()).await;
    let mut sub = srv.connected_client().await;
    sub.subscribe("/topic/u", "1", "auto").await;
    sub.unsubscribe("1").await;
    assert_eq!(srv.server.topic_registry().subscriber_count("/topic/u"), 0);

    let mut publisher = srv.connected_client().await;
    publisher.send_confirmed("/topic/u", "gone").await;
    assert!(sub.recv_within(Duration::from_millis(100)).await.is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn mixed_queue_and_topic_traffic_keeps_order_per_destination() {
    let srv = TestServer::start(test_config()).await;

    let mut receiver = srv.connected_client().await;
    receiver.subscribe("/queue/mixed", "q", "auto").await;
    receiver.subscribe("/topic/mixed", "t", "auto").await;

    let mut sender = srv.connected_client().await;
    for i in 0..100 {
        sender.send_text("/queue/mixed", &format!("q-{i}")).await;
        sender.send_text("/topic/mixed", &format!("t-{i}")).await;
    }

    let (mut next_q, mut next_t) = (0, 0);
    while next_q < 100 || next_t < 100 {
        let msg = receiver.expect(Command::Message).await;
        match msg.header(header::SUBSCRIPTION) {
            Some("q") => {
                assert_eq!(body(&msg), format!("q-{next_q}"));
                next_q += 1;
            }
            Some("t") => {
                assert_eq!(body(&msg), format!("t-{next_t}"));
                next_t += 1;
            }
            other => panic!("unexpected subscription {other:?}"),
        }
    }
    sender.disconnect().await;
    receiver.disconnect().await;
}
