mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::{test_config, TestClient, TestServer, STEP};
use stompd::{Frame, MemoryQueueStorage, QueueStorage, Server, StorageError};

/// Memory storage that counts `stop` calls.
#[derive(Default)]
struct CountingStorage {
    inner: MemoryQueueStorage,
    stops: AtomicUsize,
}

#[async_trait]
impl QueueStorage for CountingStorage {
    async fn enqueue(&self, queue: &str, frame: Frame) -> Result<(), StorageError> {
        self.inner.enqueue(queue, frame).await
    }

    async fn requeue(&self, queue: &str, frame: Frame) -> Result<(), StorageError> {
        self.inner.requeue(queue, frame).await
    }

    async fn dequeue(&self, queue: &str) -> Result<Option<Frame>, StorageError> {
        self.inner.dequeue(queue).await
    }

    async fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.inner.stop().await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stop_ends_accept_loop_and_stops_storage_once() {
    let storage = Arc::new(CountingStorage::default());
    let srv = TestServer::start_with(test_config(), storage.clone(), None).await;

    // A session opened before stop keeps working for topic traffic.
    let mut client = srv.connected_client().await;

    srv.server.stop();
    srv.server.stop();
    tokio::time::timeout(STEP, srv.handle)
        .await
        .expect("accept loop did not stop")
        .expect("server task panicked")
        .expect("server returned an error");
    assert_eq!(storage.stops.load(Ordering::SeqCst), 1);

    // Queue operations now fail; the manager forwards stop only once.
    srv.server.queue_manager().stop().await;
    assert_eq!(storage.stops.load(Ordering::SeqCst), 1);

    client.send_confirmed("/topic/after-stop", "still here").await;
    client.disconnect().await;

    assert!(tokio::net::TcpStream::connect(srv.addr).await.is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stop_before_serve_returns_immediately() {
    common::init_logging();
    let server = Server::new(test_config(), Arc::new(MemoryQueueStorage::new()), None);
    server.stop();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    tokio::time::timeout(Duration::from_secs(1), server.serve(listener))
        .await
        .expect("serve should return after stop")
        .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn connections_over_the_limit_are_closed() {
    let mut cfg = test_config();
    cfg.max_connections = 1;
    let srv = TestServer::start(cfg).await;

    let first = srv.connected_client().await;
    assert_eq!(srv.server.active_sessions(), 1);

    let mut second = TestClient::connect_tcp(srv.addr).await;
    assert!(second.closed_within(STEP).await, "second socket should be closed");

    first.disconnect().await;
    let server = srv.server.clone();
    assert!(common::eventually(|| server.active_sessions() == 0).await);

    let third = srv.connected_client().await;
    third.disconnect().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn local_addr_is_known_once_serving() {
    let srv = TestServer::start(test_config()).await;
    let server = srv.server.clone();
    assert!(common::eventually(|| server.local_addr().is_some()).await);
    assert_eq!(srv.server.local_addr(), Some(srv.addr));
}
