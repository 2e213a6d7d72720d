#![allow(dead_code)]

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Once};
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use stompd::core::auth::Authenticator;
use stompd::core::frame::{encode_frame, header, try_decode_frame, StompItem};
use stompd::{Command, Frame, MemoryQueueStorage, QueueStorage, Server, ServerConfig};

pub const STEP: Duration = Duration::from_secs(5);

pub fn init_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        stompd::logging::try_init_logging();
    });
}

/// Server settings tuned for fast tests: short polls, no heart-beats.
pub fn test_config() -> ServerConfig {
    let mut cfg = ServerConfig {
        listen_addr: "127.0.0.1:0".to_string(),
        ..ServerConfig::default()
    };
    cfg.session.heartbeat = Duration::ZERO;
    cfg.session.connect_timeout = Duration::from_secs(2);
    cfg.session.queue_poll_min = Duration::from_millis(1);
    cfg.session.queue_poll_max = Duration::from_millis(10);
    cfg
}

pub struct TestServer {
    pub server: Arc<Server>,
    pub addr: SocketAddr,
    pub handle: JoinHandle<std::io::Result<()>>,
}

impl TestServer {
    pub async fn start(config: ServerConfig) -> Self {
        Self::start_with(config, Arc::new(MemoryQueueStorage::new()), None).await
    }

    pub async fn start_with(
        config: ServerConfig,
        storage: Arc<dyn QueueStorage>,
        authenticator: Option<Arc<dyn Authenticator>>,
    ) -> Self {
        init_logging();
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind ephemeral failed");
        let addr = listener.local_addr().expect("local addr");
        let server = Arc::new(Server::new(config, storage, authenticator));
        let handle = {
            let server = server.clone();
            tokio::spawn(async move { server.serve(listener).await })
        };
        Self {
            server,
            addr,
            handle,
        }
    }

    pub async fn client(&self) -> TestClient<TcpStream> {
        TestClient::connect_tcp(self.addr).await
    }

    /// Connected client that has completed the CONNECT handshake.
    pub async fn connected_client(&self) -> TestClient<TcpStream> {
        let mut client = self.client().await;
        client.handshake().await;
        client
    }
}

/// Polls `cond` until it holds or `STEP` elapses.
pub async fn eventually<F>(mut cond: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + STEP;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    cond()
}

pub fn connect_frame() -> Frame {
    Frame::new(Command::Connect)
        .with_header(header::ACCEPT_VERSION, "1.2")
        .with_header(header::HOST, "/")
        .with_header(header::HEART_BEAT, "0,0")
}

pub struct TestClient<S> {
    stream: S,
    buf: BytesMut,
    pending: VecDeque<Frame>,
    next_receipt: u64,
}

impl TestClient<TcpStream> {
    pub async fn connect_tcp(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr)
            .await
            .expect("failed to connect to server");
        Self::new(stream)
    }
}

impl<S> TestClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            buf: BytesMut::with_capacity(4096),
            pending: VecDeque::new(),
            next_receipt: 1,
        }
    }

    pub async fn send(&mut self, frame: &Frame) {
        let mut buf = BytesMut::new();
        encode_frame(frame, &mut buf);
        self.send_raw(&buf).await;
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.stream
            .write_all(bytes)
            .await
            .expect("failed to write frame");
        self.stream.flush().await.expect("flush");
    }

    /// Next decoded item, `None` once the server closed the stream.
    pub async fn recv_item(&mut self) -> Option<StompItem> {
        loop {
            if let Some(item) =
                try_decode_frame(&mut self.buf, usize::MAX).expect("decode failed")
            {
                return Some(item);
            }
            match self.stream.read_buf(&mut self.buf).await {
                Ok(0) | Err(_) => return None,
                Ok(_) => {}
            }
        }
    }

    /// Next frame, skipping heart-beats.
    pub async fn recv(&mut self) -> Option<Frame> {
        if let Some(frame) = self.pending.pop_front() {
            return Some(frame);
        }
        loop {
            match self.recv_item().await? {
                StompItem::Frame(frame) => return Some(frame),
                StompItem::Heartbeat => continue,
            }
        }
    }

    /// Next frame within `wait`; `None` on timeout or close.
    pub async fn recv_within(&mut self, wait: Duration) -> Option<Frame> {
        tokio::time::timeout(wait, self.recv()).await.ok().flatten()
    }

    pub async fn expect(&mut self, command: Command) -> Frame {
        let frame = self
            .recv_within(STEP)
            .await
            .unwrap_or_else(|| panic!("expected {command} frame"));
        assert_eq!(frame.command, command, "unexpected frame: {frame}");
        frame
    }

    /// Waits for RECEIPT `id`, keeping other frames for later `recv` calls.
    pub async fn expect_receipt(&mut self, id: &str) {
        loop {
            let frame = tokio::time::timeout(STEP, self.recv_raw_frame())
                .await
                .ok()
                .flatten()
                .unwrap_or_else(|| panic!("expected RECEIPT {id}"));
            match frame.command {
                Command::Receipt if frame.header(header::RECEIPT_ID) == Some(id) => return,
                Command::Error => panic!("expected RECEIPT {id}, got {frame}"),
                _ => self.pending.push_back(frame),
            }
        }
    }

    async fn recv_raw_frame(&mut self) -> Option<Frame> {
        loop {
            match self.recv_item().await? {
                StompItem::Frame(frame) => return Some(frame),
                StompItem::Heartbeat => continue,
            }
        }
    }

    fn receipt_id(&mut self) -> String {
        let id = format!("r-{}", self.next_receipt);
        self.next_receipt += 1;
        id
    }

    pub async fn handshake(&mut self) -> Frame {
        self.send(&connect_frame()).await;
        self.expect(Command::Connected).await
    }

    /// Subscribes and waits until the server has processed it.
    pub async fn subscribe(&mut self, destination: &str, id: &str, ack: &str) {
        let receipt = self.receipt_id();
        let frame = Frame::new(Command::Subscribe)
            .with_header(header::DESTINATION, destination)
            .with_header(header::ID, id)
            .with_header(header::ACK, ack)
            .with_header(header::RECEIPT, receipt.clone());
        self.send(&frame).await;
        self.expect_receipt(&receipt).await;
    }

    pub async fn unsubscribe(&mut self, id: &str) {
        let receipt = self.receipt_id();
        let frame = Frame::new(Command::Unsubscribe)
            .with_header(header::ID, id)
            .with_header(header::RECEIPT, receipt.clone());
        self.send(&frame).await;
        self.expect_receipt(&receipt).await;
    }

    pub async fn send_text(&mut self, destination: &str, body: &str) {
        let frame = Frame::new(Command::Send)
            .with_header(header::DESTINATION, destination)
            .with_header(header::CONTENT_TYPE, "text/plain")
            .with_body(body.to_string());
        self.send(&frame).await;
    }

    /// Sends and waits for the receipt, so the message has been routed.
    pub async fn send_confirmed(&mut self, destination: &str, body: &str) {
        let receipt = self.receipt_id();
        let frame = Frame::new(Command::Send)
            .with_header(header::DESTINATION, destination)
            .with_header(header::RECEIPT, receipt.clone())
            .with_body(body.to_string());
        self.send(&frame).await;
        self.expect_receipt(&receipt).await;
    }

    pub async fn ack(&mut self, id: &str) {
        let receipt = self.receipt_id();
        let frame = Frame::new(Command::Ack)
            .with_header(header::ID, id)
            .with_header(header::RECEIPT, receipt.clone());
        self.send(&frame).await;
        self.expect_receipt(&receipt).await;
    }

    pub async fn nack(&mut self, id: &str) {
        let receipt = self.receipt_id();
        let frame = Frame::new(Command::Nack)
            .with_header(header::ID, id)
            .with_header(header::RECEIPT, receipt.clone());
        self.send(&frame).await;
        self.expect_receipt(&receipt).await;
    }

    /// DISCONNECT with a receipt, then waits for the server to close.
    pub async fn disconnect(mut self) {
        let frame = Frame::new(Command::Disconnect).with_header(header::RECEIPT, "bye");
        self.send(&frame).await;
        self.expect_receipt("bye").await;
        assert!(self.closed_within(STEP).await, "server kept the connection open");
    }

    /// True when the server closes the stream within `wait`. Frames received
    /// meanwhile are discarded.
    pub async fn closed_within(&mut self, wait: Duration) -> bool {
        let drain = async {
            while self.recv_item().await.is_some() {}
        };
        tokio::time::timeout(wait, drain).await.is_ok()
    }
}

pub fn body(frame: &Frame) -> &str {
    std::str::from_utf8(&frame.body).expect("utf8 body")
}
