//! One client connection: handshake, inbound frame handling, subscriptions and
//! teardown.
//!
//! The inbound side runs on the session task. Outbound frames (responses,
//! topic fan-out, queue deliveries, heart-beats) all go through one bounded
//! channel drained by a separate writer task, so a slow read never delays a
//! heart-beat and the other way round.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, info, trace, warn, Instrument};

use crate::broker::delivery::QueueDelivery;
use crate::broker::error::SessionError;
use crate::broker::heartbeat::{parse_heart_beat, HeartBeat};
use crate::broker::inflight::{InFlight, InFlightEntry};
use crate::broker::version::ProtocolVersion;
use crate::broker::writer::write_loop;
use crate::core::auth::{AuthDecision, Authenticator, Credentials};
use crate::core::destination::Destination;
use crate::core::frame::{
    encode_frame, header, Command, Frame, FrameDecoder, StompItem, DEFAULT_MAX_FRAME_SIZE,
};
use crate::core::queue::manager::next_message_id;
use crate::core::queue::QueueManager;
use crate::core::subscription::{AckMode, SubscriptionId};
use crate::core::topics::{TopicListener, TopicRegistry};

const INITIAL_BUFFER_SIZE: usize = 8 * 1024;
/// How long teardown waits for the writer to flush before aborting it.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

pub const SERVER_NAME: &str = concat!("stompd/", env!("CARGO_PKG_VERSION"));

/// Per-session tunables.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Heart-beat interval the server offers; zero disables heart-beating.
    pub heartbeat: Duration,
    pub heartbeat_tolerance: f64,
    pub heartbeat_grace: Duration,
    pub connect_timeout: Duration,
    pub max_frame_size: usize,
    /// Capacity of the outbound channel shared by responses and deliveries.
    pub subscriber_buffer: usize,
    pub queue_poll_min: Duration,
    pub queue_poll_max: Duration,
    pub client_ack_prefetch: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            heartbeat: Duration::from_secs(60),
            heartbeat_tolerance: 2.0,
            heartbeat_grace: Duration::from_millis(500),
            connect_timeout: Duration::from_secs(10),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            subscriber_buffer: 1024,
            queue_poll_min: Duration::from_millis(5),
            queue_poll_max: Duration::from_millis(200),
            client_ack_prefetch: 1,
        }
    }
}

/// Process-wide state shared by every session.
pub struct SessionContext {
    pub queues: Arc<QueueManager>,
    pub topics: Arc<TopicRegistry>,
    pub authenticator: Option<Arc<dyn Authenticator>>,
    pub config: SessionConfig,
}

impl SessionContext {
    pub fn new(
        queues: Arc<QueueManager>,
        topics: Arc<TopicRegistry>,
        authenticator: Option<Arc<dyn Authenticator>>,
        config: SessionConfig,
    ) -> Self {
        Self {
            queues,
            topics,
            authenticator,
            config,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unauthenticated,
    Connected,
    Disconnecting,
    Closed,
}

pub struct Session<S> {
    id: String,
    peer: String,
    stream: S,
    ctx: Arc<SessionContext>,
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    pub fn new(
        id: impl Into<String>,
        peer: impl Into<String>,
        stream: S,
        ctx: Arc<SessionContext>,
    ) -> Self {
        Self {
            id: id.into(),
            peer: peer.into(),
            stream,
            ctx,
        }
    }

    /// Drives the connection until it is closed. Every subscription the
    /// session created is released before this returns.
    pub async fn run(self) -> Result<(), SessionError> {
        let span = tracing::info_span!("session", id = %self.id, peer = %self.peer);
        async move {
            let result = self.run_inner().await;
            match &result {
                Ok(()) => info!("session closed"),
                Err(err) => warn!(error = %err, "session closed with error"),
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn run_inner(self) -> Result<(), SessionError> {
        let Session { id, stream, ctx, .. } = self;
        let cfg = ctx.config.clone();
        let (mut reader, mut writer) = tokio::io::split(stream);
        let mut input = FrameInput::new(cfg.max_frame_size);

        let connect = match timeout(
            cfg.connect_timeout,
            next_frame(&mut reader, &mut input),
        )
        .await
        {
            Err(_) => return Err(SessionError::ConnectTimeout(cfg.connect_timeout)),
            Ok(Ok(Some(frame))) => frame,
            Ok(Ok(None)) => {
                debug!("peer closed before CONNECT");
                return Ok(());
            }
            Ok(Err(err)) => {
                reject(&mut writer, &err, None).await;
                return Err(err);
            }
        };

        let handshake = match accept_connect(&id, &connect, &ctx) {
            Ok(handshake) => handshake,
            Err(err) => {
                reject(&mut writer, &err, connect.header(header::RECEIPT)).await;
                return Err(err);
            }
        };
        write_direct(&mut writer, &handshake.connected).await?;
        info!(
            version = %handshake.version,
            heart_beat = %handshake.heart_beat.header_value(),
            identity = handshake.identity.as_deref().unwrap_or("-"),
            "session connected"
        );

        let (out_tx, out_rx) = flume::bounded(cfg.subscriber_buffer.max(1));
        let mut writer_task = tokio::spawn(
            write_loop(writer, out_rx, handshake.heart_beat.send_interval())
                .instrument(tracing::Span::current()),
        );

        let mut conn = Connected {
            id,
            version: handshake.version,
            ctx,
            out: out_tx,
            subscriptions: HashMap::new(),
            inflight: Arc::new(InFlight::new()),
            state: SessionState::Unauthenticated,
        };
        conn.transition(SessionState::Connected);

        let read_timeout = handshake
            .heart_beat
            .read_timeout(cfg.heartbeat_tolerance, cfg.heartbeat_grace);
        let exit = conn
            .read_loop(&mut reader, &mut input, read_timeout, &mut writer_task)
            .await;

        if matches!(exit, Exit::Disconnect { .. }) {
            conn.transition(SessionState::Disconnecting);
        }
        conn.release_all().await;

        let writer_finished = matches!(exit, Exit::WriterClosed(_));
        let result = match exit {
            Exit::Disconnect { receipt } => {
                if let Some(receipt) = receipt {
                    conn.send(Frame::receipt(receipt)).await;
                }
                Ok(())
            }
            Exit::PeerClosed => Ok(()),
            Exit::Failed { error, receipt } => {
                if error.reports_to_peer() {
                    conn.send(error_frame(&error, receipt.as_deref())).await;
                }
                Err(error)
            }
            Exit::WriterClosed(Ok(Ok(()))) => Ok(()),
            Exit::WriterClosed(Ok(Err(err))) => Err(SessionError::Io(err)),
            Exit::WriterClosed(Err(join_err)) => {
                warn!(error = %join_err, "writer task failed");
                Ok(())
            }
        };
        conn.transition(SessionState::Closed);
        // Dropping the last sender lets the writer drain and exit.
        drop(conn);

        if !writer_finished {
            match timeout(WRITER_DRAIN_TIMEOUT, &mut writer_task).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(err))) => debug!(error = %err, "writer closed with error"),
                Ok(Err(join_err)) => warn!(error = %join_err, "writer task failed"),
                Err(_) => {
                    debug!("writer did not drain in time; aborting");
                    writer_task.abort();
                }
            }
        }

        result
    }
}

struct Handshake {
    version: ProtocolVersion,
    heart_beat: HeartBeat,
    identity: Option<String>,
    connected: Frame,
}

/// Validates a CONNECT frame and builds the CONNECTED reply.
fn accept_connect(
    session_id: &str,
    frame: &Frame,
    ctx: &SessionContext,
) -> Result<Handshake, SessionError> {
    if !matches!(frame.command, Command::Connect | Command::Stomp) {
        return Err(SessionError::protocol(format!(
            "expected CONNECT, got {}",
            frame.command
        )));
    }

    let version = ProtocolVersion::negotiate(frame.header(header::ACCEPT_VERSION))
        .ok_or_else(|| SessionError::protocol("unsupported protocol version"))?;

    let client_heart_beat = match frame.header(header::HEART_BEAT) {
        Some(raw) => parse_heart_beat(raw).map_err(|e| SessionError::protocol(e.to_string()))?,
        None => (0, 0),
    };
    let server_ms = u64::try_from(ctx.config.heartbeat.as_millis()).unwrap_or(u64::MAX);
    let heart_beat = HeartBeat::negotiate(server_ms, client_heart_beat);

    let identity = match &ctx.authenticator {
        None => None,
        Some(auth) => {
            let credentials =
                Credentials::new(frame.header(header::LOGIN), frame.header(header::PASSCODE));
            match auth.authenticate(&credentials) {
                AuthDecision::Allow { identity } => identity,
                AuthDecision::Deny { reason } => return Err(SessionError::AuthDenied(reason)),
            }
        }
    };

    let connected = Frame::new(Command::Connected)
        .with_header(header::VERSION, version.as_str())
        .with_header(header::SERVER, SERVER_NAME)
        .with_header(header::SESSION, session_id)
        .with_header(header::HEART_BEAT, heart_beat.header_value());

    Ok(Handshake {
        version,
        heart_beat,
        identity,
        connected,
    })
}

fn error_frame(error: &SessionError, receipt: Option<&str>) -> Frame {
    let frame = Frame::error(error.to_string());
    match receipt {
        Some(id) => frame.with_header(header::RECEIPT_ID, id),
        None => frame,
    }
}

/// Writes an ERROR frame before the writer task exists.
async fn reject<W>(writer: &mut W, error: &SessionError, receipt: Option<&str>)
where
    W: AsyncWrite + Unpin,
{
    if !error.reports_to_peer() {
        return;
    }
    if let Err(err) = write_direct(writer, &error_frame(error, receipt)).await {
        debug!(error = %err, "could not send ERROR frame");
    }
    let _ = writer.shutdown().await;
}

async fn write_direct<W>(writer: &mut W, frame: &Frame) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = BytesMut::with_capacity(256);
    encode_frame(frame, &mut buf);
    writer.write_all(&buf[..]).await?;
    writer.flush().await
}

/// Read buffer plus the decoder tracking how much of it has been scanned.
struct FrameInput {
    buf: BytesMut,
    decoder: FrameDecoder,
}

impl FrameInput {
    fn new(max_frame_size: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(INITIAL_BUFFER_SIZE),
            decoder: FrameDecoder::new(max_frame_size),
        }
    }
}

/// Reads the next item; `Ok(None)` on end of stream.
async fn read_item<R>(
    reader: &mut R,
    input: &mut FrameInput,
) -> Result<Option<StompItem>, SessionError>
where
    R: AsyncRead + Unpin,
{
    loop {
        if let Some(item) = input.decoder.decode(&mut input.buf)? {
            return Ok(Some(item));
        }
        if reader.read_buf(&mut input.buf).await? == 0 {
            if !input.buf.is_empty() {
                debug!(pending = input.buf.len(), "discarding partial frame at end of stream");
            }
            return Ok(None);
        }
    }
}

/// Like [`read_item`], skipping heart-beats.
async fn next_frame<R>(
    reader: &mut R,
    input: &mut FrameInput,
) -> Result<Option<Frame>, SessionError>
where
    R: AsyncRead + Unpin,
{
    loop {
        match read_item(reader, input).await? {
            Some(StompItem::Frame(frame)) => return Ok(Some(frame)),
            Some(StompItem::Heartbeat) => continue,
            None => return Ok(None),
        }
    }
}

enum Exit {
    Disconnect {
        receipt: Option<String>,
    },
    PeerClosed,
    Failed {
        error: SessionError,
        receipt: Option<String>,
    },
    WriterClosed(Result<std::io::Result<()>, tokio::task::JoinError>),
}

enum Flow {
    Continue,
    Disconnect { receipt: Option<String> },
}

enum SubscriptionHandle {
    Topic(SubscriptionId),
    Queue {
        stop: watch::Sender<bool>,
        task: JoinHandle<()>,
    },
}

struct ActiveSubscription {
    destination: Destination,
    ack: AckMode,
    handle: SubscriptionHandle,
}

/// State of a session after a successful handshake.
struct Connected {
    id: String,
    version: ProtocolVersion,
    ctx: Arc<SessionContext>,
    out: flume::Sender<Frame>,
    /// Keyed by the client's subscription id.
    subscriptions: HashMap<String, ActiveSubscription>,
    inflight: Arc<InFlight>,
    state: SessionState,
}

impl Connected {
    fn transition(&mut self, next: SessionState) {
        debug!(from = ?self.state, to = ?next, "session state");
        self.state = next;
    }

    /// Queues a frame for the writer. A closed writer is not an error here:
    /// the read loop notices it separately.
    async fn send(&self, frame: Frame) {
        if self.out.send_async(frame).await.is_err() {
            trace!("writer gone; frame discarded");
        }
    }

    async fn read_loop<R>(
        &mut self,
        reader: &mut R,
        input: &mut FrameInput,
        read_timeout: Option<Duration>,
        writer_task: &mut JoinHandle<std::io::Result<()>>,
    ) -> Exit
    where
        R: AsyncRead + Unpin,
    {
        let mut last_read = Instant::now();

        loop {
            let read = async {
                match read_timeout {
                    Some(window) => timeout_at(
                        last_read + window,
                        read_item(reader, input),
                    )
                    .await
                    .unwrap_or(Err(SessionError::HeartbeatTimeout(window))),
                    None => read_item(reader, input).await,
                }
            };

            tokio::select! {
                item = read => match item {
                    Ok(Some(StompItem::Heartbeat)) => {
                        last_read = Instant::now();
                        trace!("heart-beat received");
                    }
                    Ok(Some(StompItem::Frame(frame))) => {
                        last_read = Instant::now();
                        let receipt = frame.header(header::RECEIPT).map(str::to_string);
                        match self.handle(frame).await {
                            Ok(Flow::Continue) => {}
                            Ok(Flow::Disconnect { receipt }) => return Exit::Disconnect { receipt },
                            Err(error) => return Exit::Failed { error, receipt },
                        }
                    }
                    Ok(None) => {
                        debug!("peer closed the connection");
                        return Exit::PeerClosed;
                    }
                    Err(error) => return Exit::Failed { error, receipt: None },
                },
                result = &mut *writer_task => return Exit::WriterClosed(result),
            }
        }
    }

    async fn handle(&mut self, frame: Frame) -> Result<Flow, SessionError> {
        debug!(command = %frame.command, "frame received");
        let receipt = frame.header(header::RECEIPT).map(str::to_string);

        match frame.command {
            Command::Send => {
                if !self.handle_send(frame).await? {
                    return Ok(Flow::Continue);
                }
            }
            Command::Subscribe => self.handle_subscribe(&frame)?,
            Command::Unsubscribe => self.handle_unsubscribe(&frame).await?,
            Command::Ack => self.handle_ack(&frame, false).await?,
            Command::Nack => self.handle_ack(&frame, true).await?,
            Command::Disconnect => return Ok(Flow::Disconnect { receipt }),
            Command::Begin | Command::Commit | Command::Abort => {
                return Err(SessionError::protocol("transactions are not supported"))
            }
            Command::Connect | Command::Stomp => {
                return Err(SessionError::protocol("session is already connected"))
            }
            other => {
                return Err(SessionError::protocol(format!(
                    "{other} frames cannot be sent by a client"
                )))
            }
        }

        if let Some(id) = receipt {
            self.send(Frame::receipt(id)).await;
        }
        Ok(Flow::Continue)
    }

    /// Routes a SEND. Returns `false` when storage refused the message; the
    /// client has then been sent an ERROR instead of a receipt.
    async fn handle_send(&mut self, frame: Frame) -> Result<bool, SessionError> {
        let destination = parse_destination(&frame)?;

        let mut message = frame;
        message.command = Command::Message;
        let receipt = message.remove_header(header::RECEIPT);
        message.remove_header(header::TRANSACTION);

        if destination.is_queue() {
            match self.ctx.queues.enqueue(destination.as_str(), message).await {
                Ok(message_id) => {
                    debug!(destination = %destination, message_id = %message_id, "enqueued");
                }
                Err(err) => {
                    warn!(destination = %destination, error = %err, "enqueue failed");
                    let mut error =
                        Frame::error(format!("could not enqueue to {destination}: {err}"));
                    if let Some(id) = receipt {
                        error.set_header(header::RECEIPT_ID, id);
                    }
                    self.send(error).await;
                    return Ok(false);
                }
            }
        } else {
            message.set_header(header::MESSAGE_ID, next_message_id());
            let delivered = self
                .ctx
                .topics
                .broadcast(destination.as_str(), &message)
                .await;
            debug!(destination = %destination, delivered, "broadcast");
        }
        Ok(true)
    }

    fn handle_subscribe(&mut self, frame: &Frame) -> Result<(), SessionError> {
        let destination = parse_destination(frame)?;
        let sub_id = match frame.header(header::ID) {
            Some(id) => id.to_string(),
            None if self.version == ProtocolVersion::V1_0 => destination.as_str().to_string(),
            None => return Err(SessionError::protocol("SUBSCRIBE requires an id header")),
        };
        if self.subscriptions.contains_key(&sub_id) {
            return Err(SessionError::protocol(format!(
                "subscription id {sub_id} is already in use"
            )));
        }
        let ack = match frame.header(header::ACK) {
            Some(raw) => raw
                .parse::<AckMode>()
                .map_err(|e| SessionError::protocol(e.to_string()))?,
            None => AckMode::Auto,
        };

        let handle = if destination.is_queue() {
            let cfg = &self.ctx.config;
            let (stop, stop_rx) = watch::channel(false);
            let delivery = QueueDelivery {
                queue: destination.as_str().to_string(),
                subscription: sub_id.clone(),
                ack,
                queues: self.ctx.queues.clone(),
                inflight: self.inflight.clone(),
                out: self.out.clone(),
                stop: stop_rx,
                poll_min: cfg.queue_poll_min,
                poll_max: cfg.queue_poll_max,
                prefetch: cfg.client_ack_prefetch.max(1),
            };
            let task = tokio::spawn(delivery.run().instrument(tracing::Span::current()));
            SubscriptionHandle::Queue { stop, task }
        } else {
            let id = self.ctx.topics.subscribe(
                destination.as_str(),
                TopicListener {
                    session_id: self.id.clone(),
                    client_subscription: sub_id.clone(),
                    ack,
                    sender: self.out.clone(),
                },
            );
            SubscriptionHandle::Topic(id)
        };

        info!(destination = %destination, subscription = %sub_id, ack = %ack, "subscribed");
        self.subscriptions.insert(
            sub_id,
            ActiveSubscription {
                destination,
                ack,
                handle,
            },
        );
        Ok(())
    }

    async fn handle_unsubscribe(&mut self, frame: &Frame) -> Result<(), SessionError> {
        let sub_id = match frame.header(header::ID) {
            Some(id) => id,
            None if self.version == ProtocolVersion::V1_0 => frame
                .header(header::DESTINATION)
                .ok_or_else(|| SessionError::protocol("UNSUBSCRIBE requires an id header"))?,
            None => return Err(SessionError::protocol("UNSUBSCRIBE requires an id header")),
        };

        match self.subscriptions.remove(sub_id) {
            Some(sub) => {
                info!(destination = %sub.destination, subscription = %sub_id, "unsubscribed");
                let sub_id = sub_id.to_string();
                self.release(&sub_id, sub).await;
            }
            None => warn!(subscription = %sub_id, "UNSUBSCRIBE for unknown subscription ignored"),
        }
        Ok(())
    }

    async fn handle_ack(&mut self, frame: &Frame, negative: bool) -> Result<(), SessionError> {
        let message_id = frame
            .header(header::ID)
            .or_else(|| frame.header(header::MESSAGE_ID))
            .ok_or_else(|| {
                SessionError::protocol(format!(
                    "{} requires an id or message-id header",
                    frame.command
                ))
            })?;

        match self
            .inflight
            .settle(message_id, frame.header(header::SUBSCRIPTION))
        {
            None => {
                warn!(message_id, command = %frame.command, "acknowledgement of unknown message ignored")
            }
            Some(entries) if negative => {
                debug!(message_id, count = entries.len(), "nacked; requeueing");
                self.requeue(entries).await;
            }
            Some(entries) => debug!(message_id, count = entries.len(), "acked"),
        }
        Ok(())
    }

    /// Releases one subscription: topic listeners are unregistered, queue
    /// loops are stopped and their unacknowledged frames requeued.
    async fn release(&mut self, sub_id: &str, sub: ActiveSubscription) {
        match sub.handle {
            SubscriptionHandle::Topic(id) => {
                self.ctx.topics.unsubscribe(sub.destination.as_str(), id);
            }
            SubscriptionHandle::Queue { stop, task } => {
                let _ = stop.send(true);
                if let Err(err) = task.await {
                    warn!(error = %err, "delivery loop failed");
                }
                if sub.ack.requires_ack() {
                    let entries = self.inflight.take_subscription(sub_id);
                    self.requeue(entries).await;
                }
            }
        }
    }

    async fn release_all(&mut self) {
        let subscriptions: Vec<_> = self.subscriptions.drain().collect();

        // Signal every loop first so they wind down together.
        for (_, sub) in &subscriptions {
            if let SubscriptionHandle::Queue { stop, .. } = &sub.handle {
                let _ = stop.send(true);
            }
        }
        for (_, sub) in subscriptions {
            match sub.handle {
                SubscriptionHandle::Topic(id) => {
                    self.ctx.topics.unsubscribe(sub.destination.as_str(), id);
                }
                SubscriptionHandle::Queue { task, .. } => {
                    if let Err(err) = task.await {
                        warn!(error = %err, "delivery loop failed");
                    }
                }
            }
        }

        let pending = self.inflight.take_all();
        if !pending.is_empty() {
            info!(count = pending.len(), "requeueing unacknowledged messages");
        }
        self.requeue(pending).await;
        debug_assert_eq!(self.inflight.len(), 0);
    }

    /// Returns frames to the head of their queues. Entries are given in
    /// delivery order and pushed back newest first, so the queue sees them in
    /// their original order again.
    async fn requeue(&self, entries: Vec<InFlightEntry>) {
        for entry in entries.into_iter().rev() {
            if let Err(err) = self.ctx.queues.requeue(&entry.queue, entry.frame).await {
                warn!(
                    queue = %entry.queue,
                    message_id = %entry.message_id,
                    error = %err,
                    "requeue failed"
                );
            }
        }
    }
}

fn parse_destination(frame: &Frame) -> Result<Destination, SessionError> {
    let raw = frame.header(header::DESTINATION).ok_or_else(|| {
        SessionError::protocol(format!("{} requires a destination header", frame.command))
    })?;
    Destination::parse(raw).map_err(|e| SessionError::protocol(e.to_string()))
}
