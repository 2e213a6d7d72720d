use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::broker::session::{Session, SessionConfig, SessionContext};
use crate::config::Config;
use crate::core::auth::Authenticator;
use crate::core::queue::{QueueManager, QueueStorage};
use crate::core::topics::{OverflowPolicy, TopicRegistry};

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: String,
    /// Upper bound on concurrently running sessions.
    pub max_connections: usize,
    pub overflow_policy: OverflowPolicy,
    pub session: SessionConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:61613".to_string(),
            max_connections: 1024,
            overflow_policy: OverflowPolicy::Drop,
            session: SessionConfig::default(),
        }
    }
}

impl From<&Config> for ServerConfig {
    fn from(cfg: &Config) -> Self {
        Self {
            listen_addr: cfg.listen_addr(),
            max_connections: cfg.max_connections,
            overflow_policy: cfg.overflow_policy,
            session: SessionConfig {
                heartbeat: Duration::from_millis(cfg.heartbeat_ms),
                heartbeat_tolerance: cfg.heartbeat_tolerance,
                heartbeat_grace: Duration::from_millis(cfg.heartbeat_grace_ms),
                connect_timeout: Duration::from_millis(cfg.connect_timeout_ms),
                max_frame_size: cfg.max_frame_size,
                subscriber_buffer: cfg.subscriber_buffer,
                queue_poll_min: Duration::from_millis(cfg.queue_poll_min_ms),
                queue_poll_max: Duration::from_millis(cfg.queue_poll_max_ms),
                client_ack_prefetch: cfg.client_ack_prefetch,
            },
        }
    }
}

/// Accepts TCP connections and runs one [`Session`] per connection.
///
/// The queue manager and topic registry are created once here and shared by
/// every session.
pub struct Server {
    config: ServerConfig,
    context: Arc<SessionContext>,
    connections: Arc<Semaphore>,
    shutdown: watch::Sender<bool>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl Server {
    pub fn new(
        mut config: ServerConfig,
        storage: Arc<dyn QueueStorage>,
        authenticator: Option<Arc<dyn Authenticator>>,
    ) -> Self {
        let queues = Arc::new(QueueManager::new(storage));
        let topics = Arc::new(TopicRegistry::new(config.overflow_policy));
        let context = Arc::new(SessionContext::new(
            queues,
            topics,
            authenticator,
            config.session.clone(),
        ));
        let (shutdown, _) = watch::channel(false);
        config.max_connections = config.max_connections.min(Semaphore::MAX_PERMITS);
        Self {
            connections: Arc::new(Semaphore::new(config.max_connections)),
            config,
            context,
            shutdown,
            local_addr: Mutex::new(None),
        }
    }

    pub fn queue_manager(&self) -> &Arc<QueueManager> {
        &self.context.queues
    }

    pub fn topic_registry(&self) -> &Arc<TopicRegistry> {
        &self.context.topics
    }

    /// Address the accept loop is bound to, once it is running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    pub fn active_sessions(&self) -> usize {
        self.config.max_connections - self.connections.available_permits()
    }

    /// Binds the configured address and serves until [`Server::stop`].
    pub async fn run(&self) -> std::io::Result<()> {
        let listener = TcpListener::bind(&self.config.listen_addr).await?;
        self.serve(listener).await
    }

    /// Run the accept loop on an existing listener until a shutdown signal is
    /// received, then stop the queue manager.
    pub async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        let local_addr = listener.local_addr()?;
        *self.local_addr.lock() = Some(local_addr);
        info!("stompd listening on {}", local_addr);

        let mut shutdown_rx = self.shutdown.subscribe();

        while !*shutdown_rx.borrow_and_update() {
            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, addr)) => self.spawn_session(stream, addr),
                        Err(err) => {
                            error!("accept error: {}", err);
                        }
                    }
                }
                result = shutdown_rx.changed() => {
                    if result.is_err() {
                        info!("shutdown sender dropped; stopping accept loop");
                        break;
                    }
                    info!("shutdown signal received; stopping accept loop");
                }
            }
        }

        drop(listener);
        self.context.queues.stop().await;
        info!("server stopped");
        Ok(())
    }

    /// Stops accepting connections. Running sessions are left to finish on
    /// their own.
    pub fn stop(&self) {
        self.shutdown.send_replace(true);
    }

    fn spawn_session(&self, stream: TcpStream, addr: SocketAddr) {
        let permit = match self.connections.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                warn!(
                    peer = %addr,
                    limit = self.config.max_connections,
                    "connection limit reached; closing socket"
                );
                return;
            }
        };

        if let Err(err) = stream.set_nodelay(true) {
            debug!("set_nodelay failed for {}: {}", addr, err);
        }

        let session_id = Uuid::new_v4().to_string();
        debug!("accepted connection {} from {}", session_id, addr);

        let session = Session::new(session_id, addr.to_string(), stream, self.context.clone());
        tokio::spawn(async move {
            // Errors are logged inside the session span.
            let _ = session.run().await;
            drop(permit);
        });
    }
}
