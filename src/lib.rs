//! stompd – a lightweight STOMP message broker written in Rust.
//!
//! This crate exports
//!  * `core`   – frames, destinations, queue storage and topic fan-out
//!  * `broker` – TCP server, per-connection sessions and delivery loops
//!  * `config` – TOML/YAML + environment runtime configuration
//!
//! Downstream applications can embed the broker ([`Server`]) with their own
//! [`QueueStorage`] backend and [`Authenticator`], or use the `stompd` binary.

// ───────────────────────────────────────────────────────────
// Public modules
// ───────────────────────────────────────────────────────────
pub mod broker;
pub mod config;
pub mod core;
pub mod logging;
pub mod util;

// ───────────────────────────────────────────────────────────
// Re-exports
// ───────────────────────────────────────────────────────────
pub use crate::broker::{Server, ServerConfig, SessionError};
pub use crate::config::{Config, ConfigError};
pub use crate::core::auth::{AuthDecision, Authenticator, Credentials, StaticAuthenticator};
pub use crate::core::error::StorageError;
pub use crate::core::frame::{Command, Frame, FrameDecoder};
pub use crate::core::queue::{MemoryQueueStorage, QueueManager, QueueStorage};
pub use crate::core::topics::{OverflowPolicy, TopicRegistry};
