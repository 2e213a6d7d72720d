//! Runtime configuration.
//!
//! Values come from an optional TOML or YAML file (chosen by extension) and are
//! then overridden by `STOMPD_*` environment variables. Every key is optional.

use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tokio::sync::Semaphore;

use crate::core::auth::StaticAuthenticator;
use crate::core::frame::DEFAULT_MAX_FRAME_SIZE;
use crate::core::topics::OverflowPolicy;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct UserEntry {
    pub login: String,
    pub passcode: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub port: u16,
    /// Heartbeat interval offered to clients; 0 disables heartbeating.
    pub heartbeat_ms: u64,
    /// Multiplier applied to the negotiated receive interval.
    pub heartbeat_tolerance: f64,
    /// Fixed slack added on top of the scaled receive interval.
    pub heartbeat_grace_ms: u64,
    pub connect_timeout_ms: u64,
    pub max_connections: usize,
    pub max_frame_size: usize,
    /// Capacity of each session's outbound delivery buffer.
    pub subscriber_buffer: usize,
    pub overflow_policy: OverflowPolicy,
    pub queue_poll_min_ms: u64,
    pub queue_poll_max_ms: u64,
    pub client_ack_prefetch: usize,
    /// 0 means unbounded.
    pub max_queue_depth: usize,
    pub users: Vec<UserEntry>,
}

#[derive(Debug, Deserialize, Clone, Default)]
struct FileConfig {
    pub bind_addr: Option<String>,
    pub port: Option<u16>,
    pub heartbeat_ms: Option<u64>,
    pub heartbeat_tolerance: Option<f64>,
    pub heartbeat_grace_ms: Option<u64>,
    pub connect_timeout_ms: Option<u64>,
    pub max_connections: Option<usize>,
    pub max_frame_size: Option<usize>,
    pub subscriber_buffer: Option<usize>,
    pub overflow_policy: Option<String>,
    pub overflow_block_ms: Option<u64>,
    pub queue_poll_min_ms: Option<u64>,
    pub queue_poll_max_ms: Option<u64>,
    pub client_ack_prefetch: Option<usize>,
    pub max_queue_depth: Option<usize>,
    pub users: Option<Vec<UserEntry>>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("config parse error: {0}")]
    Parse(String),
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1".to_string(),
            port: 61613,
            heartbeat_ms: 60_000,
            heartbeat_tolerance: 2.0,
            heartbeat_grace_ms: 500,
            connect_timeout_ms: 10_000,
            max_connections: 1024,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            subscriber_buffer: 1024,
            overflow_policy: OverflowPolicy::Drop,
            queue_poll_min_ms: 5,
            queue_poll_max_ms: 200,
            client_ack_prefetch: 1,
            max_queue_depth: 0,
            users: Vec::new(),
        }
    }
}

impl Config {
    fn load_file<P: AsRef<Path>>(path: P) -> Result<FileConfig, ConfigError> {
        let path_ref = path.as_ref();
        let raw = fs::read_to_string(path_ref)?;
        let ext = path_ref
            .extension()
            .and_then(|s| s.to_str())
            .unwrap_or("toml")
            .to_ascii_lowercase();

        if ext == "yaml" || ext == "yml" {
            let cfg: FileConfig = serde_yaml::from_str(&raw)?;
            Ok(cfg)
        } else {
            let cfg: FileConfig = toml::from_str(&raw)?;
            Ok(cfg)
        }
    }

    /// Load configuration from an optional file path and environment variables.
    ///
    /// Precedence: built-in defaults, then file values, then `STOMPD_*` variables.
    /// Without an explicit path, `STOMPD_CONFIG` names the file.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        Self::load_with_env(path, |key| env::var(key).ok())
    }

    /// Same as [`Config::load`] with a custom environment lookup.
    pub fn load_with_env<F>(path: Option<&str>, env_var: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let effective_path = path.map(str::to_string).or_else(|| env_var("STOMPD_CONFIG"));
        let file_cfg = match effective_path {
            Some(p) => Self::load_file(p)?,
            None => FileConfig::default(),
        };

        let defaults = Config::default();

        let mut bind_addr = file_cfg.bind_addr.unwrap_or(defaults.bind_addr);
        let mut port = file_cfg.port.unwrap_or(defaults.port);
        let mut heartbeat_ms = file_cfg.heartbeat_ms.unwrap_or(defaults.heartbeat_ms);
        let mut heartbeat_tolerance = file_cfg
            .heartbeat_tolerance
            .unwrap_or(defaults.heartbeat_tolerance);
        let mut heartbeat_grace_ms = file_cfg
            .heartbeat_grace_ms
            .unwrap_or(defaults.heartbeat_grace_ms);
        let mut connect_timeout_ms = file_cfg
            .connect_timeout_ms
            .unwrap_or(defaults.connect_timeout_ms);
        let mut max_connections = file_cfg.max_connections.unwrap_or(defaults.max_connections);
        let mut max_frame_size = file_cfg.max_frame_size.unwrap_or(defaults.max_frame_size);
        let mut subscriber_buffer = file_cfg
            .subscriber_buffer
            .unwrap_or(defaults.subscriber_buffer);
        let mut overflow_policy = file_cfg.overflow_policy.unwrap_or_else(|| "drop".to_string());
        let mut overflow_block_ms = file_cfg.overflow_block_ms.unwrap_or(100);
        let mut queue_poll_min_ms = file_cfg
            .queue_poll_min_ms
            .unwrap_or(defaults.queue_poll_min_ms);
        let mut queue_poll_max_ms = file_cfg
            .queue_poll_max_ms
            .unwrap_or(defaults.queue_poll_max_ms);
        let mut client_ack_prefetch = file_cfg
            .client_ack_prefetch
            .unwrap_or(defaults.client_ack_prefetch);
        let mut max_queue_depth = file_cfg.max_queue_depth.unwrap_or(defaults.max_queue_depth);
        let mut users = file_cfg.users.unwrap_or_default();

        // Env overrides.
        if let Some(v) = env_var("STOMPD_BIND_ADDR") {
            bind_addr = v;
        }
        if let Some(v) = env_var("STOMPD_PORT") {
            port = parse_env("STOMPD_PORT", &v)?;
        }
        if let Some(v) = env_var("STOMPD_HEARTBEAT_MS") {
            heartbeat_ms = parse_env("STOMPD_HEARTBEAT_MS", &v)?;
        }
        if let Some(v) = env_var("STOMPD_HEARTBEAT_TOLERANCE") {
            heartbeat_tolerance = parse_env("STOMPD_HEARTBEAT_TOLERANCE", &v)?;
        }
        if let Some(v) = env_var("STOMPD_HEARTBEAT_GRACE_MS") {
            heartbeat_grace_ms = parse_env("STOMPD_HEARTBEAT_GRACE_MS", &v)?;
        }
        if let Some(v) = env_var("STOMPD_CONNECT_TIMEOUT_MS") {
            connect_timeout_ms = parse_env("STOMPD_CONNECT_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = env_var("STOMPD_MAX_CONNECTIONS") {
            max_connections = parse_env("STOMPD_MAX_CONNECTIONS", &v)?;
        }
        if let Some(v) = env_var("STOMPD_MAX_FRAME_SIZE") {
            max_frame_size = parse_env("STOMPD_MAX_FRAME_SIZE", &v)?;
        }
        if let Some(v) = env_var("STOMPD_SUBSCRIBER_BUFFER") {
            subscriber_buffer = parse_env("STOMPD_SUBSCRIBER_BUFFER", &v)?;
        }
        if let Some(v) = env_var("STOMPD_OVERFLOW_POLICY") {
            overflow_policy = v;
        }
        if let Some(v) = env_var("STOMPD_OVERFLOW_BLOCK_MS") {
            overflow_block_ms = parse_env("STOMPD_OVERFLOW_BLOCK_MS", &v)?;
        }
        if let Some(v) = env_var("STOMPD_QUEUE_POLL_MIN_MS") {
            queue_poll_min_ms = parse_env("STOMPD_QUEUE_POLL_MIN_MS", &v)?;
        }
        if let Some(v) = env_var("STOMPD_QUEUE_POLL_MAX_MS") {
            queue_poll_max_ms = parse_env("STOMPD_QUEUE_POLL_MAX_MS", &v)?;
        }
        if let Some(v) = env_var("STOMPD_CLIENT_ACK_PREFETCH") {
            client_ack_prefetch = parse_env("STOMPD_CLIENT_ACK_PREFETCH", &v)?;
        }
        if let Some(v) = env_var("STOMPD_MAX_QUEUE_DEPTH") {
            max_queue_depth = parse_env("STOMPD_MAX_QUEUE_DEPTH", &v)?;
        }
        if let Some(v) = env_var("STOMPD_USERS") {
            users = parse_users(&v)?;
        }

        if !(heartbeat_tolerance.is_finite() && heartbeat_tolerance >= 1.0) {
            return Err(ConfigError::Parse(format!(
                "heartbeat_tolerance must be >= 1.0, got {heartbeat_tolerance}"
            )));
        }
        if subscriber_buffer == 0 {
            return Err(ConfigError::Parse("subscriber_buffer must be > 0".into()));
        }
        if client_ack_prefetch == 0 {
            return Err(ConfigError::Parse("client_ack_prefetch must be > 0".into()));
        }
        if queue_poll_min_ms == 0 {
            return Err(ConfigError::Parse("queue_poll_min_ms must be > 0".into()));
        }
        if !(1..=Semaphore::MAX_PERMITS).contains(&max_connections) {
            return Err(ConfigError::Parse(format!(
                "max_connections must be between 1 and {}, got {max_connections}",
                Semaphore::MAX_PERMITS
            )));
        }

        let overflow_policy = match overflow_policy.trim().to_ascii_lowercase().as_str() {
            "drop" => OverflowPolicy::Drop,
            "block" => OverflowPolicy::Block(Duration::from_millis(overflow_block_ms)),
            other => {
                return Err(ConfigError::Parse(format!(
                    "overflow_policy must be `drop` or `block`, got `{other}`"
                )))
            }
        };

        Ok(Config {
            bind_addr,
            port,
            heartbeat_ms,
            heartbeat_tolerance,
            heartbeat_grace_ms,
            connect_timeout_ms,
            max_connections,
            max_frame_size,
            subscriber_buffer,
            overflow_policy,
            queue_poll_min_ms,
            queue_poll_max_ms,
            client_ack_prefetch,
            max_queue_depth,
            users,
        })
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind_addr, self.port)
    }

    /// Authenticator for the configured users; `None` accepts every client.
    pub fn authenticator(&self) -> Option<StaticAuthenticator> {
        if self.users.is_empty() {
            return None;
        }
        Some(StaticAuthenticator::from_pairs(
            self.users
                .iter()
                .map(|u| (u.login.clone(), u.passcode.clone())),
        ))
    }
}

fn parse_env<T>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e| ConfigError::Parse(format!("{key}: {e}")))
}

/// Parses `login:passcode` pairs separated by commas.
fn parse_users(raw: &str) -> Result<Vec<UserEntry>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|pair| {
            pair.split_once(':')
                .map(|(login, passcode)| UserEntry {
                    login: login.to_string(),
                    passcode: passcode.to_string(),
                })
                .ok_or_else(|| ConfigError::Parse(format!("STOMPD_USERS: bad entry `{pair}`")))
        })
        .collect()
}
