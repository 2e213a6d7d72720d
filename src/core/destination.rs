//! Destination names: `/queue/<name>` for point-to-point delivery,
//! `/topic/<name>` for fan-out. The prefix is part of the identity, so a queue
//! and a topic with the same suffix never collide.

use std::fmt;

use thiserror::Error;

pub const QUEUE_PREFIX: &str = "/queue/";
pub const TOPIC_PREFIX: &str = "/topic/";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DestinationKind {
    Queue,
    Topic,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Destination {
    kind: DestinationKind,
    name: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DestinationError {
    #[error("destination must start with /queue/ or /topic/: {0}")]
    UnknownPrefix(String),

    #[error("destination name is empty: {0}")]
    EmptyName(String),
}

impl Destination {
    pub fn parse(raw: &str) -> Result<Self, DestinationError> {
        let (kind, suffix) = if let Some(rest) = raw.strip_prefix(QUEUE_PREFIX) {
            (DestinationKind::Queue, rest)
        } else if let Some(rest) = raw.strip_prefix(TOPIC_PREFIX) {
            (DestinationKind::Topic, rest)
        } else {
            return Err(DestinationError::UnknownPrefix(raw.to_string()));
        };

        if suffix.is_empty() {
            return Err(DestinationError::EmptyName(raw.to_string()));
        }

        Ok(Self {
            kind,
            name: raw.to_string(),
        })
    }

    pub fn kind(&self) -> DestinationKind {
        self.kind
    }

    pub fn is_queue(&self) -> bool {
        self.kind == DestinationKind::Queue
    }

    /// Full name including the type prefix.
    pub fn as_str(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}
