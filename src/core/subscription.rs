use std::fmt;
use std::str::FromStr;

use thiserror::Error;

use crate::core::frame::{header, Frame};

/// How a consumer confirms it has processed a delivered message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AckMode {
    /// Delivered frames are consumed immediately.
    #[default]
    Auto,
    /// ACK/NACK is cumulative over everything delivered earlier on the subscription.
    Client,
    /// ACK/NACK covers exactly one message.
    ClientIndividual,
}

impl AckMode {
    pub fn as_str(self) -> &'static str {
        match self {
            AckMode::Auto => "auto",
            AckMode::Client => "client",
            AckMode::ClientIndividual => "client-individual",
        }
    }

    /// Client modes hold delivered frames until they are acknowledged.
    pub fn requires_ack(self) -> bool {
        !matches!(self, AckMode::Auto)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid ack mode: {0}")]
pub struct InvalidAckMode(pub String);

impl FromStr for AckMode {
    type Err = InvalidAckMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(AckMode::Auto),
            "client" => Ok(AckMode::Client),
            "client-individual" => Ok(AckMode::ClientIndividual),
            other => Err(InvalidAckMode(other.to_string())),
        }
    }
}

impl fmt::Display for AckMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Registry-assigned identifier of a live topic listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    pub fn value(self) -> u64 {
        self.0
    }

    pub fn from_raw(value: u64) -> Self {
        SubscriptionId(value)
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Builds the copy of a routed frame handed to one subscription: the
/// `subscription` header names the client's id, and client modes get an `ack`
/// header carrying the message-id to acknowledge.
pub fn delivery_frame(frame: &Frame, subscription: &str, ack: AckMode) -> Frame {
    let mut out = frame.clone();
    out.set_header(header::SUBSCRIPTION, subscription);
    if ack.requires_ack() {
        let id = out
            .header(header::MESSAGE_ID)
            .unwrap_or_default()
            .to_string();
        out.set_header(header::ACK, id);
    } else {
        out.remove_header(header::ACK);
    }
    out
}
