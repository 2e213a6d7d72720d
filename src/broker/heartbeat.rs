//! Heart-beat negotiation for the `heart-beat` CONNECT/CONNECTED header.
//!
//! The client offers `cx,cy`: it can send every `cx` ms and wants to receive
//! every `cy` ms. The server has a single configured interval `h` that it uses
//! for both directions. A direction is enabled only when both sides agree on a
//! non-zero value, and then uses the slower of the two.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("malformed heart-beat header: {0:?}")]
pub struct InvalidHeartBeat(pub String);

/// Parses a `send,receive` pair of millisecond intervals.
pub fn parse_heart_beat(raw: &str) -> Result<(u64, u64), InvalidHeartBeat> {
    let invalid = || InvalidHeartBeat(raw.to_string());
    let (send, receive) = raw.split_once(',').ok_or_else(invalid)?;
    let send = send.trim().parse().map_err(|_| invalid())?;
    let receive = receive.trim().parse().map_err(|_| invalid())?;
    Ok((send, receive))
}

/// Negotiated intervals, seen from the server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeartBeat {
    /// How often the server emits heart-beats, 0 when disabled.
    pub send_ms: u64,
    /// How often the server expects traffic from the client, 0 when disabled.
    pub receive_ms: u64,
}

impl HeartBeat {
    pub fn negotiate(server_ms: u64, client: (u64, u64)) -> Self {
        let (client_send, client_receive) = client;
        Self {
            send_ms: combine(server_ms, client_receive),
            receive_ms: combine(server_ms, client_send),
        }
    }

    /// Value for the CONNECTED `heart-beat` header.
    pub fn header_value(&self) -> String {
        format!("{},{}", self.send_ms, self.receive_ms)
    }

    pub fn send_interval(&self) -> Option<Duration> {
        (self.send_ms > 0).then(|| Duration::from_millis(self.send_ms))
    }

    /// Maximum silence accepted from the client before the session is
    /// considered dead: the receive interval scaled by `tolerance`, plus
    /// `grace`. `None` disables the check.
    pub fn read_timeout(&self, tolerance: f64, grace: Duration) -> Option<Duration> {
        if self.receive_ms == 0 {
            return None;
        }
        let scaled = Duration::from_millis(self.receive_ms).mul_f64(tolerance.max(1.0));
        Some(scaled + grace)
    }
}

fn combine(server: u64, client: u64) -> u64 {
    if server == 0 || client == 0 {
        0
    } else {
        server.max(client)
    }
}
