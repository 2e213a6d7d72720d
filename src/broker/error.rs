use std::time::Duration;

use thiserror::Error;

use crate::core::frame::FrameDecodeError;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame decode error: {0}")]
    Decode(#[from] FrameDecodeError),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("no frame received within {0:?}")]
    HeartbeatTimeout(Duration),

    #[error("no CONNECT frame received within {0:?}")]
    ConnectTimeout(Duration),

    #[error("authentication denied: {0}")]
    AuthDenied(String),
}

impl SessionError {
    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        SessionError::Protocol(msg.into())
    }

    /// Whether the peer should be told about this error with an ERROR frame.
    /// Transport failures are not reported since the connection is unusable.
    pub fn reports_to_peer(&self) -> bool {
        matches!(
            self,
            SessionError::Decode(_) | SessionError::Protocol(_) | SessionError::AuthDenied(_)
        )
    }
}
