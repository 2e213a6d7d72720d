//! Connection handling: the accept loop, per-connection sessions and their
//! queue delivery loops.

mod delivery;
mod error;
pub mod heartbeat;
mod inflight;
pub mod server;
pub mod session;
pub mod version;
mod writer;

pub use error::SessionError;
pub use heartbeat::HeartBeat;
pub use server::{Server, ServerConfig};
pub use session::{Session, SessionConfig, SessionContext, SessionState};
pub use version::ProtocolVersion;
