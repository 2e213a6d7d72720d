pub mod auth;
pub mod destination;
pub mod error;
pub mod frame;
pub mod queue;
pub mod subscription;
pub mod topics;
