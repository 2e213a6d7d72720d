//! Topic module containing the live-subscriber registry used for fan-out.

pub mod registry;

pub use registry::{OverflowPolicy, TopicListener, TopicRegistry};
