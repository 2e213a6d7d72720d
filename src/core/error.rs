use thiserror::Error;

/// Failures reported by a [`QueueStorage`](crate::core::queue::QueueStorage) backend.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("queue storage has been stopped")]
    Stopped,

    #[error("queue {queue} is full ({depth} messages)")]
    QueueFull { queue: String, depth: usize },

    #[error("storage backend error: {0}")]
    Backend(String),
}
