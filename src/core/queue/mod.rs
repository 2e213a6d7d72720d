//! Point-to-point queues.
//!
//! Queue contents live in a pluggable [`QueueStorage`] backend. The
//! [`QueueManager`] sits in front of it and owns the message-id policy; it does
//! no buffering of its own.

pub mod manager;
pub mod memory;

pub use manager::QueueManager;
pub use memory::MemoryQueueStorage;

use async_trait::async_trait;

use crate::core::error::StorageError;
use crate::core::frame::Frame;

/// Backing store for named queues.
///
/// Implementations must keep FIFO order for `enqueue`, put `requeue`d frames at
/// the head, and make `dequeue` safe for competing callers on the same queue:
/// no two calls may ever return the same frame. The `message-id` header is set
/// by the [`QueueManager`] and must be stored untouched.
#[async_trait]
pub trait QueueStorage: Send + Sync + 'static {
    /// Appends a frame to the tail of the queue, creating the queue on first use.
    async fn enqueue(&self, queue: &str, frame: Frame) -> Result<(), StorageError>;

    /// Pushes a frame to the head of the queue.
    async fn requeue(&self, queue: &str, frame: Frame) -> Result<(), StorageError>;

    /// Removes the head frame. `Ok(None)` means the queue is empty.
    async fn dequeue(&self, queue: &str) -> Result<Option<Frame>, StorageError>;

    /// Called once before server shutdown.
    async fn stop(&self);
}
