//! QueueManager assigns message identifiers and forwards every operation to
//! the configured [`QueueStorage`] backend, preserving call order.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, info};

use crate::core::error::StorageError;
use crate::core::frame::{header, Frame};
use crate::core::queue::QueueStorage;

/// Process-wide counter so ids stay unique across every manager instance.
static NEXT_MESSAGE_ID: AtomicU64 = AtomicU64::new(1);

/// Allocates a fresh, never-empty message identifier.
pub fn next_message_id() -> String {
    format!("msg-{}", NEXT_MESSAGE_ID.fetch_add(1, Ordering::Relaxed))
}

pub struct QueueManager {
    storage: Arc<dyn QueueStorage>,
    stopped: AtomicBool,
}

impl std::fmt::Debug for QueueManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueManager")
            .field("stopped", &self.stopped.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl QueueManager {
    /// Creates a queue manager on top of the given storage backend.
    pub fn new(storage: Arc<dyn QueueStorage>) -> Self {
        Self {
            storage,
            stopped: AtomicBool::new(false),
        }
    }

    /// Stamps a fresh `message-id` (overwriting any previous one) and appends
    /// the frame to the tail of `queue`. Returns the assigned id.
    pub async fn enqueue(&self, queue: &str, mut frame: Frame) -> Result<String, StorageError> {
        self.ensure_running()?;
        let id = next_message_id();
        frame.set_header(header::MESSAGE_ID, id.clone());
        self.storage.enqueue(queue, frame).await?;
        debug!(queue, message_id = %id, "enqueued");
        Ok(id)
    }

    /// Puts a frame back at the head of `queue`. An existing `message-id` is kept.
    pub async fn requeue(&self, queue: &str, mut frame: Frame) -> Result<(), StorageError> {
        self.ensure_running()?;
        if frame.header(header::MESSAGE_ID).map_or(true, str::is_empty) {
            frame.set_header(header::MESSAGE_ID, next_message_id());
        }
        debug!(
            queue,
            message_id = frame.header(header::MESSAGE_ID).unwrap_or_default(),
            "requeued"
        );
        self.storage.requeue(queue, frame).await
    }

    /// Removes the head frame of `queue`, `Ok(None)` when it is empty.
    pub async fn dequeue(&self, queue: &str) -> Result<Option<Frame>, StorageError> {
        self.ensure_running()?;
        self.storage.dequeue(queue).await
    }

    /// Forwards shutdown to the storage backend. Only the first call has an
    /// effect; afterwards every operation fails with [`StorageError::Stopped`]
    /// without reaching the backend.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("stopping queue storage");
        self.storage.stop().await;
    }

    fn ensure_running(&self) -> Result<(), StorageError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(StorageError::Stopped);
        }
        Ok(())
    }
}
