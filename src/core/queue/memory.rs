//! In-memory queue storage.
//!
//! Each queue is a `VecDeque` inside a `DashMap` shard, so a dequeue holds the
//! shard's write lock for the pop and competing consumers never see the same
//! frame. A queue drained to empty is dropped from the map.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::info;

use crate::core::error::StorageError;
use crate::core::frame::Frame;
use crate::core::queue::QueueStorage;

#[derive(Debug, Default)]
pub struct MemoryQueueStorage {
    queues: DashMap<String, VecDeque<Frame>>,
    /// Maximum frames per queue accepted by `enqueue`; 0 means unbounded.
    max_depth: usize,
    stopped: AtomicBool,
}

impl MemoryQueueStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_depth(max_depth: usize) -> Self {
        Self {
            max_depth,
            ..Self::default()
        }
    }

    /// Number of frames currently held for `queue`.
    pub fn len(&self, queue: &str) -> usize {
        self.queues.get(queue).map_or(0, |q| q.len())
    }

    pub fn is_empty(&self, queue: &str) -> bool {
        self.len(queue) == 0
    }

    /// Number of queues currently holding at least one frame.
    pub fn queue_count(&self) -> usize {
        self.queues.len()
    }

    fn check_running(&self) -> Result<(), StorageError> {
        if self.stopped.load(Ordering::Acquire) {
            Err(StorageError::Stopped)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl QueueStorage for MemoryQueueStorage {
    async fn enqueue(&self, queue: &str, frame: Frame) -> Result<(), StorageError> {
        self.check_running()?;
        let mut entry = self.queues.entry(queue.to_string()).or_default();
        if self.max_depth > 0 && entry.len() >= self.max_depth {
            return Err(StorageError::QueueFull {
                queue: queue.to_string(),
                depth: entry.len(),
            });
        }
        entry.push_back(frame);
        Ok(())
    }

    // Requeue ignores the depth limit: the frame was already accepted once.
    async fn requeue(&self, queue: &str, frame: Frame) -> Result<(), StorageError> {
        self.check_running()?;
        self.queues
            .entry(queue.to_string())
            .or_default()
            .push_front(frame);
        Ok(())
    }

    async fn dequeue(&self, queue: &str) -> Result<Option<Frame>, StorageError> {
        self.check_running()?;
        let (frame, drained) = match self.queues.get_mut(queue) {
            Some(mut q) => {
                let frame = q.pop_front();
                (frame, q.is_empty())
            }
            None => return Ok(None),
        };
        if drained {
            // Re-checked under the shard lock; a concurrent enqueue keeps the entry.
            self.queues.remove_if(queue, |_, q| q.is_empty());
        }
        Ok(frame)
    }

    async fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        let pending: usize = self.queues.iter().map(|q| q.len()).sum();
        info!(
            queues = self.queues.len(),
            pending, "in-memory queue storage stopped"
        );
    }
}
