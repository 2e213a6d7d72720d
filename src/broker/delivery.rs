//! Per-subscription queue delivery loop.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, trace, warn};

use crate::broker::inflight::{InFlight, InFlightEntry};
use crate::core::error::StorageError;
use crate::core::frame::{header, Frame};
use crate::core::queue::QueueManager;
use crate::core::subscription::{delivery_frame, AckMode};
use crate::util::PollBackoff;

pub(crate) struct QueueDelivery {
    pub queue: String,
    pub subscription: String,
    pub ack: AckMode,
    pub queues: Arc<QueueManager>,
    pub inflight: Arc<InFlight>,
    pub out: flume::Sender<Frame>,
    pub stop: watch::Receiver<bool>,
    pub poll_min: Duration,
    pub poll_max: Duration,
    pub prefetch: usize,
}

impl QueueDelivery {
    /// Polls the queue and hands frames to the session until stopped.
    ///
    /// In client modes a frame is recorded as in flight before it is handed
    /// to the writer, so teardown requeues it even if delivery was cut short.
    /// Auto-mode frames that could not be handed over are requeued here.
    pub async fn run(mut self) {
        let mut backoff = PollBackoff::new(self.poll_min, self.poll_max);
        let tracked = self.ack.requires_ack();

        loop {
            if *self.stop.borrow() {
                break;
            }

            if tracked {
                tokio::select! {
                    _ = self.inflight.wait_below(&self.subscription, self.prefetch) => {}
                    _ = self.stop.changed() => break,
                }
            }

            let frame = match self.queues.dequeue(&self.queue).await {
                Ok(Some(frame)) => {
                    backoff.reset();
                    frame
                }
                Ok(None) => {
                    if self.pause(backoff.next_delay()).await {
                        break;
                    }
                    continue;
                }
                Err(StorageError::Stopped) => {
                    debug!(queue = %self.queue, "queue storage stopped");
                    break;
                }
                Err(err) => {
                    warn!(queue = %self.queue, error = %err, "dequeue failed; backing off");
                    if self.pause(backoff.next_delay()).await {
                        break;
                    }
                    continue;
                }
            };

            let delivery = delivery_frame(&frame, &self.subscription, self.ack);
            if tracked {
                self.inflight.track(InFlightEntry {
                    message_id: frame
                        .header(header::MESSAGE_ID)
                        .unwrap_or_default()
                        .to_string(),
                    subscription: self.subscription.clone(),
                    queue: self.queue.clone(),
                    ack: self.ack,
                    frame: frame.clone(),
                });
            }

            let handed_over = tokio::select! {
                sent = self.out.send_async(delivery) => sent.is_ok(),
                _ = self.stop.changed() => false,
            };

            if handed_over {
                trace!(queue = %self.queue, subscription = %self.subscription, "delivered");
                continue;
            }

            if !tracked {
                if let Err(err) = self.queues.requeue(&self.queue, frame).await {
                    warn!(queue = %self.queue, error = %err, "failed to requeue undelivered frame");
                }
            }
            break;
        }

        debug!(queue = %self.queue, subscription = %self.subscription, "delivery loop stopped");
    }

    /// Sleeps for `delay`; returns `true` when stopped in the meantime.
    async fn pause(&mut self, delay: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(delay) => false,
            _ = self.stop.changed() => true,
        }
    }
}
