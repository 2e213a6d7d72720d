use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use flume::{Sender, TrySendError};
use tracing::{debug, warn};

use crate::core::frame::Frame;
use crate::core::subscription::{delivery_frame, AckMode, SubscriptionId};

/// What happens when a subscriber's delivery buffer is full at broadcast time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Skip the message for that subscriber only.
    Drop,
    /// Wait up to the given duration for buffer space, then drop.
    Block(Duration),
}

/// A session's registration on one topic.
#[derive(Debug, Clone)]
pub struct TopicListener {
    pub session_id: String,
    /// Subscription id chosen by the client; copied into the `subscription` header.
    pub client_subscription: String,
    pub ack: AckMode,
    pub sender: Sender<Frame>,
}

#[derive(Debug)]
struct Registration {
    id: SubscriptionId,
    listener: TopicListener,
}

/// [`TopicRegistry`] keeps the live subscriber list of every topic.
///
/// Subscribers are stored in registration order. Broadcast copies the list out
/// of the map before delivering, so no shard lock is held while a subscriber's
/// channel is being fed.
#[derive(Debug)]
pub struct TopicRegistry {
    topics: DashMap<String, Vec<Arc<Registration>>>,
    next_id: AtomicU64,
    policy: OverflowPolicy,
    dropped_total: AtomicU64,
}

impl Default for TopicRegistry {
    fn default() -> Self {
        Self::new(OverflowPolicy::Drop)
    }
}

impl TopicRegistry {
    pub fn new(policy: OverflowPolicy) -> Self {
        Self {
            topics: DashMap::new(),
            next_id: AtomicU64::new(1),
            policy,
            dropped_total: AtomicU64::new(0),
        }
    }

    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    /// Registers a listener and returns the id used to unsubscribe it later.
    pub fn subscribe(&self, destination: &str, listener: TopicListener) -> SubscriptionId {
        let id = SubscriptionId::from_raw(self.next_id.fetch_add(1, Ordering::Relaxed));
        debug!(
            destination,
            subscription = %id,
            session = %listener.session_id,
            ack = %listener.ack,
            "topic subscribe"
        );
        self.topics
            .entry(destination.to_string())
            .or_default()
            .push(Arc::new(Registration { id, listener }));
        id
    }

    /// Removes a listener. Unknown ids are ignored, so repeated calls are harmless.
    pub fn unsubscribe(&self, destination: &str, id: SubscriptionId) {
        if let Some(mut subs) = self.topics.get_mut(destination) {
            subs.retain(|r| r.id != id);
        }
        self.topics.remove_if(destination, |_, subs| subs.is_empty());
    }

    /// Hands a copy of `frame` to every current subscriber of `destination`, in
    /// registration order. Returns how many subscribers accepted it.
    pub async fn broadcast(&self, destination: &str, frame: &Frame) -> usize {
        let snapshot: Vec<Arc<Registration>> = match self.topics.get(destination) {
            Some(subs) => subs.clone(),
            None => return 0,
        };

        let mut delivered = 0;
        let mut gone = Vec::new();

        for reg in snapshot {
            let l = &reg.listener;
            let msg = delivery_frame(frame, &l.client_subscription, l.ack);
            let outcome = match self.policy {
                OverflowPolicy::Drop => match l.sender.try_send(msg) {
                    Ok(()) => Delivery::Accepted,
                    Err(TrySendError::Full(_)) => Delivery::Dropped,
                    Err(TrySendError::Disconnected(_)) => Delivery::Gone,
                },
                OverflowPolicy::Block(wait) => {
                    match tokio::time::timeout(wait, l.sender.send_async(msg)).await {
                        Ok(Ok(())) => Delivery::Accepted,
                        Ok(Err(_)) => Delivery::Gone,
                        Err(_) => Delivery::Dropped,
                    }
                }
            };

            match outcome {
                Delivery::Accepted => delivered += 1,
                Delivery::Dropped => {
                    self.dropped_total.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        destination,
                        session = %l.session_id,
                        subscription = %l.client_subscription,
                        "subscriber buffer full; message dropped"
                    );
                }
                Delivery::Gone => gone.push(reg.id),
            }
        }

        for id in gone {
            debug!(destination, subscription = %id, "pruning disconnected subscriber");
            self.unsubscribe(destination, id);
        }

        delivered
    }

    pub fn subscriber_count(&self, destination: &str) -> usize {
        self.topics.get(destination).map_or(0, |subs| subs.len())
    }

    pub fn is_subscribed(&self, destination: &str, id: SubscriptionId) -> bool {
        self.topics
            .get(destination)
            .is_some_and(|subs| subs.iter().any(|r| r.id == id))
    }

    /// Lists all topics that currently have at least one subscriber.
    pub fn list_topics(&self) -> Vec<String> {
        self.topics.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Messages skipped because a subscriber's buffer stayed full.
    pub fn dropped_total(&self) -> u64 {
        self.dropped_total.load(Ordering::Relaxed)
    }
}

enum Delivery {
    Accepted,
    Dropped,
    Gone,
}
