//! Delivered but unacknowledged queue messages of one session.

use std::collections::BTreeMap;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::core::frame::Frame;
use crate::core::subscription::AckMode;

#[derive(Debug, Clone)]
pub(crate) struct InFlightEntry {
    pub message_id: String,
    pub subscription: String,
    pub queue: String,
    pub ack: AckMode,
    /// Frame as it was dequeued, without per-subscription headers.
    pub frame: Frame,
}

/// Entries are keyed by delivery sequence so settling and requeueing can
/// respect delivery order.
#[derive(Debug, Default)]
pub(crate) struct InFlight {
    inner: Mutex<Inner>,
    released: Notify,
}

#[derive(Debug, Default)]
struct Inner {
    next_seq: u64,
    entries: BTreeMap<u64, InFlightEntry>,
}

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&self, entry: InFlightEntry) {
        let mut inner = self.inner.lock();
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.entries.insert(seq, entry);
    }

    pub fn count_for(&self, subscription: &str) -> usize {
        self.inner
            .lock()
            .entries
            .values()
            .filter(|e| e.subscription == subscription)
            .count()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Removes the entries covered by an ACK or NACK of `message_id`, in
    /// delivery order. For `client` subscriptions this includes every earlier
    /// message of the same subscription. Returns `None` for unknown ids.
    pub fn settle(&self, message_id: &str, subscription: Option<&str>) -> Option<Vec<InFlightEntry>> {
        let settled = {
            let mut inner = self.inner.lock();
            let (&seq, target) = inner.entries.iter().find(|(_, e)| {
                e.message_id == message_id && subscription.map_or(true, |s| s == e.subscription)
            })?;

            let keys: Vec<u64> = if target.ack == AckMode::Client {
                let sub = target.subscription.clone();
                inner
                    .entries
                    .range(..=seq)
                    .filter(|(_, e)| e.subscription == sub)
                    .map(|(k, _)| *k)
                    .collect()
            } else {
                vec![seq]
            };

            keys.into_iter()
                .filter_map(|k| inner.entries.remove(&k))
                .collect::<Vec<_>>()
        };
        self.released.notify_waiters();
        Some(settled)
    }

    /// Removes every entry of one subscription, in delivery order.
    pub fn take_subscription(&self, subscription: &str) -> Vec<InFlightEntry> {
        let taken = {
            let mut inner = self.inner.lock();
            let keys: Vec<u64> = inner
                .entries
                .iter()
                .filter(|(_, e)| e.subscription == subscription)
                .map(|(k, _)| *k)
                .collect();
            keys.into_iter()
                .filter_map(|k| inner.entries.remove(&k))
                .collect()
        };
        self.released.notify_waiters();
        taken
    }

    /// Removes everything, in delivery order.
    pub fn take_all(&self) -> Vec<InFlightEntry> {
        let taken = std::mem::take(&mut self.inner.lock().entries)
            .into_values()
            .collect();
        self.released.notify_waiters();
        taken
    }

    /// Waits until `subscription` has fewer than `limit` messages in flight.
    pub async fn wait_below(&self, subscription: &str, limit: usize) {
        loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.count_for(subscription) < limit {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::core::frame::Command;

    fn entry(id: &str, sub: &str, ack: AckMode) -> InFlightEntry {
        InFlightEntry {
            message_id: id.to_string(),
            subscription: sub.to_string(),
            queue: "/queue/q".to_string(),
            ack,
            frame: Frame::new(Command::Message),
        }
    }

    fn ids(entries: &[InFlightEntry]) -> Vec<&str> {
        entries.iter().map(|e| e.message_id.as_str()).collect()
    }

    #[test]
    fn client_mode_settles_cumulatively() {
        let inflight = InFlight::new();
        inflight.track(entry("m1", "a", AckMode::Client));
        inflight.track(entry("x1", "b", AckMode::Client));
        inflight.track(entry("m2", "a", AckMode::Client));
        inflight.track(entry("m3", "a", AckMode::Client));

        let settled = inflight.settle("m2", None).unwrap();
        assert_eq!(ids(&settled), vec!["m1", "m2"]);
        assert_eq!(inflight.count_for("a"), 1);
        assert_eq!(inflight.count_for("b"), 1);
    }

    #[test]
    fn client_individual_settles_one() {
        let inflight = InFlight::new();
        inflight.track(entry("m1", "a", AckMode::ClientIndividual));
        inflight.track(entry("m2", "a", AckMode::ClientIndividual));

        let settled = inflight.settle("m2", Some("a")).unwrap();
        assert_eq!(ids(&settled), vec!["m2"]);
        assert_eq!(inflight.len(), 1);
    }

    #[test]
    fn unknown_or_mismatched_reference_is_none() {
        let inflight = InFlight::new();
        inflight.track(entry("m1", "a", AckMode::Client));
        assert!(inflight.settle("nope", None).is_none());
        assert!(inflight.settle("m1", Some("b")).is_none());
        assert_eq!(inflight.len(), 1);
    }

    #[test]
    fn take_keeps_delivery_order() {
        let inflight = InFlight::new();
        inflight.track(entry("m1", "a", AckMode::Client));
        inflight.track(entry("x1", "b", AckMode::Client));
        inflight.track(entry("m2", "a", AckMode::Client));

        assert_eq!(ids(&inflight.take_subscription("a")), vec!["m1", "m2"]);
        assert_eq!(ids(&inflight.take_all()), vec!["x1"]);
        assert_eq!(inflight.len(), 0);
    }

    #[tokio::test]
    async fn wait_below_wakes_on_settle() {
        let inflight = Arc::new(InFlight::new());
        inflight.track(entry("m1", "a", AckMode::Client));

        let waiter = {
            let inflight = inflight.clone();
            tokio::spawn(async move { inflight.wait_below("a", 1).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        inflight.settle("m1", None);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter woke")
            .unwrap();
    }
}
