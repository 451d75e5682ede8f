//! In-process publish/subscribe bus with per-delivery acknowledgment.
//!
//! Each published event is wrapped in an [`Envelope`] carrying a fresh id and
//! fanned out to every subscriber of its topic. Delivery is at-least-once per
//! subscriber and there is no redelivery: a handler that fails is logged and
//! its delivery is acknowledged anyway.

use crate::events::{BusEvent, Topic};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct Envelope {
    pub id: Uuid,
    pub topic: Topic,
    pub payload: serde_json::Value,
    pub published_at: DateTime<Utc>,
}

impl Envelope {
    pub fn decode<E: BusEvent>(&self) -> Result<E, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}

#[derive(Default)]
struct AckLedger {
    pending: AtomicUsize,
    acked: AtomicU64,
    dropped: AtomicU64,
}

/// One envelope handed to one subscriber. Must be acknowledged once handled.
pub struct Delivery {
    envelope: Envelope,
    ledger: Arc<AckLedger>,
    settled: bool,
}

impl Delivery {
    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    pub fn ack(mut self) {
        self.settled = true;
        self.ledger.acked.fetch_add(1, Ordering::SeqCst);
        self.ledger.pending.fetch_sub(1, Ordering::SeqCst);
        debug!(envelope_id = %self.envelope.id, topic = %self.envelope.topic, "Bus: delivery acknowledged");
    }
}

impl Drop for Delivery {
    fn drop(&mut self) {
        if !self.settled {
            self.ledger.dropped.fetch_add(1, Ordering::SeqCst);
            self.ledger.pending.fetch_sub(1, Ordering::SeqCst);
            warn!(envelope_id = %self.envelope.id, topic = %self.envelope.topic, "Bus: delivery dropped without ack");
        }
    }
}

#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<HashMap<Topic, Vec<mpsc::UnboundedSender<Delivery>>>>>,
    ledger: Arc<AckLedger>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, topic: Topic) -> mpsc::UnboundedReceiver<Delivery> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        subscribers.entry(topic).or_default().push(tx);
        rx
    }

    /// Serialize `event` and hand it to every current subscriber of its topic.
    /// Returns the envelope id. With no subscribers the event is discarded.
    pub fn publish<E: BusEvent>(&self, event: &E) -> Result<Uuid, serde_json::Error> {
        let envelope = Envelope {
            id: Uuid::new_v4(),
            topic: E::TOPIC,
            payload: serde_json::to_value(event)?,
            published_at: Utc::now(),
        };

        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let Some(targets) = subscribers.get_mut(&E::TOPIC) else {
            debug!(topic = %E::TOPIC, "Bus: no subscribers, event discarded");
            return Ok(envelope.id);
        };

        targets.retain(|tx| {
            self.ledger.pending.fetch_add(1, Ordering::SeqCst);
            let delivery = Delivery {
                envelope: envelope.clone(),
                ledger: self.ledger.clone(),
                settled: false,
            };
            // A failed send returns the delivery, whose Drop settles the ledger.
            tx.send(delivery).is_ok()
        });

        debug!(envelope_id = %envelope.id, topic = %E::TOPIC, subscribers = targets.len(), "Bus: published");
        Ok(envelope.id)
    }

    /// Deliveries handed out and not yet acknowledged or dropped.
    pub fn pending(&self) -> usize {
        self.ledger.pending.load(Ordering::SeqCst)
    }

    pub fn acknowledged(&self) -> u64 {
        self.ledger.acked.load(Ordering::SeqCst)
    }

    /// Deliveries that were discarded before reaching a handler.
    pub fn dropped(&self) -> u64 {
        self.ledger.dropped.load(Ordering::SeqCst)
    }

    /// Wait until no delivery is outstanding. Returns false on timeout.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.pending() == 0 {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Run `handler` for every delivery on `topic`, each in its own tracked task.
    /// Failures are logged; every delivery is acknowledged regardless.
    pub fn spawn_subscriber<F, Fut>(
        &self,
        topic: Topic,
        tracker: &TaskTracker,
        cancel: CancellationToken,
        handler: F,
    ) where
        F: Fn(Envelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let mut rx = self.subscribe(topic);
        let handler = Arc::new(handler);
        let task_tracker = tracker.clone();

        tracker.spawn(async move {
            loop {
                let delivery = tokio::select! {
                    _ = cancel.cancelled() => break,
                    next = rx.recv() => match next {
                        Some(delivery) => delivery,
                        None => break,
                    },
                };

                let handler = handler.clone();
                task_tracker.spawn(async move {
                    let envelope = delivery.envelope().clone();
                    if let Err(e) = (*handler)(envelope.clone()).await {
                        error!(
                            envelope_id = %envelope.id,
                            topic = %envelope.topic,
                            "Bus: handler failed: {:#}",
                            e
                        );
                    }
                    delivery.ack();
                });
            }
            debug!(topic = %topic, "Bus: subscriber stopped");
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{MidnightEvent, SummarizeEvent};
    use crate::models::TopicKey;

    fn summarize(chat_id: i64) -> SummarizeEvent {
        SummarizeEvent {
            chat_id,
            topic: TopicKey::General,
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_publish_fans_out_to_topic_subscribers_only() {
        let bus = EventBus::new();
        let mut a = bus.subscribe(Topic::Summarize);
        let mut b = bus.subscribe(Topic::Summarize);
        let mut other = bus.subscribe(Topic::Midnight);

        let id = bus.publish(&summarize(42)).unwrap();
        assert_eq!(bus.pending(), 2);

        let da = a.recv().await.unwrap();
        let db = b.recv().await.unwrap();
        assert_eq!(da.envelope().id, id);
        assert_eq!(db.envelope().id, id);
        assert!(other.try_recv().is_err());

        let event: SummarizeEvent = da.envelope().decode().unwrap();
        assert_eq!(event.chat_id, 42);

        da.ack();
        db.ack();
        assert_eq!(bus.pending(), 0);
        assert_eq!(bus.acknowledged(), 2);
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_discarded() {
        let bus = EventBus::new();
        bus.publish(&MidnightEvent { triggered_at: Utc::now() }).unwrap();
        assert_eq!(bus.pending(), 0);
    }

    #[tokio::test]
    async fn test_failed_handler_is_still_acknowledged() {
        let bus = EventBus::new();
        let tracker = TaskTracker::new();
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let seen = calls.clone();
        bus.spawn_subscriber(Topic::Summarize, &tracker, cancel.clone(), move |_env| {
            let seen = seen.clone();
            async move {
                seen.fetch_add(1, Ordering::SeqCst);
                anyhow::bail!("boom")
            }
        });

        bus.publish(&summarize(1)).unwrap();
        bus.publish(&summarize(2)).unwrap();
        assert!(bus.wait_idle(Duration::from_secs(2)).await);

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(bus.acknowledged(), 2);

        cancel.cancel();
        tracker.close();
        tracker.wait().await;
    }

    #[tokio::test]
    async fn test_dropped_delivery_settles_ledger() {
        let bus = EventBus::new();
        let rx = bus.subscribe(Topic::Summarize);
        drop(rx);
        bus.publish(&summarize(1)).unwrap();
        assert_eq!(bus.pending(), 0);
        assert_eq!(bus.acknowledged(), 0);
        assert_eq!(bus.dropped(), 1);
    }
}
