//! Topic based publish/subscribe with a shutdown gate.
//!
//! Delivery is synchronous on the publisher's thread. Every publish holds the
//! gate's read lock for its whole delivery, so once [`EventBus::gate`]
//! returns no callback is running and none will run again.

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

pub type Payload = dyn Any + Send + Sync;

pub type Callback = Arc<dyn Fn(&Payload) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Default)]
pub struct EventBus {
    topics: RwLock<HashMap<String, Vec<(SubscriptionId, Callback)>>>,
    gated: RwLock<bool>,
    next_id: AtomicU64,
    dropped: AtomicU64,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("topics", &self.topics.read().len())
            .field("gated", &self.is_gated())
            .field("dropped", &self.dropped_events())
            .finish()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, topic: &str, callback: Callback) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.topics
            .write()
            .entry(topic.to_string())
            .or_default()
            .push((id, callback));
        tracing::debug!(topic, id = id.0, "subscribed");
        id
    }

    /// Subscribe to payloads of type `T`; payloads of any other type are skipped.
    pub fn subscribe_typed<T, F>(&self, topic: &str, callback: F) -> SubscriptionId
    where
        T: Any + Send + Sync,
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.subscribe(
            topic,
            Arc::new(move |payload: &Payload| {
                if let Some(event) = payload.downcast_ref::<T>() {
                    callback(event);
                }
            }),
        )
    }

    /// Remove a subscription. Unknown ids are ignored; returns whether one was removed.
    pub fn unsubscribe(&self, topic: &str, id: SubscriptionId) -> bool {
        let mut topics = self.topics.write();
        let Some(subs) = topics.get_mut(topic) else {
            return false;
        };
        let before = subs.len();
        subs.retain(|(sid, _)| *sid != id);
        let removed = subs.len() != before;
        if subs.is_empty() {
            topics.remove(topic);
        }
        removed
    }

    /// Deliver `payload` to every subscriber of `topic`, unless gated.
    ///
    /// Callback panics propagate to the publisher.
    pub fn publish<T: Any + Send + Sync>(&self, topic: &str, payload: T) {
        // Recursive read so a callback may publish while `gate` waits.
        let gated = self.gated.read_recursive();
        if *gated {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(topic, "event dropped after gate");
            return;
        }

        // Snapshot so callbacks may (un)subscribe without deadlocking.
        let callbacks: Vec<Callback> = match self.topics.read().get(topic) {
            Some(subs) => subs.iter().map(|(_, cb)| cb.clone()).collect(),
            None => return,
        };

        for callback in callbacks {
            callback(&payload);
        }
        drop(gated);
    }

    /// Close the bus for good. Waits for in-flight deliveries to finish.
    pub fn gate(&self) {
        *self.gated.write() = true;
        tracing::debug!("event bus gated");
    }

    pub fn is_gated(&self) -> bool {
        *self.gated.read_recursive()
    }

    /// Events published after the gate.
    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics.read().get(topic).map_or(0, Vec::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn delivers_to_all_subscribers_of_topic() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for tag in ["a", "b"] {
            let seen = seen.clone();
            bus.subscribe_typed("evt", move |n: &u32| seen.lock().push(format!("{tag}{n}")));
        }
        let other = Arc::new(AtomicUsize::new(0));
        {
            let other = other.clone();
            bus.subscribe_typed("other", move |_: &u32| {
                other.fetch_add(1, Ordering::SeqCst);
            });
        }

        bus.publish("evt", 1u32);
        bus.publish("evt", "wrong type");
        assert_eq!(*seen.lock(), vec!["a1", "b1"]);
        assert_eq!(other.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn gate_suppresses_delivery() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        {
            let hits = hits.clone();
            bus.subscribe_typed("evt", move |_: &()| {
                hits.fetch_add(1, Ordering::SeqCst);
            });
        }

        bus.publish("evt", ());
        bus.gate();
        bus.publish("evt", ());
        bus.publish("evt", ());

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(bus.is_gated());
        assert_eq!(bus.dropped_events(), 2);
    }

    #[test]
    fn unsubscribe_is_idempotent() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let id = {
            let hits = hits.clone();
            bus.subscribe_typed("evt", move |_: &()| {
                hits.fetch_add(1, Ordering::SeqCst);
            })
        };
        assert!(bus.unsubscribe("evt", id));
        assert!(!bus.unsubscribe("evt", id));
        assert!(!bus.unsubscribe("nope", id));
        bus.publish("evt", ());
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(bus.subscriber_count("evt"), 0);
    }

    #[test]
    fn callback_may_resubscribe_during_delivery() {
        let bus = Arc::new(EventBus::new());
        let inner = bus.clone();
        bus.subscribe_typed("evt", move |_: &()| {
            inner.subscribe_typed("late", |_: &()| {});
        });
        bus.publish("evt", ());
        assert_eq!(bus.subscriber_count("late"), 1);
    }

    #[test]
    fn gate_waits_for_in_flight_delivery() {
        let bus = Arc::new(EventBus::new());
        let finished = Arc::new(AtomicUsize::new(0));
        let (entered_tx, entered_rx) = std::sync::mpsc::channel();
        {
            let finished = finished.clone();
            let entered_tx = Mutex::new(entered_tx);
            bus.subscribe_typed("evt", move |_: &()| {
                let _ = entered_tx.lock().send(());
                std::thread::sleep(Duration::from_millis(100));
                finished.fetch_add(1, Ordering::SeqCst);
            });
        }

        let publisher = {
            let bus = bus.clone();
            std::thread::spawn(move || bus.publish("evt", ()))
        };
        entered_rx.recv().unwrap();
        bus.gate();
        assert_eq!(finished.load(Ordering::SeqCst), 1);
        publisher.join().unwrap();
    }
}
