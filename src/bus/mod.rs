//! Partitioned in-process pub/sub bus.
//!
//! A single `EventBus` instance is shared (via `Arc`) by every component in
//! the process. Publishing never blocks and never panics: a slow or absent
//! subscriber can only ever lose messages according to its own drop policy,
//! never stall a publisher. One producer broadcasts to many independent
//! consumers, each with its own topic registry entry, `subscribe_many`
//! grouping, and `publish_partitioned` routing.

pub mod queue;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::model::{topic_for, Message};
pub use queue::{Mode, Subscription};

#[derive(Default)]
struct Registry {
    topics: HashMap<String, Vec<Arc<Subscription>>>,
}

/// The shared bus. Always held behind `Arc` so `SubscriptionGuard` can
/// carry a handle back to it; all state lives behind a
/// `parking_lot::Mutex` held only for the duration of a map lookup/insert,
/// never across an `.await` point.
pub struct EventBus {
    registry: Mutex<Registry>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            registry: Mutex::new(Registry::default()),
        }
    }

    /// Subscribe to a single topic. Returns the receive handle plus a
    /// guard that unsubscribes on drop.
    pub fn subscribe(self: &Arc<Self>, topic: &str, mode: Mode, maxsize: usize) -> (Arc<Subscription>, SubscriptionGuard) {
        self.subscribe_many(&[topic], mode, maxsize)
    }

    /// Subscribe to several topics with one shared queue: the same
    /// subscription is registered under every topic named, so messages
    /// published to any of them interleave in a single receive stream in
    /// publish order, with no separate merge/forwarding task required.
    pub fn subscribe_many(self: &Arc<Self>, topics: &[&str], mode: Mode, maxsize: usize) -> (Arc<Subscription>, SubscriptionGuard) {
        let sub = Arc::new(Subscription::new(mode, maxsize));
        {
            let mut reg = self.registry.lock();
            for topic in topics {
                reg.topics
                    .entry((*topic).to_string())
                    .or_default()
                    .push(sub.clone());
            }
        }
        let guard = SubscriptionGuard {
            bus: self.clone(),
            topics: topics.iter().map(|t| t.to_string()).collect(),
            sub: sub.clone(),
        };
        (sub, guard)
    }

    /// Publish `item` to every subscriber of `topic`. Never blocks: each
    /// subscriber's own queue absorbs or drops the message per its mode.
    pub fn publish(&self, topic: &str, item: Message) {
        let reg = self.registry.lock();
        if let Some(subs) = reg.topics.get(topic) {
            for sub in subs {
                sub.deliver(item.clone());
            }
        }
    }

    /// Publish to the partitioned topic `base:camera_id` (and nowhere
    /// else) — the mechanism the frame source, resampler, and aggregator
    /// use to keep one camera's traffic from ever touching another's
    /// subscribers.
    pub fn publish_partitioned(&self, base: &str, camera_id: &str, item: Message) {
        self.publish(&topic_for(base, Some(camera_id)), item);
    }

    /// Marks every current subscriber of `topic` as closed so their
    /// `recv()` calls drain and return `None`, then removes the topic
    /// entry. Used when a camera session ends and its partitioned topics
    /// should stop accepting new subscribers.
    pub fn close_topic(&self, topic: &str) {
        let mut reg = self.registry.lock();
        if let Some(subs) = reg.topics.remove(topic) {
            for sub in subs {
                sub.close();
            }
        }
    }

    fn unsubscribe(&self, topics: &[String], sub: &Arc<Subscription>) {
        let mut reg = self.registry.lock();
        for topic in topics {
            if let Some(subs) = reg.topics.get_mut(topic) {
                subs.retain(|s| !Arc::ptr_eq(s, sub));
                if subs.is_empty() {
                    reg.topics.remove(topic);
                }
            }
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII unsubscribe handle. Dropping it removes its subscription from
/// every topic it was registered under, and removes any topic entry left
/// empty as a result.
pub struct SubscriptionGuard {
    bus: Arc<EventBus>,
    topics: Vec<String>,
    sub: Arc<Subscription>,
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        self.sub.close();
        self.bus.unsubscribe(&self.topics, &self.sub);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Message;

    #[test]
    fn publish_without_subscribers_is_a_noop() {
        let bus = Arc::new(EventBus::new());
        bus.publish("nobody-home", Message::Eos);
    }

    #[test]
    fn subscribe_many_receives_from_every_topic() {
        let bus = Arc::new(EventBus::new());
        let (sub, _guard) = bus.subscribe_many(&["a", "b"], Mode::Fifo, 8);
        bus.publish("a", Message::Eos);
        bus.publish("b", Message::Eos);
        assert_eq!(sub.len(), 2);
    }

    #[test]
    fn partitioned_publish_is_isolated_per_camera() {
        let bus = Arc::new(EventBus::new());
        let (sub_a, _guard_a) = bus.subscribe("frames:cam-a", Mode::Fifo, 8);
        let (sub_b, _guard_b) = bus.subscribe("frames:cam-b", Mode::Fifo, 8);
        bus.publish_partitioned("frames", "cam-a", Message::Eos);
        assert_eq!(sub_a.len(), 1);
        assert_eq!(sub_b.len(), 0);
    }

    #[test]
    fn guard_drop_removes_topic_entry() {
        let bus = Arc::new(EventBus::new());
        let (_sub, guard) = bus.subscribe("topic", Mode::Fifo, 8);
        drop(guard);
        let (probe, _probe_guard) = bus.subscribe("topic", Mode::Fifo, 8);
        bus.publish("topic", Message::Eos);
        assert_eq!(probe.len(), 1); // only the fresh subscriber receives it
    }
}
