//! Per-subscriber bounded queue with `fifo`/`latest` drop policies.
//! Adapted from a zero-copy broadcast-style distributor to an explicit
//! per-subscriber queue, because two distinct drop policies and merged
//! multi-topic subscriptions don't fall out of `tokio::sync::broadcast`
//! directly.

use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::{timeout, Duration};

use crate::model::Message;

/// Delivery mode for a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Capacity `maxsize`; on full, drop the oldest item and enqueue the new one.
    Fifo,
    /// Capacity 1; on full, evict the existing item and enqueue the new one.
    Latest,
}

/// A single subscriber's queue. May be registered under more than one
/// topic (see `subscribe_many`); `deliver` is called by the bus's publish
/// path and never blocks.
pub struct Subscription {
    inner: Mutex<VecDeque<Message>>,
    capacity: usize,
    mode: Mode,
    notify: Notify,
    closed: Mutex<bool>,
}

impl Subscription {
    pub fn new(mode: Mode, maxsize: usize) -> Self {
        let capacity = match mode {
            Mode::Latest => 1,
            Mode::Fifo => maxsize.max(1),
        };
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            mode,
            notify: Notify::new(),
            closed: Mutex::new(false),
        }
    }

    /// Enqueue `item`. Never blocks, never panics on a full queue: the
    /// oldest item is dropped instead (fifo) or the sole slot is
    /// overwritten (latest). If even that races and leaves no room, the
    /// item is dropped silently — this is a lossy best-effort channel by
    /// design.
    pub fn deliver(&self, item: Message) {
        {
            let mut q = self.inner.lock();
            match self.mode {
                Mode::Latest => {
                    q.clear();
                    q.push_back(item);
                }
                Mode::Fifo => {
                    if q.len() >= self.capacity {
                        q.pop_front();
                    }
                    if q.len() < self.capacity {
                        q.push_back(item);
                    }
                    // else: still full after a drop attempt (rare race) — drop silently.
                }
            }
        }
        self.notify.notify_one();
    }

    fn try_pop(&self) -> Option<Message> {
        self.inner.lock().pop_front()
    }

    /// Wait indefinitely for the next item, retrying in ~1s slices so a
    /// closed-but-not-yet-observed channel is never waited on forever.
    /// Returns `None` once the subscription is closed and drained.
    pub async fn recv(&self) -> Option<Message> {
        loop {
            if let Some(item) = self.try_pop() {
                return Some(item);
            }
            if *self.closed.lock() {
                return None;
            }
            let _ = timeout(Duration::from_secs(1), self.notify.notified()).await;
        }
    }

    /// Wait for the next item but give up after `dur` with `Ok(None)`
    /// instead of retrying, so callers like the resampler can poll other
    /// state between attempts. `Err(())` means the subscription closed.
    pub async fn recv_timeout(&self, dur: Duration) -> Result<Option<Message>, ()> {
        if let Some(item) = self.try_pop() {
            return Ok(Some(item));
        }
        if *self.closed.lock() {
            return Err(());
        }
        let _ = timeout(dur, self.notify.notified()).await;
        if let Some(item) = self.try_pop() {
            return Ok(Some(item));
        }
        if *self.closed.lock() {
            return Err(());
        }
        Ok(None)
    }

    pub fn close(&self) {
        *self.closed.lock() = true;
        self.notify.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }
}
