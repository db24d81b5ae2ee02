//! One-writer, many-reader broadcast bus.
//!
//! Fans a message out to every registered subscriber through per-subscriber
//! bounded queues. A slow subscriber loses its *oldest* queued messages rather
//! than stalling the publisher; a naive shared channel would give neither
//! per-subscriber back-pressure nor a non-blocking publisher. Used for job
//! fan-out to Stratum sessions and solved-block fan-out to upstream watchers.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::Notify;

/// Queue depth per subscriber before the oldest message is dropped.
const SUBSCRIBER_CAPACITY: usize = 10;

/// Handle for publishing to, and subscribing on, one broadcast channel.
///
/// Cheap to clone; all clones share the subscriber set. `submit` never blocks
/// and never fails: delivery is best-effort per subscriber.
#[derive(Debug, Clone)]
pub struct Broadcaster<T> {
    shared: Arc<Shared<T>>,
}

#[derive(Debug)]
struct Shared<T> {
    subscribers: Mutex<HashMap<u64, Arc<SubQueue<T>>>>,
    next_id: AtomicU64,
    capacity: usize,
}

#[derive(Debug)]
struct SubQueue<T> {
    queue: Mutex<VecDeque<T>>,
    notify: Notify,
}

/// Receiving side of a broadcast registration.
///
/// Dropping the subscriber unregisters it from the bus.
#[derive(Debug)]
pub struct Subscriber<T> {
    id: u64,
    queue: Arc<SubQueue<T>>,
    shared: Weak<Shared<T>>,
}

impl<T: Clone> Broadcaster<T> {
    pub fn new() -> Self {
        Self::with_capacity(SUBSCRIBER_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                subscribers: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(0),
                capacity,
            }),
        }
    }

    /// Register a new subscriber with an empty queue.
    pub fn subscribe(&self) -> Subscriber<T> {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let queue = Arc::new(SubQueue {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        });
        self.shared
            .subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, queue.clone());
        Subscriber {
            id,
            queue,
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Deliver `msg` to every currently-registered subscriber.
    ///
    /// Per-subscriber FIFO; a full queue drops its oldest entry to make room.
    pub fn submit(&self, msg: T) {
        let subscribers = self
            .shared
            .subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        for sub in subscribers.values() {
            let mut queue = sub.queue.lock().unwrap_or_else(|e| e.into_inner());
            if queue.len() >= self.shared.capacity {
                queue.pop_front();
            }
            queue.push_back(msg.clone());
            drop(queue);
            sub.notify.notify_one();
        }
    }

    /// Number of registered subscribers. Mostly of interest to tests and logs.
    pub fn subscriber_count(&self) -> usize {
        self.shared
            .subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

impl<T: Clone> Default for Broadcaster<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Subscriber<T> {
    /// Receive the next message, waiting if the queue is empty.
    ///
    /// Returns `None` once the bus is gone and the queue has drained.
    pub async fn recv(&mut self) -> Option<T> {
        loop {
            let notified = self.queue.notify.notified();
            if let Some(msg) = self.pop() {
                return Some(msg);
            }
            if self.shared.upgrade().is_none() {
                return None;
            }
            notified.await;
        }
    }

    /// Receive without waiting.
    pub fn try_recv(&mut self) -> Option<T> {
        self.pop()
    }

    fn pop(&self) -> Option<T> {
        self.queue
            .queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
    }
}

impl<T> Drop for Subscriber<T> {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.upgrade() {
            shared
                .subscribers
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&self.id);
        }
    }
}
