//! Fan-out of decoded events to any number of consumers.
//!
//! Publishing never waits on a consumer.  Each consumer owns a bounded queue;
//! when it is full the oldest event is discarded and the consumer's drop
//! counter is incremented, so a stalled logger or plot can fall behind without
//! slowing down packet decoding.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use log::debug;
use tokio::sync::Notify;

use crate::protocol::Channel;
use crate::types::StreamEvent;

struct Queue {
    /// `None` accepts every channel.
    channels: Option<Vec<Channel>>,
    capacity: usize,
    events: Mutex<VecDeque<StreamEvent>>,
    dropped: AtomicU64,
    notify: Notify,
    /// The publishing side is gone.
    closed: AtomicBool,
    /// The consuming side is gone.
    detached: AtomicBool,
}

impl Queue {
    fn lock(&self) -> MutexGuard<'_, VecDeque<StreamEvent>> {
        // A panicking consumer must not take the decode path down with it.
        self.events.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn accepts(&self, event: &StreamEvent) -> bool {
        match (&self.channels, event.channel()) {
            (Some(list), Some(ch)) => list.contains(&ch),
            _ => true,
        }
    }

    fn push(&self, event: StreamEvent) {
        {
            let mut q = self.lock();
            if q.len() == self.capacity {
                q.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            q.push_back(event);
        }
        self.notify.notify_one();
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_one();
    }
}

#[derive(Default)]
struct Shared {
    queues: Mutex<Vec<Arc<Queue>>>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Vec<Arc<Queue>>> {
        self.queues.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        for q in self.lock().iter() {
            q.close();
        }
    }
}

/// Publishing side.  Cheap to clone; every clone feeds the same consumers.
#[derive(Clone, Default)]
pub struct Pipeline {
    shared: Arc<Shared>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a consumer for every event, holding at most `capacity` events.
    pub fn register(&self, capacity: usize) -> Consumer {
        self.add(None, capacity)
    }

    /// Register a consumer for the listed channels only.  Session-level
    /// [`StreamEvent::State`] events are always delivered.
    pub fn register_for(&self, channels: &[Channel], capacity: usize) -> Consumer {
        self.add(Some(channels.to_vec()), capacity)
    }

    fn add(&self, channels: Option<Vec<Channel>>, capacity: usize) -> Consumer {
        let queue = Arc::new(Queue {
            channels,
            capacity: capacity.max(1),
            events: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
            dropped: AtomicU64::new(0),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            detached: AtomicBool::new(false),
        });
        self.shared.lock().push(Arc::clone(&queue));
        Consumer { queue }
    }

    /// Deliver `event` to every interested consumer without blocking.
    pub fn publish(&self, event: StreamEvent) {
        let mut queues = self.shared.lock();
        queues.retain(|q| !q.detached.load(Ordering::Acquire));
        for q in queues.iter().filter(|q| q.accepts(&event)) {
            q.push(event.clone());
        }
    }

    /// Publish one end-of-stream marker per channel.
    pub fn end_of_stream(&self, channels: &[Channel]) {
        debug!("pipeline: end of stream on {} channel(s)", channels.len());
        for &ch in channels {
            self.publish(StreamEvent::EndOfStream(ch));
        }
    }

    pub fn consumer_count(&self) -> usize {
        self.shared
            .lock()
            .iter()
            .filter(|q| !q.detached.load(Ordering::Acquire))
            .count()
    }

    /// Sum of the drop counters of all live consumers.
    pub fn total_dropped(&self) -> u64 {
        self.shared
            .lock()
            .iter()
            .map(|q| q.dropped.load(Ordering::Relaxed))
            .sum()
    }
}

/// Receiving side of one registration.
pub struct Consumer {
    queue: Arc<Queue>,
}

impl Consumer {
    /// Wait for the next event.  Returns `None` once the pipeline is gone and
    /// the queue has been drained.
    pub async fn recv(&self) -> Option<StreamEvent> {
        loop {
            if let Some(event) = self.queue.lock().pop_front() {
                return Some(event);
            }
            if self.queue.closed.load(Ordering::Acquire) {
                return None;
            }
            self.queue.notify.notified().await;
        }
    }

    pub fn try_recv(&self) -> Option<StreamEvent> {
        self.queue.lock().pop_front()
    }

    /// Events discarded because this consumer fell behind.
    pub fn dropped(&self) -> u64 {
        self.queue.dropped.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        self.queue.detached.store(true, Ordering::Release);
    }
}
