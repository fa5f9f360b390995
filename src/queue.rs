use crate::models::SyscallEvent;
use crossbeam_queue::ArrayQueue;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

pub const QUEUE_CAPACITY: usize = 4096;

/// Bounded event channel between the capture path and its consumers.
/// Push never blocks: on overflow the newest event is discarded and counted.
/// Consumers must tolerate gaps — this is a lossy stream, not a delivery log.
pub struct EventQueue {
    inner: ArrayQueue<SyscallEvent>,
    dropped: AtomicU64,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::with_capacity(QUEUE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: ArrayQueue::new(capacity),
            dropped: AtomicU64::new(0),
        }
    }

    /// Non-blocking enqueue. Returns false when the event was dropped
    /// because the queue is full.
    pub fn push(&self, event: SyscallEvent) -> bool {
        match self.inner.push(event) {
            Ok(()) => true,
            Err(event) => {
                let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                debug!(
                    pid = event.pid,
                    name = %event.name,
                    dropped_total = total,
                    "output queue full, dropping event"
                );
                false
            }
        }
    }

    /// Non-blocking dequeue; `None` when empty.
    pub fn pop(&self) -> Option<SyscallEvent> {
        self.inner.pop()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Events discarded because the queue was full, since creation.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}
