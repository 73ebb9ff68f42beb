//! Bounded per-connection outbound queue
//!
//! Producers never wait: when the queue is full the oldest pending batch is
//! discarded. A single writer task drains it.

use crate::types::OutboundMessage;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::Notify;

/// Result of a push
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pushed {
    /// Enqueued with room to spare
    Queued,
    /// Enqueued after discarding the oldest pending batch
    DroppedOldest,
    /// The queue is closed; nothing was enqueued
    Closed,
}

/// Single-consumer, drop-oldest queue of outbound batches
#[derive(Debug)]
pub struct OutboundQueue {
    pending: Mutex<VecDeque<Arc<OutboundMessage>>>,
    notify: Notify,
    capacity: usize,
    closed: AtomicBool,
}

impl OutboundQueue {
    /// Queue holding at most `capacity` batches (minimum 1)
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            pending: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
            capacity,
            closed: AtomicBool::new(false),
        }
    }

    /// Enqueue without waiting
    pub fn push(&self, message: Arc<OutboundMessage>) -> Pushed {
        if self.closed.load(Ordering::Acquire) {
            return Pushed::Closed;
        }

        let outcome = {
            let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
            let outcome = if pending.len() >= self.capacity {
                pending.pop_front();
                Pushed::DroppedOldest
            } else {
                Pushed::Queued
            };
            pending.push_back(message);
            outcome
        };

        self.notify.notify_one();
        outcome
    }

    /// Wait for the next batch; `None` once the queue is closed
    pub async fn pop(&self) -> Option<Arc<OutboundMessage>> {
        loop {
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            if let Some(message) = self
                .pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .pop_front()
            {
                return Some(message);
            }
            // notify_one stores a permit, so a push between the check and
            // this await is not lost
            self.notify.notified().await;
        }
    }

    /// Close the queue, discarding pending batches and waking the consumer
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.notify.notify_one();
    }

    /// Whether [`close`](Self::close) has been called
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Batches waiting to be written
    pub fn len(&self) -> usize {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether no batches are waiting
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
