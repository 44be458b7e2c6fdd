//! Bounded outbound queue
//!
//! Single consumer (the connection's writer task), many producers (any
//! task dispatching to the session). Pushing never waits; the writer
//! suspends in `pop` until a message arrives or the queue is closed.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Notify;

use super::message::Message;

/// What happens when a push finds the queue full
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Reject the message; the hub then closes the session with `QueueOverflow`
    #[default]
    Close,
    /// Evict the oldest queued message to make room
    DropOldest,
}

/// Outcome of a successful push
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    Queued,
    /// The message was queued after evicting the oldest entry
    DroppedOldest,
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    #[error("outbound queue is full")]
    Full,

    #[error("outbound queue is closed")]
    Closed,
}

struct QueueInner {
    items: VecDeque<Arc<Message>>,
    closed: bool,
    dropped: u64,
}

pub struct OutboundQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
    capacity: usize,
    policy: OverflowPolicy,
}

impl OutboundQueue {
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(QueueInner {
                items: VecDeque::with_capacity(capacity.min(64)),
                closed: false,
                dropped: 0,
            }),
            notify: Notify::new(),
            capacity,
            policy,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Messages evicted under `OverflowPolicy::DropOldest`
    pub fn dropped(&self) -> u64 {
        self.inner.lock().dropped
    }

    pub fn push(&self, message: Arc<Message>) -> Result<Enqueued, QueueError> {
        let outcome = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Err(QueueError::Closed);
            }
            if inner.items.len() >= self.capacity {
                match self.policy {
                    OverflowPolicy::Close => return Err(QueueError::Full),
                    OverflowPolicy::DropOldest => {
                        inner.items.pop_front();
                        inner.dropped += 1;
                        inner.items.push_back(message);
                        Enqueued::DroppedOldest
                    }
                }
            } else {
                inner.items.push_back(message);
                Enqueued::Queued
            }
        };
        self.notify.notify_one();
        Ok(outcome)
    }

    pub fn try_pop(&self) -> Option<Arc<Message>> {
        self.inner.lock().items.pop_front()
    }

    /// Wait for the next message
    ///
    /// Returns `None` once the queue is closed and empty. Cancel-safe: a
    /// message is only removed in the same poll that returns it.
    pub async fn pop(&self) -> Option<Arc<Message>> {
        loop {
            let notified = self.notify.notified();
            {
                let mut inner = self.inner.lock();
                if let Some(message) = inner.items.pop_front() {
                    return Some(message);
                }
                if inner.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Stop accepting messages; queued ones can still be drained
    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.notify.notify_one();
    }
}
