//! Bounded inbound message queue
//!
//! Producers are transport callbacks and must never block, so a full queue
//! applies an explicit [`OverflowPolicy`] instead of waiting for space.
//! Consumers read destructively in arrival order.

use crate::observability::metrics::metrics;
use crate::transport::InboundMessage;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::warn;

pub const DEFAULT_QUEUE_CAPACITY: usize = 10;

/// What to discard when a message arrives at a full queue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Evict the oldest queued message to make room
    #[default]
    DropOldest,
    /// Discard the arriving message
    DropNewest,
}

/// Result of a non-blocking push
#[derive(Debug, Clone, PartialEq)]
pub enum PushOutcome {
    Queued,
    /// Queue was full; the evicted (or rejected) message is returned
    Dropped(InboundMessage),
}

#[derive(Debug)]
pub struct InboundQueue {
    name: &'static str,
    capacity: usize,
    policy: OverflowPolicy,
    items: Mutex<VecDeque<InboundMessage>>,
    notify: Notify,
}

impl InboundQueue {
    pub fn new(name: &'static str, capacity: usize, policy: OverflowPolicy) -> Self {
        let capacity = capacity.max(1);
        Self {
            name,
            capacity,
            policy,
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<InboundMessage>> {
        self.items.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Enqueue without blocking, applying the overflow policy when full
    pub fn push(&self, message: InboundMessage) -> PushOutcome {
        let outcome = {
            let mut items = self.lock();
            if items.len() < self.capacity {
                items.push_back(message);
                PushOutcome::Queued
            } else {
                match self.policy {
                    OverflowPolicy::DropOldest => {
                        let evicted = items.pop_front();
                        items.push_back(message);
                        match evicted {
                            Some(evicted) => PushOutcome::Dropped(evicted),
                            None => PushOutcome::Queued,
                        }
                    }
                    OverflowPolicy::DropNewest => PushOutcome::Dropped(message),
                }
            }
        };

        if let PushOutcome::Dropped(dropped) = &outcome {
            metrics().message_dropped();
            warn!(
                queue = self.name,
                topic = %dropped.topic,
                policy = ?self.policy,
                "Inbound queue full, message dropped"
            );
        }
        self.notify.notify_one();
        outcome
    }

    /// Take the oldest message, if any
    pub fn try_pop(&self) -> Option<InboundMessage> {
        self.lock().pop_front()
    }

    /// Wait until a message is available and take it
    pub async fn pop(&self) -> InboundMessage {
        loop {
            let notified = self.notify.notified();
            if let Some(message) = self.try_pop() {
                return message;
            }
            notified.await;
        }
    }

    /// Like [`pop`](Self::pop) but gives up after `timeout`
    pub async fn pop_timeout(&self, timeout: Duration) -> Option<InboundMessage> {
        tokio::time::timeout(timeout, self.pop()).await.ok()
    }

    /// Take everything currently queued, oldest first
    pub fn drain(&self) -> Vec<InboundMessage> {
        self.lock().drain(..).collect()
    }
}
