//! # Context Events
//!
//! Outbound notifications for the transport layer.
//!
//! Subscribers get an [`mpsc::Receiver`] and a [`SubscriptionId`]. The bus
//! owns the sending side; `unsubscribe` (or dropping the receiver) ends the
//! subscription. Publishing is an unbounded channel send, so it never blocks
//! the mutation path and a slow subscriber only grows its own queue.

use crate::diff::GraphDiff;
use std::collections::BTreeMap;
use std::sync::mpsc::{self, Receiver, Sender};

/// Something that happened in a context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContextEvent {
    /// A single operation was recorded.
    Change(GraphDiff),
    /// A commit began; carries everything recorded so far.
    CommitStarted(GraphDiff),
    /// A commit succeeded; carries the operations produced by the commit.
    CommitCompleted(GraphDiff),
    /// A commit failed; pending changes are untouched.
    CommitAborted { pending: GraphDiff, reason: String },
    /// Local changes were rolled back.
    Rollback(GraphDiff),
    /// Changes since the previous flush.
    Flush(GraphDiff),
}

/// Handle returned by [`EventBus::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionId(u64);

/// Subscriber registry.
#[derive(Debug, Default)]
pub struct EventBus {
    next_id: u64,
    subscribers: BTreeMap<SubscriptionId, Sender<ContextEvent>>,
}

impl EventBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new subscriber.
    pub fn subscribe(&mut self) -> (SubscriptionId, Receiver<ContextEvent>) {
        let id = SubscriptionId(self.next_id);
        self.next_id = self.next_id.saturating_add(1);
        let (tx, rx) = mpsc::channel();
        self.subscribers.insert(id, tx);
        (id, rx)
    }

    /// End a subscription. Returns false if the id was not subscribed.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.subscribers.remove(&id).is_some()
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Deliver an event to every subscriber.
    ///
    /// Subscribers whose receiver was dropped are removed.
    pub fn publish(&mut self, event: &ContextEvent) {
        if self.subscribers.is_empty() {
            return;
        }
        let before = self.subscribers.len();
        self.subscribers.retain(|_, tx| tx.send(event.clone()).is_ok());
        let dropped = before - self.subscribers.len();
        if dropped > 0 {
            tracing::debug!(dropped, "removed disconnected event subscribers");
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
