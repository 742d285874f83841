// src/scheduler/events.rs
//
// State-change notifications and the listener registry.
//
// Delivery contract: every transition is delivered exactly once, and for a
// given item id in the order the transitions occurred. Transitions are queued
// under the scheduler's state lock and drained by a single pump at a time, so
// listener callbacks run without any scheduler lock held and may call back
// into the scheduler.

use super::item::{ItemId, ItemState};
use std::sync::Arc;

/// One observed state transition.
#[derive(Clone, Debug)]
pub enum StateChange {
    /// Item admitted (or re-admitted) to the queue
    Queued { id: ItemId },
    /// Item claimed by a worker slot
    Processing { id: ItemId },
    /// Transcode settled successfully
    Completed { id: ItemId, bytes: Arc<Vec<u8>> },
    /// Transcode settled with a failure
    Failed { id: ItemId, message: String },
    /// Item cancelled while queued or in flight
    Cancelled { id: ItemId },
}

impl StateChange {
    pub fn id(&self) -> ItemId {
        match self {
            Self::Queued { id }
            | Self::Processing { id }
            | Self::Completed { id, .. }
            | Self::Failed { id, .. }
            | Self::Cancelled { id } => *id,
        }
    }

    pub fn state(&self) -> ItemState {
        match self {
            Self::Queued { .. } => ItemState::Pending,
            Self::Processing { .. } => ItemState::Processing,
            Self::Completed { .. } => ItemState::Complete,
            Self::Failed { .. } => ItemState::Error,
            Self::Cancelled { .. } => ItemState::Cancelled,
        }
    }
}

/// Handle returned by subscribe; pass to unsubscribe to stop delivery.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Subscription(pub(crate) u64);

pub(crate) type Listener = Arc<dyn Fn(&StateChange) + Send + Sync>;

#[derive(Default)]
pub(crate) struct ListenerTable {
    next: u64,
    entries: Vec<(u64, Listener)>,
}

impl ListenerTable {
    pub fn subscribe(&mut self, listener: Listener) -> Subscription {
        self.next += 1;
        let token = self.next;
        self.entries.push((token, listener));
        Subscription(token)
    }

    pub fn unsubscribe(&mut self, subscription: Subscription) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(token, _)| *token != subscription.0);
        self.entries.len() != before
    }

    /// Clone the current listener set so emission can run lock-free.
    pub fn snapshot(&self) -> Vec<Listener> {
        self.entries
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect()
    }
}
