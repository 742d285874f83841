// src/scheduler/item.rs
//
// Per-item lifecycle record and the legal transition table.

use crate::engine::service::TranscodeMetrics;
use crate::ops::{EncodeOptions, SourceFormat};
use std::fmt;
use std::sync::Arc;

/// Opaque item identifier, stable for the item's lifetime.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ItemId(pub(crate) u64);

impl ItemId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "item-{}", self.0)
    }
}

/// Lifecycle state of a submitted item.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ItemState {
    /// Queued, waiting for a worker slot
    Pending,
    /// Claimed by the scheduler, transcode in flight
    Processing,
    /// Transcode settled successfully; result available
    Complete,
    /// Transcode settled with a failure; message available
    Error,
    /// Cancelled while queued or in flight
    Cancelled,
}

impl ItemState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Error | Self::Cancelled)
    }

    /// Legal transition table. Everything not listed here is rejected by the
    /// scheduler (ignored with a warning, never applied).
    pub fn can_transition(from: ItemState, to: ItemState) -> bool {
        use ItemState::*;
        matches!(
            (from, to),
            (Pending, Processing)
                | (Processing, Complete)
                | (Processing, Error)
                | (Pending, Cancelled)
                | (Processing, Cancelled)
                // explicit retry / reprocess re-submission
                | (Cancelled, Pending)
                | (Error, Pending)
        )
    }
}

/// What the caller hands the scheduler for one image.
/// The intake layer has already validated type and size.
#[derive(Clone, Debug)]
pub struct Submission {
    /// Reuse an existing id (retry path) or None to have one assigned.
    pub id: Option<ItemId>,
    pub name: String,
    pub bytes: Arc<Vec<u8>>,
    pub source_format: SourceFormat,
    pub options: EncodeOptions,
}

impl Submission {
    pub fn new(
        name: impl Into<String>,
        bytes: Vec<u8>,
        source_format: SourceFormat,
        options: EncodeOptions,
    ) -> Self {
        Self {
            id: None,
            name: name.into(),
            bytes: Arc::new(bytes),
            source_format,
            options,
        }
    }

    /// Pin the submission to an existing id. Submitting a terminal id
    /// re-admits that item; a queued or active id makes this a no-op.
    pub fn with_id(mut self, id: ItemId) -> Self {
        self.id = Some(id);
        self
    }
}

/// One submitted image and its processing state.
#[derive(Clone, Debug)]
pub(crate) struct Item {
    pub id: ItemId,
    pub name: String,
    pub source_bytes: Arc<Vec<u8>>,
    pub source_format: SourceFormat,
    pub options: EncodeOptions,
    pub state: ItemState,
    pub result_bytes: Option<Arc<Vec<u8>>>,
    pub error_message: Option<String>,
    pub metrics: Option<TranscodeMetrics>,
}

impl Item {
    pub fn new(id: ItemId, submission: Submission) -> Self {
        Self {
            id,
            name: submission.name,
            source_bytes: submission.bytes,
            source_format: submission.source_format,
            options: submission.options,
            state: ItemState::Pending,
            result_bytes: None,
            error_message: None,
            metrics: None,
        }
    }

    /// Attempt a state transition. Illegal transitions are ignored and
    /// reported to the caller as false.
    #[must_use]
    pub fn transition(&mut self, to: ItemState) -> bool {
        if ItemState::can_transition(self.state, to) {
            self.state = to;
            true
        } else {
            tracing::warn!(id = %self.id, from = ?self.state, to = ?to, "illegal state transition ignored");
            false
        }
    }

    /// Reset terminal fields for re-admission (retry / reprocess).
    pub fn reset_for_readmission(&mut self) {
        self.result_bytes = None;
        self.error_message = None;
        self.metrics = None;
    }
}

/// Read-only view of an item for progress display.
#[derive(Clone, Debug)]
pub struct ItemSnapshot {
    pub id: ItemId,
    pub name: String,
    pub state: ItemState,
    pub source_size: u64,
    pub result_size: Option<u64>,
    pub error_message: Option<String>,
    pub metrics: Option<TranscodeMetrics>,
}

impl ItemSnapshot {
    pub(crate) fn of(item: &Item) -> Self {
        Self {
            id: item.id,
            name: item.name.clone(),
            state: item.state,
            source_size: item.source_bytes.len() as u64,
            result_size: item.result_bytes.as_ref().map(|b| b.len() as u64),
            error_message: item.error_message.clone(),
            metrics: item.metrics.clone(),
        }
    }
}
