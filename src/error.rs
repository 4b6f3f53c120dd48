//! Error taxonomy for the trip chat engine.
//!
//! Three families matter to callers:
//! - `Validation`: rejected before anything is queued (no correlation id exists)
//! - `Transport`: network failure on send, poll or mark-read
//! - `StaleResponse`: a poll result for a thread that is no longer active
//!
//! The rest are programming/lookup errors surfaced by the facade.

use crate::model::{CorrelationId, PendingStatus, TripId};
use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T, E = ChatError> = std::result::Result<T, E>;

/// Everything the engine can fail with.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("invalid message: {0}")]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("stale poll response for trip {trip_id} (generation {generation})")]
    StaleResponse { trip_id: TripId, generation: u64 },

    #[error("no pending entry with correlation id {0}")]
    UnknownCorrelation(CorrelationId),

    #[error("illegal transition {from} -> {to} for {correlation_id}")]
    InvalidTransition {
        correlation_id: CorrelationId,
        from: PendingStatus,
        to: PendingStatus,
    },

    #[error("no thread is open")]
    NoActiveThread,
}

impl ChatError {
    /// True for errors the user never sees (poll staleness).
    pub fn is_silent(&self) -> bool {
        matches!(self, Self::StaleResponse { .. })
    }
}

/// Why a body was refused before submission.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("message body is empty")]
    EmptyBody,

    #[error("message body is {len} characters (max {max})")]
    BodyTooLong { len: usize, max: usize },
}

/// Which collaborator call failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    FetchThread,
    SendMessage,
    MarkRead,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::FetchThread => write!(f, "fetch_thread"),
            Self::SendMessage => write!(f, "send_message"),
            Self::MarkRead => write!(f, "mark_read"),
        }
    }
}

/// Network-layer failure talking to the chat API.
#[derive(Debug, Clone, Error)]
#[error("{operation} failed: {reason} ({endpoint})")]
pub struct TransportError {
    pub operation: Operation,
    pub endpoint: String,
    pub reason: String,
}

impl TransportError {
    pub fn new(operation: Operation, endpoint: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            operation,
            endpoint: endpoint.into(),
            reason: reason.into(),
        }
    }

    /// A send or fetch that exceeded its deadline.
    pub fn timeout(operation: Operation, endpoint: impl Into<String>, after: std::time::Duration) -> Self {
        Self::new(operation, endpoint, format!("timed out after {}ms", after.as_millis()))
    }
}
