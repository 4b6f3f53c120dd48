//! Read Tracker - at-most-once mark-read per message per thread session.
//!
//! After each successful poll the tracker picks the incoming unread messages
//! it has not already claimed, claims them immediately, and hands them back
//! for submission. Claims live for the session; a new thread session starts
//! with an empty set.
//!
//! A claim is released only when its mark-read call fails, so the next
//! poll's re-evaluation naturally retries it.

use crate::api::ChatApi;
use crate::error::TransportError;
use crate::model::{ServerId, TripId, UserId};
use crate::thread_store::Thread;
use futures::future::join_all;
use std::collections::HashSet;
use tracing::{debug, warn};

#[derive(Debug, Default)]
pub struct ReadTracker {
    /// In-flight or completed mark-read calls for this session.
    claimed: HashSet<ServerId>,
}

impl ReadTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ids of incoming unread messages that still need a mark-read call.
    ///
    /// Every returned id is claimed before this returns.
    pub fn reconcile_reads(&mut self, thread: &Thread, viewer: &UserId) -> Vec<ServerId> {
        let mut fresh = Vec::new();
        for message in thread.store().unread_incoming(viewer) {
            if self.claimed.insert(message.id.clone()) {
                fresh.push(message.id.clone());
            }
        }
        fresh
    }

    /// Drop a claim after a failed mark-read.
    pub fn release(&mut self, id: &ServerId) -> bool {
        self.claimed.remove(id)
    }

    pub fn is_claimed(&self, id: &ServerId) -> bool {
        self.claimed.contains(id)
    }

    pub fn len(&self) -> usize {
        self.claimed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.claimed.is_empty()
    }

    /// Forget every claim (thread switch).
    pub fn clear(&mut self) {
        self.claimed.clear();
    }
}

/// Outcome of one batch of mark-read calls.
#[derive(Debug, Default)]
pub struct MarkReadReport {
    pub succeeded: Vec<ServerId>,
    pub failed: Vec<(ServerId, TransportError)>,
}

/// Issue one mark-read per id, concurrently. A failure never blocks the rest.
pub async fn submit_marks<C>(client: &C, trip_id: &TripId, ids: Vec<ServerId>) -> MarkReadReport
where
    C: ChatApi + ?Sized,
{
    let calls = ids.into_iter().map(move |id| async move {
        let result = client.mark_read(trip_id, &id).await;
        (id, result)
    });

    let mut report = MarkReadReport::default();
    for (id, result) in join_all(calls).await {
        match result {
            Ok(()) => {
                debug!(trip = %trip_id, message = %id, "Marked read");
                report.succeeded.push(id);
            }
            Err(e) => {
                warn!(trip = %trip_id, message = %id, error = %e, "Mark-read failed");
                report.failed.push((id, e));
            }
        }
    }
    report
}
