//! Reconciliation Engine - merges canonical history with local pending sends.
//!
//! `render` is a pure function of (thread, pending queue, viewer). It never
//! mutates either input; the only mutation this module performs is
//! `promote`, which retires confirmed entries once their canonical message
//! is visible.
//!
//! Suppression rules, in order of preference:
//! 1. Explicit mapping: the delivery coordinator recorded `correlation_id ->
//!    server_id` at send success. If that id is in the store, the local entry
//!    is hidden.
//! 2. Heuristic fallback: an unmapped entry (pending, sending, or failed
//!    after a lost acknowledgement) is paired with a canonical message from
//!    the viewer with the same trimmed body, newer than the entry's anchor,
//!    inside the match window and not already owned by another entry. If two
//!    candidates exist on either side the match is ambiguous and nothing is
//!    hidden.
//!
//! Heuristic suppression is recomputed on every render, so an entry hidden
//! by a match reappears if a later snapshot drops the matched message.

use crate::model::{
    CorrelationId, Message, PendingEntry, RenderEntry, RenderOrigin, ServerId, UserId,
};
use crate::pending::PendingQueue;
use crate::thread_store::{Thread, ThreadStore};
use chrono::Duration;
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// Default window for heuristic body/time matching.
pub const DEFAULT_MATCH_WINDOW_SECS: i64 = 120;

/// Result of heuristic matching for one render/promotion pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct HeuristicMatches {
    /// Unmapped entries paired with exactly one canonical message.
    pub matched: HashMap<CorrelationId, ServerId>,
    /// Unmapped entries that had candidates but could not be paired uniquely.
    pub ambiguous: Vec<CorrelationId>,
}

#[derive(Debug, Clone)]
pub struct ReconciliationEngine {
    match_window: Duration,
}

impl Default for ReconciliationEngine {
    fn default() -> Self {
        Self::new(Duration::seconds(DEFAULT_MATCH_WINDOW_SECS))
    }
}

impl ReconciliationEngine {
    pub fn new(match_window: Duration) -> Self {
        Self { match_window }
    }

    /// Produce the ordered conversation view.
    ///
    /// Canonical messages first, in store order. Then every local entry that
    /// is not suppressed, sorted by client `created_at` (insertion order on
    /// ties). Failed and not-yet-visible confirmed entries stay in the view.
    pub fn render(
        &self,
        thread: &Thread,
        pending: &PendingQueue,
        viewer: &UserId,
    ) -> Vec<RenderEntry> {
        let store = thread.store();
        let heuristics = self.heuristic_matches(store, pending, viewer);

        let mut rows: Vec<RenderEntry> = store
            .iter()
            .map(|m| canonical_row(m, viewer))
            .collect();

        let mut locals: Vec<&PendingEntry> = pending
            .iter()
            .filter(|e| !is_explicitly_promoted(e, store))
            .filter(|e| !heuristics.matched.contains_key(&e.correlation_id))
            .collect();
        locals.sort_by(|a, b| (a.created_at, a.seq).cmp(&(b.created_at, b.seq)));

        rows.extend(locals.into_iter().map(|e| local_row(e, viewer)));
        rows
    }

    /// Retire confirmed entries whose canonical message is now in the store.
    ///
    /// Must run in the same critical section that replaced the store or
    /// recorded the confirmation.
    pub fn promote(&self, thread: &Thread, pending: &mut PendingQueue) -> Vec<CorrelationId> {
        let store = thread.store();
        let promoted = pending.retire_where(|e| is_explicitly_promoted(e, store));

        for id in &promoted {
            debug!(trip = %thread.trip_id, correlation = %id, "Promoted pending entry");
        }
        promoted
    }

    /// Pair unmapped entries with canonical messages by body and time.
    pub fn heuristic_matches(
        &self,
        store: &ThreadStore,
        pending: &PendingQueue,
        viewer: &UserId,
    ) -> HeuristicMatches {
        let claimed: HashSet<&ServerId> = pending.confirmed_mappings().map(|(_, sid)| sid).collect();

        let unmapped: Vec<&PendingEntry> = pending
            .iter()
            .filter(|e| e.server_id.is_none())
            .collect();

        let mut result = HeuristicMatches::default();
        if unmapped.is_empty() {
            return result;
        }

        let mut same_body: HashMap<&str, usize> = HashMap::new();
        for entry in &unmapped {
            *same_body.entry(entry.body.trim()).or_insert(0) += 1;
        }

        for entry in &unmapped {
            let body = entry.body.trim();
            let candidates: Vec<&Message> = store
                .iter()
                .filter(|m| &m.sender_id == viewer)
                .filter(|m| !claimed.contains(&m.id) && !pending.is_retired(&m.id))
                .filter(|m| m.body.trim() == body)
                .filter(|m| newer_than_anchor(m, entry))
                .filter(|m| (m.created_at - entry.created_at).abs() <= self.match_window)
                .collect();

            match (candidates.as_slice(), same_body.get(body).copied().unwrap_or(0)) {
                ([], _) => {}
                ([only], 1) => {
                    result
                        .matched
                        .insert(entry.correlation_id.clone(), only.id.clone());
                }
                _ => result.ambiguous.push(entry.correlation_id.clone()),
            }
        }

        result
    }
}

fn is_explicitly_promoted(entry: &PendingEntry, store: &ThreadStore) -> bool {
    entry
        .server_id
        .as_ref()
        .is_some_and(|sid| store.contains(sid))
}

fn newer_than_anchor(message: &Message, entry: &PendingEntry) -> bool {
    match &entry.anchor {
        Some((at, id)) => message.order_key() > (*at, id),
        None => true,
    }
}

fn canonical_row(message: &Message, viewer: &UserId) -> RenderEntry {
    RenderEntry {
        origin: RenderOrigin::Canonical {
            id: message.id.clone(),
            read_state: message.read_state,
        },
        sender_id: message.sender_id.clone(),
        body: message.body.clone(),
        created_at: message.created_at,
        is_own: &message.sender_id == viewer,
    }
}

fn local_row(entry: &PendingEntry, viewer: &UserId) -> RenderEntry {
    RenderEntry {
        origin: RenderOrigin::Local {
            correlation_id: entry.correlation_id.clone(),
            status: entry.status,
        },
        sender_id: viewer.clone(),
        body: entry.body.clone(),
        created_at: entry.created_at,
        is_own: true,
    }
}
