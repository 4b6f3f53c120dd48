//! Pending Queue - locally originated messages awaiting server confirmation.
//!
//! Keyed by correlation id, kept in insertion order. Status writes are
//! crate-private: only the delivery coordinator moves an entry through the
//! state machine, and only promotion or an explicit discard removes one.

use crate::error::{ChatError, Result};
use crate::model::{CorrelationId, PendingEntry, PendingStatus, ServerId};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use tracing::warn;

#[derive(Debug, Default)]
pub struct PendingQueue {
    entries: Vec<PendingEntry>,
    next_seq: u64,
    /// Server ids of entries already promoted this session.
    retired: HashSet<ServerId>,
}

impl PendingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: &CorrelationId) -> Option<&PendingEntry> {
        self.entries.iter().find(|e| &e.correlation_id == id)
    }

    pub fn contains(&self, id: &CorrelationId) -> bool {
        self.get(id).is_some()
    }

    /// Entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &PendingEntry> {
        self.entries.iter()
    }

    /// Explicit correlation id -> server id mappings recorded at send success.
    pub fn confirmed_mappings(&self) -> impl Iterator<Item = (&CorrelationId, &ServerId)> {
        self.entries
            .iter()
            .filter_map(|e| e.server_id.as_ref().map(|sid| (&e.correlation_id, sid)))
    }

    /// True once an entry mapped to `server_id` has been promoted.
    pub fn is_retired(&self, server_id: &ServerId) -> bool {
        self.retired.contains(server_id)
    }

    /// Create a `pending` entry for an already validated body.
    ///
    /// `anchor` is the newest canonical message visible at submit time; the
    /// heuristic matcher never pairs the entry with anything at or before it.
    pub(crate) fn insert(
        &mut self,
        body: String,
        created_at: DateTime<Utc>,
        anchor: Option<(DateTime<Utc>, ServerId)>,
    ) -> CorrelationId {
        let mut correlation_id = CorrelationId::generate();
        while self.contains(&correlation_id) {
            correlation_id = CorrelationId::generate();
        }

        let seq = self.next_seq;
        self.next_seq += 1;

        self.entries.push(PendingEntry {
            correlation_id: correlation_id.clone(),
            body,
            created_at,
            status: PendingStatus::Pending,
            server_id: None,
            attempts: 0,
            last_error: None,
            seq,
            anchor,
        });

        correlation_id
    }

    /// Move an entry to `next`, refusing transitions the state machine forbids.
    /// Returns the previous status.
    pub(crate) fn transition(
        &mut self,
        id: &CorrelationId,
        next: PendingStatus,
    ) -> Result<PendingStatus> {
        let entry = self
            .entries
            .iter_mut()
            .find(|e| &e.correlation_id == id)
            .ok_or_else(|| ChatError::UnknownCorrelation(id.clone()))?;

        let from = entry.status;
        if !from.can_transition_to(next) {
            warn!(correlation = %id, %from, to = %next, "Refused pending transition");
            return Err(ChatError::InvalidTransition {
                correlation_id: id.clone(),
                from,
                to: next,
            });
        }

        entry.status = next;
        if next == PendingStatus::Sending {
            entry.attempts += 1;
            entry.last_error = None;
        }
        Ok(from)
    }

    /// `sending -> confirmed`, recording the server id for promotion.
    pub(crate) fn confirm(&mut self, id: &CorrelationId, server_id: ServerId) -> Result<()> {
        self.transition(id, PendingStatus::Confirmed)?;
        if let Some(entry) = self.entries.iter_mut().find(|e| &e.correlation_id == id) {
            entry.server_id = Some(server_id);
        }
        Ok(())
    }

    /// `sending -> failed`, keeping the entry and the reason.
    pub(crate) fn fail(&mut self, id: &CorrelationId, reason: String) -> Result<()> {
        self.transition(id, PendingStatus::Failed)?;
        if let Some(entry) = self.entries.iter_mut().find(|e| &e.correlation_id == id) {
            entry.last_error = Some(reason);
        }
        Ok(())
    }

    pub(crate) fn remove(&mut self, id: &CorrelationId) -> Option<PendingEntry> {
        let pos = self.entries.iter().position(|e| &e.correlation_id == id)?;
        Some(self.entries.remove(pos))
    }

    /// Drop every entry matching `pred`, returning their correlation ids.
    /// Their server ids are remembered so they are never matched again.
    pub(crate) fn retire_where<F>(&mut self, mut pred: F) -> Vec<CorrelationId>
    where
        F: FnMut(&PendingEntry) -> bool,
    {
        let mut removed = Vec::new();
        let retired = &mut self.retired;
        self.entries.retain(|e| {
            if pred(e) {
                removed.push(e.correlation_id.clone());
                if let Some(sid) = &e.server_id {
                    retired.insert(sid.clone());
                }
                false
            } else {
                true
            }
        });
        removed
    }
}
