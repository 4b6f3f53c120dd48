//! Thread Store - the canonical, server-confirmed history of one trip thread.
//!
//! The store is never patched in place. Every poll builds a fresh
//! `ThreadStore` from the full snapshot and swaps it in, so a reader sees
//! either the previous history or the new one, never a mix.
//!
//! Invariants:
//! - messages are sorted ascending by `(created_at, id)`
//! - every `ServerId` appears at most once
//! - every message belongs to the store's trip

use crate::model::{Message, ServerId, ThreadSnapshot, TripId, UserId};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

/// Ordered, deduplicated log of canonical messages.
#[derive(Debug, Clone, Default)]
pub struct ThreadStore {
    messages: Vec<Message>,
    index: HashMap<ServerId, usize>,
}

impl ThreadStore {
    /// Build a store from raw server messages for `trip_id`.
    ///
    /// Messages addressed to another thread are dropped; for duplicate ids
    /// the first occurrence wins.
    pub fn build(trip_id: &TripId, raw: Vec<Message>) -> Self {
        let mut seen = std::collections::HashSet::with_capacity(raw.len());
        let mut foreign = 0usize;
        let mut duplicates = 0usize;

        let mut messages: Vec<Message> = raw
            .into_iter()
            .filter(|m| {
                if &m.thread_id != trip_id {
                    foreign += 1;
                    return false;
                }
                if !seen.insert(m.id.clone()) {
                    duplicates += 1;
                    return false;
                }
                true
            })
            .collect();

        if foreign > 0 || duplicates > 0 {
            warn!(
                trip = %trip_id,
                foreign,
                duplicates,
                "Dropped malformed messages from snapshot"
            );
        }

        messages.sort_by(|a, b| a.order_key().cmp(&b.order_key()));

        let index = messages
            .iter()
            .enumerate()
            .map(|(i, m)| (m.id.clone(), i))
            .collect();

        Self { messages, index }
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn contains(&self, id: &ServerId) -> bool {
        self.index.contains_key(id)
    }

    pub fn get(&self, id: &ServerId) -> Option<&Message> {
        self.index.get(id).map(|&i| &self.messages[i])
    }

    /// Messages in display order.
    pub fn iter(&self) -> impl Iterator<Item = &Message> {
        self.messages.iter()
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    /// Unread messages authored by someone other than `viewer`.
    pub fn unread_incoming<'a>(&'a self, viewer: &'a UserId) -> impl Iterator<Item = &'a Message> {
        self.messages
            .iter()
            .filter(move |m| &m.sender_id != viewer && m.is_unread())
    }
}

// ---------------------------------------------------------------------------
// Thread
// ---------------------------------------------------------------------------

/// One trip's thread: the current store plus poll bookkeeping.
#[derive(Debug, Clone)]
pub struct Thread {
    pub trip_id: TripId,
    store: Arc<ThreadStore>,
    trip_status: Option<String>,
    last_polled_at: Option<DateTime<Utc>>,
}

impl Thread {
    /// An empty thread that has never been polled.
    pub fn new(trip_id: TripId) -> Self {
        Self {
            trip_id,
            store: Arc::new(ThreadStore::default()),
            trip_status: None,
            last_polled_at: None,
        }
    }

    pub fn store(&self) -> &ThreadStore {
        &self.store
    }

    /// Cheap handle on the current store, usable after the caller's lock is released.
    pub fn store_handle(&self) -> Arc<ThreadStore> {
        Arc::clone(&self.store)
    }

    pub fn trip_status(&self) -> Option<&str> {
        self.trip_status.as_deref()
    }

    pub fn last_polled_at(&self) -> Option<DateTime<Utc>> {
        self.last_polled_at
    }

    /// Replace the whole store with a fresh snapshot.
    pub fn replace(&mut self, snapshot: ThreadSnapshot, polled_at: DateTime<Utc>) {
        let store = ThreadStore::build(&self.trip_id, snapshot.messages);
        self.store = Arc::new(store);
        self.trip_status = snapshot.trip_status;
        self.last_polled_at = Some(polled_at);
    }
}
