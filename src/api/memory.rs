//! In-memory chat backend with fault injection.
//!
//! `MemoryBackend` holds every trip thread and per-user read marks.
//! `MemoryChatApi` is one authenticated user's view of it and implements
//! `ChatApi`. Faults are shared per client and let tests fail, delay or
//! hold individual calls.

use super::ChatApi;
use crate::error::{Operation, TransportError};
use crate::model::{Message, ReadState, ServerId, ThreadSnapshot, TripId, UserId};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

// ---------------------------------------------------------------------------
// Backend
// ---------------------------------------------------------------------------

struct StoredMessage {
    id: ServerId,
    sender_id: UserId,
    body: String,
    created_at: DateTime<Utc>,
    read_by: HashSet<UserId>,
}

#[derive(Default)]
struct StoredThread {
    messages: Vec<StoredMessage>,
    trip_status: Option<String>,
}

#[derive(Default)]
struct BackendState {
    threads: HashMap<TripId, StoredThread>,
    next_id: u64,
    last_created_at: Option<DateTime<Utc>>,
}

/// Authoritative message history for every trip.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    state: Arc<Mutex<BackendState>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// A client authenticated as `user`.
    pub fn client_for(&self, user: UserId) -> MemoryChatApi {
        MemoryChatApi {
            backend: self.clone(),
            user,
            faults: Arc::new(Faults::default()),
        }
    }

    /// Append a message. Server time is strictly increasing across all trips.
    pub fn post(&self, trip_id: &TripId, sender: &UserId, body: &str) -> Message {
        let mut state = self.state.lock();

        state.next_id += 1;
        let id = ServerId(state.next_id.to_string());

        let now = Utc::now();
        let created_at = match state.last_created_at {
            Some(last) if now <= last => last + ChronoDuration::microseconds(1),
            _ => now,
        };
        state.last_created_at = Some(created_at);

        let mut read_by = HashSet::new();
        read_by.insert(sender.clone());

        let stored = StoredMessage {
            id,
            sender_id: sender.clone(),
            body: body.to_string(),
            created_at,
            read_by,
        };
        let message = view(trip_id, &stored, sender);
        state
            .threads
            .entry(trip_id.clone())
            .or_default()
            .messages
            .push(stored);
        message
    }

    /// The thread as `viewer` sees it (read state is per viewer).
    pub fn snapshot_for(&self, trip_id: &TripId, viewer: &UserId) -> ThreadSnapshot {
        let state = self.state.lock();
        match state.threads.get(trip_id) {
            Some(thread) => ThreadSnapshot {
                messages: thread
                    .messages
                    .iter()
                    .map(|m| view(trip_id, m, viewer))
                    .collect(),
                trip_status: thread.trip_status.clone(),
            },
            None => ThreadSnapshot::default(),
        }
    }

    /// Record a read mark. Returns false when the message does not exist.
    pub fn mark_read(&self, trip_id: &TripId, message_id: &ServerId, viewer: &UserId) -> bool {
        let mut state = self.state.lock();
        let Some(message) = state
            .threads
            .get_mut(trip_id)
            .and_then(|t| t.messages.iter_mut().find(|m| &m.id == message_id))
        else {
            return false;
        };
        message.read_by.insert(viewer.clone());
        true
    }

    pub fn is_read_by(&self, trip_id: &TripId, message_id: &ServerId, viewer: &UserId) -> bool {
        let state = self.state.lock();
        state
            .threads
            .get(trip_id)
            .and_then(|t| t.messages.iter().find(|m| &m.id == message_id))
            .is_some_and(|m| m.read_by.contains(viewer))
    }

    pub fn set_trip_status(&self, trip_id: &TripId, status: &str) {
        self.state
            .lock()
            .threads
            .entry(trip_id.clone())
            .or_default()
            .trip_status = Some(status.to_string());
    }

    pub fn message_count(&self, trip_id: &TripId) -> usize {
        self.state
            .lock()
            .threads
            .get(trip_id)
            .map_or(0, |t| t.messages.len())
    }
}

fn view(trip_id: &TripId, stored: &StoredMessage, viewer: &UserId) -> Message {
    Message {
        id: stored.id.clone(),
        thread_id: trip_id.clone(),
        sender_id: stored.sender_id.clone(),
        body: stored.body.clone(),
        created_at: stored.created_at,
        read_state: if stored.read_by.contains(viewer) {
            ReadState::Read
        } else {
            ReadState::Unread
        },
    }
}

// ---------------------------------------------------------------------------
// Fault injection
// ---------------------------------------------------------------------------

/// Knobs for making a `MemoryChatApi` misbehave.
#[derive(Default)]
pub struct Faults {
    fail_sends: AtomicUsize,
    lose_send_acks: AtomicUsize,
    fail_fetches: AtomicUsize,
    fail_mark_read: Mutex<HashSet<ServerId>>,
    send_delay: Mutex<Option<Duration>>,
    send_gate: Mutex<Option<Arc<Notify>>>,
    fetch_gate: Mutex<Option<Arc<Notify>>>,
    send_calls: AtomicUsize,
    fetch_calls: AtomicUsize,
    mark_read_calls: AtomicUsize,
}

impl Faults {
    /// Fail the next `n` sends before they reach the backend.
    pub fn fail_next_sends(&self, n: usize) {
        self.fail_sends.store(n, Ordering::SeqCst);
    }

    /// Store the next `n` sends but report a transport error (lost response).
    pub fn lose_next_send_acks(&self, n: usize) {
        self.lose_send_acks.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_fetches(&self, n: usize) {
        self.fail_fetches.store(n, Ordering::SeqCst);
    }

    pub fn fail_mark_read_for(&self, id: ServerId) {
        self.fail_mark_read.lock().insert(id);
    }

    pub fn heal_mark_read(&self) {
        self.fail_mark_read.lock().clear();
    }

    pub fn delay_sends(&self, delay: Option<Duration>) {
        *self.send_delay.lock() = delay;
    }

    /// Hold every send until the returned gate is notified (one permit per send).
    pub fn gate_sends(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.send_gate.lock() = Some(Arc::clone(&gate));
        gate
    }

    /// Hold every fetch until the returned gate is notified (one permit per fetch).
    pub fn gate_fetches(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.fetch_gate.lock() = Some(Arc::clone(&gate));
        gate
    }

    pub fn send_calls(&self) -> usize {
        self.send_calls.load(Ordering::SeqCst)
    }

    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    pub fn mark_read_calls(&self) -> usize {
        self.mark_read_calls.load(Ordering::SeqCst)
    }
}

/// Decrement `counter` if positive; true when a fault was consumed.
fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// One user's authenticated connection to a `MemoryBackend`.
#[derive(Clone)]
pub struct MemoryChatApi {
    backend: MemoryBackend,
    user: UserId,
    faults: Arc<Faults>,
}

impl MemoryChatApi {
    pub fn faults(&self) -> &Faults {
        &self.faults
    }

    fn endpoint(trip_id: &TripId) -> String {
        format!("memory://trips/{}/messages", trip_id)
    }
}

#[async_trait]
impl ChatApi for MemoryChatApi {
    async fn fetch_thread(&self, trip_id: &TripId) -> Result<ThreadSnapshot, TransportError> {
        self.faults.fetch_calls.fetch_add(1, Ordering::SeqCst);

        let gate = self.faults.fetch_gate.lock().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }

        if take_one(&self.faults.fail_fetches) {
            return Err(TransportError::new(
                Operation::FetchThread,
                Self::endpoint(trip_id),
                "injected fetch failure",
            ));
        }
        Ok(self.backend.snapshot_for(trip_id, &self.user))
    }

    async fn send_message(&self, trip_id: &TripId, body: &str) -> Result<Message, TransportError> {
        self.faults.send_calls.fetch_add(1, Ordering::SeqCst);

        let gate = self.faults.send_gate.lock().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        let delay = *self.faults.send_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if take_one(&self.faults.fail_sends) {
            return Err(TransportError::new(
                Operation::SendMessage,
                Self::endpoint(trip_id),
                "injected send failure",
            ));
        }

        let message = self.backend.post(trip_id, &self.user, body);
        if take_one(&self.faults.lose_send_acks) {
            return Err(TransportError::new(
                Operation::SendMessage,
                Self::endpoint(trip_id),
                "injected lost acknowledgement",
            ));
        }
        Ok(message)
    }

    async fn mark_read(&self, trip_id: &TripId, message_id: &ServerId) -> Result<(), TransportError> {
        self.faults.mark_read_calls.fetch_add(1, Ordering::SeqCst);

        let endpoint = format!("{}/{}/read", Self::endpoint(trip_id), message_id);
        if self.faults.fail_mark_read.lock().contains(message_id) {
            return Err(TransportError::new(
                Operation::MarkRead,
                endpoint,
                "injected mark-read failure",
            ));
        }
        if !self.backend.mark_read(trip_id, message_id, &self.user) {
            return Err(TransportError::new(Operation::MarkRead, endpoint, "message not found"));
        }
        Ok(())
    }
}
