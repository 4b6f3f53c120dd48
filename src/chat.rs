//! TripChat - one viewer's chat surface for the currently mounted trip.
//!
//! Owns the active `ThreadSession`, the delivery coordinator bound to it and
//! the generation counter used to drop poll responses for a thread that is no
//! longer mounted. Opening another trip builds a fresh session; anything still
//! in flight for the old one can only write into the old, orphaned session.

use crate::api::SharedApi;
use crate::config::ChatConfig;
use crate::delivery::DeliveryCoordinator;
use crate::error::{ChatError, Result};
use crate::model::{CorrelationId, PendingEntry, RenderEntry, ServerId, TripId};
use crate::read_tracker::submit_marks;
use crate::reconcile::ReconciliationEngine;
use crate::session::{SharedSession, ThreadSession};
use chrono::Utc;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Result of `submit`. `server_id` is `None` when the send failed and the
/// entry is waiting for a retry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitReceipt {
    pub correlation_id: CorrelationId,
    pub server_id: Option<ServerId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    Applied(PollReport),
    /// Another poll for this thread was already in flight.
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollReport {
    pub trip_id: TripId,
    pub message_count: usize,
    pub promoted: Vec<CorrelationId>,
    pub marked_read: Vec<ServerId>,
    pub mark_read_failures: usize,
}

#[derive(Clone)]
struct ActiveThread {
    trip_id: TripId,
    generation: u64,
    session: SharedSession,
    delivery: Arc<DeliveryCoordinator>,
    poll_gate: Arc<tokio::sync::Mutex<()>>,
}

pub struct TripChat {
    api: SharedApi,
    config: ChatConfig,
    engine: ReconciliationEngine,
    generation: AtomicU64,
    active: RwLock<Option<ActiveThread>>,
    changes: watch::Sender<u64>,
}

impl TripChat {
    pub fn new(api: SharedApi, config: ChatConfig) -> Self {
        let engine = ReconciliationEngine::new(config.match_window_chrono());
        let (changes, _) = watch::channel(0);
        Self {
            api,
            config,
            engine,
            generation: AtomicU64::new(0),
            active: RwLock::new(None),
            changes,
        }
    }

    /// Change counter, bumped whenever the rendered sequence may differ.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    /// Mount `trip_id`. Returns the generation of the active session.
    pub fn open_thread(&self, trip_id: TripId) -> u64 {
        let mut active = self.active.write();
        if let Some(current) = active.as_ref() {
            if current.trip_id == trip_id {
                return current.generation;
            }
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let session = ThreadSession::shared(trip_id.clone());
        let delivery = Arc::new(DeliveryCoordinator::new(
            Arc::clone(&self.api),
            trip_id.clone(),
            self.config.viewer_id.clone(),
            Arc::clone(&session),
            self.engine.clone(),
            self.config.send_timeout,
            self.config.max_body_len,
        ));

        *active = Some(ActiveThread {
            trip_id: trip_id.clone(),
            generation,
            session,
            delivery,
            poll_gate: Arc::new(tokio::sync::Mutex::new(())),
        });
        drop(active);

        info!(trip = %trip_id, generation, "Opened thread");
        self.notify_changed();
        generation
    }

    /// Unmount the current thread. In-flight responses for it become stale.
    pub fn close_thread(&self) {
        let previous = self.active.write().take();
        if let Some(previous) = previous {
            self.generation.fetch_add(1, Ordering::SeqCst);
            info!(trip = %previous.trip_id, "Closed thread");
            self.notify_changed();
        }
    }

    pub fn active_trip(&self) -> Option<TripId> {
        self.active.read().as_ref().map(|a| a.trip_id.clone())
    }

    /// Ordered, deduplicated conversation view. Empty when no thread is open.
    pub fn render_sequence(&self) -> Vec<RenderEntry> {
        let Some(active) = self.current() else {
            return Vec::new();
        };
        let session = active.session.lock();
        self.engine
            .render(&session.thread, &session.pending, &self.config.viewer_id)
    }

    pub fn trip_status(&self) -> Option<String> {
        let active = self.current()?;
        let session = active.session.lock();
        session.thread.trip_status().map(str::to_string)
    }

    /// Incoming messages still unread in the last applied snapshot.
    pub fn unread_count(&self) -> usize {
        let Some(active) = self.current() else {
            return 0;
        };
        let session = active.session.lock();
        session
            .thread
            .store()
            .unread_incoming(&self.config.viewer_id)
            .count()
    }

    pub fn pending_entry(&self, correlation_id: &CorrelationId) -> Option<PendingEntry> {
        let active = self.current()?;
        let session = active.session.lock();
        session.pending.get(correlation_id).cloned()
    }

    /// Validate, queue and send. A transport failure is not an error here:
    /// the entry stays in the view as failed and the receipt has no server id.
    pub async fn submit(&self, body: &str) -> Result<SubmitReceipt> {
        let active = self.current().ok_or(ChatError::NoActiveThread)?;

        let correlation_id = active.delivery.enqueue(body)?;
        self.notify_changed();

        let result = active.delivery.send(&correlation_id).await;
        self.notify_changed();

        match result {
            Ok(server_id) => Ok(SubmitReceipt {
                correlation_id,
                server_id: Some(server_id),
            }),
            Err(ChatError::Transport(_)) => Ok(SubmitReceipt {
                correlation_id,
                server_id: None,
            }),
            Err(e) => Err(e),
        }
    }

    pub async fn retry(&self, correlation_id: &CorrelationId) -> Result<Option<ServerId>> {
        let active = self.current().ok_or(ChatError::NoActiveThread)?;
        let result = active.delivery.retry(correlation_id).await;
        self.notify_changed();
        result
    }

    pub fn discard(&self, correlation_id: &CorrelationId) -> Result<bool> {
        let active = self.current().ok_or(ChatError::NoActiveThread)?;
        let removed = active.delivery.discard(correlation_id)?;
        if removed {
            self.notify_changed();
        }
        Ok(removed)
    }

    /// Fetch the active thread and apply the snapshot.
    ///
    /// On transport failure the last applied snapshot stays visible. A
    /// response that arrives after the thread was switched is dropped with
    /// `ChatError::StaleResponse`.
    pub async fn poll_once(&self) -> Result<PollOutcome> {
        let active = self.current().ok_or(ChatError::NoActiveThread)?;

        let Ok(_gate) = active.poll_gate.try_lock() else {
            debug!(trip = %active.trip_id, "Poll already in flight, skipping");
            return Ok(PollOutcome::Skipped);
        };

        let snapshot = match self.api.fetch_thread(&active.trip_id).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(trip = %active.trip_id, error = %e, "Poll failed; keeping last known thread");
                return Err(e.into());
            }
        };

        if self.generation.load(Ordering::SeqCst) != active.generation {
            debug!(
                trip = %active.trip_id,
                generation = active.generation,
                "Dropping stale poll response"
            );
            return Err(ChatError::StaleResponse {
                trip_id: active.trip_id.clone(),
                generation: active.generation,
            });
        }

        let (promoted, to_mark, message_count) = {
            let mut session = active.session.lock();
            let ThreadSession {
                thread,
                pending,
                reads,
            } = &mut *session;
            thread.replace(snapshot, Utc::now());
            let promoted = self.engine.promote(thread, pending);
            let to_mark = reads.reconcile_reads(thread, &self.config.viewer_id);
            (promoted, to_mark, thread.store().len())
        };
        self.notify_changed();

        let report = submit_marks(self.api.as_ref(), &active.trip_id, to_mark).await;
        if !report.failed.is_empty() {
            let mut session = active.session.lock();
            for (id, _) in &report.failed {
                session.reads.release(id);
            }
        }

        debug!(
            trip = %active.trip_id,
            messages = message_count,
            promoted = promoted.len(),
            marked = report.succeeded.len(),
            "Poll applied"
        );

        Ok(PollOutcome::Applied(PollReport {
            trip_id: active.trip_id.clone(),
            message_count,
            promoted,
            marked_read: report.succeeded,
            mark_read_failures: report.failed.len(),
        }))
    }

    fn current(&self) -> Option<ActiveThread> {
        self.active.read().clone()
    }

    fn notify_changed(&self) {
        self.changes.send_modify(|v| *v = v.wrapping_add(1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::memory::{MemoryBackend, MemoryChatApi};
    use crate::model::{PendingStatus, ReadState, RenderOrigin, UserId};
    use std::collections::HashSet;

    fn chat_for(backend: &MemoryBackend, viewer: &str) -> (Arc<TripChat>, MemoryChatApi) {
        let api = backend.client_for(UserId::from(viewer));
        let config = ChatConfig {
            viewer_id: UserId::from(viewer),
            ..ChatConfig::default()
        };
        let chat = Arc::new(TripChat::new(Arc::new(api.clone()), config));
        (chat, api)
    }

    fn applied(outcome: PollOutcome) -> PollReport {
        match outcome {
            PollOutcome::Applied(report) => report,
            PollOutcome::Skipped => panic!("poll was skipped"),
        }
    }

    fn assert_no_duplicate_correlations(rows: &[RenderEntry]) {
        let mut seen = HashSet::new();
        for id in rows.iter().filter_map(|r| r.correlation_id()) {
            assert!(seen.insert(id.clone()), "duplicate correlation id {id}");
        }
    }

    #[tokio::test]
    async fn test_requires_open_thread() {
        let backend = MemoryBackend::new();
        let (chat, _) = chat_for(&backend, "me");

        assert!(chat.render_sequence().is_empty());
        assert!(matches!(chat.submit("hi").await, Err(ChatError::NoActiveThread)));
        assert!(matches!(chat.poll_once().await, Err(ChatError::NoActiveThread)));
    }

    #[tokio::test]
    async fn test_round_trip_single_visible_message() {
        let backend = MemoryBackend::new();
        let (chat, _) = chat_for(&backend, "me");
        chat.open_thread(TripId::from("t1"));

        let receipt = chat.submit("hello").await.unwrap();
        let sid = receipt.server_id.clone().expect("sent");

        // Confirmed but not yet visible: still rendered once, as local.
        let rows = chat.render_sequence();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].correlation_id(), Some(&receipt.correlation_id));

        let report = applied(chat.poll_once().await.unwrap());
        assert_eq!(report.promoted, vec![receipt.correlation_id.clone()]);

        let rows = chat.render_sequence();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].server_id(), Some(&sid));
        assert_eq!(rows[0].body, "hello");
        assert!(chat.pending_entry(&receipt.correlation_id).is_none());
    }

    #[tokio::test]
    async fn test_validation_error_creates_nothing() {
        let backend = MemoryBackend::new();
        let (chat, api) = chat_for(&backend, "me");
        chat.open_thread(TripId::from("t1"));

        let err = chat.submit("   ").await.unwrap_err();
        assert!(matches!(err, ChatError::Validation(_)));
        assert!(chat.render_sequence().is_empty());
        assert_eq!(api.faults().send_calls(), 0);
    }

    #[tokio::test]
    async fn test_retry_matches_first_try_render() {
        let trip = TripId::from("t1");

        let clean = MemoryBackend::new();
        let (first_try, _) = chat_for(&clean, "me");
        first_try.open_thread(trip.clone());
        first_try.submit("hello").await.unwrap();
        first_try.poll_once().await.unwrap();

        let flaky = MemoryBackend::new();
        let (retried, api) = chat_for(&flaky, "me");
        retried.open_thread(trip.clone());
        api.faults().fail_next_sends(1);
        let receipt = retried.submit("hello").await.unwrap();
        assert!(receipt.server_id.is_none());
        assert!(retried.render_sequence()[0].needs_retry());

        retried.retry(&receipt.correlation_id).await.unwrap();
        retried.poll_once().await.unwrap();

        let strip = |rows: Vec<RenderEntry>| -> Vec<(Option<ServerId>, String, bool)> {
            rows.into_iter()
                .map(|r| (r.server_id().cloned(), r.body, r.is_own))
                .collect()
        };
        assert_eq!(strip(retried.render_sequence()), strip(first_try.render_sequence()));
        assert_eq!(flaky.message_count(&trip), 1);
    }

    #[tokio::test]
    async fn test_poll_failure_is_fail_static() {
        let backend = MemoryBackend::new();
        let trip = TripId::from("t1");
        backend.post(&trip, &UserId::from("driver"), "Arriving now");
        let (chat, api) = chat_for(&backend, "me");
        chat.open_thread(trip.clone());
        chat.poll_once().await.unwrap();
        assert_eq!(chat.render_sequence().len(), 1);

        api.faults().fail_next_fetches(1);
        let err = chat.poll_once().await.unwrap_err();
        assert!(matches!(err, ChatError::Transport(_)));
        assert_eq!(chat.render_sequence().len(), 1, "last known thread stays visible");
    }

    #[tokio::test]
    async fn test_stale_poll_does_not_touch_new_thread() {
        let backend = MemoryBackend::new();
        let a = TripId::from("trip-a");
        let b = TripId::from("trip-b");
        backend.post(&a, &UserId::from("driver"), "from A");
        let (chat, api) = chat_for(&backend, "me");

        chat.open_thread(a.clone());
        let gate = api.faults().gate_fetches();
        let poller = {
            let chat = Arc::clone(&chat);
            tokio::spawn(async move { chat.poll_once().await })
        };
        tokio::task::yield_now().await;

        chat.open_thread(b.clone());
        gate.notify_one();
        let err = poller.await.unwrap().unwrap_err();
        assert!(matches!(err, ChatError::StaleResponse { .. }));
        assert!(err.is_silent());

        assert_eq!(chat.active_trip(), Some(b));
        assert!(chat.render_sequence().is_empty(), "thread B untouched");
        assert_eq!(api.faults().mark_read_calls(), 0);
    }

    #[tokio::test]
    async fn test_close_thread_drops_inflight_poll() {
        let backend = MemoryBackend::new();
        let trip = TripId::from("t1");
        backend.post(&trip, &UserId::from("driver"), "hi");
        let (chat, api) = chat_for(&backend, "me");
        chat.open_thread(trip);

        let gate = api.faults().gate_fetches();
        let poller = {
            let chat = Arc::clone(&chat);
            tokio::spawn(async move { chat.poll_once().await })
        };
        tokio::task::yield_now().await;

        chat.close_thread();
        gate.notify_one();
        let err = poller.await.unwrap().unwrap_err();
        assert!(matches!(err, ChatError::StaleResponse { .. }));
        assert_eq!(chat.active_trip(), None);
        assert!(chat.render_sequence().is_empty());
        assert!(matches!(chat.poll_once().await, Err(ChatError::NoActiveThread)));
    }

    #[tokio::test]
    async fn test_overlapping_poll_is_skipped() {
        let backend = MemoryBackend::new();
        let (chat, api) = chat_for(&backend, "me");
        chat.open_thread(TripId::from("t1"));

        let gate = api.faults().gate_fetches();
        let first = {
            let chat = Arc::clone(&chat);
            tokio::spawn(async move { chat.poll_once().await })
        };
        tokio::task::yield_now().await;

        assert_eq!(chat.poll_once().await.unwrap(), PollOutcome::Skipped);
        gate.notify_one();
        assert!(matches!(first.await.unwrap(), Ok(PollOutcome::Applied(_))));
        assert_eq!(api.faults().fetch_calls(), 1);
    }

    #[tokio::test]
    async fn test_reads_marked_once_per_session() {
        let backend = MemoryBackend::new();
        let trip = TripId::from("t1");
        let incoming = backend.post(&trip, &UserId::from("driver"), "Outside");
        let (chat, api) = chat_for(&backend, "me");
        chat.open_thread(trip.clone());

        let report = applied(chat.poll_once().await.unwrap());
        assert_eq!(report.marked_read, vec![incoming.id.clone()]);
        assert!(backend.is_read_by(&trip, &incoming.id, &UserId::from("me")));

        applied(chat.poll_once().await.unwrap());
        assert_eq!(api.faults().mark_read_calls(), 1);
        assert_eq!(chat.unread_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_mark_read_retried_next_poll() {
        let backend = MemoryBackend::new();
        let trip = TripId::from("t1");
        let incoming = backend.post(&trip, &UserId::from("driver"), "Outside");
        let (chat, api) = chat_for(&backend, "me");
        chat.open_thread(trip.clone());

        api.faults().fail_mark_read_for(incoming.id.clone());
        let report = applied(chat.poll_once().await.unwrap());
        assert_eq!(report.mark_read_failures, 1);
        assert_eq!(chat.unread_count(), 1);

        api.faults().heal_mark_read();
        let report = applied(chat.poll_once().await.unwrap());
        assert_eq!(report.marked_read, vec![incoming.id.clone()]);
        assert_eq!(api.faults().mark_read_calls(), 2);
    }

    #[tokio::test]
    async fn test_switching_threads_resets_reads() {
        let backend = MemoryBackend::new();
        let a = TripId::from("trip-a");
        let b = TripId::from("trip-b");
        backend.post(&a, &UserId::from("driver"), "hi");
        let (chat, api) = chat_for(&backend, "me");

        chat.open_thread(a.clone());
        chat.poll_once().await.unwrap();
        chat.open_thread(b);
        chat.poll_once().await.unwrap();
        chat.open_thread(a);
        chat.poll_once().await.unwrap();

        // Already read server-side, so reopening does not resend.
        assert_eq!(api.faults().mark_read_calls(), 1);
    }

    #[tokio::test]
    async fn test_open_same_thread_keeps_session() {
        let backend = MemoryBackend::new();
        let (chat, api) = chat_for(&backend, "me");
        let g1 = chat.open_thread(TripId::from("t1"));
        api.faults().fail_next_sends(1);
        chat.submit("hello").await.unwrap();

        let g2 = chat.open_thread(TripId::from("t1"));
        assert_eq!(g1, g2);
        assert_eq!(chat.render_sequence().len(), 1);
    }

    #[tokio::test]
    async fn test_late_send_lands_in_old_session_only() {
        let backend = MemoryBackend::new();
        let (chat, api) = chat_for(&backend, "me");
        chat.open_thread(TripId::from("t1"));

        let gate = api.faults().gate_sends();
        let sender = {
            let chat = Arc::clone(&chat);
            tokio::spawn(async move { chat.submit("late").await })
        };
        tokio::task::yield_now().await;

        chat.open_thread(TripId::from("t2"));
        gate.notify_one();
        sender.await.unwrap().unwrap();

        assert!(chat.render_sequence().is_empty());
    }

    #[tokio::test]
    async fn test_discard_failed_entry() {
        let backend = MemoryBackend::new();
        let (chat, api) = chat_for(&backend, "me");
        chat.open_thread(TripId::from("t1"));
        api.faults().fail_next_sends(1);

        let receipt = chat.submit("oops").await.unwrap();
        assert!(chat.discard(&receipt.correlation_id).unwrap());
        assert!(chat.render_sequence().is_empty());
    }

    #[tokio::test]
    async fn test_lost_ack_echo_hides_failed_row() {
        let backend = MemoryBackend::new();
        let trip = TripId::from("t1");
        let (chat, api) = chat_for(&backend, "me");
        chat.open_thread(trip.clone());

        api.faults().lose_next_send_acks(1);
        let receipt = chat.submit("hello").await.unwrap();
        assert!(receipt.server_id.is_none());

        // The stored copy stands in for the failed entry.
        chat.poll_once().await.unwrap();
        let rows = chat.render_sequence();
        assert_eq!(rows.len(), 1);
        assert!(rows[0].server_id().is_some());
        assert!(!rows[0].needs_retry());

        assert!(chat.retry(&receipt.correlation_id).await.unwrap().is_none());
        chat.poll_once().await.unwrap();
        assert_eq!(chat.render_sequence().len(), 1);
        assert_eq!(backend.message_count(&trip), 1);
        assert_eq!(api.faults().send_calls(), 1);
    }

    #[tokio::test]
    async fn test_ordering_canonical_then_pending() {
        let backend = MemoryBackend::new();
        let trip = TripId::from("t1");
        for body in ["t1", "t2", "t3"] {
            backend.post(&trip, &UserId::from("driver"), body);
        }
        let (chat, api) = chat_for(&backend, "me");
        chat.open_thread(trip);
        chat.poll_once().await.unwrap();

        api.faults().fail_next_sends(2);
        chat.submit("t4").await.unwrap();
        chat.submit("t5").await.unwrap();

        let bodies: Vec<String> = chat.render_sequence().into_iter().map(|r| r.body).collect();
        assert_eq!(bodies, vec!["t1", "t2", "t3", "t4", "t5"]);
    }

    #[tokio::test]
    async fn test_many_submits_never_duplicate() {
        let backend = MemoryBackend::new();
        let (chat, api) = chat_for(&backend, "me");
        chat.open_thread(TripId::from("t1"));

        api.faults().fail_next_sends(3);
        for i in 0..8 {
            // Identical bodies on purpose: resolved through the explicit mapping.
            let body = if i % 2 == 0 { "same" } else { "other" };
            chat.submit(body).await.unwrap();
            assert_no_duplicate_correlations(&chat.render_sequence());
            if i % 3 == 0 {
                chat.poll_once().await.unwrap();
            }
        }
        chat.poll_once().await.unwrap();

        let rows = chat.render_sequence();
        assert_no_duplicate_correlations(&rows);
        let canonical = rows.iter().filter(|r| r.server_id().is_some()).count();
        let failed = rows
            .iter()
            .filter(|r| matches!(r.origin, RenderOrigin::Local { status: PendingStatus::Failed, .. }))
            .count();
        assert_eq!(canonical, 5);
        assert_eq!(failed, 3);
        assert_eq!(rows.len(), 8);
    }

    #[tokio::test]
    async fn test_trip_status_and_subscribe() {
        let backend = MemoryBackend::new();
        let trip = TripId::from("t1");
        backend.set_trip_status(&trip, "en_route");
        backend.post(&trip, &UserId::from("me"), "own");
        let (chat, _) = chat_for(&backend, "me");
        let mut changes = chat.subscribe();

        chat.open_thread(trip);
        chat.poll_once().await.unwrap();

        assert!(changes.has_changed().unwrap());
        assert!(*changes.borrow_and_update() >= 2);
        assert_eq!(chat.trip_status().as_deref(), Some("en_route"));
        let rows = chat.render_sequence();
        assert!(rows[0].is_own);
        assert!(matches!(
            rows[0].origin,
            RenderOrigin::Canonical { read_state: ReadState::Read, .. }
        ));
    }
}
