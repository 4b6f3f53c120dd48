//! Delivery Coordinator - the only writer of pending entry status.
//!
//! Flow for one message:
//! 1. `enqueue` validates the body and creates a `pending` entry
//! 2. `send` moves it to `sending`, releases the session lock and awaits the
//!    API (bounded by the send timeout)
//! 3. on success: `confirmed` + server id recorded, then promotion runs in
//!    the same critical section (the canonical copy may already be visible)
//! 4. on failure or timeout: `failed`, entry kept for an explicit `retry`
//!
//! `failed -> sending` is only reachable through `retry`. A retry is skipped
//! when the thread already shows a unique echo of the failed message (the
//! server stored it but the acknowledgement was lost).
//!
//! Nothing here retries automatically. Distinct correlation ids may be in
//! flight at the same time; completion order between them is unspecified.

use crate::api::SharedApi;
use crate::error::{ChatError, Operation, Result, TransportError, ValidationError};
use crate::model::{CorrelationId, PendingStatus, ServerId, TripId, UserId};
use crate::reconcile::ReconciliationEngine;
use crate::session::{SharedSession, ThreadSession};
use chrono::Utc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub struct DeliveryCoordinator {
    api: SharedApi,
    trip_id: TripId,
    viewer: UserId,
    session: SharedSession,
    engine: ReconciliationEngine,
    send_timeout: Duration,
    max_body_len: usize,
}

impl DeliveryCoordinator {
    pub fn new(
        api: SharedApi,
        trip_id: TripId,
        viewer: UserId,
        session: SharedSession,
        engine: ReconciliationEngine,
        send_timeout: Duration,
        max_body_len: usize,
    ) -> Self {
        Self {
            api,
            trip_id,
            viewer,
            session,
            engine,
            send_timeout,
            max_body_len,
        }
    }

    /// Trim and check a body. Returns the text that will be sent.
    pub fn validate(&self, body: &str) -> Result<String, ValidationError> {
        let trimmed = body.trim();
        if trimmed.is_empty() {
            return Err(ValidationError::EmptyBody);
        }
        let len = trimmed.chars().count();
        if len > self.max_body_len {
            return Err(ValidationError::BodyTooLong {
                len,
                max: self.max_body_len,
            });
        }
        Ok(trimmed.to_string())
    }

    /// Validate and queue a new `pending` entry. No entry is created on error.
    pub fn enqueue(&self, body: &str) -> Result<CorrelationId> {
        let body = self.validate(body)?;

        let mut session = self.session.lock();
        let anchor = session
            .thread
            .store()
            .last()
            .map(|m| (m.created_at, m.id.clone()));
        let id = session.pending.insert(body, Utc::now(), anchor);

        debug!(trip = %self.trip_id, correlation = %id, "Queued message");
        Ok(id)
    }

    /// Send a freshly queued `pending` entry and resolve its status.
    pub async fn send(&self, correlation_id: &CorrelationId) -> Result<ServerId> {
        let body = {
            let mut session = self.session.lock();
            let from = session
                .pending
                .get(correlation_id)
                .map(|e| e.status)
                .ok_or_else(|| ChatError::UnknownCorrelation(correlation_id.clone()))?;
            if from != PendingStatus::Pending {
                warn!(
                    trip = %self.trip_id,
                    correlation = %correlation_id,
                    %from,
                    "Send refused; only pending entries can be sent"
                );
                return Err(ChatError::InvalidTransition {
                    correlation_id: correlation_id.clone(),
                    from,
                    to: PendingStatus::Sending,
                });
            }
            session
                .pending
                .transition(correlation_id, PendingStatus::Sending)?;
            session
                .pending
                .get(correlation_id)
                .map(|e| e.body.clone())
                .ok_or_else(|| ChatError::UnknownCorrelation(correlation_id.clone()))?
        };

        self.deliver(correlation_id, &body).await
    }

    /// Re-send a `failed` entry. Any other status is a no-op (`Ok(None)`),
    /// so a second retry while the first is in flight never double-sends.
    /// Also a no-op when the thread already holds a unique echo of the entry.
    pub async fn retry(&self, correlation_id: &CorrelationId) -> Result<Option<ServerId>> {
        let body = {
            let mut session = self.session.lock();
            let status = session
                .pending
                .get(correlation_id)
                .map(|e| e.status)
                .ok_or_else(|| ChatError::UnknownCorrelation(correlation_id.clone()))?;

            if status != PendingStatus::Failed {
                debug!(
                    trip = %self.trip_id,
                    correlation = %correlation_id,
                    %status,
                    "Retry ignored"
                );
                return Ok(None);
            }

            let ThreadSession { thread, pending, .. } = &*session;
            let echo = self
                .engine
                .heuristic_matches(thread.store(), pending, &self.viewer)
                .matched
                .remove(correlation_id);
            if let Some(server_id) = echo {
                info!(
                    trip = %self.trip_id,
                    correlation = %correlation_id,
                    %server_id,
                    "Retry skipped; message already stored"
                );
                return Ok(None);
            }

            session
                .pending
                .transition(correlation_id, PendingStatus::Sending)?;
            session
                .pending
                .get(correlation_id)
                .map(|e| e.body.clone())
                .ok_or_else(|| ChatError::UnknownCorrelation(correlation_id.clone()))?
        };

        info!(trip = %self.trip_id, correlation = %correlation_id, "Retrying send");
        self.deliver(correlation_id, &body).await.map(Some)
    }

    /// Drop a `failed` entry the user dismissed. Returns false for any other status.
    pub fn discard(&self, correlation_id: &CorrelationId) -> Result<bool> {
        let mut session = self.session.lock();
        let status = session
            .pending
            .get(correlation_id)
            .map(|e| e.status)
            .ok_or_else(|| ChatError::UnknownCorrelation(correlation_id.clone()))?;

        if status != PendingStatus::Failed {
            return Ok(false);
        }
        session.pending.remove(correlation_id);
        debug!(trip = %self.trip_id, correlation = %correlation_id, "Discarded failed message");
        Ok(true)
    }

    /// Network half of a send. The entry is already `sending`.
    async fn deliver(&self, correlation_id: &CorrelationId, body: &str) -> Result<ServerId> {
        let outcome = match tokio::time::timeout(
            self.send_timeout,
            self.api.send_message(&self.trip_id, body),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(TransportError::timeout(
                Operation::SendMessage,
                format!("trips/{}/messages", self.trip_id),
                self.send_timeout,
            )),
        };

        let mut session = self.session.lock();
        match outcome {
            Ok(message) => {
                session.pending.confirm(correlation_id, message.id.clone())?;
                let ThreadSession { thread, pending, .. } = &mut *session;
                self.engine.promote(thread, pending);

                debug!(
                    trip = %self.trip_id,
                    correlation = %correlation_id,
                    server_id = %message.id,
                    "Send confirmed"
                );
                Ok(message.id)
            }
            Err(e) => {
                session.pending.fail(correlation_id, e.reason.clone())?;
                warn!(
                    trip = %self.trip_id,
                    correlation = %correlation_id,
                    error = %e,
                    "Send failed; awaiting retry"
                );
                Err(ChatError::Transport(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::memory::{MemoryBackend, MemoryChatApi};
    use crate::model::{ThreadSnapshot, UserId};
    use std::sync::Arc;

    struct Fixture {
        backend: MemoryBackend,
        api: MemoryChatApi,
        session: SharedSession,
        delivery: Arc<DeliveryCoordinator>,
    }

    fn fixture(send_timeout: Duration) -> Fixture {
        let backend = MemoryBackend::new();
        let api = backend.client_for(UserId::from("me"));
        let trip = TripId::from("t1");
        let session = ThreadSession::shared(trip.clone());
        let delivery = Arc::new(DeliveryCoordinator::new(
            Arc::new(api.clone()),
            trip,
            UserId::from("me"),
            session.clone(),
            ReconciliationEngine::default(),
            send_timeout,
            100,
        ));
        Fixture {
            backend,
            api,
            session,
            delivery,
        }
    }

    fn status(session: &SharedSession, id: &CorrelationId) -> Option<PendingStatus> {
        session.lock().pending.get(id).map(|e| e.status)
    }

    fn poll(f: &Fixture) {
        let snap: ThreadSnapshot = f.backend.snapshot_for(&TripId::from("t1"), &UserId::from("me"));
        let mut session = f.session.lock();
        let ThreadSession { thread, pending, .. } = &mut *session;
        thread.replace(snap, Utc::now());
        ReconciliationEngine::default().promote(thread, pending);
    }

    #[test]
    fn test_enqueue_rejects_empty_and_long_bodies() {
        let f = fixture(Duration::from_secs(1));

        let err = f.delivery.enqueue("   \n").unwrap_err();
        assert!(matches!(err, ChatError::Validation(ValidationError::EmptyBody)));

        let long = "x".repeat(101);
        let err = f.delivery.enqueue(&long).unwrap_err();
        assert!(matches!(
            err,
            ChatError::Validation(ValidationError::BodyTooLong { len: 101, max: 100 })
        ));

        assert!(f.session.lock().pending.is_empty(), "no entry on validation error");
    }

    #[test]
    fn test_enqueue_trims_body() {
        let f = fixture(Duration::from_secs(1));
        let id = f.delivery.enqueue("  hello  ").unwrap();
        assert_eq!(f.session.lock().pending.get(&id).unwrap().body, "hello");
    }

    #[tokio::test]
    async fn test_send_success_confirms_then_promotes_on_poll() {
        let f = fixture(Duration::from_secs(1));
        let id = f.delivery.enqueue("hello").unwrap();

        let sid = f.delivery.send(&id).await.unwrap();
        assert_eq!(status(&f.session, &id), Some(PendingStatus::Confirmed));
        assert_eq!(
            f.session.lock().pending.get(&id).unwrap().server_id,
            Some(sid.clone())
        );

        poll(&f);
        assert!(f.session.lock().pending.is_empty(), "promoted on poll");
        assert!(f.session.lock().thread.store().contains(&sid));
    }

    #[tokio::test]
    async fn test_send_promotes_immediately_if_already_visible() {
        let f = fixture(Duration::from_secs(1));
        let gate = f.api.faults().gate_sends();
        let id = f.delivery.enqueue("hello").unwrap();

        let delivery = Arc::clone(&f.delivery);
        let id2 = id.clone();
        let handle = tokio::spawn(async move { delivery.send(&id2).await });

        tokio::task::yield_now().await;
        assert_eq!(status(&f.session, &id), Some(PendingStatus::Sending));

        // A poll lands before the ack: it already carries the message the
        // backend is about to assign id "1".
        {
            let mut session = f.session.lock();
            let canonical = crate::model::Message {
                id: ServerId::from("1"),
                thread_id: TripId::from("t1"),
                sender_id: UserId::from("someone-else"),
                body: "unrelated text".into(),
                created_at: Utc::now(),
                read_state: Default::default(),
            };
            session.thread.replace(
                ThreadSnapshot {
                    messages: vec![canonical],
                    trip_status: None,
                },
                Utc::now(),
            );
        }

        gate.notify_one();
        let sid = handle.await.unwrap().unwrap();
        assert_eq!(sid, ServerId::from("1"));
        assert!(
            f.session.lock().pending.is_empty(),
            "promoted at ack time without waiting for the next poll"
        );
    }

    #[tokio::test]
    async fn test_lost_ack_fails_and_is_kept() {
        let f = fixture(Duration::from_secs(1));
        f.api.faults().lose_next_send_acks(1);
        let id = f.delivery.enqueue("hello").unwrap();

        assert!(f.delivery.send(&id).await.is_err());
        assert_eq!(status(&f.session, &id), Some(PendingStatus::Failed));
        assert_eq!(
            f.session.lock().pending.get(&id).unwrap().last_error.as_deref(),
            Some("injected lost acknowledgement")
        );
    }

    #[tokio::test]
    async fn test_retry_after_lost_ack_does_not_repost() {
        let f = fixture(Duration::from_secs(1));
        f.api.faults().lose_next_send_acks(1);
        let id = f.delivery.enqueue("hello").unwrap();
        assert!(f.delivery.send(&id).await.is_err());

        poll(&f);
        assert_eq!(status(&f.session, &id), Some(PendingStatus::Failed));

        assert!(f.delivery.retry(&id).await.unwrap().is_none());
        assert_eq!(f.api.faults().send_calls(), 1);
        assert_eq!(f.backend.message_count(&TripId::from("t1")), 1);
    }

    #[tokio::test]
    async fn test_send_after_failure_requires_retry() {
        let f = fixture(Duration::from_secs(1));
        f.api.faults().fail_next_sends(1);
        let id = f.delivery.enqueue("hello").unwrap();
        assert!(f.delivery.send(&id).await.is_err());

        let err = f.delivery.send(&id).await.unwrap_err();
        assert!(matches!(
            err,
            ChatError::InvalidTransition {
                from: PendingStatus::Failed,
                to: PendingStatus::Sending,
                ..
            }
        ));
        assert_eq!(f.api.faults().send_calls(), 1);
        assert_eq!(status(&f.session, &id), Some(PendingStatus::Failed));
    }

    #[tokio::test]
    async fn test_send_failure_keeps_entry() {
        let f = fixture(Duration::from_secs(1));
        f.api.faults().fail_next_sends(1);
        let id = f.delivery.enqueue("hello").unwrap();

        let err = f.delivery.send(&id).await.unwrap_err();
        assert!(matches!(err, ChatError::Transport(_)));
        assert_eq!(status(&f.session, &id), Some(PendingStatus::Failed));

        // Not retried automatically.
        assert_eq!(f.api.faults().send_calls(), 1);
    }

    #[tokio::test]
    async fn test_send_timeout_goes_to_failed() {
        let f = fixture(Duration::from_millis(50));
        f.api.faults().delay_sends(Some(Duration::from_millis(500)));
        let id = f.delivery.enqueue("slow").unwrap();

        let err = f.delivery.send(&id).await.unwrap_err();
        match err {
            ChatError::Transport(e) => assert!(e.reason.contains("timed out")),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(status(&f.session, &id), Some(PendingStatus::Failed));
    }

    #[tokio::test]
    async fn test_retry_recovers() {
        let f = fixture(Duration::from_secs(1));
        f.api.faults().fail_next_sends(1);
        let id = f.delivery.enqueue("hello").unwrap();
        let _ = f.delivery.send(&id).await;

        let sid = f.delivery.retry(&id).await.unwrap().expect("retry sent");
        assert_eq!(status(&f.session, &id), Some(PendingStatus::Confirmed));
        assert_eq!(f.session.lock().pending.get(&id).unwrap().attempts, 2);

        poll(&f);
        assert!(f.session.lock().pending.is_empty());
        assert_eq!(f.backend.message_count(&TripId::from("t1")), 1, "no duplicate");
        assert!(f.session.lock().thread.store().contains(&sid));
    }

    #[tokio::test]
    async fn test_retry_while_sending_is_noop() {
        let f = fixture(Duration::from_secs(1));
        f.api.faults().fail_next_sends(1);
        let id = f.delivery.enqueue("hello").unwrap();
        let _ = f.delivery.send(&id).await;

        let gate = f.api.faults().gate_sends();
        let delivery = Arc::clone(&f.delivery);
        let id2 = id.clone();
        let first = tokio::spawn(async move { delivery.retry(&id2).await });
        tokio::task::yield_now().await;
        assert_eq!(status(&f.session, &id), Some(PendingStatus::Sending));

        let second = f.delivery.retry(&id).await.unwrap();
        assert!(second.is_none(), "second retry while sending is ignored");

        gate.notify_one();
        assert!(first.await.unwrap().unwrap().is_some());
        assert_eq!(f.api.faults().send_calls(), 2);
        assert_eq!(f.backend.message_count(&TripId::from("t1")), 1);
    }

    #[tokio::test]
    async fn test_retry_on_confirmed_or_unknown() {
        let f = fixture(Duration::from_secs(1));
        let id = f.delivery.enqueue("hello").unwrap();
        f.delivery.send(&id).await.unwrap();

        assert!(f.delivery.retry(&id).await.unwrap().is_none());
        let err = f
            .delivery
            .retry(&CorrelationId::from("missing"))
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::UnknownCorrelation(_)));
    }

    #[tokio::test]
    async fn test_send_twice_is_refused() {
        let f = fixture(Duration::from_secs(1));
        let id = f.delivery.enqueue("hello").unwrap();
        f.delivery.send(&id).await.unwrap();

        let err = f.delivery.send(&id).await.unwrap_err();
        assert!(matches!(err, ChatError::InvalidTransition { .. }));
        assert_eq!(f.api.faults().send_calls(), 1);
    }

    #[tokio::test]
    async fn test_discard_only_failed() {
        let f = fixture(Duration::from_secs(1));
        f.api.faults().fail_next_sends(1);
        let failed = f.delivery.enqueue("drop me").unwrap();
        let _ = f.delivery.send(&failed).await;
        let queued = f.delivery.enqueue("keep me").unwrap();

        assert!(!f.delivery.discard(&queued).unwrap());
        assert!(f.delivery.discard(&failed).unwrap());
        assert!(status(&f.session, &failed).is_none());
        assert!(status(&f.session, &queued).is_some());
    }

    #[tokio::test]
    async fn test_concurrent_sends_for_distinct_ids() {
        let f = fixture(Duration::from_secs(1));
        let a = f.delivery.enqueue("a").unwrap();
        let b = f.delivery.enqueue("b").unwrap();

        let (ra, rb) = tokio::join!(f.delivery.send(&a), f.delivery.send(&b));
        assert_ne!(ra.unwrap(), rb.unwrap());
        assert_eq!(f.backend.message_count(&TripId::from("t1")), 2);
    }
}
