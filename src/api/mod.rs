//! Chat API - the consumed REST collaborator.
//!
//! The engine only ever talks to this trait. `HttpChatApi` is the real
//! REST/JSON client; `MemoryChatApi` is an in-process backend used by tests
//! and the dev server.

pub mod http;
pub mod memory;

use crate::error::TransportError;
use crate::model::{Message, ServerId, ThreadSnapshot, TripId};
use async_trait::async_trait;
use std::sync::Arc;

pub use http::HttpChatApi;
pub use memory::{Faults, MemoryBackend, MemoryChatApi};

/// Shared handle the engine holds on its collaborator.
pub type SharedApi = Arc<dyn ChatApi>;

#[async_trait]
pub trait ChatApi: Send + Sync {
    /// Full snapshot of a trip's thread as seen by the authenticated user.
    async fn fetch_thread(&self, trip_id: &TripId) -> Result<ThreadSnapshot, TransportError>;

    /// Post a message; returns the canonical message with its server id.
    async fn send_message(&self, trip_id: &TripId, body: &str) -> Result<Message, TransportError>;

    /// Mark one message read for the authenticated user. Idempotent server-side.
    async fn mark_read(&self, trip_id: &TripId, message_id: &ServerId) -> Result<(), TransportError>;
}
