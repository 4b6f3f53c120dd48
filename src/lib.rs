//! Trip chat sync - reconciles a polled, authoritative trip chat history with
//! optimistic local sends, and delivers read receipts at most once per session.
//!
//! Layers, bottom up:
//! - `model` / `thread_store` / `pending` - canonical log and local queue
//! - `reconcile` - pure merge into one ordered view, plus promotion
//! - `delivery` / `read_tracker` - the two writers that talk to the API
//! - `chat` / `poll` - the facade a UI drives, and its timer
//! - `api` - the `ChatApi` seam (HTTP client, in-memory backend)

pub mod api;
pub mod chat;
pub mod config;
pub mod delivery;
pub mod dev_server;
pub mod error;
pub mod model;
pub mod pending;
pub mod poll;
pub mod read_tracker;
pub mod reconcile;
pub mod session;
pub mod thread_store;

pub use api::{ChatApi, HttpChatApi, MemoryBackend, MemoryChatApi, SharedApi};
pub use chat::{PollOutcome, PollReport, SubmitReceipt, TripChat};
pub use config::ChatConfig;
pub use error::{ChatError, Result, TransportError, ValidationError};
pub use model::{
    CorrelationId, Message, PendingEntry, PendingStatus, ReadState, RenderEntry, RenderOrigin,
    ServerId, ThreadSnapshot, TripId, UserId,
};
pub use poll::{PollHandle, PollLoop};
