//! Core data types: canonical messages, pending entries, render output.
//!
//! Canonical messages come from the server and carry a `ServerId`.
//! Pending entries are created locally and only carry a `CorrelationId`
//! until the server confirms them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

string_id!(
    /// Trip identifier. One trip owns exactly one linear chat thread.
    TripId
);
string_id!(
    /// Identifier of a chat participant.
    UserId
);
string_id!(
    /// Client-generated id tracking a pending entry before a `ServerId` exists.
    CorrelationId
);

impl CorrelationId {
    /// Generate a new id from the wall clock (ms, hex) plus 32 random bits.
    pub fn generate() -> Self {
        let millis = Utc::now().timestamp_millis().max(0) as u64;
        let salt: u32 = rand::random();
        Self(format!("{:x}-{:08x}", millis, salt))
    }
}

/// Server-assigned message id. Accepts JSON strings or integers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ServerId(pub String);

impl ServerId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl<'de> Deserialize<'de> for ServerId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Number(u64),
        }

        Ok(match Raw::deserialize(deserializer)? {
            Raw::Text(s) => Self(s),
            Raw::Number(n) => Self(n.to_string()),
        })
    }
}

impl std::fmt::Display for ServerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ServerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ServerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

// ---------------------------------------------------------------------------
// Canonical messages
// ---------------------------------------------------------------------------

/// Read state of a canonical message, as seen by the requesting viewer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadState {
    #[default]
    Unread,
    Read,
}

/// A message present in the server's authoritative history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: ServerId,
    pub thread_id: TripId,
    pub sender_id: UserId,
    pub body: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub read_state: ReadState,
}

impl Message {
    pub fn is_unread(&self) -> bool {
        self.read_state == ReadState::Unread
    }

    /// Sort key used by the thread store: server time, then id.
    pub(crate) fn order_key(&self) -> (DateTime<Utc>, &ServerId) {
        (self.created_at, &self.id)
    }
}

/// One full poll response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ThreadSnapshot {
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trip_status: Option<String>,
}

// ---------------------------------------------------------------------------
// Pending entries
// ---------------------------------------------------------------------------

/// Delivery status of a locally originated message.
///
/// `Pending -> Sending -> {Confirmed, Failed}`, and `Failed -> Sending`
/// through an explicit retry only. `Confirmed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PendingStatus {
    Pending,
    Sending,
    Failed,
    Confirmed,
}

impl PendingStatus {
    pub fn can_transition_to(self, next: PendingStatus) -> bool {
        use PendingStatus::*;
        matches!(
            (self, next),
            (Pending, Sending) | (Sending, Confirmed) | (Sending, Failed) | (Failed, Sending)
        )
    }
}

impl std::fmt::Display for PendingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Sending => write!(f, "sending"),
            Self::Failed => write!(f, "failed"),
            Self::Confirmed => write!(f, "confirmed"),
        }
    }
}

/// A locally originated message not yet visible in the thread store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEntry {
    pub correlation_id: CorrelationId,
    pub body: String,
    /// Client clock at submit time.
    pub created_at: DateTime<Utc>,
    pub status: PendingStatus,
    /// Recorded when the send succeeds; drives deterministic promotion.
    pub server_id: Option<ServerId>,
    /// Number of send attempts started (first send included).
    pub attempts: u32,
    pub last_error: Option<String>,
    /// Insertion order, breaks ties between equal client timestamps.
    pub(crate) seq: u64,
    /// Newest canonical `(created_at, id)` visible when the entry was queued.
    pub(crate) anchor: Option<(DateTime<Utc>, ServerId)>,
}

// ---------------------------------------------------------------------------
// Render output
// ---------------------------------------------------------------------------

/// Where a rendered row came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenderOrigin {
    Canonical { id: ServerId, read_state: ReadState },
    Local { correlation_id: CorrelationId, status: PendingStatus },
}

/// One row of the conversation view, in display order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderEntry {
    pub origin: RenderOrigin,
    pub sender_id: UserId,
    pub body: String,
    pub created_at: DateTime<Utc>,
    /// Authored by the viewer.
    pub is_own: bool,
}

impl RenderEntry {
    pub fn server_id(&self) -> Option<&ServerId> {
        match &self.origin {
            RenderOrigin::Canonical { id, .. } => Some(id),
            RenderOrigin::Local { .. } => None,
        }
    }

    pub fn correlation_id(&self) -> Option<&CorrelationId> {
        match &self.origin {
            RenderOrigin::Local { correlation_id, .. } => Some(correlation_id),
            RenderOrigin::Canonical { .. } => None,
        }
    }

    /// Local entry whose send failed; the UI offers retry for these.
    pub fn needs_retry(&self) -> bool {
        matches!(
            self.origin,
            RenderOrigin::Local {
                status: PendingStatus::Failed,
                ..
            }
        )
    }
}
