//! Runtime configuration, read from environment variables.
//!
//! Environment:
//!   TRIP_CHAT_URL                - API base URL (default: http://127.0.0.1:8080)
//!   TRIP_CHAT_TOKEN              - Bearer token (default: none)
//!   TRIP_CHAT_VIEWER             - Viewer user id (default: viewer)
//!   TRIP_CHAT_TRIP               - Trip to open at startup (default: none)
//!   TRIP_CHAT_POLL_SECS          - Poll cadence in seconds (default: 12)
//!   TRIP_CHAT_SEND_TIMEOUT_SECS  - Send timeout in seconds (default: 15)
//!   TRIP_CHAT_REQUEST_TIMEOUT_SECS - Fetch and mark-read timeout in seconds (default: 10)
//!   TRIP_CHAT_MATCH_WINDOW_SECS  - Heuristic promotion window (default: 120)
//!   TRIP_CHAT_MAX_BODY           - Max message length in characters (default: 4000)
//!   TRIP_CHAT_DEV_PORT           - Dev server port (default: 8080)

use crate::model::{TripId, UserId};
use crate::reconcile::DEFAULT_MATCH_WINDOW_SECS;
use std::time::Duration;
use tracing::warn;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(12);
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(15);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_MAX_BODY_LEN: usize = 4000;
pub const DEFAULT_DEV_PORT: u16 = 8080;

/// Prevent a zero interval from turning the poll loop into a busy loop.
const MIN_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct ChatConfig {
    pub base_url: String,
    pub token: Option<String>,
    pub viewer_id: UserId,
    pub initial_trip: Option<TripId>,
    pub poll_interval: Duration,
    /// Bounds one send attempt, including the HTTP request.
    pub send_timeout: Duration,
    /// Bounds thread fetches and read receipts.
    pub request_timeout: Duration,
    pub match_window: Duration,
    pub max_body_len: usize,
    pub dev_port: u16,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            base_url: format!("http://127.0.0.1:{}", DEFAULT_DEV_PORT),
            token: None,
            viewer_id: UserId::from("viewer"),
            initial_trip: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
            send_timeout: DEFAULT_SEND_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            match_window: Duration::from_secs(DEFAULT_MATCH_WINDOW_SECS as u64),
            max_body_len: DEFAULT_MAX_BODY_LEN,
            dev_port: DEFAULT_DEV_PORT,
        }
    }
}

impl ChatConfig {
    /// Load from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from any key lookup (tests pass a map).
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let poll_interval = Duration::from_secs(parse_or(
            &lookup,
            "TRIP_CHAT_POLL_SECS",
            defaults.poll_interval.as_secs(),
        ))
        .max(MIN_POLL_INTERVAL);

        Self {
            base_url: non_empty("TRIP_CHAT_URL").unwrap_or(defaults.base_url),
            token: non_empty("TRIP_CHAT_TOKEN"),
            viewer_id: non_empty("TRIP_CHAT_VIEWER")
                .map(UserId::from)
                .unwrap_or(defaults.viewer_id),
            initial_trip: non_empty("TRIP_CHAT_TRIP").map(TripId::from),
            poll_interval,
            send_timeout: Duration::from_secs(parse_or(
                &lookup,
                "TRIP_CHAT_SEND_TIMEOUT_SECS",
                defaults.send_timeout.as_secs(),
            )),
            request_timeout: Duration::from_secs(parse_or(
                &lookup,
                "TRIP_CHAT_REQUEST_TIMEOUT_SECS",
                defaults.request_timeout.as_secs(),
            )),
            match_window: Duration::from_secs(parse_or(
                &lookup,
                "TRIP_CHAT_MATCH_WINDOW_SECS",
                defaults.match_window.as_secs(),
            )),
            max_body_len: parse_or(&lookup, "TRIP_CHAT_MAX_BODY", defaults.max_body_len),
            dev_port: parse_or(&lookup, "TRIP_CHAT_DEV_PORT", defaults.dev_port),
        }
    }

    /// Heuristic match window as a chrono duration for the reconciliation engine.
    pub fn match_window_chrono(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.match_window)
            .unwrap_or_else(|_| chrono::Duration::seconds(DEFAULT_MATCH_WINDOW_SECS))
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr + Copy,
{
    match lookup(key) {
        None => default,
        Some(raw) => match raw.trim().parse() {
            Ok(v) => v,
            Err(_) => {
                warn!(key, value = %raw, "Invalid config value, using default");
                default
            }
        },
    }
}
