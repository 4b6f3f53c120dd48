//! Background poll loop for the active thread.
//!
//! One tokio task ticks on a fixed interval and awaits `TripChat::poll_once`
//! each time, so ticks never overlap. A slow poll delays the next tick
//! instead of bursting to catch up.

use crate::chat::{PollOutcome, TripChat};
use crate::error::ChatError;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

pub struct PollLoop;

impl PollLoop {
    /// Start polling `chat` every `interval`. The first tick fires immediately.
    pub fn spawn(chat: Arc<TripChat>, interval: Duration) -> PollHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(interval_secs = interval.as_secs(), "Poll loop started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                        continue;
                    }
                }

                match chat.poll_once().await {
                    Ok(PollOutcome::Applied(report)) => {
                        debug!(
                            trip = %report.trip_id,
                            messages = report.message_count,
                            "Poll tick applied"
                        );
                    }
                    Ok(PollOutcome::Skipped) => {}
                    // Idle until a thread is opened.
                    Err(ChatError::NoActiveThread) => {}
                    // Stale responses are dropped silently; transport errors
                    // were already logged and the next tick retries.
                    Err(e) => debug!(error = %e, "Poll tick failed"),
                }
            }

            info!("Poll loop stopped");
        });

        PollHandle {
            shutdown: shutdown_tx,
            task: Some(task),
        }
    }
}

/// Owner of a running poll loop. Dropping it aborts the task.
pub struct PollHandle {
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl PollHandle {
    /// Stop after the current tick finishes and wait for the task to exit.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }
}

impl Drop for PollHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
