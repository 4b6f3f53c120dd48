//! Trip chat terminal client.
//!
//! Opens one trip thread, polls it in the background and reprints the
//! conversation whenever it changes. Lines typed on stdin are sent as
//! messages; a few slash commands drive the rest of the surface.
//!
//! Usage:
//!   TRIP_CHAT_URL=http://127.0.0.1:8080 TRIP_CHAT_TOKEN=rider \
//!   TRIP_CHAT_VIEWER=rider TRIP_CHAT_TRIP=trip-42 trip-chat
//!
//! Commands:
//!   /retry <correlation id>    - resend a failed message
//!   /discard <correlation id>  - drop a failed message
//!   /open <trip id>            - switch thread
//!   /poll                      - poll now
//!   /quit                      - exit
//!
//! See `config.rs` for every environment variable. Logging follows RUST_LOG
//! (default: trip_chat_sync=info) and goes to stderr.

use anyhow::{bail, Result};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use trip_chat_sync::{
    ChatConfig, CorrelationId, HttpChatApi, PendingStatus, PollLoop, RenderEntry, RenderOrigin,
    TripChat, TripId,
};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("trip_chat_sync=info")),
        )
        .with_target(false)
        .with_level(true)
        .with_writer(std::io::stderr)
        .init();

    let config = ChatConfig::from_env();
    let Some(trip) = config.initial_trip.clone() else {
        bail!("TRIP_CHAT_TRIP is not set; nothing to open");
    };

    let api = Arc::new(HttpChatApi::from_config(&config));
    let chat = Arc::new(TripChat::new(api, config.clone()));
    chat.open_thread(trip.clone());
    info!(trip = %trip, viewer = %config.viewer_id, url = %config.base_url, "Starting trip chat");

    let poller = PollLoop::spawn(Arc::clone(&chat), config.poll_interval);

    let printer = {
        let chat = Arc::clone(&chat);
        let mut changes = chat.subscribe();
        tokio::spawn(async move {
            while changes.changed().await.is_ok() {
                print_thread(&chat);
            }
        })
    };

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else { break };

        if !handle_line(&chat, line.trim()).await {
            break;
        }
    }

    poller.shutdown().await;
    printer.abort();
    Ok(())
}

/// Returns false when the user asked to quit.
async fn handle_line(chat: &Arc<TripChat>, line: &str) -> bool {
    let (command, arg) = match line.split_once(' ') {
        Some((c, a)) => (c, a.trim()),
        None => (line, ""),
    };

    match command {
        "" => {}
        "/quit" => return false,
        "/poll" => {
            if let Err(e) = chat.poll_once().await {
                warn!(error = %e, "Poll failed");
            }
        }
        "/open" if !arg.is_empty() => {
            chat.open_thread(TripId::from(arg));
            if let Err(e) = chat.poll_once().await {
                warn!(error = %e, "Poll failed");
            }
        }
        "/retry" if !arg.is_empty() => {
            let chat = Arc::clone(chat);
            let id = CorrelationId::from(arg);
            tokio::spawn(async move {
                match chat.retry(&id).await {
                    Ok(Some(_)) => {}
                    Ok(None) => eprintln!("nothing to retry for {}", id),
                    Err(e) => eprintln!("retry failed: {}", e),
                }
            });
        }
        "/discard" if !arg.is_empty() => match chat.discard(&CorrelationId::from(arg)) {
            Ok(true) => {}
            Ok(false) => eprintln!("only failed messages can be discarded"),
            Err(e) => eprintln!("discard failed: {}", e),
        },
        c if c.starts_with('/') => {
            eprintln!("commands: /retry <id>, /discard <id>, /open <trip>, /poll, /quit");
        }
        _ => {
            // Sends run concurrently with input.
            let chat = Arc::clone(chat);
            let body = line.to_string();
            tokio::spawn(async move {
                if let Err(e) = chat.submit(&body).await {
                    eprintln!("not sent: {}", e);
                }
            });
        }
    }
    true
}

fn print_thread(chat: &TripChat) {
    let Some(trip) = chat.active_trip() else {
        return;
    };
    let status = chat.trip_status().unwrap_or_else(|| "-".to_string());

    println!();
    println!("=== trip {} [{}] ===", trip, status);
    for row in chat.render_sequence() {
        println!("{}", format_row(&row));
    }
}

fn format_row(row: &RenderEntry) -> String {
    let time = row.created_at.format("%H:%M:%S");
    let who = if row.is_own { "you" } else { row.sender_id.as_str() };
    let marker = match &row.origin {
        RenderOrigin::Canonical { .. } => String::new(),
        RenderOrigin::Local {
            correlation_id,
            status: PendingStatus::Failed,
        } => format!("  (failed, /retry {})", correlation_id),
        RenderOrigin::Local { status, .. } => format!("  ({})", status),
    };
    format!("[{}] {}: {}{}", time, who, row.body, marker)
}
