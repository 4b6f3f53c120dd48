//! REST/JSON client for the trip chat API.
//!
//! Routes:
//!   GET  {base}/api/trips/{trip}/messages            - full thread snapshot
//!   POST {base}/api/trips/{trip}/messages            - send, returns canonical message
//!   POST {base}/api/trips/{trip}/messages/{id}/read  - mark read (idempotent)
//!
//! Sends use their own timeout; fetches and read receipts share the general
//! request timeout.
//!
//! Every non-2xx status, connection error, timeout or decode failure is a
//! `TransportError` carrying the endpoint.

use super::ChatApi;
use crate::config::ChatConfig;
use crate::error::{Operation, TransportError};
use crate::model::{Message, ServerId, ThreadSnapshot, TripId};
use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;

#[derive(Serialize)]
struct SendRequest<'a> {
    body: &'a str,
}

pub struct HttpChatApi {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
    request_timeout: Duration,
    send_timeout: Duration,
}

impl HttpChatApi {
    pub fn new(base_url: impl Into<String>, token: Option<String>, request_timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
            request_timeout,
            send_timeout: request_timeout,
        }
    }

    /// Use a different timeout for `send_message` than for the other routes.
    pub fn with_send_timeout(mut self, send_timeout: Duration) -> Self {
        self.send_timeout = send_timeout;
        self
    }

    pub fn from_config(config: &ChatConfig) -> Self {
        Self::new(
            config.base_url.clone(),
            config.token.clone(),
            config.request_timeout,
        )
        .with_send_timeout(config.send_timeout)
    }

    fn messages_url(&self, trip_id: &TripId) -> String {
        format!("{}/api/trips/{}/messages", self.base_url, trip_id)
    }

    fn request(
        &self,
        method: reqwest::Method,
        url: &str,
        timeout: Duration,
    ) -> reqwest::RequestBuilder {
        let builder = self.client.request(method, url).timeout(timeout);
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn execute(
        &self,
        operation: Operation,
        url: &str,
        builder: reqwest::RequestBuilder,
        timeout: Duration,
    ) -> Result<reqwest::Response, TransportError> {
        let response = builder.send().await.map_err(|e| {
            let reason = if e.is_timeout() {
                format!("timed out after {}ms", timeout.as_millis())
            } else {
                format!("request failed: {}", e)
            };
            TransportError::new(operation, url, reason)
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::new(
                operation,
                url,
                format!("HTTP {}: {}", status.as_u16(), body.trim()),
            ));
        }
        Ok(response)
    }
}

#[async_trait]
impl ChatApi for HttpChatApi {
    async fn fetch_thread(&self, trip_id: &TripId) -> Result<ThreadSnapshot, TransportError> {
        let url = self.messages_url(trip_id);
        let builder = self.request(reqwest::Method::GET, &url, self.request_timeout);
        let response = self
            .execute(Operation::FetchThread, &url, builder, self.request_timeout)
            .await?;

        response.json::<ThreadSnapshot>().await.map_err(|e| {
            TransportError::new(Operation::FetchThread, &url, format!("invalid response: {}", e))
        })
    }

    async fn send_message(&self, trip_id: &TripId, body: &str) -> Result<Message, TransportError> {
        let url = self.messages_url(trip_id);
        let builder = self
            .request(reqwest::Method::POST, &url, self.send_timeout)
            .json(&SendRequest { body });
        let response = self
            .execute(Operation::SendMessage, &url, builder, self.send_timeout)
            .await?;

        response.json::<Message>().await.map_err(|e| {
            TransportError::new(Operation::SendMessage, &url, format!("invalid response: {}", e))
        })
    }

    async fn mark_read(&self, trip_id: &TripId, message_id: &ServerId) -> Result<(), TransportError> {
        let url = format!("{}/{}/read", self.messages_url(trip_id), message_id);
        let builder = self.request(reqwest::Method::POST, &url, self.request_timeout);
        self.execute(Operation::MarkRead, &url, builder, self.request_timeout)
            .await?;
        Ok(())
    }
}
