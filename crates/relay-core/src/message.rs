//! The server-to-client wire envelope.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A message delivered to client connections.
///
/// Serializes to the wire format
/// `{id, channel?, event, data, user_id?, username?, timestamp}` with an
/// RFC-3339 timestamp. The payload in `data` is opaque to the hub.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Fresh id per message.
    pub id: String,
    /// Target channel; empty for targeted or connection-level frames.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub channel: String,
    /// Event name (`connected`, `joined_channel`, `error`, … or app-defined).
    pub event: String,
    /// Opaque payload.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
    /// Originating user id, when the sender was authenticated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Originating username, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    /// Create a message with a fresh id and current timestamp.
    pub fn new(channel: impl Into<String>, event: impl Into<String>, data: Value) -> Self {
        Self {
            id: uuid::Uuid::now_v7().to_string(),
            channel: channel.into(),
            event: event.into(),
            data,
            user_id: None,
            username: None,
            timestamp: Utc::now(),
        }
    }

    /// Create a channel-less event frame (connection lifecycle, errors, pong).
    pub fn event(event: impl Into<String>, data: Value) -> Self {
        Self::new(String::new(), event, data)
    }

    /// Standard `error` frame with a descriptive message.
    pub fn error(text: impl Into<String>) -> Self {
        Self::event("error", serde_json::json!({ "error": text.into() }))
    }

    /// Attach the sender's identity.
    #[must_use]
    pub fn with_sender(mut self, user_id: Option<String>, username: Option<String>) -> Self {
        self.user_id = user_id;
        self.username = username;
        self
    }
}
