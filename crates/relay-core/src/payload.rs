//! The payload handed to the external handler process.
//!
//! The on-disk shape is a stable contract: operators may point alternative
//! consumers at the payload directory, so field names here must not change
//! between releases.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::message::Message;

/// Connection-level facts about the originating client, captured at
/// dispatch time so the bridge never holds a live record reference.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SenderInfo {
    pub id: String,
    pub user_id: Option<String>,
    pub username: Option<String>,
    pub email: Option<String>,
    pub remote_addr: String,
}

/// The `auth` block of a handler payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthContext {
    pub user_id: String,
    pub user_email: String,
    pub logged_at: DateTime<Utc>,
    /// Connection id of the originating client.
    pub id: String,
    pub username: String,
    pub remote_addr: String,
}

impl AuthContext {
    fn from_sender(sender: &SenderInfo) -> Self {
        Self {
            user_id: sender.user_id.clone().unwrap_or_default(),
            user_email: sender.email.clone().unwrap_or_default(),
            logged_at: Utc::now(),
            id: sender.id.clone(),
            username: sender.username.clone().unwrap_or_default(),
            remote_addr: sender.remote_addr.clone(),
        }
    }
}

/// Normalized object written to the payload file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandlerPayload {
    pub message_id: String,
    pub timestamp: DateTime<Utc>,
    pub action: String,
    pub auth: AuthContext,
    pub data: Value,
}

impl HandlerPayload {
    /// Payload for a client-originated message (`send_message` or an
    /// unknown action forwarded as-is).
    pub fn for_message(message: &Message, sender: &SenderInfo) -> Self {
        Self {
            message_id: uuid::Uuid::now_v7().to_string(),
            timestamp: Utc::now(),
            action: message.event.clone(),
            auth: AuthContext::from_sender(sender),
            data: serde_json::json!({
                "id": message.id,
                "channel": message.channel,
                "event": message.event,
                "data": message.data,
                "timestamp": message.timestamp,
            }),
        }
    }

    /// Payload for a `client_authentication` event.
    pub fn for_authentication(sender: &SenderInfo, status: &str, token_provided: bool) -> Self {
        Self {
            message_id: uuid::Uuid::now_v7().to_string(),
            timestamp: Utc::now(),
            action: "client_authentication".into(),
            auth: AuthContext::from_sender(sender),
            data: serde_json::json!({
                "authentication_status": status,
                "token_provided": token_provided,
            }),
        }
    }
}
