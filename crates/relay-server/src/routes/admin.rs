//! Bearer-protected administrative endpoints.

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use relay_core::{HubError, Message};

use crate::health;
use crate::server::AppState;

/// JSON error envelope with a precise status code.
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(json!({"status": "error", "message": self.message})),
        )
            .into_response()
    }
}

/// GET /health
pub async fn health(State(state): State<AppState>) -> Json<health::HealthResponse> {
    let clients = state.hub.client_count().await;
    let channels = state.hub.channel_count().await;
    Json(health::health_check(state.start_time, clients, channels))
}

/// GET /clients
pub async fn list_clients(State(state): State<AppState>) -> Json<Value> {
    let clients = state.hub.client_summaries().await;
    Json(json!({"total": clients.len(), "clients": clients}))
}

/// GET /channels
pub async fn list_channels(State(state): State<AppState>) -> Json<Value> {
    let channels = state.hub.channel_summaries().await;
    Json(serde_json::to_value(channels).unwrap_or_else(|_| json!({})))
}

/// GET /channels/{channel}/clients
pub async fn channel_clients(
    State(state): State<AppState>,
    Path(channel): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let Some(record) = state.hub.get_channel(&channel).await else {
        return Err(ApiError::not_found("Channel not found"));
    };

    let mut clients = Vec::new();
    for id in record.members() {
        if let Some(member) = state.hub.get_client(&id).await {
            clients.push(member.summary());
        }
    }
    Ok(Json(json!({
        "channel": channel,
        "total": clients.len(),
        "clients": clients,
    })))
}

/// POST /clients/{client}/kick
pub async fn kick_client(
    State(state): State<AppState>,
    Path(client): Path<String>,
) -> Result<Json<Value>, ApiError> {
    match state.hub.kick(&client).await {
        Ok(()) => Ok(Json(json!({
            "status": "success",
            "message": format!("Client {client} kicked"),
        }))),
        Err(HubError::ClientNotFound) => Err(ApiError::not_found("Client not found")),
        Err(err) => Err(ApiError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            err.to_string(),
        )),
    }
}

/// Body of POST /broadcast. The legacy boolean fields predate
/// `broadcast_type` and are honored when it is absent.
#[derive(Debug, Default, Deserialize)]
pub struct BroadcastRequest {
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub event: Option<String>,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub broadcast_type: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub broadcast_to_everyone: bool,
    #[serde(default)]
    pub exclude_current_user: bool,
}

impl BroadcastRequest {
    /// Explicit `broadcast_type` wins; otherwise infer from legacy fields.
    pub fn resolve_type(&self) -> String {
        if let Some(t) = &self.broadcast_type {
            if !t.is_empty() {
                return t.clone();
            }
        }
        let has_user = self.user_id.as_deref().is_some_and(|u| !u.is_empty());
        if self.broadcast_to_everyone {
            "global".into()
        } else if self.exclude_current_user && has_user {
            "user_except".into()
        } else if has_user {
            "user".into()
        } else if self.channel.as_deref().is_some_and(|c| !c.is_empty()) {
            "channel".into()
        } else {
            "global".into()
        }
    }
}

/// POST /broadcast
pub async fn broadcast(
    State(state): State<AppState>,
    body: Result<Json<BroadcastRequest>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(request) = body
        .map_err(|rejection| ApiError::bad_request(format!("Invalid JSON payload: {rejection}")))?;

    let event = match request.event.as_deref() {
        Some(e) if !e.is_empty() => e.to_string(),
        _ => "broadcast".to_string(),
    };
    let channel = request.channel.clone().unwrap_or_default();
    let message = Message::new(channel.clone(), event, request.data.clone());

    let broadcast_type = request.resolve_type();
    let response_message = match broadcast_type.as_str() {
        "global" => {
            let _ = state.hub.broadcast_to_all(message).await;
            "Message broadcasted to all clients".to_string()
        }
        "authenticated" => {
            let _ = state.hub.broadcast_to_authenticated(message).await;
            "Message broadcasted to all authenticated clients".to_string()
        }
        "user" => {
            let user_id = request
                .user_id
                .as_deref()
                .filter(|u| !u.is_empty())
                .ok_or_else(|| ApiError::bad_request("user_id is required for user broadcast"))?;
            let _ = state.hub.broadcast_to_user(user_id, message).await;
            format!("Message broadcasted to user {user_id}")
        }
        "user_except" => {
            let user_id = request
                .user_id
                .as_deref()
                .filter(|u| !u.is_empty())
                .ok_or_else(|| {
                    ApiError::bad_request("user_id is required for user_except broadcast")
                })?;
            let _ = state.hub.broadcast_to_users_except(user_id, message).await;
            format!("Message broadcasted to all authenticated clients except user {user_id}")
        }
        "client" => {
            let client_id = request
                .client_id
                .as_deref()
                .filter(|c| !c.is_empty())
                .ok_or_else(|| {
                    ApiError::bad_request("client_id is required for client broadcast")
                })?;
            match state.hub.send_to_client(client_id, message).await {
                Ok(()) => format!("Message sent to client {client_id}"),
                Err(HubError::ClientNotFound) => {
                    return Err(ApiError::not_found("Client not found"))
                }
                Err(err) => {
                    return Err(ApiError::new(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        err.to_string(),
                    ))
                }
            }
        }
        "channel" => {
            if channel.is_empty() {
                return Err(ApiError::bad_request(
                    "channel is required for channel broadcast",
                ));
            }
            let _ = state.hub.broadcast_to_channel(&channel, message).await;
            format!("Message broadcasted to channel {channel}")
        }
        other => {
            return Err(ApiError::bad_request(format!(
                "Invalid broadcast_type '{other}'. Must be: global, authenticated, user, user_except, client, or channel"
            )))
        }
    };

    info!(broadcast_type = %broadcast_type, "admin broadcast dispatched");
    Ok(Json(json!({
        "status": "success",
        "message": response_message,
        "type": broadcast_type,
    })))
}

/// Body of POST /channels — channel policy configuration.
#[derive(Debug, Deserialize)]
pub struct ChannelPolicyRequest {
    pub name: String,
    #[serde(default)]
    pub require_auth: bool,
    #[serde(default)]
    pub is_private: bool,
}

/// POST /channels
pub async fn configure_channel(
    State(state): State<AppState>,
    body: Result<Json<ChannelPolicyRequest>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(request) = body
        .map_err(|rejection| ApiError::bad_request(format!("Invalid JSON payload: {rejection}")))?;
    if request.name.is_empty() {
        return Err(ApiError::bad_request("channel name cannot be empty"));
    }

    let channel = state
        .hub
        .configure_channel(&request.name, request.require_auth, request.is_private)
        .await;
    Ok(Json(json!({
        "status": "success",
        "message": format!("Channel {} configured", request.name),
        "channel": channel.summary(),
    })))
}
