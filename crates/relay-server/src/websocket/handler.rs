//! Inbound frame dispatch.
//!
//! Client frames are JSON objects with at least an `action` field. Known
//! actions are handled here; anything else is forwarded to the handler
//! bridge untouched, so consumers can extend the protocol without hub
//! changes.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use relay_core::Message;

use crate::hub::client::{ClientRecord, Identity};
use crate::hub::{Hub, JoinError};

/// Dispatch one inbound text frame.
pub async fn dispatch(hub: &Arc<Hub>, client: &Arc<ClientRecord>, text: &str) {
    let Ok(frame) = serde_json::from_str::<Value>(text) else {
        reply(client, Message::error("Invalid message format")).await;
        return;
    };
    let Some(action) = frame.get("action").and_then(Value::as_str) else {
        reply(client, Message::error("Invalid message format")).await;
        return;
    };

    debug!(client_id = %client.id, action, "frame received");
    match action {
        "authenticate" => handle_authenticate(hub, client, &frame).await,
        "join_channel" => handle_join(hub, client, &frame).await,
        "leave_channel" => handle_leave(hub, client, &frame).await,
        "send_message" => handle_send(hub, client, &frame).await,
        "ping" => handle_ping(client).await,
        _ => forward_unknown(hub, client, action, &frame).await,
    }
}

async fn handle_authenticate(hub: &Arc<Hub>, client: &Arc<ClientRecord>, frame: &Value) {
    let Some(token) = frame.get("token").and_then(Value::as_str) else {
        reply(client, Message::error("Invalid token format")).await;
        return;
    };

    match hub.verifier.verify(token) {
        Ok(claims) => {
            let identity = Identity {
                user_id: claims.user_id.clone(),
                username: claims.username.clone(),
                email: claims.email.clone(),
            };
            if client.bind_identity(identity).is_err() {
                warn!(client_id = %client.id, user_id = %claims.user_id, "authenticate for a different user refused");
                reply(client, Message::error("Identity already bound to a different user")).await;
                return;
            }

            debug!(client_id = %client.id, user_id = %claims.user_id, "client authenticated");
            reply(
                client,
                Message::event(
                    "authenticated",
                    serde_json::json!({
                        "user_id": claims.user_id,
                        "username": claims.username,
                    }),
                ),
            )
            .await;
            dispatch_auth_event(hub, client, "success", true);
        }
        Err(err) => {
            warn!(client_id = %client.id, error = %err, "authentication failed");
            reply(client, Message::error(err.to_string())).await;
            dispatch_auth_event(hub, client, "failed", !token.is_empty());
        }
    }
}

async fn handle_join(hub: &Arc<Hub>, client: &Arc<ClientRecord>, frame: &Value) {
    let Some(channel) = non_empty_str(frame.get("channel")) else {
        reply(client, Message::error("Invalid channel name")).await;
        return;
    };
    let data = frame.get("data").cloned().unwrap_or(Value::Null);

    // The hub enqueues the joined_channel confirmation itself, ahead of
    // any channel traffic.
    match hub.join_channel(client, channel, data).await {
        Ok(()) => {
            debug!(client_id = %client.id, channel, "joined channel");
        }
        Err(JoinError::AuthRequired) => {
            warn!(client_id = %client.id, channel, "join denied: authentication required");
            reply(client, Message::error("Channel requires authentication")).await;
        }
    }
}

async fn handle_leave(hub: &Arc<Hub>, client: &Arc<ClientRecord>, frame: &Value) {
    let Some(channel) = non_empty_str(frame.get("channel")) else {
        reply(client, Message::error("Invalid channel name")).await;
        return;
    };

    match hub.leave_channel(client, channel).await {
        Ok(()) => {
            debug!(client_id = %client.id, channel, "left channel");
            reply(
                client,
                Message::event("left_channel", serde_json::json!({"channel": channel})),
            )
            .await;
        }
        Err(_) => {
            reply(client, Message::error("Channel not found")).await;
        }
    }
}

async fn handle_send(hub: &Arc<Hub>, client: &Arc<ClientRecord>, frame: &Value) {
    let Some(channel) = non_empty_str(frame.get("channel")) else {
        reply(client, Message::error("Invalid channel name")).await;
        return;
    };
    if let Some(target) = hub.get_channel(channel).await {
        if target.requires_auth() && !client.is_authenticated() {
            warn!(client_id = %client.id, channel, "send denied: authentication required");
            reply(client, Message::error("Channel requires authentication")).await;
            return;
        }
    }
    let event = frame
        .get("event")
        .and_then(Value::as_str)
        .unwrap_or("message");
    let data = frame.get("data").cloned().unwrap_or(Value::Null);

    let identity = client.identity();
    let message = Message::new(channel, event, data).with_sender(
        identity.as_ref().map(|i| i.user_id.clone()),
        identity.as_ref().and_then(|i| i.username.clone()),
    );

    // Handler dispatch never blocks the broadcast.
    spawn_bridge_dispatch(hub, client, message.clone());
    let _ = hub.broadcast_to_channel(channel, message).await;
}

async fn handle_ping(client: &Arc<ClientRecord>) {
    client.touch();
    reply(client, Message::event("pong", Value::Null)).await;
}

/// Unknown actions go to the handler process as-is.
async fn forward_unknown(hub: &Arc<Hub>, client: &Arc<ClientRecord>, action: &str, frame: &Value) {
    debug!(client_id = %client.id, action, "forwarding unknown action to handler");
    let channel = frame
        .get("channel")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let identity = client.identity();
    let message = Message::new(channel, action, frame.clone()).with_sender(
        identity.as_ref().map(|i| i.user_id.clone()),
        identity.as_ref().and_then(|i| i.username.clone()),
    );
    spawn_bridge_dispatch(hub, client, message);
}

fn spawn_bridge_dispatch(hub: &Arc<Hub>, client: &Arc<ClientRecord>, message: Message) {
    let bridge = hub.bridge.clone();
    let sender = client.sender_info();
    let _ = tokio::spawn(async move {
        if let Err(err) = bridge.dispatch_message(&message, &sender).await {
            warn!(error = %err, "handler dispatch failed");
        }
    });
}

fn dispatch_auth_event(hub: &Arc<Hub>, client: &Arc<ClientRecord>, status: &'static str, token_provided: bool) {
    let bridge = hub.bridge.clone();
    let sender = client.sender_info();
    let _ = tokio::spawn(async move {
        if let Err(err) = bridge
            .dispatch_authentication(&sender, status, token_provided)
            .await
        {
            warn!(error = %err, "authentication event dispatch failed");
        }
    });
}

async fn reply(client: &Arc<ClientRecord>, message: Message) {
    if let Err(err) = client.send(Arc::new(message)).await {
        // The session loop notices the broken lane on its own.
        debug!(client_id = %client.id, error = %err, "reply not enqueued");
    }
}

fn non_empty_str(value: Option<&Value>) -> Option<&str> {
    value.and_then(Value::as_str).filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::HandlerBridge;
    use crate::config::{HandlerConfig, HubConfig};
    use crate::hub::client::Outbound;
    use relay_auth::TokenVerifier;
    use std::time::Duration;
    use tokio::sync::mpsc;

    const SECRET: &str = "dispatch-test-secret";

    fn make_hub(temp: &std::path::Path) -> Arc<Hub> {
        let config = HubConfig {
            jwt_secret: SECRET.into(),
            admin_token: "admin".into(),
            handler: HandlerConfig {
                working_dir: temp.to_path_buf(),
                binary: "echo".into(),
                command: "handled".into(),
            },
            temp_dir: temp.to_path_buf(),
            send_timeout_ms: 50,
            broadcast_deadline_ms: 200,
            ..HubConfig::default()
        };
        let bridge = Arc::new(HandlerBridge::new(&config));
        bridge.init_temp_dir().unwrap();
        Arc::new(Hub::new(TokenVerifier::new(SECRET), bridge, &config))
    }

    async fn connect(hub: &Arc<Hub>, id: &str) -> (Arc<ClientRecord>, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(32);
        let record = Arc::new(ClientRecord::new(
            id.into(),
            "127.0.0.1:1".into(),
            "test".into(),
            tx,
            Duration::from_millis(50),
        ));
        hub.register(record.clone()).await;
        (record, rx)
    }

    async fn next_frame(rx: &mut mpsc::Receiver<Outbound>) -> Arc<Message> {
        match tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("no frame")
            .expect("lane closed")
        {
            Outbound::Frame(m) => m,
            other => panic!("expected frame, got {other:?}"),
        }
    }

    fn token_for(user_id: &str) -> String {
        relay_auth::mint(
            SECRET,
            user_id,
            Some("alice"),
            Some("alice@example.com"),
            chrono::Utc::now().timestamp(),
            3600,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn malformed_json_yields_error_frame() {
        let temp = tempfile::tempdir().unwrap();
        let hub = make_hub(temp.path());
        let (client, mut rx) = connect(&hub, "c1").await;

        dispatch(&hub, &client, "this is not json").await;
        let frame = next_frame(&mut rx).await;
        assert_eq!(frame.event, "error");
        assert_eq!(frame.data["error"], "Invalid message format");
        // Connection stays registered.
        assert!(hub.get_client("c1").await.is_some());
    }

    #[tokio::test]
    async fn missing_action_yields_error_frame() {
        let temp = tempfile::tempdir().unwrap();
        let hub = make_hub(temp.path());
        let (client, mut rx) = connect(&hub, "c1").await;

        dispatch(&hub, &client, r#"{"channel":"room1"}"#).await;
        assert_eq!(next_frame(&mut rx).await.data["error"], "Invalid message format");
    }

    #[tokio::test]
    async fn authenticate_success_binds_identity() {
        let temp = tempfile::tempdir().unwrap();
        let hub = make_hub(temp.path());
        let (client, mut rx) = connect(&hub, "c1").await;

        let frame = format!(r#"{{"action":"authenticate","token":"{}"}}"#, token_for("u1"));
        dispatch(&hub, &client, &frame).await;

        let reply = next_frame(&mut rx).await;
        assert_eq!(reply.event, "authenticated");
        assert_eq!(reply.data["user_id"], "u1");
        assert_eq!(client.user_id().as_deref(), Some("u1"));
    }

    #[tokio::test]
    async fn authenticate_expired_token_reports_expiry() {
        let temp = tempfile::tempdir().unwrap();
        let hub = make_hub(temp.path());
        let (client, mut rx) = connect(&hub, "c1").await;

        let expired = relay_auth::mint(
            SECRET,
            "u1",
            None,
            None,
            chrono::Utc::now().timestamp() - 7200,
            3600,
        )
        .unwrap();
        let frame = format!(r#"{{"action":"authenticate","token":"{expired}"}}"#);
        dispatch(&hub, &client, &frame).await;

        let reply = next_frame(&mut rx).await;
        assert_eq!(reply.event, "error");
        assert_eq!(reply.data["error"], "token expired");
        assert!(client.user_id().is_none());
    }

    #[tokio::test]
    async fn authenticate_missing_token_field() {
        let temp = tempfile::tempdir().unwrap();
        let hub = make_hub(temp.path());
        let (client, mut rx) = connect(&hub, "c1").await;

        dispatch(&hub, &client, r#"{"action":"authenticate"}"#).await;
        assert_eq!(next_frame(&mut rx).await.data["error"], "Invalid token format");
    }

    #[tokio::test]
    async fn reauthenticate_as_other_user_refused() {
        let temp = tempfile::tempdir().unwrap();
        let hub = make_hub(temp.path());
        let (client, mut rx) = connect(&hub, "c1").await;

        let first = format!(r#"{{"action":"authenticate","token":"{}"}}"#, token_for("u1"));
        dispatch(&hub, &client, &first).await;
        let _ = next_frame(&mut rx).await;

        let second = format!(r#"{{"action":"authenticate","token":"{}"}}"#, token_for("u2"));
        dispatch(&hub, &client, &second).await;
        let reply = next_frame(&mut rx).await;
        assert_eq!(reply.event, "error");
        assert_eq!(reply.data["error"], "Identity already bound to a different user");
        assert_eq!(client.user_id().as_deref(), Some("u1"));
    }

    #[tokio::test]
    async fn join_and_leave_roundtrip() {
        let temp = tempfile::tempdir().unwrap();
        let hub = make_hub(temp.path());
        let (client, mut rx) = connect(&hub, "c1").await;

        dispatch(&hub, &client, r#"{"action":"join_channel","channel":"room1","data":{"seat":2}}"#)
            .await;
        let joined = next_frame(&mut rx).await;
        assert_eq!(joined.event, "joined_channel");
        assert_eq!(joined.data["channel"], "room1");
        assert_eq!(client.membership("room1").unwrap().data["seat"], 2);

        dispatch(&hub, &client, r#"{"action":"leave_channel","channel":"room1"}"#).await;
        let left = next_frame(&mut rx).await;
        assert_eq!(left.event, "left_channel");
        assert!(!client.is_member("room1"));
    }

    #[tokio::test]
    async fn join_auth_required_channel_denied_when_anonymous() {
        let temp = tempfile::tempdir().unwrap();
        let hub = make_hub(temp.path());
        hub.configure_channel("secret", true, false).await;
        let (client, mut rx) = connect(&hub, "c1").await;

        dispatch(&hub, &client, r#"{"action":"join_channel","channel":"secret"}"#).await;
        let reply = next_frame(&mut rx).await;
        assert_eq!(reply.event, "error");
        assert_eq!(reply.data["error"], "Channel requires authentication");
        assert_eq!(hub.get_channel("secret").await.unwrap().member_count(), 0);
    }

    #[tokio::test]
    async fn leave_unknown_channel_errors() {
        let temp = tempfile::tempdir().unwrap();
        let hub = make_hub(temp.path());
        let (client, mut rx) = connect(&hub, "c1").await;

        dispatch(&hub, &client, r#"{"action":"leave_channel","channel":"ghost"}"#).await;
        assert_eq!(next_frame(&mut rx).await.data["error"], "Channel not found");
    }

    #[tokio::test]
    async fn send_message_broadcasts_to_members() {
        let temp = tempfile::tempdir().unwrap();
        let hub = make_hub(temp.path());
        let (a, mut rxa) = connect(&hub, "a").await;
        let (b, mut rxb) = connect(&hub, "b").await;
        dispatch(&hub, &a, r#"{"action":"join_channel","channel":"room1"}"#).await;
        dispatch(&hub, &b, r#"{"action":"join_channel","channel":"room1"}"#).await;
        let _ = next_frame(&mut rxa).await;
        let _ = next_frame(&mut rxb).await;

        dispatch(
            &hub,
            &a,
            r#"{"action":"send_message","channel":"room1","event":"chat","data":{"text":"hi"}}"#,
        )
        .await;

        let got_a = next_frame(&mut rxa).await;
        let got_b = next_frame(&mut rxb).await;
        assert_eq!(got_a.event, "chat");
        assert_eq!(got_a.data["text"], "hi");
        assert_eq!(got_a.id, got_b.id);
    }

    #[tokio::test]
    async fn send_message_carries_sender_identity() {
        let temp = tempfile::tempdir().unwrap();
        let hub = make_hub(temp.path());
        let (a, mut rxa) = connect(&hub, "a").await;

        let auth = format!(r#"{{"action":"authenticate","token":"{}"}}"#, token_for("u1"));
        dispatch(&hub, &a, &auth).await;
        let _ = next_frame(&mut rxa).await;
        dispatch(&hub, &a, r#"{"action":"join_channel","channel":"room1"}"#).await;
        let _ = next_frame(&mut rxa).await;

        dispatch(
            &hub,
            &a,
            r#"{"action":"send_message","channel":"room1","event":"chat","data":1}"#,
        )
        .await;
        let frame = next_frame(&mut rxa).await;
        assert_eq!(frame.user_id.as_deref(), Some("u1"));
        assert_eq!(frame.username.as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn send_message_defaults_event_name() {
        let temp = tempfile::tempdir().unwrap();
        let hub = make_hub(temp.path());
        let (a, mut rxa) = connect(&hub, "a").await;
        dispatch(&hub, &a, r#"{"action":"join_channel","channel":"room1"}"#).await;
        let _ = next_frame(&mut rxa).await;

        dispatch(&hub, &a, r#"{"action":"send_message","channel":"room1","data":1}"#).await;
        assert_eq!(next_frame(&mut rxa).await.event, "message");
    }

    #[tokio::test]
    async fn send_to_auth_required_channel_denied_when_anonymous() {
        let temp = tempfile::tempdir().unwrap();
        let hub = make_hub(temp.path());
        hub.configure_channel("secret", true, false).await;
        let (client, mut rx) = connect(&hub, "c1").await;

        dispatch(
            &hub,
            &client,
            r#"{"action":"send_message","channel":"secret","event":"chat","data":1}"#,
        )
        .await;
        let reply = next_frame(&mut rx).await;
        assert_eq!(reply.event, "error");
        assert_eq!(reply.data["error"], "Channel requires authentication");
    }

    #[tokio::test]
    async fn ping_replies_pong_and_touches() {
        let temp = tempfile::tempdir().unwrap();
        let hub = make_hub(temp.path());
        let (client, mut rx) = connect(&hub, "c1").await;

        let before = client.last_seen();
        tokio::time::sleep(Duration::from_millis(5)).await;
        dispatch(&hub, &client, r#"{"action":"ping"}"#).await;
        assert_eq!(next_frame(&mut rx).await.event, "pong");
        assert!(client.last_seen() > before);
    }

    #[tokio::test]
    async fn unknown_action_forwards_without_reply() {
        let temp = tempfile::tempdir().unwrap();
        let hub = make_hub(temp.path());
        let (client, mut rx) = connect(&hub, "c1").await;

        dispatch(&hub, &client, r#"{"action":"custom_thing","payload":{"x":1}}"#).await;
        // No frame back for forwarded actions.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
    }
}
