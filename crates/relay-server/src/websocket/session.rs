//! Per-connection session lifecycle, from upgrade through teardown.
//!
//! Three tasks cooperate per connection:
//! - the **reader** (this function's main loop) consumes inbound frames
//!   under the read deadline,
//! - the **heartbeater** pings on an interval and trips the session token
//!   after too many missed pongs,
//! - the **forwarder** is the send lane's single consumer and the only
//!   writer to the socket.
//!
//! The first of them to fail cancels the shared token; teardown then
//! deregisters the client, drains the lane within a bounded deadline, and
//! releases the transport.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use relay_core::Message;

use super::handler;
use super::heartbeat::{run_heartbeat, HeartbeatResult};
use crate::config::HubConfig;
use crate::hub::client::{ClientRecord, Outbound};
use crate::hub::Hub;

/// Consecutive missed pongs before the session closes.
const MAX_MISSED_PONGS: u32 = 3;

/// How long teardown waits for the lane to drain before aborting the writer.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Session deadlines, derived from [`HubConfig`].
#[derive(Debug, Clone, Copy)]
pub struct SessionTimings {
    pub heartbeat_interval: Duration,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
}

impl SessionTimings {
    pub fn from_config(config: &HubConfig) -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(config.heartbeat_interval_secs),
            read_timeout: Duration::from_secs(config.read_timeout_secs),
            write_timeout: Duration::from_millis(config.send_timeout_ms),
        }
    }
}

/// Run a WebSocket session for a connected client.
///
/// 1. Registers the client and emits the `connected` frame with its id
/// 2. Spawns the outbound forwarder and the heartbeater
/// 3. Dispatches inbound frames until close, error, deadline, or shutdown
/// 4. Tears down: deregister, drain, release transport
#[instrument(skip_all, fields(client_id = %client.id))]
pub async fn run_session(
    socket: WebSocket,
    hub: Arc<Hub>,
    client: Arc<ClientRecord>,
    lane: mpsc::Receiver<Outbound>,
    timings: SessionTimings,
    server_cancel: CancellationToken,
) {
    hub.register(client.clone()).await;
    info!(remote_addr = %client.remote_addr, "client connected");

    let connected = Message::event(
        "connected",
        serde_json::json!({"client_id": client.id}),
    );
    if client.send(Arc::new(connected)).await.is_err() {
        warn!("send lane unusable at connect");
        let _ = hub.deregister(&client.id).await;
        return;
    }

    let (ws_tx, ws_rx) = socket.split();

    let forwarder = tokio::spawn(run_forwarder(
        ws_tx,
        lane,
        client.clone(),
        timings.write_timeout,
    ));

    let session_cancel = client.closed_token();
    let heartbeater = tokio::spawn({
        let client = client.clone();
        let cancel = session_cancel.clone();
        async move {
            let result = run_heartbeat(
                client.clone(),
                timings.heartbeat_interval,
                MAX_MISSED_PONGS,
                cancel,
            )
            .await;
            if result == HeartbeatResult::TimedOut {
                warn!(client_id = %client.id, "heartbeat timed out");
                let _ = client.close();
            }
        }
    });

    read_loop(
        ws_rx,
        &hub,
        &client,
        timings.read_timeout,
        &session_cancel,
        &server_cancel,
    )
    .await;

    // Teardown. Closing enqueues the transport close behind any pending
    // frames, so draining the lane drains all pending writes.
    let _ = client.close();
    let _ = hub.deregister(&client.id).await;
    heartbeater.abort();

    let forwarder_abort = forwarder.abort_handle();
    if timeout(DRAIN_TIMEOUT, forwarder).await.is_err() {
        warn!("lane drain deadline exceeded, aborting writer");
        forwarder_abort.abort();
    }
    client.finalize();
    info!("client disconnected");
}

async fn read_loop(
    mut ws_rx: SplitStream<WebSocket>,
    hub: &Arc<Hub>,
    client: &Arc<ClientRecord>,
    read_timeout: Duration,
    session_cancel: &CancellationToken,
    server_cancel: &CancellationToken,
) {
    loop {
        tokio::select! {
            () = session_cancel.cancelled() => {
                debug!("session cancelled");
                return;
            }
            () = server_cancel.cancelled() => {
                info!("server shutting down, closing session");
                return;
            }
            next = timeout(read_timeout, ws_rx.next()) => {
                match next {
                    Err(_) => {
                        info!(timeout_secs = read_timeout.as_secs(), "read deadline exceeded");
                        return;
                    }
                    Ok(None) => {
                        info!("connection closed by peer");
                        return;
                    }
                    Ok(Some(Err(err))) => {
                        warn!(error = %err, "read error");
                        return;
                    }
                    Ok(Some(Ok(frame))) => match frame {
                        WsMessage::Text(text) => {
                            client.touch();
                            handler::dispatch(hub, client, text.as_str()).await;
                        }
                        WsMessage::Binary(data) => match std::str::from_utf8(&data) {
                            Ok(text) => {
                                client.touch();
                                handler::dispatch(hub, client, text).await;
                            }
                            Err(_) => {
                                info!(len = data.len(), "ignoring non-UTF8 binary frame");
                            }
                        },
                        // The transport layer answers pings on its own;
                        // either control frame proves the peer is alive.
                        WsMessage::Ping(_) => client.mark_alive(),
                        WsMessage::Pong(_) => {
                            client.mark_alive();
                            client.touch();
                        }
                        WsMessage::Close(_) => {
                            info!("client sent close frame");
                            return;
                        }
                    },
                }
            }
        }
    }
}

/// Lane consumer: serializes frames and performs every socket write.
async fn run_forwarder(
    mut ws_tx: SplitSink<WebSocket, WsMessage>,
    mut lane: mpsc::Receiver<Outbound>,
    client: Arc<ClientRecord>,
    write_timeout: Duration,
) {
    while let Some(item) = lane.recv().await {
        let frame = match item {
            Outbound::Frame(message) => match serde_json::to_string(&*message) {
                Ok(json) => WsMessage::Text(json.into()),
                Err(err) => {
                    warn!(client_id = %client.id, error = %err, "frame serialization failed");
                    continue;
                }
            },
            Outbound::Ping => WsMessage::Ping(Vec::new().into()),
            Outbound::Close => {
                let _ = ws_tx.send(WsMessage::Close(None)).await;
                break;
            }
        };

        match timeout(write_timeout, ws_tx.send(frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                debug!(client_id = %client.id, error = %err, "socket write failed");
                let _ = client.close();
                break;
            }
            Err(_) => {
                warn!(
                    client_id = %client.id,
                    timeout_ms = write_timeout.as_millis() as u64,
                    "socket write deadline exceeded"
                );
                let _ = client.close();
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    // The session loop needs a live WebSocket on both ends; full lifecycle
    // coverage lives in tests/integration.rs. These tests cover the pieces
    // with no transport dependency.

    use super::*;

    #[test]
    fn timings_derive_from_config() {
        let config = HubConfig {
            heartbeat_interval_secs: 7,
            read_timeout_secs: 42,
            send_timeout_ms: 123,
            ..HubConfig::default()
        };
        let timings = SessionTimings::from_config(&config);
        assert_eq!(timings.heartbeat_interval, Duration::from_secs(7));
        assert_eq!(timings.read_timeout, Duration::from_secs(42));
        assert_eq!(timings.write_timeout, Duration::from_millis(123));
    }

    #[test]
    fn connected_frame_shape() {
        let msg = Message::event("connected", serde_json::json!({"client_id": "c1"}));
        assert_eq!(msg.event, "connected");
        assert_eq!(msg.data["client_id"], "c1");
        let wire = serde_json::to_value(&msg).unwrap();
        assert!(wire.get("channel").is_none());
    }

    #[test]
    fn missed_pong_limit_is_three() {
        assert_eq!(MAX_MISSED_PONGS, 3);
    }
}
