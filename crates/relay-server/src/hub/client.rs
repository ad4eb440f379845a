//! Per-connection client record.
//!
//! The record owns the connection's send lane: a bounded queue whose single
//! consumer (the session's outbound forwarder) is the only task that writes
//! to the transport. Broadcasters enqueue; nothing else touches the socket.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio_util::sync::CancellationToken;

use relay_core::{Message, SendError, SenderInfo};

/// Items travelling down a client's send lane. Transport pings and the
/// final close ride the same lane so the forwarder stays the sole writer.
#[derive(Debug, Clone)]
pub enum Outbound {
    Frame(Arc<Message>),
    Ping,
    Close,
}

/// Connection liveness, monotonic: `Alive → Closing → Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Alive,
    Closing,
    Closed,
}

const STATE_ALIVE: u8 = 0;
const STATE_CLOSING: u8 = 1;
const STATE_CLOSED: u8 = 2;

/// Identity bound after a successful token verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    pub username: Option<String>,
    pub email: Option<String>,
}

/// Per-membership metadata stored alongside the channel flag.
#[derive(Debug, Clone, Serialize)]
pub struct MembershipMeta {
    pub joined_at: DateTime<Utc>,
    pub data: Value,
}

/// A second identity bind resolving to a different user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("identity already bound to a different user")]
pub struct IdentityConflict;

/// State for one connected client.
pub struct ClientRecord {
    /// Server-assigned connection id, unique per connection.
    pub id: String,
    pub remote_addr: String,
    pub user_agent: String,
    pub connected_at: DateTime<Utc>,
    identity: RwLock<Option<Identity>>,
    /// channel name → membership metadata; flag and metadata live in one
    /// map so they are always removed together.
    memberships: RwLock<HashMap<String, MembershipMeta>>,
    last_seen: Mutex<DateTime<Utc>>,
    liveness: AtomicU8,
    /// Whether the client has responded since the last heartbeat check.
    pub is_alive: AtomicBool,
    /// Cancelled when the record enters `Closing`; the session loop exits on it.
    cancel: CancellationToken,
    tx: mpsc::Sender<Outbound>,
    send_timeout: Duration,
}

impl ClientRecord {
    pub fn new(
        id: String,
        remote_addr: String,
        user_agent: String,
        tx: mpsc::Sender<Outbound>,
        send_timeout: Duration,
    ) -> Self {
        Self {
            id,
            remote_addr,
            user_agent,
            connected_at: Utc::now(),
            identity: RwLock::new(None),
            memberships: RwLock::new(HashMap::new()),
            last_seen: Mutex::new(Utc::now()),
            liveness: AtomicU8::new(STATE_ALIVE),
            is_alive: AtomicBool::new(true),
            cancel: CancellationToken::new(),
            tx,
            send_timeout,
        }
    }

    pub fn liveness(&self) -> Liveness {
        match self.liveness.load(Ordering::Acquire) {
            STATE_ALIVE => Liveness::Alive,
            STATE_CLOSING => Liveness::Closing,
            _ => Liveness::Closed,
        }
    }

    pub fn is_open(&self) -> bool {
        self.liveness() == Liveness::Alive
    }

    /// Enqueue a frame onto the send lane.
    ///
    /// Fails with [`SendError::Closed`] when the record is no longer alive,
    /// and with [`SendError::Overflow`] when the lane stays full past the
    /// write deadline; the caller is expected to evict on either.
    pub async fn send(&self, message: Arc<Message>) -> Result<(), SendError> {
        if !self.is_open() {
            return Err(SendError::Closed);
        }
        match self
            .tx
            .send_timeout(Outbound::Frame(message), self.send_timeout)
            .await
        {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(_)) => Err(SendError::Overflow),
            Err(SendTimeoutError::Closed(_)) => Err(SendError::Closed),
        }
    }

    /// Enqueue a transport ping without blocking. Returns `false` when the
    /// lane is full or the record is closing; treated as a missed beat.
    pub fn try_ping(&self) -> bool {
        self.is_open() && self.tx.try_send(Outbound::Ping).is_ok()
    }

    /// Transition `Alive → Closing`. Idempotent; only the first call wins.
    ///
    /// Enqueues a transport close (best effort), then cancels the session
    /// token so the reader stops regardless of lane state.
    pub fn close(&self) -> bool {
        let initiated = self
            .liveness
            .compare_exchange(STATE_ALIVE, STATE_CLOSING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if initiated {
            let _ = self.tx.try_send(Outbound::Close);
            self.cancel.cancel();
        }
        initiated
    }

    /// Transition `Closing → Closed` once teardown released the transport.
    pub fn finalize(&self) {
        self.liveness.store(STATE_CLOSED, Ordering::Release);
    }

    /// Token cancelled when the record starts closing.
    pub fn closed_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Bind identity from verified claims. Idempotent for the same user id;
    /// a different user id is rejected.
    pub fn bind_identity(&self, identity: Identity) -> Result<(), IdentityConflict> {
        let mut guard = self.identity.write();
        match guard.as_ref() {
            Some(current) if current.user_id != identity.user_id => Err(IdentityConflict),
            _ => {
                *guard = Some(identity);
                Ok(())
            }
        }
    }

    pub fn identity(&self) -> Option<Identity> {
        self.identity.read().clone()
    }

    pub fn user_id(&self) -> Option<String> {
        self.identity.read().as_ref().map(|i| i.user_id.clone())
    }

    pub fn is_authenticated(&self) -> bool {
        self.identity.read().is_some()
    }

    /// Record membership with its metadata. A re-join replaces the metadata.
    pub fn join(&self, channel: &str, data: Value) {
        self.memberships.write().insert(
            channel.to_string(),
            MembershipMeta {
                joined_at: Utc::now(),
                data,
            },
        );
    }

    /// Remove membership flag and metadata together. Returns whether the
    /// client was a member.
    pub fn leave(&self, channel: &str) -> bool {
        self.memberships.write().remove(channel).is_some()
    }

    pub fn is_member(&self, channel: &str) -> bool {
        self.memberships.read().contains_key(channel)
    }

    pub fn membership(&self, channel: &str) -> Option<MembershipMeta> {
        self.memberships.read().get(channel).cloned()
    }

    /// Snapshot of joined channel names.
    pub fn channel_names(&self) -> Vec<String> {
        self.memberships.read().keys().cloned().collect()
    }

    /// Refresh the activity timestamp.
    pub fn touch(&self) {
        *self.last_seen.lock() = Utc::now();
    }

    pub fn last_seen(&self) -> DateTime<Utc> {
        *self.last_seen.lock()
    }

    /// Mark the connection as alive (pong or frame received).
    pub fn mark_alive(&self) {
        self.is_alive.store(true, Ordering::Relaxed);
    }

    /// Check and reset the alive flag for the heartbeat.
    pub fn check_alive(&self) -> bool {
        self.is_alive.swap(false, Ordering::Relaxed)
    }

    /// Connection facts for handler payloads.
    pub fn sender_info(&self) -> SenderInfo {
        let identity = self.identity.read();
        SenderInfo {
            id: self.id.clone(),
            user_id: identity.as_ref().map(|i| i.user_id.clone()),
            username: identity.as_ref().and_then(|i| i.username.clone()),
            email: identity.as_ref().and_then(|i| i.email.clone()),
            remote_addr: self.remote_addr.clone(),
        }
    }

    /// Admin listing entry.
    pub fn summary(&self) -> ClientSummary {
        let identity = self.identity.read();
        let mut channels = self.channel_names();
        channels.sort();
        ClientSummary {
            id: self.id.clone(),
            user_id: identity.as_ref().map(|i| i.user_id.clone()),
            username: identity.as_ref().and_then(|i| i.username.clone()),
            email: identity.as_ref().and_then(|i| i.email.clone()),
            channels,
            remote_addr: self.remote_addr.clone(),
            user_agent: self.user_agent.clone(),
            connected_at: self.connected_at,
            last_seen: self.last_seen(),
        }
    }
}

/// What the admin API reports per client.
#[derive(Debug, Clone, Serialize)]
pub struct ClientSummary {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    pub channels: Vec<String>,
    pub remote_addr: String,
    pub user_agent: String,
    pub connected_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}
