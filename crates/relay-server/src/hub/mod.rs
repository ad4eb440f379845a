//! The hub: root of the object graph.
//!
//! Owns the two top-level maps (clients by id, channels by name) plus the
//! token verifier and the handler bridge. The hub locks protect only map
//! membership; per-client and per-channel state use their own locks, and no
//! hub lock is ever held across I/O.

pub mod broadcast;
pub mod channel;
pub mod client;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use relay_auth::TokenVerifier;
use relay_core::{HubError, Message};

use crate::bridge::HandlerBridge;
use crate::config::HubConfig;
use crate::metrics::{WS_CONNECTIONS_TOTAL, WS_DISCONNECTIONS_TOTAL};

use channel::{Channel, ChannelSummary};
use client::{ClientRecord, ClientSummary};

/// Why a join was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum JoinError {
    #[error("channel requires authentication")]
    AuthRequired,
}

/// Process-wide connection and channel registry.
pub struct Hub {
    clients: RwLock<HashMap<String, Arc<ClientRecord>>>,
    channels: RwLock<HashMap<String, Arc<Channel>>>,
    pub verifier: TokenVerifier,
    pub bridge: Arc<HandlerBridge>,
    pub(crate) broadcast_deadline: Duration,
}

impl Hub {
    pub fn new(verifier: TokenVerifier, bridge: Arc<HandlerBridge>, config: &HubConfig) -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
            channels: RwLock::new(HashMap::new()),
            verifier,
            bridge,
            broadcast_deadline: Duration::from_millis(config.broadcast_deadline_ms),
        }
    }

    /// Add a freshly connected client to the index.
    pub async fn register(&self, record: Arc<ClientRecord>) {
        let mut clients = self.clients.write().await;
        let _ = clients.insert(record.id.clone(), record);
        counter!(WS_CONNECTIONS_TOTAL).increment(1);
    }

    /// Remove a client from the index and from every channel it joined.
    /// Idempotent; safe to call from both teardown and eviction paths.
    pub async fn deregister(&self, client_id: &str) -> Option<Arc<ClientRecord>> {
        let removed = self.clients.write().await.remove(client_id);
        if let Some(record) = &removed {
            let names = record.channel_names();
            let channels = self.channels.read().await;
            for name in &names {
                if let Some(channel) = channels.get(name) {
                    let _ = channel.remove_member(client_id);
                }
            }
            counter!(WS_DISCONNECTIONS_TOTAL).increment(1);
            debug!(client_id, channels = names.len(), "client deregistered");
        }
        removed
    }

    pub async fn get_client(&self, client_id: &str) -> Option<Arc<ClientRecord>> {
        self.clients.read().await.get(client_id).cloned()
    }

    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }

    pub async fn channel_count(&self) -> usize {
        self.channels.read().await.len()
    }

    /// Snapshot of all clients for the admin listing.
    pub async fn client_summaries(&self) -> Vec<ClientSummary> {
        let clients = self.clients.read().await;
        let mut summaries: Vec<_> = clients.values().map(|c| c.summary()).collect();
        drop(clients);
        summaries.sort_by(|a, b| a.connected_at.cmp(&b.connected_at));
        summaries
    }

    /// Snapshot of all channels, keyed by name, for the admin listing.
    pub async fn channel_summaries(&self) -> HashMap<String, ChannelSummary> {
        let channels = self.channels.read().await;
        channels
            .iter()
            .map(|(name, ch)| (name.clone(), ch.summary()))
            .collect()
    }

    pub async fn get_channel(&self, name: &str) -> Option<Arc<Channel>> {
        self.channels.read().await.get(name).cloned()
    }

    /// Lazily create a channel on first use. Channels created this way are
    /// open; policy flags come only from [`Hub::configure_channel`].
    pub async fn get_or_create_channel(&self, name: &str) -> Arc<Channel> {
        if let Some(existing) = self.get_channel(name).await {
            return existing;
        }
        let mut channels = self.channels.write().await;
        channels
            .entry(name.to_string())
            .or_insert_with(|| {
                debug!(channel = name, "creating channel");
                Arc::new(Channel::new(name))
            })
            .clone()
    }

    /// Create a channel or update its policy flags (admin surface).
    pub async fn configure_channel(
        &self,
        name: &str,
        require_auth: bool,
        private: bool,
    ) -> Arc<Channel> {
        let channel = self.get_or_create_channel(name).await;
        channel.set_policy(require_auth, private);
        info!(channel = name, require_auth, private, "channel policy configured");
        channel
    }

    /// Join a client to a channel, creating it when absent. Keeps the
    /// membership set and the channel's member set in lock-step.
    ///
    /// The `joined_channel` confirmation is enqueued before the member set
    /// makes this client visible to broadcast snapshots, so it always
    /// precedes channel traffic on the client's lane.
    pub async fn join_channel(
        &self,
        record: &Arc<ClientRecord>,
        name: &str,
        data: serde_json::Value,
    ) -> Result<(), JoinError> {
        let channel = self.get_or_create_channel(name).await;
        if channel.requires_auth() && !record.is_authenticated() {
            return Err(JoinError::AuthRequired);
        }
        record.join(name, data);

        let confirm = Message::event("joined_channel", serde_json::json!({"channel": name}));
        if let Err(err) = record.send(Arc::new(confirm)).await {
            debug!(client_id = %record.id, channel = name, error = %err, "join confirmation not enqueued");
        }

        channel.add_member(&record.id);
        Ok(())
    }

    /// Remove a client from a channel it previously joined.
    pub async fn leave_channel(
        &self,
        record: &Arc<ClientRecord>,
        name: &str,
    ) -> Result<(), HubError> {
        let Some(channel) = self.get_channel(name).await else {
            return Err(HubError::ChannelNotFound);
        };
        let _ = channel.remove_member(&record.id);
        let _ = record.leave(name);
        Ok(())
    }

    /// Forcefully disconnect a client: emit a `kicked` frame, then close
    /// and deregister it.
    pub async fn kick(&self, client_id: &str) -> Result<(), HubError> {
        let Some(record) = self.get_client(client_id).await else {
            return Err(HubError::ClientNotFound);
        };

        let notice = Message::event("kicked", serde_json::json!({"reason": "Kicked by admin"}));
        if let Err(err) = record.send(Arc::new(notice)).await {
            warn!(client_id, error = %err, "kick notice not delivered");
        }

        let _ = record.close();
        let _ = self.deregister(client_id).await;
        info!(client_id, "client kicked");
        Ok(())
    }
}
