//! Broadcast fan-out engine.
//!
//! Fan-out snapshots the recipient set, enqueues from one short-lived task
//! per recipient, and collects results under an overall deadline. A slow
//! consumer only ever stalls its own lane; recipients whose send errors
//! (closed lane, or overflow past the write deadline) are evicted from the
//! hub so one dead peer cannot degrade later broadcasts.

use std::sync::Arc;
use std::time::Instant;

use metrics::counter;
use tokio::task::JoinSet;
use tokio::time::{timeout_at, Instant as TokioInstant};
use tracing::{debug, warn};

use relay_core::{HubError, Message, SendError};

use super::client::ClientRecord;
use super::Hub;
use crate::metrics::{BROADCASTS_TOTAL, BROADCAST_EVICTIONS_TOTAL};

/// What happened to one fan-out.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastOutcome {
    /// Recipients in the snapshot.
    pub attempted: usize,
    /// Sends that enqueued successfully within the deadline.
    pub delivered: usize,
    /// Recipients evicted after a send error.
    pub evicted: Vec<String>,
    /// Recipients not reached before the overall deadline (not retried).
    pub skipped: usize,
}

impl Hub {
    /// Broadcast to the members of a channel. A missing channel is a no-op
    /// with a warning.
    pub async fn broadcast_to_channel(&self, name: &str, message: Message) -> BroadcastOutcome {
        let Some(channel) = self.get_channel(name).await else {
            warn!(channel = name, "broadcast to unknown channel dropped");
            return BroadcastOutcome::default();
        };

        let member_ids = channel.members();
        let mut recipients = Vec::with_capacity(member_ids.len());
        {
            // Resolve borrowed member ids through the hub index; ids whose
            // record is already gone are ignored.
            let clients = self.clients.read().await;
            for id in &member_ids {
                if let Some(record) = clients.get(id) {
                    recipients.push(record.clone());
                }
            }
        }
        self.fan_out(recipients, message, "channel").await
    }

    /// Broadcast to every registered client.
    pub async fn broadcast_to_all(&self, message: Message) -> BroadcastOutcome {
        let recipients: Vec<_> = self.clients.read().await.values().cloned().collect();
        self.fan_out(recipients, message, "global").await
    }

    /// Broadcast to clients with a bound identity.
    pub async fn broadcast_to_authenticated(&self, message: Message) -> BroadcastOutcome {
        let recipients: Vec<_> = self
            .clients
            .read()
            .await
            .values()
            .filter(|c| c.is_authenticated())
            .cloned()
            .collect();
        self.fan_out(recipients, message, "authenticated").await
    }

    /// Broadcast to every connection bound to one user (multi-device).
    pub async fn broadcast_to_user(&self, user_id: &str, message: Message) -> BroadcastOutcome {
        let recipients: Vec<_> = self
            .clients
            .read()
            .await
            .values()
            .filter(|c| c.user_id().as_deref() == Some(user_id))
            .cloned()
            .collect();
        self.fan_out(recipients, message, "user").await
    }

    /// Broadcast to every authenticated connection except one user's.
    pub async fn broadcast_to_users_except(
        &self,
        exclude_user_id: &str,
        message: Message,
    ) -> BroadcastOutcome {
        let recipients: Vec<_> = self
            .clients
            .read()
            .await
            .values()
            .filter(|c| {
                c.user_id()
                    .is_some_and(|uid| uid != exclude_user_id)
            })
            .cloned()
            .collect();
        self.fan_out(recipients, message, "user_except").await
    }

    /// Deliver to exactly one client connection.
    pub async fn send_to_client(&self, client_id: &str, message: Message) -> Result<(), HubError> {
        let Some(record) = self.get_client(client_id).await else {
            return Err(HubError::ClientNotFound);
        };
        match record.send(Arc::new(message)).await {
            Ok(()) => Ok(()),
            Err(source) => {
                self.evict(client_id, source).await;
                Err(HubError::Delivery {
                    client_id: client_id.to_string(),
                    source,
                })
            }
        }
    }

    /// Core fan-out: one enqueue task per recipient, collected under the
    /// overall broadcast deadline.
    async fn fan_out(
        &self,
        recipients: Vec<Arc<ClientRecord>>,
        message: Message,
        kind: &'static str,
    ) -> BroadcastOutcome {
        counter!(BROADCASTS_TOTAL, "kind" => kind).increment(1);

        let mut outcome = BroadcastOutcome {
            attempted: recipients.len(),
            ..BroadcastOutcome::default()
        };
        if recipients.is_empty() {
            debug!(kind, "broadcast with no recipients");
            return outcome;
        }

        // The payload is immutable once formed; every lane shares it.
        let message = Arc::new(message);

        let mut tasks = JoinSet::new();
        for record in recipients {
            let msg = message.clone();
            let _ = tasks.spawn(async move {
                let start = Instant::now();
                let result = record.send(msg).await;
                (record.id.clone(), result, start.elapsed())
            });
        }

        let deadline = TokioInstant::now() + self.broadcast_deadline;
        let mut failed: Vec<(String, SendError)> = Vec::new();

        loop {
            match timeout_at(deadline, tasks.join_next()).await {
                Ok(Some(Ok((id, result, elapsed)))) => match result {
                    Ok(()) => {
                        outcome.delivered += 1;
                        if elapsed.as_millis() > 10 {
                            debug!(client_id = %id, elapsed_ms = elapsed.as_millis() as u64, kind, "slow enqueue");
                        }
                    }
                    Err(err) => {
                        warn!(client_id = %id, error = %err, elapsed_ms = elapsed.as_millis() as u64, kind, "send failed, evicting recipient");
                        failed.push((id, err));
                    }
                },
                Ok(Some(Err(join_err))) => {
                    // A panicked send task counts against no one else.
                    warn!(error = %join_err, kind, "broadcast send task failed");
                }
                Ok(None) => break,
                Err(_) => {
                    // Deadline reached: drop the set, aborting in-flight
                    // enqueues. Stragglers are skipped, never retried.
                    outcome.skipped = tasks.len();
                    warn!(
                        kind,
                        completed = outcome.delivered + failed.len(),
                        skipped = outcome.skipped,
                        "broadcast deadline reached"
                    );
                    break;
                }
            }
        }
        drop(tasks);

        for (id, err) in failed {
            self.evict(&id, err).await;
            outcome.evicted.push(id);
        }

        debug!(
            kind,
            attempted = outcome.attempted,
            delivered = outcome.delivered,
            evicted = outcome.evicted.len(),
            skipped = outcome.skipped,
            "broadcast complete"
        );
        outcome
    }

    /// Remove a dead or stalled recipient: deregister it and close its lane.
    pub(crate) async fn evict(&self, client_id: &str, reason: SendError) {
        if let Some(record) = self.deregister(client_id).await {
            let _ = record.close();
            counter!(BROADCAST_EVICTIONS_TOTAL).increment(1);
            warn!(client_id, reason = %reason, "evicted unresponsive client");
        }
    }
}
