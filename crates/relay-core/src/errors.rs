//! Error types crossing crate boundaries.

use thiserror::Error;

/// Failure to enqueue a frame onto a client's send lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SendError {
    /// The client is no longer alive (closing or closed).
    #[error("client is closed")]
    Closed,
    /// The lane stayed full past the write deadline.
    #[error("send lane overflowed")]
    Overflow,
}

/// Hub-level lookup and delivery failures surfaced to admin callers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HubError {
    #[error("client not found")]
    ClientNotFound,
    #[error("channel not found")]
    ChannelNotFound,
    #[error("delivery to client {client_id} failed: {source}")]
    Delivery {
        client_id: String,
        #[source]
        source: SendError,
    },
}
