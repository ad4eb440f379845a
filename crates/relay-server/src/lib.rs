//! # relay-server
//!
//! The messaging hub core: per-connection client records with bounded send
//! lanes, a named-channel registry, the broadcast fan-out engine, the
//! session loop servicing each WebSocket connection, the handler-process
//! bridge, and the bearer-protected admin HTTP surface.
//!
//! - HTTP endpoints: health, client/channel listings, kick, broadcast
//! - WebSocket gateway: connection management, heartbeat, action dispatch
//! - Event fan-out with per-recipient deadlines and dead-peer eviction
//! - Graceful shutdown via `tokio::signal` + `CancellationToken`

#![deny(unsafe_code)]

pub mod bridge;
pub mod config;
pub mod health;
pub mod hub;
pub mod metrics;
pub mod middleware;
pub mod routes;
pub mod server;
pub mod shutdown;
pub mod websocket;
