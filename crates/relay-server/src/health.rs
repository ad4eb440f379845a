//! `/health` endpoint.

use serde::Serialize;
use std::time::Instant;

/// Health check response body.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Always `"healthy"` when the server is running.
    pub status: String,
    /// Connected client count.
    pub clients: usize,
    /// Known channel count.
    pub channels: usize,
    /// Seconds since the server started.
    pub uptime_secs: u64,
    pub version: String,
}

/// Build a health response from live counters.
pub fn health_check(start_time: Instant, clients: usize, channels: usize) -> HealthResponse {
    HealthResponse {
        status: "healthy".into(),
        clients,
        channels,
        uptime_secs: start_time.elapsed().as_secs(),
        version: env!("CARGO_PKG_VERSION").into(),
    }
}
