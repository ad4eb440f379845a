//! Transport-level ping/pong liveness monitoring.

use std::sync::Arc;
use std::time::Duration;

use tokio::time;
use tokio_util::sync::CancellationToken;

use crate::hub::client::ClientRecord;

/// Outcome of the heartbeat loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatResult {
    /// The client missed too many consecutive pongs.
    TimedOut,
    /// The session ended for another reason.
    Cancelled,
}

/// Run heartbeat pings for a connection.
///
/// Each `interval` tick enqueues a transport ping onto the client's lane
/// and checks the alive flag. A tick with no pong since the previous one
/// (or where the ping could not even be enqueued) counts as a miss;
/// `max_missed` consecutive misses end the loop with
/// [`HeartbeatResult::TimedOut`].
pub async fn run_heartbeat(
    client: Arc<ClientRecord>,
    interval: Duration,
    max_missed: u32,
    cancel: CancellationToken,
) -> HeartbeatResult {
    let mut ticker = time::interval(interval);
    // The immediate first tick primes the check; the alive flag starts set.
    let mut missed: u32 = 0;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let pinged = client.try_ping();
                if pinged && client.check_alive() {
                    missed = 0;
                } else {
                    missed += 1;
                    if missed >= max_missed {
                        return HeartbeatResult::TimedOut;
                    }
                }
            }
            () = cancel.cancelled() => {
                return HeartbeatResult::Cancelled;
            }
        }
    }
}
