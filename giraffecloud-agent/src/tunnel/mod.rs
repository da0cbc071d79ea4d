pub mod client;
pub mod dispatcher;
pub mod handler;
pub mod heartbeat;
pub mod writer;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{error, info};

use crate::state::AgentState;

/// A connection that stayed up this long resets the backoff counter.
const STABLE_CONNECTION: Duration = Duration::from_secs(60);

/// Run the tunnel main loop: connect, dispatch, reconnect with backoff.
pub async fn run(state: &Arc<AgentState>, mut shutdown: watch::Receiver<bool>) {
    let mut attempts: u32 = 0;

    loop {
        let started = Instant::now();
        match client::connect_and_run(state, &mut shutdown).await {
            Ok(client::TunnelOutcome::Shutdown) => {
                info!("tunnel shut down gracefully");
                return;
            }
            Ok(client::TunnelOutcome::Disconnected) => {
                info!("tunnel disconnected, will reconnect");
            }
            Err(e) => {
                error!(error = %e, "tunnel connection lost");
            }
        }

        if *shutdown.borrow() {
            info!("shutdown requested, not reconnecting");
            return;
        }

        if started.elapsed() >= STABLE_CONNECTION {
            attempts = 0;
        }
        attempts = attempts.saturating_add(1);
        let delay = backoff_delay(attempts, state.config.reconnect_max_delay_secs);
        info!(delay_ms = delay.as_millis() as u64, attempt = attempts, "reconnecting tunnel");

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => {
                info!("shutdown requested during reconnect wait");
                return;
            }
        }
    }
}

/// Exponential backoff: 1s doubling per attempt, capped.
fn backoff_delay(attempt: u32, cap_secs: u64) -> Duration {
    let exp = attempt.saturating_sub(1).min(6);
    Duration::from_secs((1u64 << exp).min(cap_secs.max(1)))
}
