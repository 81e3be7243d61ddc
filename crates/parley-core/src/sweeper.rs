use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::pipeline::Pipeline;
use crate::registry::Registry;

/// Runs the heartbeat sweep every `interval` until `shutdown` fires. Rate
/// limiter state for idle users is pruned on the same tick.
pub fn spawn_sweeper(
    registry: Arc<Registry>,
    pipeline: Arc<Pipeline>,
    interval: Duration,
    idle_threshold: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    registry.heartbeat_sweep(Instant::now(), idle_threshold);
                    pipeline.rate_limits().prune();
                }
            }
        }
        tracing::debug!("sweeper stopped");
    })
}
