//! Heartbeat monitor: periodically evicts connections whose liveness signal
//! has gone stale.

use std::sync::Arc;
use std::time::Instant;

use tracing::info;

use crate::server::ServerState;

pub(crate) async fn run(state: Arc<ServerState>) {
    let mut ticker = tokio::time::interval(state.config.monitor_period);
    loop {
        ticker.tick().await;
        // Removal drops the outbox; the connection task then closes the
        // socket on its own. There is no resurrection path.
        for id in state
            .registry
            .evict_stale(Instant::now(), state.config.heartbeat_timeout)
        {
            info!(id, "heartbeat timed out, connection evicted");
        }
    }
}
