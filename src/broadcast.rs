//! Sample generation and live fan-out.
//!
//! One tick: draw a uniform value, stamp it, append it to the log, then push
//! it to every connection in that tick's live snapshot. The log append and
//! the fan-out happen under the log lock so the replayer can hand a
//! connection over to the live feed without missing a tick (see
//! `replay.rs`).

use std::sync::Arc;

use anyhow::Result;
use rand::Rng;
use tracing::warn;

use crate::frame::Frame;
use crate::record::SampleRecord;
use crate::server::ServerState;

pub(crate) async fn run(state: Arc<ServerState>) {
    let mut ticker = tokio::time::interval(state.config.broadcast_period);
    loop {
        ticker.tick().await;
        if let Err(err) = broadcast_tick(&state).await {
            warn!(error = ?err, "broadcast tick failed");
        }
    }
}

async fn broadcast_tick(state: &Arc<ServerState>) -> Result<()> {
    let value = rand::thread_rng().gen_range(0..state.config.range);
    let record = SampleRecord::now(value);

    let mut log = state.log.lock().await;
    if let Err(err) = log.append(&record).await {
        // Skip the fan-out: a sample that is not in the log must not reach
        // clients, or replay and live history would disagree.
        warn!(error = %err, "failed to persist sample, reopening log");
        log.reopen().await?;
        return Err(err.into());
    }

    for (id, outbox) in state.registry.live_outboxes() {
        if outbox.try_send(Frame::DataResponse {
            record: record.clone(),
        })
        .is_err()
        {
            // Dead or hopelessly backlogged; drop it and keep fanning out.
            warn!(id, "failed to queue sample, dropping connection");
            state.registry.remove(id);
        }
    }
    Ok(())
}
