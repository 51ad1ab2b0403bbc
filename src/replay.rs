//! History replay: streams the whole persisted log to one connection, then
//! hands it to the live feed with no gap and no duplicate.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use tracing::{debug, warn};

use crate::frame::Frame;
use crate::record::SampleRecord;
use crate::registry::ConnId;
use crate::server::ServerState;

pub(crate) async fn run(state: Arc<ServerState>, id: ConnId, last_seen: Option<SampleRecord>) {
    if let Err(err) = replay_history(&state, id, last_seen).await {
        warn!(id, error = ?err, "history replay failed");
        state.registry.remove(id);
    }
}

async fn replay_history(
    state: &Arc<ServerState>,
    id: ConnId,
    last_seen: Option<SampleRecord>,
) -> Result<()> {
    let Some(outbox) = state.registry.outbox(id) else {
        // Evicted between request dispatch and replay start.
        return Ok(());
    };

    // Snapshot the log without blocking the broadcaster for the whole replay.
    let records = { state.log.lock().await.read_all().await? };

    if let Some(last) = &last_seen {
        // The request carries the client's last-known record. Replay is
        // always from the start; the lookup just reports where the client
        // left off.
        let position = {
            state
                .log
                .lock()
                .await
                .find(&last.timestamp, last.value)
                .await?
        };
        debug!(id, ?position, "client resumes from {last}");
    }

    let total = records.len();
    for record in records {
        outbox
            .send(Frame::DataResponse { record })
            .await
            .map_err(|_| anyhow!("connection closed during replay"))?;
    }

    // Handoff: under the log lock no broadcast tick can run, so queueing the
    // records appended mid-replay and then marking the connection live leaves
    // no sample unsent and none sent twice.
    let log = state.log.lock().await;
    for record in log.read_from(total).await? {
        outbox
            .try_send(Frame::DataResponse { record })
            .map_err(|_| anyhow!("connection queue unavailable at replay handoff"))?;
    }
    state.registry.mark_live(id);
    drop(log);

    debug!(id, total, "replay complete, connection is live");
    Ok(())
}
