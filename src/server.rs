//! Broadcast server: accept loop, per-connection I/O tasks, and the shared
//! state the background tasks operate on.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::select;
use tokio::sync::{mpsc, Mutex};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info, warn};

use crate::cli::ServerArgs;
use crate::frame::{Frame, FrameCodec, READ_BUFFER_CAPACITY};
use crate::log::SampleLog;
use crate::registry::{ConnId, ConnectionRegistry};
use crate::{broadcast, heartbeat, replay};

/// Frames a connection may have queued but not yet written. A client that
/// falls further behind than this is treated as dead.
const OUTBOX_DEPTH: usize = 256;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Samples are drawn uniformly from `[0, range)`.
    pub range: i32,
    pub broadcast_period: Duration,
    pub monitor_period: Duration,
    pub heartbeat_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            range: 100,
            broadcast_period: Duration::from_millis(250),
            monitor_period: Duration::from_secs(60),
            heartbeat_timeout: Duration::from_secs(120),
        }
    }
}

impl From<&ServerArgs> for ServerConfig {
    fn from(args: &ServerArgs) -> Self {
        Self {
            range: args.range,
            broadcast_period: Duration::from_millis(args.broadcast_period_ms),
            monitor_period: Duration::from_secs(args.monitor_period_secs),
            heartbeat_timeout: Duration::from_secs(args.heartbeat_timeout_secs),
        }
    }
}

/// State shared by the accept loop, connection tasks, the broadcaster, and
/// the heartbeat monitor.
pub(crate) struct ServerState {
    pub(crate) registry: ConnectionRegistry,
    /// The async lock doubles as the replay→live handoff gate: the
    /// broadcaster holds it across append + fan-out, the replayer holds it
    /// while draining the log tail and marking a connection live.
    pub(crate) log: Mutex<SampleLog>,
    pub(crate) config: ServerConfig,
    next_id: AtomicU64,
}

pub struct Server {
    listener: TcpListener,
    state: Arc<ServerState>,
}

impl Server {
    pub fn new(listener: TcpListener, log: SampleLog, config: ServerConfig) -> Result<Self> {
        // `gen_range(0..range)` panics on an empty range, which would kill
        // the broadcaster task while the accept loop keeps running.
        anyhow::ensure!(config.range > 0, "sample range must be at least 1");
        Ok(Self {
            listener,
            state: Arc::new(ServerState {
                registry: ConnectionRegistry::new(),
                log: Mutex::new(log),
                config,
                next_id: AtomicU64::new(1),
            }),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Runs the accept loop until `shutdown` resolves, with the broadcaster
    /// and heartbeat monitor on their own timers.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Server { listener, state } = self;

        let broadcaster = tokio::spawn(broadcast::run(Arc::clone(&state)));
        let monitor = tokio::spawn(heartbeat::run(Arc::clone(&state)));
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    info!("server shutting down");
                    break;
                }
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &state);
                }
            }
        }

        broadcaster.abort();
        monitor.abort();
        // Dropping the outboxes lets every connection task wind down.
        state.registry.clear();
        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

fn handle_accept_result(
    result: std::io::Result<(TcpStream, SocketAddr)>,
    state: &Arc<ServerState>,
) {
    match result {
        Ok((stream, peer)) => spawn_connection(stream, peer, state),
        // Accept failures are non-fatal; the loop keeps serving everyone else.
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

fn spawn_connection(stream: TcpStream, peer: SocketAddr, state: &Arc<ServerState>) {
    let id = state.next_id.fetch_add(1, Ordering::Relaxed);
    let (outbox_tx, outbox_rx) = mpsc::channel(OUTBOX_DEPTH);
    state.registry.add(id, outbox_tx, Instant::now());
    info!(id, peer = %peer, "connection accepted");

    let state = Arc::clone(state);
    tokio::spawn(async move {
        if let Err(err) = run_connection(id, stream, outbox_rx, &state).await {
            warn!(id, peer = %peer, error = ?err, "connection closed with error");
        } else {
            info!(id, peer = %peer, "connection closed");
        }
        state.registry.remove(id);
    });
}

/// Owns both halves of one socket: inbound frames are dispatched by command,
/// outbound frames are drained from the connection's queue. This task is the
/// only writer the socket ever has.
async fn run_connection(
    id: ConnId,
    stream: TcpStream,
    mut outbox: mpsc::Receiver<Frame>,
    state: &Arc<ServerState>,
) -> Result<()> {
    let (read_half, write_half) = stream.into_split();
    let mut frames_in = FramedRead::with_capacity(read_half, FrameCodec, READ_BUFFER_CAPACITY);
    let mut frames_out = FramedWrite::new(write_half, FrameCodec);

    loop {
        select! {
            inbound = frames_in.next() => {
                match inbound {
                    Some(Ok(frame)) => dispatch_frame(id, frame, state)?,
                    Some(Err(err)) => return Err(err.into()),
                    // Peer closed the connection.
                    None => return Ok(()),
                }
            }
            outbound = outbox.recv() => {
                match outbound {
                    Some(frame) => frames_out.send(frame).await?,
                    // Registry entry dropped: evicted or server shutdown.
                    None => return Ok(()),
                }
            }
        }
    }
}

fn dispatch_frame(id: ConnId, frame: Frame, state: &Arc<ServerState>) -> Result<()> {
    match frame {
        Frame::Heartbeat => {
            state.registry.update_heartbeat(id, Instant::now());
            debug!(id, "heartbeat received");
        }
        Frame::DataRequest { last_seen } => {
            if state.registry.mark_replaying(id) {
                tokio::spawn(replay::run(Arc::clone(state), id, last_seen));
            } else {
                warn!(id, "ignoring duplicate data request");
            }
        }
        Frame::DataResponse { .. } => {
            // Only the server produces responses; a client sending one has
            // desynced from the protocol.
            anyhow::bail!("unexpected DATA_RESPONSE from client");
        }
    }
    Ok(())
}
