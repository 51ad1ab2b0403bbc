//! Client mirror: one connection that replays the server's history into a
//! local log and then follows the live feed, sending periodic heartbeats.

use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::select;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info, warn};

use crate::cli::ClientArgs;
use crate::frame::{Frame, FrameCodec, READ_BUFFER_CAPACITY};
use crate::log::SampleLog;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server: std::net::SocketAddr,
    pub data_file: PathBuf,
    pub data_file_fallback: Option<PathBuf>,
    pub heartbeat_period: Duration,
}

impl From<&ClientArgs> for ClientConfig {
    fn from(args: &ClientArgs) -> Self {
        Self {
            server: args.server,
            data_file: args.data_file.clone(),
            data_file_fallback: args.data_file_fallback.clone(),
            heartbeat_period: Duration::from_secs(args.heartbeat_period_secs),
        }
    }
}

pub async fn run(args: ClientArgs) -> Result<()> {
    run_until(ClientConfig::from(&args), async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = ?err, "failed to install ctrl-c handler");
        }
    })
    .await
}

/// Connects, requests history from the last locally-recorded sample, and
/// mirrors every response into the local log until the server closes the
/// connection or `shutdown` resolves.
pub async fn run_until<F>(config: ClientConfig, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send,
{
    let mut log = SampleLog::open(&config.data_file, config.data_file_fallback.as_deref())
        .await
        .context("failed to open local sample log")?;
    let last_seen = log.read_all().await?.pop();

    let stream = TcpStream::connect(config.server)
        .await
        .with_context(|| format!("failed to connect to {}", config.server))?;
    info!("connected to {}", config.server);

    let (read_half, write_half) = stream.into_split();
    let mut frames_in = FramedRead::with_capacity(read_half, FrameCodec, READ_BUFFER_CAPACITY);
    let mut frames_out = FramedWrite::new(write_half, FrameCodec);

    match &last_seen {
        Some(record) => info!("requesting history after {record}"),
        None => info!("no local records, requesting full history"),
    }
    frames_out.send(Frame::DataRequest { last_seen }).await?;

    let mut heartbeat = tokio::time::interval(config.heartbeat_period);
    tokio::pin!(shutdown);

    loop {
        select! {
            inbound = frames_in.next() => {
                match inbound {
                    Some(Ok(frame)) => handle_frame(frame, &mut log).await?,
                    Some(Err(err)) => return Err(err.into()),
                    None => {
                        info!("server closed the connection");
                        break;
                    }
                }
            }
            // First tick fires immediately, so the server sees a heartbeat
            // right after connect.
            _ = heartbeat.tick() => {
                frames_out.send(Frame::Heartbeat).await?;
                debug!("heartbeat sent");
            }
            _ = &mut shutdown => {
                info!("client shutting down");
                break;
            }
        }
    }

    Ok(())
}

async fn handle_frame(frame: Frame, log: &mut SampleLog) -> Result<()> {
    match frame {
        Frame::DataResponse { record } => {
            if let Err(err) = log.append(&record).await {
                // One reopen attempt; a second failure ends the run.
                warn!(error = %err, "failed to append sample, reopening local log");
                log.reopen().await?;
                log.append(&record).await?;
            }
            debug!("recorded {record}");
            Ok(())
        }
        Frame::Heartbeat | Frame::DataRequest { .. } => {
            anyhow::bail!("unexpected frame from server: {frame:?}")
        }
    }
}
