use std::{net::SocketAddr, path::Path, time::Duration};

use anyhow::{anyhow, Context, Result};
use futures::{SinkExt, StreamExt};
use samplecast::{
    client::{self, ClientConfig},
    frame::{Frame, FrameCodec},
    log::SampleLog,
    record::SampleRecord,
    server::{Server, ServerConfig},
};
use tokio::{
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpListener, TcpStream,
    },
    sync::oneshot,
    task::JoinHandle,
    time::timeout,
};
use tokio_util::codec::{FramedRead, FramedWrite};

const READ_TIMEOUT: Duration = Duration::from_secs(2);

const SEED: &str = "[2024-01-01 00:00:00.000]::5\n[2024-01-01 00:00:00.250]::42\n";

fn seeded_records() -> Vec<SampleRecord> {
    SEED.lines()
        .map(|line| SampleRecord::parse_line(line).expect("seed record"))
        .collect()
}

fn fast_config() -> ServerConfig {
    ServerConfig {
        broadcast_period: Duration::from_millis(50),
        ..ServerConfig::default()
    }
}

async fn start_server(
    log_path: &Path,
    config: ServerConfig,
) -> Result<(SocketAddr, oneshot::Sender<()>, JoinHandle<()>)> {
    let log = SampleLog::open(log_path, None).await?;
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let server = Server::new(listener, log, config)?;
    let addr = server.local_addr()?;

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let handle = tokio::spawn(async move {
        let shutdown = async move {
            let _ = shutdown_rx.await;
        };
        let _ = server.run_until(shutdown).await;
    });

    Ok((addr, shutdown_tx, handle))
}

type FrameReader = FramedRead<OwnedReadHalf, FrameCodec>;
type FrameWriter = FramedWrite<OwnedWriteHalf, FrameCodec>;

async fn connect(addr: SocketAddr) -> Result<(FrameReader, FrameWriter)> {
    let stream = TcpStream::connect(addr).await?;
    let (read_half, write_half) = stream.into_split();
    Ok((
        FramedRead::new(read_half, FrameCodec),
        FramedWrite::new(write_half, FrameCodec),
    ))
}

async fn next_record(frames: &mut FrameReader, description: &str) -> Result<SampleRecord> {
    let frame = timeout(READ_TIMEOUT, frames.next())
        .await
        .with_context(|| format!("{description}: timed out"))?
        .ok_or_else(|| anyhow!("{description}: stream closed"))?
        .with_context(|| format!("{description}: decode failed"))?;
    match frame {
        Frame::DataResponse { record } => Ok(record),
        other => Err(anyhow!("{description}: unexpected frame {other:?}")),
    }
}

#[tokio::test]
async fn replay_precedes_live_feed() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let log_path = dir.path().join("server_data.txt");
    tokio::fs::write(&log_path, SEED).await?;
    let (addr, shutdown, handle) = start_server(&log_path, fast_config()).await?;

    let (mut frames_in, mut frames_out) = connect(addr).await?;
    frames_out.send(Frame::DataRequest { last_seen: None }).await?;

    // Both seeded records arrive first, in log order.
    let seeded = seeded_records();
    let first = next_record(&mut frames_in, "first replayed record").await?;
    let second = next_record(&mut frames_in, "second replayed record").await?;
    assert_eq!(first, seeded[0]);
    assert_eq!(second, seeded[1]);

    // Then live samples, each one exactly once: fresh timestamps only, in
    // strictly increasing order, never a seeded record again.
    let mut previous_timestamp = String::new();
    for i in 0..3 {
        let live = next_record(&mut frames_in, "live sample").await?;
        assert!(
            !seeded.contains(&live),
            "live feed must not repeat replayed records, got {live} at live index {i}"
        );
        assert!(
            live.timestamp > previous_timestamp,
            "live samples must arrive in generation order"
        );
        previous_timestamp = live.timestamp;
    }

    let _ = shutdown.send(());
    let _ = handle.await;
    Ok(())
}

#[tokio::test]
async fn fan_out_survives_one_dead_client() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let log_path = dir.path().join("server_data.txt");
    let (addr, shutdown, handle) = start_server(&log_path, fast_config()).await?;

    let (mut alice_in, mut alice_out) = connect(addr).await?;
    let (mut bob_in, mut bob_out) = connect(addr).await?;
    alice_out.send(Frame::DataRequest { last_seen: None }).await?;
    bob_out.send(Frame::DataRequest { last_seen: None }).await?;

    // Both are live once the first broadcast reaches them.
    next_record(&mut alice_in, "alice first sample").await?;
    next_record(&mut bob_in, "bob first sample").await?;

    // Alice dies abruptly; Bob must keep receiving samples.
    drop(alice_in);
    drop(alice_out);
    for _ in 0..3 {
        next_record(&mut bob_in, "bob after alice died").await?;
    }

    let _ = shutdown.send(());
    let _ = handle.await;
    Ok(())
}

#[tokio::test]
async fn silent_connection_is_evicted_on_heartbeat_timeout() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let log_path = dir.path().join("server_data.txt");
    let config = ServerConfig {
        monitor_period: Duration::from_millis(100),
        heartbeat_timeout: Duration::from_millis(300),
        ..fast_config()
    };
    let (addr, shutdown, handle) = start_server(&log_path, config).await?;

    // Connect and never send anything; the monitor closes the socket once
    // the accept-time heartbeat goes stale.
    let (mut frames_in, _frames_out) = connect(addr).await?;
    let closed = timeout(READ_TIMEOUT, frames_in.next())
        .await
        .context("eviction: timed out waiting for server to close")?;
    assert!(closed.is_none(), "expected a clean close, got {closed:?}");

    let _ = shutdown.send(());
    let _ = handle.await;
    Ok(())
}

#[tokio::test]
async fn heartbeats_keep_a_connection_alive() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let log_path = dir.path().join("server_data.txt");
    tokio::fs::write(&log_path, SEED).await?;
    let config = ServerConfig {
        monitor_period: Duration::from_millis(100),
        heartbeat_timeout: Duration::from_millis(300),
        ..fast_config()
    };
    let (addr, shutdown, handle) = start_server(&log_path, config).await?;

    let (mut frames_in, mut frames_out) = connect(addr).await?;
    // Stay quiet except for heartbeats, for well past the timeout.
    for _ in 0..10 {
        frames_out.send(Frame::Heartbeat).await?;
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    // Still registered: a request is answered with the replayed history.
    frames_out.send(Frame::DataRequest { last_seen: None }).await?;
    let first = next_record(&mut frames_in, "replay after heartbeats").await?;
    assert_eq!(first, seeded_records()[0]);

    let _ = shutdown.send(());
    let _ = handle.await;
    Ok(())
}

#[tokio::test]
async fn client_mirrors_history_then_live_feed() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let server_log = dir.path().join("server_data.txt");
    let client_log = dir.path().join("client_data.txt");
    tokio::fs::write(&server_log, SEED).await?;
    let (addr, shutdown, handle) = start_server(&server_log, fast_config()).await?;

    let config = ClientConfig {
        server: addr,
        data_file: client_log.clone(),
        data_file_fallback: None,
        heartbeat_period: Duration::from_secs(30),
    };
    client::run_until(config, tokio::time::sleep(Duration::from_millis(500))).await?;

    let mirrored = SampleLog::open(&client_log, None).await?.read_all().await?;
    let seeded = seeded_records();
    assert!(
        mirrored.len() > seeded.len(),
        "expected live samples after the replayed history, got {} records",
        mirrored.len()
    );
    assert_eq!(&mirrored[..2], &seeded[..], "history must be mirrored first");

    let _ = shutdown.send(());
    let _ = handle.await;
    Ok(())
}

#[tokio::test]
async fn reconnecting_client_requests_from_its_last_record() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let server_log = dir.path().join("server_data.txt");
    let client_log = dir.path().join("client_data.txt");
    tokio::fs::write(&server_log, SEED).await?;
    // The client already holds the first record locally.
    tokio::fs::write(&client_log, "[2024-01-01 00:00:00.000]::5\n").await?;
    let (addr, shutdown, handle) = start_server(&server_log, fast_config()).await?;

    let config = ClientConfig {
        server: addr,
        data_file: client_log.clone(),
        data_file_fallback: None,
        heartbeat_period: Duration::from_secs(30),
    };
    client::run_until(config, tokio::time::sleep(Duration::from_millis(500))).await?;

    // Full replay still happens: the server re-sends the whole history after
    // the client's existing record.
    let mirrored = SampleLog::open(&client_log, None).await?.read_all().await?;
    let seeded = seeded_records();
    assert_eq!(mirrored[0], seeded[0]);
    assert_eq!(&mirrored[1..3], &seeded[..], "replay is always from the start");

    let _ = shutdown.send(());
    let _ = handle.await;
    Ok(())
}

#[tokio::test]
async fn rejects_nonpositive_sample_range() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let log = SampleLog::open(&dir.path().join("server_data.txt"), None).await?;
    let listener = TcpListener::bind("127.0.0.1:0").await?;

    let config = ServerConfig {
        range: 0,
        ..fast_config()
    };
    assert!(
        Server::new(listener, log, config).is_err(),
        "an empty sample range must be rejected up front, not panic the broadcaster"
    );
    Ok(())
}
