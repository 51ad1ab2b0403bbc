use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the broadcast server: generate samples, persist them, and push
    /// them to every connected client.
    Server(ServerArgs),
    /// Mirror a server's sample feed into a local log file.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// Socket address to listen on. Use port 0 for an ephemeral port.
    #[arg(long, default_value = "127.0.0.1:11451")]
    pub listen: SocketAddr,

    /// Path of the append-only sample log.
    #[arg(long, default_value = "server_data.txt")]
    pub data_file: PathBuf,

    /// Alternate log path tried when the primary one cannot be opened.
    #[arg(long)]
    pub data_file_fallback: Option<PathBuf>,

    /// Samples are drawn uniformly from [0, range).
    #[arg(long, default_value_t = 100, value_parser = clap::value_parser!(i32).range(1..))]
    pub range: i32,

    /// How often a new sample is generated and broadcast.
    #[arg(long, default_value_t = 250)]
    pub broadcast_period_ms: u64,

    /// How often the heartbeat monitor scans for stale connections.
    #[arg(long, default_value_t = 60)]
    pub monitor_period_secs: u64,

    /// Connections without a heartbeat for longer than this are evicted.
    #[arg(long, default_value_t = 120)]
    pub heartbeat_timeout_secs: u64,
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Address of the server to mirror.
    #[arg(long, default_value = "127.0.0.1:11451")]
    pub server: SocketAddr,

    /// Path of the local sample log.
    #[arg(long, default_value = "client_data.txt")]
    pub data_file: PathBuf,

    /// Alternate log path tried when the primary one cannot be opened.
    #[arg(long)]
    pub data_file_fallback: Option<PathBuf>,

    /// How often a heartbeat is sent to the server.
    #[arg(long, default_value_t = 30)]
    pub heartbeat_period_secs: u64,
}
