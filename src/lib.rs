//! Real-time sample broadcast over TCP.
//!
//! The server generates a timestamped integer sample on a fixed period,
//! appends it to an append-only line log, and pushes it to every connected
//! client over a length-prefixed binary protocol. A late-joining client
//! first receives a full replay of the log, then is switched onto the live
//! feed. Each module covers one responsibility:
//!
//! - [`cli`] parses the command-line interface for server and client modes.
//! - [`frame`] is the wire codec: fixed-format frames with partial-read
//!   reassembly.
//! - [`record`] defines the persisted sample record and its line format.
//! - [`log`] is the append-only line store the feed is replayed from.
//! - [`registry`] tracks live connections, their heartbeats, and their
//!   replay state across the three concurrent timing domains.
//! - [`server`] runs the accept loop and per-connection I/O tasks, with the
//!   broadcaster and heartbeat monitor on background timers and the replayer
//!   streaming history to new connections.
//! - [`client`] mirrors a server's feed into a local log.
//!
//! Integration tests use this crate directly to exercise the
//! replay-then-live handoff, heartbeat eviction, and fan-out isolation.

pub mod cli;
pub mod client;
pub mod frame;
pub mod log;
pub mod record;
pub mod registry;
pub mod server;

mod broadcast;
mod heartbeat;
mod replay;
