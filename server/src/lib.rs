//! # Session Server Library
//!
//! This library provides the authoritative core of a real-time multiplayer session
//! server. Clients hold a reliable stream connection for session control and send
//! unreliable datagrams for high-frequency player updates. The server keeps an
//! authoritative table of up to sixteen player records, settles conflicting
//! updates by timestamp, and periodically broadcasts full-state snapshots.
//!
//! ## Execution Contexts
//!
//! ### Reactor
//! A tokio runtime owned by the [`network::Server`] runs every asynchronous
//! completion: accepts, stream reads and writes, datagram receive and send,
//! address resolution and the snapshot timer. Reactor tasks never touch the session
//! table or player records; they only push events onto message channels.
//!
//! ### Tick
//! An external driver calls [`network::Server::tick`] at its own cadence. Each call
//! drains both channels and is the only place session and player state change.
//! This single-writer arrangement removes races between accept handling and
//! disconnect handling by construction.
//!
//! ## Module Organization
//!
//! ### Channel (`channel`)
//! Non-blocking multi-producer queue with a fixed drain discipline: control events
//! drain first-in-first-out, player updates last-in-first-out.
//!
//! ### Identifier Pool (`id_pool`)
//! O(1) allocation of session ids from a fixed universe, with explicit exhaustion
//! and detection of double release.
//!
//! ### Session Registry (`session`)
//! Fixed table of sixteen slots holding each session's stream connection, resolved
//! datagram address and participation state.
//!
//! ### Player State (`player_state`)
//! Authoritative records with last-writer-wins conflict resolution keyed on sender
//! timestamps rather than arrival order.
//!
//! ### Transport (`transport`)
//! Listener, per-connection reader and writer tasks, the datagram socket and the
//! resolver. Frames are fixed-size; undecodable ones are dropped and logged.
//!
//! ### Dispatcher (`dispatcher`)
//! The protocol state machine: onboarding, disconnect announcements, keepalives,
//! resolve requests and relaying of accepted player updates.
//!
//! ### Broadcaster (`broadcaster`)
//! Recurring timer pushing the whole player table to every participating session.
//! A slow client loses a snapshot instead of stalling the others.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::config::ServerConfig;
//! use server::dispatcher::TickControl;
//! use server::network::Server;
//! use std::time::Duration;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut server = Server::new(ServerConfig::default())?;
//!
//!     // The driver decides the cadence; the reactor keeps running in between.
//!     while server.tick() == TickControl::Continue {
//!         std::thread::sleep(Duration::from_millis(16));
//!     }
//!
//!     server.shutdown();
//!     Ok(())
//! }
//! ```
//!
//! ## Failure Handling
//!
//! Accept, read, write and resolve failures are scoped to one connection or one
//! request. They are logged, the affected connection is closed if it cannot go on,
//! and the reactor and dispatcher keep running. Pool exhaustion rejects the new
//! connection without onboarding it. A stale player update is a normal outcome,
//! not an error.

pub mod broadcaster;
pub mod channel;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod id_pool;
pub mod network;
pub mod player_state;
pub mod session;
pub mod transport;
