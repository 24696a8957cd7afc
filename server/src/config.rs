//! Construction-time settings for the session server

use shared::DEFAULT_PORT;
use std::time::Duration;

/// Interval between full-state snapshot broadcasts
pub const DEFAULT_SNAPSHOT_INTERVAL: Duration = Duration::from_millis(200);

/// Frames that may wait in one connection's outbound queue before sends are refused
pub const DEFAULT_OUTBOUND_QUEUE_DEPTH: usize = 64;

/// Settings supplied once when the server is built
///
/// Capacity is not configurable here; it is fixed at [`shared::MAX_PLAYERS`].
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address both endpoints bind to
    pub host: String,
    /// Port for the stream listener; the datagram socket binds the same number.
    /// Zero picks an ephemeral port.
    pub port: u16,
    pub snapshot_interval: Duration,
    pub outbound_queue_depth: usize,
    /// Worker threads in the reactor runtime
    pub reactor_threads: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            snapshot_interval: DEFAULT_SNAPSHOT_INTERVAL,
            outbound_queue_depth: DEFAULT_OUTBOUND_QUEUE_DEPTH,
            reactor_threads: 1,
        }
    }
}

impl ServerConfig {
    /// Loopback config on an ephemeral port, handy for tests and local runs
    pub fn local() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 0,
            ..Self::default()
        }
    }
}
