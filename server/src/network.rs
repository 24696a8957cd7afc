//! Server facade: reactor runtime, transport and dispatcher wired together
//!
//! The reactor runs on its own runtime threads and keeps accepting, reading and
//! resolving no matter how often the driver ticks. The driver owns the [`Server`]
//! and calls [`Server::tick`] at whatever cadence it likes.

use crate::broadcaster::SnapshotBroadcaster;
use crate::channel::{channel, DrainOrder};
use crate::config::ServerConfig;
use crate::dispatcher::{Dispatcher, TickControl};
use crate::error::ServerError;
use crate::transport::Transport;
use log::info;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::runtime::{Builder, Handle, Runtime};

/// How long shutdown waits for in-flight reactor work before abandoning it
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

pub struct Server {
    dispatcher: Dispatcher,
    runtime: Option<Runtime>,
    local_addr: SocketAddr,
}

impl Server {
    /// Starts the reactor, binds both endpoints and begins accepting
    pub fn new(config: ServerConfig) -> Result<Self, ServerError> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(config.reactor_threads.max(1))
            .thread_name("reactor")
            .enable_all()
            .build()
            .map_err(ServerError::Runtime)?;

        let transport = runtime.block_on(Transport::bind(&config.host, config.port))?;
        let local_addr = transport.local_addr();

        let (control_tx, control_rx) = channel(DrainOrder::Fifo);
        let (update_tx, update_rx) = channel(DrainOrder::Lifo);
        let handle = transport.start(
            runtime.handle(),
            control_tx,
            update_tx,
            config.outbound_queue_depth,
        );

        let dispatcher = Dispatcher::new(
            control_rx,
            update_rx,
            handle,
            SnapshotBroadcaster::new(config.snapshot_interval),
        );

        info!("Server started on {}", local_addr);
        Ok(Self {
            dispatcher,
            runtime: Some(runtime),
            local_addr,
        })
    }

    /// Runs one dispatch cycle; see [`Dispatcher::tick`]
    pub fn tick(&mut self) -> TickControl {
        self.dispatcher.tick()
    }

    /// Address shared by the stream listener and the datagram socket
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Handle to the reactor runtime, for drivers that need to spawn alongside it
    pub fn reactor(&self) -> Option<Handle> {
        self.runtime.as_ref().map(|runtime| runtime.handle().clone())
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Closes every session and stops the reactor
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let Some(runtime) = self.runtime.take() else {
            return;
        };

        self.dispatcher.shutdown();
        runtime.shutdown_timeout(SHUTDOWN_GRACE);
        info!("Server on {} shut down", self.local_addr);
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
    }
}
