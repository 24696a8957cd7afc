//! Error taxonomy for the session server
//!
//! Every variant here is scoped to one connection or one request. Nothing in this
//! module is meant to terminate the process; the only hard failure surfaced to the
//! caller is [`ServerError`] from construction.

use shared::{ProtocolError, SessionId};
use std::io;
use thiserror::Error;

/// Identifier pool failures
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("all {capacity} session ids are in use")]
    Exhausted { capacity: usize },
    #[error("session id {0} is not currently allocated")]
    NotAllocated(SessionId),
    #[error("session id {id} is outside a pool of {capacity}")]
    OutOfRange { id: SessionId, capacity: usize },
}

/// Accept, send, receive and resolve failures; transient and connection-scoped
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("accept failed: {0}")]
    Accept(#[source] io::Error),
    #[error("receive failed: {0}")]
    Receive(#[source] io::Error),
    #[error("send failed: {0}")]
    Send(#[source] io::Error),
    #[error("outbound queue for connection {token} is full")]
    Backpressure { token: u64 },
    #[error("connection {token} is closed")]
    ConnectionClosed { token: u64 },
    #[error("could not resolve {host}:{service}: {reason}")]
    Resolve {
        host: String,
        service: String,
        reason: String,
    },
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Failures while constructing a [`crate::network::Server`]
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to start reactor runtime: {0}")]
    Runtime(#[source] io::Error),
    #[error(transparent)]
    Transport(#[from] TransportError),
}
