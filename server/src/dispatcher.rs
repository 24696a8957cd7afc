//! Tick-driven protocol dispatcher
//!
//! The dispatcher is the single owner of the session registry and the player-state
//! store. Each [`Dispatcher::tick`] runs one cycle:
//!
//! 1. clear every updated-this-tick flag and tear down sessions whose stream
//!    writer has stopped
//! 2. drain the control channel in arrival order (onboarding, resolve requests,
//!    disconnects, keepalives)
//! 3. drain the update channel newest-first, apply player updates and relay the
//!    accepted ones to every other participating session
//! 4. republish the snapshot view if anything changed
//!
//! Nothing here blocks or waits for more input; a cycle handles exactly what is
//! queued when it starts.

use crate::broadcaster::{BroadcastView, SnapshotBroadcaster};
use crate::channel::ChannelReceiver;
use crate::error::TransportError;
use crate::player_state::{PlayerStateStore, UpdateOutcome};
use crate::session::SessionRegistry;
use crate::transport::{AddressFamily, Connection, ConnectionToken, ResolveRequest, TransportHandle};
use log::{debug, info, warn};
use shared::{
    timestamp, DisconnectReason, SenderKind, SessionId, TcpMessage, TcpPayload, UdpMessage,
    UdpPayload,
};
use std::net::SocketAddr;

/// Events the reactor hands to the dispatcher, in causal order
#[derive(Debug)]
pub enum ControlEvent {
    /// A new stream connection is waiting to be onboarded
    Accepted(Connection),
    /// A decoded frame from an accepted connection
    Message {
        token: ConnectionToken,
        message: TcpMessage,
    },
    /// The connection's reader hit EOF or an error
    Closed { token: ConnectionToken },
    /// A resolve request for session `id` finished
    Resolved {
        id: SessionId,
        token: ConnectionToken,
        address: SocketAddr,
    },
}

/// A decoded datagram and where it came from
#[derive(Debug)]
pub struct DatagramEvent {
    pub from: SocketAddr,
    pub message: UdpMessage,
}

/// Signal returned to the external driver after each tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickControl {
    Continue,
    Stop,
}

pub struct Dispatcher {
    registry: SessionRegistry,
    store: PlayerStateStore,
    control: ChannelReceiver<ControlEvent>,
    updates: ChannelReceiver<DatagramEvent>,
    transport: TransportHandle,
    broadcaster: SnapshotBroadcaster,
    /// Sessions whose stream turned out to be closed while sending
    lost: Vec<SessionId>,
}

impl Dispatcher {
    pub fn new(
        control: ChannelReceiver<ControlEvent>,
        updates: ChannelReceiver<DatagramEvent>,
        transport: TransportHandle,
        broadcaster: SnapshotBroadcaster,
    ) -> Self {
        Self {
            registry: SessionRegistry::new(),
            store: PlayerStateStore::new(),
            control,
            updates,
            transport,
            broadcaster,
            lost: Vec::new(),
        }
    }

    /// Runs one dispatch cycle
    pub fn tick(&mut self) -> TickControl {
        self.store.begin_tick();
        let mut changed = self.sweep_closed();

        for event in self.control.drain_all() {
            changed |= self.handle_control(event);
            changed |= self.reap_lost();
        }

        for event in self.updates.drain_all() {
            changed |= self.handle_datagram(event);
        }

        if changed {
            self.publish_view();
        }

        TickControl::Continue
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn store(&self) -> &PlayerStateStore {
        &self.store
    }

    pub fn broadcaster(&self) -> &SnapshotBroadcaster {
        &self.broadcaster
    }

    /// Closes every session and stops the broadcaster; no goodbyes are sent
    pub fn shutdown(&mut self) {
        self.broadcaster.stop();

        let mut occupied = Vec::new();
        self.registry.for_each_occupied(|id, _| occupied.push(id));
        for id in occupied {
            self.registry.unregister(id);
            self.store.vacate(id);
        }
        self.publish_view();
    }

    /// Queues every session whose writer has stopped, then tears them down
    fn sweep_closed(&mut self) -> bool {
        self.registry.for_each_occupied(|id, slot| {
            if slot.connection.as_ref().is_some_and(Connection::is_closed) {
                self.lost.push(id);
            }
        });
        self.reap_lost()
    }

    /// Runs the connection-lost teardown for sessions found dead while sending
    ///
    /// Teardown broadcasts, which may find more dead sessions; those are reaped too.
    fn reap_lost(&mut self) -> bool {
        let mut changed = false;
        while let Some(id) = self.lost.pop() {
            changed |= self.disconnect(id, DisconnectReason::ConnectionLost);
        }
        changed
    }

    fn handle_control(&mut self, event: ControlEvent) -> bool {
        match event {
            ControlEvent::Accepted(connection) => self.onboard(connection),
            ControlEvent::Message { token, message } => self.handle_message(token, message),
            ControlEvent::Closed { token } => match self.registry.find_by_token(token) {
                Some(id) => self.disconnect(id, DisconnectReason::ConnectionLost),
                None => {
                    debug!("Connection {} closed after its session ended", token);
                    false
                }
            },
            ControlEvent::Resolved { id, token, address } => {
                if self.registry.find_by_token(token) == Some(id) {
                    self.registry.set_peer_address(id, address);
                    info!("Session {} datagram address is {}", id, address);
                } else {
                    debug!("Discarding resolved address for departed session {}", id);
                }
                false
            }
        }
    }

    /// Assigns an id, greets the client, then announces it to everyone else
    fn onboard(&mut self, connection: Connection) -> bool {
        let id = match self.registry.reserve() {
            Ok(id) => id,
            Err(e) => {
                warn!(
                    "Rejecting connection {} from {:?}: {}",
                    connection.token(),
                    connection.peer(),
                    e
                );
                connection.close();
                return false;
            }
        };

        if let Err(e) = self.registry.register(id, connection) {
            warn!("Could not register session {}: {}", id, e);
            return false;
        }
        self.store.occupy(id);

        self.send_to(id, TcpPayload::YouAreConnected { id });
        self.send_to(
            id,
            TcpPayload::Snapshot {
                records: self.store.snapshot(),
            },
        );

        self.registry.mark_participating(id);
        self.broadcast(
            TcpPayload::ConnectTell {
                record: self.store.record(id),
            },
            Some(id),
        );
        info!(
            "Session {} onboarded ({} participating)",
            id,
            self.registry.participating_count()
        );

        if !self.broadcaster.is_running() {
            self.publish_view();
            self.broadcaster.start(self.transport.runtime());
        }
        true
    }

    fn handle_message(&mut self, token: ConnectionToken, message: TcpMessage) -> bool {
        let Some(id) = self.registry.find_by_token(token) else {
            debug!(
                "Ignoring {} from connection {} with no session",
                message.kind(),
                token
            );
            return false;
        };

        let kind = message.kind();
        match message.payload {
            TcpPayload::RequestResolveV4 {
                host,
                service,
                id: claimed,
            } => {
                self.request_resolve(id, claimed, token, host, service, AddressFamily::V4);
                false
            }
            TcpPayload::RequestResolveV6 {
                host,
                service,
                id: claimed,
            } => {
                self.request_resolve(id, claimed, token, host, service, AddressFamily::V6);
                false
            }
            TcpPayload::Disconnecting { id: claimed } => {
                if claimed != id {
                    warn!("Session {} tried to disconnect session {}", id, claimed);
                    return false;
                }
                self.disconnect(id, DisconnectReason::Standard)
            }
            TcpPayload::KeepaliveRequest => {
                // Echo the sender's timestamp so it can measure round-trip time.
                self.send_message(
                    id,
                    TcpMessage {
                        timestamp: message.timestamp,
                        payload: TcpPayload::KeepaliveReply,
                    },
                );
                false
            }
            TcpPayload::KeepaliveReply => {
                let round_trip = timestamp().saturating_sub(message.timestamp);
                debug!("Keepalive reply from session {} ({} ms)", id, round_trip);
                self.registry.record_round_trip(id, round_trip);
                false
            }
            _ => {
                warn!("Unexpected {} from session {}", kind, id);
                false
            }
        }
    }

    fn request_resolve(
        &self,
        id: SessionId,
        claimed: SessionId,
        token: ConnectionToken,
        host: String,
        service: String,
        family: AddressFamily,
    ) {
        if claimed != id {
            warn!("Session {} asked to resolve for session {}", id, claimed);
            return;
        }

        debug!("Resolving {}:{} ({:?}) for session {}", host, service, family, id);
        self.transport.resolve(ResolveRequest {
            id,
            token,
            host,
            service,
            family,
        });
    }

    /// Tears down session `id` and tells every remaining participant
    fn disconnect(&mut self, id: SessionId, reason: DisconnectReason) -> bool {
        if !self.registry.unregister(id) {
            return false;
        }
        self.store.vacate(id);

        info!("Session {} disconnected ({:?})", id, reason);
        self.broadcast(TcpPayload::DisconnectTell { id, reason }, None);
        true
    }

    fn handle_datagram(&mut self, event: DatagramEvent) -> bool {
        let DatagramEvent { from, message } = event;

        if message.sender != SenderKind::Client {
            warn!("Dropping server-stamped datagram from {}", from);
            return false;
        }

        let record = match message.payload {
            UdpPayload::Keepalive => return false,
            UdpPayload::PlayerUpdate { record } => record,
        };

        let Some(id) = record.session_id() else {
            warn!("Dropping update with invalid id {} from {}", record.id, from);
            return false;
        };
        if !self.registry.is_participating(id) {
            debug!("Dropping update for inactive session {} from {}", id, from);
            return false;
        }
        if let Some(expected) = self.registry.slot(id).and_then(|slot| slot.peer_address) {
            if expected != from {
                warn!(
                    "Dropping update for session {} from {}, expected {}",
                    id, from, expected
                );
                return false;
            }
        }

        match self.store.apply_update(id, record, message.timestamp) {
            UpdateOutcome::RejectedStale => false,
            UpdateOutcome::Applied => {
                let relay =
                    UdpMessage::player_update(self.store.record(id), timestamp(), SenderKind::Server);
                self.registry.for_each_participating(|other, slot| {
                    if other == id {
                        return;
                    }
                    if let Some(addr) = slot.peer_address {
                        self.transport.send_datagram(relay.clone(), addr);
                    }
                });
                true
            }
        }
    }

    fn send_to(&mut self, id: SessionId, payload: TcpPayload) {
        self.send_message(id, TcpMessage::new(payload));
    }

    fn send_message(&mut self, id: SessionId, message: TcpMessage) {
        let Some(connection) = self.registry.slot(id).and_then(|s| s.connection.as_ref()) else {
            return;
        };
        if let Err(e) = connection.send(message) {
            warn!("Session {}: {}", id, e);
            if matches!(e, TransportError::ConnectionClosed { .. }) {
                self.lost.push(id);
            }
        }
    }

    /// Sends to every participating session except `exclude`
    fn broadcast(&mut self, payload: TcpPayload, exclude: Option<SessionId>) {
        let message = TcpMessage::new(payload);
        let lost = &mut self.lost;
        self.registry.for_each_participating(|id, slot| {
            if Some(id) == exclude {
                return;
            }
            if let Some(connection) = &slot.connection {
                if let Err(e) = connection.send(message.clone()) {
                    warn!("Session {}: {}", id, e);
                    if matches!(e, TransportError::ConnectionClosed { .. }) {
                        lost.push(id);
                    }
                }
            }
        });
    }

    fn publish_view(&self) {
        let mut recipients = Vec::new();
        self.registry.for_each_participating(|id, slot| {
            if let Some(connection) = &slot.connection {
                recipients.push((id, connection.sender()));
            }
        });

        self.broadcaster.publish(BroadcastView {
            records: self.store.snapshot(),
            recipients,
        });
    }
}
