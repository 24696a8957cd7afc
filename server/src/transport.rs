//! Transport layer: stream listener, per-connection tasks and the datagram socket
//!
//! Everything here runs on the reactor runtime and only ever *produces* events:
//! accepted connections, decoded frames, closed connections and resolved addresses
//! are pushed onto the control channel, decoded datagrams onto the update channel.
//! The dispatcher is the only code that acts on them.
//!
//! Every receive path re-arms itself after each completion, success or failure.
//! Failures are classified as transient (logged, loop continues) or fatal to one
//! connection (that connection's reader stops and reports `Closed`).

use crate::channel::ChannelSender;
use crate::dispatcher::{ControlEvent, DatagramEvent};
use crate::error::TransportError;
use log::{debug, error, info, warn};
use shared::{
    decode_tcp, decode_udp, encode_tcp, encode_udp, SessionId, TcpMessage, UdpMessage,
    TCP_FRAME_SIZE,
};
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{lookup_host, TcpListener, TcpStream, UdpSocket};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;

/// Unique, never-reused tag for one accepted connection
pub type ConnectionToken = u64;

/// Receive buffer for datagrams; larger than a frame so oversized ones are detected
const DATAGRAM_BUFFER_SIZE: usize = 2048;

/// Back-off after an accept or receive error before re-arming
const RETRY_DELAY: Duration = Duration::from_millis(10);

/// Cloneable send side of one stream connection
///
/// Sends never block: frames go onto a bounded queue that a writer task flushes
/// one at a time, so sends on a connection are serialized by construction.
#[derive(Debug, Clone)]
pub struct ConnectionSender {
    token: ConnectionToken,
    outbound: mpsc::Sender<TcpMessage>,
}

impl ConnectionSender {
    pub fn send(&self, message: TcpMessage) -> Result<(), TransportError> {
        self.outbound.try_send(message).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => TransportError::Backpressure { token: self.token },
            mpsc::error::TrySendError::Closed(_) => {
                TransportError::ConnectionClosed { token: self.token }
            }
        })
    }

    pub fn token(&self) -> ConnectionToken {
        self.token
    }

    /// True once the writer side is gone and nothing sent here can be delivered
    pub fn is_closed(&self) -> bool {
        self.outbound.is_closed()
    }
}

/// Exclusively owned handle to an accepted stream connection
#[derive(Debug)]
pub struct Connection {
    sender: ConnectionSender,
    peer: Option<SocketAddr>,
    reader: Option<AbortHandle>,
}

impl Connection {
    /// Builds a handle whose outbound frames land on the returned receiver
    ///
    /// No socket or task is attached; the caller decides what drains the queue.
    pub fn detached(
        token: ConnectionToken,
        peer: Option<SocketAddr>,
        queue_depth: usize,
    ) -> (Self, mpsc::Receiver<TcpMessage>) {
        let (outbound, rx) = mpsc::channel(queue_depth.max(1));
        let connection = Self {
            sender: ConnectionSender { token, outbound },
            peer,
            reader: None,
        };
        (connection, rx)
    }

    pub fn send(&self, message: TcpMessage) -> Result<(), TransportError> {
        self.sender.send(message)
    }

    pub fn sender(&self) -> ConnectionSender {
        self.sender.clone()
    }

    pub fn token(&self) -> ConnectionToken {
        self.sender.token
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    /// Stops reading and lets the writer flush what is queued, then the socket closes
    pub fn close(self) {
        if let Some(reader) = self.reader {
            reader.abort();
        }
        debug!("Connection {} closed", self.sender.token);
    }
}

/// Address family requested by a resolve message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFamily {
    V4,
    V6,
}

impl AddressFamily {
    fn matches(self, addr: &SocketAddr) -> bool {
        match self {
            AddressFamily::V4 => addr.is_ipv4(),
            AddressFamily::V6 => addr.is_ipv6(),
        }
    }
}

/// Request to resolve a client's datagram endpoint for session `id`
#[derive(Debug, Clone)]
pub struct ResolveRequest {
    pub id: SessionId,
    pub token: ConnectionToken,
    pub host: String,
    pub service: String,
    pub family: AddressFamily,
}

/// Dispatcher-side access to the reactor: outbound datagrams and address resolution
#[derive(Debug, Clone)]
pub struct TransportHandle {
    runtime: Handle,
    datagrams: mpsc::UnboundedSender<(UdpMessage, SocketAddr)>,
    control: ChannelSender<ControlEvent>,
}

impl TransportHandle {
    /// Handle whose outbound datagrams land on the returned receiver instead of a socket
    pub fn detached(
        runtime: Handle,
        control: ChannelSender<ControlEvent>,
    ) -> (Self, mpsc::UnboundedReceiver<(UdpMessage, SocketAddr)>) {
        let (datagrams, rx) = mpsc::unbounded_channel();
        let handle = Self {
            runtime,
            datagrams,
            control,
        };
        (handle, rx)
    }

    pub fn runtime(&self) -> &Handle {
        &self.runtime
    }

    /// Queues one datagram for the single datagram writer
    pub fn send_datagram(&self, message: UdpMessage, addr: SocketAddr) {
        if let Err(e) = self.datagrams.send((message, addr)) {
            error!("Datagram writer is gone, dropping message for {}: {}", addr, e);
        }
    }

    /// Resolves in the background; success arrives later as `ControlEvent::Resolved`
    ///
    /// Failures are logged and not retried.
    pub fn resolve(&self, request: ResolveRequest) {
        let control = self.control.clone();
        self.runtime.spawn(async move {
            match resolve_address(&request).await {
                Ok(address) => {
                    debug!(
                        "Resolved {}:{} to {} for session {}",
                        request.host, request.service, address, request.id
                    );
                    let event = ControlEvent::Resolved {
                        id: request.id,
                        token: request.token,
                        address,
                    };
                    if control.push(event).is_err() {
                        debug!("Control channel closed before resolution finished");
                    }
                }
                Err(e) => warn!("Session {}: {}", request.id, e),
            }
        });
    }
}

async fn resolve_address(request: &ResolveRequest) -> Result<SocketAddr, TransportError> {
    let failure = |reason: String| TransportError::Resolve {
        host: request.host.clone(),
        service: request.service.clone(),
        reason,
    };

    let port: u16 = request
        .service
        .parse()
        .map_err(|_| failure("service must be a numeric port".to_string()))?;

    let mut candidates = lookup_host((request.host.as_str(), port))
        .await
        .map_err(|e| failure(e.to_string()))?;

    candidates
        .find(|addr| request.family.matches(addr))
        .ok_or_else(|| failure(format!("no {:?} address found", request.family)))
}

/// Bound but not yet running endpoints
pub struct Transport {
    listener: TcpListener,
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
}

impl Transport {
    /// Binds the stream listener, then the datagram socket on the same port number
    pub async fn bind(host: &str, port: u16) -> Result<Self, TransportError> {
        let listener = TcpListener::bind((host, port))
            .await
            .map_err(|source| TransportError::Bind {
                addr: format!("tcp {}:{}", host, port),
                source,
            })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| TransportError::Bind {
                addr: format!("tcp {}:{}", host, port),
                source,
            })?;

        let socket = UdpSocket::bind(local_addr)
            .await
            .map_err(|source| TransportError::Bind {
                addr: format!("udp {}", local_addr),
                source,
            })?;

        info!("Listening on {} (stream and datagram)", local_addr);

        Ok(Self {
            listener,
            socket: Arc::new(socket),
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Spawns the accept loop and datagram tasks onto `runtime`
    pub fn start(
        self,
        runtime: &Handle,
        control: ChannelSender<ControlEvent>,
        updates: ChannelSender<DatagramEvent>,
        queue_depth: usize,
    ) -> TransportHandle {
        let (datagram_tx, datagram_rx) = mpsc::unbounded_channel();

        runtime.spawn(accept_loop(
            self.listener,
            control.clone(),
            runtime.clone(),
            queue_depth,
        ));
        runtime.spawn(datagram_receiver(Arc::clone(&self.socket), updates));
        runtime.spawn(datagram_writer(self.socket, datagram_rx));

        TransportHandle {
            runtime: runtime.clone(),
            datagrams: datagram_tx,
            control,
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    control: ChannelSender<ControlEvent>,
    runtime: Handle,
    queue_depth: usize,
) {
    let mut next_token: ConnectionToken = 0;

    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                next_token += 1;
                debug!("Accepted connection {} from {}", next_token, peer);

                let (connection, start_reading) =
                    spawn_connection(&runtime, stream, peer, next_token, &control, queue_depth);
                if control.push(ControlEvent::Accepted(connection)).is_err() {
                    info!("Control channel closed, accept loop exiting");
                    break;
                }
                // Only now may the reader push, so `Accepted` always comes first.
                let _ = start_reading.send(());
            }
            Err(e) => {
                warn!("{}", TransportError::Accept(e));
                tokio::time::sleep(RETRY_DELAY).await;
            }
        }
    }
}

fn spawn_connection(
    runtime: &Handle,
    stream: TcpStream,
    peer: SocketAddr,
    token: ConnectionToken,
    control: &ChannelSender<ControlEvent>,
    queue_depth: usize,
) -> (Connection, oneshot::Sender<()>) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!("Could not set TCP_NODELAY for {}: {}", peer, e);
    }

    let (read_half, write_half) = stream.into_split();
    let (mut connection, outbound_rx) = Connection::detached(token, Some(peer), queue_depth);

    let (start_tx, start_rx) = oneshot::channel();

    runtime.spawn(connection_writer(write_half, outbound_rx, token, control.clone()));
    let reader = runtime.spawn(connection_reader(read_half, token, control.clone(), start_rx));
    connection.reader = Some(reader.abort_handle());

    (connection, start_tx)
}

async fn connection_reader(
    mut reader: OwnedReadHalf,
    token: ConnectionToken,
    control: ChannelSender<ControlEvent>,
    start: oneshot::Receiver<()>,
) {
    if start.await.is_err() {
        return;
    }

    let mut frame = vec![0u8; TCP_FRAME_SIZE];

    loop {
        match reader.read_exact(&mut frame).await {
            Ok(_) => match decode_tcp(&frame) {
                Ok(message) => {
                    debug!("Connection {} sent {}", token, message.kind());
                    if control.push(ControlEvent::Message { token, message }).is_err() {
                        break;
                    }
                }
                Err(e) => warn!(
                    "Dropping frame from connection {}: {}",
                    token,
                    TransportError::from(e)
                ),
            },
            Err(e) => {
                if e.kind() == ErrorKind::UnexpectedEof {
                    info!("Connection {} closed by peer", token);
                } else {
                    warn!("Connection {}: {}", token, TransportError::Receive(e));
                }
                let _ = control.push(ControlEvent::Closed { token });
                break;
            }
        }
    }
}

async fn connection_writer(
    mut writer: OwnedWriteHalf,
    mut outbound: mpsc::Receiver<TcpMessage>,
    token: ConnectionToken,
    control: ChannelSender<ControlEvent>,
) {
    while let Some(message) = outbound.recv().await {
        let frame = match encode_tcp(&message) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(
                    "Not sending {} to connection {}: {}",
                    message.kind(),
                    token,
                    TransportError::from(e)
                );
                continue;
            }
        };

        if let Err(e) = writer.write_all(&frame).await {
            warn!("Connection {}: {}", token, TransportError::Send(e));
            // The session cannot be reached any more; have the dispatcher tear it down.
            let _ = control.push(ControlEvent::Closed { token });
            break;
        }
    }

    let _ = writer.shutdown().await;
}

async fn datagram_receiver(socket: Arc<UdpSocket>, updates: ChannelSender<DatagramEvent>) {
    let mut buffer = [0u8; DATAGRAM_BUFFER_SIZE];

    loop {
        match socket.recv_from(&mut buffer).await {
            Ok((len, from)) => match decode_udp(&buffer[..len]) {
                Ok(message) => {
                    if updates.push(DatagramEvent { from, message }).is_err() {
                        info!("Update channel closed, datagram receiver exiting");
                        break;
                    }
                }
                Err(e) => warn!("Dropping datagram from {}: {}", from, e),
            },
            Err(e) => {
                // ICMP unreachable from an earlier send surfaces here on some platforms.
                warn!("{}", TransportError::Receive(e));
                tokio::time::sleep(RETRY_DELAY).await;
            }
        }
    }
}

async fn datagram_writer(
    socket: Arc<UdpSocket>,
    mut outbound: mpsc::UnboundedReceiver<(UdpMessage, SocketAddr)>,
) {
    while let Some((message, addr)) = outbound.recv().await {
        let frame = match encode_udp(&message) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Not sending datagram to {}: {}", addr, e);
                continue;
            }
        };

        if let Err(e) = socket.send_to(&frame, addr).await {
            warn!("Datagram to {}: {}", addr, TransportError::Send(e));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{channel, DrainOrder};
    use shared::{PlayerRecord, SenderKind, TcpPayload, Transform, UDP_FRAME_SIZE};
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(2);

    #[test]
    fn test_detached_connection_queues_frames() {
        let (connection, mut rx) = Connection::detached(5, None, 4);
        connection
            .send(TcpMessage::new(TcpPayload::YouAreConnected { id: 2 }))
            .unwrap();

        assert_eq!(connection.token(), 5);
        assert!(matches!(
            rx.try_recv().unwrap().payload,
            TcpPayload::YouAreConnected { id: 2 }
        ));
    }

    #[test]
    fn test_full_queue_is_backpressure() {
        let (connection, _rx) = Connection::detached(9, None, 1);
        connection
            .send(TcpMessage::new(TcpPayload::KeepaliveRequest))
            .unwrap();

        match connection.send(TcpMessage::new(TcpPayload::KeepaliveRequest)) {
            Err(TransportError::Backpressure { token }) => assert_eq!(token, 9),
            other => panic!("Expected backpressure, got {:?}", other),
        }
    }

    #[test]
    fn test_send_after_receiver_dropped() {
        let (connection, rx) = Connection::detached(3, None, 4);
        drop(rx);

        assert!(matches!(
            connection.sender().send(TcpMessage::new(TcpPayload::KeepaliveReply)),
            Err(TransportError::ConnectionClosed { token: 3 })
        ));
        assert!(connection.is_closed());
    }

    #[test]
    fn test_address_family_filter() {
        let v4: SocketAddr = "127.0.0.1:4444".parse().unwrap();
        let v6: SocketAddr = "[::1]:4444".parse().unwrap();

        assert!(AddressFamily::V4.matches(&v4));
        assert!(!AddressFamily::V4.matches(&v6));
        assert!(AddressFamily::V6.matches(&v6));
    }

    #[tokio::test]
    async fn test_resolve_numeric_host() {
        let request = ResolveRequest {
            id: 1,
            token: 1,
            host: "127.0.0.1".to_string(),
            service: "5000".to_string(),
            family: AddressFamily::V4,
        };

        let addr = resolve_address(&request).await.unwrap();
        assert_eq!(addr, "127.0.0.1:5000".parse::<SocketAddr>().unwrap());
    }

    #[tokio::test]
    async fn test_resolve_rejects_named_service() {
        let request = ResolveRequest {
            id: 1,
            token: 1,
            host: "127.0.0.1".to_string(),
            service: "http".to_string(),
            family: AddressFamily::V4,
        };

        assert!(matches!(
            resolve_address(&request).await,
            Err(TransportError::Resolve { .. })
        ));
    }

    #[tokio::test]
    async fn test_resolve_wrong_family_fails() {
        let request = ResolveRequest {
            id: 1,
            token: 1,
            host: "127.0.0.1".to_string(),
            service: "5000".to_string(),
            family: AddressFamily::V6,
        };

        assert!(resolve_address(&request).await.is_err());
    }

    #[tokio::test]
    async fn test_accept_and_read_frame() {
        let transport = Transport::bind("127.0.0.1", 0).await.unwrap();
        let addr = transport.local_addr();
        let (control_tx, mut control_rx) = channel(DrainOrder::Fifo);
        let (update_tx, _update_rx) = channel(DrainOrder::Lifo);
        let _handle = transport.start(&Handle::current(), control_tx, update_tx, 8);

        let mut client = TcpStream::connect(addr).await.unwrap();
        let frame = encode_tcp(&TcpMessage::new(TcpPayload::KeepaliveRequest)).unwrap();
        client.write_all(&frame).await.unwrap();

        let mut events = Vec::new();
        timeout(WAIT, async {
            while events.len() < 2 {
                events.extend(control_rx.drain_all());
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("events did not arrive");

        let token = match &events[0] {
            ControlEvent::Accepted(connection) => connection.token(),
            other => panic!("Expected Accepted first, got {:?}", other),
        };
        match &events[1] {
            ControlEvent::Message { token: from, message } => {
                assert_eq!(*from, token);
                assert_eq!(message.payload, TcpPayload::KeepaliveRequest);
            }
            other => panic!("Expected Message, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_peer_close_reports_closed() {
        let transport = Transport::bind("127.0.0.1", 0).await.unwrap();
        let addr = transport.local_addr();
        let (control_tx, mut control_rx) = channel(DrainOrder::Fifo);
        let (update_tx, _update_rx) = channel(DrainOrder::Lifo);
        let _handle = transport.start(&Handle::current(), control_tx, update_tx, 8);

        let client = TcpStream::connect(addr).await.unwrap();
        drop(client);

        let mut events = Vec::new();
        timeout(WAIT, async {
            while events.len() < 2 {
                events.extend(control_rx.drain_all());
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("close was not reported");

        assert!(matches!(events[1], ControlEvent::Closed { .. }));
    }

    #[tokio::test]
    async fn test_failed_write_reports_closed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap())
            .await
            .unwrap();
        let (stream, peer) = listener.accept().await.unwrap();

        let (control_tx, mut control_rx) = channel(DrainOrder::Fifo);
        let (connection, start_reading) =
            spawn_connection(&Handle::current(), stream, peer, 7, &control_tx, 8);
        // Reader never starts, so any Closed seen below comes from the writer.
        drop(start_reading);

        client.set_linger(Some(Duration::ZERO)).unwrap();
        drop(client);

        let mut events = Vec::new();
        timeout(WAIT, async {
            while events.is_empty() {
                let _ = connection.send(TcpMessage::new(TcpPayload::KeepaliveRequest));
                tokio::time::sleep(Duration::from_millis(5)).await;
                events.extend(control_rx.drain_all());
            }
        })
        .await
        .expect("write failure was not reported");

        assert!(matches!(events[0], ControlEvent::Closed { token: 7 }));
    }

    #[tokio::test]
    async fn test_datagram_decoded_and_oversize_dropped() {
        let transport = Transport::bind("127.0.0.1", 0).await.unwrap();
        let addr = transport.local_addr();
        let (control_tx, _control_rx) = channel(DrainOrder::Fifo);
        let (update_tx, mut update_rx) = channel(DrainOrder::Lifo);
        let _handle = transport.start(&Handle::current(), control_tx, update_tx, 8);

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client
            .send_to(&[0u8; UDP_FRAME_SIZE + 10], addr)
            .await
            .unwrap();

        let record = PlayerRecord::new(0, Transform::at(1.0, 2.0, 3.0));
        let message = UdpMessage::player_update(record, 42, SenderKind::Client);
        client
            .send_to(&encode_udp(&message).unwrap(), addr)
            .await
            .unwrap();

        let mut received = Vec::new();
        timeout(WAIT, async {
            while received.is_empty() {
                received.extend(update_rx.drain_all());
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("datagram did not arrive");

        assert_eq!(received.len(), 1);
        assert_eq!(received[0].message, message);
        assert_eq!(received[0].from, client.local_addr().unwrap());
    }

    #[tokio::test]
    async fn test_outbound_datagram_reaches_peer() {
        let transport = Transport::bind("127.0.0.1", 0).await.unwrap();
        let (control_tx, _control_rx) = channel(DrainOrder::Fifo);
        let (update_tx, _update_rx) = channel(DrainOrder::Lifo);
        let handle = transport.start(&Handle::current(), control_tx, update_tx, 8);

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let message = UdpMessage::player_update(PlayerRecord::spawn(3), 7, SenderKind::Server);
        handle.send_datagram(message.clone(), client.local_addr().unwrap());

        let mut buffer = [0u8; DATAGRAM_BUFFER_SIZE];
        let (len, _) = timeout(WAIT, client.recv_from(&mut buffer))
            .await
            .expect("datagram not delivered")
            .unwrap();

        assert_eq!(len, UDP_FRAME_SIZE);
        assert_eq!(decode_udp(&buffer[..len]).unwrap(), message);
    }
}
