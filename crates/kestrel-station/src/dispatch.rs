//! Dispatch loop
//!
//! One task owns the discovery socket, the TCP listener and the read side of
//! every accepted connection. Per-connection reader tasks only forward what
//! they read into a single event channel, so the loop makes one readiness
//! wait over every source:
//!
//! ```text
//! discovery (UDP) --------------------------+
//! listener  (TCP accept) -------------------+--> select! --> Station
//! readers   --(ReadEvent)--> events_rx -----+
//! ```
//!
//! Writers run separately and drain each connection's outbound channel.

use crate::audit::AuditLogger;
use crate::config::StationConfig;
use crate::error::{Result, StationError};
use crate::handlers::{DiscoveryAction, handle_discovery};
use crate::queue::SocketId;
use crate::registry::SlotHandle;
use crate::station::Station;
use bytes::Bytes;
use socket2::{Domain, Protocol, Socket, Type};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Largest discovery datagram accepted.
const MAX_DATAGRAM_SIZE: usize = 2048;
const READ_BUFFER_SIZE: usize = 4096;
const EVENT_CHANNEL_SIZE: usize = 1024;

#[derive(Debug)]
enum ReadEvent {
    Data { socket: SocketId, data: Bytes },
    Closed { socket: SocketId },
}

struct LiveConnection {
    peer: SocketAddr,
    handle: SlotHandle,
    reader: JoinHandle<()>,
}

/// Bind the discovery socket with address reuse and broadcast enabled.
pub fn bind_discovery_socket(addr: SocketAddr) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_broadcast(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    let std_socket: std::net::UdpSocket = socket.into();
    Ok(UdpSocket::from_std(std_socket)?)
}

/// Bind the stream listener on the first free port at or above
/// `tcp_base_port`.
pub async fn bind_stream_listener(config: &StationConfig) -> Result<TcpListener> {
    let mut last_error = None;
    for offset in 0..config.tcp_port_scan_limit {
        let Some(port) = config.tcp_base_port.checked_add(offset) else {
            break;
        };
        match TcpListener::bind((config.bind_ip, port)).await {
            Ok(listener) => return Ok(listener),
            Err(e) => {
                debug!("TCP port {} unavailable: {}", port, e);
                last_error = Some(e);
            }
        }
    }
    Err(StationError::Station(format!(
        "No free TCP port in {}..{} ({})",
        config.tcp_base_port,
        config.tcp_base_port.saturating_add(config.tcp_port_scan_limit),
        last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "empty range".to_string())
    )))
}

pub struct Dispatcher {
    station: Arc<Station>,
    discovery: UdpSocket,
    listener: TcpListener,
    shutdown: CancellationToken,
}

impl Dispatcher {
    /// Bind both sockets. Failure here is fatal for the station.
    pub async fn bind(station: Arc<Station>, shutdown: CancellationToken) -> Result<Self> {
        let config = station.config();
        let discovery = bind_discovery_socket(SocketAddr::new(config.bind_ip, config.discovery_port))?;
        let listener = bind_stream_listener(config).await?;
        let port = listener.local_addr()?.port();
        station.set_tcp_port(port);

        info!(
            "Discovery on {}, commands on TCP port {}",
            discovery.local_addr()?,
            port
        );
        if station.audit_enabled() {
            AuditLogger::server_started(
                discovery.local_addr()?,
                port,
                config.pool.thread_slots(),
                config.pool.connections_per_thread,
            );
        }

        Ok(Self {
            station,
            discovery,
            listener,
            shutdown,
        })
    }

    pub fn discovery_addr(&self) -> Result<SocketAddr> {
        Ok(self.discovery.local_addr()?)
    }

    pub fn stream_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Run until the shutdown token is cancelled.
    pub async fn run(self) -> Result<()> {
        let (events_tx, mut events_rx) = mpsc::channel::<ReadEvent>(EVENT_CHANNEL_SIZE);
        let mut connections: HashMap<SocketId, LiveConnection> = HashMap::new();
        let mut datagram = vec![0u8; MAX_DATAGRAM_SIZE];

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("Dispatch loop stopping");
                    break;
                }

                received = self.discovery.recv_from(&mut datagram) => {
                    match received {
                        Ok((len, peer)) => {
                            self.on_datagram(&datagram[..len], peer, &mut connections).await;
                        }
                        Err(e) => warn!("Discovery receive failed: {}", e),
                    }
                }

                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            self.on_accept(stream, peer, &events_tx, &mut connections).await;
                        }
                        Err(e) => warn!("Accept failed: {}", e),
                    }
                }

                Some(event) = events_rx.recv() => {
                    self.on_read_event(event, &mut connections).await;
                }
            }
        }

        for (socket, connection) in connections.drain() {
            connection.reader.abort();
            debug!("Closed {} ({}) on shutdown", socket, connection.peer);
        }
        if self.station.audit_enabled() {
            AuditLogger::server_shutdown("shutdown requested");
        }
        Ok(())
    }

    async fn on_datagram(
        &self,
        datagram: &[u8],
        peer: SocketAddr,
        connections: &mut HashMap<SocketId, LiveConnection>,
    ) {
        match handle_discovery(&self.station, peer, datagram).await {
            DiscoveryAction::Reply(frame) => {
                if let Err(e) = self.discovery.send_to(&frame, peer).await {
                    warn!("Discovery reply to {} failed: {}", peer, e);
                }
            }
            DiscoveryAction::Disconnect(mac) => {
                if let Some(socket) = self.station.disconnect_physical_address(mac).await
                    && let Some(connection) = connections.remove(&socket)
                {
                    connection.reader.abort();
                    if self.station.audit_enabled() {
                        AuditLogger::connection_closed(connection.peer, socket.0, "disconnect notice");
                    }
                }
            }
            DiscoveryAction::Ignore => {}
        }
    }

    async fn on_accept(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        events_tx: &mpsc::Sender<ReadEvent>,
        connections: &mut HashMap<SocketId, LiveConnection>,
    ) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!("set_nodelay on {} failed: {}", peer, e);
        }

        let socket = self.station.next_socket_id();
        let mac = self.station.mac_for(peer.ip()).await;
        let (outbound_tx, outbound_rx) = self.station.outbound_channel();

        let Some(acquired) = self
            .station
            .acquire_connection(peer.ip(), socket, mac, Some(outbound_tx))
            .await
        else {
            warn!("Refusing connection from {}: no free connection slot", peer);
            if self.station.audit_enabled() {
                AuditLogger::connection_refused(peer, "no free connection slot");
            }
            return;
        };

        if let Some(old) = acquired.displaced
            && let Some(previous) = connections.remove(&old)
        {
            previous.reader.abort();
            info!("{} reconnected; closed stale {}", peer.ip(), old);
            if self.station.audit_enabled() {
                AuditLogger::connection_closed(previous.peer, old.0, "replaced by reconnect");
            }
        }

        let (read_half, write_half) = stream.into_split();
        tokio::spawn(write_loop(socket, write_half, outbound_rx));
        let reader = tokio::spawn(read_loop(socket, read_half, events_tx.clone()));

        info!("Accepted {} as {} on slot {}", peer, socket, acquired.handle);
        if self.station.audit_enabled() {
            AuditLogger::connection_accepted(
                peer,
                socket.0,
                acquired.handle.thread,
                acquired.handle.connection,
            );
        }
        connections.insert(
            socket,
            LiveConnection {
                peer,
                handle: acquired.handle,
                reader,
            },
        );
    }

    async fn on_read_event(
        &self,
        event: ReadEvent,
        connections: &mut HashMap<SocketId, LiveConnection>,
    ) {
        match event {
            ReadEvent::Data { socket, data } => {
                let Some(connection) = connections.get(&socket) else {
                    return;
                };
                match self.station.ingest(connection.handle, socket, &data).await {
                    Ok(_) => {}
                    Err(e @ StationError::FrameOverflow { .. }) => {
                        warn!("Protocol error from {}: {}", connection.peer, e);
                        if self.station.audit_enabled() {
                            AuditLogger::protocol_violation(connection.peer, &e.to_string());
                        }
                    }
                    Err(e) => debug!("Dropping data from {}: {}", socket, e),
                }
            }
            ReadEvent::Closed { socket } => {
                let Some(connection) = connections.remove(&socket) else {
                    return;
                };
                self.station
                    .remove_listener(connection.handle, socket)
                    .await;
                info!("{} ({}) disconnected", connection.peer, socket);
                if self.station.audit_enabled() {
                    AuditLogger::connection_closed(connection.peer, socket.0, "peer closed");
                }
            }
        }
    }
}

async fn read_loop(socket: SocketId, mut read_half: OwnedReadHalf, events: mpsc::Sender<ReadEvent>) {
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        match read_half.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let event = ReadEvent::Data {
                    socket,
                    data: Bytes::copy_from_slice(&buf[..n]),
                };
                if events.send(event).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                debug!("Read on {} failed: {}", socket, e);
                break;
            }
        }
    }
    let _ = events.send(ReadEvent::Closed { socket }).await;
}

/// Drain the connection's outbound channel onto the socket. Ends once every
/// sender is gone, which happens when the slot is cleared.
async fn write_loop(socket: SocketId, mut write_half: OwnedWriteHalf, mut outbound: mpsc::Receiver<Bytes>) {
    while let Some(frame) = outbound.recv().await {
        if let Err(e) = write_half.write_all(&frame).await {
            warn!("Write to {} failed: {}", socket, e);
            break;
        }
    }
    let _ = write_half.shutdown().await;
    debug!("Writer for {} finished", socket);
}
