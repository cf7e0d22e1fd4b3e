//! Per-flow connections: each one terminates a flow from the device on a real socket of the
//!  host.

pub mod tcp;
pub mod udp;

use std::fmt::{Debug, Formatter};
use std::io;
use std::io::ErrorKind;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Instant;

#[cfg(test)] use mockall::automock;

use crate::config::RelayConfig;
use crate::connection::tcp::TcpConnection;
use crate::connection::udp::UdpConnection;
use crate::packet::ipv4_packet::Ipv4Packet;
use crate::packet::Protocol;
use crate::selector::{ClientId, Readiness, Selector};

/// Identifies a flow within a tunnel session. `source` is the device's end, `destination` the
///  address the device wants to reach.
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct FlowKey {
    pub protocol: Protocol,
    pub source: SocketAddrV4,
    pub destination: SocketAddrV4,
}

impl FlowKey {
    /// Returns None for packets that are not valid TCP or UDP packets
    pub fn from_packet(packet: &Ipv4Packet) -> Option<FlowKey> {
        let transport = packet.transport_header()?;
        let ipv4 = packet.ipv4_header();
        Some(FlowKey {
            protocol: transport.protocol(),
            source: SocketAddrV4::new(Ipv4Addr::from(ipv4.source()), transport.source_port()),
            destination: SocketAddrV4::new(Ipv4Addr::from(ipv4.destination()), transport.destination_port()),
        })
    }
}

impl Debug for FlowKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {} -> {}", self.protocol.name(), self.source, self.destination)
    }
}

/// A connection's view of its tunnel session's outbound path towards the device
#[cfg_attr(test, automock)]
pub trait PacketSink {
    /// Enqueues a complete packet for the device. Returns false if there is no room for it right
    ///  now, in which case nothing was enqueued.
    fn send_to_client(&mut self, packet: &[u8]) -> bool;

    /// Asks for [Connection::pull] to be called once the outbound path has drained
    fn register_pending(&mut self, key: FlowKey);
}

/// The capability every flow connection variant provides to the router
pub trait Connection {
    fn key(&self) -> FlowKey;

    /// Handles a packet the device sent on this flow
    fn receive(&mut self, selector: &mut Selector, packet: &Ipv4Packet, sink: &mut dyn PacketSink);

    /// Handles readiness of the connection's own socket
    fn on_ready(&mut self, selector: &mut Selector, readiness: Readiness, sink: &mut dyn PacketSink);

    /// Retries sending the packet that was refused by the sink earlier
    fn pull(&mut self, selector: &mut Selector, sink: &mut dyn PacketSink);

    /// Releases the socket and its registration. Idempotent.
    fn disconnect(&mut self, selector: &mut Selector);

    fn is_expired(&self, now: Instant) -> bool;

    /// true once the connection has terminated and should be removed
    fn is_closed(&self) -> bool;
}

pub enum RoutedConnection {
    Tcp(TcpConnection),
    Udp(UdpConnection),
}

impl RoutedConnection {
    /// Creates the connection for the flow that `packet` starts, including its socket
    pub fn open(selector: &mut Selector, client_id: ClientId, key: FlowKey, packet: &Ipv4Packet, config: &RelayConfig) -> io::Result<RoutedConnection> {
        match key.protocol {
            Protocol::Tcp => Ok(RoutedConnection::Tcp(TcpConnection::open(selector, client_id, key, packet, config)?)),
            Protocol::Udp => Ok(RoutedConnection::Udp(UdpConnection::open(selector, client_id, key, packet, config)?)),
        }
    }

    fn inner(&self) -> &dyn Connection {
        match self {
            RoutedConnection::Tcp(c) => c,
            RoutedConnection::Udp(c) => c,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn Connection {
        match self {
            RoutedConnection::Tcp(c) => c,
            RoutedConnection::Udp(c) => c,
        }
    }
}

impl Connection for RoutedConnection {
    fn key(&self) -> FlowKey {
        self.inner().key()
    }

    fn receive(&mut self, selector: &mut Selector, packet: &Ipv4Packet, sink: &mut dyn PacketSink) {
        self.inner_mut().receive(selector, packet, sink)
    }

    fn on_ready(&mut self, selector: &mut Selector, readiness: Readiness, sink: &mut dyn PacketSink) {
        self.inner_mut().on_ready(selector, readiness, sink)
    }

    fn pull(&mut self, selector: &mut Selector, sink: &mut dyn PacketSink) {
        self.inner_mut().pull(selector, sink)
    }

    fn disconnect(&mut self, selector: &mut Selector) {
        self.inner_mut().disconnect(selector)
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.inner().is_expired(now)
    }

    fn is_closed(&self) -> bool {
        self.inner().is_closed()
    }
}

pub(crate) fn invalid_packet() -> io::Error {
    io::Error::new(ErrorKind::InvalidInput, "packet does not start a TCP or UDP flow")
}
