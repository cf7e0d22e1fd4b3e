use std::io;
use std::io::ErrorKind;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};

use mio::net::UdpSocket;
use mio::Interest;
use tracing::{debug, trace, warn};

use crate::buffers::datagram_buffer::DatagramBuffer;
use crate::config::RelayConfig;
use crate::connection::{invalid_packet, Connection, FlowKey, PacketSink};
use crate::packet::ipv4_packet::Ipv4Packet;
use crate::packetizer::Packetizer;
use crate::selector::{ClientId, EventHandler, Readiness, Registration, Selector};

/// Relays one UDP flow of the device through a connected UDP socket. Every datagram is
///  relayed as it is, in both directions.
pub struct UdpConnection {
    key: FlowKey,
    socket: UdpSocket,
    registration: Registration,
    packetizer: Packetizer,
    client_to_network: DatagramBuffer,
    idle_since: Instant,
    idle_timeout: Duration,
    packet_pending: bool,
    closed: bool,
}

impl UdpConnection {
    pub fn open(selector: &mut Selector, client_id: ClientId, key: FlowKey, request: &Ipv4Packet, config: &RelayConfig) -> io::Result<UdpConnection> {
        let packetizer = Packetizer::new(request).ok_or_else(invalid_packet)?;
        let mut socket = UdpSocket::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)))?;
        socket.connect(SocketAddr::V4(key.destination))?;
        let registration = Registration::new(selector, &mut socket, Some(Interest::READABLE), EventHandler::Connection(client_id, key))?;
        debug!("{:?}: open", key);

        Ok(UdpConnection {
            key,
            socket,
            registration,
            packetizer,
            client_to_network: DatagramBuffer::new(config.udp_datagram_buffer_size),
            idle_since: Instant::now(),
            idle_timeout: config.udp_idle_timeout,
            packet_pending: false,
            closed: false,
        })
    }

    fn touch(&mut self) {
        self.idle_since = Instant::now();
    }

    fn process_send(&mut self, selector: &mut Selector) {
        let socket = &self.socket;
        loop {
            match self.client_to_network.write_to(|datagram| socket.send(datagram)) {
                Ok(true) => self.idle_since = Instant::now(),
                Ok(false) => break,
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => {
                    warn!("{:?}: send error: {}", self.key, e);
                    self.disconnect(selector);
                    return;
                }
            }
        }
    }

    fn process_receive(&mut self, selector: &mut Selector, sink: &mut dyn PacketSink) {
        while !self.packet_pending && !self.closed {
            let socket = &self.socket;
            let max_length = self.packetizer.max_payload_length();
            match self.packetizer.fill_payload(max_length, |buf| socket.recv(buf)) {
                Ok(n) => {
                    self.idle_since = Instant::now();
                    let packet = self.packetizer.packetize_filled();
                    trace!("{:?}: datagram of {} bytes towards the device", self.key, n);
                    if !sink.send_to_client(packet.raw()) {
                        trace!("{:?}: client buffer full, waiting to be pulled", self.key);
                        self.packet_pending = true;
                        sink.register_pending(self.key);
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => {
                    warn!("{:?}: receive error: {}", self.key, e);
                    self.disconnect(selector);
                }
            }
        }
    }

    fn update_interests(&mut self, selector: &mut Selector) {
        if self.closed {
            return;
        }
        let mut interest = None;
        if !self.packet_pending {
            interest = Some(Interest::READABLE);
        }
        if !self.client_to_network.is_empty() {
            interest = Some(interest.map_or(Interest::WRITABLE, |i| i | Interest::WRITABLE));
        }
        if let Err(e) = self.registration.update(selector, &mut self.socket, interest) {
            warn!("{:?}: cannot update registration: {}", self.key, e);
            self.disconnect(selector);
        }
    }
}

impl Connection for UdpConnection {
    fn key(&self) -> FlowKey {
        self.key
    }

    fn receive(&mut self, selector: &mut Selector, packet: &Ipv4Packet, _sink: &mut dyn PacketSink) {
        if self.closed {
            return;
        }
        let Some(payload) = packet.payload() else {
            return;
        };
        self.touch();
        if !self.client_to_network.read_from(payload) {
            warn!("{:?}: datagram buffer full, dropping {} bytes", self.key, payload.len());
            return;
        }
        self.process_send(selector);
        self.update_interests(selector);
    }

    fn on_ready(&mut self, selector: &mut Selector, readiness: Readiness, sink: &mut dyn PacketSink) {
        if self.closed {
            return;
        }
        if readiness.writable {
            self.process_send(selector);
        }
        if readiness.readable {
            self.process_receive(selector, sink);
        }
        self.update_interests(selector);
    }

    fn pull(&mut self, selector: &mut Selector, sink: &mut dyn PacketSink) {
        if !self.packet_pending || self.closed {
            return;
        }
        let packet = self.packetizer.last_packet();
        if sink.send_to_client(packet.raw()) {
            self.packet_pending = false;
            self.process_receive(selector, sink);
        }
        else {
            sink.register_pending(self.key);
        }
        self.update_interests(selector);
    }

    fn disconnect(&mut self, selector: &mut Selector) {
        if self.closed {
            return;
        }
        debug!("{:?}: closed", self.key);
        self.closed = true;
        self.registration.cancel(selector, &mut self.socket);
    }

    /// Datagrams still waiting for the socket keep the connection alive
    fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.idle_since) >= self.idle_timeout
            && self.client_to_network.is_empty()
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}
