use std::collections::VecDeque;
use std::io;
use std::io::ErrorKind;
use std::sync::Arc;
use std::time::Instant;

use mio::net::TcpStream;
use mio::Interest;
use tracing::{debug, info, warn};

use crate::buffers::stream_buffer::StreamBuffer;
use crate::config::RelayConfig;
use crate::connection::{FlowKey, PacketSink};
use crate::packet::packet_buffer::Ipv4PacketBuffer;
use crate::packet::MAX_PACKET_LENGTH;
use crate::router::Router;
use crate::selector::{ClientId, EventHandler, Readiness, Registration, Selector};

/// The outbound path of a tunnel session: packets waiting to be written to the device, and the
///  connections that have more to send once there is room again.
struct ClientSink {
    network_to_client: StreamBuffer,
    pending: VecDeque<FlowKey>,
}

impl PacketSink for ClientSink {
    fn send_to_client(&mut self, packet: &[u8]) -> bool {
        if self.network_to_client.remaining() < packet.len() {
            return false;
        }
        self.network_to_client.read_from(packet);
        true
    }

    fn register_pending(&mut self, key: FlowKey) {
        if !self.pending.contains(&key) {
            self.pending.push_back(key);
        }
    }
}

/// One tunnel session: a TCP connection from the device's tunnel carrying raw IPv4 packets in
///  both directions, back to back without any additional framing.
pub struct Client {
    id: ClientId,
    stream: TcpStream,
    registration: Registration,
    client_to_network: Ipv4PacketBuffer,
    sink: ClientSink,
    router: Router,
    closed: bool,
}

impl Client {
    pub fn new(selector: &mut Selector, id: ClientId, mut stream: TcpStream, config: Arc<RelayConfig>) -> io::Result<Client> {
        let registration = Registration::new(selector, &mut stream, Some(Interest::READABLE), EventHandler::Client(id))?;
        info!("session {}: connected", id);
        Ok(Client {
            id,
            stream,
            registration,
            client_to_network: Ipv4PacketBuffer::new(),
            sink: ClientSink {
                network_to_client: StreamBuffer::new(config.client_buffer_size),
                pending: VecDeque::new(),
            },
            router: Router::new(id, config),
            closed: false,
        })
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn num_connections(&self) -> usize {
        self.router.len()
    }

    /// Handles readiness of the tunnel socket itself
    pub fn on_ready(&mut self, selector: &mut Selector, readiness: Readiness) {
        if self.closed {
            return;
        }
        if readiness.readable {
            self.process_receive(selector);
        }
        self.after_event(selector);
    }

    /// Handles readiness of one of the session's connection sockets
    pub fn on_connection_ready(&mut self, selector: &mut Selector, key: FlowKey, readiness: Readiness) {
        if self.closed {
            return;
        }
        self.router.on_ready(selector, key, readiness, &mut self.sink);
        self.after_event(selector);
    }

    pub fn cleanup_expired(&mut self, selector: &mut Selector, now: Instant) {
        if self.closed {
            return;
        }
        self.router.cleanup_expired(selector, now);
    }

    fn process_receive(&mut self, selector: &mut Selector) {
        loop {
            match self.client_to_network.read_from(&mut self.stream) {
                Ok(0) => {
                    info!("session {}: closed by the device", self.id);
                    self.close(selector);
                    return;
                }
                Ok(_) => {
                    if let Err(e) = self.route_packets(selector) {
                        warn!("session {}: {}", self.id, e);
                        self.close(selector);
                        return;
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => {
                    warn!("session {}: read error: {}", self.id, e);
                    self.close(selector);
                    return;
                }
            }
        }
    }

    /// Routes every complete packet in the framing buffer
    fn route_packets(&mut self, selector: &mut Selector) -> io::Result<()> {
        loop {
            let Some(packet) = self.client_to_network.as_ipv4_packet()? else {
                return Ok(());
            };
            self.router.send_to_network(selector, &packet, &mut self.sink);
            self.client_to_network.consume_packet();
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        while !self.sink.network_to_client.is_empty() {
            match self.sink.network_to_client.write_to(&mut self.stream) {
                Ok(0) => return Err(ErrorKind::WriteZero.into()),
                Ok(_) => {}
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Writes as much as possible to the device, lets waiting connections continue while there
    ///  is room for any packet, and adjusts the session socket's interest to what remains.
    fn after_event(&mut self, selector: &mut Selector) {
        if self.closed {
            return;
        }
        if let Err(e) = self.flush_and_pull(selector) {
            warn!("session {}: write error: {}", self.id, e);
            self.close(selector);
            return;
        }

        let interest = if self.sink.network_to_client.is_empty() {
            Interest::READABLE
        }
        else {
            Interest::READABLE | Interest::WRITABLE
        };
        if let Err(e) = self.registration.update(selector, &mut self.stream, Some(interest)) {
            warn!("session {}: cannot update registration: {}", self.id, e);
            self.close(selector);
        }
    }

    fn flush_and_pull(&mut self, selector: &mut Selector) -> io::Result<()> {
        self.flush()?;
        // a connection that is refused again registers itself again, which requires the buffer
        //  to be nearly full, so this terminates
        while self.sink.network_to_client.remaining() >= MAX_PACKET_LENGTH {
            let Some(key) = self.sink.pending.pop_front() else {
                break;
            };
            debug!("session {}: pulling {:?}", self.id, key);
            self.router.pull(selector, key, &mut self.sink);
            self.flush()?;
        }
        Ok(())
    }

    /// Closes the session and all of its connections. Idempotent.
    pub fn close(&mut self, selector: &mut Selector) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.registration.cancel(selector, &mut self.stream);
        self.router.clear(selector);
        self.sink.pending.clear();
        info!("session {}: closed", self.id);
    }
}
