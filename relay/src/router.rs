use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, trace, warn};

use crate::config::RelayConfig;
use crate::connection::{Connection, FlowKey, PacketSink, RoutedConnection};
use crate::packet::ipv4_packet::Ipv4Packet;
use crate::selector::{ClientId, Readiness, Selector};
use crate::util::hexdump::HexDump;

/// Demultiplexes a tunnel session's packets to their flows' connections, creating connections
///  on a flow's first packet.
///
/// A session rarely has more than a few dozen flows, so they are kept in a plain `Vec`.
pub struct Router {
    client_id: ClientId,
    config: Arc<RelayConfig>,
    connections: Vec<RoutedConnection>,
}

impl Router {
    pub fn new(client_id: ClientId, config: Arc<RelayConfig>) -> Router {
        Router {
            client_id,
            config,
            connections: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    fn find(&self, key: FlowKey) -> Option<usize> {
        self.connections.iter().position(|c| c.key() == key)
    }

    /// Hands a packet from the device to its flow's connection
    pub fn send_to_network(&mut self, selector: &mut Selector, packet: &Ipv4Packet, sink: &mut dyn PacketSink) {
        let key = match FlowKey::from_packet(packet) {
            Some(key) if packet.is_valid() => key,
            _ => {
                warn!("session {}: dropping unsupported packet of {} bytes", self.client_id, packet.length());
                trace!("session {}: {}", self.client_id, HexDump(packet.raw()));
                return;
            }
        };

        let index = match self.find(key) {
            Some(index) => index,
            None => match RoutedConnection::open(selector, self.client_id, key, packet, &self.config) {
                Ok(connection) => {
                    self.connections.push(connection);
                    self.connections.len() - 1
                }
                Err(e) => {
                    warn!("{:?}: cannot open connection, dropping packet: {}", key, e);
                    return;
                }
            },
        };

        self.connections[index].receive(selector, packet, sink);
        self.remove_if_closed(index);
    }

    /// Passes readiness of a connection's socket on. Events for connections that are gone
    ///  already are ignored.
    pub fn on_ready(&mut self, selector: &mut Selector, key: FlowKey, readiness: Readiness, sink: &mut dyn PacketSink) {
        let Some(index) = self.find(key) else {
            trace!("{:?}: event for a removed connection", key);
            return;
        };
        self.connections[index].on_ready(selector, readiness, sink);
        self.remove_if_closed(index);
    }

    pub fn pull(&mut self, selector: &mut Selector, key: FlowKey, sink: &mut dyn PacketSink) {
        let Some(index) = self.find(key) else {
            return;
        };
        self.connections[index].pull(selector, sink);
        self.remove_if_closed(index);
    }

    fn remove_if_closed(&mut self, index: usize) {
        if self.connections[index].is_closed() {
            let connection = self.connections.swap_remove(index);
            debug!("{:?}: removed", connection.key());
        }
    }

    /// Closes all connections
    pub fn clear(&mut self, selector: &mut Selector) {
        for connection in &mut self.connections {
            connection.disconnect(selector);
        }
        self.connections.clear();
    }

    pub fn cleanup_expired(&mut self, selector: &mut Selector, now: Instant) {
        self.connections.retain_mut(|connection| {
            if connection.is_expired(now) {
                debug!("{:?}: expired", connection.key());
                connection.disconnect(selector);
                false
            }
            else {
                true
            }
        });
    }
}
