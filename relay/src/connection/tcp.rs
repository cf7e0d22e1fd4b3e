use std::io;
use std::io::{ErrorKind, Read};
use std::marker::PhantomData;
use std::net::{Shutdown, SocketAddr};
use std::time::Instant;

use mio::net::TcpStream;
use mio::Interest;
use tracing::{debug, trace, warn};

use crate::buffers::stream_buffer::StreamBuffer;
use crate::config::RelayConfig;
use crate::connection::{invalid_packet, Connection, FlowKey, PacketSink};
use crate::packet::ipv4_packet::{Ipv4Packet, TransportHeader};
use crate::packet::tcp_header::TcpFlags;
use crate::packetizer::Packetizer;
use crate::selector::{ClientId, EventHandler, Readiness, Registration, Selector};
use crate::util::random::{Random, RngRandom};
use crate::util::safe_converter::{PrecheckedCast, SafeCast};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TcpState {
    /// created, waiting for the device's first packet
    Initial,
    /// the device's SYN was accepted, the connect to the real destination is in progress
    SynSent,
    /// connected upstream and sent SYN+ACK, waiting for the device's ACK
    SynReceived,
    Established,
    /// the device sent FIN, the real socket is still open
    CloseWait,
    /// both sides closed, waiting for the device to ACK our FIN
    LastAck,
    /// the real socket closed first, our FIN is not acknowledged yet
    FinWait1,
    /// the real socket closed first and the device ACKed our FIN
    FinWait2,
    /// the device's FIN crossed ours
    Closing,
    Closed,
}

/// The fields of a device packet the state machine works with
struct Segment<'p> {
    flags: TcpFlags,
    sequence_number: u32,
    acknowledgement_number: u32,
    window: u16,
    payload: &'p [u8],
}

impl<'p> Segment<'p> {
    fn parse(packet: &'p Ipv4Packet) -> Option<Segment<'p>> {
        let tcp = packet.tcp_header()?;
        Some(Segment {
            flags: tcp.flags(),
            sequence_number: tcp.sequence_number(),
            acknowledgement_number: tcp.acknowledgement_number(),
            window: tcp.window(),
            payload: packet.payload().unwrap_or_default(),
        })
    }
}

/// Terminates a TCP flow of the device on a real TCP socket. Towards the device, this is the
///  server side of a TCP connection, just enough of it to let the device's own stack take care
///  of retransmission: packets that arrive out of order are ignored, and data sent to the device
///  is never retransmitted because the transport to the device is reliable.
///
/// At most one data packet towards the device is 'in flight' (built, but refused by the sink).
///  Reading from the real socket pauses until it was accepted.
pub struct TcpConnection<R: Random = RngRandom> {
    key: FlowKey,
    stream: TcpStream,
    registration: Registration,
    packetizer: Packetizer,
    client_to_network: StreamBuffer,
    max_payload: usize,
    state: TcpState,

    /// the next sequence number towards the device
    sequence_number: u32,
    /// the next sequence number expected from the device
    acknowledgement_number: u32,
    /// what the device last acknowledged of our data, and the window it advertised with that
    their_acknowledgement_number: u32,
    client_window: u16,
    last_advertised_window: u16,

    /// the real socket reached EOF
    remote_closed: bool,
    /// the device sent FIN
    client_closed: bool,
    network_write_shutdown: bool,
    packet_pending: bool,
    _random: PhantomData<R>,
}

impl<R: Random> TcpConnection<R> {
    /// Starts a non-blocking connect to the flow's destination. `request` is the device's first
    ///  packet on the flow, it is not processed here.
    pub fn open(selector: &mut Selector, client_id: ClientId, key: FlowKey, request: &Ipv4Packet, config: &RelayConfig) -> io::Result<TcpConnection<R>> {
        let packetizer = Packetizer::new(request).ok_or_else(invalid_packet)?;
        let mut stream = TcpStream::connect(SocketAddr::V4(key.destination))?;
        let registration = Registration::new(selector, &mut stream, Some(Interest::WRITABLE), EventHandler::Connection(client_id, key))?;
        debug!("{:?}: connecting", key);

        Ok(TcpConnection {
            key,
            stream,
            registration,
            packetizer,
            client_to_network: StreamBuffer::new(config.tcp_stream_buffer_size),
            max_payload: config.max_tcp_payload,
            state: TcpState::Initial,
            sequence_number: 0,
            acknowledgement_number: 0,
            their_acknowledgement_number: 0,
            client_window: 0,
            last_advertised_window: 0,
            remote_closed: false,
            client_closed: false,
            network_write_shutdown: false,
            packet_pending: false,
            _random: PhantomData,
        })
    }

    pub fn state(&self) -> TcpState {
        self.state
    }

    fn set_state(&mut self, state: TcpState) {
        debug!("{:?}: {:?} -> {:?}", self.key, self.state, state);
        self.state = state;
    }

    fn handle_first_packet(&mut self, selector: &mut Selector, segment: &Segment, sink: &mut dyn PacketSink) {
        if !segment.flags.contains(TcpFlags::SYN) {
            debug!("{:?}: first packet is not a SYN ({:?}), resetting", self.key, segment.flags);
            if segment.flags.contains(TcpFlags::ACK) {
                self.sequence_number = segment.acknowledgement_number;
            }
            let payload_length: u32 = segment.payload.len().prechecked_cast();
            self.acknowledgement_number = segment.sequence_number.wrapping_add(payload_length);
            self.reset(selector, sink);
            return;
        }

        self.acknowledgement_number = segment.sequence_number.wrapping_add(1);
        self.sequence_number = R::next_u32();
        self.their_acknowledgement_number = self.sequence_number;
        self.client_window = segment.window;
        self.set_state(TcpState::SynSent);
    }

    fn handle_duplicate_syn(&mut self, selector: &mut Selector, segment: &Segment, sink: &mut dyn PacketSink) {
        if self.state == TcpState::SynSent {
            debug!("{:?}: duplicate SYN while connecting, accepting seq {}", self.key, segment.sequence_number);
            self.acknowledgement_number = segment.sequence_number.wrapping_add(1);
            self.client_window = segment.window;
        }
        else {
            debug!("{:?}: unexpected SYN in state {:?}, resetting", self.key, self.state);
            self.reset(selector, sink);
        }
    }

    fn handle_segment(&mut self, selector: &mut Selector, segment: &Segment, sink: &mut dyn PacketSink) {
        if segment.flags.contains(TcpFlags::RST) {
            debug!("{:?}: reset by the device", self.key);
            self.close(selector);
            return;
        }
        if self.state == TcpState::SynSent {
            trace!("{:?}: still connecting, ignoring {:?}", self.key, segment.flags);
            return;
        }
        if segment.sequence_number != self.acknowledgement_number {
            trace!("{:?}: ignoring out-of-order packet: seq {}, expected {}", self.key, segment.sequence_number, self.acknowledgement_number);
            return;
        }

        if segment.flags.contains(TcpFlags::ACK) {
            self.handle_ack(selector, segment, sink);
            if self.state == TcpState::Closed {
                return;
            }
        }
        if !segment.payload.is_empty() && !self.handle_payload(selector, segment.payload, sink) {
            // a FIN behind dropped payload must wait for the retransmission
            return;
        }
        if self.state == TcpState::Closed {
            return;
        }
        if segment.flags.contains(TcpFlags::FIN) {
            self.handle_fin(selector, sink);
        }
    }

    fn handle_ack(&mut self, selector: &mut Selector, segment: &Segment, sink: &mut dyn PacketSink) {
        self.their_acknowledgement_number = segment.acknowledgement_number;
        self.client_window = segment.window;

        let acks_our_fin = segment.acknowledgement_number == self.sequence_number;
        match self.state {
            TcpState::SynReceived => self.set_state(TcpState::Established),
            TcpState::FinWait1 if acks_our_fin => self.set_state(TcpState::FinWait2),
            TcpState::Closing | TcpState::LastAck if acks_our_fin => {
                debug!("{:?}: closed gracefully", self.key);
                self.close(selector);
                return;
            }
            _ => {}
        }

        // the window may have opened
        self.process_receive(selector, sink);
    }

    /// Returns whether the payload was taken and acknowledged
    fn handle_payload(&mut self, selector: &mut Selector, payload: &[u8], sink: &mut dyn PacketSink) -> bool {
        if !matches!(self.state, TcpState::Established | TcpState::FinWait1 | TcpState::FinWait2) {
            trace!("{:?}: ignoring payload in state {:?}", self.key, self.state);
            return false;
        }
        if self.client_to_network.remaining() < payload.len() {
            // not acknowledged, so the device's stack will retransmit
            warn!("{:?}: stream buffer full, dropping {} bytes", self.key, payload.len());
            return false;
        }

        self.client_to_network.read_from(payload);
        let payload_length: u32 = payload.len().prechecked_cast();
        self.acknowledgement_number = self.acknowledgement_number.wrapping_add(payload_length);
        self.send_empty_packet(TcpFlags::ACK, sink);
        self.process_send(selector, sink);
        true
    }

    fn handle_fin(&mut self, selector: &mut Selector, sink: &mut dyn PacketSink) {
        self.acknowledgement_number = self.acknowledgement_number.wrapping_add(1);
        self.client_closed = true;

        match self.state {
            // our FIN must not overtake a data packet that is still pending
            TcpState::SynReceived | TcpState::Established if self.remote_closed && !self.packet_pending => {
                self.send_empty_packet(TcpFlags::FIN | TcpFlags::ACK, sink);
                self.sequence_number = self.sequence_number.wrapping_add(1);
                self.set_state(TcpState::LastAck);
            }
            TcpState::SynReceived | TcpState::Established => {
                self.send_empty_packet(TcpFlags::ACK, sink);
                self.set_state(TcpState::CloseWait);
            }
            TcpState::FinWait1 => {
                self.send_empty_packet(TcpFlags::ACK, sink);
                self.set_state(TcpState::Closing);
            }
            TcpState::FinWait2 => {
                self.send_empty_packet(TcpFlags::ACK, sink);
                debug!("{:?}: closed gracefully", self.key);
                self.close(selector);
                return;
            }
            _ => {
                self.send_empty_packet(TcpFlags::ACK, sink);
            }
        }
        self.shutdown_network_write_if_drained();
    }

    /// Sends our FIN once the real socket reached EOF and everything read before was accepted
    ///  towards the device
    fn maybe_send_fin(&mut self, sink: &mut dyn PacketSink) {
        if !self.remote_closed || self.packet_pending {
            return;
        }
        let next_state = match self.state {
            TcpState::Established => TcpState::FinWait1,
            TcpState::CloseWait => TcpState::LastAck,
            _ => return,
        };
        self.send_empty_packet(TcpFlags::FIN | TcpFlags::ACK, sink);
        self.sequence_number = self.sequence_number.wrapping_add(1);
        self.set_state(next_state);
    }

    fn check_connected(&mut self, selector: &mut Selector, sink: &mut dyn PacketSink) {
        match self.stream.take_error() {
            Ok(None) => {}
            Ok(Some(e)) | Err(e) => {
                warn!("{:?}: connect failed: {}", self.key, e);
                self.reset(selector, sink);
                return;
            }
        }
        match self.stream.peer_addr() {
            Ok(_) => {
                debug!("{:?}: connected", self.key);
                self.set_state(TcpState::SynReceived);
                self.send_empty_packet(TcpFlags::SYN | TcpFlags::ACK, sink);
                // SYN consumes one sequence number
                self.sequence_number = self.sequence_number.wrapping_add(1);
            }
            Err(e) if e.kind() == ErrorKind::NotConnected || e.kind() == ErrorKind::WouldBlock => {
                trace!("{:?}: still connecting", self.key);
            }
            Err(e) => {
                warn!("{:?}: connect failed: {}", self.key, e);
                self.reset(selector, sink);
            }
        }
    }

    /// The part of the device's receive window not yet filled by unacknowledged data.
    ///
    /// If the device acknowledges less than it could (or the numbers are inconsistent), the
    ///  wrapping difference lands outside the window and counts as 'no space'.
    fn remaining_client_window(&self) -> usize {
        let window: u32 = self.client_window.safe_cast();
        let remaining = self.their_acknowledgement_number
            .wrapping_add(window)
            .wrapping_sub(self.sequence_number);
        if remaining > window {
            0
        }
        else {
            remaining.safe_cast()
        }
    }

    fn may_read(&self) -> bool {
        matches!(self.state, TcpState::Established | TcpState::CloseWait)
            && !self.remote_closed
            && !self.packet_pending
    }

    /// Moves data from the real socket to the device as long as the device's window and the
    ///  sink permit
    fn process_receive(&mut self, selector: &mut Selector, sink: &mut dyn PacketSink) {
        while self.may_read() {
            let window = self.remaining_client_window();
            if window == 0 {
                trace!("{:?}: device window is full", self.key);
                break;
            }

            self.prepare_header(TcpFlags::ACK | TcpFlags::PSH);
            let stream = &mut self.stream;
            match self.packetizer.fill_payload(window.min(self.max_payload), |buf| stream.read(buf)) {
                Ok(0) => {
                    debug!("{:?}: remote closed", self.key);
                    self.remote_closed = true;
                    self.maybe_send_fin(sink);
                }
                Ok(n) => {
                    let packet = self.packetizer.packetize_filled();
                    trace!("{:?}: {} bytes towards the device", self.key, n);
                    let n: u32 = n.prechecked_cast();
                    self.sequence_number = self.sequence_number.wrapping_add(n);
                    if !sink.send_to_client(packet.raw()) {
                        trace!("{:?}: client buffer full, waiting to be pulled", self.key);
                        self.packet_pending = true;
                        sink.register_pending(self.key);
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => {
                    warn!("{:?}: read error: {}", self.key, e);
                    self.reset(selector, sink);
                }
            }
        }
    }

    /// Moves buffered device data to the real socket
    fn process_send(&mut self, selector: &mut Selector, sink: &mut dyn PacketSink) {
        let mut written = 0;
        while !self.client_to_network.is_empty() {
            match self.client_to_network.write_to(&mut self.stream) {
                Ok(0) => {
                    warn!("{:?}: socket accepts no more data", self.key);
                    self.reset(selector, sink);
                    return;
                }
                Ok(n) => written += n,
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => {
                    warn!("{:?}: write error: {}", self.key, e);
                    self.reset(selector, sink);
                    return;
                }
            }
        }
        trace!("{:?}: {} bytes towards the network", self.key, written);

        if written > 0 && self.last_advertised_window == 0 {
            // the device will not send again until it learns that the window opened
            self.send_empty_packet(TcpFlags::ACK, sink);
        }
        self.shutdown_network_write_if_drained();
    }

    fn shutdown_network_write_if_drained(&mut self) {
        if self.client_closed && !self.network_write_shutdown && self.client_to_network.is_empty() && self.state != TcpState::Closed {
            self.network_write_shutdown = true;
            if let Err(e) = self.stream.shutdown(Shutdown::Write) {
                debug!("{:?}: shutdown failed: {}", self.key, e);
            }
        }
    }

    fn prepare_header(&mut self, flags: TcpFlags) {
        let window: u16 = self.client_to_network.remaining().min(u16::MAX as usize).prechecked_cast();
        self.last_advertised_window = window;
        if let TransportHeader::Tcp(mut tcp) = self.packetizer.transport_header_mut() {
            tcp.set_flags(flags);
            tcp.set_sequence_number(self.sequence_number);
            tcp.set_acknowledgement_number(self.acknowledgement_number);
            tcp.set_window(window);
        }
    }

    /// Sends a control packet. Control packets are not retried if the sink refuses them: the
    ///  device's stack recovers from their loss.
    fn send_empty_packet(&mut self, flags: TcpFlags, sink: &mut dyn PacketSink) {
        self.prepare_header(flags);
        let packet = self.packetizer.packetize_empty_payload();
        trace!("{:?}: sending {:?}", self.key, packet);
        if !sink.send_to_client(packet.raw()) {
            warn!("{:?}: client buffer full, dropping {:?} packet", self.key, flags);
        }
    }

    fn reset(&mut self, selector: &mut Selector, sink: &mut dyn PacketSink) {
        if self.state == TcpState::Closed {
            return;
        }
        debug!("{:?}: resetting", self.key);
        // a device in SYN-SENT only accepts a reset that acknowledges its SYN
        let flags = if self.state == TcpState::SynSent { TcpFlags::RST | TcpFlags::ACK } else { TcpFlags::RST };
        self.send_empty_packet(flags, sink);
        self.close(selector);
    }

    fn close(&mut self, selector: &mut Selector) {
        if self.state == TcpState::Closed {
            return;
        }
        self.set_state(TcpState::Closed);
        self.registration.cancel(selector, &mut self.stream);
    }

    fn update_interests(&mut self, selector: &mut Selector) {
        if self.state == TcpState::Closed {
            return;
        }
        let interest = if matches!(self.state, TcpState::Initial | TcpState::SynSent) {
            Some(Interest::WRITABLE)
        }
        else {
            let mut interest = None;
            if self.may_read() {
                interest = Some(Interest::READABLE);
            }
            if !self.client_to_network.is_empty() {
                interest = Some(interest.map_or(Interest::WRITABLE, |i| i | Interest::WRITABLE));
            }
            interest
        };

        if let Err(e) = self.registration.update(selector, &mut self.stream, interest) {
            warn!("{:?}: cannot update registration: {}", self.key, e);
            self.close(selector);
        }
    }
}

impl<R: Random> Connection for TcpConnection<R> {
    fn key(&self) -> FlowKey {
        self.key
    }

    fn receive(&mut self, selector: &mut Selector, packet: &Ipv4Packet, sink: &mut dyn PacketSink) {
        let Some(segment) = Segment::parse(packet) else {
            return;
        };
        trace!("{:?}: received {:?} seq={} ack={} win={}, {} bytes payload", self.key, segment.flags, segment.sequence_number, segment.acknowledgement_number, segment.window, segment.payload.len());

        match self.state {
            TcpState::Closed => return,
            TcpState::Initial => self.handle_first_packet(selector, &segment, sink),
            _ if segment.flags.contains(TcpFlags::SYN) => self.handle_duplicate_syn(selector, &segment, sink),
            _ => self.handle_segment(selector, &segment, sink),
        }
        self.update_interests(selector);
    }

    fn on_ready(&mut self, selector: &mut Selector, readiness: Readiness, sink: &mut dyn PacketSink) {
        match self.state {
            TcpState::Closed => return,
            TcpState::Initial => {}
            TcpState::SynSent => {
                if readiness.writable || readiness.error {
                    self.check_connected(selector, sink);
                }
            }
            _ => {
                if readiness.writable {
                    self.process_send(selector, sink);
                }
                if readiness.readable {
                    self.process_receive(selector, sink);
                }
            }
        }
        self.update_interests(selector);
    }

    fn pull(&mut self, selector: &mut Selector, sink: &mut dyn PacketSink) {
        if !self.packet_pending || self.state == TcpState::Closed {
            return;
        }
        let packet = self.packetizer.last_packet();
        if sink.send_to_client(packet.raw()) {
            trace!("{:?}: pending packet accepted", self.key);
            self.packet_pending = false;
            self.maybe_send_fin(sink);
            self.process_receive(selector, sink);
        }
        else {
            sink.register_pending(self.key);
        }
        self.update_interests(selector);
    }

    fn disconnect(&mut self, selector: &mut Selector) {
        self.close(selector);
    }

    fn is_expired(&self, _now: Instant) -> bool {
        false
    }

    fn is_closed(&self) -> bool {
        self.state == TcpState::Closed
    }
}
