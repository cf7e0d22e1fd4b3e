use std::io;

use bytes::BufMut;

use crate::buffers::fixed_buffer::FixedBuf;
use crate::packet::ipv4_header::Ipv4Header;
use crate::packet::ipv4_packet::{Ipv4Packet, TransportHeader};
use crate::packet::tcp_header::TcpHeader;
use crate::packet::udp_header::UdpHeader;
use crate::packet::{Protocol, IPV4_MIN_HEADER_LENGTH, MAX_PACKET_LENGTH, TCP_MIN_HEADER_LENGTH, UDP_HEADER_LENGTH};
use crate::util::safe_converter::PrecheckedCast;

/// Synthesizes the packets of one flow's network-to-device direction.
///
/// The response header template is captured once from a request packet: addresses and ports
///  swapped, IP and TCP options stripped. Connections patch the template's transport fields
///  (sequence numbers, flags, window) before each packet; every packet then gets a copy of the
///  template, its payload, and freshly computed lengths and checksums.
///
/// Packets with payload and control packets live in separate buffers, so an ACK can be sent
///  while a data packet is still waiting to be accepted towards the device. A returned packet
///  borrows the packetizer, so it is necessarily consumed before the next one is built.
pub struct Packetizer {
    protocol: Protocol,
    template: FixedBuf,
    data: FixedBuf,
    control: FixedBuf,
}

impl Packetizer {
    /// Returns None if `request` is not a valid TCP or UDP packet
    pub fn new(request: &Ipv4Packet) -> Option<Packetizer> {
        let transport = request.transport_header()?;
        let protocol = transport.protocol();
        let raw = request.raw();
        let transport_offset = request.ipv4_header().header_length();
        let transport_length = match protocol {
            Protocol::Tcp => TCP_MIN_HEADER_LENGTH,
            Protocol::Udp => UDP_HEADER_LENGTH,
        };
        let headers_length = IPV4_MIN_HEADER_LENGTH + transport_length;

        let mut template = FixedBuf::new(headers_length);
        template.put_slice(&raw[..IPV4_MIN_HEADER_LENGTH]);
        template.put_slice(&raw[transport_offset..transport_offset + transport_length]);

        let mut packetizer = Packetizer {
            protocol,
            template,
            data: FixedBuf::new(MAX_PACKET_LENGTH),
            control: FixedBuf::new(headers_length),
        };

        let mut ipv4 = Ipv4Header::new(&mut packetizer.template.as_mut()[..IPV4_MIN_HEADER_LENGTH]);
        ipv4.set_header_length(IPV4_MIN_HEADER_LENGTH);
        ipv4.swap_source_and_destination();

        let mut transport = packetizer.transport_header_mut();
        transport.swap_ports();
        if let TransportHeader::Tcp(tcp) = &mut transport {
            tcp.strip_options();
        }
        Some(packetizer)
    }

    fn headers_length(&self) -> usize {
        self.template.len()
    }

    /// maximum payload of a single packet
    pub fn max_payload_length(&self) -> usize {
        MAX_PACKET_LENGTH - self.headers_length()
    }

    /// The transport part of the response template. Changes apply to all packets built after
    ///  the change.
    pub fn transport_header_mut(&mut self) -> TransportHeader<&mut [u8]> {
        let raw = &mut self.template.as_mut()[IPV4_MIN_HEADER_LENGTH..];
        match self.protocol {
            Protocol::Tcp => TransportHeader::Tcp(TcpHeader::new(raw)),
            Protocol::Udp => TransportHeader::Udp(UdpHeader::new(raw)),
        }
    }

    /// Fills the data buffer with the template followed by up to `max_length` payload bytes
    ///  produced by `read`, e.g. a socket read. The packet is built by
    ///  [Packetizer::packetize_filled].
    pub fn fill_payload<F>(&mut self, max_length: usize, read: F) -> io::Result<usize>
    where F: FnOnce(&mut [u8]) -> io::Result<usize>
    {
        let max_length = max_length.min(self.max_payload_length());
        self.data.clear();
        self.data.put_slice(self.template.as_ref());
        let n = read(&mut self.data.unfilled_mut()[..max_length])?;
        self.data.advance(n);
        Ok(n)
    }

    pub fn packetize_filled(&mut self) -> Ipv4Packet<'_> {
        finalize(&mut self.data, self.protocol, self.template.len())
    }

    pub fn packetize(&mut self, payload: &[u8]) -> Ipv4Packet<'_> {
        debug_assert!(payload.len() <= self.max_payload_length());
        self.data.clear();
        self.data.put_slice(self.template.as_ref());
        self.data.put_slice(payload);
        finalize(&mut self.data, self.protocol, self.template.len())
    }

    /// A header-only packet (pure ACK, SYN+ACK, FIN, RST), built without touching the most
    ///  recent data packet
    pub fn packetize_empty_payload(&mut self) -> Ipv4Packet<'_> {
        self.control.clear();
        self.control.put_slice(self.template.as_ref());
        finalize(&mut self.control, self.protocol, self.template.len())
    }

    /// The most recent data packet again, for retrying a send that was refused
    pub fn last_packet(&mut self) -> Ipv4Packet<'_> {
        Ipv4Packet::parse(self.data.as_mut())
    }
}

fn finalize(buf: &mut FixedBuf, protocol: Protocol, headers_length: usize) -> Ipv4Packet<'_> {
    let total_length = buf.len();
    let payload_length: u16 = (total_length - headers_length).prechecked_cast();

    let raw = buf.as_mut();
    Ipv4Header::new(&mut raw[..IPV4_MIN_HEADER_LENGTH]).set_total_length(total_length.prechecked_cast());
    let transport = &mut raw[IPV4_MIN_HEADER_LENGTH..headers_length];
    let mut transport = match protocol {
        Protocol::Tcp => TransportHeader::Tcp(TcpHeader::new(transport)),
        Protocol::Udp => TransportHeader::Udp(UdpHeader::new(transport)),
    };
    transport.set_payload_length(payload_length);

    let mut packet = Ipv4Packet::parse(raw);
    packet.compute_checksums();
    packet
}
