use std::fmt::{Debug, Formatter};

use crate::packet::ipv4_header::Ipv4Header;
use crate::packet::tcp_header::TcpHeader;
use crate::packet::udp_header::UdpHeader;
use crate::packet::{Protocol, IPV4_MIN_HEADER_LENGTH, TCP_MIN_HEADER_LENGTH, UDP_HEADER_LENGTH};

/// The transport part of a packet, tagged by protocol
pub enum TransportHeader<T> {
    Tcp(TcpHeader<T>),
    Udp(UdpHeader<T>),
}

impl<T: AsRef<[u8]>> TransportHeader<T> {
    pub fn protocol(&self) -> Protocol {
        match self {
            TransportHeader::Tcp(_) => Protocol::Tcp,
            TransportHeader::Udp(_) => Protocol::Udp,
        }
    }

    pub fn source_port(&self) -> u16 {
        match self {
            TransportHeader::Tcp(h) => h.source_port(),
            TransportHeader::Udp(h) => h.source_port(),
        }
    }

    pub fn destination_port(&self) -> u16 {
        match self {
            TransportHeader::Tcp(h) => h.destination_port(),
            TransportHeader::Udp(h) => h.destination_port(),
        }
    }

    pub fn header_length(&self) -> usize {
        match self {
            TransportHeader::Tcp(h) => h.header_length(),
            TransportHeader::Udp(_) => UDP_HEADER_LENGTH,
        }
    }
}

impl<T: AsRef<[u8]> + AsMut<[u8]>> TransportHeader<T> {
    pub fn swap_ports(&mut self) {
        match self {
            TransportHeader::Tcp(h) => h.swap_ports(),
            TransportHeader::Udp(h) => h.swap_ports(),
        }
    }

    /// TCP has no length field, its payload length follows from the IP total length
    pub fn set_payload_length(&mut self, payload_length: u16) {
        if let TransportHeader::Udp(h) = self {
            h.set_payload_length(payload_length);
        }
    }

    pub fn update_checksum(&mut self, source: u32, destination: u32, payload: &[u8]) {
        match self {
            TransportHeader::Tcp(h) => h.update_checksum(source, destination, payload),
            TransportHeader::Udp(h) => h.clear_checksum(),
        }
    }
}

impl<T: AsRef<[u8]>> Debug for TransportHeader<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportHeader::Tcp(h) => h.fmt(f),
            TransportHeader::Udp(h) => h.fmt(f),
        }
    }
}

/// Validates the transport header at `offs` and returns its protocol and length, or None if the
///  packet cannot be relayed.
fn parse_transport(raw: &[u8], protocol: u8, offs: usize) -> Option<(Protocol, usize)> {
    let protocol = Protocol::try_from(protocol).ok()?;
    let available = raw.len().checked_sub(offs)?;
    let header_length = match protocol {
        Protocol::Tcp if available >= TCP_MIN_HEADER_LENGTH => {
            let header_length = TcpHeader::new(&raw[offs..]).header_length();
            if header_length < TCP_MIN_HEADER_LENGTH {
                return None;
            }
            header_length
        }
        Protocol::Tcp => return None,
        Protocol::Udp => UDP_HEADER_LENGTH,
    };
    if header_length > available {
        return None;
    }
    Some((protocol, header_length))
}

/// A view of exactly one IPv4 datagram inside a larger buffer (the framing buffer or a
///  packetizer). The view borrows its buffer mutably, so the buffer cannot be touched while the
///  packet is alive, and the packet cannot outlive the next mutation of the buffer.
pub struct Ipv4Packet<'a> {
    raw: &'a mut [u8],
    transport: Option<(Protocol, usize)>,
}

impl<'a> Ipv4Packet<'a> {
    /// `raw` must be exactly as long as the packet's declared total length.
    ///
    /// Packets that are not IPv4, carry an unsupported protocol or have inconsistent header
    ///  lengths are still returned, but [Ipv4Packet::is_valid] reports false and no transport
    ///  view is available.
    pub fn parse(raw: &'a mut [u8]) -> Ipv4Packet<'a> {
        let transport = Self::validate(raw);
        Ipv4Packet { raw, transport }
    }

    fn validate(raw: &[u8]) -> Option<(Protocol, usize)> {
        if raw.len() < IPV4_MIN_HEADER_LENGTH {
            return None;
        }
        let ipv4 = Ipv4Header::new(raw);
        debug_assert_eq!(ipv4.total_length() as usize, raw.len());
        if ipv4.version() != 4 {
            return None;
        }
        let ipv4_header_length = ipv4.header_length();
        if ipv4_header_length < IPV4_MIN_HEADER_LENGTH || ipv4_header_length > raw.len() {
            return None;
        }
        parse_transport(raw, ipv4.protocol(), ipv4_header_length)
    }

    pub fn is_valid(&self) -> bool {
        self.transport.is_some()
    }

    pub fn raw(&self) -> &[u8] {
        &*self.raw
    }

    pub fn length(&self) -> usize {
        self.raw.len()
    }

    pub fn protocol(&self) -> Option<Protocol> {
        self.transport.map(|(p, _)| p)
    }

    pub fn ipv4_header(&self) -> Ipv4Header<&[u8]> {
        Ipv4Header::new(&self.raw[..self.ipv4_header_length()])
    }

    pub fn ipv4_header_mut(&mut self) -> Ipv4Header<&mut [u8]> {
        let len = self.ipv4_header_length();
        Ipv4Header::new(&mut self.raw[..len])
    }

    fn ipv4_header_length(&self) -> usize {
        if self.is_valid() {
            Ipv4Header::new(&*self.raw).header_length()
        }
        else {
            IPV4_MIN_HEADER_LENGTH.min(self.raw.len())
        }
    }

    fn payload_offset(&self) -> Option<usize> {
        self.transport.map(|(_, transport_len)| self.ipv4_header_length() + transport_len)
    }

    pub fn transport_header(&self) -> Option<TransportHeader<&[u8]>> {
        let (protocol, len) = self.transport?;
        let offs = self.ipv4_header_length();
        let raw = &self.raw[offs..offs + len];
        Some(match protocol {
            Protocol::Tcp => TransportHeader::Tcp(TcpHeader::new(raw)),
            Protocol::Udp => TransportHeader::Udp(UdpHeader::new(raw)),
        })
    }

    pub fn tcp_header(&self) -> Option<TcpHeader<&[u8]>> {
        match self.transport_header()? {
            TransportHeader::Tcp(h) => Some(h),
            TransportHeader::Udp(_) => None,
        }
    }

    pub fn payload(&self) -> Option<&[u8]> {
        Some(&self.raw[self.payload_offset()?..])
    }

    pub fn payload_length(&self) -> usize {
        self.payload().map(|p| p.len()).unwrap_or(0)
    }

    /// Writes the IPv4 header checksum and the transport checksum for the packet's current
    ///  contents. This is the finalization step before a synthesized packet is handed out.
    pub fn compute_checksums(&mut self) {
        let Some((protocol, transport_len)) = self.transport else {
            return;
        };
        let ipv4_len = self.ipv4_header_length();

        let (ip, rest) = self.raw.split_at_mut(ipv4_len);
        let mut ipv4 = Ipv4Header::new(ip);
        ipv4.update_checksum();
        let source = ipv4.source();
        let destination = ipv4.destination();

        let (transport, payload) = rest.split_at_mut(transport_len);
        let mut transport = match protocol {
            Protocol::Tcp => TransportHeader::Tcp(TcpHeader::new(transport)),
            Protocol::Udp => TransportHeader::Udp(UdpHeader::new(transport)),
        };
        transport.update_checksum(source, destination, payload);
    }
}

impl Debug for Ipv4Packet<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.raw.len() < IPV4_MIN_HEADER_LENGTH {
            return write!(f, "<truncated packet, {} bytes>", self.raw.len());
        }
        match self.transport_header() {
            Some(transport) => write!(f, "{:?} / {:?} / {} bytes payload", self.ipv4_header(), transport, self.payload_length()),
            None => write!(f, "{:?} (unsupported)", self.ipv4_header()),
        }
    }
}
