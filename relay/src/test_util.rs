use std::net::{Ipv4Addr, SocketAddrV4};

use bytes::BufMut;

use crate::connection::{FlowKey, PacketSink};
use crate::packet::ipv4_packet::Ipv4Packet;
use crate::packet::tcp_header::{TcpFlags, TcpHeader};
use crate::packet::Protocol;

pub const DEVICE: SocketAddrV4 = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), 41000);
pub const REMOTE: SocketAddrV4 = SocketAddrV4::new(Ipv4Addr::new(93, 184, 216, 34), 80);

fn put_ipv4_header(buf: &mut Vec<u8>, protocol: Protocol, source: SocketAddrV4, destination: SocketAddrV4, total_length: usize) {
    buf.put_u8(0x45);
    buf.put_u8(0);
    buf.put_u16(total_length as u16);
    buf.put_u16(0x4242); // identification
    buf.put_u16(0x4000); // don't fragment
    buf.put_u8(64);
    buf.put_u8(protocol.into());
    buf.put_u16(0);
    buf.put_slice(&source.ip().octets());
    buf.put_slice(&destination.ip().octets());
}

/// A TCP/IPv4 packet with valid checksums, as the device's stack would send it. SYN packets
///  carry an MSS option.
pub fn tcp_packet(source: SocketAddrV4, destination: SocketAddrV4, seq: u32, ack: u32, flags: TcpFlags, window: u16, payload: &[u8]) -> Vec<u8> {
    let options: &[u8] = if flags.contains(TcpFlags::SYN) { &[0x02, 0x04, 0x05, 0xb4] } else { &[] };
    let tcp_header_length = 20 + options.len();
    let total_length = 20 + tcp_header_length + payload.len();

    let mut buf = Vec::with_capacity(total_length);
    put_ipv4_header(&mut buf, Protocol::Tcp, source, destination, total_length);
    buf.put_u16(source.port());
    buf.put_u16(destination.port());
    buf.put_u32(seq);
    buf.put_u32(ack);
    buf.put_u8(((tcp_header_length / 4) as u8) << 4);
    buf.put_u8(0);
    buf.put_u16(window);
    buf.put_u16(0);
    buf.put_u16(0);
    buf.put_slice(options);
    TcpHeader::new(&mut buf[20..]).set_flags(flags);
    buf.put_slice(payload);

    Ipv4Packet::parse(&mut buf).compute_checksums();
    buf
}

pub fn udp_packet(source: SocketAddrV4, destination: SocketAddrV4, payload: &[u8]) -> Vec<u8> {
    let total_length = 28 + payload.len();
    let mut buf = Vec::with_capacity(total_length);
    put_ipv4_header(&mut buf, Protocol::Udp, source, destination, total_length);
    buf.put_u16(source.port());
    buf.put_u16(destination.port());
    buf.put_u16(8 + payload.len() as u16);
    buf.put_u16(0);
    buf.put_slice(payload);

    Ipv4Packet::parse(&mut buf).compute_checksums();
    buf
}

/// Records everything a connection sends towards the device, optionally refusing packets to
///  simulate a full outbound buffer.
#[derive(Default)]
pub struct CollectingSink {
    pub packets: Vec<Vec<u8>>,
    pub pending: Vec<FlowKey>,
    pub refuse: bool,
}

impl CollectingSink {
    pub fn tcp_headers(&mut self) -> Vec<(TcpFlags, u32, u32, usize)> {
        self.packets.iter_mut()
            .map(|raw| {
                let packet = Ipv4Packet::parse(raw);
                let tcp = packet.tcp_header().unwrap();
                (tcp.flags(), tcp.sequence_number(), tcp.acknowledgement_number(), packet.payload_length())
            })
            .collect()
    }

    pub fn windows(&mut self) -> Vec<u16> {
        self.packets.iter_mut()
            .map(|raw| Ipv4Packet::parse(raw).tcp_header().unwrap().window())
            .collect()
    }

    pub fn payloads(&mut self) -> Vec<Vec<u8>> {
        self.packets.iter_mut()
            .map(|raw| Ipv4Packet::parse(raw).payload().unwrap().to_vec())
            .collect()
    }
}

impl PacketSink for CollectingSink {
    fn send_to_client(&mut self, packet: &[u8]) -> bool {
        if self.refuse {
            return false;
        }
        self.packets.push(packet.to_vec());
        true
    }

    fn register_pending(&mut self, key: FlowKey) {
        if !self.pending.contains(&key) {
            self.pending.push(key);
        }
    }
}
