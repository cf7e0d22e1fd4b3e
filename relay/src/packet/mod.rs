//! Zero-copy views over IPv4 / TCP / UDP wire bytes, the checksum routines they need, and the
//!  framing buffer that recovers packet boundaries from the tunnel byte stream.
//!
//! All views are generic over their backing storage (`T: AsRef<[u8]>`, with setters available
//!  for `T: AsMut<[u8]>`), so the same code reads a borrowed slice of a receive buffer and
//!  patches a packetizer's template in place.

pub mod checksum;
pub mod ipv4_header;
pub mod ipv4_packet;
pub mod packet_buffer;
pub mod tcp_header;
pub mod udp_header;

use num_enum::{IntoPrimitive, TryFromPrimitive};

/// The IPv4 total length field is 16 bits wide, so no packet on the tunnel can be longer
pub const MAX_PACKET_LENGTH: usize = 0xffff;

pub const IPV4_MIN_HEADER_LENGTH: usize = 20;
pub const TCP_MIN_HEADER_LENGTH: usize = 20;
pub const UDP_HEADER_LENGTH: usize = 8;

/// Transport protocols the relay terminates. Everything else is dropped at the router.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum Protocol {
    Tcp = 6,
    Udp = 17,
}

impl Protocol {
    pub fn name(&self) -> &'static str {
        match self {
            Protocol::Tcp => "TCP",
            Protocol::Udp => "UDP",
        }
    }
}
