use std::fmt::{Debug, Formatter};
use std::net::Ipv4Addr;

use crate::packet::checksum;

/// Reads the declared total length, if the first four bytes are available. This is all the
///  framing layer needs to know about a packet before it is complete.
pub fn peek_total_length(raw: &[u8]) -> Option<u16> {
    if raw.len() < 4 {
        return None;
    }
    Some(u16::from_be_bytes([raw[2], raw[3]]))
}

/// View of an IPv4 header. The backing bytes must cover at least the fixed 20-byte part; setters
///  write through immediately. The header checksum is only written by [Ipv4Header::update_checksum].
pub struct Ipv4Header<T> {
    raw: T,
}

impl<T: AsRef<[u8]>> Ipv4Header<T> {
    pub fn new(raw: T) -> Ipv4Header<T> {
        debug_assert!(raw.as_ref().len() >= 20);
        Ipv4Header { raw }
    }

    fn bytes(&self) -> &[u8] {
        self.raw.as_ref()
    }

    pub fn version(&self) -> u8 {
        self.bytes()[0] >> 4
    }

    /// header length in bytes, derived from the IHL field
    pub fn header_length(&self) -> usize {
        ((self.bytes()[0] & 0x0f) as usize) * 4
    }

    pub fn total_length(&self) -> u16 {
        u16::from_be_bytes([self.bytes()[2], self.bytes()[3]])
    }

    pub fn protocol(&self) -> u8 {
        self.bytes()[9]
    }

    pub fn checksum(&self) -> u16 {
        u16::from_be_bytes([self.bytes()[10], self.bytes()[11]])
    }

    pub fn source(&self) -> u32 {
        let b = self.bytes();
        u32::from_be_bytes([b[12], b[13], b[14], b[15]])
    }

    pub fn destination(&self) -> u32 {
        let b = self.bytes();
        u32::from_be_bytes([b[16], b[17], b[18], b[19]])
    }
}

impl<T: AsRef<[u8]> + AsMut<[u8]>> Ipv4Header<T> {
    fn bytes_mut(&mut self) -> &mut [u8] {
        self.raw.as_mut()
    }

    pub fn set_header_length(&mut self, header_length: usize) {
        debug_assert!(header_length % 4 == 0 && header_length <= 60);
        let raw = self.bytes_mut();
        raw[0] = (raw[0] & 0xf0) | ((header_length / 4) as u8);
    }

    pub fn set_total_length(&mut self, total_length: u16) {
        self.bytes_mut()[2..4].copy_from_slice(&total_length.to_be_bytes());
    }

    pub fn set_source(&mut self, source: u32) {
        self.bytes_mut()[12..16].copy_from_slice(&source.to_be_bytes());
    }

    pub fn set_destination(&mut self, destination: u32) {
        self.bytes_mut()[16..20].copy_from_slice(&destination.to_be_bytes());
    }

    pub fn swap_source_and_destination(&mut self) {
        let source = self.source();
        let destination = self.destination();
        self.set_source(destination);
        self.set_destination(source);
    }

    /// Recomputes the header checksum over the header's current contents (options included)
    pub fn update_checksum(&mut self) {
        let header_length = self.header_length();
        let checksum = checksum::ipv4_header_checksum(&self.bytes()[..header_length]);
        self.bytes_mut()[10..12].copy_from_slice(&checksum.to_be_bytes());
    }
}

impl<T: AsRef<[u8]>> Debug for Ipv4Header<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "IPv{} {} -> {} (proto {}, len {}, ihl {})",
               self.version(),
               Ipv4Addr::from(self.source()),
               Ipv4Addr::from(self.destination()),
               self.protocol(),
               self.total_length(),
               self.header_length(),
        )
    }
}
