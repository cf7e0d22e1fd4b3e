use std::fmt::{Debug, Formatter};

use crate::packet::UDP_HEADER_LENGTH;

/// View of the fixed 8-byte UDP header
pub struct UdpHeader<T> {
    raw: T,
}

impl<T: AsRef<[u8]>> UdpHeader<T> {
    pub fn new(raw: T) -> UdpHeader<T> {
        debug_assert!(raw.as_ref().len() >= UDP_HEADER_LENGTH);
        UdpHeader { raw }
    }

    fn u16_at(&self, offs: usize) -> u16 {
        let b = self.raw.as_ref();
        u16::from_be_bytes([b[offs], b[offs + 1]])
    }

    pub fn source_port(&self) -> u16 {
        self.u16_at(0)
    }

    pub fn destination_port(&self) -> u16 {
        self.u16_at(2)
    }

    /// length of header plus payload, as declared on the wire
    pub fn length(&self) -> u16 {
        self.u16_at(4)
    }

    pub fn checksum(&self) -> u16 {
        self.u16_at(6)
    }
}

impl<T: AsRef<[u8]> + AsMut<[u8]>> UdpHeader<T> {
    fn write_u16(&mut self, offs: usize, value: u16) {
        self.raw.as_mut()[offs..offs + 2].copy_from_slice(&value.to_be_bytes());
    }

    pub fn set_source_port(&mut self, port: u16) {
        self.write_u16(0, port);
    }

    pub fn set_destination_port(&mut self, port: u16) {
        self.write_u16(2, port);
    }

    pub fn swap_ports(&mut self) {
        let source = self.source_port();
        let destination = self.destination_port();
        self.set_source_port(destination);
        self.set_destination_port(source);
    }

    pub fn set_payload_length(&mut self, payload_length: u16) {
        self.write_u16(4, UDP_HEADER_LENGTH as u16 + payload_length);
    }

    /// UDP checksums are optional over IPv4; zero means 'not computed'
    pub fn clear_checksum(&mut self) {
        self.write_u16(6, 0);
    }
}

impl<T: AsRef<[u8]>> Debug for UdpHeader<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "UDP {}->{} len={}", self.source_port(), self.destination_port(), self.length())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_patch() {
        let mut raw = vec![0x30, 0x39, 0x00, 0x35, 0x00, 0x0c, 0xab, 0xcd];
        let mut header = UdpHeader::new(raw.as_mut_slice());
        assert_eq!(header.source_port(), 12345);
        assert_eq!(header.destination_port(), 53);
        assert_eq!(header.length(), 12);
        assert_eq!(header.checksum(), 0xabcd);

        header.swap_ports();
        header.set_payload_length(100);
        header.clear_checksum();
        assert_eq!(raw, vec![0x00, 0x35, 0x30, 0x39, 0x00, 108, 0x00, 0x00]);
    }
}
