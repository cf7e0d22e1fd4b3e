use std::io;
use std::io::{ErrorKind, Read};

use tracing::trace;

use crate::packet::ipv4_header::peek_total_length;
use crate::packet::ipv4_packet::Ipv4Packet;
use crate::packet::{IPV4_MIN_HEADER_LENGTH, MAX_PACKET_LENGTH};

/// Recovers packet boundaries from the tunnel's byte stream: IPv4 packets arrive back to back
///  with no framing of their own, so the declared total length of each packet is all there is.
///
/// The buffer holds at most one maximum-sized packet. Complete packets are handed out as views
///  into the buffer and must be consumed before more bytes are read.
pub struct Ipv4PacketBuffer {
    buf: Vec<u8>,
    start: usize,
    end: usize,
}

impl Default for Ipv4PacketBuffer {
    fn default() -> Self {
        Ipv4PacketBuffer::new()
    }
}

impl Ipv4PacketBuffer {
    pub fn new() -> Ipv4PacketBuffer {
        Ipv4PacketBuffer {
            buf: vec![0; MAX_PACKET_LENGTH],
            start: 0,
            end: 0,
        }
    }

    /// number of buffered bytes not yet consumed
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Does a single read from `source` into the free part of the buffer, returning the number of
    ///  bytes read (0 at EOF).
    pub fn read_from<R: Read>(&mut self, source: &mut R) -> io::Result<usize> {
        if self.start > 0 {
            self.buf.copy_within(self.start..self.end, 0);
            self.end -= self.start;
            self.start = 0;
        }
        // all complete packets are consumed before the next read, so a partial packet never
        //  fills the buffer
        debug_assert!(self.end < self.buf.len());

        let n = source.read(&mut self.buf[self.end..])?;
        self.end += n;
        Ok(n)
    }

    fn available_packet_length(&self) -> io::Result<Option<usize>> {
        let Some(total_length) = peek_total_length(&self.buf[self.start..self.end]) else {
            return Ok(None);
        };
        let total_length = total_length as usize;
        if total_length < IPV4_MIN_HEADER_LENGTH {
            return Err(io::Error::new(ErrorKind::InvalidData, format!("corrupt packet stream: declared packet length {}", total_length)));
        }
        if self.len() < total_length {
            trace!("incomplete packet: {} of {} bytes buffered", self.len(), total_length);
            return Ok(None);
        }
        Ok(Some(total_length))
    }

    /// A view of the next complete packet, if there is one. An error means the stream can not be
    ///  framed any further.
    pub fn as_ipv4_packet(&mut self) -> io::Result<Option<Ipv4Packet<'_>>> {
        match self.available_packet_length()? {
            Some(len) => Ok(Some(Ipv4Packet::parse(&mut self.buf[self.start..self.start + len]))),
            None => Ok(None),
        }
    }

    /// Discards the packet most recently returned by [Ipv4PacketBuffer::as_ipv4_packet]
    pub fn consume_packet(&mut self) {
        if let Ok(Some(len)) = self.available_packet_length() {
            self.start += len;
        }
        if self.start == self.end {
            self.start = 0;
            self.end = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::Protocol;
    use crate::test_util::{udp_packet, DEVICE, REMOTE};
    use rstest::rstest;

    fn udp_32_bytes() -> Vec<u8> {
        let raw = udp_packet(DEVICE, REMOTE, &[1, 2, 3, 4]);
        assert_eq!(raw.len(), 32);
        raw
    }

    #[test]
    fn test_split_read() {
        let raw = udp_32_bytes();
        let mut buffer = Ipv4PacketBuffer::new();

        assert_eq!(buffer.read_from(&mut &raw[..14]).unwrap(), 14);
        assert!(buffer.as_ipv4_packet().unwrap().is_none());

        assert_eq!(buffer.read_from(&mut &raw[14..]).unwrap(), 18);
        {
            let packet = buffer.as_ipv4_packet().unwrap().unwrap();
            assert!(packet.is_valid());
            assert_eq!(packet.length(), 32);
            assert_eq!(packet.ipv4_header().header_length(), 20);
            assert_eq!(packet.ipv4_header().total_length(), 32);
            assert_eq!(packet.protocol(), Some(Protocol::Udp));
        }
        buffer.consume_packet();
        assert!(buffer.is_empty());
        assert!(buffer.as_ipv4_packet().unwrap().is_none());
    }

    #[rstest]
    #[case::one_read(vec![64])]
    #[case::split_inside_second(vec![40, 24])]
    #[case::split_inside_length_field(vec![2, 60, 2])]
    #[case::byte_by_byte(vec![1; 64])]
    fn test_back_to_back(#[case] chunks: Vec<usize>) {
        let mut stream = udp_32_bytes();
        let mut second = udp_packet(REMOTE, DEVICE, &[5, 6, 7, 8]);
        stream.append(&mut second);

        let mut buffer = Ipv4PacketBuffer::new();
        let mut offs = 0;
        let mut sources = Vec::new();
        for chunk in chunks {
            buffer.read_from(&mut &stream[offs..offs + chunk]).unwrap();
            offs += chunk;
            while let Some(packet) = buffer.as_ipv4_packet().unwrap() {
                sources.push(packet.ipv4_header().source());
                buffer.consume_packet();
            }
        }
        assert_eq!(sources, vec![u32::from(*DEVICE.ip()), u32::from(*REMOTE.ip())]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_unsupported_packet_is_framed() {
        let mut raw = udp_32_bytes();
        raw[0] = 0x65;
        let mut buffer = Ipv4PacketBuffer::new();
        buffer.read_from(&mut raw.as_slice()).unwrap();
        let packet = buffer.as_ipv4_packet().unwrap().unwrap();
        assert!(!packet.is_valid());
        assert_eq!(packet.length(), 32);
    }

    #[test]
    fn test_corrupt_length() {
        let mut buffer = Ipv4PacketBuffer::new();
        buffer.read_from(&mut [0x45u8, 0, 0, 4].as_slice()).unwrap();
        assert_eq!(buffer.as_ipv4_packet().err().map(|e| e.kind()), Some(ErrorKind::InvalidData));
    }

    #[test]
    fn test_eof() {
        let mut buffer = Ipv4PacketBuffer::new();
        assert_eq!(buffer.read_from(&mut io::empty()).unwrap(), 0);
    }
}
