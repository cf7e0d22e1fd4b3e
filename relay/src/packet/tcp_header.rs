use std::fmt::{Debug, Formatter};

use bitflags::bitflags;

use crate::packet::{checksum, Protocol, TCP_MIN_HEADER_LENGTH};

bitflags! {
    /// The nine TCP control bits. NS lives in the low bit of byte 12, the others in byte 13.
    #[derive(Clone, Copy, Eq, PartialEq, Default)]
    pub struct TcpFlags: u16 {
        const FIN = 0x001;
        const SYN = 0x002;
        const RST = 0x004;
        const PSH = 0x008;
        const ACK = 0x010;
        const URG = 0x020;
        const ECE = 0x040;
        const CWR = 0x080;
        const NS  = 0x100;
    }
}

impl Debug for TcpFlags {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let names = [
            (TcpFlags::SYN, "SYN"),
            (TcpFlags::ACK, "ACK"),
            (TcpFlags::FIN, "FIN"),
            (TcpFlags::RST, "RST"),
            (TcpFlags::PSH, "PSH"),
            (TcpFlags::URG, "URG"),
            (TcpFlags::ECE, "ECE"),
            (TcpFlags::CWR, "CWR"),
            (TcpFlags::NS, "NS"),
        ];
        let mut first = true;
        for (flag, name) in names {
            if self.contains(flag) {
                if !first {
                    write!(f, "|")?;
                }
                write!(f, "{}", name)?;
                first = false;
            }
        }
        if first {
            write!(f, "-")?;
        }
        Ok(())
    }
}

/// View of a TCP header. The backing bytes cover the header including options (but not the
///  payload); sequence arithmetic on the fields is modulo 2^32 and left to the caller.
pub struct TcpHeader<T> {
    raw: T,
}

impl<T: AsRef<[u8]>> TcpHeader<T> {
    pub fn new(raw: T) -> TcpHeader<T> {
        debug_assert!(raw.as_ref().len() >= TCP_MIN_HEADER_LENGTH);
        TcpHeader { raw }
    }

    fn bytes(&self) -> &[u8] {
        self.raw.as_ref()
    }

    fn u16_at(&self, offs: usize) -> u16 {
        u16::from_be_bytes([self.bytes()[offs], self.bytes()[offs + 1]])
    }

    fn u32_at(&self, offs: usize) -> u32 {
        let b = self.bytes();
        u32::from_be_bytes([b[offs], b[offs + 1], b[offs + 2], b[offs + 3]])
    }

    pub fn source_port(&self) -> u16 {
        self.u16_at(0)
    }

    pub fn destination_port(&self) -> u16 {
        self.u16_at(2)
    }

    pub fn sequence_number(&self) -> u32 {
        self.u32_at(4)
    }

    pub fn acknowledgement_number(&self) -> u32 {
        self.u32_at(8)
    }

    /// header length in bytes, derived from the data offset field
    pub fn header_length(&self) -> usize {
        ((self.bytes()[12] >> 4) as usize) * 4
    }

    pub fn flags(&self) -> TcpFlags {
        let raw = (((self.bytes()[12] & 1) as u16) << 8) | self.bytes()[13] as u16;
        TcpFlags::from_bits_truncate(raw)
    }

    pub fn window(&self) -> u16 {
        self.u16_at(14)
    }

    pub fn checksum(&self) -> u16 {
        self.u16_at(16)
    }
}

impl<T: AsRef<[u8]> + AsMut<[u8]>> TcpHeader<T> {
    fn bytes_mut(&mut self) -> &mut [u8] {
        self.raw.as_mut()
    }

    pub fn set_source_port(&mut self, port: u16) {
        self.bytes_mut()[0..2].copy_from_slice(&port.to_be_bytes());
    }

    pub fn set_destination_port(&mut self, port: u16) {
        self.bytes_mut()[2..4].copy_from_slice(&port.to_be_bytes());
    }

    pub fn swap_ports(&mut self) {
        let source = self.source_port();
        let destination = self.destination_port();
        self.set_source_port(destination);
        self.set_destination_port(source);
    }

    pub fn set_sequence_number(&mut self, sequence_number: u32) {
        self.bytes_mut()[4..8].copy_from_slice(&sequence_number.to_be_bytes());
    }

    pub fn set_acknowledgement_number(&mut self, acknowledgement_number: u32) {
        self.bytes_mut()[8..12].copy_from_slice(&acknowledgement_number.to_be_bytes());
    }

    pub fn set_flags(&mut self, flags: TcpFlags) {
        let bits = flags.bits();
        let raw = self.bytes_mut();
        raw[12] = (raw[12] & 0xfe) | ((bits >> 8) as u8 & 1);
        raw[13] = bits as u8;
    }

    pub fn set_window(&mut self, window: u16) {
        self.bytes_mut()[14..16].copy_from_slice(&window.to_be_bytes());
    }

    /// Rewrites the data offset to the minimum header length. The option bytes are not touched,
    ///  callers are expected to truncate the backing region to [TCP_MIN_HEADER_LENGTH].
    pub fn strip_options(&mut self) {
        let raw = self.bytes_mut();
        raw[12] = (raw[12] & 0x0f) | (((TCP_MIN_HEADER_LENGTH / 4) as u8) << 4);
    }

    /// Computes the checksum over pseudo-header, this header and `payload`, and writes it
    pub fn update_checksum(&mut self, source: u32, destination: u32, payload: &[u8]) {
        self.bytes_mut()[16..18].copy_from_slice(&[0, 0]);

        let header_length = self.header_length();
        let segment_length = (header_length + payload.len()) as u16;
        let mut sum = checksum::pseudo_header_sum(source, destination, Protocol::Tcp.into(), segment_length);
        sum = checksum::sum_words(sum, &self.bytes()[..header_length]);
        sum = checksum::sum_words(sum, payload);

        let checksum = checksum::finish(sum);
        self.bytes_mut()[16..18].copy_from_slice(&checksum.to_be_bytes());
    }
}

impl<T: AsRef<[u8]>> Debug for TcpHeader<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "TCP {}->{} [{:?}] seq={} ack={} win={}",
               self.source_port(),
               self.destination_port(),
               self.flags(),
               self.sequence_number(),
               self.acknowledgement_number(),
               self.window(),
        )
    }
}
