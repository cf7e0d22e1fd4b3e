//! Internet checksum (RFC 1071) as used by the IPv4 header and the TCP pseudo-header.

/// Adds `data` to a running one's-complement sum as a sequence of big-endian 16-bit words. An
///  odd trailing byte is treated as the high byte of a final word padded with zero.
pub fn sum_words(mut sum: u32, data: &[u8]) -> u32 {
    let mut chunks = data.chunks_exact(2);
    for word in &mut chunks {
        sum += u16::from_be_bytes([word[0], word[1]]) as u32;
    }
    if let [last] = chunks.remainder() {
        sum += (*last as u32) << 8;
    }
    sum
}

/// Folds carries back into the low 16 bits until none remain, and returns the complement.
pub fn finish(mut sum: u32) -> u16 {
    while (sum >> 16) != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

/// Checksum of an IPv4 header, skipping the checksum field itself (bytes 10..12) so it need
///  not be zeroed first.
pub fn ipv4_header_checksum(header: &[u8]) -> u16 {
    let sum = sum_words(0, &header[..10]);
    finish(sum_words(sum, &header[12..]))
}

/// Sum of the 12-byte pseudo-header that TCP and UDP checksums cover in addition to the segment
pub fn pseudo_header_sum(source: u32, destination: u32, protocol: u8, segment_length: u16) -> u32 {
    let mut sum = 0;
    sum += source >> 16;
    sum += source & 0xffff;
    sum += destination >> 16;
    sum += destination & 0xffff;
    sum += protocol as u32;
    sum += segment_length as u32;
    sum
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::udp_header_without_ttl(
        vec![0x45, 0x00, 0x00, 0x20, 0x00, 0x00, 0x00, 0x00, 0x00, 0x11, 0x00, 0x00, 0x12, 0x34, 0x56, 0x78, 0x42, 0x42, 0x42, 0x42],
        0xcd9d)]
    #[case::textbook_header(
        vec![0x45, 0x00, 0x00, 0x73, 0x00, 0x00, 0x40, 0x00, 0x40, 0x11, 0x00, 0x00, 0xc0, 0xa8, 0x00, 0x01, 0xc0, 0xa8, 0x00, 0xc7],
        0xb861)]
    #[case::checksum_field_is_ignored(
        vec![0x45, 0x00, 0x00, 0x73, 0x00, 0x00, 0x40, 0x00, 0x40, 0x11, 0xb8, 0x61, 0xc0, 0xa8, 0x00, 0x01, 0xc0, 0xa8, 0x00, 0xc7],
        0xb861)]
    fn test_ipv4_header_checksum(#[case] header: Vec<u8>, #[case] expected: u16) {
        assert_eq!(ipv4_header_checksum(&header), expected);
    }

    #[rstest]
    #[case::empty(vec![], 0)]
    #[case::even(vec![0x12, 0x34, 0x56, 0x78], 0x68ac)]
    #[case::odd_pads_low_byte(vec![0x12, 0x34, 0x56], 0x1234 + 0x5600)]
    fn test_sum_words(#[case] data: Vec<u8>, #[case] expected: u32) {
        assert_eq!(sum_words(0, &data), expected);
    }

    #[rstest]
    #[case::no_carry(0x1234, !0x1234)]
    #[case::single_carry(0x1_ffff, !0x0001)]
    #[case::carry_produces_carry(0xffff_ffff, !0xffff)]
    fn test_finish(#[case] sum: u32, #[case] expected: u16) {
        assert_eq!(finish(sum), expected);
    }

    #[test]
    fn test_checksum_verifies_to_zero() {
        let mut header = vec![0x45, 0x00, 0x00, 0x73, 0x00, 0x00, 0x40, 0x00, 0x40, 0x11, 0x00, 0x00, 0xc0, 0xa8, 0x00, 0x01, 0xc0, 0xa8, 0x00, 0xc7];
        let checksum = ipv4_header_checksum(&header);
        header[10..12].copy_from_slice(&checksum.to_be_bytes());
        assert_eq!(finish(sum_words(0, &header)), 0);
    }
}
