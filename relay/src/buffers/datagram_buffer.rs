use std::io;

use crate::util::safe_converter::{PrecheckedCast, SafeCast};

const LENGTH_PREFIX: usize = 2;

/// largest datagram the 16-bit length prefix can describe
pub const MAX_DATAGRAM_LENGTH: usize = u16::MAX as usize;

/// Circular buffer of UDP datagrams for the device-to-network direction. Every datagram is
///  stored contiguously behind a 2-byte big-endian length and comes out exactly as it went in.
///
/// The circular part has room for `capacity + 1` bytes. Records always start inside it, and
///  the headroom behind it holds the tail end of a record that started near its end, so records
///  never need to be split:
///
/// ```ascii
///   |<------- circular part -------->|<- headroom ->|
///   +--------------------------------+--------------+
///   |[D4]      [ D1 ][  D2  ][  D3  ]|   ]          |
///   +--------------------------------+--------------+
///        ^     ^
///       head  tail
/// ```
pub struct DatagramBuffer {
    data: Box<[u8]>,
    circular_len: usize,
    head: usize,
    tail: usize,
    count: usize,
}

impl DatagramBuffer {
    pub fn new(capacity: usize) -> DatagramBuffer {
        let circular_len = capacity + 1;
        DatagramBuffer {
            data: vec![0; circular_len + LENGTH_PREFIX + MAX_DATAGRAM_LENGTH].into_boxed_slice(),
            circular_len,
            head: 0,
            tail: 0,
            count: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// number of stored datagrams
    pub fn len(&self) -> usize {
        self.count
    }

    /// When `head` is at or before `tail`, new records go into the gap between them. Otherwise
    ///  there is at least the headroom after `head`.
    fn is_wrapped(&self) -> bool {
        self.count > 0 && self.head <= self.tail
    }

    pub fn has_enough_space_for(&self, datagram_length: usize) -> bool {
        if datagram_length > MAX_DATAGRAM_LENGTH {
            return false;
        }
        if !self.is_wrapped() {
            return true;
        }
        self.head + LENGTH_PREFIX + datagram_length <= self.tail
    }

    /// Stores `datagram`, returning false if it had to be dropped for lack of space
    pub fn read_from(&mut self, datagram: &[u8]) -> bool {
        if !self.has_enough_space_for(datagram.len()) {
            return false;
        }
        let len: u16 = datagram.len().prechecked_cast();
        let start = self.head + LENGTH_PREFIX;
        self.data[self.head..start].copy_from_slice(&len.to_be_bytes());
        self.data[start..start + datagram.len()].copy_from_slice(datagram);

        self.head = start + datagram.len();
        if self.head >= self.circular_len {
            self.head = 0;
        }
        self.count += 1;
        true
    }

    /// Passes the oldest datagram to `send`, and removes it if `send` succeeds. Returns false if
    ///  the buffer was empty.
    pub fn write_to<F>(&mut self, send: F) -> io::Result<bool>
    where F: FnOnce(&[u8]) -> io::Result<usize>
    {
        if self.is_empty() {
            return Ok(false);
        }
        let len: usize = u16::from_be_bytes([self.data[self.tail], self.data[self.tail + 1]]).safe_cast();
        let start = self.tail + LENGTH_PREFIX;

        // a datagram socket sends the whole datagram or nothing
        send(&self.data[start..start + len])?;

        self.tail = start + len;
        if self.tail >= self.circular_len {
            self.tail = 0;
        }
        self.count -= 1;
        if self.count == 0 {
            self.head = 0;
            self.tail = 0;
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn drain(buffer: &mut DatagramBuffer) -> Vec<Vec<u8>> {
        let mut result = Vec::new();
        while buffer.write_to(|d| { result.push(d.to_vec()); Ok(d.len()) }).unwrap() {}
        result
    }

    #[test]
    fn test_boundaries_preserved() {
        let datagrams = vec![
            vec![1, 2, 3, 4, 5],
            vec![],
            vec![6, 7, 8],
            vec![9, 10, 11, 12],
        ];
        let mut buffer = DatagramBuffer::new(32);
        for d in &datagrams {
            assert!(buffer.read_from(d));
        }
        assert_eq!(buffer.len(), 4);
        assert_eq!(drain(&mut buffer), datagrams);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_wrap_into_headroom() {
        let mut buffer = DatagramBuffer::new(10);
        assert!(buffer.read_from(&[1; 6]));
        // starts inside the circular part, ends in the headroom
        assert!(buffer.read_from(&[2; 6]));
        assert!(!buffer.has_enough_space_for(0));
        assert!(!buffer.read_from(&[3; 6]));

        let mut first = Vec::new();
        assert!(buffer.write_to(|d| { first = d.to_vec(); Ok(d.len()) }).unwrap());
        assert_eq!(first, vec![1; 6]);

        assert!(buffer.has_enough_space_for(6));
        assert!(!buffer.has_enough_space_for(7));
        assert!(buffer.read_from(&[3; 6]));

        assert_eq!(drain(&mut buffer), vec![vec![2; 6], vec![3; 6]]);
    }

    #[test]
    fn test_failed_send_keeps_datagram() {
        let mut buffer = DatagramBuffer::new(16);
        buffer.read_from(&[1, 2, 3]);
        assert!(buffer.write_to(|_| Err(io::ErrorKind::WouldBlock.into())).is_err());
        assert_eq!(buffer.len(), 1);
        assert_eq!(drain(&mut buffer), vec![vec![1, 2, 3]]);
    }

    #[rstest]
    #[case::empty_accepts_max(0, MAX_DATAGRAM_LENGTH, true)]
    #[case::too_large(0, MAX_DATAGRAM_LENGTH + 1, false)]
    #[case::not_wrapped_uses_headroom(1, 1000, true)]
    fn test_has_enough_space_for(#[case] stored: usize, #[case] len: usize, #[case] expected: bool) {
        let mut buffer = DatagramBuffer::new(100);
        for _ in 0..stored {
            buffer.read_from(&[0; 10]);
        }
        assert_eq!(buffer.has_enough_space_for(len), expected);
    }

    #[test]
    fn test_interleaved_use_never_corrupts() {
        let mut buffer = DatagramBuffer::new(50);
        let mut expected = std::collections::VecDeque::new();
        let mut next = 0u8;
        for round in 0..200usize {
            let len = (round * 7) % 23;
            let datagram = vec![next; len];
            if buffer.read_from(&datagram) {
                expected.push_back(datagram);
                next = next.wrapping_add(1);
            }
            if round % 3 == 0 {
                let mut got = None;
                if buffer.write_to(|d| { got = Some(d.to_vec()); Ok(d.len()) }).unwrap() {
                    assert_eq!(got, expected.pop_front());
                }
            }
        }
        let rest: Vec<Vec<u8>> = expected.into_iter().collect();
        assert_eq!(drain(&mut buffer), rest);
    }
}
