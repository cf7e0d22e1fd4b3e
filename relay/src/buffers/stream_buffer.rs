use std::io;
use std::io::Write;

/// Circular byte buffer for the device-to-network direction of a TCP flow. It holds an
///  unstructured byte stream: writes to the socket may split or coalesce what the device sent.
///
/// One slot is always left empty so that `head == tail` unambiguously means 'empty'.
pub struct StreamBuffer {
    data: Box<[u8]>,
    head: usize,
    tail: usize,
}

impl StreamBuffer {
    pub fn new(capacity: usize) -> StreamBuffer {
        StreamBuffer {
            data: vec![0; capacity + 1].into_boxed_slice(),
            head: 0,
            tail: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len() - 1
    }

    pub fn len(&self) -> usize {
        if self.head >= self.tail {
            self.head - self.tail
        }
        else {
            self.head + self.data.len() - self.tail
        }
    }

    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    pub fn remaining(&self) -> usize {
        self.capacity() - self.len()
    }

    /// Appends as much of `source` as fits and returns the number of bytes taken
    pub fn read_from(&mut self, source: &[u8]) -> usize {
        let n = source.len().min(self.remaining());
        let first = n.min(self.data.len() - self.head);
        self.data[self.head..self.head + first].copy_from_slice(&source[..first]);
        self.data[..n - first].copy_from_slice(&source[first..n]);
        self.head = (self.head + n) % self.data.len();
        n
    }

    /// Does one write of the buffered bytes that are contiguous in memory, i.e. up to the
    ///  physical end of the buffer if the content wraps around. Callers drain the buffer by
    ///  calling this until it is empty or the sink stops accepting bytes.
    pub fn write_to<W: Write>(&mut self, sink: &mut W) -> io::Result<usize> {
        if self.is_empty() {
            return Ok(0);
        }
        let end = if self.head > self.tail { self.head } else { self.data.len() };
        let n = sink.write(&self.data[self.tail..end])?;
        self.tail = (self.tail + n) % self.data.len();
        Ok(n)
    }
}
