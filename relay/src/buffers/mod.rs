//! Byte management for the three data paths: the stream buffer (device to network, TCP), the
//!  datagram buffer (device to network, UDP) and the fixed buffer packets are built in.

pub mod datagram_buffer;
pub mod fixed_buffer;
pub mod stream_buffer;
