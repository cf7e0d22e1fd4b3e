use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use anyhow::bail;

use crate::packet::{IPV4_MIN_HEADER_LENGTH, MAX_PACKET_LENGTH, TCP_MIN_HEADER_LENGTH};

pub const DEFAULT_PORT: u16 = 31416;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// The TCP port the relay accepts tunnel sessions on. The listener always binds to the
    ///  loopback interface: devices reach it through a port forward, never over the network.
    ///
    /// 0 picks an ephemeral port, which is mostly useful for tests.
    pub port: u16,

    /// How often the relay sweeps all sessions for expired connections. Expiry is only checked
    ///  during a sweep, so a UDP connection can stay open for up to
    ///  `udp_idle_timeout + cleanup_interval`.
    pub cleanup_interval: Duration,

    /// A UDP connection with no traffic in either direction for this long is closed (unless it
    ///  still has datagrams waiting to be written to its socket).
    pub udp_idle_timeout: Duration,

    /// Upper bound for the payload of a single synthesized TCP packet. The device stack sees
    ///  this as the relay's segment size.
    pub max_tcp_payload: usize,

    /// Bytes buffered per TCP connection from the device towards the network. This is also the
    ///  receive window the relay advertises to the device.
    pub tcp_stream_buffer_size: usize,

    /// Bytes buffered per UDP connection from the device towards the network
    pub udp_datagram_buffer_size: usize,

    /// Bytes buffered per tunnel session from all of its connections towards the device
    pub client_buffer_size: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        RelayConfig::default_loopback()
    }
}

impl RelayConfig {
    pub fn default_loopback() -> RelayConfig {
        RelayConfig {
            port: DEFAULT_PORT,
            cleanup_interval: Duration::from_secs(60),
            udp_idle_timeout: Duration::from_secs(120),
            max_tcp_payload: 1400,
            tcp_stream_buffer_size: 4 * MAX_PACKET_LENGTH,
            udp_datagram_buffer_size: 4 * MAX_PACKET_LENGTH,
            client_buffer_size: 16 * MAX_PACKET_LENGTH,
        }
    }

    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, self.port))
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_tcp_payload == 0 {
            bail!("max TCP payload must be positive");
        }
        if self.max_tcp_payload > MAX_PACKET_LENGTH - IPV4_MIN_HEADER_LENGTH - TCP_MIN_HEADER_LENGTH {
            bail!("max TCP payload {} does not fit into a single IPv4 packet", self.max_tcp_payload);
        }
        if self.client_buffer_size < MAX_PACKET_LENGTH {
            bail!("client buffer size must hold at least one maximum-size packet ({} bytes)", MAX_PACKET_LENGTH);
        }
        if self.tcp_stream_buffer_size == 0 {
            bail!("TCP stream buffer size must be positive");
        }
        if self.udp_datagram_buffer_size == 0 {
            bail!("UDP datagram buffer size must be positive");
        }
        if self.cleanup_interval.is_zero() {
            bail!("cleanup interval must be positive");
        }
        Ok(())
    }
}
