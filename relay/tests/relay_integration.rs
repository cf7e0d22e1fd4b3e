use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, SocketAddrV4, TcpListener, TcpStream, UdpSocket};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use bytes::BufMut;
use tracing::Level;

use relay::config::RelayConfig;
use relay::packet::ipv4_packet::Ipv4Packet;
use relay::packet::tcp_header::{TcpFlags, TcpHeader};
use relay::packet::Protocol;
use relay::relay::Relay;

#[ctor::ctor]
fn init_test_logging() {
    tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(Level::DEBUG)
        .try_init()
        .ok();
}

const DEVICE: SocketAddrV4 = SocketAddrV4::new(std::net::Ipv4Addr::new(10, 0, 0, 2), 50000);

fn v4(addr: SocketAddr) -> SocketAddrV4 {
    match addr {
        SocketAddr::V4(addr) => addr,
        SocketAddr::V6(_) => panic!("expected IPv4"),
    }
}

fn ipv4_header(buf: &mut Vec<u8>, protocol: Protocol, destination: SocketAddrV4, total_length: usize) {
    buf.put_u8(0x45);
    buf.put_u8(0);
    buf.put_u16(total_length as u16);
    buf.put_u32(0);
    buf.put_u8(64);
    buf.put_u8(protocol.into());
    buf.put_u16(0);
    buf.put_slice(&DEVICE.ip().octets());
    buf.put_slice(&destination.ip().octets());
}

fn tcp_packet(destination: SocketAddrV4, seq: u32, ack: u32, flags: TcpFlags, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::new();
    ipv4_header(&mut buf, Protocol::Tcp, destination, 40 + payload.len());
    buf.put_u16(DEVICE.port());
    buf.put_u16(destination.port());
    buf.put_u32(seq);
    buf.put_u32(ack);
    buf.put_u8(5 << 4);
    buf.put_u8(0);
    buf.put_u16(0xffff);
    buf.put_u32(0);
    TcpHeader::new(&mut buf[20..]).set_flags(flags);
    buf.put_slice(payload);
    Ipv4Packet::parse(&mut buf).compute_checksums();
    buf
}

fn udp_packet(destination: SocketAddrV4, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::new();
    ipv4_header(&mut buf, Protocol::Udp, destination, 28 + payload.len());
    buf.put_u16(DEVICE.port());
    buf.put_u16(destination.port());
    buf.put_u16(8 + payload.len() as u16);
    buf.put_u16(0);
    buf.put_slice(payload);
    Ipv4Packet::parse(&mut buf).compute_checksums();
    buf
}

/// The device's end of a tunnel session
struct Device {
    stream: TcpStream,
    inbound: Vec<u8>,
}

impl Device {
    fn connect(relay: &Relay) -> Device {
        let stream = TcpStream::connect(relay.local_addr().unwrap()).unwrap();
        stream.set_nonblocking(true).unwrap();
        Device { stream, inbound: Vec::new() }
    }

    fn send(&mut self, packet: &[u8]) {
        self.stream.set_nonblocking(false).unwrap();
        self.stream.write_all(packet).unwrap();
        self.stream.set_nonblocking(true).unwrap();
    }

    /// Runs the relay until a complete packet arrived at the device
    fn next_packet(&mut self, relay: &mut Relay) -> Vec<u8> {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if self.inbound.len() >= 4 {
                let total_length = u16::from_be_bytes([self.inbound[2], self.inbound[3]]) as usize;
                if self.inbound.len() >= total_length {
                    return self.inbound.drain(..total_length).collect();
                }
            }
            assert!(Instant::now() < deadline, "timed out waiting for a packet");

            relay.run_once(Some(Duration::from_millis(10))).unwrap();
            let mut buf = [0u8; 4096];
            match self.stream.read(&mut buf) {
                Ok(0) => panic!("relay closed the session"),
                Ok(n) => self.inbound.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == ErrorKind::WouldBlock => {}
                Err(e) => panic!("{}", e),
            }
        }
    }
}

fn echo_tcp_server() -> SocketAddrV4 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = v4(listener.local_addr().unwrap());
    thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let mut buf = [0u8; 1024];
        loop {
            match stream.read(&mut buf) {
                Ok(0) | Err(_) => return,
                Ok(n) => stream.write_all(&buf[..n]).unwrap(),
            }
        }
    });
    addr
}

fn echo_udp_server() -> SocketAddrV4 {
    let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    let addr = v4(socket.local_addr().unwrap());
    thread::spawn(move || {
        let mut buf = [0u8; 2048];
        let (n, from) = socket.recv_from(&mut buf).unwrap();
        socket.send_to(&buf[..n], from).unwrap();
    });
    addr
}

fn relay() -> Relay {
    let config = RelayConfig { port: 0, ..RelayConfig::default_loopback() };
    Relay::bind(Arc::new(config)).unwrap()
}

#[test]
fn test_tcp_echo_through_relay() {
    let server = echo_tcp_server();
    let mut relay = relay();
    let mut device = Device::connect(&relay);

    device.send(&tcp_packet(server, 1000, 0, TcpFlags::SYN, b""));
    let mut syn_ack = device.next_packet(&mut relay);
    let syn_ack = Ipv4Packet::parse(&mut syn_ack);
    let tcp = syn_ack.tcp_header().unwrap();
    assert_eq!(tcp.flags(), TcpFlags::SYN | TcpFlags::ACK);
    assert_eq!(tcp.acknowledgement_number(), 1001);
    assert_eq!(tcp.source_port(), server.port());
    assert_eq!(tcp.destination_port(), DEVICE.port());
    let relay_seq = tcp.sequence_number().wrapping_add(1);

    device.send(&tcp_packet(server, 1001, relay_seq, TcpFlags::ACK, b""));
    device.send(&tcp_packet(server, 1001, relay_seq, TcpFlags::ACK | TcpFlags::PSH, b"hello relay"));

    let mut acknowledged = false;
    let mut echoed = Vec::new();
    while !acknowledged || echoed.len() < 11 {
        let mut raw = device.next_packet(&mut relay);
        let packet = Ipv4Packet::parse(&mut raw);
        let tcp = packet.tcp_header().unwrap();
        match packet.payload_length() {
            0 => {
                assert_eq!(tcp.flags(), TcpFlags::ACK);
                assert_eq!(tcp.acknowledgement_number(), 1012);
                acknowledged = true;
            }
            n => {
                assert_eq!(tcp.flags(), TcpFlags::ACK | TcpFlags::PSH);
                let expected_seq = relay_seq.wrapping_add(echoed.len() as u32);
                assert_eq!(tcp.sequence_number(), expected_seq);
                echoed.extend_from_slice(packet.payload().unwrap());
                assert_eq!(n, packet.payload().unwrap().len());
            }
        }
    }
    assert_eq!(echoed, b"hello relay");
    assert_eq!(relay.client_count(), 1);
}

#[test]
fn test_udp_echo_through_relay() {
    let server = echo_udp_server();
    let mut relay = relay();
    let mut device = Device::connect(&relay);

    device.send(&udp_packet(server, b"datagram"));
    let mut raw = device.next_packet(&mut relay);
    let packet = Ipv4Packet::parse(&mut raw);

    assert_eq!(packet.protocol(), Some(Protocol::Udp));
    assert_eq!(packet.ipv4_header().source(), u32::from(*server.ip()));
    assert_eq!(packet.ipv4_header().destination(), u32::from(*DEVICE.ip()));
    assert_eq!(packet.payload(), Some(b"datagram".as_slice()));
}

#[test]
fn test_session_ends_with_device() {
    let mut relay = relay();
    let device = Device::connect(&relay);

    let deadline = Instant::now() + Duration::from_secs(5);
    while relay.client_count() == 0 {
        assert!(Instant::now() < deadline, "timed out");
        relay.run_once(Some(Duration::from_millis(10))).unwrap();
    }

    drop(device);
    while relay.client_count() > 0 {
        assert!(Instant::now() < deadline, "timed out");
        relay.run_once(Some(Duration::from_millis(10))).unwrap();
    }
}
