//! A host-side relay for IP tunnels: devices forward the raw IPv4 packets of their virtual
//!  network interface through a TCP connection to the relay, which terminates every TCP and UDP
//!  flow on a real socket of the host and synthesizes the IP packets going back.
//!
//! ## Architecture
//!
//! Everything runs on a single thread around a [mio] poller ([relay::Relay]):
//!
//! ```ascii
//!  device --tcp--> Client --packets--> Router --> TcpConnection --> real TCP socket
//!                    ^                        \-> UdpConnection --> real UDP socket
//!                    |                                 |
//!                    +------ PacketSink <--------------+  (synthesized IPv4 packets)
//! ```
//!
//! * A [client::Client] is one tunnel session. It recovers packet boundaries from the byte
//!    stream and buffers everything going back to the device.
//! * The [router::Router] maps each packet's [connection::FlowKey] to a connection, opening a
//!    connection on a flow's first packet.
//! * [connection::tcp::TcpConnection] plays the server side of the device's TCP connection,
//!    just enough of it for the device's own stack to do the rest.
//!    [connection::udp::UdpConnection] relays datagrams 1:1 and expires when idle.
//! * The [packetizer::Packetizer] turns data read from a real socket into IPv4 packets for the
//!    device.
//!
//! When the outbound buffer of a session is full, a connection registers itself as 'pending'
//!  and stops reading from its socket until the session pulls it. Back pressure towards the
//!  device's TCP stack is exerted through the advertised window.

pub mod buffers;
pub mod client;
pub mod config;
pub mod connection;
pub mod packet;
pub mod packetizer;
pub mod relay;
pub mod router;
pub mod selector;
pub mod util;

#[cfg(test)]
mod test_util;

#[cfg(test)]
mod test {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(Level::TRACE)
            .try_init()
            .ok();
    }
}
