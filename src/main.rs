use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use clap_derive::Parser;
use relay::config::{RelayConfig, DEFAULT_PORT};
use relay::relay::Relay;
use tracing::{error, info, Level};

/// Relays the IP traffic of tunnelled devices through the sockets of this host
#[derive(Parser)]
struct Args {
    /// TCP port on 127.0.0.1 that accepts tunnel connections
    #[clap(long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Seconds between sweeps for expired connections
    #[clap(long, default_value_t = 60)]
    cleanup_interval: u64,

    /// Seconds without traffic after which a UDP connection is closed
    #[clap(long, default_value_t = 120)]
    udp_idle_timeout: u64,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,

    #[clap(long, default_value_t = false)]
    very_verbose: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match (args.verbose, args.very_verbose) {
        (_, true) => Level::TRACE,
        (true, _) => Level::DEBUG,
        (false, false) => Level::INFO,
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .try_init()
        .ok();

    let config = RelayConfig {
        port: args.port,
        cleanup_interval: Duration::from_secs(args.cleanup_interval),
        udp_idle_timeout: Duration::from_secs(args.udp_idle_timeout),
        ..RelayConfig::default_loopback()
    };
    info!("starting relay: {:?}", config);

    let result = Relay::bind(Arc::new(config))
        .and_then(|mut relay| relay.run());
    if let Err(e) = &result {
        error!("relay stopped: {:#}", e);
    }
    result
}
