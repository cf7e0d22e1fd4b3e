use std::io;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use mio::net::TcpListener;
use mio::{Events, Interest, Token};
use rustc_hash::FxHashMap;
use socket2::{Domain, Socket, Type};
use tracing::{debug, error, info, trace, warn};

use crate::client::Client;
use crate::config::RelayConfig;
use crate::selector::{ClientId, EventHandler, Readiness, Registration, Selector};

const LISTEN_BACKLOG: i32 = 128;

/// The reactor: a single thread that accepts tunnel sessions on the loopback listener and
///  dispatches readiness events of all sockets to the sessions and their connections.
///
/// Expired connections are swept every [RelayConfig::cleanup_interval]. The sweep is driven
///  by the poll timeout, there is no timer thread.
pub struct Relay {
    config: Arc<RelayConfig>,
    selector: Selector,
    listener: TcpListener,
    _listener_registration: Registration,
    events: Events,
    clients: FxHashMap<ClientId, Client>,
    next_client_id: ClientId,
    next_cleanup: Instant,
}

impl Relay {
    pub fn bind(config: Arc<RelayConfig>) -> anyhow::Result<Relay> {
        config.validate()?;

        let addr = config.bind_addr();
        let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(socket2::Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())
            .with_context(|| format!("cannot bind to {}", addr))?;
        socket.listen(LISTEN_BACKLOG)?;
        socket.set_nonblocking(true)?;
        let mut listener = TcpListener::from_std(socket.into());

        let mut selector = Selector::new()?;
        let listener_registration = Registration::new(&mut selector, &mut listener, Some(Interest::READABLE), EventHandler::Listener)?;

        Ok(Relay {
            next_cleanup: Instant::now() + config.cleanup_interval,
            config,
            selector,
            listener,
            _listener_registration: listener_registration,
            events: Events::with_capacity(1024),
            clients: FxHashMap::default(),
            next_client_id: 1,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Runs until polling fails
    pub fn run(&mut self) -> anyhow::Result<()> {
        info!("relay listening on {}", self.local_addr()?);
        loop {
            self.run_once(None)?;
        }
    }

    /// Waits for events at most `max_wait` (or until the next cleanup is due) and handles them
    pub fn run_once(&mut self, max_wait: Option<Duration>) -> anyhow::Result<()> {
        let until_cleanup = self.next_cleanup.saturating_duration_since(Instant::now());
        let timeout = max_wait.map_or(until_cleanup, |max_wait| max_wait.min(until_cleanup));

        if let Err(e) = self.selector.select(&mut self.events, Some(timeout)) {
            error!("polling failed: {}", e);
            return Err(e).context("polling failed");
        }

        let ready: Vec<(Token, Readiness)> = self.events.iter()
            .map(|event| (event.token(), Readiness::from(event)))
            .collect();
        for (token, readiness) in ready {
            self.dispatch(token, readiness);
        }

        let now = Instant::now();
        if now >= self.next_cleanup {
            self.cleanup_expired(now);
            self.next_cleanup = now + self.config.cleanup_interval;
        }
        Ok(())
    }

    fn dispatch(&mut self, token: Token, readiness: Readiness) {
        let client_id = match self.selector.handler(token) {
            None => {
                trace!("{:?}: event for a closed socket", token);
                return;
            }
            Some(EventHandler::Listener) => {
                self.accept();
                return;
            }
            Some(EventHandler::Client(client_id)) => {
                if let Some(client) = self.clients.get_mut(&client_id) {
                    client.on_ready(&mut self.selector, readiness);
                }
                client_id
            }
            Some(EventHandler::Connection(client_id, key)) => {
                if let Some(client) = self.clients.get_mut(&client_id) {
                    client.on_connection_ready(&mut self.selector, key, readiness);
                }
                client_id
            }
        };

        if self.clients.get(&client_id).is_some_and(|c| c.is_closed()) {
            self.clients.remove(&client_id);
            debug!("session {}: removed, {} sessions remaining", client_id, self.clients.len());
        }
    }

    fn accept(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!("cannot set TCP_NODELAY for {}: {}", peer, e);
                    }
                    let id = self.next_client_id;
                    self.next_client_id += 1;
                    debug!("session {}: accepted from {}", id, peer);
                    match Client::new(&mut self.selector, id, stream, self.config.clone()) {
                        Ok(client) => {
                            self.clients.insert(id, client);
                        }
                        Err(e) => warn!("session {}: cannot register: {}", id, e),
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => {
                    error!("accept failed: {}", e);
                    break;
                }
            }
        }
    }

    fn cleanup_expired(&mut self, now: Instant) {
        trace!("sweeping {} sessions for expired connections", self.clients.len());
        for client in self.clients.values_mut() {
            client.cleanup_expired(&mut self.selector, now);
        }
    }
}
