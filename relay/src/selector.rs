//! The reactor's registration table: readiness events come back from the poller carrying only a
//!  token, and the table maps that token to the component that handles it.

use std::io;
use std::io::ErrorKind;
use std::time::Duration;

use mio::event::{Event, Source};
use mio::{Events, Interest, Poll, Token};
use rustc_hash::FxHashMap;
use tracing::{debug, trace};

use crate::connection::FlowKey;

/// identifies a tunnel session within the relay
pub type ClientId = u32;

/// Who handles readiness events for a token
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum EventHandler {
    Listener,
    Client(ClientId),
    Connection(ClientId, FlowKey),
}

/// The subset of a poller event the handlers care about. Read-closed and error conditions are
///  folded into 'readable' so that handlers discover them through their next read.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
    pub error: bool,
}

impl Readiness {
    pub const READABLE: Readiness = Readiness { readable: true, writable: false, error: false };
    pub const WRITABLE: Readiness = Readiness { readable: false, writable: true, error: false };
}

impl From<&Event> for Readiness {
    fn from(event: &Event) -> Self {
        Readiness {
            readable: event.is_readable() || event.is_read_closed() || event.is_error(),
            writable: event.is_writable() || event.is_write_closed(),
            error: event.is_error(),
        }
    }
}

pub struct Selector {
    poll: Poll,
    handlers: FxHashMap<Token, EventHandler>,
    next_token: usize,
}

impl Selector {
    pub fn new() -> io::Result<Selector> {
        Ok(Selector {
            poll: Poll::new()?,
            handlers: FxHashMap::default(),
            next_token: 0,
        })
    }

    /// Tokens are never reused, so a stale event for a closed socket can not reach a newer one
    fn allocate(&mut self, handler: EventHandler) -> Token {
        let token = Token(self.next_token);
        self.next_token += 1;
        self.handlers.insert(token, handler);
        token
    }

    pub fn handler(&self, token: Token) -> Option<EventHandler> {
        self.handlers.get(&token).copied()
    }

    pub fn num_registrations(&self) -> usize {
        self.handlers.len()
    }

    /// Waits for readiness events, or until `timeout` has passed. An interrupted wait returns
    ///  normally with no events.
    pub fn select(&mut self, events: &mut Events, timeout: Option<Duration>) -> io::Result<()> {
        match self.poll.poll(events, timeout) {
            Err(e) if e.kind() == ErrorKind::Interrupted => {
                events.clear();
                Ok(())
            }
            other => other,
        }
    }
}

/// One socket's entry in the [Selector]: its token, and the interest currently registered with
///  the poller. The poller does not accept an empty interest, so a socket that currently wants
///  nothing is deregistered and registered again once it does.
#[derive(Debug)]
pub struct Registration {
    token: Token,
    interest: Option<Interest>,
}

impl Registration {
    pub fn new<S: Source + ?Sized>(selector: &mut Selector, source: &mut S, interest: Option<Interest>, handler: EventHandler) -> io::Result<Registration> {
        let token = selector.allocate(handler);
        let mut result = Registration { token, interest: None };
        if let Err(e) = result.update(selector, source, interest) {
            selector.handlers.remove(&token);
            return Err(e);
        }
        Ok(result)
    }

    pub fn token(&self) -> Token {
        self.token
    }

    pub fn interest(&self) -> Option<Interest> {
        self.interest
    }

    pub fn update<S: Source + ?Sized>(&mut self, selector: &Selector, source: &mut S, interest: Option<Interest>) -> io::Result<()> {
        if self.interest == interest {
            return Ok(());
        }
        trace!("{:?}: interest {:?} -> {:?}", self.token, self.interest, interest);

        let registry = selector.poll.registry();
        match (self.interest, interest) {
            (None, Some(interest)) => registry.register(source, self.token, interest)?,
            (Some(_), Some(interest)) => registry.reregister(source, self.token, interest)?,
            (Some(_), None) => registry.deregister(source)?,
            (None, None) => {}
        }
        self.interest = interest;
        Ok(())
    }

    /// Removes the socket from the poller and its handler from the table
    pub fn cancel<S: Source + ?Sized>(&mut self, selector: &mut Selector, source: &mut S) {
        if let Err(e) = self.update(selector, source, None) {
            debug!("{:?}: error deregistering: {}", self.token, e);
        }
        selector.handlers.remove(&self.token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mio::net::UdpSocket;
    use std::time::Instant;

    fn bound_socket() -> UdpSocket {
        UdpSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap()
    }

    #[test]
    fn test_dispatch_to_handler() {
        let mut selector = Selector::new().unwrap();
        let mut socket = bound_socket();
        let registration = Registration::new(&mut selector, &mut socket, Some(Interest::READABLE), EventHandler::Client(7)).unwrap();

        let sender = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        sender.send_to(b"ping", socket.local_addr().unwrap()).unwrap();

        let mut events = Events::with_capacity(16);
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut handlers = Vec::new();
        while handlers.is_empty() && Instant::now() < deadline {
            selector.select(&mut events, Some(Duration::from_millis(100))).unwrap();
            for event in events.iter() {
                assert_eq!(event.token(), registration.token());
                assert!(Readiness::from(event).readable);
                handlers.push(selector.handler(event.token()));
            }
        }
        assert_eq!(handlers, vec![Some(EventHandler::Client(7))]);
    }

    #[test]
    fn test_tokens_are_unique() {
        let mut selector = Selector::new().unwrap();
        let mut a = bound_socket();
        let mut b = bound_socket();
        let ra = Registration::new(&mut selector, &mut a, Some(Interest::READABLE), EventHandler::Client(1)).unwrap();
        let rb = Registration::new(&mut selector, &mut b, None, EventHandler::Client(2)).unwrap();
        assert_ne!(ra.token(), rb.token());
        assert_eq!(selector.num_registrations(), 2);
    }

    #[test]
    fn test_interest_transitions() {
        let mut selector = Selector::new().unwrap();
        let mut socket = bound_socket();
        let mut registration = Registration::new(&mut selector, &mut socket, None, EventHandler::Listener).unwrap();
        assert_eq!(registration.interest(), None);

        registration.update(&selector, &mut socket, Some(Interest::READABLE)).unwrap();
        assert_eq!(registration.interest(), Some(Interest::READABLE));
        registration.update(&selector, &mut socket, Some(Interest::READABLE | Interest::WRITABLE)).unwrap();
        registration.update(&selector, &mut socket, None).unwrap();
        assert_eq!(registration.interest(), None);
        registration.update(&selector, &mut socket, Some(Interest::WRITABLE)).unwrap();

        registration.cancel(&mut selector, &mut socket);
        assert_eq!(registration.interest(), None);
        assert_eq!(selector.handler(registration.token()), None);
        assert_eq!(selector.num_registrations(), 0);
    }
}
