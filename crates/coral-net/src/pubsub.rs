//! Publish/subscribe sockets.
//!
//! Publishers bind and fan messages out to every joined subscriber.
//! Subscribers connect to any number of publishers and filter messages by
//! binary prefix on the first frame; filtering happens on the receive
//! side, so a subscriber with no filters receives nothing.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::TcpStream as StdTcpStream;
use std::time::{Duration, Instant};

use bytes::Bytes;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use tracing::{trace, warn};

use crate::conn::Conn;
use crate::endpoint::Endpoint;
use crate::error::NetResult;
use crate::framing::Message;
use crate::reactor::Reactor;

/// Per-subscriber cap on buffered outbound bytes. A subscriber that falls
/// this far behind is dropped rather than allowed to stall the publisher.
const MAX_SUBSCRIBER_BACKLOG: usize = 1024 * 1024;

/// The publishing end of a publish/subscribe channel.
///
/// Driven by its owner from reactor callbacks, like
/// [`RepSocket`](crate::RepSocket): the owner installs handlers for the
/// listener token and each connection token from
/// [`PubSocket::accept_ready`].
pub struct PubSocket {
    listener: TcpListener,
    bound: Endpoint,
    conns: HashMap<Token, Conn>,
}

impl PubSocket {
    /// Binds to an endpoint (port 0 requests an OS-assigned port).
    pub fn bind(endpoint: &Endpoint) -> NetResult<Self> {
        let listener = TcpListener::bind(endpoint.bind_addr()?)?;
        let actual = listener.local_addr()?;
        let bound = Endpoint::new(endpoint.host(), actual.port());
        trace!(endpoint = %bound, "publisher bound");
        Ok(Self {
            listener,
            bound,
            conns: HashMap::new(),
        })
    }

    /// The endpoint the socket is actually bound to.
    pub fn bound_endpoint(&self) -> &Endpoint {
        &self.bound
    }

    /// Registers the listener with a reactor; the owner installs a handler
    /// for the returned token which calls [`PubSocket::accept_ready`].
    pub fn register_listener(&mut self, reactor: &mut Reactor) -> NetResult<Token> {
        let token = reactor.alloc_token();
        reactor
            .registry()
            .register(&mut self.listener, token, Interest::READABLE)?;
        Ok(token)
    }

    /// Accepts all pending subscriber connections; returns their tokens so
    /// the owner can install [`PubSocket::conn_ready`] handlers.
    pub fn accept_ready(&mut self, reactor: &mut Reactor) -> NetResult<Vec<Token>> {
        let mut new_tokens = Vec::new();
        loop {
            match self.listener.accept() {
                Ok((stream, addr)) => {
                    stream.set_nodelay(true)?;
                    let mut stream = stream;
                    let token = reactor.alloc_token();
                    reactor.registry().register(
                        &mut stream,
                        token,
                        Interest::READABLE | Interest::WRITABLE,
                    )?;
                    trace!(%addr, ?token, "subscriber joined");
                    self.conns.insert(token, Conn::new(token, stream));
                    new_tokens.push(token);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(new_tokens)
    }

    /// Processes readiness on one subscriber connection: flushes pending
    /// data and detects disconnects. Subscribers never send application
    /// data; anything read is discarded.
    pub fn conn_ready(&mut self, reactor: &mut Reactor, token: Token) {
        let Some(conn) = self.conns.get_mut(&token) else {
            return;
        };
        let gone = conn.flush().is_err() || !conn.read_ready().unwrap_or(false);
        // Discard anything the subscriber may have written.
        while conn.try_recv().is_some() {}
        if gone {
            trace!(?token, "subscriber left");
            self.drop_conn(reactor, token);
        }
    }

    fn drop_conn(&mut self, reactor: &mut Reactor, token: Token) {
        if let Some(mut conn) = self.conns.remove(&token) {
            let _ = reactor.remove_socket(&mut conn.stream, token);
        }
        reactor.clear_handler(token);
    }

    /// Publishes a message to every joined subscriber.
    ///
    /// Subscribers whose connection errors, or whose backlog exceeds the
    /// cap, are dropped.
    pub fn publish(&mut self, reactor: &mut Reactor, message: &Message) {
        let mut dead = Vec::new();
        for (token, conn) in &mut self.conns {
            if conn.send(message).is_err() || conn.pending_write() > MAX_SUBSCRIBER_BACKLOG {
                dead.push(*token);
            }
        }
        for token in dead {
            warn!(?token, "dropping unresponsive subscriber");
            self.drop_conn(reactor, token);
        }
    }

    /// Number of joined subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.conns.len()
    }
}

/// The subscribing end of a publish/subscribe channel.
///
/// This socket owns a private poll rather than joining a reactor: its only
/// consumer is the per-step input barrier, which performs deadline-bounded
/// blocking receives on the slave thread.
pub struct SubSocket {
    poll: Poll,
    conns: HashMap<Token, Conn>,
    peers: HashMap<Endpoint, Token>,
    filters: Vec<Bytes>,
    inbox: VecDeque<Message>,
    next_token: usize,
}

impl SubSocket {
    pub fn new() -> NetResult<Self> {
        Ok(Self {
            poll: Poll::new()?,
            conns: HashMap::new(),
            peers: HashMap::new(),
            filters: Vec::new(),
            inbox: VecDeque::new(),
            next_token: 0,
        })
    }

    /// Connects to a publisher. Connecting to an already-connected
    /// endpoint is a no-op.
    pub fn connect(&mut self, peer: &Endpoint) -> NetResult<()> {
        if self.peers.contains_key(peer) {
            return Ok(());
        }
        let stream = StdTcpStream::connect(peer.socket_addr()?)?;
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;
        let mut stream = TcpStream::from_std(stream);
        let token = Token(self.next_token);
        self.next_token += 1;
        self.poll
            .registry()
            .register(&mut stream, token, Interest::READABLE)?;
        self.conns.insert(token, Conn::new(token, stream));
        self.peers.insert(peer.clone(), token);
        trace!(peer = %peer, "subscribed to publisher");
        Ok(())
    }

    /// Disconnects from a publisher. Messages already received and
    /// buffered are kept; nothing in flight is waited for.
    pub fn disconnect(&mut self, peer: &Endpoint) {
        if let Some(token) = self.peers.remove(peer) {
            if let Some(mut conn) = self.conns.remove(&token) {
                let _ = self.poll.registry().deregister(&mut conn.stream);
            }
            trace!(peer = %peer, "unsubscribed from publisher");
        }
    }

    /// Replaces the set of connected publishers, connecting to new ones
    /// and disconnecting from those no longer listed. Filters are
    /// unaffected. Returns the endpoints that were dropped.
    pub fn set_peers(&mut self, peers: &[Endpoint]) -> NetResult<Vec<Endpoint>> {
        let dropped: Vec<Endpoint> = self
            .peers
            .keys()
            .filter(|known| !peers.contains(known))
            .cloned()
            .collect();
        for peer in &dropped {
            self.disconnect(peer);
        }
        for peer in peers {
            self.connect(peer)?;
        }
        Ok(dropped)
    }

    /// Adds a prefix filter. A message is delivered if its first frame
    /// starts with any registered filter.
    pub fn subscribe(&mut self, prefix: impl Into<Bytes>) {
        let prefix = prefix.into();
        if !self.filters.contains(&prefix) {
            self.filters.push(prefix);
        }
    }

    /// Removes a prefix filter.
    pub fn unsubscribe(&mut self, prefix: &[u8]) {
        self.filters.retain(|f| f != prefix);
    }

    fn matches(&self, message: &Message) -> bool {
        message
            .first()
            .is_some_and(|head| self.filters.iter().any(|f| head.starts_with(f)))
    }

    /// Receives the next matching message, waiting up to `timeout`.
    ///
    /// Returns `Ok(None)` when the deadline passes first. Non-matching
    /// messages are discarded.
    pub fn recv_timeout(&mut self, timeout: Duration) -> NetResult<Option<Message>> {
        let deadline = Instant::now() + timeout;
        let mut events = Events::with_capacity(16);
        loop {
            if let Some(message) = self.inbox.pop_front() {
                return Ok(Some(message));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            events.clear();
            match self.poll.poll(&mut events, Some(remaining)) {
                Ok(()) => {}
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
            let ready: Vec<Token> = events.iter().map(|e| e.token()).collect();
            for token in ready {
                self.drain_conn(token);
            }
        }
    }

    fn drain_conn(&mut self, token: Token) {
        let Some(conn) = self.conns.get_mut(&token) else {
            return;
        };
        let open = conn.read_ready().unwrap_or(false);
        let mut received = Vec::new();
        while let Some(message) = conn.try_recv() {
            received.push(message);
        }
        if !open {
            // The publisher went away; what it already sent remains valid.
            if let Some(mut conn) = self.conns.remove(&token) {
                let _ = self.poll.registry().deregister(&mut conn.stream);
            }
            self.peers.retain(|_, t| *t != token);
        }
        for message in received {
            if self.matches(&message) {
                self.inbox.push_back(message);
            }
        }
    }

    /// The publishers this socket is currently connected to.
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }
}
