//! The request (client) end of a request/reply channel.

use std::net::TcpStream as StdTcpStream;
use std::time::{Duration, Instant};

use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token};
use tracing::trace;

use crate::conn::Conn;
use crate::endpoint::Endpoint;
use crate::error::{NetError, NetResult};
use crate::framing::Message;
use crate::reactor::Reactor;

/// A socket that connects to one [`RepSocket`](crate::RepSocket) peer and
/// exchanges request/reply message pairs with it.
///
/// Unlike a classic lockstep REQ socket this one is dealer-ended: `send`
/// and `recv` may be called in any order, so a retried request after a
/// timeout does not error.
///
/// The socket has two modes. In *reactor mode* ([`ReqSocket::register`])
/// the owner installs a readiness handler and consumes replies with
/// [`ReqSocket::try_recv`]. In *blocking mode* (no registration) the owner
/// calls [`ReqSocket::recv_timeout`], which polls the socket privately.
pub struct ReqSocket {
    conn: Conn,
    peer: Endpoint,
    token: Option<Token>,
    /// Lazily created poll for blocking-mode receives.
    blocking_poll: Option<Poll>,
    open: bool,
}

impl ReqSocket {
    /// Connects to a peer endpoint.
    ///
    /// The TCP connect itself is bounded by `connect_timeout` when given.
    pub fn connect(peer: &Endpoint, connect_timeout: Option<Duration>) -> NetResult<Self> {
        let addr = peer.socket_addr()?;
        let stream = match connect_timeout {
            Some(t) => StdTcpStream::connect_timeout(&addr, t)?,
            None => StdTcpStream::connect(addr)?,
        };
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;
        let stream = TcpStream::from_std(stream);
        trace!(peer = %peer, "request socket connected");
        Ok(Self {
            conn: Conn::new(Token(0), stream),
            peer: peer.clone(),
            token: None,
            blocking_poll: None,
            open: true,
        })
    }

    /// The endpoint this socket is connected to.
    pub fn peer(&self) -> &Endpoint {
        &self.peer
    }

    /// Registers the socket with a reactor. The owner must install a
    /// handler for the returned token with [`Reactor::set_handler`].
    pub fn register(&mut self, reactor: &mut Reactor) -> NetResult<Token> {
        let token = reactor.alloc_token();
        reactor.registry().register(
            &mut self.conn.stream,
            token,
            Interest::READABLE | Interest::WRITABLE,
        )?;
        self.token = Some(token);
        self.conn.token = token;
        Ok(token)
    }

    /// Deregisters the socket from a reactor and drops its handler.
    pub fn deregister(&mut self, reactor: &mut Reactor) -> NetResult<()> {
        if let Some(token) = self.token.take() {
            reactor.remove_socket(&mut self.conn.stream, token)?;
        }
        Ok(())
    }

    /// Sends a request (or anything else; ordering is the caller's
    /// concern).
    pub fn send(&mut self, message: &Message) -> NetResult<()> {
        if !self.open {
            return Err(NetError::ConnectionClosed);
        }
        self.conn.send(message)
    }

    /// Processes readiness: flushes pending writes and reads available
    /// replies. Returns `Ok(false)` once the peer has closed.
    pub fn handle_ready(&mut self) -> NetResult<bool> {
        if !self.open {
            return Ok(false);
        }
        self.conn.flush()?;
        if !self.conn.read_ready()? {
            self.open = false;
        }
        Ok(self.open)
    }

    /// Pops the next fully received reply, if any.
    pub fn try_recv(&mut self) -> Option<Message> {
        self.conn.try_recv()
    }

    /// Blocking receive with a deadline, for sockets not registered with a
    /// reactor.
    ///
    /// Returns `Ok(None)` if the deadline passes without a complete
    /// message.
    pub fn recv_timeout(&mut self, timeout: Duration) -> NetResult<Option<Message>> {
        assert!(
            self.token.is_none(),
            "recv_timeout is for sockets not registered with a reactor"
        );
        if let Some(message) = self.conn.try_recv() {
            return Ok(Some(message));
        }

        const BLOCKING_TOKEN: Token = Token(0);
        if self.blocking_poll.is_none() {
            let poll = Poll::new()?;
            poll.registry().register(
                &mut self.conn.stream,
                BLOCKING_TOKEN,
                Interest::READABLE | Interest::WRITABLE,
            )?;
            self.blocking_poll = Some(poll);
        }

        let deadline = Instant::now() + timeout;
        let mut events = Events::with_capacity(8);
        loop {
            if let Some(message) = self.conn.try_recv() {
                return Ok(Some(message));
            }
            if !self.open {
                return Err(NetError::ConnectionClosed);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            let poll = self.blocking_poll.as_mut().expect("poll created above");
            match poll.poll(&mut events, Some(remaining)) {
                Ok(()) => {}
                Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
            self.conn.flush()?;
            if !self.conn.read_ready()? {
                self.open = false;
            }
        }
    }

    /// True until the peer closes the connection.
    pub fn is_open(&self) -> bool {
        self.open
    }
}
