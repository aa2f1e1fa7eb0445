//! The reply (server) end of a request/reply channel.

use std::collections::{HashMap, VecDeque};
use std::io;

use mio::net::TcpListener;
use mio::{Interest, Token};
use tracing::{trace, warn};

use crate::conn::Conn;
use crate::endpoint::Endpoint;
use crate::error::{NetError, NetResult};
use crate::framing::Message;
use crate::reactor::Reactor;

/// A socket that accepts connections from any number of
/// [`ReqSocket`](crate::ReqSocket) peers and replies to their requests.
///
/// The identity of the last requester is retained so that
/// [`RepSocket::send`] routes the reply back over the right connection.
/// [`RepSocket::ignore`] discards a pending request instead, allowing a
/// fresh receive without sending anything.
///
/// The socket is driven by its owner from reactor callbacks: the owner
/// installs handlers for the listener token and for each connection token
/// returned by [`RepSocket::accept_ready`].
pub struct RepSocket {
    listener: TcpListener,
    bound: Endpoint,
    conns: HashMap<Token, Conn>,
    /// Complete inbound requests, tagged with the connection they came in
    /// on.
    inbox: VecDeque<(Token, Message)>,
    /// The connection owed a reply, if a request has been received and
    /// neither answered nor ignored yet.
    reply_to: Option<Token>,
}

impl RepSocket {
    /// Binds to an endpoint. Port 0 requests an OS-assigned port; the
    /// actual endpoint is available from [`RepSocket::bound_endpoint`].
    pub fn bind(endpoint: &Endpoint) -> NetResult<Self> {
        let listener = TcpListener::bind(endpoint.bind_addr()?)?;
        let actual = listener.local_addr()?;
        let bound = Endpoint::new(endpoint.host(), actual.port());
        trace!(endpoint = %bound, "reply socket bound");
        Ok(Self {
            listener,
            bound,
            conns: HashMap::new(),
            inbox: VecDeque::new(),
            reply_to: None,
        })
    }

    /// The endpoint the socket is actually bound to.
    pub fn bound_endpoint(&self) -> &Endpoint {
        &self.bound
    }

    /// Registers the listener with a reactor; the owner installs a handler
    /// for the returned token which calls [`RepSocket::accept_ready`].
    pub fn register_listener(&mut self, reactor: &mut Reactor) -> NetResult<Token> {
        let token = reactor.alloc_token();
        reactor
            .registry()
            .register(&mut self.listener, token, Interest::READABLE)?;
        Ok(token)
    }

    /// Accepts all pending connections, registering each with the reactor.
    ///
    /// Returns the tokens of the new connections; the owner installs a
    /// handler for each which calls [`RepSocket::conn_ready`].
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
                    trace!(%addr, ?token, "reply socket accepted connection");
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

    /// Processes readiness on one connection: flushes pending replies and
    /// moves complete requests to the inbox. Closed or misbehaving
    /// connections are dropped.
    pub fn conn_ready(&mut self, reactor: &mut Reactor, token: Token) -> NetResult<()> {
        let Some(conn) = self.conns.get_mut(&token) else {
            return Ok(());
        };
        let mut drop_conn = false;
        if let Err(e) = conn.flush() {
            warn!(?token, error = %e, "dropping connection on write error");
            drop_conn = true;
        }
        if !drop_conn {
            match conn.read_ready() {
                Ok(true) => {}
                Ok(false) => drop_conn = true,
                Err(e) => {
                    warn!(?token, error = %e, "dropping connection on read error");
                    drop_conn = true;
                }
            }
        }
        while let Some(message) = self.conns.get_mut(&token).and_then(Conn::try_recv) {
            self.inbox.push_back((token, message));
        }
        if drop_conn {
            self.drop_conn(reactor, token);
        }
        Ok(())
    }

    fn drop_conn(&mut self, reactor: &mut Reactor, token: Token) {
        if let Some(mut conn) = self.conns.remove(&token) {
            let _ = reactor.remove_socket(&mut conn.stream, token);
        }
        reactor.clear_handler(token);
        if self.reply_to == Some(token) {
            self.reply_to = None;
        }
    }

    /// Pops the next request. The sender is remembered until the request
    /// is answered with [`RepSocket::send`] or dropped with
    /// [`RepSocket::ignore`].
    pub fn try_recv(&mut self) -> Option<Message> {
        let (token, message) = self.inbox.pop_front()?;
        self.reply_to = Some(token);
        Some(message)
    }

    /// Sends a reply to the sender of the last received request.
    ///
    /// If that peer has disconnected in the meantime the reply is silently
    /// dropped, as there is nowhere to send it.
    pub fn send(&mut self, message: &Message) -> NetResult<()> {
        let token = self.reply_to.take().ok_or(NetError::NoPendingRequest)?;
        match self.conns.get_mut(&token) {
            Some(conn) => conn.send(message),
            None => {
                warn!(?token, "requester disconnected before reply; dropping it");
                Ok(())
            }
        }
    }

    /// Discards the pending request without replying.
    pub fn ignore(&mut self) {
        self.reply_to = None;
    }

    /// True if a request has been received but not yet answered or
    /// ignored.
    pub fn has_pending_request(&self) -> bool {
        self.reply_to.is_some()
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        self.conns.len()
    }
}
