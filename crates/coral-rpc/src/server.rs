//! The server side of the request/reply substrate.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use tracing::{debug, trace, warn};

use coral_net::{Endpoint, Message, NetResult, Reactor, RepSocket, Token};

use crate::wire;

/// A handler for one version of one request/reply protocol.
///
/// Handlers run on the server's reactor thread and get the reactor, so
/// they can arm timers, register sockets of their own, or stop the loop.
pub trait ServerProtocolHandler {
    /// Handles a request, returning the reply header and optional body.
    ///
    /// Returning `None` drops the request without a reply; the client
    /// will time out.
    fn handle(
        &mut self,
        reactor: &mut Reactor,
        version: u16,
        header: &[u8],
        body: Option<&[u8]>,
    ) -> Option<(Vec<u8>, Option<Vec<u8>>)>;

    /// Called when a request names this protocol but a version with no
    /// registered handler; only the protocol's highest-version handler is
    /// consulted. This is the hook for version negotiation handshakes.
    /// The default drops the request.
    fn handle_unsupported_version(
        &mut self,
        reactor: &mut Reactor,
        version: u16,
        header: &[u8],
        body: Option<&[u8]>,
    ) -> Option<(Vec<u8>, Option<Vec<u8>>)> {
        let _ = (reactor, version, header, body);
        None
    }
}

struct ServerInner {
    socket: RepSocket,
    handlers: HashMap<(String, u16), Box<dyn ServerProtocolHandler>>,
}

/// A server hosting any number of (protocol, version) handlers on one
/// reply socket.
///
/// Incoming requests are dispatched on the identifier frame. Requests for
/// unknown protocols are dropped; the meta protocol (`"MP"`) is answered
/// by the server itself.
pub struct RrServer {
    inner: Rc<RefCell<ServerInner>>,
}

impl RrServer {
    /// Binds the server and registers it with the reactor.
    pub fn bind(reactor: &mut Reactor, endpoint: &Endpoint) -> NetResult<Self> {
        let socket = RepSocket::bind(endpoint)?;
        let inner = Rc::new(RefCell::new(ServerInner {
            socket,
            handlers: HashMap::new(),
        }));

        let listener_token = inner.borrow_mut().socket.register_listener(reactor)?;
        let on_listener = Rc::clone(&inner);
        reactor.set_handler(listener_token, move |reactor| {
            ServerInner::listener_ready(&on_listener, reactor);
        });

        debug!(endpoint = %inner.borrow().socket.bound_endpoint(), "rpc server bound");
        Ok(Self { inner })
    }

    /// The endpoint the server is bound to.
    pub fn bound_endpoint(&self) -> Endpoint {
        self.inner.borrow().socket.bound_endpoint().clone()
    }

    /// Registers a handler for one version of one protocol.
    pub fn add_protocol_handler(
        &self,
        protocol_id: impl Into<String>,
        version: u16,
        handler: Box<dyn ServerProtocolHandler>,
    ) {
        let protocol_id = protocol_id.into();
        trace!(protocol_id, version, "protocol handler registered");
        self.inner
            .borrow_mut()
            .handlers
            .insert((protocol_id, version), handler);
    }
}

impl ServerInner {
    fn listener_ready(shared: &Rc<RefCell<ServerInner>>, reactor: &mut Reactor) {
        let tokens = match shared.borrow_mut().socket.accept_ready(reactor) {
            Ok(tokens) => tokens,
            Err(e) => {
                warn!(error = %e, "rpc server accept failed");
                return;
            }
        };
        for token in tokens {
            let on_conn = Rc::clone(shared);
            reactor.set_handler(token, move |reactor| {
                ServerInner::conn_ready(&on_conn, reactor, token);
            });
        }
    }

    fn conn_ready(shared: &Rc<RefCell<ServerInner>>, reactor: &mut Reactor, token: Token) {
        if let Err(e) = shared.borrow_mut().socket.conn_ready(reactor, token) {
            warn!(error = %e, "rpc server connection failed");
            return;
        }
        loop {
            let Some(request) = shared.borrow_mut().socket.try_recv() else {
                return;
            };
            Self::dispatch(shared, reactor, &request);
        }
    }

    // Handlers run while the server state is borrowed; they must not call
    // back into this same server.
    fn dispatch(shared: &Rc<RefCell<ServerInner>>, reactor: &mut Reactor, request: &Message) {
        let mut inner = shared.borrow_mut();

        let (id, version, header, body) = match wire::unpack_message(request) {
            Ok(parts) => parts,
            Err(e) => {
                trace!(error = %e, "dropping unparseable request");
                inner.socket.ignore();
                return;
            }
        };

        if id == wire::META_PROTOCOL_ID {
            let reply = Self::handle_meta(&inner.handlers, header, body);
            Self::reply_or_ignore(&mut inner, reply);
            return;
        }

        // Exact match first; otherwise let the protocol's newest handler
        // decide whether to negotiate (e.g. a version handshake).
        let id_owned = id.to_string();
        let header = header.to_vec();
        let body = body.map(<[u8]>::to_vec);
        let reply = if let Some(handler) = inner.handlers.get_mut(&(id_owned.clone(), version)) {
            handler.handle(reactor, version, &header, body.as_deref())
        } else if let Some(max_version) = Self::max_version(&inner.handlers, &id_owned) {
            let handler = inner
                .handlers
                .get_mut(&(id_owned, max_version))
                .expect("max version key exists");
            handler.handle_unsupported_version(reactor, version, &header, body.as_deref())
        } else {
            trace!(protocol = id_owned, version, "no handler; dropping request");
            None
        };

        let reply = reply.map(|(reply_header, reply_body)| {
            wire::pack_message(id, version, &reply_header, reply_body.as_deref())
        });
        Self::reply_or_ignore(&mut inner, reply);
    }

    fn max_version(
        handlers: &HashMap<(String, u16), Box<dyn ServerProtocolHandler>>,
        protocol_id: &str,
    ) -> Option<u16> {
        handlers
            .keys()
            .filter(|(id, _)| id == protocol_id)
            .map(|(_, version)| *version)
            .max()
    }

    fn handle_meta(
        handlers: &HashMap<(String, u16), Box<dyn ServerProtocolHandler>>,
        header: &[u8],
        body: Option<&[u8]>,
    ) -> Option<Message> {
        if header != wire::META_MAX_PROTOCOL_VERSION.as_bytes() {
            return None;
        }
        let protocol_id = std::str::from_utf8(body?).ok()?;
        let reply = match Self::max_version(handlers, protocol_id) {
            Some(version) => wire::pack_message(
                wire::META_PROTOCOL_ID,
                0,
                wire::META_OK.as_bytes(),
                Some(&version.to_le_bytes()),
            ),
            None => wire::pack_message(
                wire::META_PROTOCOL_ID,
                0,
                wire::META_ERROR.as_bytes(),
                Some(wire::META_PROTOCOL_NOT_SUPPORTED.as_bytes()),
            ),
        };
        Some(reply)
    }

    fn reply_or_ignore(inner: &mut ServerInner, reply: Option<Message>) {
        match reply {
            Some(reply) => {
                if let Err(e) = inner.socket.send(&reply) {
                    warn!(error = %e, "failed to send reply");
                }
            }
            None => inner.socket.ignore(),
        }
    }
}
