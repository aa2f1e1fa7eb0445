//! The client side of the request/reply substrate.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use bytes::Bytes;
use tracing::{trace, warn};

use coral_net::{Endpoint, Reactor, ReqSocket, TimerId, Token};
use coral_types::CommError;

use crate::wire;

/// Completion callback for an ordinary request: reply header and optional
/// body, or a communication error.
pub type ReplyHandler = Box<dyn FnOnce(Result<(Bytes, Option<Bytes>), CommError>)>;

/// Completion callback for a `MAX_PROTOCOL_VERSION` meta request.
pub type MaxProtocolHandler = Box<dyn FnOnce(Result<u16, CommError>)>;

enum PendingKind {
    Request(ReplyHandler),
    MaxProtocol(MaxProtocolHandler),
}

struct Pending {
    kind: PendingKind,
    timer: TimerId,
}

struct ClientInner {
    socket: ReqSocket,
    token: Option<Token>,
    protocol_id: String,
    pending: Option<Pending>,
}

/// A client for one request/reply protocol against one server.
///
/// Exactly one request may be outstanding at any time; the next may be
/// issued from the previous one's completion callback. Requests that
/// receive no reply within their timeout complete with
/// [`CommError::TimedOut`], and any reply that arrives with no request
/// outstanding is discarded.
pub struct RrClient {
    inner: Rc<RefCell<ClientInner>>,
}

impl RrClient {
    /// Connects to a server and registers with the reactor.
    pub fn connect(
        reactor: &mut Reactor,
        protocol_id: impl Into<String>,
        server: &Endpoint,
        connect_timeout: Option<Duration>,
    ) -> Result<Self, CommError> {
        let socket =
            ReqSocket::connect(server, connect_timeout).map_err(CommError::from)?;
        let inner = Rc::new(RefCell::new(ClientInner {
            socket,
            token: None,
            protocol_id: protocol_id.into(),
            pending: None,
        }));

        let token = {
            let mut borrow = inner.borrow_mut();
            let token = borrow.socket.register(reactor).map_err(CommError::from)?;
            borrow.token = Some(token);
            token
        };
        let on_ready = Rc::clone(&inner);
        reactor.set_handler(token, move |reactor| {
            ClientInner::socket_ready(&on_ready, reactor);
        });

        Ok(Self { inner })
    }

    /// Sends a request.
    ///
    /// # Panics
    ///
    /// Panics if another request is already outstanding; the protocol
    /// allows only one.
    pub fn request(
        &self,
        reactor: &mut Reactor,
        version: u16,
        header: &[u8],
        body: Option<&[u8]>,
        timeout: Duration,
        on_complete: ReplyHandler,
    ) {
        let message = {
            let inner = self.inner.borrow();
            wire::pack_message(&inner.protocol_id, version, header, body)
        };
        self.send_request(reactor, message, timeout, PendingKind::Request(on_complete));
    }

    /// Asks the server for the highest version of this client's protocol
    /// it supports.
    pub fn request_max_protocol(
        &self,
        reactor: &mut Reactor,
        timeout: Duration,
        on_complete: MaxProtocolHandler,
    ) {
        let message = {
            let inner = self.inner.borrow();
            wire::pack_message(
                wire::META_PROTOCOL_ID,
                0,
                wire::META_MAX_PROTOCOL_VERSION.as_bytes(),
                Some(inner.protocol_id.as_bytes()),
            )
        };
        self.send_request(
            reactor,
            message,
            timeout,
            PendingKind::MaxProtocol(on_complete),
        );
    }

    fn send_request(
        &self,
        reactor: &mut Reactor,
        message: coral_net::Message,
        timeout: Duration,
        kind: PendingKind,
    ) {
        let mut inner = self.inner.borrow_mut();
        assert!(
            inner.pending.is_none(),
            "only one request may be outstanding per client"
        );

        // Purge replies that arrived after an earlier request timed out;
        // they must not be mistaken for this request's reply.
        while let Some(stale) = inner.socket.try_recv() {
            trace!(frames = stale.len(), "discarding stale reply");
        }

        if let Err(e) = inner.socket.send(&message) {
            drop(inner);
            complete_err(kind, e.into());
            return;
        }

        let on_timeout = Rc::clone(&self.inner);
        let timer = reactor.add_oneshot_timer(timeout, move |_, _| {
            if let Some(pending) = on_timeout.borrow_mut().pending.take() {
                complete_err(pending.kind, CommError::TimedOut);
            }
        });
        inner.pending = Some(Pending { kind, timer });
    }

    /// Abandons any outstanding request (its callback fires with
    /// [`CommError::Aborted`]) and detaches from the reactor.
    pub fn close(&self, reactor: &mut Reactor) {
        let pending = {
            let mut inner = self.inner.borrow_mut();
            if let Some(token) = inner.token.take() {
                reactor.clear_handler(token);
            }
            let _ = inner.socket.deregister(reactor);
            inner.pending.take()
        };
        if let Some(pending) = pending {
            reactor.remove_timer(pending.timer);
            complete_err(pending.kind, CommError::Aborted);
        }
    }

    /// True if a request is outstanding.
    pub fn is_busy(&self) -> bool {
        self.inner.borrow().pending.is_some()
    }
}

impl ClientInner {
    fn socket_ready(shared: &Rc<RefCell<ClientInner>>, reactor: &mut Reactor) {
        loop {
            let (reply, pending) = {
                let mut inner = shared.borrow_mut();
                match inner.socket.handle_ready() {
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "request socket failed");
                        if let Some(pending) = inner.pending.take() {
                            reactor.remove_timer(pending.timer);
                            drop(inner);
                            complete_err(pending.kind, e.into());
                        }
                        return;
                    }
                }
                let Some(reply) = inner.socket.try_recv() else {
                    return;
                };
                let Some(pending) = inner.pending.take() else {
                    trace!("discarding late reply");
                    continue;
                };
                (reply, pending)
            };

            reactor.remove_timer(pending.timer);
            let expected_protocol = shared.borrow().protocol_id.clone();
            let result = parse_reply(&reply, &expected_protocol, &pending.kind);
            complete_parsed(pending.kind, result);
        }
    }
}

enum ParsedReply {
    Reply(Bytes, Option<Bytes>),
    MaxProtocol(u16),
}

fn parse_reply(
    reply: &coral_net::Message,
    expected_protocol: &str,
    kind: &PendingKind,
) -> Result<ParsedReply, CommError> {
    let (id, _version, header, body) = wire::unpack_message(reply)?;
    match kind {
        PendingKind::Request(_) => {
            if id != expected_protocol {
                return Err(CommError::BadMessage(format!(
                    "reply from wrong protocol \"{id}\""
                )));
            }
            Ok(ParsedReply::Reply(
                reply[1].clone(),
                reply.get(2).cloned(),
            ))
        }
        PendingKind::MaxProtocol(_) => {
            if id != wire::META_PROTOCOL_ID {
                return Err(CommError::BadMessage(format!(
                    "meta reply from wrong protocol \"{id}\""
                )));
            }
            if header == wire::META_OK.as_bytes() {
                let body = body.ok_or_else(|| {
                    CommError::BadMessage("meta OK reply without version".to_string())
                })?;
                if body.len() != 2 {
                    return Err(CommError::BadMessage(
                        "meta OK body must be two bytes".to_string(),
                    ));
                }
                Ok(ParsedReply::MaxProtocol(u16::from_le_bytes([
                    body[0], body[1],
                ])))
            } else if header == wire::META_ERROR.as_bytes() {
                Err(CommError::ProtocolNotSupported)
            } else {
                Err(CommError::BadMessage(
                    "unrecognized meta reply header".to_string(),
                ))
            }
        }
    }
}

fn complete_parsed(kind: PendingKind, result: Result<ParsedReply, CommError>) {
    match (kind, result) {
        (PendingKind::Request(handler), Ok(ParsedReply::Reply(header, body))) => {
            handler(Ok((header, body)));
        }
        (PendingKind::MaxProtocol(handler), Ok(ParsedReply::MaxProtocol(version))) => {
            handler(Ok(version));
        }
        (kind, Err(e)) => complete_err(kind, e),
        (kind, Ok(_)) => {
            complete_err(kind, CommError::BadMessage("reply kind mismatch".to_string()));
        }
    }
}

fn complete_err(kind: PendingKind, e: CommError) {
    match kind {
        PendingKind::Request(handler) => handler(Err(e)),
        PendingKind::MaxProtocol(handler) => handler(Err(e)),
    }
}
