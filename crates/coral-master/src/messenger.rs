//! The master-side half of the per-slave control protocol.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use tracing::{debug, trace, warn};

use coral_net::{Endpoint, Reactor, ReqSocket, SlaveLocator, TimerId, Token};
use coral_protocol::control::{
    ControlMsg, ErrorCode, MessageType, SetPeersData, SetVarsData, SetupData, StepData,
    MAX_PROTOCOL_VERSION,
};
use coral_types::{
    CommError, SlaveId, SlaveTypeDescription, StepId, TimeDuration, TimePoint, VariableSetting,
};

/// The observable state of one slave, as tracked by its messenger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlaveState {
    NotConnected,
    Connected,
    Ready,
    StepOk,
    StepFailed,
    /// A command is in flight.
    Busy,
}

/// Completion callback carrying no payload.
pub type VoidHandler = Box<dyn FnOnce(&mut Reactor, Result<(), CommError>)>;

/// Completion callback for GET-DESCRIPTION.
pub type DescriptionHandler =
    Box<dyn FnOnce(&mut Reactor, Result<SlaveTypeDescription, CommError>)>;

/// Completion callback for the connection phase.
pub type ConnectHandler = Box<dyn FnOnce(&mut Reactor, Result<SlaveConnection, CommError>)>;

/// A connected-but-unconfigured slave: the outcome of the HELLO phase.
pub struct SlaveConnection {
    socket: ReqSocket,
    /// The protocol version granted by the slave.
    pub protocol_version: u16,
}

/// The execution-wide parameters a slave needs at SETUP.
#[derive(Debug, Clone)]
pub struct SlaveSetup {
    pub start_time: TimePoint,
    /// `None` for open-ended executions.
    pub stop_time: Option<TimePoint>,
    pub execution_name: String,
    pub variable_recv_timeout: Duration,
}

// ============================================================================
// Connection phase
// ============================================================================

struct PendingConnection {
    locator: SlaveLocator,
    socket: Option<ReqSocket>,
    token: Option<Token>,
    timer: Option<TimerId>,
    attempts_left: u32,
    timeout: Duration,
    on_complete: Option<ConnectHandler>,
}

/// Initiates the HELLO handshake with a slave.
///
/// On timeout the attempt is retried on a fresh socket, up to
/// `max_attempts` in total. The callback receives either a
/// [`SlaveConnection`] carrying the negotiated protocol version or the
/// final error.
pub fn connect_to_slave(
    reactor: &mut Reactor,
    locator: &SlaveLocator,
    max_attempts: u32,
    timeout: Duration,
    on_complete: ConnectHandler,
) {
    assert!(max_attempts > 0, "at least one connection attempt is needed");
    let pending = Rc::new(RefCell::new(PendingConnection {
        locator: locator.clone(),
        socket: None,
        token: None,
        timer: None,
        attempts_left: max_attempts,
        timeout,
        on_complete: Some(on_complete),
    }));
    PendingConnection::try_attempt(&pending, reactor);
}

impl PendingConnection {
    fn try_attempt(shared: &Rc<RefCell<PendingConnection>>, reactor: &mut Reactor) {
        let result = Self::start_attempt(shared, reactor);
        if let Err(e) = result {
            Self::finish(shared, reactor, Err(e));
        }
    }

    fn start_attempt(
        shared: &Rc<RefCell<PendingConnection>>,
        reactor: &mut Reactor,
    ) -> Result<(), CommError> {
        let mut inner = shared.borrow_mut();
        inner.attempts_left -= 1;
        Self::teardown_socket(&mut inner, reactor);

        trace!(endpoint = %inner.locator.control, "HELLO attempt");
        let mut socket = ReqSocket::connect(&inner.locator.control, Some(inner.timeout))
            .map_err(CommError::from)?;
        let hello = ControlMsg::Hello {
            version: MAX_PROTOCOL_VERSION,
        }
        .encode(MAX_PROTOCOL_VERSION)
        .map_err(CommError::from)?;
        socket.send(&hello).map_err(CommError::from)?;

        let token = socket.register(reactor).map_err(CommError::from)?;
        let on_ready = Rc::clone(shared);
        reactor.set_handler(token, move |reactor| {
            Self::socket_ready(&on_ready, reactor);
        });

        let on_timeout = Rc::clone(shared);
        let timeout = inner.timeout;
        let timer = reactor.add_oneshot_timer(timeout, move |reactor, _| {
            Self::attempt_timed_out(&on_timeout, reactor);
        });

        inner.socket = Some(socket);
        inner.token = Some(token);
        inner.timer = Some(timer);
        Ok(())
    }

    fn attempt_timed_out(shared: &Rc<RefCell<PendingConnection>>, reactor: &mut Reactor) {
        let retry = {
            let mut inner = shared.borrow_mut();
            inner.timer = None;
            inner.attempts_left > 0
        };
        if retry {
            debug!("HELLO timed out; retrying");
            Self::try_attempt(shared, reactor);
        } else {
            Self::finish(shared, reactor, Err(CommError::TimedOut));
        }
    }

    fn socket_ready(shared: &Rc<RefCell<PendingConnection>>, reactor: &mut Reactor) {
        let reply = {
            let mut inner = shared.borrow_mut();
            let Some(socket) = inner.socket.as_mut() else {
                return;
            };
            if let Err(e) = socket.handle_ready() {
                drop(inner);
                Self::finish(shared, reactor, Err(e.into()));
                return;
            }
            match socket.try_recv() {
                Some(reply) => reply,
                None => return,
            }
        };

        let outcome = match ControlMsg::decode(&reply) {
            Ok((_, ControlMsg::Hello { version })) => Ok(version),
            Ok((_, ControlMsg::Denied)) => Err(CommError::PermissionDenied),
            Ok((_, ControlMsg::Error(info) | ControlMsg::FatalError(info))) => {
                Err(CommError::ConnectionRefused(info.detail))
            }
            Ok((_, other)) => Err(CommError::BadMessage(format!(
                "unexpected HELLO reply {:?}",
                other.message_type()
            ))),
            Err(e) => Err(e.into()),
        };
        match outcome {
            Ok(version) => Self::finish(shared, reactor, Ok(version)),
            Err(e) => Self::finish(shared, reactor, Err(e)),
        }
    }

    fn finish(
        shared: &Rc<RefCell<PendingConnection>>,
        reactor: &mut Reactor,
        result: Result<u16, CommError>,
    ) {
        let (socket, on_complete) = {
            let mut inner = shared.borrow_mut();
            if let Some(timer) = inner.timer.take() {
                reactor.remove_timer(timer);
            }
            // Keep the socket but detach it from the reactor; the
            // messenger registers it afresh.
            let token = inner.token.take();
            if let (Some(socket), Some(token)) = (inner.socket.as_mut(), token) {
                reactor.clear_handler(token);
                let _ = socket.deregister(reactor);
            }
            (inner.socket.take(), inner.on_complete.take())
        };
        let Some(on_complete) = on_complete else {
            return;
        };
        match result {
            Ok(version) => {
                debug!(version, "slave connected");
                on_complete(
                    reactor,
                    Ok(SlaveConnection {
                        socket: socket.expect("socket exists on success"),
                        protocol_version: version,
                    }),
                );
            }
            Err(e) => on_complete(reactor, Err(e)),
        }
    }

    fn teardown_socket(inner: &mut PendingConnection, reactor: &mut Reactor) {
        if let Some(token) = inner.token.take() {
            reactor.clear_handler(token);
        }
        if let Some(mut socket) = inner.socket.take() {
            let _ = socket.deregister(reactor);
        }
    }
}

// ============================================================================
// The messenger proper
// ============================================================================

enum AnyHandler {
    Void(VoidHandler),
    Description(DescriptionHandler),
}

struct MessengerInner {
    socket: ReqSocket,
    token: Option<Token>,
    protocol_version: u16,
    state: SlaveState,
    /// The state to restore when a command fails non-fatally.
    resume_state: SlaveState,
    current_command: Option<MessageType>,
    on_complete: Option<AnyHandler>,
    timer: Option<TimerId>,
    slave_id: SlaveId,
}

/// The master's control channel to one slave.
///
/// At most one command is in flight at any time; while it is, the state
/// is [`SlaveState::Busy`] and issuing another command is a logic error.
/// Command timeouts and fatal replies reset the messenger to
/// [`SlaveState::NotConnected`].
pub struct SlaveControlMessenger {
    inner: Rc<RefCell<MessengerInner>>,
}

impl Clone for SlaveControlMessenger {
    /// Clones the handle; both handles drive the same underlying channel.
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl SlaveControlMessenger {
    /// Promotes a fresh [`SlaveConnection`] into a messenger by sending
    /// SETUP. `on_complete` fires when the slave reports READY.
    pub fn new(
        reactor: &mut Reactor,
        connection: SlaveConnection,
        slave_id: SlaveId,
        slave_name: &str,
        setup: &SlaveSetup,
        timeout: Duration,
        on_complete: VoidHandler,
    ) -> Self {
        let inner = Rc::new(RefCell::new(MessengerInner {
            socket: connection.socket,
            token: None,
            protocol_version: connection.protocol_version,
            state: SlaveState::Connected,
            resume_state: SlaveState::Connected,
            current_command: None,
            on_complete: None,
            timer: None,
            slave_id,
        }));

        {
            let mut borrow = inner.borrow_mut();
            match borrow.socket.register(reactor) {
                Ok(token) => borrow.token = Some(token),
                Err(e) => {
                    drop(borrow);
                    let messenger = Self { inner };
                    on_complete(reactor, Err(e.into()));
                    return messenger;
                }
            }
        }
        let on_ready = Rc::clone(&inner);
        let token = inner.borrow().token.expect("registered above");
        reactor.set_handler(token, move |reactor| {
            MessengerInner::socket_ready(&on_ready, reactor);
        });

        let messenger = Self { inner };
        debug!(slave = %slave_id, name = slave_name, "messenger created; sending SETUP");
        messenger.send_command(
            reactor,
            ControlMsg::Setup(SetupData {
                slave_id,
                start_time: setup.start_time,
                stop_time: setup.stop_time,
                variable_pub_endpoint: String::new(),
                variable_sub_endpoint: String::new(),
                execution_name: setup.execution_name.clone(),
                slave_name: slave_name.to_string(),
                variable_recv_timeout_ms: setup.variable_recv_timeout.as_millis() as i32,
            }),
            timeout,
            AnyHandler::Void(on_complete),
        );
        messenger
    }

    /// The messenger's current state.
    pub fn state(&self) -> SlaveState {
        self.inner.borrow().state
    }

    /// Asks the slave for its type description.
    pub fn get_description(
        &self,
        reactor: &mut Reactor,
        timeout: Duration,
        on_complete: DescriptionHandler,
    ) {
        self.require_state(SlaveState::Ready);
        self.send_command(
            reactor,
            ControlMsg::Describe,
            timeout,
            AnyHandler::Description(on_complete),
        );
    }

    /// Sets variable values and/or connections on the slave.
    pub fn set_variables(
        &self,
        reactor: &mut Reactor,
        settings: Vec<VariableSetting>,
        timeout: Duration,
        on_complete: VoidHandler,
    ) {
        self.require_state(SlaveState::Ready);
        self.send_command(
            reactor,
            ControlMsg::SetVars(SetVarsData {
                variables: settings,
            }),
            timeout,
            AnyHandler::Void(on_complete),
        );
    }

    /// Replaces the slave's set of peer publishers.
    pub fn set_peers(
        &self,
        reactor: &mut Reactor,
        peers: Vec<Endpoint>,
        timeout: Duration,
        on_complete: VoidHandler,
    ) {
        self.require_state(SlaveState::Ready);
        self.send_command(
            reactor,
            ControlMsg::SetPeers(SetPeersData {
                peers: peers.iter().map(Endpoint::url).collect(),
            }),
            timeout,
            AnyHandler::Void(on_complete),
        );
    }

    /// Makes the slave republish its outputs and wait for its inputs.
    pub fn resend_vars(&self, reactor: &mut Reactor, timeout: Duration, on_complete: VoidHandler) {
        self.require_state(SlaveState::Ready);
        self.send_command(reactor, ControlMsg::ResendVars, timeout, AnyHandler::Void(on_complete));
    }

    /// Tells the slave to perform one time step.
    pub fn step(
        &self,
        reactor: &mut Reactor,
        step_id: StepId,
        timepoint: TimePoint,
        step_size: TimeDuration,
        timeout: Duration,
        on_complete: VoidHandler,
    ) {
        self.require_state(SlaveState::Ready);
        self.send_command(
            reactor,
            ControlMsg::Step(StepData {
                step_id,
                timepoint,
                stepsize: step_size,
            }),
            timeout,
            AnyHandler::Void(on_complete),
        );
    }

    /// Tells the slave to conclude the step it has published.
    pub fn accept_step(&self, reactor: &mut Reactor, timeout: Duration, on_complete: VoidHandler) {
        self.require_state(SlaveState::StepOk);
        self.send_command(
            reactor,
            ControlMsg::AcceptStep,
            timeout,
            AnyHandler::Void(on_complete),
        );
    }

    /// Sends TERMINATE (without waiting for any reply) and closes.
    pub fn terminate(&self, reactor: &mut Reactor) {
        let state = self.state();
        assert!(
            state != SlaveState::NotConnected,
            "cannot terminate an unconnected slave"
        );
        trace!(slave = %self.inner.borrow().slave_id, "sending TERMINATE");
        {
            let mut inner = self.inner.borrow_mut();
            let version = inner.protocol_version;
            if let Ok(message) = ControlMsg::Terminate.encode(version) {
                let _ = inner.socket.send(&message);
            }
        }
        self.close(reactor);
    }

    /// Abandons any in-flight command (its callback fires with
    /// [`CommError::Aborted`]) and drops the connection without telling
    /// the slave.
    pub fn close(&self, reactor: &mut Reactor) {
        let (pending, timer) = {
            let mut inner = self.inner.borrow_mut();
            if let Some(token) = inner.token.take() {
                reactor.clear_handler(token);
            }
            let _ = inner.socket.deregister(reactor);
            inner.state = SlaveState::NotConnected;
            inner.current_command = None;
            (inner.on_complete.take(), inner.timer.take())
        };
        if let Some(timer) = timer {
            reactor.remove_timer(timer);
        }
        if let Some(handler) = pending {
            complete_err(handler, reactor, CommError::Aborted);
        }
    }

    fn require_state(&self, expected: SlaveState) {
        let state = self.state();
        assert!(
            state == expected,
            "command requires state {expected:?}, but the slave is {state:?}"
        );
    }

    fn send_command(
        &self,
        reactor: &mut Reactor,
        msg: ControlMsg,
        timeout: Duration,
        on_complete: AnyHandler,
    ) {
        let mut inner = self.inner.borrow_mut();
        assert!(
            inner.current_command.is_none(),
            "a command is already in flight"
        );
        let command = msg.message_type();
        trace!(slave = %inner.slave_id, command = ?command, "sending command");

        let encoded = match msg.encode(inner.protocol_version) {
            Ok(encoded) => encoded,
            Err(e) => {
                drop(inner);
                complete_err(on_complete, reactor, e.into());
                return;
            }
        };
        if let Err(e) = inner.socket.send(&encoded) {
            drop(inner);
            complete_err(on_complete, reactor, e.into());
            return;
        }

        let on_timeout = Rc::clone(&self.inner);
        let timer = reactor.add_oneshot_timer(timeout, move |reactor, _| {
            MessengerInner::reply_timed_out(&on_timeout, reactor);
        });

        inner.resume_state = inner.state;
        inner.state = SlaveState::Busy;
        inner.current_command = Some(command);
        inner.on_complete = Some(on_complete);
        inner.timer = Some(timer);
    }
}

impl MessengerInner {
    fn reply_timed_out(shared: &Rc<RefCell<MessengerInner>>, reactor: &mut Reactor) {
        let handler = {
            let mut inner = shared.borrow_mut();
            inner.timer = None;
            inner.current_command = None;
            // A slave that misses a deadline is considered lost.
            if let Some(token) = inner.token.take() {
                reactor.clear_handler(token);
            }
            let _ = inner.socket.deregister(reactor);
            inner.state = SlaveState::NotConnected;
            inner.on_complete.take()
        };
        if let Some(handler) = handler {
            complete_err(handler, reactor, CommError::TimedOut);
        }
    }

    fn socket_ready(shared: &Rc<RefCell<MessengerInner>>, reactor: &mut Reactor) {
        loop {
            let (reply, command, handler) = {
                let mut inner = shared.borrow_mut();
                if let Err(e) = inner.socket.handle_ready() {
                    warn!(slave = %inner.slave_id, error = %e, "control socket failed");
                    let handler = inner.on_complete.take();
                    let timer = inner.timer.take();
                    inner.current_command = None;
                    inner.state = SlaveState::NotConnected;
                    drop(inner);
                    if let Some(timer) = timer {
                        reactor.remove_timer(timer);
                    }
                    if let Some(handler) = handler {
                        complete_err(handler, reactor, e.into());
                    }
                    return;
                }
                let Some(reply) = inner.socket.try_recv() else {
                    return;
                };
                if inner.state != SlaveState::Busy {
                    // The command this reply answers has already timed out.
                    trace!(slave = %inner.slave_id, "discarding late reply");
                    continue;
                }
                let command = inner.current_command.take().expect("busy implies a command");
                let handler = inner.on_complete.take().expect("busy implies a handler");
                if let Some(timer) = inner.timer.take() {
                    reactor.remove_timer(timer);
                }
                (reply, command, handler)
            };

            Self::reply_received(shared, reactor, &reply, command, handler);
        }
    }

    fn reply_received(
        shared: &Rc<RefCell<MessengerInner>>,
        reactor: &mut Reactor,
        reply: &coral_net::Message,
        command: MessageType,
        handler: AnyHandler,
    ) {
        let decoded = match ControlMsg::decode(reply) {
            Ok((_, decoded)) => decoded,
            Err(e) => {
                Self::fail_connection(shared, reactor, handler, e.into());
                return;
            }
        };
        trace!(command = ?command, reply = ?decoded.message_type(), "reply received");

        match (command, decoded) {
            // Commands whose success reply is READY.
            (
                MessageType::Setup
                | MessageType::SetVars
                | MessageType::SetPeers
                | MessageType::ResendVars
                | MessageType::AcceptStep,
                ControlMsg::Ready,
            ) => {
                shared.borrow_mut().state = SlaveState::Ready;
                complete_void(handler, reactor, Ok(()));
            }

            (MessageType::Describe, ControlMsg::Description(description)) => {
                shared.borrow_mut().state = SlaveState::Ready;
                match handler {
                    AnyHandler::Description(h) => h(reactor, Ok(description)),
                    AnyHandler::Void(h) => h(reactor, Ok(())),
                }
            }

            (MessageType::Step, ControlMsg::StepOk) => {
                shared.borrow_mut().state = SlaveState::StepOk;
                complete_void(handler, reactor, Ok(()));
            }

            (MessageType::Step, ControlMsg::StepFailed) => {
                shared.borrow_mut().state = SlaveState::StepFailed;
                complete_err(handler, reactor, CommError::CannotPerformTimestep);
            }

            // Non-fatal errors: restore the pre-command state so the
            // operation can be retried (this is what priming relies on).
            (_, ControlMsg::Error(info)) => {
                let mut inner = shared.borrow_mut();
                inner.state = inner.resume_state;
                drop(inner);
                let error = match info.code {
                    ErrorCode::TimedOut => CommError::DataTimeout,
                    _ => CommError::OperationFailed(info.detail),
                };
                complete_err(handler, reactor, error);
            }

            (_, ControlMsg::FatalError(info)) => {
                Self::fail_connection(shared, reactor, handler, CommError::Fatal(info.detail));
            }

            (_, other) => {
                Self::fail_connection(
                    shared,
                    reactor,
                    handler,
                    CommError::BadMessage(format!(
                        "reply {:?} does not answer command {command:?}",
                        other.message_type()
                    )),
                );
            }
        }
    }

    /// Tears the connection down and reports the error.
    fn fail_connection(
        shared: &Rc<RefCell<MessengerInner>>,
        reactor: &mut Reactor,
        handler: AnyHandler,
        error: CommError,
    ) {
        {
            let mut inner = shared.borrow_mut();
            warn!(slave = %inner.slave_id, error = %error, "control connection failed");
            if let Some(token) = inner.token.take() {
                reactor.clear_handler(token);
            }
            let _ = inner.socket.deregister(reactor);
            inner.state = SlaveState::NotConnected;
        }
        complete_err(handler, reactor, error);
    }
}

fn complete_void(handler: AnyHandler, reactor: &mut Reactor, result: Result<(), CommError>) {
    match handler {
        AnyHandler::Void(h) => h(reactor, result),
        AnyHandler::Description(h) => match result {
            Ok(()) => h(
                reactor,
                Err(CommError::BadMessage(
                    "description reply carried no description".to_string(),
                )),
            ),
            Err(e) => h(reactor, Err(e)),
        },
    }
}

fn complete_err(handler: AnyHandler, reactor: &mut Reactor, error: CommError) {
    match handler {
        AnyHandler::Void(h) => h(reactor, Err(error)),
        AnyHandler::Description(h) => h(reactor, Err(error)),
    }
}
