//! The in-slave control state machine.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, info, trace, warn};

use coral_net::{Endpoint, Message, NetResult, PubSocket, Reactor, TimerId};
use coral_protocol::control::{
    ControlMsg, ErrorCode, ErrorInfo, MessageType, SetVarsData, SetupData, StepData,
    MAX_PROTOCOL_VERSION,
};
use coral_rpc::{RrServer, ServerProtocolHandler};
use coral_types::{CommError, SlaveId, StepId, ETERNITY};

use crate::instance::Instance;
use crate::variable_io::{publish_all, VariableConnections};

/// Configuration for a [`SlaveAgent`].
#[derive(Debug, Clone)]
pub struct SlaveAgentConfig {
    /// Where to serve the control protocol (port 0 for OS-assigned).
    pub control_endpoint: Endpoint,
    /// Where to publish variable data (port 0 for OS-assigned).
    pub data_pub_endpoint: Endpoint,
    /// How long the agent tolerates silence from the master before
    /// shutting down on its own.
    pub master_inactivity_timeout: Duration,
}

/// The control states of a slave.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AgentState {
    /// Waiting for HELLO.
    NotConnected,
    /// HELLO exchanged; waiting for SETUP.
    Connected,
    /// Configured and between steps.
    Ready,
    /// A step has been carried out and its outputs published; waiting for
    /// ACCEPT_STEP.
    Published,
    /// A step failed; only TERMINATE is acceptable now.
    StepFailed,
}

struct AgentInner {
    state: AgentState,
    instance: Box<dyn Instance>,
    publisher: PubSocket,
    connections: VariableConnections,
    id: SlaveId,
    current_step: Option<StepId>,
    simulation_started: bool,
    variable_recv_timeout: Duration,
    inactivity_timer: TimerId,
    inactivity_timeout: Duration,
    /// Negotiated at HELLO; replies are encoded at this version.
    protocol_version: u16,
}

/// The slave-side half of the control protocol.
///
/// The agent serves the `"DSE"` protocol on the request/reply substrate,
/// drives the [`Instance`] through its lifecycle, publishes outputs after
/// each step, and blocks in the input barrier at ACCEPT_STEP until its
/// coupled inputs have arrived.
pub struct SlaveAgent {
    inner: Rc<RefCell<AgentInner>>,
    // Owns the handler registration; dropped with the agent.
    _server: RrServer,
    bound_control: Endpoint,
    bound_data: Endpoint,
}

impl SlaveAgent {
    /// Binds the agent's sockets, registers everything with the reactor,
    /// and arms the master-inactivity timer.
    pub fn new(
        reactor: &mut Reactor,
        instance: Box<dyn Instance>,
        config: &SlaveAgentConfig,
    ) -> NetResult<Self> {
        let server = RrServer::bind(reactor, &config.control_endpoint)?;
        let bound_control = server.bound_endpoint();

        let mut publisher = PubSocket::bind(&config.data_pub_endpoint)?;
        let bound_data = publisher.bound_endpoint().clone();
        let publisher_listener = publisher.register_listener(reactor)?;

        // If the master goes silent, assume it is gone and exit as though
        // TERMINATE had been received.
        let inactivity_timeout = config.master_inactivity_timeout;
        let inactivity_timer = reactor.add_oneshot_timer(inactivity_timeout, move |r, _| {
            warn!("no command from master within the inactivity timeout; shutting down");
            r.stop();
        });

        let inner = Rc::new(RefCell::new(AgentInner {
            state: AgentState::NotConnected,
            instance,
            publisher,
            connections: VariableConnections::new()?,
            id: SlaveId::INVALID,
            current_step: None,
            simulation_started: false,
            variable_recv_timeout: Duration::from_secs(1),
            inactivity_timer,
            inactivity_timeout,
            protocol_version: MAX_PROTOCOL_VERSION,
        }));

        // Subscribers joining the data publisher.
        let on_listener = Rc::clone(&inner);
        reactor.set_handler(publisher_listener, move |reactor| {
            let tokens = {
                let mut inner = on_listener.borrow_mut();
                inner.publisher.accept_ready(reactor).unwrap_or_default()
            };
            for token in tokens {
                let on_conn = Rc::clone(&on_listener);
                reactor.set_handler(token, move |reactor| {
                    on_conn.borrow_mut().publisher.conn_ready(reactor, token);
                });
            }
        });

        server.add_protocol_handler(
            "DSE",
            MAX_PROTOCOL_VERSION,
            Box::new(ControlHandler {
                inner: Rc::clone(&inner),
            }),
        );

        info!(control = %bound_control, data = %bound_data, "slave agent listening");
        Ok(Self {
            inner,
            _server: server,
            bound_control,
            bound_data,
        })
    }

    /// The endpoint the control server is bound to.
    pub fn bound_control_endpoint(&self) -> &Endpoint {
        &self.bound_control
    }

    /// The endpoint the data publisher is bound to.
    pub fn bound_data_endpoint(&self) -> &Endpoint {
        &self.bound_data
    }
}

/// Bridges the request/reply substrate to the agent state machine.
struct ControlHandler {
    inner: Rc<RefCell<AgentInner>>,
}

impl ControlHandler {
    fn dispatch(
        &mut self,
        reactor: &mut Reactor,
        version: u16,
        header: &[u8],
        body: Option<&[u8]>,
    ) -> Option<(Vec<u8>, Option<Vec<u8>>)> {
        // Reassemble the frames and decode as a control message.
        let mut message: Message = vec![
            coral_protocol::control::encode_id_frame(version),
            Bytes::copy_from_slice(header),
        ];
        if let Some(body) = body {
            message.push(Bytes::copy_from_slice(body));
        }
        let msg = match ControlMsg::decode(&message) {
            Ok((_, msg)) => msg,
            Err(e) => {
                warn!(error = %e, "dropping undecodable control message");
                return None;
            }
        };

        let reply = AgentInner::on_message(&self.inner, reactor, msg);

        let reply = reply?;
        let version = self.inner.borrow().protocol_version;
        match reply.encode(version) {
            Ok(frames) => {
                let body = frames.get(2).map(|b| b.to_vec());
                Some((frames[1].to_vec(), body))
            }
            Err(e) => {
                warn!(error = %e, "failed to encode control reply");
                None
            }
        }
    }
}

impl ServerProtocolHandler for ControlHandler {
    fn handle(
        &mut self,
        reactor: &mut Reactor,
        version: u16,
        header: &[u8],
        body: Option<&[u8]>,
    ) -> Option<(Vec<u8>, Option<Vec<u8>>)> {
        self.dispatch(reactor, version, header, body)
    }

    /// A client asking for a newer protocol version than we speak; only
    /// HELLO is entertained, and the reply counter-offers our version.
    fn handle_unsupported_version(
        &mut self,
        reactor: &mut Reactor,
        version: u16,
        header: &[u8],
        body: Option<&[u8]>,
    ) -> Option<(Vec<u8>, Option<Vec<u8>>)> {
        let hello = (MessageType::Hello as u16).to_le_bytes();
        if header != hello {
            warn!(version, "dropping non-HELLO request for an unsupported version");
            return None;
        }
        self.dispatch(reactor, version, header, body)
    }
}

impl AgentInner {
    /// Handles one control message and produces the reply, if any.
    fn on_message(
        shared: &Rc<RefCell<AgentInner>>,
        reactor: &mut Reactor,
        msg: ControlMsg,
    ) -> Option<ControlMsg> {
        let mut guard = shared.borrow_mut();
        let inner = &mut *guard;
        trace!(state = ?inner.state, message = ?msg.message_type(), "control message");

        // Every message proves the master is alive.
        reactor.reset_timer(inner.inactivity_timer, inner.inactivity_timeout);

        match (inner.state, msg) {
            (_, ControlMsg::Terminate) => {
                info!("terminating on master's request");
                if inner.simulation_started {
                    inner.instance.end_simulation();
                }
                reactor.stop();
                None
            }

            // A HELLO in the connected state is a retry whose first reply
            // was lost or late; answering again is harmless.
            (AgentState::NotConnected | AgentState::Connected, ControlMsg::Hello { version }) => {
                let granted = version.min(MAX_PROTOCOL_VERSION);
                debug!(requested = version, granted, "handshake");
                inner.protocol_version = granted;
                inner.state = AgentState::Connected;
                Some(ControlMsg::Hello { version: granted })
            }

            (AgentState::Connected, ControlMsg::Setup(data)) => inner.handle_setup(reactor, &data),

            (AgentState::Ready, ControlMsg::Step(data)) => inner.handle_step(reactor, &data),

            (AgentState::Ready, ControlMsg::SetVars(data)) => inner.handle_set_vars(data),

            (AgentState::Ready, ControlMsg::SetPeers(data)) => inner.handle_set_peers(&data.peers),

            (AgentState::Ready, ControlMsg::Describe) => {
                Some(ControlMsg::Description(inner.instance.type_description()))
            }

            (AgentState::Ready, ControlMsg::ResendVars) => inner.handle_resend_vars(reactor),

            (AgentState::Published, ControlMsg::AcceptStep) => inner.handle_accept_step(),

            (state, msg) => inner.fatal(
                reactor,
                format!(
                    "message {:?} is not valid in state {state:?}",
                    msg.message_type()
                ),
            ),
        }
    }

    fn handle_setup(&mut self, reactor: &mut Reactor, data: &SetupData) -> Option<ControlMsg> {
        debug!(
            slave_name = data.slave_name,
            slave_id = %data.slave_id,
            start = data.start_time,
            stop = data.stop_time.unwrap_or(ETERNITY),
            "setting up"
        );
        if let Err(e) = self.instance.setup(
            &data.slave_name,
            &data.execution_name,
            data.start_time,
            data.stop_time.unwrap_or(ETERNITY),
        ) {
            return self.fatal(reactor, format!("model setup failed: {e}"));
        }
        self.id = data.slave_id;
        if data.variable_recv_timeout_ms >= 0 {
            self.variable_recv_timeout =
                Duration::from_millis(data.variable_recv_timeout_ms as u64);
        }
        self.state = AgentState::Ready;
        Some(ControlMsg::Ready)
    }

    fn handle_step(&mut self, reactor: &mut Reactor, data: &StepData) -> Option<ControlMsg> {
        if !self.simulation_started {
            if let Err(e) = self.instance.start_simulation() {
                return self.fatal(reactor, format!("failed to start simulation: {e}"));
            }
            self.simulation_started = true;
        }
        self.current_step = Some(data.step_id);
        trace!(step = %data.step_id, t = data.timepoint, dt = data.stepsize, "stepping");
        if self.instance.do_step(data.timepoint, data.stepsize) {
            publish_all(
                &mut self.publisher,
                reactor,
                self.instance.as_ref(),
                self.id,
                data.step_id,
            );
            self.state = AgentState::Published;
            Some(ControlMsg::StepOk)
        } else {
            warn!(step = %data.step_id, "model failed to perform the time step");
            self.state = AgentState::StepFailed;
            Some(ControlMsg::StepFailed)
        }
    }

    fn handle_accept_step(&mut self) -> Option<ControlMsg> {
        let step = self.current_step.unwrap_or(StepId::PRE_SIMULATION);
        match self.connections.update(
            self.instance.as_mut(),
            step,
            self.variable_recv_timeout,
        ) {
            Ok(()) => {
                self.state = AgentState::Ready;
                Some(ControlMsg::Ready)
            }
            Err(CommError::DataTimeout) => {
                // Stay in the published state; the master may retry.
                Some(ControlMsg::Error(ErrorInfo {
                    code: ErrorCode::TimedOut,
                    detail: "timed out waiting for variable values from other slaves".to_string(),
                }))
            }
            Err(e) => Some(ControlMsg::Error(ErrorInfo {
                code: ErrorCode::Unspecified,
                detail: e.to_string(),
            })),
        }
    }

    fn handle_set_vars(&mut self, data: SetVarsData) -> Option<ControlMsg> {
        debug!(count = data.variables.len(), "setting and connecting variables");
        let mut all_ok = true;
        for setting in data.variables {
            if let Some(value) = &setting.value {
                if !self.instance.set_variable(setting.variable, value) {
                    all_ok = false;
                    debug!(variable = %setting.variable, "failed to set variable value");
                }
            }
            // Connections are recorded even when a value assignment
            // failed; the two are independent.
            if let Some(output) = setting.connected_output {
                self.connections.couple(output, setting.variable);
            }
        }
        if all_ok {
            Some(ControlMsg::Ready)
        } else {
            Some(ControlMsg::Error(ErrorInfo {
                code: ErrorCode::CannotSetVariable,
                detail: "failed to set the value of one or more variables".to_string(),
            }))
        }
    }

    fn handle_set_peers(&mut self, peers: &[String]) -> Option<ControlMsg> {
        debug!(count = peers.len(), "reconnecting to peers");
        let mut endpoints = Vec::with_capacity(peers.len());
        for peer in peers {
            match peer.parse::<Endpoint>() {
                Ok(endpoint) => endpoints.push(endpoint),
                Err(e) => {
                    return Some(ControlMsg::Error(ErrorInfo {
                        code: ErrorCode::Unspecified,
                        detail: format!("bad peer endpoint \"{peer}\": {e}"),
                    }));
                }
            }
        }
        match self.connections.connect_peers(&endpoints) {
            Ok(()) => Some(ControlMsg::Ready),
            Err(e) => Some(ControlMsg::Error(ErrorInfo {
                code: ErrorCode::Unspecified,
                detail: format!("failed to connect to peers: {e}"),
            })),
        }
    }

    fn handle_resend_vars(&mut self, reactor: &mut Reactor) -> Option<ControlMsg> {
        let step = self.current_step.unwrap_or(StepId::PRE_SIMULATION);
        publish_all(
            &mut self.publisher,
            reactor,
            self.instance.as_ref(),
            self.id,
            step,
        );
        trace!(
            timeout_ms = self.variable_recv_timeout.as_millis() as u64,
            "waiting for variable values"
        );
        match self
            .connections
            .update(self.instance.as_mut(), step, self.variable_recv_timeout)
        {
            Ok(()) => Some(ControlMsg::Ready),
            Err(CommError::DataTimeout) => Some(ControlMsg::Error(ErrorInfo {
                code: ErrorCode::TimedOut,
                detail: "timed out waiting for resent variable values".to_string(),
            })),
            Err(e) => Some(ControlMsg::Error(ErrorInfo {
                code: ErrorCode::Unspecified,
                detail: e.to_string(),
            })),
        }
    }

    /// Replies with FATAL_ERROR and shuts the agent down.
    fn fatal(&mut self, reactor: &mut Reactor, detail: String) -> Option<ControlMsg> {
        warn!(detail, "fatal protocol error; shutting down");
        if self.simulation_started {
            self.instance.end_simulation();
        }
        reactor.stop();
        Some(ControlMsg::FatalError(ErrorInfo {
            code: ErrorCode::Unspecified,
            detail,
        }))
    }
}
