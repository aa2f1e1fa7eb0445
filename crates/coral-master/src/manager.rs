//! The whole-execution state machine.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::rc::Rc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use coral_net::{Reactor, SlaveLocator};
use coral_types::{
    validate_connection, CommError, SlaveDescription, SlaveId, StepId, TimeDuration, TimePoint,
    VariableSetting,
};

use crate::messenger::{
    connect_to_slave, SlaveControlMessenger, SlaveSetup, SlaveState,
};

/// How many HELLO attempts to make per newly added slave.
const CONNECT_ATTEMPTS: u32 = 3;

/// One slave to add to the execution.
#[derive(Debug, Clone)]
pub struct AddedSlave {
    pub locator: SlaveLocator,
    /// Name of the slave, unique within the execution.
    pub name: String,
}

/// New variable values and connections for one slave.
#[derive(Debug, Clone)]
pub struct SlaveConfig {
    pub slave: SlaveId,
    pub settings: Vec<VariableSetting>,
}

/// The outcome of a whole-execution step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepResult {
    /// Every slave carried out the step.
    Complete,
    /// The listed slaves could not; the execution can only be terminated.
    Failed(Vec<SlaveId>),
}

/// A failed whole-execution operation: the primary error plus the
/// per-slave breakdown.
#[derive(Debug, Error)]
#[error("{primary} ({} slave(s) affected)", per_slave.len())]
pub struct OperationFailure {
    pub primary: CommError,
    pub per_slave: Vec<(SlaveId, CommError)>,
}

/// Why a reconfiguration was rejected or failed.
#[derive(Debug, Error)]
pub enum ReconfigureError {
    /// The settings were invalid; no slave was touched.
    #[error("invalid configuration: {0}")]
    Invalid(String),

    /// The fan-out failed on one or more slaves.
    #[error(transparent)]
    Failed(#[from] OperationFailure),
}

/// The whole-execution states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExecutionState {
    /// Between operations; anything may be started.
    Ready,
    /// An operation is in flight; its name is for diagnostics.
    Busy(&'static str),
    /// A step has succeeded on every slave and awaits ACCEPT_STEP.
    Stepped,
    /// A step failed; only termination remains.
    Halted,
    Terminated,
}

struct SlaveEntry {
    description: SlaveDescription,
    messenger: SlaveControlMessenger,
    locator: SlaveLocator,
}

struct ManagerCore {
    setup: SlaveSetup,
    slaves: BTreeMap<SlaveId, SlaveEntry>,
    /// Which output slaves each input slave's couplings reference; feeds
    /// the SET_PEERS peer lists.
    couplings: HashMap<SlaveId, HashSet<SlaveId>>,
    state: ExecutionState,
    /// The last accepted step.
    current_step: Option<StepId>,
    /// The step in flight between STEP and ACCEPT_STEP.
    pending_step: Option<StepId>,
    sim_time: TimePoint,
    last_step_size: TimeDuration,
}

/// Aggregates the per-slave state machines into one execution-wide state
/// machine with atomic multi-slave operations.
///
/// Whole-execution operations are serialized: starting one while another
/// is in flight is a logic error. Within an operation, the per-slave
/// fan-out is concurrent and unordered.
pub struct ExecutionManager {
    core: Rc<RefCell<ManagerCore>>,
}

impl ExecutionManager {
    pub fn new(setup: SlaveSetup) -> Self {
        let sim_time = setup.start_time;
        Self {
            core: Rc::new(RefCell::new(ManagerCore {
                setup,
                slaves: BTreeMap::new(),
                couplings: HashMap::new(),
                state: ExecutionState::Ready,
                current_step: None,
                pending_step: None,
                sim_time,
                last_step_size: 0.0,
            })),
        }
    }

    /// The IDs of the live slaves, in ascending order.
    pub fn slave_ids(&self) -> Vec<SlaveId> {
        self.core.borrow().slaves.keys().copied().collect()
    }

    /// The last accepted step, if any.
    pub fn current_step(&self) -> Option<StepId> {
        self.core.borrow().current_step
    }

    /// The simulation time reached by the last accepted step.
    pub fn simulation_time(&self) -> TimePoint {
        self.core.borrow().sim_time
    }

    // ------------------------------------------------------------------
    // Reconstitute
    // ------------------------------------------------------------------

    /// Adds slaves to the execution: connect, set up, and describe each
    /// newcomer. Per-slave failures do not affect the other newcomers;
    /// the callback receives one result per input entry, in order.
    pub fn reconstitute(
        &self,
        reactor: &mut Reactor,
        slaves_to_add: Vec<AddedSlave>,
        comm_timeout: Duration,
        on_complete: Box<dyn FnOnce(&mut Reactor, Vec<Result<SlaveId, CommError>>)>,
    ) {
        if let Err(e) = self.begin("reconstitute") {
            let results = slaves_to_add.iter().map(|_| Err(e.clone())).collect();
            on_complete(reactor, results);
            return;
        }
        if slaves_to_add.is_empty() {
            self.end_op(ExecutionState::Ready);
            on_complete(reactor, Vec::new());
            return;
        }

        let count = slaves_to_add.len();
        let collector = Rc::new(RefCell::new(ReconstituteCollector {
            results: vec![None; count],
            pending: HashMap::new(),
            remaining: count,
            on_complete: Some(on_complete),
        }));

        // Reserve IDs and check names up front; the network work is
        // concurrent but the bookkeeping is not.
        let mut reserved: Vec<Option<SlaveId>> = Vec::with_capacity(count);
        {
            let core = self.core.borrow();
            let mut taken: HashSet<SlaveId> = core.slaves.keys().copied().collect();
            let mut names: HashSet<String> = core
                .slaves
                .values()
                .map(|s| s.description.name.clone())
                .collect();
            for added in &slaves_to_add {
                if names.contains(&added.name) {
                    reserved.push(None);
                } else {
                    names.insert(added.name.clone());
                    let id = smallest_unused_id(&taken);
                    taken.insert(id);
                    reserved.push(Some(id));
                }
            }
        }

        for (index, (added, id)) in slaves_to_add.into_iter().zip(reserved).enumerate() {
            let Some(id) = id else {
                warn!(name = added.name, "rejecting duplicate slave name");
                ReconstituteCollector::record(
                    &collector,
                    &self.core,
                    reactor,
                    index,
                    Err(CommError::OperationFailed(format!(
                        "a slave named \"{}\" already exists",
                        added.name
                    ))),
                );
                continue;
            };
            self.add_one_slave(reactor, &collector, index, id, added, comm_timeout);
        }
    }

    fn add_one_slave(
        &self,
        reactor: &mut Reactor,
        collector: &Rc<RefCell<ReconstituteCollector>>,
        index: usize,
        id: SlaveId,
        added: AddedSlave,
        comm_timeout: Duration,
    ) {
        let core = Rc::clone(&self.core);
        let collector = Rc::clone(collector);
        let setup = self.core.borrow().setup.clone();
        let locator = added.locator.clone();

        connect_to_slave(
            reactor,
            &locator,
            CONNECT_ATTEMPTS,
            comm_timeout,
            Box::new(move |reactor, result| {
                let connection = match result {
                    Ok(connection) => connection,
                    Err(e) => {
                        ReconstituteCollector::record(&collector, &core, reactor, index, Err(e));
                        return;
                    }
                };

                let setup_collector = Rc::clone(&collector);
                let setup_core = Rc::clone(&core);
                let name = added.name.clone();
                let messenger = SlaveControlMessenger::new(
                    reactor,
                    connection,
                    id,
                    &added.name,
                    &setup,
                    comm_timeout,
                    Box::new(move |reactor, result| {
                        ReconstituteCollector::setup_finished(
                            &setup_collector,
                            &setup_core,
                            reactor,
                            index,
                            id,
                            result,
                            comm_timeout,
                        );
                    }),
                );

                let mut pending = collector.borrow_mut();
                if pending.results[index].is_none() {
                    pending.pending.insert(
                        id,
                        PendingSlave {
                            index,
                            name,
                            locator: added.locator.clone(),
                            messenger,
                        },
                    );
                } else {
                    // The SETUP already failed synchronously.
                    drop(pending);
                    messenger.close(reactor);
                }
            }),
        );
    }

    // ------------------------------------------------------------------
    // Reconfigure
    // ------------------------------------------------------------------

    /// Sets variable values and connections on the given slaves.
    ///
    /// All settings are validated first; any invalid setting rejects the
    /// whole call synchronously, before any slave is touched.
    pub fn reconfigure(
        &self,
        reactor: &mut Reactor,
        configs: Vec<SlaveConfig>,
        comm_timeout: Duration,
        on_complete: Box<dyn FnOnce(&mut Reactor, Result<(), OperationFailure>)>,
    ) -> Result<(), ReconfigureError> {
        {
            let core = self.core.borrow();
            for config in &configs {
                core.validate_config(config)
                    .map_err(ReconfigureError::Invalid)?;
            }
        }

        self.begin("reconfigure").map_err(|e| {
            ReconfigureError::Failed(OperationFailure {
                primary: e,
                per_slave: Vec::new(),
            })
        })?;
        if configs.is_empty() {
            self.end_op(ExecutionState::Ready);
            on_complete(reactor, Ok(()));
            return Ok(());
        }

        // Commit the coupling graph now that the settings are valid.
        {
            let mut core = self.core.borrow_mut();
            for config in &configs {
                let referenced = core.couplings.entry(config.slave).or_default();
                for setting in &config.settings {
                    if let Some(output) = setting.connected_output {
                        referenced.insert(output.slave);
                    }
                }
            }
        }

        let gather = Gather::new(
            configs.len(),
            self.finish_simple("reconfigure", on_complete),
        );
        for config in configs {
            let Some(messenger) = self.messenger_for(config.slave) else {
                Gather::record(
                    &gather,
                    reactor,
                    config.slave,
                    Err(CommError::OperationFailed("no such slave".to_string())),
                );
                continue;
            };
            let peers = self.peer_endpoints_for(config.slave);
            let chain_gather = Rc::clone(&gather);
            let chain_messenger = messenger.clone();
            let slave = config.slave;
            messenger.set_variables(
                reactor,
                config.settings,
                comm_timeout,
                Box::new(move |reactor, result| match result {
                    Ok(()) => {
                        // Values are in; now point the slave at the
                        // publishers its inputs reference.
                        let record_gather = Rc::clone(&chain_gather);
                        chain_messenger.set_peers(
                            reactor,
                            peers,
                            comm_timeout,
                            Box::new(move |reactor, result| {
                                Gather::record(&record_gather, reactor, slave, result);
                            }),
                        );
                    }
                    Err(e) => Gather::record(&chain_gather, reactor, slave, Err(e)),
                }),
            );
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Prime
    // ------------------------------------------------------------------

    /// Makes every slave republish its outputs and wait for its inputs,
    /// retrying individual slaves on [`CommError::DataTimeout`] up to
    /// `max_attempts` times. Freshly joined subscriptions can miss the
    /// first publish while their connection establishes, so a retry or
    /// two is expected.
    pub fn prime(
        &self,
        reactor: &mut Reactor,
        max_attempts: u32,
        comm_timeout: Duration,
        on_complete: Box<dyn FnOnce(&mut Reactor, Result<(), OperationFailure>)>,
    ) {
        assert!(max_attempts > 0);
        if let Err(e) = self.begin("prime") {
            on_complete(
                reactor,
                Err(OperationFailure {
                    primary: e,
                    per_slave: Vec::new(),
                }),
            );
            return;
        }
        let targets = self.all_messengers();
        if targets.is_empty() {
            self.end_op(ExecutionState::Ready);
            on_complete(reactor, Ok(()));
            return;
        }
        let gather = Gather::new(targets.len(), self.finish_simple("prime", on_complete));
        for (slave, messenger) in targets {
            prime_one(
                reactor,
                &gather,
                slave,
                messenger,
                max_attempts,
                comm_timeout,
            );
        }
    }

    // ------------------------------------------------------------------
    // Step / AcceptStep
    // ------------------------------------------------------------------

    /// Advances the whole execution by one step of `step_size`.
    pub fn step(
        &self,
        reactor: &mut Reactor,
        step_size: TimeDuration,
        timeout: Duration,
        on_complete: Box<dyn FnOnce(&mut Reactor, Result<StepResult, OperationFailure>)>,
    ) {
        assert!(step_size > 0.0, "step size must be positive");
        if let Err(e) = self.begin("step") {
            on_complete(
                reactor,
                Err(OperationFailure {
                    primary: e,
                    per_slave: Vec::new(),
                }),
            );
            return;
        }
        let (step_id, timepoint) = {
            let mut core = self.core.borrow_mut();
            let step_id = core.current_step.map_or(StepId::ZERO, StepId::next);
            core.pending_step = Some(step_id);
            core.last_step_size = step_size;
            (step_id, core.sim_time)
        };
        debug!(step = %step_id, t = timepoint, dt = step_size, "stepping all slaves");

        let targets = self.all_messengers();
        if targets.is_empty() {
            self.end_op(ExecutionState::Stepped);
            on_complete(reactor, Ok(StepResult::Complete));
            return;
        }

        let core = Rc::clone(&self.core);
        let gather = Gather::new(
            targets.len(),
            Box::new(move |reactor, failures| {
                let result = {
                    let mut core = core.borrow_mut();
                    if core.state == ExecutionState::Terminated {
                        return;
                    }
                    let step_failures: Vec<SlaveId> = failures
                        .iter()
                        .filter(|(_, e)| *e == CommError::CannotPerformTimestep)
                        .map(|(s, _)| *s)
                        .collect();
                    let comm_failures: Vec<(SlaveId, CommError)> = failures
                        .iter()
                        .filter(|(_, e)| *e != CommError::CannotPerformTimestep)
                        .cloned()
                        .collect();
                    if !comm_failures.is_empty() {
                        core.state = ExecutionState::Halted;
                        Err(OperationFailure {
                            primary: comm_failures[0].1.clone(),
                            per_slave: failures,
                        })
                    } else if !step_failures.is_empty() {
                        warn!(?step_failures, "step failed; execution is only terminable");
                        core.state = ExecutionState::Halted;
                        Ok(StepResult::Failed(step_failures))
                    } else {
                        core.state = ExecutionState::Stepped;
                        Ok(StepResult::Complete)
                    }
                };
                on_complete(reactor, result);
            }),
        );
        for (slave, messenger) in targets {
            let record_gather = Rc::clone(&gather);
            messenger.step(
                reactor,
                step_id,
                timepoint,
                step_size,
                timeout,
                Box::new(move |reactor, result| {
                    Gather::record(&record_gather, reactor, slave, result);
                }),
            );
        }
    }

    /// Concludes the step every slave has published, unblocking their
    /// input barriers. Only legal after a completed [`ExecutionManager::step`].
    ///
    /// On partial failure (e.g. a per-slave [`CommError::DataTimeout`])
    /// the step remains open and accepting may be retried; only the
    /// slaves that have not yet accepted are contacted again.
    pub fn accept_step(
        &self,
        reactor: &mut Reactor,
        timeout: Duration,
        on_complete: Box<dyn FnOnce(&mut Reactor, Result<(), OperationFailure>)>,
    ) {
        {
            let mut core = self.core.borrow_mut();
            if core.state != ExecutionState::Stepped {
                let refusal = CommError::OperationFailed(format!(
                    "accept_step requires a completed step, but the execution is {:?}",
                    core.state
                ));
                drop(core);
                on_complete(
                    reactor,
                    Err(OperationFailure {
                        primary: refusal,
                        per_slave: Vec::new(),
                    }),
                );
                return;
            }
            core.state = ExecutionState::Busy("accept-step");
        }

        let targets: Vec<(SlaveId, SlaveControlMessenger)> = self
            .all_messengers()
            .into_iter()
            .filter(|(_, m)| m.state() == SlaveState::StepOk)
            .collect();
        if targets.is_empty() {
            self.commit_step();
            on_complete(reactor, Ok(()));
            return;
        }

        let core = Rc::clone(&self.core);
        let gather = Gather::new(
            targets.len(),
            Box::new(move |reactor, failures| {
                {
                    let mut core = core.borrow_mut();
                    if core.state == ExecutionState::Terminated {
                        return;
                    }
                    if failures.is_empty() {
                        core.commit_step();
                    } else {
                        // The step stays open for a retry.
                        core.state = ExecutionState::Stepped;
                    }
                }
                let result = if failures.is_empty() {
                    Ok(())
                } else {
                    Err(OperationFailure {
                        primary: failures[0].1.clone(),
                        per_slave: failures,
                    })
                };
                on_complete(reactor, result);
            }),
        );
        for (slave, messenger) in targets {
            let record_gather = Rc::clone(&gather);
            messenger.accept_step(
                reactor,
                timeout,
                Box::new(move |reactor, result| {
                    Gather::record(&record_gather, reactor, slave, result);
                }),
            );
        }
    }

    // ------------------------------------------------------------------
    // Terminate
    // ------------------------------------------------------------------

    /// Terminates every slave (ignoring individual failures) and marks
    /// the execution terminated. Any in-flight per-slave commands are
    /// abandoned with [`CommError::Aborted`].
    pub fn terminate(&self, reactor: &mut Reactor) {
        info!("terminating execution");
        {
            let mut core = self.core.borrow_mut();
            if core.state == ExecutionState::Terminated {
                return;
            }
            core.state = ExecutionState::Terminated;
        }
        let targets = self.all_messengers();
        for (_, messenger) in targets {
            if messenger.state() == SlaveState::NotConnected {
                continue;
            }
            messenger.terminate(reactor);
        }
        self.core.borrow_mut().slaves.clear();
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn begin(&self, op: &'static str) -> Result<(), CommError> {
        let mut core = self.core.borrow_mut();
        if core.state == ExecutionState::Ready {
            core.state = ExecutionState::Busy(op);
            Ok(())
        } else {
            Err(CommError::OperationFailed(format!(
                "cannot {op} while the execution is {:?}",
                core.state
            )))
        }
    }

    fn end_op(&self, next: ExecutionState) {
        let mut core = self.core.borrow_mut();
        if core.state != ExecutionState::Terminated {
            core.state = next;
        }
    }

    fn commit_step(&self) {
        self.core.borrow_mut().commit_step();
    }

    /// Builds the standard completion for operations that end in `Ready`.
    fn finish_simple(
        &self,
        op: &'static str,
        on_complete: Box<dyn FnOnce(&mut Reactor, Result<(), OperationFailure>)>,
    ) -> Box<dyn FnOnce(&mut Reactor, Vec<(SlaveId, CommError)>)> {
        let core = Rc::clone(&self.core);
        Box::new(move |reactor, failures| {
            {
                let mut core = core.borrow_mut();
                if core.state != ExecutionState::Terminated {
                    core.state = ExecutionState::Ready;
                }
            }
            debug!(op, failures = failures.len(), "operation finished");
            let result = if failures.is_empty() {
                Ok(())
            } else {
                Err(OperationFailure {
                    primary: failures[0].1.clone(),
                    per_slave: failures,
                })
            };
            on_complete(reactor, result);
        })
    }

    fn messenger_for(&self, slave: SlaveId) -> Option<SlaveControlMessenger> {
        self.core
            .borrow()
            .slaves
            .get(&slave)
            .map(|entry| entry.messenger.clone())
    }

    fn all_messengers(&self) -> Vec<(SlaveId, SlaveControlMessenger)> {
        self.core
            .borrow()
            .slaves
            .iter()
            .map(|(id, entry)| (*id, entry.messenger.clone()))
            .collect()
    }

    /// The publisher endpoints of every slave whose outputs feed inputs
    /// of `slave`.
    fn peer_endpoints_for(&self, slave: SlaveId) -> Vec<coral_net::Endpoint> {
        let core = self.core.borrow();
        let Some(referenced) = core.couplings.get(&slave) else {
            return Vec::new();
        };
        referenced
            .iter()
            .filter_map(|output_slave| core.slaves.get(output_slave))
            .map(|entry| entry.locator.data_pub.clone())
            .collect()
    }
}

impl ManagerCore {
    fn commit_step(&mut self) {
        self.current_step = self.pending_step.take();
        self.sim_time += self.last_step_size;
        self.state = ExecutionState::Ready;
        debug!(step = ?self.current_step, t = self.sim_time, "step accepted");
    }

    /// Checks one slave's settings against the live descriptions.
    fn validate_config(&self, config: &SlaveConfig) -> Result<(), String> {
        let entry = self
            .slaves
            .get(&config.slave)
            .ok_or_else(|| format!("invalid slave ID: {}", config.slave))?;
        let slave_type = &entry.description.type_description;

        for setting in &config.settings {
            let variable = slave_type.variable(setting.variable).ok_or_else(|| {
                format!(
                    "{} has no variable with ID {}",
                    entry.description.name, setting.variable
                )
            })?;

            if let Some(value) = &setting.value {
                if value.data_type() != variable.data_type {
                    return Err(format!(
                        "cannot set {}.{}: expected {} value, got {}",
                        entry.description.name,
                        variable.name,
                        variable.data_type,
                        value.data_type(),
                    ));
                }
            }

            if let Some(output) = setting.connected_output {
                let output_entry = self.slaves.get(&output.slave).ok_or_else(|| {
                    format!(
                        "cannot connect {}.{}: invalid slave ID {}",
                        entry.description.name, variable.name, output.slave
                    )
                })?;
                let output_variable = output_entry
                    .description
                    .type_description
                    .variable(output.id)
                    .ok_or_else(|| {
                        format!(
                            "cannot connect {}.{}: {} has no variable with ID {}",
                            entry.description.name,
                            variable.name,
                            output_entry.description.name,
                            output.id
                        )
                    })?;
                validate_connection(variable, output_variable).map_err(|e| {
                    format!(
                        "cannot connect {}.{}: {e}",
                        entry.description.name, variable.name
                    )
                })?;
            }
        }
        Ok(())
    }
}

fn smallest_unused_id(taken: &HashSet<SlaveId>) -> SlaveId {
    let mut candidate = 1u16;
    while taken.contains(&SlaveId::new(candidate)) {
        candidate += 1;
    }
    SlaveId::new(candidate)
}

// ============================================================================
// Fan-out bookkeeping
// ============================================================================

/// Collects per-slave completions of one fan-out operation and fires the
/// overall completion exactly once, when the last straggler is in.
struct Gather {
    remaining: usize,
    failures: Vec<(SlaveId, CommError)>,
    on_done: Option<Box<dyn FnOnce(&mut Reactor, Vec<(SlaveId, CommError)>)>>,
}

impl Gather {
    fn new(
        count: usize,
        on_done: Box<dyn FnOnce(&mut Reactor, Vec<(SlaveId, CommError)>)>,
    ) -> Rc<RefCell<Self>> {
        Rc::new(RefCell::new(Self {
            remaining: count,
            failures: Vec::new(),
            on_done: Some(on_done),
        }))
    }

    fn record(
        shared: &Rc<RefCell<Self>>,
        reactor: &mut Reactor,
        slave: SlaveId,
        result: Result<(), CommError>,
    ) {
        let done = {
            let mut gather = shared.borrow_mut();
            if let Err(e) = result {
                gather.failures.push((slave, e));
            }
            gather.remaining -= 1;
            if gather.remaining == 0 {
                let failures = std::mem::take(&mut gather.failures);
                gather.on_done.take().map(|f| (f, failures))
            } else {
                None
            }
        };
        if let Some((on_done, failures)) = done {
            on_done(reactor, failures);
        }
    }
}

/// One priming attempt on one slave, retrying on data timeouts.
fn prime_one(
    reactor: &mut Reactor,
    gather: &Rc<RefCell<Gather>>,
    slave: SlaveId,
    messenger: SlaveControlMessenger,
    attempts_left: u32,
    comm_timeout: Duration,
) {
    let retry_gather = Rc::clone(gather);
    let retry_messenger = messenger.clone();
    messenger.resend_vars(
        reactor,
        comm_timeout,
        Box::new(move |reactor, result| match result {
            Err(CommError::DataTimeout) if attempts_left > 1 => {
                debug!(%slave, attempts_left = attempts_left - 1, "priming retry");
                prime_one(
                    reactor,
                    &retry_gather,
                    slave,
                    retry_messenger,
                    attempts_left - 1,
                    comm_timeout,
                );
            }
            other => Gather::record(&retry_gather, reactor, slave, other),
        }),
    );
}

// ============================================================================
// Reconstitute bookkeeping
// ============================================================================

struct PendingSlave {
    index: usize,
    name: String,
    locator: SlaveLocator,
    messenger: SlaveControlMessenger,
}

struct ReconstituteCollector {
    results: Vec<Option<Result<SlaveId, CommError>>>,
    pending: HashMap<SlaveId, PendingSlave>,
    remaining: usize,
    on_complete: Option<Box<dyn FnOnce(&mut Reactor, Vec<Result<SlaveId, CommError>>)>>,
}

impl ReconstituteCollector {
    /// The SETUP reply for one newcomer has arrived (or failed).
    fn setup_finished(
        shared: &Rc<RefCell<Self>>,
        core: &Rc<RefCell<ManagerCore>>,
        reactor: &mut Reactor,
        index: usize,
        id: SlaveId,
        result: Result<(), CommError>,
        comm_timeout: Duration,
    ) {
        match result {
            Ok(()) => {
                let messenger = shared
                    .borrow()
                    .pending
                    .get(&id)
                    .map(|p| p.messenger.clone());
                let Some(messenger) = messenger else {
                    Self::record(
                        shared,
                        core,
                        reactor,
                        index,
                        Err(CommError::Aborted),
                    );
                    return;
                };
                let desc_shared = Rc::clone(shared);
                let desc_core = Rc::clone(core);
                messenger.get_description(
                    reactor,
                    comm_timeout,
                    Box::new(move |reactor, result| {
                        Self::description_finished(
                            &desc_shared,
                            &desc_core,
                            reactor,
                            index,
                            id,
                            result,
                        );
                    }),
                );
            }
            Err(e) => {
                let pending = shared.borrow_mut().pending.remove(&id);
                if let Some(pending) = pending {
                    pending.messenger.close(reactor);
                }
                Self::record(shared, core, reactor, index, Err(e));
            }
        }
    }

    /// The DESCRIBE reply has arrived; on success the slave becomes live.
    fn description_finished(
        shared: &Rc<RefCell<Self>>,
        core: &Rc<RefCell<ManagerCore>>,
        reactor: &mut Reactor,
        index: usize,
        id: SlaveId,
        result: Result<coral_types::SlaveTypeDescription, CommError>,
    ) {
        let pending = shared.borrow_mut().pending.remove(&id);
        let Some(pending) = pending else {
            Self::record(shared, core, reactor, index, Err(CommError::Aborted));
            return;
        };
        match result {
            Ok(type_description) => {
                debug!(slave = %id, name = pending.name, "slave added to execution");
                core.borrow_mut().slaves.insert(
                    id,
                    SlaveEntry {
                        description: SlaveDescription {
                            id,
                            name: pending.name,
                            type_description,
                        },
                        messenger: pending.messenger,
                        locator: pending.locator,
                    },
                );
                Self::record(shared, core, reactor, index, Ok(id));
            }
            Err(e) => {
                pending.messenger.close(reactor);
                Self::record(shared, core, reactor, index, Err(e));
            }
        }
    }

    fn record(
        shared: &Rc<RefCell<Self>>,
        core: &Rc<RefCell<ManagerCore>>,
        reactor: &mut Reactor,
        index: usize,
        result: Result<SlaveId, CommError>,
    ) {
        let done = {
            let mut collector = shared.borrow_mut();
            if collector.results[index].is_some() {
                return;
            }
            collector.results[index] = Some(result);
            collector.remaining -= 1;
            if collector.remaining == 0 {
                let results = collector
                    .results
                    .iter_mut()
                    .map(|slot| slot.take().expect("all slots filled"))
                    .collect::<Vec<_>>();
                collector.on_complete.take().map(|f| (f, results))
            } else {
                None
            }
        };
        if let Some((on_complete, results)) = done {
            {
                let mut core = core.borrow_mut();
                if core.state != ExecutionState::Terminated {
                    core.state = ExecutionState::Ready;
                }
            }
            on_complete(reactor, results);
        }
    }
}
