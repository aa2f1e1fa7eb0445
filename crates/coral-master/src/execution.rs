//! Blocking facade over the execution manager.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use thiserror::Error;

use coral_net::CommThread;
use coral_types::{CommError, SlaveId, StepId, TimeDuration, TimePoint};

use crate::manager::{
    AddedSlave, ExecutionManager, OperationFailure, ReconfigureError, SlaveConfig, StepResult,
};
use crate::messenger::SlaveSetup;

/// Execution-wide parameters.
#[derive(Debug, Clone)]
pub struct ExecutionOptions {
    pub start_time: TimePoint,
    /// `None` for an open-ended execution.
    pub stop_time: Option<TimePoint>,
    /// Budget each slave gets for its per-step input barrier.
    pub variable_recv_timeout: Duration,
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        Self {
            start_time: 0.0,
            stop_time: None,
            variable_recv_timeout: Duration::from_secs(1),
        }
    }
}

impl From<&coral_config::SimulationSettings> for ExecutionOptions {
    fn from(settings: &coral_config::SimulationSettings) -> Self {
        Self {
            start_time: settings.start_time,
            stop_time: settings.stop_time,
            variable_recv_timeout: settings.variable_recv_timeout(),
        }
    }
}

/// Why an execution operation failed.
#[derive(Debug, Error)]
pub enum ExecutionError {
    /// The communication layer failed (including a dead background
    /// thread).
    #[error(transparent)]
    Comm(#[from] CommError),

    /// The operation ran but failed on one or more slaves.
    #[error(transparent)]
    Operation(#[from] OperationFailure),

    /// A reconfiguration was rejected up front; no slave was touched.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// One run of a master over a set of slaves, from start to stop time.
///
/// The manager and all slave messengers live on a dedicated background
/// communication thread; every method here posts work to that thread and
/// blocks for the result.
pub struct Execution {
    thread: CommThread<ExecutionManager>,
}

impl Execution {
    /// Creates an (initially empty) execution.
    pub fn new(name: &str, options: &ExecutionOptions) -> Result<Self, CommError> {
        let setup = SlaveSetup {
            start_time: options.start_time,
            stop_time: options.stop_time,
            execution_name: name.to_string(),
            variable_recv_timeout: options.variable_recv_timeout,
        };
        let thread = CommThread::spawn(&format!("execution-{name}"), move |_| {
            Ok(ExecutionManager::new(setup))
        })
        .map_err(CommError::from)?;
        Ok(Self { thread })
    }

    /// Adds slaves to the execution. Returns one result per entry, in
    /// input order; partial success is permitted and it is up to the
    /// caller whether to continue.
    pub fn reconstitute(
        &self,
        slaves_to_add: Vec<AddedSlave>,
        comm_timeout: Duration,
    ) -> Result<Vec<Result<SlaveId, CommError>>, ExecutionError> {
        Ok(self.thread.execute_wait(move |reactor, manager, promise| {
            manager.reconstitute(
                reactor,
                slaves_to_add,
                comm_timeout,
                Box::new(move |_, results| promise.fulfil(results)),
            );
        })?)
    }

    /// Sets variable values and connections across the execution.
    pub fn reconfigure(
        &self,
        configs: Vec<SlaveConfig>,
        comm_timeout: Duration,
    ) -> Result<(), ExecutionError> {
        let result = self.thread.execute_wait(move |reactor, manager, promise| {
            // The promise serves both the synchronous rejection path and
            // the asynchronous completion.
            let slot = Rc::new(RefCell::new(Some(promise)));
            let on_complete_slot = Rc::clone(&slot);
            let sync = manager.reconfigure(
                reactor,
                configs,
                comm_timeout,
                Box::new(move |_, result| {
                    if let Some(promise) = on_complete_slot.borrow_mut().take() {
                        promise.fulfil(result.map_err(ReconfigureError::Failed));
                    }
                }),
            );
            if let Err(e) = sync {
                if let Some(promise) = slot.borrow_mut().take() {
                    promise.fulfil(Err(e));
                }
            }
        })?;
        result.map_err(|e| match e {
            ReconfigureError::Invalid(why) => ExecutionError::InvalidConfig(why),
            ReconfigureError::Failed(failure) => ExecutionError::Operation(failure),
        })
    }

    /// Primes the data fabric: every slave republishes its outputs and
    /// waits for its inputs, with per-slave retries on data timeouts.
    pub fn prime(
        &self,
        max_attempts: u32,
        comm_timeout: Duration,
    ) -> Result<(), ExecutionError> {
        let result = self.thread.execute_wait(move |reactor, manager, promise| {
            manager.prime(
                reactor,
                max_attempts,
                comm_timeout,
                Box::new(move |_, result| promise.fulfil(result)),
            );
        })?;
        Ok(result?)
    }

    /// Advances the whole execution by one time step.
    pub fn step(
        &self,
        step_size: TimeDuration,
        timeout: Duration,
    ) -> Result<StepResult, ExecutionError> {
        let result = self.thread.execute_wait(move |reactor, manager, promise| {
            manager.step(
                reactor,
                step_size,
                timeout,
                Box::new(move |_, result| promise.fulfil(result)),
            );
        })?;
        Ok(result?)
    }

    /// Concludes the step performed by the last [`Execution::step`] call.
    pub fn accept_step(&self, timeout: Duration) -> Result<(), ExecutionError> {
        let result = self.thread.execute_wait(move |reactor, manager, promise| {
            manager.accept_step(
                reactor,
                timeout,
                Box::new(move |_, result| promise.fulfil(result)),
            );
        })?;
        Ok(result?)
    }

    /// Terminates every slave and the execution itself.
    pub fn terminate(&self) -> Result<(), ExecutionError> {
        self.thread.execute_wait(move |reactor, manager, promise| {
            manager.terminate(reactor);
            promise.fulfil(());
        })?;
        Ok(())
    }

    /// The IDs of the live slaves.
    pub fn slave_ids(&self) -> Result<Vec<SlaveId>, CommError> {
        self.thread
            .execute_wait(|_, manager, promise| promise.fulfil(manager.slave_ids()))
    }

    /// The last accepted step, if any.
    pub fn current_step(&self) -> Result<Option<StepId>, CommError> {
        self.thread
            .execute_wait(|_, manager, promise| promise.fulfil(manager.current_step()))
    }

    /// The simulation time reached by the last accepted step.
    pub fn simulation_time(&self) -> Result<TimePoint, CommError> {
        self.thread
            .execute_wait(|_, manager, promise| promise.fulfil(manager.simulation_time()))
    }
}
