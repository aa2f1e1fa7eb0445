//! The interface between the agent and the model it drives.

use thiserror::Error;

use coral_types::{ScalarValue, SlaveTypeDescription, TimePoint, TimeDuration, VariableId};

/// An unrecoverable failure inside the model.
///
/// The agent reports this to the master as a fatal error and shuts down.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct InstanceError(pub String);

/// One co-simulated subsystem, typically a wrapped FMI model.
///
/// The agent drives the instance through the lifecycle
/// `setup → start_simulation → (do_step …) → end_simulation`, reads its
/// outputs after each step, and writes its inputs as values arrive from
/// peers.
pub trait Instance {
    /// Static description of the slave type, including all variables.
    fn type_description(&self) -> SlaveTypeDescription;

    /// Prepares the instance for a simulation run.
    ///
    /// Called exactly once, before any other lifecycle method. `stop_time`
    /// is [`coral_types::ETERNITY`] for open-ended executions.
    fn setup(
        &mut self,
        slave_name: &str,
        execution_name: &str,
        start_time: TimePoint,
        stop_time: TimePoint,
    ) -> Result<(), InstanceError>;

    /// Called when the first time step is about to be performed.
    fn start_simulation(&mut self) -> Result<(), InstanceError>;

    /// Called when the simulation ends, provided it was started.
    fn end_simulation(&mut self);

    /// Performs one time step from `current_time` over `delta_t`.
    ///
    /// Returning `false` means the step could not be carried out; the
    /// execution can then only be terminated.
    fn do_step(&mut self, current_time: TimePoint, delta_t: TimeDuration) -> bool;

    /// Reads a variable's current value. `None` if the ID is unknown.
    fn get_variable(&self, id: VariableId) -> Option<ScalarValue>;

    /// Writes a variable. Returns `false` if the ID is unknown or the
    /// value is rejected (wrong type, out of range, not settable now).
    fn set_variable(&mut self, id: VariableId, value: &ScalarValue) -> bool;
}
