//! # coral-master: Master-side machinery
//!
//! The components a master process uses to run a distributed
//! co-simulation:
//!
//! - [`SlaveControlMessenger`]: the per-slave asynchronous control
//!   client, one per slave, with a single outstanding command and typed
//!   completion callbacks
//! - [`ExecutionManager`]: the whole-execution state machine that fans
//!   commands out to every slave and aggregates their results
//! - [`Execution`]: a blocking facade over the manager, which runs on a
//!   background communication thread
//! - [`ProviderCluster`]: discovery-fed client pool for slave providers
//!   (slave-type queries and slave instantiation)

mod cluster;
mod execution;
mod manager;
mod messenger;

pub use cluster::{ProviderCluster, SlaveType};
pub use execution::{Execution, ExecutionError, ExecutionOptions};
pub use manager::{
    AddedSlave, ExecutionManager, OperationFailure, ReconfigureError, SlaveConfig, StepResult,
};
pub use messenger::{
    connect_to_slave, ConnectHandler, DescriptionHandler, SlaveConnection, SlaveControlMessenger,
    SlaveSetup, SlaveState, VoidHandler,
};
