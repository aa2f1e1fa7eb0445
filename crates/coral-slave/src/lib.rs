//! # coral-slave: In-slave machinery
//!
//! Everything that runs inside a slave process:
//!
//! - The [`Instance`] trait, the capability the surrounding model code
//!   (e.g. an FMU wrapper) provides to the agent
//! - Variable I/O: the output publisher and the per-step input barrier
//!   ([`VariableConnections`])
//! - The [`SlaveAgent`] control state machine, served over the
//!   request/reply substrate
//! - [`SlaveRunner`], which wires agent, sockets and reactor together and
//!   runs the slave until it terminates

mod agent;
mod instance;
mod runner;
mod variable_io;

pub use agent::{SlaveAgent, SlaveAgentConfig};
pub use instance::{Instance, InstanceError};
pub use runner::{RunOptions, SlaveRunner};
pub use variable_io::VariableConnections;
