//! # coral-provider: The slave-provider server
//!
//! A slave provider announces itself with a discovery beacon and serves
//! two RPC operations: listing the slave types it can supply, and
//! spawning a slave of one of those types on demand.
//!
//! Spawning is abstracted behind [`SlaveCreator`]; the stock
//! [`ProcessSlaveCreator`] launches a child process and waits for it to
//! report its bound endpoints over a private loopback rendezvous (see
//! [`report_endpoints`] for the child side).

mod creator;
mod server;

pub use creator::{
    report_endpoints, InstantiationError, ProcessSlaveCreator, SlaveCreator,
};
pub use server::{ProviderConfig, SlaveProviderServer};
