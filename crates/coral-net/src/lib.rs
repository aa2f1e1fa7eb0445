//! # coral-net: Messaging substrate for Coral
//!
//! This crate provides the communication fabric the rest of the system is
//! built on:
//!
//! - Framed multipart messages over TCP ([`framing`])
//! - Endpoint URLs and slave locators ([`Endpoint`], [`SlaveLocator`])
//! - Socket roles: request/reply ([`ReqSocket`], [`RepSocket`]) and
//!   publish/subscribe ([`PubSocket`], [`SubSocket`])
//! - A cooperative single-threaded event loop ([`Reactor`])
//! - Background communication threads ([`CommThread`]) addressed only
//!   through posted closures and promises
//!
//! ## Architecture
//!
//! The substrate uses `mio` for non-blocking I/O with poll-based event
//! loops; there is no async runtime, and no data is shared across threads
//! except through [`CommThread`]'s promise hand-offs. Each reactor-driven
//! socket is owned by exactly one reactor's thread.

mod comm_thread;
mod conn;
mod endpoint;
mod error;
pub mod framing;
mod pubsub;
mod reactor;
mod rep;
mod req;

pub use comm_thread::{CommThread, Promise, Ticket};
pub use endpoint::{Endpoint, SlaveLocator};
pub use error::{NetError, NetResult};
pub use framing::{Message, pop_envelope, push_envelope, swap_envelope};
pub use pubsub::{PubSocket, SubSocket};
pub use reactor::{Reactor, TimerId};
pub use rep::RepSocket;
pub use req::ReqSocket;

// mio's Token is part of this crate's public socket API.
pub use mio::Token;
