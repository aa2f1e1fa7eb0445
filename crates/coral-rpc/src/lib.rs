//! # coral-rpc: Versioned request/reply substrate
//!
//! A generic RPC layer on top of the messaging substrate. A request is
//! two or three frames:
//!
//! 1. the protocol identifier followed by a `u16` little-endian protocol
//!    version,
//! 2. the request header (protocol-specific bytes),
//! 3. an optional body.
//!
//! Replies mirror the same shape. Servers dispatch by (protocol
//! identifier, version); clients keep exactly one request outstanding and
//! time out on their own reactor timer.
//!
//! A well-known meta protocol (identifier `"MP"`) answers
//! `MAX_PROTOCOL_VERSION` queries so clients can discover which version a
//! server speaks before committing to one.

mod client;
mod server;
mod wire;

pub use client::{MaxProtocolHandler, ReplyHandler, RrClient};
pub use server::{RrServer, ServerProtocolHandler};
pub use wire::{META_MAX_PROTOCOL_VERSION, META_PROTOCOL_ID};
