//! # coral-protocol: Wire protocols for Coral
//!
//! The message formats spoken between the distributed parts of the system:
//!
//! - [`control`]: the master↔slave control protocol (`"DSE"`)
//! - [`data`]: timestamped variable samples on the publish/subscribe
//!   fabric
//! - [`discovery`]: the UDP beacon datagram
//! - [`provider`]: bodies and header strings of the slave-provider RPC
//!   protocol (`"DSSPI"`)
//!
//! Binary headers are hand-encoded little-endian; structured bodies are
//! postcard-serialized serde structs.

pub mod control;
pub mod data;
pub mod discovery;
pub mod provider;

mod error;

pub use error::{ProtocolError, ProtocolResult};
