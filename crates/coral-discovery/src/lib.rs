//! # coral-discovery: Dynamic service discovery
//!
//! Services announce themselves by broadcasting UDP [`Beacon`] datagrams
//! at a fixed period; interested parties run a [`Tracker`] on the same
//! port and partition, and get appeared / payload-changed / disappeared
//! callbacks per service type, with disappearance driven by a
//! monotonic-clock expiry.

mod beacon;
mod tracker;

pub use beacon::{Beacon, BeaconConfig};
pub use tracker::{ServiceEvents, Tracker};
