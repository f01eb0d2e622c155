//! Integration Testing Framework for Chord rings
//!
//! - Multi-node rings on ephemeral loopback ports
//! - Controlled joins and departures
//! - Ring invariant validation

pub mod invariants;
pub mod test_harness;

pub use invariants::{InvariantViolation, NetworkInvariants};
pub use test_harness::TestHarness;
