//! Integration tests for Chord rings
//!
//! Every node in these tests is a real `ChordNode` listening on a loopback port, talking to
//! its peers over the production transport.

pub mod integration;
