//! Fanout relay
//!
//! A selective forwarding unit driven by an external signaling service. This
//! library exposes the relay components for the binary and for tests.

pub mod config;
pub mod error;
pub mod ice;
pub mod relay;
pub mod sfu;
pub mod signaling;
