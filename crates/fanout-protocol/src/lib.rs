//! Signaling protocol for the fanout relay
//!
//! Signaling messages travel as JSON arrays. This crate decodes them once at
//! the boundary into typed events and encodes replies back into arrays.

pub mod error;
pub mod messages;
pub mod types;

pub use error::ProtocolError;
pub use messages::*;
pub use types::*;
