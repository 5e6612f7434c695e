//! Media utilities for the fanout relay
//!
//! This crate provides:
//! - The video/audio codec catalogue the relay negotiates
//! - MediaEngine registration for that catalogue
//! - Payload number lookup in offered session descriptions

pub mod codec;
pub mod error;
pub mod sdp;

pub use codec::*;
pub use error::MediaError;
