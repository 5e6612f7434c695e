//! Signaling
//!
//! The orchestrator maps signaling events onto sessions and forwarders. The
//! WebSocket client carries the JSON arrays to and from the signaling service.

mod orchestrator;
pub mod ws;

pub use orchestrator::{OrchestratorSettings, SessionOrchestrator};

use async_trait::async_trait;
use fanout_protocol::OutboundSignal;

use crate::error::Result;

/// Outbound half of the signaling channel
#[async_trait]
pub trait SignalSender: Send + Sync {
    async fn send(&self, message: OutboundSignal) -> Result<()>;
}
