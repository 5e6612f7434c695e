//! Transport seam
//!
//! Sessions talk to the real-time engine only through these traits. The
//! webrtc-backed implementation lives in `peer`; tests plug in fakes.

use std::sync::Arc;

use async_trait::async_trait;
use fanout_media::CodecSelection;
use fanout_protocol::{IceCandidate, Role, SessionDescription};
use tokio::sync::mpsc;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::rtp::packet::Packet;

use super::forwarder::MediaKind;
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl From<RTCPeerConnectionState> for ConnectivityState {
    fn from(state: RTCPeerConnectionState) -> Self {
        match state {
            RTCPeerConnectionState::Connecting => ConnectivityState::Connecting,
            RTCPeerConnectionState::Connected => ConnectivityState::Connected,
            RTCPeerConnectionState::Disconnected => ConnectivityState::Disconnected,
            RTCPeerConnectionState::Failed => ConnectivityState::Failed,
            RTCPeerConnectionState::Closed => ConnectivityState::Closed,
            _ => ConnectivityState::New,
        }
    }
}

/// RTCP feedback sent upstream to the publishing endpoint
#[derive(Debug, Clone, PartialEq)]
pub enum FeedbackMessage {
    PictureLoss { media_ssrc: u32 },
    RapidResync { media_ssrc: u32 },
    BitrateEstimate { bitrate_bps: u64, ssrcs: Vec<u32> },
}

/// Events raised by a transport, in the order the engine reports them
pub enum TransportEvent {
    LocalCandidate(IceCandidate),
    Connectivity(ConnectivityState),
    RemoteTrack(Arc<dyn RemoteMediaTrack>),
}

/// Inbound media track
#[async_trait]
pub trait RemoteMediaTrack: Send + Sync {
    fn kind(&self) -> MediaKind;
    fn ssrc(&self) -> u32;
    /// Block until the next packet arrives or the track ends
    async fn read_packet(&self) -> Result<Packet>;
}

/// One negotiated connection
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn set_remote_description(&self, description: SessionDescription) -> Result<()>;
    /// Create an answer and install it as the local description
    async fn create_answer(&self) -> Result<SessionDescription>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;
    /// Write into the local track of the given kind
    async fn write_rtp(&self, kind: MediaKind, packet: &Packet) -> Result<()>;
    async fn send_feedback(&self, message: FeedbackMessage) -> Result<()>;
    async fn close(&self) -> Result<()>;
}

/// What a transport needs to know at construction
#[derive(Debug, Clone)]
pub struct TransportParams {
    pub endpoint_id: String,
    pub stream_id: String,
    pub session_id: String,
    pub role: Role,
    pub codec: CodecSelection,
    /// Slot whose index labels the local tracks
    pub slot: Option<usize>,
}

impl TransportParams {
    /// Label used as track and stream id for local tracks
    pub fn local_track_label(&self) -> String {
        match self.slot {
            Some(index) => index.to_string(),
            None => self.stream_id.clone(),
        }
    }

    /// Whether the transport carries local tracks back to the endpoint
    pub fn has_local_tracks(&self) -> bool {
        self.role != Role::Source
    }
}

#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(
        &self,
        params: &TransportParams,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Arc<dyn PeerTransport>>;
}
