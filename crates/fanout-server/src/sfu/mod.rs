//! SFU core
//!
//! Packets read from a publishing session go into the stream's forwarder and
//! are copied, without transcoding, into every subscribing session's slot
//! tracks.

mod forwarder;
mod peer;
mod registry;
mod rewrite;
mod session;
mod slots;
mod transport;

pub use forwarder::{
    ForwarderConfig, ForwarderStats, MediaKind, MediaPacket, OverflowPolicy, PacketSink,
    RtpForwarder,
};
pub use peer::WebRtcTransportFactory;
pub use registry::ForwarderRegistry;
pub use rewrite::SequenceRewriter;
pub use session::{
    ConnectionSession, NoticeKind, PendingCandidate, SessionConfig, SessionNotice, SessionSetup,
    SessionState, TargetBitrate,
};
pub use slots::TrackSlotPool;
pub use transport::{
    ConnectivityState, FeedbackMessage, PeerTransport, RemoteMediaTrack, TransportEvent,
    TransportFactory, TransportParams,
};
