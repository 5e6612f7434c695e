use fanout_protocol::ProtocolError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("No free track slot (capacity {capacity})")]
    PoolExhausted { capacity: usize },

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Invalid event payload: {0}")]
    InvalidEventPayload(String),

    #[error("Unknown event: {0}")]
    UnknownEvent(String),

    #[error("No forwarder for stream {0}")]
    ForwarderAbsent(String),

    #[error("Negotiation failed: {0}")]
    NegotiationFailure(String),

    #[error("Session {0} is closed")]
    SessionClosed(String),

    #[error("Transport error: {0}")]
    Transport(#[from] webrtc::Error),

    #[error("Media setup error: {0}")]
    Media(#[from] fanout_media::MediaError),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl RelayError {
    /// Whether the endpoint should hear about this failure
    pub fn is_reported(&self) -> bool {
        matches!(
            self,
            RelayError::PoolExhausted { .. }
                | RelayError::NegotiationFailure(_)
                | RelayError::Transport(_)
                | RelayError::Media(_)
        )
    }
}

impl From<ProtocolError> for RelayError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::InvalidEventPayload(msg) => RelayError::InvalidEventPayload(msg),
            ProtocolError::UnknownEvent(name) => RelayError::UnknownEvent(name),
        }
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;
