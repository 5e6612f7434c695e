use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Tuple has the wrong shape or a field has the wrong type
    #[error("Invalid event payload: {0}")]
    InvalidEventPayload(String),

    #[error("Unknown event: {0}")]
    UnknownEvent(String),
}
