use thiserror::Error;

#[derive(Error, Debug)]
pub enum MediaError {
    #[error("Unsupported codec: {0}")]
    UnsupportedCodec(String),

    #[error("Media engine error: {0}")]
    Engine(#[from] webrtc::Error),
}

pub type Result<T> = std::result::Result<T, MediaError>;
