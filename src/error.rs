use thiserror::Error;

/// Error taxonomy for the voice pipeline.
///
/// Transport and protocol errors always move the conversation to its Error
/// state. Capture errors block recording but leave the session alive. Codec
/// errors are fatal to the worker that hit them and contained there.
/// Silence timeouts and over-long recordings are NOT errors; they are
/// expected operating conditions handled by explicit states.
#[derive(Debug, Error)]
pub enum VoiceError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("capture error: {0}")]
    Capture(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("vad error: {0}")]
    Vad(String),

    #[error("session error: {0}")]
    Session(String),

    #[error("config error: {0}")]
    Config(String),
}

pub type VoiceResult<T> = Result<T, VoiceError>;
