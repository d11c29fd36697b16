use thiserror::Error;

/// All errors produced by voxstream-core.
#[derive(Debug, Error)]
pub enum Error {
    #[error("audio device error: {0}")]
    AudioDevice(String),

    #[error("audio stream error: {0}")]
    AudioStream(String),

    #[error("no default input device found")]
    NoDefaultInputDevice,

    #[error("ring buffer is full — pipeline cannot keep up")]
    RingBufferFull,

    #[error("vad error: {0}")]
    Vad(String),

    #[error("inference error: {0}")]
    Inference(String),

    #[error("translation backend '{backend}' failed: {reason}")]
    Translation { backend: String, reason: String },

    #[error("engine is already running")]
    AlreadyRunning,

    #[error("engine is not running")]
    NotRunning,

    #[error("model file not found: {path}")]
    ModelNotFound { path: std::path::PathBuf },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
