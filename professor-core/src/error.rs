use thiserror::Error;

/// All errors produced by professor-core.
#[derive(Debug, Error)]
pub enum ProfessorError {
    #[error("audio device unavailable: {0}")]
    DeviceAcquisition(String),

    #[error("audio stream error: {0}")]
    AudioStream(String),

    #[error("no default input device found")]
    NoDefaultInputDevice,

    #[error("no default output device found")]
    NoDefaultOutputDevice,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("malformed audio chunk: {0}")]
    MalformedChunk(String),

    #[error("capture pipeline is already running")]
    AlreadyRunning,

    #[error("session worker is no longer running")]
    SessionGone,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ProfessorError {
    /// Whether this error means a microphone or speaker could not be used.
    pub fn is_device_failure(&self) -> bool {
        matches!(
            self,
            ProfessorError::DeviceAcquisition(_)
                | ProfessorError::AudioStream(_)
                | ProfessorError::NoDefaultInputDevice
                | ProfessorError::NoDefaultOutputDevice
        )
    }
}

pub type Result<T> = std::result::Result<T, ProfessorError>;
