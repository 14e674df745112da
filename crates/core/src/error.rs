/// Result alias that carries the custom [`TriggerRigError`] type.
pub type Result<T> = std::result::Result<T, TriggerRigError>;

/// Common error type for the core crate.
#[derive(Debug, thiserror::Error)]
pub enum TriggerRigError {
    /// Free-form message, mostly used for poisoned shared state.
    #[error("{0}")]
    Message(String),
    /// Caller supplied data the pipeline cannot work with.
    #[error("invalid input: {0}")]
    InvalidInput(&'static str),
    /// The host cannot provide the requested capability (capture API,
    /// device, permission).
    #[error("capability unavailable: {0}")]
    Capability(String),
    /// An audio asset could not be decoded.
    #[error("decode failed: {0}")]
    Decode(String),
    /// Wrapper around standard IO errors.
    #[error("{0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Json(#[from] serde_json::Error),
    #[error("fft failed: {0}")]
    Fft(#[from] realfft::FftError),
}

impl TriggerRigError {
    /// Creates a new error that simply wraps the provided message.
    pub fn msg<T: Into<String>>(msg: T) -> Self {
        Self::Message(msg.into())
    }

    pub fn capability<T: Into<String>>(msg: T) -> Self {
        Self::Capability(msg.into())
    }

    pub fn decode<T: Into<String>>(msg: T) -> Self {
        Self::Decode(msg.into())
    }
}

impl From<&str> for TriggerRigError {
    fn from(value: &str) -> Self {
        Self::msg(value)
    }
}

impl From<String> for TriggerRigError {
    fn from(value: String) -> Self {
        Self::Message(value)
    }
}

impl From<hound::Error> for TriggerRigError {
    fn from(value: hound::Error) -> Self {
        match value {
            hound::Error::IoError(err) => Self::Io(err),
            other => Self::Decode(other.to_string()),
        }
    }
}
