use thiserror::Error;

pub type Result<T> = std::result::Result<T, TrainingError>;

#[derive(Error, Debug)]
pub enum TrainingError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    ConfigFormat(String),

    #[error("invalid configuration: {}", .0.join("; "))]
    Validation(Vec<String>),

    /// Misconfiguration detected while running, e.g. a batch that cannot be
    /// split into `accum_freq` chunks or an unknown precision mode.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("trainer initialization failed: {0}")]
    Initialization(String),

    #[error("training failed: {0}")]
    Runtime(String),

    #[error("collective operation failed: {0}")]
    Collective(String),
}

impl TrainingError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub fn initialization(message: impl Into<String>) -> Self {
        Self::Initialization(message.into())
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime(message.into())
    }

    pub fn validation(messages: Vec<String>) -> Self {
        Self::Validation(messages)
    }

    pub fn collective(message: impl Into<String>) -> Self {
        Self::Collective(message.into())
    }

    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration(_) | Self::Validation(_))
    }
}

impl From<toml::de::Error> for TrainingError {
    fn from(value: toml::de::Error) -> Self {
        TrainingError::ConfigFormat(value.to_string())
    }
}

impl From<serde_json::Error> for TrainingError {
    fn from(value: serde_json::Error) -> Self {
        TrainingError::ConfigFormat(value.to_string())
    }
}

impl From<candle_core::Error> for TrainingError {
    fn from(value: candle_core::Error) -> Self {
        TrainingError::Runtime(value.to_string())
    }
}
