use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid platform: {0}")]
    InvalidPlatform(String),

    #[error("Unknown post status: {0}")]
    InvalidStatus(String),
}

impl CoreError {
    /// Short error code string for CLI and log output.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::Config(_) => "CONFIG_ERROR",
            CoreError::InvalidPlatform(_) => "INVALID_PLATFORM",
            CoreError::InvalidStatus(_) => "INVALID_STATUS",
        }
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
