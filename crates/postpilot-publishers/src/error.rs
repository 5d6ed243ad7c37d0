use thiserror::Error;

/// Why a single publish attempt against one platform failed.
///
/// The delivery daemon treats every variant the same way (the attempt
/// failed, maybe retry); the distinction only feeds diagnostics.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Rate limited{}", retry_hint(.retry_after_secs))]
    RateLimited { retry_after_secs: Option<u64> },

    #[error("Content rejected: {0}")]
    Rejected(String),

    #[error("Publisher unavailable: {0}")]
    Unavailable(String),

    #[error("No publisher registered for platform '{platform}'")]
    NotRegistered { platform: String },

    #[error("Publish timed out after {secs}s")]
    Timeout { secs: u64 },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl PublishError {
    /// Short error code recorded next to the platform failure entry.
    pub fn code(&self) -> &'static str {
        match self {
            PublishError::Http(_) => "HTTP_ERROR",
            PublishError::Api { .. } => "API_ERROR",
            PublishError::Auth(_) => "AUTH_FAILED",
            PublishError::RateLimited { .. } => "RATE_LIMITED",
            PublishError::Rejected(_) => "CONTENT_REJECTED",
            PublishError::Unavailable(_) => "UNAVAILABLE",
            PublishError::NotRegistered { .. } => "NOT_REGISTERED",
            PublishError::Timeout { .. } => "TIMEOUT",
            PublishError::Parse(_) => "PARSE_ERROR",
            PublishError::Config(_) => "CONFIG_ERROR",
        }
    }
}

fn retry_hint(retry_after_secs: &Option<u64>) -> String {
    retry_after_secs
        .map(|s| format!(", retry after {s}s"))
        .unwrap_or_default()
}

pub type Result<T> = std::result::Result<T, PublishError>;
