use std::collections::HashMap;

use postpilot_core::Platform;

use crate::error::PublishError;

/// Supplies a valid, already-refreshed credential for a platform at publish time.
///
/// Token acquisition and refresh live outside this engine; implementations
/// only hand over whatever the credential collaborator currently holds.
pub trait CredentialSource: Send + Sync {
    fn credential(&self, platform: &Platform) -> Result<String, PublishError>;
}

/// Reads `POSTPILOT_TOKEN_<PLATFORM>` from the environment on every call, so
/// a token rotated by an external refresher is picked up without a restart.
#[derive(Debug, Clone, Default)]
pub struct EnvCredentials;

impl EnvCredentials {
    pub fn var_name(platform: &Platform) -> String {
        format!(
            "POSTPILOT_TOKEN_{}",
            platform.as_str().to_ascii_uppercase().replace('-', "_")
        )
    }
}

impl CredentialSource for EnvCredentials {
    fn credential(&self, platform: &Platform) -> Result<String, PublishError> {
        let var = Self::var_name(platform);
        match std::env::var(&var) {
            Ok(token) if !token.trim().is_empty() => Ok(token),
            _ => Err(PublishError::Auth(format!("no credential available ({var} is unset)"))),
        }
    }
}

/// Fixed in-memory credentials.
#[derive(Debug, Clone, Default)]
pub struct StaticCredentials {
    tokens: HashMap<Platform, String>,
}

impl StaticCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, platform: Platform, token: impl Into<String>) -> Self {
        self.tokens.insert(platform, token.into());
        self
    }
}

impl CredentialSource for StaticCredentials {
    fn credential(&self, platform: &Platform) -> Result<String, PublishError> {
        self.tokens
            .get(platform)
            .cloned()
            .ok_or_else(|| PublishError::Auth(format!("no credential for platform '{platform}'")))
    }
}
