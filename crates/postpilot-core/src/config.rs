use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

pub const DEFAULT_SPACING_HOURS: f64 = 1.0;
pub const DEFAULT_POST_TIME_OFFSET_HOURS: f64 = 1.0;
pub const DEFAULT_GRACE_PERIOD_MINUTES: u64 = 60;
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_CLAIM_TIMEOUT_MINUTES: u64 = 30;

/// Upper bound for the hour-valued settings (ten years).
pub const MAX_HOURS: f64 = 87_600.0;
/// Upper bound for the minute- and second-valued settings (ten years).
pub const MAX_MINUTES: u64 = 5_256_000;
pub const MAX_SECONDS: u64 = MAX_MINUTES * 60;

/// Top-level config (postpilot.toml + POSTPILOT_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PostpilotConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub publishers: PublishersConfig,
}

/// Scheduling and delivery policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// When false, submissions must carry an explicit `scheduled_time`;
    /// callers wanting immediate posting bypass the engine entirely.
    #[serde(default = "bool_true")]
    pub auto_schedule: bool,
    /// Minimum gap between two posts on the same platform.
    #[serde(default = "default_spacing_hours")]
    pub schedule_spacing_hours: f64,
    /// Hours added to the next whole hour for the first slot on an idle platform.
    #[serde(default = "default_post_time_offset")]
    pub default_post_time_offset: f64,
    /// Maximum tolerated lateness before a due post is abandoned.
    #[serde(default = "default_grace_period_minutes")]
    pub grace_period_minutes: u64,
    /// Per-post retry budget shared by all of its platforms.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Delivery daemon tick rate.
    #[serde(default = "default_poll_interval_seconds")]
    pub poll_interval_seconds: u64,
    /// Optional per-platform publish call deadline. Unset means no deadline.
    #[serde(default)]
    pub publish_timeout_seconds: Option<u64>,
    /// A `processing` claim not refreshed for this long is presumed
    /// abandoned by a dead process and may be taken back to `pending`.
    #[serde(default = "default_claim_timeout_minutes")]
    pub claim_timeout_minutes: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            auto_schedule: true,
            schedule_spacing_hours: DEFAULT_SPACING_HOURS,
            default_post_time_offset: DEFAULT_POST_TIME_OFFSET_HOURS,
            grace_period_minutes: DEFAULT_GRACE_PERIOD_MINUTES,
            max_retries: DEFAULT_MAX_RETRIES,
            poll_interval_seconds: DEFAULT_POLL_INTERVAL_SECS,
            publish_timeout_seconds: None,
            claim_timeout_minutes: DEFAULT_CLAIM_TIMEOUT_MINUTES,
        }
    }
}

impl SchedulerConfig {
    pub fn spacing(&self) -> chrono::Duration {
        hours_to_duration(self.schedule_spacing_hours)
    }

    pub fn post_time_offset(&self) -> chrono::Duration {
        hours_to_duration(self.default_post_time_offset)
    }

    pub fn grace_period(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.grace_period_minutes as i64)
    }

    pub fn poll_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.poll_interval_seconds)
    }

    pub fn publish_timeout(&self) -> Option<std::time::Duration> {
        self.publish_timeout_seconds
            .map(std::time::Duration::from_secs)
    }

    pub fn claim_timeout(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.claim_timeout_minutes as i64)
    }

    /// Reject values that would break slot allocation, spin the daemon or
    /// overflow the duration accessors above.
    pub fn validate(&self) -> Result<()> {
        let spacing = self.schedule_spacing_hours;
        if !spacing.is_finite() || spacing <= 0.0 || spacing > MAX_HOURS {
            return Err(CoreError::Config(format!(
                "schedule_spacing_hours must be in (0, {MAX_HOURS}], got {spacing}"
            )));
        }
        let offset = self.default_post_time_offset;
        if !offset.is_finite() || !(0.0..=MAX_HOURS).contains(&offset) {
            return Err(CoreError::Config(format!(
                "default_post_time_offset must be in [0, {MAX_HOURS}], got {offset}"
            )));
        }
        if self.grace_period_minutes > MAX_MINUTES {
            return Err(CoreError::Config(format!(
                "grace_period_minutes must be at most {MAX_MINUTES}, got {}",
                self.grace_period_minutes
            )));
        }
        if self.claim_timeout_minutes == 0 || self.claim_timeout_minutes > MAX_MINUTES {
            return Err(CoreError::Config(format!(
                "claim_timeout_minutes must be in [1, {MAX_MINUTES}], got {}",
                self.claim_timeout_minutes
            )));
        }
        if self.poll_interval_seconds == 0 || self.poll_interval_seconds > MAX_SECONDS {
            return Err(CoreError::Config(format!(
                "poll_interval_seconds must be in [1, {MAX_SECONDS}], got {}",
                self.poll_interval_seconds
            )));
        }
        if let Some(secs) = self.publish_timeout_seconds {
            if secs == 0 || secs > MAX_SECONDS {
                return Err(CoreError::Config(format!(
                    "publish_timeout_seconds must be in [1, {MAX_SECONDS}] when set, got {secs}"
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PublishersConfig {
    /// HTTP relay adapters, one per platform.
    #[serde(default)]
    pub webhooks: Vec<WebhookPublisherConfig>,
}

/// How an outbound publish request is authenticated against the relay.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum WebhookAuthMode {
    /// HMAC-SHA256 over the raw request body in `X-Postpilot-Signature`.
    HmacSha256,
    /// Platform credential as `Authorization: Bearer <token>`.
    #[default]
    BearerToken,
    /// No authentication. Use only for internal/trusted networks.
    None,
}

/// A platform whose posts are relayed to an HTTP endpoint that speaks the
/// platform's own API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookPublisherConfig {
    /// Platform tag this endpoint publishes to (e.g. "youtube").
    pub platform: String,
    /// Endpoint receiving the JSON publish envelope.
    pub url: String,
    #[serde(default)]
    pub auth_mode: WebhookAuthMode,
    /// Signing key for `hmac-sha256` mode.
    pub signing_secret: Option<String>,
}

fn bool_true() -> bool {
    true
}
fn default_spacing_hours() -> f64 {
    DEFAULT_SPACING_HOURS
}
fn default_post_time_offset() -> f64 {
    DEFAULT_POST_TIME_OFFSET_HOURS
}
fn default_grace_period_minutes() -> u64 {
    DEFAULT_GRACE_PERIOD_MINUTES
}
fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}
fn default_poll_interval_seconds() -> u64 {
    DEFAULT_POLL_INTERVAL_SECS
}
fn default_claim_timeout_minutes() -> u64 {
    DEFAULT_CLAIM_TIMEOUT_MINUTES
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.postpilot/postpilot.db", home)
}

fn hours_to_duration(hours: f64) -> chrono::Duration {
    chrono::Duration::seconds((hours * 3600.0).round() as i64)
}

impl PostpilotConfig {
    /// Load config from a TOML file with POSTPILOT_* env var overrides.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. ~/.postpilot/postpilot.toml
    ///
    /// Nested keys use a double underscore, e.g.
    /// `POSTPILOT_SCHEDULER__GRACE_PERIOD_MINUTES=30`.
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        Self::from_figment(
            Figment::new()
                .merge(Toml::file(&path))
                .merge(Env::prefixed("POSTPILOT_").split("__")),
        )
    }

    /// Extract and validate a config from an already-assembled figment.
    pub fn from_figment(figment: Figment) -> Result<Self> {
        let config: PostpilotConfig = figment
            .extract()
            .map_err(|e| CoreError::Config(e.to_string()))?;
        config.scheduler.validate()?;
        Ok(config)
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.postpilot/postpilot.toml", home)
}
