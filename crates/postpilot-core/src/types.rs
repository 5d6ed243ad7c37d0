use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::CoreError;

/// Unique identifier for a scheduled post (random UUID v4 string).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PostId(pub String);

impl PostId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Default for PostId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<String> for PostId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for PostId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Target platform tag (e.g. `"youtube"`, `"tiktok"`).
///
/// Tags are normalised to lowercase ASCII so `"YouTube"` and `"youtube"`
/// address the same publisher and the same slot timeline.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Platform(String);

impl Platform {
    pub fn new(tag: &str) -> Result<Self, CoreError> {
        let tag = tag.trim();
        if tag.is_empty() {
            return Err(CoreError::InvalidPlatform("platform tag is empty".to_string()));
        }
        if !tag
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(CoreError::InvalidPlatform(format!(
                "platform tag '{tag}' may only contain letters, digits, '_' and '-'"
            )));
        }
        Ok(Self(tag.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&self.0)
    }
}

impl std::str::FromStr for Platform {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Platform::new(s)
    }
}

impl TryFrom<String> for Platform {
    type Error = CoreError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Platform::new(&s)
    }
}

impl From<Platform> for String {
    fn from(p: Platform) -> Self {
        p.0
    }
}

/// Lifecycle state of a scheduled post.
///
/// ```text
/// pending ──► processing ──► completed
///    │  ▲          │
///    │  └──retry───┤
///    │             └──────► failed
///    └──(missed)──────────► failed
/// pending | processing ───► cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PostStatus {
    /// Waiting for its scheduled time (or for a retry on a later tick).
    Pending,
    /// Claimed by a publish attempt.
    Processing,
    /// Every target platform has a recorded result.
    Completed,
    /// Retries exhausted or grace period exceeded.
    Failed,
    /// Withdrawn by an operator.
    Cancelled,
}

impl PostStatus {
    pub const ALL: [PostStatus; 5] = [
        PostStatus::Pending,
        PostStatus::Processing,
        PostStatus::Completed,
        PostStatus::Failed,
        PostStatus::Cancelled,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PostStatus::Completed | PostStatus::Failed | PostStatus::Cancelled
        )
    }

    /// Whether the lifecycle allows moving from `self` to `next`.
    ///
    /// Terminal states have no outgoing edges here. Reviving a failed post
    /// is an explicit operator action handled by the store, not a transition.
    pub fn can_transition_to(self, next: PostStatus) -> bool {
        use PostStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Pending, Failed)
                | (Pending, Cancelled)
                | (Processing, Completed)
                | (Processing, Pending)
                | (Processing, Failed)
                | (Processing, Cancelled)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PostStatus::Pending => "pending",
            PostStatus::Processing => "processing",
            PostStatus::Completed => "completed",
            PostStatus::Failed => "failed",
            PostStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for PostStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl std::str::FromStr for PostStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(PostStatus::Pending),
            "processing" => Ok(PostStatus::Processing),
            "completed" => Ok(PostStatus::Completed),
            "failed" => Ok(PostStatus::Failed),
            "cancelled" => Ok(PostStatus::Cancelled),
            other => Err(CoreError::InvalidStatus(other.to_string())),
        }
    }
}
