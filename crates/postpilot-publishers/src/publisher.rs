use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use postpilot_core::{Platform, PostId};

use crate::error::PublishError;

/// Everything a platform adapter needs to publish one post to one platform.
///
/// `metadata` is passed through untouched; its shape is a contract between
/// the caption pipeline and the adapter, not something the engine reads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishRequest {
    pub post_id: PostId,
    pub platform: Platform,
    /// Reference to the prepared artifact (path, bucket key, URL …).
    pub media_locator: String,
    pub metadata: serde_json::Value,
    pub scheduled_time: DateTime<Utc>,
    /// Zero-based attempt number, equal to the post's retry count.
    pub attempt: u32,
}

/// Proof of a successful publication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishReceipt {
    /// Public URL of the published item.
    pub url: String,
    /// Identifier assigned by the platform.
    #[serde(alias = "id")]
    pub native_id: String,
}

/// Common interface implemented by every platform adapter.
///
/// Implementations must be `Send + Sync` so they can be shared between the
/// delivery daemon and operator-triggered publishes.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Platform tag this adapter publishes to. Used as the registry key.
    fn platform(&self) -> &Platform;

    /// Publish `req` and return the platform's receipt.
    ///
    /// Any failure (auth, rate limit, rejection, transport) is reported as a
    /// [`PublishError`]; the caller decides whether to retry.
    async fn publish(&self, req: &PublishRequest) -> Result<PublishReceipt, PublishError>;
}
