use std::collections::HashMap;
use std::sync::Arc;

use tracing::{info, warn};

use postpilot_core::Platform;

use crate::{
    error::PublishError,
    publisher::{PublishReceipt, PublishRequest, Publisher},
};

/// Lookup of platform adapters keyed by platform tag.
///
/// Adapters are resolved at publish time, so a post targeting a platform with
/// no registered adapter fails that platform's attempt instead of the post
/// being rejected up front.
#[derive(Default, Clone)]
pub struct PublisherRegistry {
    publishers: HashMap<Platform, Arc<dyn Publisher>>,
}

impl PublisherRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            publishers: HashMap::new(),
        }
    }

    /// Register an adapter under its [`Publisher::platform`] tag.
    ///
    /// If an adapter for the same platform is already registered it is replaced.
    pub fn register(&mut self, publisher: Arc<dyn Publisher>) {
        let platform = publisher.platform().clone();
        info!(%platform, "registering publisher");
        if self.publishers.insert(platform.clone(), publisher).is_some() {
            warn!(%platform, "replaced previously registered publisher");
        }
    }

    pub fn get(&self, platform: &Platform) -> Option<Arc<dyn Publisher>> {
        self.publishers.get(platform).cloned()
    }

    pub fn contains(&self, platform: &Platform) -> bool {
        self.publishers.contains_key(platform)
    }

    /// Registered platform tags, sorted for deterministic output.
    pub fn platforms(&self) -> Vec<Platform> {
        let mut platforms: Vec<Platform> = self.publishers.keys().cloned().collect();
        platforms.sort();
        platforms
    }

    pub fn is_empty(&self) -> bool {
        self.publishers.is_empty()
    }

    /// Resolve the adapter for `req.platform` and publish through it.
    pub async fn publish(&self, req: &PublishRequest) -> Result<PublishReceipt, PublishError> {
        let publisher = self
            .get(&req.platform)
            .ok_or_else(|| PublishError::NotRegistered {
                platform: req.platform.to_string(),
            })?;
        publisher.publish(req).await
    }
}

impl std::fmt::Debug for PublisherRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublisherRegistry")
            .field("platforms", &self.platforms())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use postpilot_core::PostId;

    struct Echo {
        platform: Platform,
    }

    #[async_trait]
    impl Publisher for Echo {
        fn platform(&self) -> &Platform {
            &self.platform
        }
        async fn publish(&self, req: &PublishRequest) -> Result<PublishReceipt, PublishError> {
            Ok(PublishReceipt {
                url: format!("https://{}/{}", self.platform, req.post_id),
                native_id: req.post_id.to_string(),
            })
        }
    }

    fn request(platform: &str) -> PublishRequest {
        PublishRequest {
            post_id: PostId::from("p-1"),
            platform: Platform::new(platform).unwrap(),
            media_locator: "media/clip.mp4".to_string(),
            metadata: serde_json::json!({"title": "hello"}),
            scheduled_time: Utc::now(),
            attempt: 0,
        }
    }

    #[tokio::test]
    async fn publish_routes_to_registered_adapter() {
        let mut registry = PublisherRegistry::new();
        registry.register(Arc::new(Echo {
            platform: Platform::new("youtube").unwrap(),
        }));

        let receipt = registry.publish(&request("youtube")).await.unwrap();
        assert_eq!(receipt.url, "https://youtube/p-1");
        assert_eq!(registry.platforms(), vec![Platform::new("youtube").unwrap()]);
    }

    #[tokio::test]
    async fn unknown_platform_is_a_publish_error() {
        let registry = PublisherRegistry::new();
        let err = registry.publish(&request("tiktok")).await.unwrap_err();
        assert!(matches!(err, PublishError::NotRegistered { ref platform } if platform == "tiktok"));
    }
}
