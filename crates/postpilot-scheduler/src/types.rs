use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use postpilot_core::{Platform, PostId, PostStatus};
use postpilot_publishers::{PublishReceipt, PublishRequest};

/// Outcome recorded for a platform once it has published successfully.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformResult {
    pub published_url: String,
    pub platform_native_id: String,
    pub published_at: DateTime<Utc>,
}

impl PlatformResult {
    pub fn from_receipt(receipt: PublishReceipt, published_at: DateTime<Utc>) -> Self {
        Self {
            published_url: receipt.url,
            platform_native_id: receipt.native_id,
            published_at,
        }
    }
}

/// A persisted post record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledPost {
    pub id: PostId,
    /// Reference to the prepared artifact; the engine never touches the bytes.
    pub media_locator: String,
    /// Title/caption/hashtags, passed through to publishers unmodified.
    pub metadata: serde_json::Value,
    /// Ordered, duplicate-free target platforms.
    pub platforms: Vec<Platform>,
    pub scheduled_time: DateTime<Utc>,
    pub status: PostStatus,
    pub error_message: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    /// Filled in per platform as each one succeeds.
    pub platform_results: BTreeMap<Platform, PlatformResult>,
}

impl ScheduledPost {
    /// Target platforms that have no recorded result yet, in target order.
    pub fn pending_platforms(&self) -> Vec<Platform> {
        self.platforms
            .iter()
            .filter(|p| !self.platform_results.contains_key(*p))
            .cloned()
            .collect()
    }

    /// Time left until `scheduled_time`; negative once the post is due.
    pub fn countdown(&self, now: DateTime<Utc>) -> Duration {
        self.scheduled_time - now
    }

    /// How late the post is at `now` (zero if not yet due).
    pub fn lateness(&self, now: DateTime<Utc>) -> Duration {
        (now - self.scheduled_time).max(Duration::zero())
    }

    /// A failed post that still has platforms left to publish.
    pub fn is_retriable(&self) -> bool {
        self.status == PostStatus::Failed && !self.pending_platforms().is_empty()
    }

    /// Some but not all platforms have published.
    pub fn is_partial(&self) -> bool {
        !self.platform_results.is_empty() && self.platform_results.len() < self.platforms.len()
    }

    pub fn publish_request(&self, platform: &Platform) -> PublishRequest {
        PublishRequest {
            post_id: self.id.clone(),
            platform: platform.clone(),
            media_locator: self.media_locator.clone(),
            metadata: self.metadata.clone(),
            scheduled_time: self.scheduled_time,
            attempt: self.retry_count,
        }
    }
}

/// A submission from the media pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewPost {
    pub media_locator: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub platforms: Vec<Platform>,
    /// When absent the slot allocator picks the time.
    #[serde(default)]
    pub scheduled_time: Option<DateTime<Utc>>,
}

impl NewPost {
    pub fn new(media_locator: impl Into<String>, platforms: Vec<Platform>) -> Self {
        Self {
            media_locator: media_locator.into(),
            metadata: serde_json::Value::Null,
            platforms,
            scheduled_time: None,
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn at(mut self, scheduled_time: DateTime<Utc>) -> Self {
        self.scheduled_time = Some(scheduled_time);
        self
    }
}

/// Inclusive time range; an open end is unbounded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl TimeWindow {
    pub fn between(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            start: Some(start),
            end: Some(end),
        }
    }

    pub fn until(end: DateTime<Utc>) -> Self {
        Self {
            start: None,
            end: Some(end),
        }
    }

    pub fn starting(start: DateTime<Utc>) -> Self {
        Self {
            start: Some(start),
            end: None,
        }
    }

    pub fn contains(&self, t: DateTime<Utc>) -> bool {
        self.start.map_or(true, |s| t >= s) && self.end.map_or(true, |e| t <= e)
    }
}

/// Criteria for [`PostStore::list`](crate::store::PostStore::list).
#[derive(Debug, Clone, Default)]
pub struct PostFilter {
    pub statuses: Vec<PostStatus>,
    pub platform: Option<Platform>,
    pub window: Option<TimeWindow>,
}

impl PostFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict to `status`. May be called repeatedly to accept several.
    pub fn status(mut self, status: PostStatus) -> Self {
        self.statuses.push(status);
        self
    }

    pub fn platform(mut self, platform: Platform) -> Self {
        self.platform = Some(platform);
        self
    }

    pub fn window(mut self, window: TimeWindow) -> Self {
        self.window = Some(window);
        self
    }

    pub fn matches(&self, post: &ScheduledPost) -> bool {
        (self.statuses.is_empty() || self.statuses.contains(&post.status))
            && self
                .platform
                .as_ref()
                .map_or(true, |p| post.platforms.contains(p))
            && self
                .window
                .map_or(true, |w| w.contains(post.scheduled_time))
    }
}

/// Extra column changes applied together with a status transition.
#[derive(Debug, Clone, Default)]
pub struct StatusUpdate {
    /// Replaces `error_message` when set; otherwise the previous value stays.
    pub error: Option<String>,
    /// Bump `retry_count` by one (capped at `max_retries`).
    pub retry_increment: bool,
    pub processed_at: Option<DateTime<Utc>>,
    /// Free-form note for the audit log.
    pub note: Option<String>,
    /// Claimant recorded when the target is `processing`.
    pub claimed_by: Option<String>,
}

impl StatusUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn retry_increment(mut self) -> Self {
        self.retry_increment = true;
        self
    }

    pub fn processed_at(mut self, at: DateTime<Utc>) -> Self {
        self.processed_at = Some(at);
        self
    }

    pub fn note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }

    pub fn claimed_by(mut self, owner: impl Into<String>) -> Self {
        self.claimed_by = Some(owner.into());
        self
    }
}

/// Who holds a `processing` post and when they last showed signs of life.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claim {
    /// `None` when the post was claimed without naming a claimant.
    pub owner: Option<String>,
    pub refreshed_at: DateTime<Utc>,
}

/// The pending and processing posts a new slot has to keep clear of, read
/// inside the same write transaction that inserts the new posts.
#[derive(Debug, Clone, Default)]
pub struct Commitments {
    entries: Vec<(PostId, Vec<Platform>, DateTime<Utc>)>,
}

impl Commitments {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, id: PostId, platforms: Vec<Platform>, at: DateTime<Utc>) {
        self.entries.push((id, platforms, at));
    }

    /// Latest committed instant on `platform`.
    pub fn latest(&self, platform: &Platform) -> Option<DateTime<Utc>> {
        self.on(platform).map(|(_, at)| at).max()
    }

    /// The commitment on `platform` closest to `at`.
    pub fn nearest(&self, platform: &Platform, at: DateTime<Utc>) -> Option<(&PostId, DateTime<Utc>)> {
        self.on(platform).min_by_key(|(_, t)| (*t - at).abs())
    }

    fn on<'a, 'p>(
        &'a self,
        platform: &'p Platform,
    ) -> impl Iterator<Item = (&'a PostId, DateTime<Utc>)> + 'p
    where
        'a: 'p,
    {
        self.entries
            .iter()
            .filter(move |(_, platforms, _)| platforms.contains(platform))
            .map(|(id, _, at)| (id, *at))
    }
}

/// A platform-scoped failure, keyed by (post, platform).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureEntry {
    pub post_id: PostId,
    pub platform: Platform,
    pub error: String,
    pub attempts: u32,
    pub first_failed_at: DateTime<Utc>,
    pub last_failed_at: DateTime<Utc>,
}

/// One row of a post's audit history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostEvent {
    pub post_id: PostId,
    /// `None` for the creation event.
    pub from_status: Option<PostStatus>,
    pub to_status: PostStatus,
    pub note: Option<String>,
    pub at: DateTime<Utc>,
}
