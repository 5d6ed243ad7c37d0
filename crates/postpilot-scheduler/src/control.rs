use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use postpilot_core::{Platform, PostId, PostStatus};

use crate::{
    daemon::{DeliveryDaemon, PublishOutcome},
    error::{Result, SchedulerError},
    slots::SlotAllocator,
    store::PostStore,
    types::{FailureEntry, PostEvent, PostFilter, ScheduledPost, StatusUpdate, TimeWindow},
};

/// Attempts a cancel makes when racing the daemon before giving up.
const CANCEL_ATTEMPTS: usize = 3;

/// A non-terminal post as shown on the upcoming list.
#[derive(Debug, Clone)]
pub struct UpcomingPost {
    pub post: ScheduledPost,
    /// `scheduled_time - now`; negative when overdue.
    pub countdown: Duration,
    /// `scheduled_time` rounded up to the whole hour for display.
    pub display_slot: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PostDetail {
    pub post: ScheduledPost,
    pub failures: Vec<FailureEntry>,
    pub history: Vec<PostEvent>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailedPost {
    pub post: ScheduledPost,
    /// At least one target platform has not published yet.
    pub retriable: bool,
    pub failures: Vec<FailureEntry>,
}

/// Operator actions that change lifecycle state outside the timer path.
///
/// Publishing goes through the daemon's own routine, so the store's
/// compare-and-transition arbitrates between an operator and a running tick.
#[derive(Debug, Clone)]
pub struct ControlApi {
    store: PostStore,
    daemon: DeliveryDaemon,
}

impl ControlApi {
    pub fn new(daemon: DeliveryDaemon) -> Self {
        Self {
            store: daemon.store().clone(),
            daemon,
        }
    }

    /// Publish a pending post immediately and wait for the result.
    #[instrument(skip(self), fields(post_id = %id))]
    pub async fn force_publish_now(&self, id: &PostId) -> Result<ScheduledPost> {
        let now = Utc::now();
        require_status(&self.store.get(id)?, PostStatus::Pending, "publish now")?;
        self.store
            .set_scheduled_time(id, now, now)
            .map_err(|e| conflict_as_invalid_state(e, "publish now"))?;

        let outcome = self.daemon.process_post_at(id, now).await?;
        info!(?outcome, "forced publish finished");
        self.store.get(id)
    }

    /// Withdraw a post. Cancelling a post that is already terminal returns
    /// it unchanged.
    #[instrument(skip(self), fields(post_id = %id))]
    pub fn cancel(&self, id: &PostId) -> Result<ScheduledPost> {
        let mut last_err = None;
        for _ in 0..CANCEL_ATTEMPTS {
            let post = self.store.get(id)?;
            if post.status.is_terminal() {
                debug!(status = %post.status, "cancel is a no-op on a terminal post");
                return Ok(post);
            }
            let now = Utc::now();
            let update = StatusUpdate::new()
                .processed_at(now)
                .note("cancelled by operator");
            match self
                .store
                .transition(id, post.status, PostStatus::Cancelled, update, now)
            {
                Ok(cancelled) => {
                    info!(from = %post.status, "post cancelled");
                    return Ok(cancelled);
                }
                Err(e @ SchedulerError::Conflict { .. }) => last_err = Some(e),
                Err(e) => return Err(e),
            }
        }
        match last_err {
            Some(e) => Err(e),
            None => self.store.get(id),
        }
    }

    pub fn reschedule(&self, id: &PostId, new_time: DateTime<Utc>) -> Result<ScheduledPost> {
        self.reschedule_at(id, new_time, Utc::now())
    }

    /// Move a pending post to `new_time` and restore its full retry budget.
    #[instrument(skip(self), fields(post_id = %id))]
    pub fn reschedule_at(
        &self,
        id: &PostId,
        new_time: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<ScheduledPost> {
        if new_time <= now {
            return Err(SchedulerError::Validation(format!(
                "cannot reschedule to {new_time}: not in the future"
            )));
        }
        require_status(&self.store.get(id)?, PostStatus::Pending, "reschedule")?;
        let post = self
            .store
            .reschedule(id, new_time, now)
            .map_err(|e| conflict_as_invalid_state(e, "reschedule"))?;
        info!(scheduled_time = %new_time, "post rescheduled");
        Ok(post)
    }

    pub fn upcoming(&self, window: TimeWindow) -> Result<Vec<UpcomingPost>> {
        self.upcoming_at(window, Utc::now())
    }

    /// Pending and processing posts scheduled inside `window`, soonest first.
    pub fn upcoming_at(&self, window: TimeWindow, now: DateTime<Utc>) -> Result<Vec<UpcomingPost>> {
        let posts = self.store.list(
            &PostFilter::new()
                .status(PostStatus::Pending)
                .status(PostStatus::Processing)
                .window(window),
        )?;
        Ok(posts
            .into_iter()
            .map(|post| UpcomingPost {
                countdown: post.countdown(now),
                display_slot: SlotAllocator::present_slot(post.scheduled_time),
                post,
            })
            .collect())
    }

    pub fn detail(&self, id: &PostId) -> Result<PostDetail> {
        Ok(PostDetail {
            post: self.store.get(id)?,
            failures: self.store.failures_for(id)?,
            history: self.store.history(id)?,
        })
    }

    pub fn failed_posts(&self) -> Result<Vec<FailedPost>> {
        let posts = self
            .store
            .list(&PostFilter::new().status(PostStatus::Failed))?;
        posts
            .into_iter()
            .map(|post| {
                Ok(FailedPost {
                    retriable: post.is_retriable(),
                    failures: self.store.failures_for(&post.id)?,
                    post,
                })
            })
            .collect()
    }

    /// Revive a failed post and publish it now to the platforms that have
    /// not succeeded yet.
    #[instrument(skip(self), fields(post_id = %id))]
    pub async fn retry(&self, id: &PostId) -> Result<ScheduledPost> {
        let now = Utc::now();
        require_status(&self.store.get(id)?, PostStatus::Failed, "retry")?;
        self.store
            .revive_failed(id, now, now)
            .map_err(|e| conflict_as_invalid_state(e, "retry"))?;
        let outcome = self.daemon.process_post_at(id, now).await?;
        info!(?outcome, "retry finished");
        self.store.get(id)
    }

    /// Retry every failed post that has recorded platform failures.
    ///
    /// Posts abandoned for lateness have none and are left for an explicit
    /// [`retry`](Self::retry). One post's error does not stop the others.
    pub async fn retry_all(&self) -> Result<Vec<(PostId, PublishOutcome)>> {
        let mut results = Vec::new();
        for failed in self.failed_posts()? {
            if failed.failures.is_empty() || !failed.retriable {
                continue;
            }
            let id = failed.post.id;
            let now = Utc::now();
            match self.store.revive_failed(&id, now, now) {
                Ok(_) => {}
                Err(SchedulerError::Conflict { .. }) => continue,
                Err(e) => return Err(e),
            }
            match self.daemon.process_post_at(&id, now).await {
                Ok(outcome) => results.push((id, outcome)),
                Err(e) if e.is_store_failure() => return Err(e),
                Err(e) => warn!(post_id = %id, code = e.code(), "retry failed: {e}"),
            }
        }
        info!(count = results.len(), "retry-all finished");
        Ok(results)
    }

    /// Forget one platform's failure entry without touching the post.
    pub fn dismiss_failure(&self, id: &PostId, platform: &Platform) -> Result<bool> {
        self.store.remove_failure(id, platform)
    }
}

fn require_status(post: &ScheduledPost, expected: PostStatus, action: &'static str) -> Result<()> {
    if post.status == expected {
        Ok(())
    } else {
        Err(SchedulerError::InvalidState {
            id: post.id.to_string(),
            status: post.status,
            action,
        })
    }
}

/// A lost compare-and-transition reads better to an operator as "the post
/// is now in state X".
fn conflict_as_invalid_state(e: SchedulerError, action: &'static str) -> SchedulerError {
    match e {
        SchedulerError::Conflict { id, found, .. } => SchedulerError::InvalidState {
            id,
            status: found,
            action,
        },
        other => other,
    }
}
