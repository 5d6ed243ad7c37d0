use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use futures_util::FutureExt;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use postpilot_core::{Platform, PostId, PostStatus, SchedulerConfig};
use postpilot_publishers::{PublishError, PublishReceipt, PublishRequest, PublisherRegistry};

use crate::{
    error::{Result, SchedulerError},
    store::PostStore,
    types::{PlatformResult, PostFilter, ScheduledPost, StatusUpdate, TimeWindow},
};

/// Error message stored on posts abandoned for lateness.
pub const MISSED_ERROR: &str = "missed: exceeded grace period";

/// Error recorded for a platform whose adapter panicked mid-call.
pub const PANIC_ERROR: &str = "publisher panicked";

/// How one pass of the publish routine left a post.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Every target platform has a recorded result.
    Completed,
    /// Some platforms failed and the retry budget allows another attempt.
    Requeued { failed: Vec<Platform> },
    /// Some platforms failed and the retry budget is spent.
    Failed { failed: Vec<Platform> },
    /// The post was cancelled while being processed.
    Cancelled,
    /// Another caller claimed or settled the post first.
    Skipped,
}

/// Counters for one daemon tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Stale claims taken back to `pending` before the pass.
    pub recovered: usize,
    pub due: usize,
    pub completed: usize,
    pub requeued: usize,
    pub failed: usize,
    pub missed: usize,
    pub cancelled: usize,
    pub skipped: usize,
}

impl TickReport {
    fn record(&mut self, outcome: &PublishOutcome) {
        match outcome {
            PublishOutcome::Completed => self.completed += 1,
            PublishOutcome::Requeued { .. } => self.requeued += 1,
            PublishOutcome::Failed { .. } => self.failed += 1,
            PublishOutcome::Cancelled => self.cancelled += 1,
            PublishOutcome::Skipped => self.skipped += 1,
        }
    }
}

/// The polling loop that turns due pending posts into published ones.
///
/// Holds only handles, so cloning is cheap; the control API keeps a clone to
/// run the same publish routine out of band. Every daemon has its own
/// claimant id; clones share it.
#[derive(Clone)]
pub struct DeliveryDaemon {
    store: PostStore,
    publishers: Arc<PublisherRegistry>,
    owner: Arc<str>,
    grace_period: Duration,
    claim_timeout: Duration,
    poll_interval: StdDuration,
    publish_timeout: Option<StdDuration>,
}

impl DeliveryDaemon {
    pub fn new(
        store: PostStore,
        publishers: Arc<PublisherRegistry>,
        config: &SchedulerConfig,
    ) -> Self {
        Self {
            store,
            publishers,
            owner: Arc::from(format!("daemon-{}", Uuid::new_v4())),
            grace_period: config.grace_period(),
            claim_timeout: config.claim_timeout(),
            poll_interval: config.poll_interval(),
            publish_timeout: config.publish_timeout(),
        }
    }

    pub fn store(&self) -> &PostStore {
        &self.store
    }

    /// Claimant id written on every post this daemon processes.
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Main event loop. Ticks every `poll_interval` until `shutdown`
    /// broadcasts `true`.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            owner = %self.owner,
            poll_interval_secs = self.poll_interval.as_secs(),
            platforms = ?self.publishers.platforms(),
            "delivery daemon started"
        );
        if let Err(e) = self.recover() {
            error!(error = %e, "crash recovery failed: {}", e.code());
        }

        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match AssertUnwindSafe(self.tick()).catch_unwind().await {
                        Ok(Ok(_)) => {}
                        Ok(Err(e)) => error!(code = e.code(), "delivery tick aborted: {e}"),
                        Err(_) => error!("delivery tick panicked"),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("delivery daemon shutting down");
                        break;
                    }
                }
            }
        }
    }

    pub fn recover(&self) -> Result<usize> {
        self.recover_at(Utc::now())
    }

    /// Requeue posts whose claim has not been refreshed for `claim_timeout`,
    /// i.e. posts left in `processing` by a process that died. Claims held by
    /// a live daemon are refreshed between platform calls and never qualify.
    pub fn recover_at(&self, now: DateTime<Utc>) -> Result<usize> {
        let ids = self
            .store
            .recover_interrupted(now - self.claim_timeout, now)?;
        if !ids.is_empty() {
            warn!(count = ids.len(), "stale processing claims returned to pending");
        }
        Ok(ids.len())
    }

    pub async fn tick(&self) -> Result<TickReport> {
        self.tick_at(Utc::now()).await
    }

    /// One pass over every pending post due at `now`, oldest first, after
    /// sweeping stale claims back to `pending`.
    ///
    /// A store failure aborts the pass and is returned; the post being
    /// processed is released first so the next pass picks it up. Publish
    /// failures are absorbed into post state.
    #[instrument(skip(self))]
    pub async fn tick_at(&self, now: DateTime<Utc>) -> Result<TickReport> {
        let recovered = self.recover_at(now)?;
        let due = self.store.list(
            &PostFilter::new()
                .status(PostStatus::Pending)
                .window(TimeWindow::until(now)),
        )?;
        let mut report = TickReport {
            recovered,
            due: due.len(),
            ..TickReport::default()
        };

        for post in due {
            if post.lateness(now) > self.grace_period {
                if self.mark_missed(&post, now)? {
                    report.missed += 1;
                } else {
                    report.skipped += 1;
                }
                continue;
            }
            match self.process_post_at(&post.id, now).await {
                Ok(outcome) => report.record(&outcome),
                Err(e) if e.is_store_failure() => return Err(e),
                Err(e) => {
                    error!(post_id = %post.id, code = e.code(), "post processing error: {e}");
                    report.skipped += 1;
                }
            }
        }

        if report.due > 0 {
            info!(
                recovered = report.recovered,
                due = report.due,
                completed = report.completed,
                requeued = report.requeued,
                failed = report.failed,
                missed = report.missed,
                "tick finished"
            );
        }
        Ok(report)
    }

    /// Pending → failed for a post past its grace period. No publisher is
    /// contacted. Returns false if the post changed under us.
    fn mark_missed(&self, post: &ScheduledPost, now: DateTime<Utc>) -> Result<bool> {
        let update = StatusUpdate::new().error(MISSED_ERROR).processed_at(now);
        match self
            .store
            .transition(&post.id, PostStatus::Pending, PostStatus::Failed, update, now)
        {
            Ok(_) => {
                warn!(
                    post_id = %post.id,
                    late_minutes = post.lateness(now).num_minutes(),
                    "post missed its grace period"
                );
                Ok(true)
            }
            Err(SchedulerError::Conflict { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub async fn process_post(&self, id: &PostId) -> Result<PublishOutcome> {
        self.process_post_at(id, Utc::now()).await
    }

    /// Claim a pending post and publish it to every platform that has no
    /// recorded result yet, then settle its status.
    ///
    /// Platforms are attempted independently: one failing does not stop the
    /// others. Before each call the claim is refreshed, which doubles as the
    /// cancellation check; an in-flight call is never aborted. If the store
    /// fails after the claim, the post is released back to `pending` with
    /// its retry budget untouched and the error is returned.
    #[instrument(skip(self), fields(post_id = %id))]
    pub async fn process_post_at(&self, id: &PostId, now: DateTime<Utc>) -> Result<PublishOutcome> {
        let post = match self.store.transition(
            id,
            PostStatus::Pending,
            PostStatus::Processing,
            StatusUpdate::new().claimed_by(&*self.owner),
            now,
        ) {
            Ok(post) => post,
            Err(SchedulerError::Conflict { found, .. }) => {
                debug!(%found, "post not pending; skipping");
                return Ok(PublishOutcome::Skipped);
            }
            Err(e) => return Err(e),
        };

        let started = tokio::time::Instant::now();
        match self.publish_claimed(&post, now, started).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                let at = elapsed_since(now, started);
                match self.store.release_claim(
                    id,
                    &self.owner,
                    &format!("released after error: {}", e.code()),
                    at,
                ) {
                    Ok(true) => warn!(code = e.code(), "processing aborted; post released"),
                    Ok(false) => debug!("claim already gone; nothing to release"),
                    Err(release) => error!(
                        code = release.code(),
                        "could not release claim; it will be recovered once stale: {release}"
                    ),
                }
                Err(e)
            }
        }
    }

    async fn publish_claimed(
        &self,
        post: &ScheduledPost,
        now: DateTime<Utc>,
        started: tokio::time::Instant,
    ) -> Result<PublishOutcome> {
        let id = &post.id;
        let mut failures: Vec<(Platform, String)> = Vec::new();
        for platform in post.pending_platforms() {
            let at = elapsed_since(now, started);
            if !self.store.refresh_claim(id, &self.owner, at)? {
                let status = self.store.get(id)?.status;
                if status == PostStatus::Cancelled {
                    info!(%platform, "post cancelled mid-processing; stopping");
                    return Ok(PublishOutcome::Cancelled);
                }
                warn!(%platform, %status, "claim lost mid-processing; stopping");
                return Ok(PublishOutcome::Skipped);
            }

            let req = post.publish_request(&platform);
            match self.publish_one(&req).await {
                Ok(receipt) => {
                    let result = PlatformResult::from_receipt(receipt, Utc::now());
                    self.store.record_platform_result(id, &platform, &result)?;
                }
                Err(e) => {
                    warn!(%platform, code = e.code(), attempt = req.attempt, "publish failed: {e}");
                    self.store.record_platform_failure(
                        id,
                        &platform,
                        &e.to_string(),
                        elapsed_since(now, started),
                    )?;
                    failures.push((platform, e.to_string()));
                }
            }
        }

        self.settle(post, failures, elapsed_since(now, started))
    }

    /// One adapter call. A timeout or a panic inside the adapter is an
    /// ordinary failed attempt.
    async fn publish_one(
        &self,
        req: &PublishRequest,
    ) -> std::result::Result<PublishReceipt, PublishError> {
        let call = AssertUnwindSafe(self.publishers.publish(req)).catch_unwind();
        let outcome = match self.publish_timeout {
            Some(limit) => match tokio::time::timeout(limit, call).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    return Err(PublishError::Timeout {
                        secs: limit.as_secs(),
                    })
                }
            },
            None => call.await,
        };
        outcome.unwrap_or_else(|_| {
            error!(platform = %req.platform, "publisher panicked");
            Err(PublishError::Unavailable(PANIC_ERROR.to_string()))
        })
    }

    /// Move a processing post to its post-attempt status.
    fn settle(
        &self,
        post: &ScheduledPost,
        failures: Vec<(Platform, String)>,
        at: DateTime<Utc>,
    ) -> Result<PublishOutcome> {
        let (to, update, outcome) = if failures.is_empty() {
            (
                PostStatus::Completed,
                StatusUpdate::new()
                    .processed_at(at)
                    .note("all platforms published"),
                PublishOutcome::Completed,
            )
        } else {
            let message = failures
                .iter()
                .map(|(p, e)| format!("{p}: {e}"))
                .collect::<Vec<_>>()
                .join("; ");
            let failed: Vec<Platform> = failures.into_iter().map(|(p, _)| p).collect();
            if post.retry_count < post.max_retries {
                (
                    PostStatus::Pending,
                    StatusUpdate::new().error(message).retry_increment(),
                    PublishOutcome::Requeued { failed },
                )
            } else {
                (
                    PostStatus::Failed,
                    StatusUpdate::new().error(message).processed_at(at),
                    PublishOutcome::Failed { failed },
                )
            }
        };

        match self
            .store
            .transition(&post.id, PostStatus::Processing, to, update, at)
        {
            Ok(settled) => {
                match &outcome {
                    PublishOutcome::Completed => info!(post_id = %post.id, "post completed"),
                    PublishOutcome::Requeued { failed } => info!(
                        post_id = %post.id,
                        retry_count = settled.retry_count,
                        max_retries = settled.max_retries,
                        failed = failed.len(),
                        "post requeued for retry"
                    ),
                    _ => warn!(post_id = %post.id, "post failed: retries exhausted"),
                }
                Ok(outcome)
            }
            Err(SchedulerError::Conflict {
                found: PostStatus::Cancelled,
                ..
            }) => {
                info!(post_id = %post.id, "post cancelled during publish; results kept");
                Ok(PublishOutcome::Cancelled)
            }
            Err(SchedulerError::Conflict { found, .. }) => {
                warn!(post_id = %post.id, %found, "post changed during publish");
                Ok(PublishOutcome::Skipped)
            }
            Err(e) => Err(e),
        }
    }
}

/// The fixed `now` of a pass, advanced by the real time spent in it.
fn elapsed_since(now: DateTime<Utc>, started: tokio::time::Instant) -> DateTime<Utc> {
    now + Duration::from_std(started.elapsed()).unwrap_or_else(|_| Duration::zero())
}

impl std::fmt::Debug for DeliveryDaemon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryDaemon")
            .field("owner", &self.owner)
            .field("grace_period", &self.grace_period)
            .field("claim_timeout", &self.claim_timeout)
            .field("poll_interval", &self.poll_interval)
            .field("publish_timeout", &self.publish_timeout)
            .field("publishers", &self.publishers)
            .finish_non_exhaustive()
    }
}
