use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use tracing::{info, instrument, warn};

use postpilot_core::{Platform, PostId, PostStatus, SchedulerConfig};

use crate::{
    error::{Result, SchedulerError},
    slots::SlotAllocator,
    store::PostStore,
    types::{Commitments, NewPost, ScheduledPost},
};

/// Entry point for the media pipeline: validates a request, assigns a slot
/// when none is given and writes a pending record.
///
/// Slot choice and insert happen in one store transaction, so concurrent
/// submitters never land two posts on the same (platform, instant).
#[derive(Debug, Clone)]
pub struct Submitter {
    store: PostStore,
    slots: SlotAllocator,
    auto_schedule: bool,
    max_retries: u32,
}

impl Submitter {
    pub fn new(store: PostStore, slots: SlotAllocator, config: &SchedulerConfig) -> Self {
        Self {
            store,
            slots,
            auto_schedule: config.auto_schedule,
            max_retries: config.max_retries,
        }
    }

    pub fn submit(&self, req: NewPost) -> Result<ScheduledPost> {
        self.submit_at(req, Utc::now())
    }

    /// [`submit`](Self::submit) against an explicit clock.
    #[instrument(skip(self, req), fields(media = %req.media_locator))]
    pub fn submit_at(&self, req: NewPost, now: DateTime<Utc>) -> Result<ScheduledPost> {
        let req = self.validate(req, now)?;
        let mut created = self.store.create_planned(|committed| {
            let scheduled_time = match req.scheduled_time {
                Some(at) => {
                    self.warn_on_overlap(committed, &req.platforms, at);
                    at
                }
                None => self.slots.slot_for_in(committed, &req.platforms, now)?,
            };
            Ok(vec![self.build(req, scheduled_time, now)])
        })?;
        created
            .pop()
            .ok_or_else(|| SchedulerError::Validation("submission produced no post".to_string()))
    }

    pub fn submit_batch(&self, reqs: Vec<NewPost>) -> Result<Vec<ScheduledPost>> {
        self.submit_batch_at(reqs, Utc::now())
    }

    /// Validate every request, then give the ones without an explicit time
    /// consecutive slots via [`SlotAllocator::space_batch_in`] over the union
    /// of their platforms. The batch is written in one transaction: nothing
    /// is stored if any request is invalid or any insert fails.
    #[instrument(skip(self, reqs), fields(count = reqs.len()))]
    pub fn submit_batch_at(
        &self,
        reqs: Vec<NewPost>,
        now: DateTime<Utc>,
    ) -> Result<Vec<ScheduledPost>> {
        let reqs = reqs
            .into_iter()
            .enumerate()
            .map(|(i, req)| {
                self.validate(req, now).map_err(|e| match e {
                    SchedulerError::Validation(msg) => {
                        SchedulerError::Validation(format!("batch item {i}: {msg}"))
                    }
                    other => other,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let auto_platforms: Vec<Platform> = reqs
            .iter()
            .filter(|r| r.scheduled_time.is_none())
            .flat_map(|r| r.platforms.iter().cloned())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let auto_count = reqs.iter().filter(|r| r.scheduled_time.is_none()).count();

        let created = self.store.create_planned(|committed| {
            let mut slots = self
                .slots
                .space_batch_in(committed, &auto_platforms, auto_count, now)?
                .into_iter();
            let mut posts = Vec::with_capacity(reqs.len());
            for req in reqs {
                let scheduled_time = match req.scheduled_time {
                    Some(at) => {
                        self.warn_on_overlap(committed, &req.platforms, at);
                        at
                    }
                    None => slots.next().ok_or_else(|| {
                        SchedulerError::Validation("slot allocation came up short".to_string())
                    })?,
                };
                posts.push(self.build(req, scheduled_time, now));
            }
            Ok(posts)
        })?;
        info!(count = created.len(), "batch submitted");
        Ok(created)
    }

    /// Normalise and check a request. Platforms are de-duplicated keeping
    /// their first position.
    fn validate(&self, mut req: NewPost, now: DateTime<Utc>) -> Result<NewPost> {
        let media = req.media_locator.trim();
        if media.is_empty() {
            return Err(SchedulerError::Validation(
                "media_locator must not be empty".to_string(),
            ));
        }
        req.media_locator = media.to_string();

        let mut seen = BTreeSet::new();
        req.platforms.retain(|p| seen.insert(p.clone()));
        if req.platforms.is_empty() {
            return Err(SchedulerError::Validation(
                "at least one target platform is required".to_string(),
            ));
        }

        match req.scheduled_time {
            Some(at) if at < now => {
                return Err(SchedulerError::Validation(format!(
                    "scheduled_time {at} is in the past"
                )));
            }
            None if !self.auto_schedule => {
                return Err(SchedulerError::Validation(
                    "auto_schedule is disabled; an explicit scheduled_time is required"
                        .to_string(),
                ));
            }
            _ => {}
        }
        Ok(req)
    }

    /// Explicit times are honoured even when they crowd another post; the
    /// operator asked for that instant.
    fn warn_on_overlap(&self, committed: &Commitments, platforms: &[Platform], at: DateTime<Utc>) {
        let spacing = self.slots.spacing();
        for platform in platforms {
            if let Some((other, other_at)) = committed.nearest(platform, at) {
                if (other_at - at).abs() < spacing {
                    warn!(
                        %platform,
                        requested = %at,
                        conflicting_post = %other,
                        "explicit scheduled_time is closer than the platform spacing"
                    );
                }
            }
        }
    }

    fn build(&self, req: NewPost, scheduled_time: DateTime<Utc>, now: DateTime<Utc>) -> ScheduledPost {
        ScheduledPost {
            id: PostId::new(),
            media_locator: req.media_locator,
            metadata: req.metadata,
            platforms: req.platforms,
            scheduled_time,
            status: PostStatus::Pending,
            error_message: None,
            retry_count: 0,
            max_retries: self.max_retries,
            created_at: now,
            processed_at: None,
            platform_results: BTreeMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PostFilter;
    use chrono::{Duration, TimeZone};

    fn p(tag: &str) -> Platform {
        Platform::new(tag).unwrap()
    }

    fn ten() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 10, 0, 0).unwrap()
    }

    fn submitter(config: SchedulerConfig) -> Submitter {
        let store = PostStore::open_in_memory().unwrap();
        let slots = SlotAllocator::from_config(store.clone(), &config);
        Submitter::new(store, slots, &config)
    }

    #[test]
    fn auto_slot_lands_on_next_hour_plus_offset() {
        let s = submitter(SchedulerConfig::default());
        let post = s
            .submit_at(NewPost::new("clip.mp4", vec![p("a"), p("b")]), ten())
            .unwrap();
        assert_eq!(post.scheduled_time, ten() + Duration::hours(1));
        assert_eq!(post.status, PostStatus::Pending);
        assert_eq!(post.max_retries, 3);
    }

    #[test]
    fn consecutive_submissions_are_spaced() {
        let s = submitter(SchedulerConfig::default());
        let first = s.submit_at(NewPost::new("1.mp4", vec![p("a")]), ten()).unwrap();
        let second = s.submit_at(NewPost::new("2.mp4", vec![p("a")]), ten()).unwrap();
        assert_eq!(second.scheduled_time - first.scheduled_time, Duration::hours(1));
    }

    #[test]
    fn invalid_requests_never_reach_the_store() {
        let s = submitter(SchedulerConfig::default());
        let cases = vec![
            NewPost::new("clip.mp4", vec![]),
            NewPost::new("   ", vec![p("a")]),
            NewPost::new("clip.mp4", vec![p("a")]).at(ten() - Duration::minutes(1)),
        ];
        for req in cases {
            let err = s.submit_at(req, ten()).unwrap_err();
            assert_eq!(err.code(), "VALIDATION_ERROR");
        }
        assert!(s.store.list(&PostFilter::new()).unwrap().is_empty());
    }

    #[test]
    fn duplicate_platforms_are_collapsed() {
        let s = submitter(SchedulerConfig::default());
        let post = s
            .submit_at(NewPost::new("clip.mp4", vec![p("b"), p("a"), p("b")]), ten())
            .unwrap();
        assert_eq!(post.platforms, vec![p("b"), p("a")]);
    }

    #[test]
    fn explicit_time_is_kept_even_when_crowded() {
        let s = submitter(SchedulerConfig::default());
        let at = ten() + Duration::hours(3);
        s.submit_at(NewPost::new("1.mp4", vec![p("a")]).at(at), ten()).unwrap();
        let second = s
            .submit_at(
                NewPost::new("2.mp4", vec![p("a")]).at(at + Duration::minutes(10)),
                ten(),
            )
            .unwrap();
        assert_eq!(second.scheduled_time, at + Duration::minutes(10));
    }

    #[test]
    fn disabled_auto_schedule_requires_explicit_time() {
        let config = SchedulerConfig {
            auto_schedule: false,
            ..SchedulerConfig::default()
        };
        let s = submitter(config);
        assert!(s.submit_at(NewPost::new("clip.mp4", vec![p("a")]), ten()).is_err());
        let at = ten() + Duration::hours(2);
        let post = s
            .submit_at(NewPost::new("clip.mp4", vec![p("a")]).at(at), ten())
            .unwrap();
        assert_eq!(post.scheduled_time, at);
    }

    #[test]
    fn batch_gets_distinct_consecutive_slots() {
        let s = submitter(SchedulerConfig::default());
        let reqs = (0..4)
            .map(|i| NewPost::new(format!("{i}.mp4"), vec![p("a"), p("b")]))
            .collect();
        let posts = s.submit_batch_at(reqs, ten()).unwrap();
        let times: Vec<_> = posts.iter().map(|p| p.scheduled_time).collect();
        assert_eq!(times[0], ten() + Duration::hours(1));
        for pair in times.windows(2) {
            assert_eq!(pair[1] - pair[0], Duration::hours(1));
        }
    }

    #[test]
    fn batch_with_one_bad_item_writes_nothing() {
        let s = submitter(SchedulerConfig::default());
        let reqs = vec![
            NewPost::new("ok.mp4", vec![p("a")]),
            NewPost::new("bad.mp4", vec![]),
        ];
        let err = s.submit_batch_at(reqs, ten()).unwrap_err();
        assert!(err.to_string().contains("batch item 1"));
        assert!(s.store.list(&PostFilter::new()).unwrap().is_empty());
    }

    #[test]
    fn concurrent_submitters_never_share_a_slot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("postpilot.db");
        let config = SchedulerConfig::default();
        // Two handles on one shared connection plus one on a second
        // connection, as a separate process would have.
        let first = {
            let store = PostStore::open(&path).unwrap();
            Submitter::new(store.clone(), SlotAllocator::from_config(store, &config), &config)
        };
        let other = {
            let store = PostStore::open(&path).unwrap();
            Submitter::new(store.clone(), SlotAllocator::from_config(store, &config), &config)
        };
        let handles = [first.clone(), first.clone(), other.clone(), other];

        let mut times: Vec<DateTime<Utc>> = std::thread::scope(|scope| {
            let workers: Vec<_> = handles
                .iter()
                .enumerate()
                .flat_map(|(w, s)| {
                    (0..3).map(move |i| {
                        scope.spawn(move || {
                            s.submit_at(NewPost::new(format!("{w}-{i}.mp4"), vec![p("a")]), ten())
                                .unwrap()
                                .scheduled_time
                        })
                    })
                })
                .collect();
            workers.into_iter().map(|h| h.join().unwrap()).collect()
        });
        times.sort();
        assert_eq!(times.len(), 12);
        assert_eq!(times[0], ten() + Duration::hours(1));
        for pair in times.windows(2) {
            assert_eq!(pair[1] - pair[0], Duration::hours(1));
        }
        assert_eq!(first.store.list(&PostFilter::new()).unwrap().len(), 12);
    }
}
