// End-to-end delivery behaviour against scripted publishers.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use tokio::sync::{oneshot, Notify};

use postpilot_core::{Platform, PostId, PostStatus, SchedulerConfig};
use postpilot_publishers::{PublishError, PublishReceipt, PublishRequest, Publisher, PublisherRegistry};
use postpilot_scheduler::{
    Engine, NewPost, PostStore, PublishOutcome, StatusUpdate, MISSED_ERROR,
};

type Hook = Box<dyn FnOnce() + Send>;

/// Publisher that replays a script of successes/failures, then falls back
/// to `default_ok`.
struct Scripted {
    platform: Platform,
    script: Mutex<VecDeque<bool>>,
    default_ok: bool,
    calls: AtomicUsize,
    /// Runs once while the next call is in flight.
    during: Mutex<Option<Hook>>,
    /// Parks the next call: signals entry, then waits to be let go.
    gate: Mutex<Option<(Arc<Notify>, oneshot::Receiver<()>)>>,
}

impl Scripted {
    fn new(tag: &str, default_ok: bool) -> Arc<Self> {
        Arc::new(Self {
            platform: p(tag),
            script: Mutex::new(VecDeque::new()),
            default_ok,
            calls: AtomicUsize::new(0),
            during: Mutex::new(None),
            gate: Mutex::new(None),
        })
    }

    fn then(self: &Arc<Self>, ok: bool) -> Arc<Self> {
        self.script.lock().unwrap().push_back(ok);
        Arc::clone(self)
    }

    fn during(&self, hook: impl FnOnce() + Send + 'static) {
        *self.during.lock().unwrap() = Some(Box::new(hook));
    }

    fn hold(&self) -> (Arc<Notify>, oneshot::Sender<()>) {
        let entered = Arc::new(Notify::new());
        let (release, parked) = oneshot::channel();
        *self.gate.lock().unwrap() = Some((entered.clone(), parked));
        (entered, release)
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Publisher for Scripted {
    fn platform(&self) -> &Platform {
        &self.platform
    }

    async fn publish(&self, req: &PublishRequest) -> Result<PublishReceipt, PublishError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let gate = self.gate.lock().unwrap().take();
        if let Some((entered, parked)) = gate {
            entered.notify_one();
            let _ = parked.await;
        }
        tokio::task::yield_now().await;
        let hook = self.during.lock().unwrap().take();
        if let Some(hook) = hook {
            hook();
        }
        let ok = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(self.default_ok);
        if ok {
            Ok(PublishReceipt {
                url: format!("https://{}.example/v/{}", self.platform, req.post_id),
                native_id: format!("{}-{}", self.platform, req.attempt),
            })
        } else {
            Err(PublishError::Api {
                status: 503,
                message: format!("{} is down", self.platform),
            })
        }
    }
}

fn p(tag: &str) -> Platform {
    Platform::new(tag).unwrap()
}

fn ten() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 1, 1, 10, 0, 0).unwrap()
}

fn engine_with(
    store: PostStore,
    publishers: &[Arc<Scripted>],
    config: SchedulerConfig,
) -> Engine {
    let mut registry = PublisherRegistry::new();
    for publisher in publishers {
        registry.register(publisher.clone());
    }
    Engine::new(store, registry, &config)
}

fn engine(publishers: &[Arc<Scripted>]) -> Engine {
    engine_with(
        PostStore::open_in_memory().unwrap(),
        publishers,
        SchedulerConfig::default(),
    )
}

/// Submit a post due at `at`, one hour ahead of the submission clock.
fn submit(engine: &Engine, platforms: &[&str], at: DateTime<Utc>) -> PostId {
    let req = NewPost::new("renders/clip.mp4", platforms.iter().map(|t| p(t)).collect()).at(at);
    engine.submitter().submit_at(req, at - Duration::hours(1)).unwrap().id
}

#[test]
fn auto_scheduled_submission_lands_on_the_next_hour_plus_offset() {
    let engine = engine(&[]);
    let post = engine
        .submitter()
        .submit_at(NewPost::new("clip.mp4", vec![p("a"), p("b")]), ten())
        .unwrap();
    assert_eq!(post.scheduled_time, Utc.with_ymd_and_hms(2025, 1, 1, 11, 0, 0).unwrap());
    assert_eq!(post.status, PostStatus::Pending);
    assert_eq!(engine.store().get(&post.id).unwrap(), post);
}

#[test]
fn next_slot_respects_existing_pending_post() {
    let engine = engine(&[]);
    let existing = ten() + Duration::hours(4) + Duration::minutes(17);
    submit(&engine, &["a"], existing);

    let slot = engine.slots().next_available_slot(&p("a"), ten()).unwrap();
    assert!(slot >= ten());
    assert!(slot >= existing + Duration::hours(1));
}

#[test]
fn batch_of_five_is_evenly_spaced() {
    let engine = engine(&[]);
    let slots = engine
        .slots()
        .space_batch(&[p("a"), p("b")], 5, ten())
        .unwrap();
    assert_eq!(slots.len(), 5);
    assert!(slots[0] >= ten());
    for pair in slots.windows(2) {
        assert_eq!(pair[1] - pair[0], Duration::hours(1));
    }
}

#[tokio::test]
async fn post_past_grace_fails_without_any_publish_attempt() {
    let a = Scripted::new("a", true);
    let engine = engine(&[a.clone()]);
    let id = submit(&engine, &["a"], ten());

    let report = engine
        .daemon()
        .tick_at(ten() + Duration::hours(2))
        .await
        .unwrap();

    assert_eq!(report.missed, 1);
    assert_eq!(a.calls(), 0);
    let post = engine.store().get(&id).unwrap();
    assert_eq!(post.status, PostStatus::Failed);
    assert_eq!(post.error_message.as_deref(), Some(MISSED_ERROR));
    assert_eq!(post.retry_count, 0);
    assert!(engine.store().failures_for(&id).unwrap().is_empty());
}

#[tokio::test]
async fn partial_success_is_never_completed_and_skips_done_platforms() {
    let a = Scripted::new("a", true);
    let b = Scripted::new("b", false).then(false).then(true);
    let engine = engine(&[a.clone(), b.clone()]);
    let id = submit(&engine, &["a", "b"], ten());

    let report = engine.daemon().tick_at(ten()).await.unwrap();
    assert_eq!(report.requeued, 1);

    let post = engine.store().get(&id).unwrap();
    assert_eq!(post.status, PostStatus::Pending);
    assert_eq!(post.retry_count, 1);
    assert!(post.platform_results.contains_key(&p("a")));
    assert_eq!(post.error_message.as_deref(), Some("b: API error (503): b is down"));
    assert_eq!(post.scheduled_time, ten());

    let failures = engine.store().failures_for(&id).unwrap();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].platform, p("b"));

    // Next tick: only the failed platform is retried.
    engine
        .daemon()
        .tick_at(ten() + Duration::minutes(1))
        .await
        .unwrap();
    assert_eq!(a.calls(), 1);
    assert_eq!(b.calls(), 2);

    let post = engine.store().get(&id).unwrap();
    assert_eq!(post.status, PostStatus::Completed);
    assert_eq!(post.platform_results.len(), 2);
    assert!(engine.store().failures_for(&id).unwrap().is_empty());
}

#[tokio::test]
async fn retry_budget_is_bounded_and_exhaustion_fails_the_post() {
    let a = Scripted::new("a", false);
    let config = SchedulerConfig {
        max_retries: 2,
        ..SchedulerConfig::default()
    };
    let engine = engine_with(PostStore::open_in_memory().unwrap(), &[a.clone()], config);
    let id = submit(&engine, &["a"], ten());

    let mut seen = Vec::new();
    for minute in 0..4 {
        engine
            .daemon()
            .tick_at(ten() + Duration::minutes(minute))
            .await
            .unwrap();
        let post = engine.store().get(&id).unwrap();
        assert!(post.retry_count <= post.max_retries);
        seen.push((post.status, post.retry_count));
    }

    assert_eq!(
        seen,
        vec![
            (PostStatus::Pending, 1),
            (PostStatus::Pending, 2),
            (PostStatus::Failed, 2),
            (PostStatus::Failed, 2),
        ]
    );
    assert_eq!(a.calls(), 3);
    let failures = engine.store().failures_for(&id).unwrap();
    assert_eq!(failures[0].attempts, 3);
}

#[tokio::test]
async fn force_publish_completes_before_returning() {
    let a = Scripted::new("a", true);
    let b = Scripted::new("b", true);
    let engine = engine(&[a.clone(), b.clone()]);
    let at = Utc::now() + Duration::days(2);
    let id = submit(&engine, &["a", "b"], at);

    let post = engine.control().force_publish_now(&id).await.unwrap();

    assert_eq!(post.status, PostStatus::Completed);
    assert!(post.scheduled_time < at);
    let urls: Vec<&str> = post
        .platform_results
        .values()
        .map(|r| r.published_url.as_str())
        .collect();
    assert_eq!(urls.len(), 2);
    assert!(urls.iter().all(|u| u.starts_with("https://")));
}

#[tokio::test]
async fn cancel_during_publish_stops_remaining_platforms() {
    let a = Scripted::new("a", true);
    let b = Scripted::new("b", true);
    let engine = engine(&[a.clone(), b.clone()]);
    let id = submit(&engine, &["a", "b"], ten());
    let (store, target) = (engine.store().clone(), id.clone());
    a.during(move || {
        store
            .update_status(&target, PostStatus::Cancelled, None, false)
            .unwrap();
    });

    let outcome = engine.daemon().process_post_at(&id, ten()).await.unwrap();

    assert_eq!(outcome, PublishOutcome::Cancelled);
    assert_eq!(b.calls(), 0);
    let post = engine.store().get(&id).unwrap();
    assert_eq!(post.status, PostStatus::Cancelled);
    // The in-flight call finished and its result is kept.
    assert!(post.platform_results.contains_key(&p("a")));

    // Cancelling again is a no-op.
    let again = engine.control().cancel(&id).unwrap();
    assert_eq!(again.status, PostStatus::Cancelled);
}

#[tokio::test]
async fn concurrent_claims_publish_once() {
    let a = Scripted::new("a", true);
    let engine = engine(&[a.clone()]);
    let id = submit(&engine, &["a"], ten());

    let daemon = engine.daemon();
    let (first, second) = tokio::join!(
        daemon.process_post_at(&id, ten()),
        daemon.process_post_at(&id, ten())
    );
    let mut outcomes = vec![first.unwrap(), second.unwrap()];
    outcomes.sort_by_key(|o| matches!(o, PublishOutcome::Skipped));

    assert_eq!(outcomes, vec![PublishOutcome::Completed, PublishOutcome::Skipped]);
    assert_eq!(a.calls(), 1);
}

#[tokio::test]
async fn retry_all_republishes_only_unfinished_platforms() {
    let a = Scripted::new("a", true);
    let b = Scripted::new("b", true).then(false);
    let config = SchedulerConfig {
        max_retries: 0,
        ..SchedulerConfig::default()
    };
    let engine = engine_with(
        PostStore::open_in_memory().unwrap(),
        &[a.clone(), b.clone()],
        config,
    );
    let id = submit(&engine, &["a", "b"], ten());
    let missed = submit(&engine, &["a"], ten() - Duration::hours(3));

    engine.daemon().tick_at(ten()).await.unwrap();
    let failed = engine.control().failed_posts().unwrap();
    assert_eq!(failed.len(), 2);
    let partial = failed.iter().find(|f| f.post.id == id).unwrap();
    assert!(partial.retriable);
    assert_eq!(partial.failures.len(), 1);

    let retried = engine.control().retry_all().await.unwrap();
    assert_eq!(retried, vec![(id.clone(), PublishOutcome::Completed)]);
    assert_eq!(a.calls(), 1);
    assert_eq!(b.calls(), 2);

    // Grace-missed posts are only retried on request.
    assert_eq!(engine.store().get(&missed).unwrap().status, PostStatus::Failed);
    let revived = engine.control().retry(&missed).await.unwrap();
    assert_eq!(revived.status, PostStatus::Completed);
}

#[test]
fn state_survives_reopening_the_database() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("postpilot.db");
    let at = Utc.with_ymd_and_hms(2025, 3, 9, 17, 45, 12).unwrap() + Duration::milliseconds(345);

    let id = {
        let engine = engine_with(PostStore::open(&path).unwrap(), &[], SchedulerConfig::default());
        submit(&engine, &["a"], at)
    };

    let store = PostStore::open(&path).unwrap();
    let post = store.get(&id).unwrap();
    assert_eq!(post.scheduled_time, at);
    assert_eq!(post.status, PostStatus::Pending);
    assert_eq!(store.history(&id).unwrap().len(), 1);
}

#[tokio::test]
async fn interrupted_post_resumes_without_republishing() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("postpilot.db");

    // First process: claims the post, publishes A, then "crashes".
    let id = {
        let store = PostStore::open(&path).unwrap();
        let engine = engine_with(store.clone(), &[], SchedulerConfig::default());
        let id = submit(&engine, &["a", "b"], ten());
        store
            .transition(&id, PostStatus::Pending, PostStatus::Processing, StatusUpdate::new(), ten())
            .unwrap();
        store
            .record_platform_result(
                &id,
                &p("a"),
                &postpilot_scheduler::PlatformResult {
                    published_url: "https://a.example/v/1".into(),
                    platform_native_id: "1".into(),
                    published_at: ten(),
                },
            )
            .unwrap();
        id
    };

    let a = Scripted::new("a", true);
    let b = Scripted::new("b", true);
    let engine = engine_with(
        PostStore::open(&path).unwrap(),
        &[a.clone(), b.clone()],
        SchedulerConfig::default(),
    );
    assert_eq!(engine.daemon().recover().unwrap(), 1);
    let post = engine.store().get(&id).unwrap();
    assert_eq!(post.status, PostStatus::Pending);
    assert_eq!(post.retry_count, 0);

    engine
        .daemon()
        .tick_at(ten() + Duration::minutes(5))
        .await
        .unwrap();
    assert_eq!(a.calls(), 0);
    assert_eq!(b.calls(), 1);
    assert_eq!(engine.store().get(&id).unwrap().status, PostStatus::Completed);
}

#[tokio::test]
async fn second_process_never_steals_an_in_flight_post() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("postpilot.db");

    let first_a = Scripted::new("a", true);
    let first = engine_with(
        PostStore::open(&path).unwrap(),
        &[first_a.clone()],
        SchedulerConfig::default(),
    );
    let id = submit(&first, &["a"], ten());
    let (entered, release) = first_a.hold();

    let daemon = first.daemon().clone();
    let target = id.clone();
    let in_flight = tokio::spawn(async move { daemon.process_post_at(&target, ten()).await });
    entered.notified().await;

    // Another process opens the same file while the call is parked.
    let second_a = Scripted::new("a", true);
    let second = engine_with(
        PostStore::open(&path).unwrap(),
        &[second_a.clone()],
        SchedulerConfig::default(),
    );
    assert_eq!(second.daemon().recover_at(ten()).unwrap(), 0);
    let report = second.daemon().tick_at(ten()).await.unwrap();
    assert_eq!(report.recovered, 0);
    assert_eq!(report.due, 0);
    assert_eq!(second.store().get(&id).unwrap().status, PostStatus::Processing);

    release.send(()).unwrap();
    assert_eq!(in_flight.await.unwrap().unwrap(), PublishOutcome::Completed);
    assert_eq!(first_a.calls() + second_a.calls(), 1);
    assert_eq!(second.store().get(&id).unwrap().status, PostStatus::Completed);
}

#[tokio::test]
async fn store_failure_mid_publish_releases_the_post_for_the_next_tick() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("postpilot.db");
    let a = Scripted::new("a", true).then(false);
    let engine = engine_with(
        PostStore::open(&path).unwrap(),
        &[a.clone()],
        SchedulerConfig::default(),
    );
    let id = submit(&engine, &["a"], ten());

    // The failure bookkeeping table vanishes while the call is in flight.
    let side = path.clone();
    a.during(move || {
        rusqlite::Connection::open(&side)
            .unwrap()
            .execute_batch("ALTER TABLE platform_failures RENAME TO platform_failures_away")
            .unwrap();
    });

    let err = engine.daemon().tick_at(ten()).await.unwrap_err();
    assert!(err.is_store_failure());
    let post = engine.store().get(&id).unwrap();
    assert_eq!(post.status, PostStatus::Pending);
    assert_eq!(post.retry_count, 0);

    rusqlite::Connection::open(&path)
        .unwrap()
        .execute_batch("ALTER TABLE platform_failures_away RENAME TO platform_failures")
        .unwrap();

    let report = engine
        .daemon()
        .tick_at(ten() + Duration::minutes(1))
        .await
        .unwrap();
    assert_eq!(report.completed, 1);
    assert_eq!(a.calls(), 2);

    let history = engine.store().history(&id).unwrap();
    assert!(history.iter().all(|e| e.to_status != PostStatus::Failed));
    assert!(history
        .iter()
        .any(|e| e.note.as_deref() == Some("released after error: DATABASE_ERROR")));
}
