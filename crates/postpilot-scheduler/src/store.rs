use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{
    params, params_from_iter, Connection, OptionalExtension, Row, TransactionBehavior,
};
use tracing::{debug, info, instrument, warn};

use postpilot_core::{Platform, PostId, PostStatus};

use crate::{
    db::init_db,
    error::{Result, SchedulerError},
    timestamp::{from_db, from_db_opt, to_db},
    types::{
        Claim, Commitments, FailureEntry, PlatformResult, PostEvent, PostFilter, ScheduledPost,
        StatusUpdate,
    },
};

const POST_COLUMNS: &str = "id, media_locator, metadata, platforms, scheduled_time, status,
     error_message, retry_count, max_retries, created_at, processed_at, platform_results";

const FAILURE_COLUMNS: &str =
    "post_id, platform, error, attempts, first_failed_at, last_failed_at";

/// Durable post storage and the single source of truth for lifecycle state.
///
/// Cheap to clone: all clones share one SQLite connection behind a `Mutex`,
/// so the delivery daemon and operator commands serialise on it. Every status
/// change is a compare-and-transition (`UPDATE … WHERE status = <expected>`)
/// which also holds across processes sharing the database file. A
/// `processing` post additionally records its claimant and the time the
/// claim was last refreshed; only claims older than a staleness cutoff are
/// ever taken back.
#[derive(Clone)]
pub struct PostStore {
    conn: Arc<Mutex<Connection>>,
}

impl PostStore {
    /// Wrap an open connection, initialising the schema if needed.
    pub fn new(conn: Connection) -> Result<Self> {
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        init_db(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open (or create) the database file at `path` in WAL mode.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::new(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::new(Connection::open_in_memory()?)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| SchedulerError::LockPoisoned)
    }

    /// Insert a new record. The creation is the first entry of its history.
    #[instrument(skip(self, post), fields(post_id = %post.id))]
    pub fn create(&self, post: &ScheduledPost) -> Result<PostId> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        insert_in(&tx, post)?;
        tx.commit()?;
        info!(scheduled_time = %post.scheduled_time, platforms = post.platforms.len(), "post created");
        Ok(post.id.clone())
    }

    /// Snapshot the current commitments, let `plan` build posts from it and
    /// insert them, all inside one `BEGIN IMMEDIATE` transaction.
    ///
    /// Concurrent planners (threads on a shared store or other processes on
    /// the same file) are serialised, so two of them can never pick the same
    /// slot from the same snapshot. Either every planned post is written or
    /// none is.
    #[instrument(skip(self, plan))]
    pub fn create_planned<F>(&self, plan: F) -> Result<Vec<ScheduledPost>>
    where
        F: FnOnce(&Commitments) -> Result<Vec<ScheduledPost>>,
    {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let committed = commitments_in(&tx)?;
        let posts = plan(&committed)?;
        for post in &posts {
            insert_in(&tx, post)?;
        }
        tx.commit()?;
        for post in &posts {
            info!(
                post_id = %post.id,
                scheduled_time = %post.scheduled_time,
                platforms = post.platforms.len(),
                "post created"
            );
        }
        Ok(posts)
    }

    /// Pending and processing posts that new slots must keep clear of.
    pub fn commitments(&self) -> Result<Commitments> {
        let conn = self.lock()?;
        commitments_in(&conn)
    }

    /// Fetch one post. Returns `PostNotFound` if the id is unknown.
    pub fn get(&self, id: &PostId) -> Result<ScheduledPost> {
        let conn = self.lock()?;
        get_in(&conn, id)
    }

    /// Return posts matching `filter`, ordered by ascending `scheduled_time`.
    ///
    /// Status is filtered in SQL; platform and time window are applied after
    /// timestamps have been parsed. Rows that fail to decode are logged and
    /// skipped so one bad record cannot stall the daemon.
    pub fn list(&self, filter: &PostFilter) -> Result<Vec<ScheduledPost>> {
        let rows: Vec<PostRow> = {
            let conn = self.lock()?;
            let sql = if filter.statuses.is_empty() {
                format!("SELECT {POST_COLUMNS} FROM scheduled_posts")
            } else {
                let placeholders: Vec<String> = (1..=filter.statuses.len())
                    .map(|i| format!("?{i}"))
                    .collect();
                format!(
                    "SELECT {POST_COLUMNS} FROM scheduled_posts WHERE status IN ({})",
                    placeholders.join(", ")
                )
            };
            let mut stmt = conn.prepare_cached(&sql)?;
            let rows = stmt
                .query_map(
                    params_from_iter(filter.statuses.iter().map(|s| s.as_str())),
                    PostRow::read,
                )?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };

        let mut posts: Vec<ScheduledPost> = rows
            .into_iter()
            .filter_map(|row| match row.into_post() {
                Ok(post) => Some(post),
                Err(e) => {
                    warn!(error = %e, "skipping undecodable post row");
                    None
                }
            })
            .filter(|post| filter.matches(post))
            .collect();
        posts.sort_by(|a, b| {
            a.scheduled_time
                .cmp(&b.scheduled_time)
                .then_with(|| a.created_at.cmp(&b.created_at))
        });
        Ok(posts)
    }

    /// Atomically move `id` from `from` to `to`, applying `update`.
    ///
    /// Fails with `InvalidTransition` if the lifecycle has no such edge,
    /// `Conflict` if the stored status is no longer `from`, and
    /// `PostNotFound` if the post does not exist. Entering `processing`
    /// stamps the claim (`update.claimed_by`, refreshed at `at`); any other
    /// target clears it.
    #[instrument(skip(self, update), fields(post_id = %id))]
    pub fn transition(
        &self,
        id: &PostId,
        from: PostStatus,
        to: PostStatus,
        update: StatusUpdate,
        at: DateTime<Utc>,
    ) -> Result<ScheduledPost> {
        if !from.can_transition_to(to) {
            return Err(SchedulerError::InvalidTransition {
                id: id.to_string(),
                from,
                to,
            });
        }

        let (claimed_by, claimed_at) = if to == PostStatus::Processing {
            (update.claimed_by.as_deref(), Some(to_db(&at)))
        } else {
            (None, None)
        };

        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let n = tx.execute(
            "UPDATE scheduled_posts SET
                 status        = ?1,
                 error_message = COALESCE(?2, error_message),
                 retry_count   = CASE WHEN ?3 AND retry_count < max_retries
                                      THEN retry_count + 1 ELSE retry_count END,
                 processed_at  = COALESCE(?4, processed_at),
                 claimed_by    = ?7,
                 claimed_at    = ?8
             WHERE id = ?5 AND status = ?6",
            params![
                to.as_str(),
                update.error,
                update.retry_increment,
                update.processed_at.as_ref().map(to_db),
                id.as_str(),
                from.as_str(),
                claimed_by,
                claimed_at,
            ],
        )?;
        if n == 0 {
            return Err(cas_failure(&tx, id, from));
        }

        let note = update.note.as_deref().or(update.error.as_deref());
        append_event(&tx, id, Some(from), to, note, &at)?;
        let post = get_in(&tx, id)?;
        tx.commit()?;

        debug!(%from, %to, retry_count = post.retry_count, "status transition");
        Ok(post)
    }

    /// Move `id` to `new_status` from whatever status it currently has.
    ///
    /// Reads the current status first and then performs a
    /// compare-and-transition against it, so a concurrent change surfaces as
    /// `Conflict` rather than being overwritten. Terminal targets stamp
    /// `processed_at`.
    pub fn update_status(
        &self,
        id: &PostId,
        new_status: PostStatus,
        error: Option<&str>,
        retry_increment: bool,
    ) -> Result<ScheduledPost> {
        let current = self.get(id)?.status;
        let now = Utc::now();
        let mut update = StatusUpdate::new();
        if let Some(e) = error {
            update = update.error(e);
        }
        if retry_increment {
            update = update.retry_increment();
        }
        if new_status.is_terminal() {
            update = update.processed_at(now);
        }
        self.transition(id, current, new_status, update, now)
    }

    /// Record a successful publication for one platform and clear any
    /// failure entry for it.
    ///
    /// Results are recorded whatever the post's status: a platform call that
    /// was already in flight when the post was cancelled still happened.
    #[instrument(skip(self, result), fields(post_id = %id, %platform))]
    pub fn record_platform_result(
        &self,
        id: &PostId,
        platform: &Platform,
        result: &PlatformResult,
    ) -> Result<ScheduledPost> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let mut post = get_in(&tx, id)?;
        if !post.platforms.contains(platform) {
            return Err(SchedulerError::Validation(format!(
                "post {id} does not target platform '{platform}'"
            )));
        }
        post.platform_results
            .insert(platform.clone(), result.clone());
        tx.execute(
            "UPDATE scheduled_posts SET platform_results = ?1 WHERE id = ?2",
            params![serde_json::to_string(&post.platform_results)?, id.as_str()],
        )?;
        tx.execute(
            "DELETE FROM platform_failures WHERE post_id = ?1 AND platform = ?2",
            params![id.as_str(), platform.as_str()],
        )?;
        tx.commit()?;
        info!(url = %result.published_url, "platform published");
        Ok(post)
    }

    /// Upsert the failure entry for (post, platform), bumping its attempt count.
    pub fn record_platform_failure(
        &self,
        id: &PostId,
        platform: &Platform,
        error: &str,
        at: DateTime<Utc>,
    ) -> Result<FailureEntry> {
        let conn = self.lock()?;
        let at = to_db(&at);
        conn.execute(
            "INSERT INTO platform_failures
                 (post_id, platform, error, attempts, first_failed_at, last_failed_at)
             VALUES (?1, ?2, ?3, 1, ?4, ?4)
             ON CONFLICT (post_id, platform) DO UPDATE SET
                 error          = excluded.error,
                 attempts       = attempts + 1,
                 last_failed_at = excluded.last_failed_at",
            params![id.as_str(), platform.as_str(), error, at],
        )?;
        let row = conn.query_row(
            &format!(
                "SELECT {FAILURE_COLUMNS} FROM platform_failures
                 WHERE post_id = ?1 AND platform = ?2"
            ),
            params![id.as_str(), platform.as_str()],
            FailureRow::read,
        )?;
        row.into_entry()
    }

    /// Every failure entry, oldest latest-failure first.
    pub fn failures(&self) -> Result<Vec<FailureEntry>> {
        self.query_failures(
            &format!("SELECT {FAILURE_COLUMNS} FROM platform_failures"),
            None,
        )
    }

    pub fn failures_for(&self, id: &PostId) -> Result<Vec<FailureEntry>> {
        self.query_failures(
            &format!("SELECT {FAILURE_COLUMNS} FROM platform_failures WHERE post_id = ?1"),
            Some(id),
        )
    }

    /// Drop one failure entry. Returns whether an entry existed.
    pub fn remove_failure(&self, id: &PostId, platform: &Platform) -> Result<bool> {
        let conn = self.lock()?;
        let n = conn.execute(
            "DELETE FROM platform_failures WHERE post_id = ?1 AND platform = ?2",
            params![id.as_str(), platform.as_str()],
        )?;
        Ok(n > 0)
    }

    fn query_failures(&self, sql: &str, id: Option<&PostId>) -> Result<Vec<FailureEntry>> {
        let rows: Vec<FailureRow> = {
            let conn = self.lock()?;
            let mut stmt = conn.prepare_cached(sql)?;
            let rows = stmt
                .query_map(params_from_iter(id.map(|i| i.as_str())), FailureRow::read)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };
        let mut entries = rows
            .into_iter()
            .map(FailureRow::into_entry)
            .collect::<Result<Vec<_>>>()?;
        entries.sort_by(|a, b| {
            a.last_failed_at
                .cmp(&b.last_failed_at)
                .then_with(|| a.post_id.cmp(&b.post_id))
                .then_with(|| a.platform.cmp(&b.platform))
        });
        Ok(entries)
    }

    /// Set `scheduled_time` on a pending post (used by force-publish).
    pub fn set_scheduled_time(
        &self,
        id: &PostId,
        scheduled_time: DateTime<Utc>,
        at: DateTime<Utc>,
    ) -> Result<ScheduledPost> {
        self.mutate_pending(
            id,
            "UPDATE scheduled_posts SET scheduled_time = ?1
             WHERE id = ?2 AND status = 'pending'",
            scheduled_time,
            &format!("scheduled_time set to {}", to_db(&scheduled_time)),
            at,
        )
    }

    /// Move a pending post to `scheduled_time` and reset its retry budget.
    /// The record is updated in place; no new post is created.
    pub fn reschedule(
        &self,
        id: &PostId,
        scheduled_time: DateTime<Utc>,
        at: DateTime<Utc>,
    ) -> Result<ScheduledPost> {
        self.mutate_pending(
            id,
            "UPDATE scheduled_posts SET scheduled_time = ?1, retry_count = 0
             WHERE id = ?2 AND status = 'pending'",
            scheduled_time,
            &format!("rescheduled to {}", to_db(&scheduled_time)),
            at,
        )
    }

    fn mutate_pending(
        &self,
        id: &PostId,
        sql: &str,
        scheduled_time: DateTime<Utc>,
        note: &str,
        at: DateTime<Utc>,
    ) -> Result<ScheduledPost> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let n = tx.execute(sql, params![to_db(&scheduled_time), id.as_str()])?;
        if n == 0 {
            return Err(cas_failure(&tx, id, PostStatus::Pending));
        }
        append_event(
            &tx,
            id,
            Some(PostStatus::Pending),
            PostStatus::Pending,
            Some(note),
            &at,
        )?;
        let post = get_in(&tx, id)?;
        tx.commit()?;
        debug!(post_id = %id, %note, "pending post updated");
        Ok(post)
    }

    /// Operator retry of a failed post: back to `pending` at `scheduled_time`
    /// with a fresh retry budget. Recorded platform results are kept, so the
    /// next attempt only targets platforms that have not published yet.
    #[instrument(skip(self), fields(post_id = %id))]
    pub fn revive_failed(
        &self,
        id: &PostId,
        scheduled_time: DateTime<Utc>,
        at: DateTime<Utc>,
    ) -> Result<ScheduledPost> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let n = tx.execute(
            "UPDATE scheduled_posts SET
                 status = 'pending', scheduled_time = ?1, retry_count = 0,
                 error_message = NULL, processed_at = NULL
             WHERE id = ?2 AND status = 'failed'",
            params![to_db(&scheduled_time), id.as_str()],
        )?;
        if n == 0 {
            return Err(cas_failure(&tx, id, PostStatus::Failed));
        }
        append_event(
            &tx,
            id,
            Some(PostStatus::Failed),
            PostStatus::Pending,
            Some("retry requested"),
            &at,
        )?;
        let post = get_in(&tx, id)?;
        tx.commit()?;
        info!("failed post revived for retry");
        Ok(post)
    }

    /// Current claim on a post, `None` unless it is `processing`.
    pub fn claim(&self, id: &PostId) -> Result<Option<Claim>> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                "SELECT status, claimed_by, claimed_at FROM scheduled_posts WHERE id = ?1",
                [id.as_str()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,         // status
                        row.get::<_, Option<String>>(1)?, // claimed_by
                        row.get::<_, Option<String>>(2)?, // claimed_at
                    ))
                },
            )
            .optional()?
            .ok_or_else(|| SchedulerError::PostNotFound { id: id.to_string() })?;
        match row {
            (status, owner, Some(at)) if status == PostStatus::Processing.as_str() => {
                Ok(Some(Claim {
                    owner,
                    refreshed_at: from_db(&at)?,
                }))
            }
            _ => Ok(None),
        }
    }

    /// Prove `owner` is still working on `id`. Returns false if the post is
    /// no longer `processing` under that owner (cancelled, or taken back).
    pub fn refresh_claim(&self, id: &PostId, owner: &str, at: DateTime<Utc>) -> Result<bool> {
        let conn = self.lock()?;
        let n = conn.execute(
            "UPDATE scheduled_posts SET claimed_at = ?1
             WHERE id = ?2 AND status = 'processing' AND claimed_by = ?3",
            params![to_db(&at), id.as_str(), owner],
        )?;
        Ok(n > 0)
    }

    /// Hand a post `owner` could not finish back to `pending`, without
    /// spending a retry. Returns false if `owner` no longer holds it.
    #[instrument(skip(self), fields(post_id = %id))]
    pub fn release_claim(
        &self,
        id: &PostId,
        owner: &str,
        note: &str,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let n = tx.execute(
            "UPDATE scheduled_posts SET
                 status = 'pending', claimed_by = NULL, claimed_at = NULL
             WHERE id = ?1 AND status = 'processing' AND claimed_by = ?2",
            params![id.as_str(), owner],
        )?;
        if n > 0 {
            append_event(
                &tx,
                id,
                Some(PostStatus::Processing),
                PostStatus::Pending,
                Some(note),
                &at,
            )?;
        }
        tx.commit()?;
        Ok(n > 0)
    }

    /// Return posts whose claim was last refreshed before `stale_before` to
    /// `pending`. Not counted as a retry. Live claims are left alone, so a
    /// second process sharing the file never steals an in-flight post.
    pub fn recover_interrupted(
        &self,
        stale_before: DateTime<Utc>,
        at: DateTime<Utc>,
    ) -> Result<Vec<PostId>> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let claims: Vec<(String, Option<String>)> = {
            let mut stmt = tx.prepare(
                "SELECT id, claimed_at FROM scheduled_posts WHERE status = 'processing'",
            )?;
            let rows = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };
        let ids: Vec<PostId> = claims
            .into_iter()
            .filter(|(id, claimed_at)| match claimed_at.as_deref().map(from_db) {
                Some(Ok(refreshed)) => refreshed < stale_before,
                Some(Err(e)) => {
                    warn!(post_id = %id, error = %e, "unreadable claim time; treating as stale");
                    true
                }
                None => true,
            })
            .map(|(id, _)| PostId::from(id))
            .collect();
        for id in &ids {
            tx.execute(
                "UPDATE scheduled_posts SET
                     status = 'pending', claimed_by = NULL, claimed_at = NULL
                 WHERE id = ?1 AND status = 'processing'",
                [id.as_str()],
            )?;
            append_event(
                &tx,
                id,
                Some(PostStatus::Processing),
                PostStatus::Pending,
                Some("recovered after interrupted processing"),
                &at,
            )?;
        }
        tx.commit()?;
        Ok(ids)
    }

    /// Audit trail for one post, oldest first.
    pub fn history(&self, id: &PostId) -> Result<Vec<PostEvent>> {
        let conn = self.lock()?;
        get_in(&conn, id)?;
        let mut stmt = conn.prepare_cached(
            "SELECT post_id, from_status, to_status, note, at
             FROM post_events WHERE post_id = ?1 ORDER BY id",
        )?;
        let rows = stmt
            .query_map([id.as_str()], |row| {
                Ok((
                    row.get::<_, String>(0)?,         // post_id
                    row.get::<_, Option<String>>(1)?, // from_status
                    row.get::<_, String>(2)?,         // to_status
                    row.get::<_, Option<String>>(3)?, // note
                    row.get::<_, String>(4)?,         // at
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(|(post_id, from, to, note, at)| {
                let parse = |s: &str| {
                    s.parse::<PostStatus>()
                        .map_err(|e| SchedulerError::CorruptRecord {
                            id: post_id.clone(),
                            reason: e.to_string(),
                        })
                };
                Ok(PostEvent {
                    post_id: PostId::from(post_id.as_str()),
                    from_status: from.as_deref().map(parse).transpose()?,
                    to_status: parse(&to)?,
                    note,
                    at: from_db(&at)?,
                })
            })
            .collect()
    }

    /// Number of posts per status, in lifecycle order.
    pub fn counts(&self) -> Result<Vec<(PostStatus, usize)>> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare_cached("SELECT status, COUNT(*) FROM scheduled_posts GROUP BY status")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut counts: Vec<(PostStatus, usize)> =
            PostStatus::ALL.iter().map(|s| (*s, 0)).collect();
        for (status, n) in rows {
            match status.parse::<PostStatus>() {
                Ok(s) => {
                    if let Some(slot) = counts.iter_mut().find(|(c, _)| *c == s) {
                        slot.1 = n as usize;
                    }
                }
                Err(_) => warn!(%status, "unknown status in store"),
            }
        }
        Ok(counts)
    }
}

impl std::fmt::Debug for PostStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostStore").finish_non_exhaustive()
    }
}

// --- row decoding ----------------------------------------------------------

/// Raw column values, decoded outside the rusqlite closure so parse errors
/// carry the post id.
struct PostRow {
    id: String,
    media_locator: String,
    metadata: String,
    platforms: String,
    scheduled_time: String,
    status: String,
    error_message: Option<String>,
    retry_count: u32,
    max_retries: u32,
    created_at: String,
    processed_at: Option<String>,
    platform_results: String,
}

impl PostRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            media_locator: row.get(1)?,
            metadata: row.get(2)?,
            platforms: row.get(3)?,
            scheduled_time: row.get(4)?,
            status: row.get(5)?,
            error_message: row.get(6)?,
            retry_count: row.get(7)?,
            max_retries: row.get(8)?,
            created_at: row.get(9)?,
            processed_at: row.get(10)?,
            platform_results: row.get(11)?,
        })
    }

    fn into_post(self) -> Result<ScheduledPost> {
        let id = self.id;
        let corrupt = |reason: String| SchedulerError::CorruptRecord {
            id: id.clone(),
            reason,
        };

        let status = self
            .status
            .parse::<PostStatus>()
            .map_err(|e| corrupt(e.to_string()))?;
        let metadata = serde_json::from_str(&self.metadata)
            .map_err(|e| corrupt(format!("metadata: {e}")))?;
        let platforms: Vec<Platform> = serde_json::from_str(&self.platforms)
            .map_err(|e| corrupt(format!("platforms: {e}")))?;
        let platform_results: BTreeMap<Platform, PlatformResult> =
            serde_json::from_str(&self.platform_results)
                .map_err(|e| corrupt(format!("platform_results: {e}")))?;

        Ok(ScheduledPost {
            media_locator: self.media_locator,
            metadata,
            platforms,
            scheduled_time: from_db(&self.scheduled_time)?,
            status,
            error_message: self.error_message,
            retry_count: self.retry_count,
            max_retries: self.max_retries,
            created_at: from_db(&self.created_at)?,
            processed_at: from_db_opt(self.processed_at.as_deref())?,
            platform_results,
            id: PostId::from(id),
        })
    }
}

struct FailureRow {
    post_id: String,
    platform: String,
    error: String,
    attempts: u32,
    first_failed_at: String,
    last_failed_at: String,
}

impl FailureRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            post_id: row.get(0)?,
            platform: row.get(1)?,
            error: row.get(2)?,
            attempts: row.get(3)?,
            first_failed_at: row.get(4)?,
            last_failed_at: row.get(5)?,
        })
    }

    fn into_entry(self) -> Result<FailureEntry> {
        let platform =
            Platform::new(&self.platform).map_err(|e| SchedulerError::CorruptRecord {
                id: self.post_id.clone(),
                reason: e.to_string(),
            })?;
        Ok(FailureEntry {
            platform,
            error: self.error,
            attempts: self.attempts,
            first_failed_at: from_db(&self.first_failed_at)?,
            last_failed_at: from_db(&self.last_failed_at)?,
            post_id: PostId::from(self.post_id),
        })
    }
}

// --- private helpers -------------------------------------------------------

fn insert_in(conn: &Connection, post: &ScheduledPost) -> Result<()> {
    conn.execute(
        &format!(
            "INSERT INTO scheduled_posts ({POST_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"
        ),
        params![
            post.id.as_str(),
            post.media_locator,
            serde_json::to_string(&post.metadata)?,
            serde_json::to_string(&post.platforms)?,
            to_db(&post.scheduled_time),
            post.status.as_str(),
            post.error_message,
            post.retry_count,
            post.max_retries,
            to_db(&post.created_at),
            post.processed_at.as_ref().map(to_db),
            serde_json::to_string(&post.platform_results)?,
        ],
    )?;
    append_event(conn, &post.id, None, post.status, Some("created"), &post.created_at)
}

fn commitments_in(conn: &Connection) -> Result<Commitments> {
    let mut stmt = conn.prepare_cached(
        "SELECT id, platforms, scheduled_time FROM scheduled_posts
         WHERE status IN ('pending', 'processing')",
    )?;
    let rows = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?, // id
                row.get::<_, String>(1)?, // platforms
                row.get::<_, String>(2)?, // scheduled_time
            ))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut committed = Commitments::new();
    for (id, platforms, at) in rows {
        let platforms = serde_json::from_str::<Vec<Platform>>(&platforms);
        match (platforms, from_db(&at)) {
            (Ok(platforms), Ok(at)) => committed.push(PostId::from(id), platforms, at),
            _ => warn!(post_id = %id, "skipping undecodable commitment"),
        }
    }
    Ok(committed)
}

fn get_in(conn: &Connection, id: &PostId) -> Result<ScheduledPost> {
    conn.query_row(
        &format!("SELECT {POST_COLUMNS} FROM scheduled_posts WHERE id = ?1"),
        [id.as_str()],
        PostRow::read,
    )
    .optional()?
    .ok_or_else(|| SchedulerError::PostNotFound { id: id.to_string() })?
    .into_post()
}

/// Explain why a compare-and-transition touched no row.
fn cas_failure(conn: &Connection, id: &PostId, expected: PostStatus) -> SchedulerError {
    let found = conn
        .query_row(
            "SELECT status FROM scheduled_posts WHERE id = ?1",
            [id.as_str()],
            |row| row.get::<_, String>(0),
        )
        .optional();
    match found {
        Ok(None) => SchedulerError::PostNotFound { id: id.to_string() },
        Ok(Some(status)) => match status.parse::<PostStatus>() {
            Ok(found) => SchedulerError::Conflict {
                id: id.to_string(),
                expected,
                found,
            },
            Err(e) => SchedulerError::CorruptRecord {
                id: id.to_string(),
                reason: e.to_string(),
            },
        },
        Err(e) => SchedulerError::Database(e),
    }
}

fn append_event(
    conn: &Connection,
    id: &PostId,
    from: Option<PostStatus>,
    to: PostStatus,
    note: Option<&str>,
    at: &DateTime<Utc>,
) -> Result<()> {
    conn.execute(
        "INSERT INTO post_events (post_id, from_status, to_status, note, at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            id.as_str(),
            from.map(PostStatus::as_str),
            to.as_str(),
            note,
            to_db(at)
        ],
    )?;
    Ok(())
}
