use rusqlite::Connection;

use crate::error::Result;

/// Initialise the scheduling schema in `conn`. Safe to call on every startup.
///
/// Timestamps are ISO-8601 UTC text written by [`crate::timestamp::to_db`];
/// JSON columns hold opaque payloads decoded only in the store.
pub fn init_db(conn: &Connection) -> Result<()> {
    create_posts_table(conn)?;
    create_failures_table(conn)?;
    create_events_table(conn)?;
    Ok(())
}

fn create_posts_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS scheduled_posts (
            id                TEXT    NOT NULL PRIMARY KEY,
            media_locator     TEXT    NOT NULL,
            metadata          TEXT    NOT NULL,   -- opaque JSON
            platforms         TEXT    NOT NULL,   -- JSON array of tags, target order
            scheduled_time    TEXT    NOT NULL,
            status            TEXT    NOT NULL DEFAULT 'pending',
            error_message     TEXT,
            retry_count       INTEGER NOT NULL DEFAULT 0,
            max_retries       INTEGER NOT NULL,
            created_at        TEXT    NOT NULL,
            processed_at      TEXT,
            platform_results  TEXT    NOT NULL DEFAULT '{}', -- JSON object keyed by tag
            claimed_by        TEXT,               -- daemon holding a processing post
            claimed_at        TEXT                -- last claim refresh
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_posts_status ON scheduled_posts (status);
        ",
    )?;
    Ok(())
}

/// One row per (post, platform) that failed its latest attempt.
fn create_failures_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS platform_failures (
            post_id          TEXT    NOT NULL,
            platform         TEXT    NOT NULL,
            error            TEXT    NOT NULL,
            attempts         INTEGER NOT NULL DEFAULT 1,
            first_failed_at  TEXT    NOT NULL,
            last_failed_at   TEXT    NOT NULL,
            PRIMARY KEY (post_id, platform)
        ) STRICT;
        ",
    )?;
    Ok(())
}

/// Append-only audit trail of status transitions.
fn create_events_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS post_events (
            id           INTEGER PRIMARY KEY AUTOINCREMENT,
            post_id      TEXT    NOT NULL,
            from_status  TEXT,
            to_status    TEXT    NOT NULL,
            note         TEXT,
            at           TEXT    NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_events_post ON post_events (post_id, id);
        ",
    )?;
    Ok(())
}
