//! Embedded store plumbing: connection pool, schema bootstrap, retention.
//!
//! The store is a single WAL-mode SQLite database under `data/airwave.db`.
//! Every write goes through a repository and runs in its own transaction;
//! WAL keeps readers unblocked. Schema-initialization failures are fatal at
//! boot; everything afterwards is operational.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use r2d2_sqlite::SqliteConnectionManager;
use tracing::{info, instrument};

pub type DbPool = r2d2::Pool<SqliteConnectionManager>;

/// Canonical on-disk timestamp format. One format everywhere keeps
/// lexicographic and chronological order identical, which the time-window
/// queries rely on.
pub fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)
        .with_context(|| format!("bad stored timestamp '{s}'"))?
        .with_timezone(&Utc))
}

/// Open (creating if necessary) the database and its connection pool.
pub fn open_pool(path: &Path) -> Result<DbPool> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating data directory {}", parent.display()))?;
    }

    let manager = SqliteConnectionManager::file(path).with_init(|conn| {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Ok(())
    });

    let pool = r2d2::Pool::builder()
        .max_size(8)
        .build(manager)
        .context("building sqlite connection pool")?;

    Ok(pool)
}

/// Create all tables and indexes. Idempotent; called once at boot.
pub fn init_schema(pool: &DbPool) -> Result<()> {
    let conn = pool.get()?;
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS messages (
            id              TEXT PRIMARY KEY,
            timestamp       TEXT NOT NULL,
            source_type     TEXT NOT NULL,
            flight          TEXT,
            tail            TEXT,
            hex             TEXT,
            airline         TEXT,
            category        TEXT,
            label           TEXT,
            payload         TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_messages_timestamp ON messages(timestamp DESC);
        CREATE INDEX IF NOT EXISTS idx_messages_flight ON messages(flight);
        CREATE INDEX IF NOT EXISTS idx_messages_tail ON messages(tail);

        CREATE VIRTUAL TABLE IF NOT EXISTS messages_fts USING fts5(
            id UNINDEXED, text, flight, tail, airline
        );

        CREATE TABLE IF NOT EXISTS aircraft_tracking (
            identifier      TEXT PRIMARY KEY,
            hex             TEXT,
            flight          TEXT,
            tail            TEXT,
            last_seen       TEXT NOT NULL,
            message_count   INTEGER NOT NULL DEFAULT 0
        );
        CREATE INDEX IF NOT EXISTS idx_aircraft_tracking_last_seen
            ON aircraft_tracking(last_seen DESC);

        CREATE TABLE IF NOT EXISTS statistics (
            day             TEXT NOT NULL,
            source_type     TEXT NOT NULL,
            category        TEXT NOT NULL,
            count           INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (day, source_type, category)
        );

        CREATE TABLE IF NOT EXISTS atc_recordings (
            segment_id      TEXT PRIMARY KEY,
            feed_id         TEXT NOT NULL,
            start_time      TEXT NOT NULL,
            duration_ms     INTEGER NOT NULL,
            filepath        TEXT NOT NULL,
            filesize        INTEGER NOT NULL,
            transcribed     INTEGER NOT NULL DEFAULT 0,
            transcription_text TEXT,
            transcribed_at  TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_recordings_feed_time
            ON atc_recordings(feed_id, start_time);

        CREATE TABLE IF NOT EXISTS atc_transcriptions (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            segment_id      TEXT NOT NULL REFERENCES atc_recordings(segment_id)
                                ON DELETE CASCADE,
            t0              REAL NOT NULL,
            t1              REAL NOT NULL,
            text            TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_transcriptions_segment
            ON atc_transcriptions(segment_id);

        CREATE TABLE IF NOT EXISTS eam_messages (
            id              TEXT PRIMARY KEY,
            feed_id         TEXT NOT NULL,
            type            TEXT NOT NULL,
            header          TEXT,
            message_body    TEXT NOT NULL,
            message_length  INTEGER,
            confidence      INTEGER NOT NULL,
            first_detected  TEXT NOT NULL,
            last_detected   TEXT NOT NULL,
            segment_ids     TEXT NOT NULL,
            multi_segment   INTEGER NOT NULL,
            raw_transcription TEXT NOT NULL,
            codeword        TEXT,
            time_code       TEXT,
            authentication  TEXT,
            repeat_count    INTEGER NOT NULL DEFAULT 1
        );
        CREATE INDEX IF NOT EXISTS idx_eam_feed_body
            ON eam_messages(feed_id, message_body, last_detected);

        CREATE TABLE IF NOT EXISTS aircraft_photos (
            id              TEXT PRIMARY KEY,
            registration    TEXT NOT NULL,
            filepath        TEXT NOT NULL,
            fetched_at      TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_photos_registration
            ON aircraft_photos(registration);

        CREATE TABLE IF NOT EXISTS hex_to_registration (
            hex             TEXT PRIMARY KEY,
            registration    TEXT NOT NULL,
            aircraft_type   TEXT
        );

        CREATE TABLE IF NOT EXISTS settings (
            category        TEXT NOT NULL,
            key             TEXT NOT NULL,
            value_json      TEXT NOT NULL,
            updated_at      TEXT NOT NULL,
            PRIMARY KEY (category, key)
        );
        "#,
    )
    .context("initializing database schema")?;

    Ok(())
}

#[derive(Debug, Default, Clone, Copy)]
pub struct CleanupReport {
    pub messages_deleted: usize,
    pub recordings_deleted: usize,
    pub aircraft_deleted: usize,
    pub photos_deleted: usize,
}

/// Delete expired rows, then compact. Retention windows come from the
/// `system` config category.
#[instrument(skip(pool))]
pub async fn cleanup(
    pool: DbPool,
    message_retention_days: i64,
    aircraft_stale_hours: i64,
    photo_retention_days: i64,
) -> Result<CleanupReport> {
    tokio::task::spawn_blocking(move || {
        let now = Utc::now();
        let message_cutoff = fmt_ts(now - Duration::days(message_retention_days));
        let aircraft_cutoff = fmt_ts(now - Duration::hours(aircraft_stale_hours));
        let photo_cutoff = fmt_ts(now - Duration::days(photo_retention_days));

        let mut conn = pool.get()?;
        let tx = conn.transaction()?;

        let messages_deleted =
            tx.execute("DELETE FROM messages WHERE timestamp < ?1", [&message_cutoff])?;
        tx.execute(
            "DELETE FROM messages_fts WHERE id NOT IN (SELECT id FROM messages)",
            [],
        )?;
        let recordings_deleted = tx.execute(
            "DELETE FROM atc_recordings WHERE start_time < ?1",
            [&message_cutoff],
        )?;
        let aircraft_deleted = tx.execute(
            "DELETE FROM aircraft_tracking WHERE last_seen < ?1",
            [&aircraft_cutoff],
        )?;
        let photos_deleted = tx.execute(
            "DELETE FROM aircraft_photos WHERE fetched_at < ?1",
            [&photo_cutoff],
        )?;
        tx.commit()?;

        // VACUUM must run outside a transaction.
        conn.execute_batch("VACUUM")?;

        let report = CleanupReport {
            messages_deleted,
            recordings_deleted,
            aircraft_deleted,
            photos_deleted,
        };
        info!(
            messages = report.messages_deleted,
            recordings = report.recordings_deleted,
            aircraft = report.aircraft_deleted,
            photos = report.photos_deleted,
            "retention cleanup complete"
        );
        Ok(report)
    })
    .await?
}

/// Checkpoint the WAL into the main database file. Called during shutdown so
/// an accepted write is never left only in the log.
pub async fn flush_wal(pool: DbPool) -> Result<()> {
    tokio::task::spawn_blocking(move || {
        let conn = pool.get()?;
        conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE)")?;
        Ok(())
    })
    .await?
}

#[cfg(test)]
pub mod test_support {
    use super::*;
    use tempfile::TempDir;

    /// A pool backed by a database file in a temp directory that lives as
    /// long as the returned guard.
    pub fn temp_pool() -> (TempDir, DbPool) {
        let dir = TempDir::new().expect("tempdir");
        let pool = open_pool(&dir.path().join("airwave.db")).expect("open pool");
        init_schema(&pool).expect("init schema");
        (dir, pool)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_init_is_idempotent() {
        let (_dir, pool) = test_support::temp_pool();
        init_schema(&pool).unwrap();
        init_schema(&pool).unwrap();
    }

    #[test]
    fn test_timestamp_format_round_trips_and_sorts() {
        let a = Utc::now();
        let b = a + Duration::milliseconds(250);
        let (sa, sb) = (fmt_ts(a), fmt_ts(b));
        assert!(sa < sb);
        assert_eq!(parse_ts(&sa).unwrap().timestamp_millis(), a.timestamp_millis());
    }

    #[tokio::test]
    async fn test_cleanup_runs_on_empty_database() {
        let (_dir, pool) = test_support::temp_pool();
        let report = cleanup(pool, 7, 24, 30).await.unwrap();
        assert_eq!(report.messages_deleted, 0);
    }
}
