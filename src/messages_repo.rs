//! Durable message storage with full-text search and daily statistics.

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use tracing::{instrument, trace};

use crate::db::{fmt_ts, DbPool};
use crate::messages::Message;

#[derive(Clone)]
pub struct MessagesRepository {
    pool: DbPool,
}

impl MessagesRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Persist a message. Idempotent on `msg.id`: the second save of the same
    /// id is a no-op and returns `false`. A successful insert also updates
    /// the FTS index, the daily statistics row, and the aircraft last-seen
    /// table, all in one transaction.
    #[instrument(skip(self, msg), fields(id = %msg.id, source_type = msg.source_type.as_str()))]
    pub async fn save_message(&self, msg: &Message) -> Result<bool> {
        let pool = self.pool.clone();
        let msg = msg.clone();
        tokio::task::spawn_blocking(move || {
            let payload = serde_json::to_string(&msg).context("serializing message payload")?;
            let ts = fmt_ts(msg.timestamp);
            let category = msg.category.map(|c| c.as_str());

            let mut conn = pool.get()?;
            let tx = conn.transaction()?;

            let inserted = tx.execute(
                "INSERT OR IGNORE INTO messages
                     (id, timestamp, source_type, flight, tail, hex, airline,
                      category, label, payload)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    msg.id,
                    ts,
                    msg.source_type.as_str(),
                    msg.flight,
                    msg.tail,
                    msg.hex,
                    msg.airline,
                    category,
                    msg.label,
                    payload,
                ],
            )?;
            if inserted == 0 {
                trace!("duplicate message id, skipping");
                return Ok(false);
            }

            tx.execute(
                "INSERT INTO messages_fts (id, text, flight, tail, airline)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    msg.id,
                    msg.text.as_deref().unwrap_or(""),
                    msg.flight.as_deref().unwrap_or(""),
                    msg.tail.as_deref().unwrap_or(""),
                    msg.airline.as_deref().unwrap_or(""),
                ],
            )?;

            tx.execute(
                "INSERT INTO statistics (day, source_type, category, count)
                 VALUES (?1, ?2, ?3, 1)
                 ON CONFLICT (day, source_type, category)
                 DO UPDATE SET count = count + 1",
                params![
                    msg.timestamp.format("%Y-%m-%d").to_string(),
                    msg.source_type.as_str(),
                    category.unwrap_or("freetext"),
                ],
            )?;

            if let Some(identifier) = msg.best_identifier() {
                tx.execute(
                    "INSERT INTO aircraft_tracking
                         (identifier, hex, flight, tail, last_seen, message_count)
                     VALUES (?1, ?2, ?3, ?4, ?5, 1)
                     ON CONFLICT (identifier) DO UPDATE SET
                         hex = COALESCE(excluded.hex, hex),
                         flight = COALESCE(excluded.flight, flight),
                         tail = COALESCE(excluded.tail, tail),
                         last_seen = excluded.last_seen,
                         message_count = message_count + 1",
                    params![identifier, msg.hex, msg.flight, msg.tail, ts],
                )?;
            }

            tx.commit()?;
            Ok(true)
        })
        .await?
    }

    /// Most recent messages, newest first.
    pub async fn get_messages_recent(&self, limit: usize) -> Result<Vec<Message>> {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get()?;
            let mut stmt = conn.prepare(
                "SELECT payload FROM messages ORDER BY timestamp DESC LIMIT ?1",
            )?;
            let rows = stmt.query_map([limit], |row| row.get::<_, String>(0))?;
            collect_payloads(rows)
        })
        .await?
    }

    /// Full-text search over text/flight/tail/airline.
    pub async fn search_messages(&self, query: &str, limit: usize) -> Result<Vec<Message>> {
        let pool = self.pool.clone();
        let query = query.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get()?;
            let mut stmt = conn.prepare(
                "SELECT m.payload
                 FROM messages_fts f
                 JOIN messages m ON m.id = f.id
                 WHERE messages_fts MATCH ?1
                 ORDER BY m.timestamp DESC
                 LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![query, limit], |row| row.get::<_, String>(0))?;
            collect_payloads(rows)
        })
        .await?
    }

    /// Messages for a flight identifier, unioned over flight and tail.
    pub async fn get_messages_by_flight(
        &self,
        identifier: &str,
        limit: usize,
    ) -> Result<Vec<Message>> {
        let pool = self.pool.clone();
        let identifier = identifier.trim().to_uppercase();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get()?;
            let mut stmt = conn.prepare(
                "SELECT payload FROM messages
                 WHERE UPPER(IFNULL(flight, '')) = ?1
                    OR UPPER(IFNULL(tail, '')) = ?1
                    OR UPPER(IFNULL(hex, '')) = ?1
                 ORDER BY timestamp DESC
                 LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![identifier, limit], |row| row.get::<_, String>(0))?;
            collect_payloads(rows)
        })
        .await?
    }

    pub async fn message_count(&self) -> Result<u64> {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get()?;
            let count: u64 =
                conn.query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))?;
            Ok(count)
        })
        .await?
    }

    /// Daily statistics row for one (day, source_type, category) triple.
    pub async fn get_daily_count(
        &self,
        day: &str,
        source_type: &str,
        category: &str,
    ) -> Result<u64> {
        let pool = self.pool.clone();
        let (day, source_type, category) =
            (day.to_string(), source_type.to_string(), category.to_string());
        tokio::task::spawn_blocking(move || {
            let conn = pool.get()?;
            let count: Option<u64> = conn
                .query_row(
                    "SELECT count FROM statistics
                     WHERE day = ?1 AND source_type = ?2 AND category = ?3",
                    params![day, source_type, category],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(count.unwrap_or(0))
        })
        .await?
    }

    /// Statistics snapshot for today, keyed by source type.
    pub async fn today_totals(&self) -> Result<Vec<(String, u64)>> {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let day = Utc::now().format("%Y-%m-%d").to_string();
            let conn = pool.get()?;
            let mut stmt = conn.prepare(
                "SELECT source_type, SUM(count) FROM statistics
                 WHERE day = ?1 GROUP BY source_type",
            )?;
            let rows = stmt.query_map([day], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, u64>(1)?))
            })?;
            let mut totals = Vec::new();
            for row in rows {
                totals.push(row?);
            }
            Ok(totals)
        })
        .await?
    }
}

fn collect_payloads(
    rows: impl Iterator<Item = rusqlite::Result<String>>,
) -> Result<Vec<Message>> {
    let mut messages = Vec::new();
    for payload in rows {
        let payload = payload?;
        messages.push(serde_json::from_str(&payload).context("deserializing stored message")?);
    }
    Ok(messages)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::temp_pool;
    use crate::messages::{SourceInfo, SourceType};

    fn sample(id: &str, flight: Option<&str>, text: &str) -> Message {
        let mut msg = Message::new(SourceType::Acars, SourceInfo::default());
        msg.id = id.to_string();
        msg.flight = flight.map(String::from);
        msg.text = Some(text.to_string());
        msg
    }

    #[tokio::test]
    async fn test_save_message_is_idempotent() {
        let (_dir, pool) = temp_pool();
        let repo = MessagesRepository::new(pool);
        let msg = sample("m1", Some("UAL123"), "OUT 1420");

        assert!(repo.save_message(&msg).await.unwrap());
        assert!(!repo.save_message(&msg).await.unwrap());
        assert_eq!(repo.message_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_recent_returns_descending_timestamps() {
        let (_dir, pool) = temp_pool();
        let repo = MessagesRepository::new(pool);

        for i in 0..5 {
            let mut msg = sample(&format!("m{i}"), None, "hello");
            msg.timestamp = Utc::now() + chrono::Duration::seconds(i);
            repo.save_message(&msg).await.unwrap();
        }

        let recent = repo.get_messages_recent(3).await.unwrap();
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].id, "m4");
        assert!(recent[0].timestamp >= recent[1].timestamp);
        assert!(recent[1].timestamp >= recent[2].timestamp);
    }

    #[tokio::test]
    async fn test_fts_search_finds_text() {
        let (_dir, pool) = temp_pool();
        let repo = MessagesRepository::new(pool);
        repo.save_message(&sample("m1", Some("BAW38"), "METAR EGLL 251450Z"))
            .await
            .unwrap();
        repo.save_message(&sample("m2", Some("UAL9"), "position report"))
            .await
            .unwrap();

        let hits = repo.search_messages("METAR", 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "m1");

        let by_flight = repo.search_messages("BAW38", 10).await.unwrap();
        assert_eq!(by_flight.len(), 1);
    }

    #[tokio::test]
    async fn test_by_flight_unions_flight_and_tail() {
        let (_dir, pool) = temp_pool();
        let repo = MessagesRepository::new(pool);

        let mut a = sample("m1", Some("SWA1234"), "a");
        a.tail = Some("N900WN".into());
        repo.save_message(&a).await.unwrap();

        let mut b = sample("m2", None, "b");
        b.tail = Some("N900WN".into());
        repo.save_message(&b).await.unwrap();

        let hits = repo.get_messages_by_flight("n900wn", 10).await.unwrap();
        assert_eq!(hits.len(), 2);
        let hits = repo.get_messages_by_flight("SWA1234", 10).await.unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[tokio::test]
    async fn test_statistics_accumulate_per_day() {
        let (_dir, pool) = temp_pool();
        let repo = MessagesRepository::new(pool);
        for i in 0..3 {
            repo.save_message(&sample(&format!("m{i}"), None, "x"))
                .await
                .unwrap();
        }
        let day = Utc::now().format("%Y-%m-%d").to_string();
        let count = repo.get_daily_count(&day, "acars", "freetext").await.unwrap();
        assert_eq!(count, 3);
    }
}
