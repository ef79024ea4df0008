//! EAM message storage with repeat-aware upserts.

use anyhow::{Context, Result};
use chrono::Duration;
use rusqlite::{params, OptionalExtension};
use tracing::instrument;

use crate::db::{fmt_ts, parse_ts, DbPool};
use crate::eam::{EamMessage, EamType};

/// Outcome of a save: a fresh detection or a repeat of a recent one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EamUpsert {
    Inserted { id: String },
    Repeated { id: String, repeat_count: u32 },
}

const REPEAT_WINDOW_SECONDS: i64 = 300;

#[derive(Clone)]
pub struct EamRepository {
    pool: DbPool,
}

impl EamRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Persist a detection. If the same `(feed_id, message_body, header)`
    /// was last seen within the repeat window, the existing row's
    /// `last_detected` is bumped and its repeat counter incremented instead
    /// of inserting a duplicate.
    #[instrument(skip(self, eam), fields(feed_id = %eam.feed_id, eam_type = eam.eam_type.as_str()))]
    pub async fn save_eam(&self, eam: &EamMessage) -> Result<EamUpsert> {
        let pool = self.pool.clone();
        let eam = eam.clone();
        tokio::task::spawn_blocking(move || {
            let cutoff = fmt_ts(eam.last_detected - Duration::seconds(REPEAT_WINDOW_SECONDS));

            let mut conn = pool.get()?;
            let tx = conn.transaction()?;

            let existing: Option<(String, u32)> = tx
                .query_row(
                    "SELECT id, repeat_count FROM eam_messages
                     WHERE feed_id = ?1
                       AND message_body = ?2
                       AND IFNULL(header, '') = IFNULL(?3, '')
                       AND last_detected >= ?4
                     ORDER BY last_detected DESC
                     LIMIT 1",
                    params![eam.feed_id, eam.message_body, eam.header, cutoff],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;

            let outcome = match existing {
                Some((id, repeat_count)) => {
                    tx.execute(
                        "UPDATE eam_messages
                         SET last_detected = MAX(last_detected, ?2),
                             repeat_count = repeat_count + 1
                         WHERE id = ?1",
                        params![id, fmt_ts(eam.last_detected)],
                    )?;
                    EamUpsert::Repeated {
                        id,
                        repeat_count: repeat_count + 1,
                    }
                }
                None => {
                    let segment_ids = serde_json::to_string(&eam.segment_ids)
                        .context("serializing segment ids")?;
                    tx.execute(
                        "INSERT INTO eam_messages
                             (id, feed_id, type, header, message_body, message_length,
                              confidence, first_detected, last_detected, segment_ids,
                              multi_segment, raw_transcription, codeword, time_code,
                              authentication, repeat_count)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10,
                                 ?11, ?12, ?13, ?14, ?15, 1)",
                        params![
                            eam.id,
                            eam.feed_id,
                            eam.eam_type.as_str(),
                            eam.header,
                            eam.message_body,
                            eam.message_length,
                            eam.confidence,
                            fmt_ts(eam.first_detected),
                            fmt_ts(eam.last_detected),
                            segment_ids,
                            eam.multi_segment,
                            eam.raw_transcription,
                            eam.codeword,
                            eam.time_code,
                            eam.authentication,
                        ],
                    )?;
                    EamUpsert::Inserted { id: eam.id.clone() }
                }
            };

            tx.commit()?;
            Ok(outcome)
        })
        .await?
    }

    pub async fn get_recent(&self, limit: usize) -> Result<Vec<EamMessage>> {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get()?;
            let mut stmt = conn.prepare(
                "SELECT id, feed_id, type, header, message_body, message_length,
                        confidence, first_detected, last_detected, segment_ids,
                        multi_segment, raw_transcription, codeword, time_code,
                        authentication
                 FROM eam_messages
                 ORDER BY last_detected DESC
                 LIMIT ?1",
            )?;
            let rows = stmt.query_map([limit], row_to_parts)?;
            let mut eams = Vec::new();
            for row in rows {
                eams.push(finish_eam(row?)?);
            }
            Ok(eams)
        })
        .await?
    }

    pub async fn repeat_count(&self, id: &str) -> Result<u32> {
        let pool = self.pool.clone();
        let id = id.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get()?;
            let count: u32 = conn.query_row(
                "SELECT repeat_count FROM eam_messages WHERE id = ?1",
                [&id],
                |row| row.get(0),
            )?;
            Ok(count)
        })
        .await?
    }
}

type EamRow = (
    String,
    String,
    String,
    Option<String>,
    String,
    Option<u32>,
    u8,
    String,
    String,
    String,
    bool,
    String,
    Option<String>,
    Option<String>,
    Option<String>,
);

fn row_to_parts(row: &rusqlite::Row<'_>) -> rusqlite::Result<EamRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
        row.get(10)?,
        row.get(11)?,
        row.get(12)?,
        row.get(13)?,
        row.get(14)?,
    ))
}

fn finish_eam(row: EamRow) -> Result<EamMessage> {
    let (
        id,
        feed_id,
        eam_type,
        header,
        message_body,
        message_length,
        confidence,
        first_detected,
        last_detected,
        segment_ids,
        multi_segment,
        raw_transcription,
        codeword,
        time_code,
        authentication,
    ) = row;
    Ok(EamMessage {
        id,
        feed_id,
        eam_type: EamType::parse(&eam_type)
            .with_context(|| format!("unknown stored eam type '{eam_type}'"))?,
        header,
        message_body,
        message_length,
        confidence,
        first_detected: parse_ts(&first_detected)?,
        last_detected: parse_ts(&last_detected)?,
        segment_ids: serde_json::from_str(&segment_ids).context("stored segment ids")?,
        multi_segment,
        raw_transcription,
        codeword,
        time_code,
        authentication,
    })
}
