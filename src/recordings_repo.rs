//! Recording-segment storage: WAV segment metadata and Whisper
//! transcriptions.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::db::{fmt_ts, parse_ts, DbPool};

/// One voice segment produced by the VOX recorder. Immutable after creation
/// except for the transcription fields, which are filled exactly once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordingSegment {
    pub segment_id: String,
    pub feed_id: String,
    pub start_time: DateTime<Utc>,
    pub duration_ms: u64,
    pub filepath: String,
    pub filesize: u64,
    pub transcribed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transcription_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transcribed_at: Option<DateTime<Utc>>,
}

/// A timed span within a segment's Whisper transcription.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptionSpan {
    pub t0: f64,
    pub t1: f64,
    pub text: String,
}

#[derive(Clone)]
pub struct RecordingsRepository {
    pool: DbPool,
}

impl RecordingsRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    #[instrument(skip(self, seg), fields(segment_id = %seg.segment_id, feed_id = %seg.feed_id))]
    pub async fn save_recording(&self, seg: &RecordingSegment) -> Result<()> {
        let pool = self.pool.clone();
        let seg = seg.clone();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get()?;
            conn.execute(
                "INSERT OR IGNORE INTO atc_recordings
                     (segment_id, feed_id, start_time, duration_ms, filepath,
                      filesize, transcribed)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0)",
                params![
                    seg.segment_id,
                    seg.feed_id,
                    fmt_ts(seg.start_time),
                    seg.duration_ms,
                    seg.filepath,
                    seg.filesize,
                ],
            )?;
            Ok(())
        })
        .await?
    }

    /// Segments for a feed whose start falls within `[t - window, t + window]`,
    /// chronological order.
    pub async fn get_recordings_in_time_window(
        &self,
        feed_id: &str,
        t: DateTime<Utc>,
        window_seconds: i64,
    ) -> Result<Vec<RecordingSegment>> {
        let pool = self.pool.clone();
        let feed_id = feed_id.to_string();
        tokio::task::spawn_blocking(move || {
            let lo = fmt_ts(t - Duration::seconds(window_seconds));
            let hi = fmt_ts(t + Duration::seconds(window_seconds));
            let conn = pool.get()?;
            let mut stmt = conn.prepare(
                "SELECT segment_id, feed_id, start_time, duration_ms, filepath,
                        filesize, transcribed, transcription_text, transcribed_at
                 FROM atc_recordings
                 WHERE feed_id = ?1 AND start_time >= ?2 AND start_time <= ?3
                 ORDER BY start_time ASC",
            )?;
            let rows = stmt.query_map(params![feed_id, lo, hi], row_to_segment)?;
            let mut segments = Vec::new();
            for row in rows {
                segments.push(finish_segment(row?)?);
            }
            Ok(segments)
        })
        .await?
    }

    /// Fill the transcription fields for a segment and record its timed
    /// spans. The fields are only ever written once; a second call is a
    /// no-op.
    #[instrument(skip(self, text, spans), fields(segment_id))]
    pub async fn mark_transcribed(
        &self,
        segment_id: &str,
        text: &str,
        spans: &[TranscriptionSpan],
    ) -> Result<bool> {
        let pool = self.pool.clone();
        let segment_id = segment_id.to_string();
        let text = text.to_string();
        let spans = spans.to_vec();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;
            let tx = conn.transaction()?;
            let updated = tx.execute(
                "UPDATE atc_recordings
                 SET transcribed = 1, transcription_text = ?2, transcribed_at = ?3
                 WHERE segment_id = ?1 AND transcribed = 0",
                params![segment_id, text, fmt_ts(Utc::now())],
            )?;
            if updated > 0 {
                let mut stmt = tx.prepare(
                    "INSERT INTO atc_transcriptions (segment_id, t0, t1, text)
                     VALUES (?1, ?2, ?3, ?4)",
                )?;
                for span in &spans {
                    stmt.execute(params![segment_id, span.t0, span.t1, span.text])?;
                }
                drop(stmt);
            }
            tx.commit()?;
            Ok(updated > 0)
        })
        .await?
    }

    pub async fn get_recording(&self, segment_id: &str) -> Result<Option<RecordingSegment>> {
        let pool = self.pool.clone();
        let segment_id = segment_id.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get()?;
            let mut stmt = conn.prepare(
                "SELECT segment_id, feed_id, start_time, duration_ms, filepath,
                        filesize, transcribed, transcription_text, transcribed_at
                 FROM atc_recordings WHERE segment_id = ?1",
            )?;
            let mut rows = stmt.query_map([&segment_id], row_to_segment)?;
            match rows.next() {
                Some(row) => Ok(Some(finish_segment(row?)?)),
                None => Ok(None),
            }
        })
        .await?
    }

    pub async fn get_transcription_spans(
        &self,
        segment_id: &str,
    ) -> Result<Vec<TranscriptionSpan>> {
        let pool = self.pool.clone();
        let segment_id = segment_id.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get()?;
            let mut stmt = conn.prepare(
                "SELECT t0, t1, text FROM atc_transcriptions
                 WHERE segment_id = ?1 ORDER BY t0 ASC",
            )?;
            let rows = stmt.query_map([&segment_id], |row| {
                Ok(TranscriptionSpan {
                    t0: row.get(0)?,
                    t1: row.get(1)?,
                    text: row.get(2)?,
                })
            })?;
            let mut spans = Vec::new();
            for row in rows {
                spans.push(row?);
            }
            Ok(spans)
        })
        .await?
    }
}

type SegmentRow = (
    String,
    String,
    String,
    u64,
    String,
    u64,
    bool,
    Option<String>,
    Option<String>,
);

fn row_to_segment(row: &rusqlite::Row<'_>) -> rusqlite::Result<SegmentRow> {
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
    ))
}

fn finish_segment(row: SegmentRow) -> Result<RecordingSegment> {
    let (
        segment_id,
        feed_id,
        start_time,
        duration_ms,
        filepath,
        filesize,
        transcribed,
        transcription_text,
        transcribed_at,
    ) = row;
    Ok(RecordingSegment {
        segment_id,
        feed_id,
        start_time: parse_ts(&start_time)?,
        duration_ms,
        filepath,
        filesize,
        transcribed,
        transcription_text,
        transcribed_at: transcribed_at.as_deref().map(parse_ts).transpose()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::temp_pool;

    fn segment(id: &str, feed: &str, start: DateTime<Utc>) -> RecordingSegment {
        RecordingSegment {
            segment_id: id.to_string(),
            feed_id: feed.to_string(),
            start_time: start,
            duration_ms: 5000,
            filepath: format!("data/atc-recordings/{feed}_{}.wav", start.timestamp_millis()),
            filesize: 160_000,
            transcribed: false,
            transcription_text: None,
            transcribed_at: None,
        }
    }

    #[tokio::test]
    async fn test_time_window_is_inclusive_and_scoped_to_feed() {
        let (_dir, pool) = temp_pool();
        let repo = RecordingsRepository::new(pool);
        let t = Utc::now();

        repo.save_recording(&segment("s1", "hfgcs-1", t - Duration::seconds(100)))
            .await
            .unwrap();
        repo.save_recording(&segment("s2", "hfgcs-1", t)).await.unwrap();
        repo.save_recording(&segment("s3", "hfgcs-1", t + Duration::seconds(150)))
            .await
            .unwrap();
        repo.save_recording(&segment("s4", "other-feed", t)).await.unwrap();

        let hits = repo
            .get_recordings_in_time_window("hfgcs-1", t, 120)
            .await
            .unwrap();
        let ids: Vec<_> = hits.iter().map(|s| s.segment_id.as_str()).collect();
        assert_eq!(ids, vec!["s1", "s2"]);
    }

    #[tokio::test]
    async fn test_transcription_fields_fill_once() {
        let (_dir, pool) = temp_pool();
        let repo = RecordingsRepository::new(pool);
        let t = Utc::now();
        repo.save_recording(&segment("s1", "f", t)).await.unwrap();

        let spans = vec![TranscriptionSpan {
            t0: 0.0,
            t1: 2.5,
            text: "SKYKING SKYKING".into(),
        }];
        assert!(repo
            .mark_transcribed("s1", "SKYKING SKYKING", &spans)
            .await
            .unwrap());
        // Second fill attempt is a no-op.
        assert!(!repo
            .mark_transcribed("s1", "different text", &spans)
            .await
            .unwrap());

        let seg = repo.get_recording("s1").await.unwrap().unwrap();
        assert!(seg.transcribed);
        assert_eq!(seg.transcription_text.as_deref(), Some("SKYKING SKYKING"));
        assert!(seg.transcribed_at.is_some());
        assert_eq!(repo.get_transcription_spans("s1").await.unwrap().len(), 1);
    }
}
