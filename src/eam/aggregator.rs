//! Temporal correlation of voice-segment transcriptions into EAMs.
//!
//! Long broadcasts span several VOX segments. When a transcription looks
//! EAM-shaped, nearby segments from the same feed are pulled in, combined
//! chronologically, scored, and — past the confidence gate — persisted and
//! announced. An order-independent fingerprint cache stops the same segment
//! group from being detected twice.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration as StdDuration, Instant};

use anyhow::Result;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::bus::{EventBus, Topic};
use crate::eam::preprocess::{
    clean_transcription, detect_eam_indicators, estimate_confidence, extract_phonetic_sequence,
    normalize_phonetics,
};
use crate::eam::{EamMessage, EamType};
use crate::eam_repo::EamRepository;
use crate::recordings_repo::{RecordingSegment, RecordingsRepository};

static HEADER_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^([A-Z0-9]{6})\b").unwrap());
static LENGTH_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b(\d+)\s+CHARACTERS?\b").unwrap());
static CODEWORD_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"SKYKING\s+SKYKING\s+DO\s+NOT\s+ANSWER\s+([A-Z]+)").unwrap());
static TIME_CODE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\bTIME\s+(\d{2,4})\b").unwrap());
static AUTHENTICATION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\bAUTHENTICATION\s+(?:IS\s+)?([A-Z]+(?:\s+[A-Z]+)?)\b").unwrap());

const RELATED_WINDOW_SECONDS: i64 = 120;
const MAX_RELATED_SEGMENTS: usize = 10;
const SLIDING_WINDOW: usize = 3;
const MIN_CONFIDENCE: u8 = 40;
const TRIGGER_PHONETIC_COUNT: usize = 15;
const DEDUP_TTL: StdDuration = StdDuration::from_secs(600);

/// Chronologically combined view over a set of segments.
#[derive(Debug, Clone)]
pub struct Aggregated {
    pub combined_text: String,
    pub segment_ids: Vec<String>,
    pub segment_count: usize,
    pub first_timestamp: DateTime<Utc>,
    pub last_timestamp: DateTime<Utc>,
    pub duration_seconds: i64,
}

struct ProcessedEntry {
    at: Instant,
    #[allow(dead_code)]
    eam_id: String,
}

pub struct EamAggregator {
    recordings: RecordingsRepository,
    eams: EamRepository,
    bus: Arc<EventBus>,
    processed: Mutex<HashMap<String, ProcessedEntry>>,
}

impl EamAggregator {
    pub fn new(
        recordings: RecordingsRepository,
        eams: EamRepository,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            recordings,
            eams,
            bus,
            processed: Mutex::new(HashMap::new()),
        }
    }

    /// Cheap gate on a single transcription: any EAM indicator, or enough
    /// phonetic density to be worth correlating.
    pub fn should_trigger_aggregation(text: &str) -> bool {
        let normalized = normalize_phonetics(&clean_transcription(text));
        if detect_eam_indicators(&normalized).any() {
            return true;
        }
        extract_phonetic_sequence(&normalized).phonetic_count >= TRIGGER_PHONETIC_COUNT
    }

    /// Transcribed segments on the same feed within ±120 s of `t`, capped.
    pub async fn related_segments(
        &self,
        feed_id: &str,
        t: DateTime<Utc>,
    ) -> Result<Vec<RecordingSegment>> {
        let mut segments = self
            .recordings
            .get_recordings_in_time_window(feed_id, t, RELATED_WINDOW_SECONDS)
            .await?;
        segments.retain(|s| {
            s.transcribed
                && s.transcription_text
                    .as_deref()
                    .is_some_and(|text| !text.trim().is_empty())
        });
        segments.truncate(MAX_RELATED_SEGMENTS);
        Ok(segments)
    }

    /// Combine transcriptions in chronological order with single spaces.
    pub fn aggregate_transcriptions(segments: &[RecordingSegment]) -> Option<Aggregated> {
        if segments.is_empty() {
            return None;
        }
        let mut ordered: Vec<&RecordingSegment> = segments.iter().collect();
        ordered.sort_by_key(|s| s.start_time);

        let combined_text = ordered
            .iter()
            .filter_map(|s| s.transcription_text.as_deref())
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join(" ");

        let first = ordered.first()?;
        let last = ordered.last()?;
        Some(Aggregated {
            combined_text,
            segment_ids: ordered.iter().map(|s| s.segment_id.clone()).collect(),
            segment_count: ordered.len(),
            first_timestamp: first.start_time,
            last_timestamp: last.start_time,
            duration_seconds: (last.start_time - first.start_time).num_seconds()
                + (last.duration_ms / 1000) as i64,
        })
    }

    /// All contiguous windows of `w` segments, or the full set when fewer.
    pub fn sliding_windows(segments: &[RecordingSegment], w: usize) -> Vec<Vec<RecordingSegment>> {
        if segments.len() <= w {
            return vec![segments.to_vec()];
        }
        segments.windows(w).map(|window| window.to_vec()).collect()
    }

    fn fingerprint(segment_ids: &[String]) -> String {
        let mut sorted: Vec<&str> = segment_ids.iter().map(String::as_str).collect();
        sorted.sort_unstable();
        sorted.join("|")
    }

    /// Record a processed segment set. Matching is order-independent and
    /// entries expire after ten minutes.
    pub fn mark_segments_processed(&self, segment_ids: &[String], eam_id: &str) {
        self.processed.lock().unwrap().insert(
            Self::fingerprint(segment_ids),
            ProcessedEntry {
                at: Instant::now(),
                eam_id: eam_id.to_string(),
            },
        );
    }

    pub fn is_processed(&self, segment_ids: &[String]) -> bool {
        let mut cache = self.processed.lock().unwrap();
        cache.retain(|_, entry| entry.at.elapsed() < DEDUP_TTL);
        cache.contains_key(&Self::fingerprint(segment_ids))
    }

    /// Entry point, called whenever a segment's transcription arrives.
    pub async fn on_transcription(
        &self,
        segment: &RecordingSegment,
    ) -> Result<Option<EamMessage>> {
        let Some(text) = segment.transcription_text.as_deref() else {
            return Ok(None);
        };
        if !Self::should_trigger_aggregation(text) {
            return Ok(None);
        }

        let related = self
            .related_segments(&segment.feed_id, segment.start_time)
            .await?;
        if related.is_empty() {
            return Ok(None);
        }

        let mut best: Option<(u8, Aggregated, EamType, String)> = None;
        for window in Self::sliding_windows(&related, SLIDING_WINDOW) {
            let Some(aggregated) = Self::aggregate_transcriptions(&window) else {
                continue;
            };
            if self.is_processed(&aggregated.segment_ids) {
                debug!(
                    feed_id = %segment.feed_id,
                    segments = aggregated.segment_count,
                    "segment window already processed"
                );
                continue;
            }

            let normalized = normalize_phonetics(&clean_transcription(&aggregated.combined_text));
            let indicators = detect_eam_indicators(&normalized);
            let sequence = extract_phonetic_sequence(&normalized);
            let confidence = estimate_confidence(&indicators, sequence.phonetic_count);
            if confidence < MIN_CONFIDENCE {
                continue;
            }

            let eam_type = if indicators.has_skyking {
                EamType::Skyking
            } else if indicators.has_message_follows || HEADER_RE.is_match(&normalized) {
                EamType::Eam
            } else {
                continue;
            };

            let replace = match &best {
                Some((best_confidence, best_agg, _, _)) => {
                    confidence > *best_confidence
                        || (confidence == *best_confidence
                            && aggregated.segment_count > best_agg.segment_count)
                }
                None => true,
            };
            if replace {
                best = Some((confidence, aggregated, eam_type, normalized));
            }
        }

        let Some((confidence, aggregated, eam_type, normalized)) = best else {
            return Ok(None);
        };

        let eam = EamMessage {
            id: Uuid::new_v4().to_string(),
            feed_id: segment.feed_id.clone(),
            eam_type,
            header: HEADER_RE
                .captures(&normalized)
                .map(|caps| caps[1].to_string()),
            message_body: normalized.clone(),
            message_length: LENGTH_RE
                .captures(&normalized)
                .and_then(|caps| caps[1].parse().ok()),
            confidence,
            first_detected: aggregated.first_timestamp,
            last_detected: aggregated.last_timestamp,
            segment_ids: aggregated.segment_ids.clone(),
            multi_segment: aggregated.segment_ids.len() >= 2,
            raw_transcription: aggregated.combined_text.clone(),
            codeword: CODEWORD_RE
                .captures(&normalized)
                .map(|caps| caps[1].to_string()),
            time_code: TIME_CODE_RE
                .captures(&normalized)
                .map(|caps| caps[1].to_string()),
            authentication: AUTHENTICATION_RE
                .captures(&normalized)
                .map(|caps| caps[1].to_string()),
        };

        self.eams.save_eam(&eam).await?;
        self.mark_segments_processed(&eam.segment_ids, &eam.id);

        info!(
            feed_id = %eam.feed_id,
            eam_type = eam.eam_type.as_str(),
            confidence = eam.confidence,
            segments = eam.segment_ids.len(),
            "EAM detected"
        );
        metrics::counter!("eam.detected", "type" => eam.eam_type.as_str()).increment(1);
        self.bus.publish(Topic::EamDetected, &eam);

        Ok(Some(eam))
    }
}
