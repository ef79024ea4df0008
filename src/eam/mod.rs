//! Emergency Action Message detection: text preprocessing and temporal
//! aggregation across recording segments.

pub mod aggregator;
pub mod preprocess;

pub use aggregator::EamAggregator;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Broadcast class of a detected message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EamType {
    #[serde(rename = "EAM")]
    Eam,
    #[serde(rename = "SKYKING")]
    Skyking,
}

impl EamType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EamType::Eam => "EAM",
            EamType::Skyking => "SKYKING",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "EAM" => Some(EamType::Eam),
            "SKYKING" => Some(EamType::Skyking),
            _ => None,
        }
    }
}

/// A detected Emergency Action Message or SKYKING broadcast.
///
/// Invariants: `multi_segment` implies at least two segment ids, and
/// `first_detected <= last_detected`. Once persisted, the record only ever
/// changes by bumping `last_detected` and the repeat counter when the same
/// normalized body reappears within the dedup window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EamMessage {
    pub id: String,
    pub feed_id: String,
    #[serde(rename = "type")]
    pub eam_type: EamType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub header: Option<String>,
    pub message_body: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_length: Option<u32>,
    pub confidence: u8,
    pub first_detected: DateTime<Utc>,
    pub last_detected: DateTime<Utc>,
    pub segment_ids: Vec<String>,
    pub multi_segment: bool,
    pub raw_transcription: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub codeword: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authentication: Option<String>,
}
