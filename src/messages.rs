//! Canonical message model shared by every source and the processing
//! pipeline.
//!
//! A `Message` is created by a source, enriched exactly once by the
//! processor, optionally persisted, and never mutated afterward.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Upstream feed family a message originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Acars,
    Vdlm2,
    Hfdl,
    Adsb,
    Hfgcs,
    Eam,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Acars => "acars",
            SourceType::Vdlm2 => "vdlm2",
            SourceType::Hfdl => "hfdl",
            SourceType::Adsb => "adsb",
            SourceType::Hfgcs => "hfgcs",
            SourceType::Eam => "eam",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "acars" => Some(SourceType::Acars),
            "vdlm2" => Some(SourceType::Vdlm2),
            "hfdl" => Some(SourceType::Hfdl),
            "adsb" => Some(SourceType::Adsb),
            "hfgcs" => Some(SourceType::Hfgcs),
            "eam" => Some(SourceType::Eam),
            _ => None,
        }
    }
}

/// Message category assigned by the processor's text classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Oooi,
    Position,
    Cpdlc,
    Weather,
    Performance,
    AtcRequest,
    Hfgcs,
    Adsb,
    Freetext,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Oooi => "oooi",
            Category::Position => "position",
            Category::Cpdlc => "cpdlc",
            Category::Weather => "weather",
            Category::Performance => "performance",
            Category::AtcRequest => "atc_request",
            Category::Hfgcs => "hfgcs",
            Category::Adsb => "adsb",
            Category::Freetext => "freetext",
        }
    }
}

/// Flight phase derived from ADS-B kinematics (or OOOI fusion later).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FlightPhase {
    Taxi,
    Takeoff,
    Cruise,
    Descent,
    Approach,
    Landing,
    Unknown,
}

impl FlightPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlightPhase::Taxi => "TAXI",
            FlightPhase::Takeoff => "TAKEOFF",
            FlightPhase::Cruise => "CRUISE",
            FlightPhase::Descent => "DESCENT",
            FlightPhase::Approach => "APPROACH",
            FlightPhase::Landing => "LANDING",
            FlightPhase::Unknown => "UNKNOWN",
        }
    }
}

/// Where a message physically came from (station, frequency, API).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceInfo {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub station_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frequency: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub lat: f64,
    pub lon: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub altitude_ft: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coordinates_string: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Kinematics {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ground_speed: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heading: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vertical_rate: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub on_ground: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub squawk: Option<String>,
}

/// Out/Off/On/In lifecycle event extracted from ACARS text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OooiEvent {
    pub event: String,
    pub time: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Validation {
    pub valid: bool,
    #[serde(default)]
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub source: SourceInfo,
    pub source_type: SourceType,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub flight: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hex: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub airline: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kinematics: Option<Kinematics>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<Category>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flight_phase: Option<FlightPhase>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub oooi: Option<OooiEvent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpdlc_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hfgcs_type: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub validation: Option<Validation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_number: Option<u64>,
}

impl Message {
    /// Create a bare message with a fresh id and the current timestamp.
    /// Sources fill in identity/payload fields before handing it to the
    /// processor.
    pub fn new(source_type: SourceType, source: SourceInfo) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            source,
            source_type,
            flight: None,
            tail: None,
            hex: None,
            airline: None,
            position: None,
            kinematics: None,
            text: None,
            label: None,
            category: None,
            flight_phase: None,
            oooi: None,
            cpdlc_type: None,
            hfgcs_type: None,
            validation: None,
            message_number: None,
        }
    }

    /// Best identity key for the live aircraft map: hex wins, then tail,
    /// then flight.
    pub fn best_identifier(&self) -> Option<String> {
        self.hex
            .as_deref()
            .or(self.tail.as_deref())
            .or(self.flight.as_deref())
            .map(|s| s.trim().to_uppercase())
    }

    /// Trimmed callsign, if any.
    pub fn callsign(&self) -> Option<&str> {
        self.flight.as_deref().map(str::trim).filter(|s| !s.is_empty())
    }
}
