//! HFGCS watch list: military airborne-command-post detection.
//!
//! Four detection methods are applied in order; the first hit wins. The
//! active list lives in memory and emits detected/updated/lost events on the
//! bus.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::json;
use tracing::info;

use crate::bus::{EventBus, Topic};
use crate::messages::Message;

pub const DEFAULT_HFGCS_STALE_SECONDS: i64 = 600;

/// Hex blocks for E-4B Nightwatch airframes.
const E4B_HEX: &[&str] = &["ADFEB3", "ADFEB4", "ADFEB5", "ADFEB6"];

/// Hexes for the E-6B Mercury fleet.
const E6B_HEX: &[&str] = &[
    "AE0412", "AE0413", "AE0414", "AE0415", "AE0416", "AE0417", "AE0418", "AE0419", "AE041A",
    "AE041B", "AE041C", "AE041D", "AE041E", "AE041F", "AE0420",
];

/// Callsign prefixes flown by TACAMO / Looking Glass missions.
const CALLSIGN_PREFIXES: &[&str] = &["IRON", "GOTO", "GORDO", "TITAN", "SLICK"];

/// Curated tail numbers (E-4B fleet plus known E-6B tails).
const TAILS: &[(&str, Classification)] = &[
    ("73-1676", Classification::E4B),
    ("73-1677", Classification::E4B),
    ("74-0787", Classification::E4B),
    ("75-0125", Classification::E4B),
    ("162782", Classification::E6B),
    ("162783", Classification::E6B),
    ("162784", Classification::E6B),
    ("163918", Classification::E6B),
    ("164386", Classification::E6B),
];

const E6B_TYPE_MARKERS: &[&str] = &["E6", "E-6", "E-6B", "TACAMO"];
const E4B_TYPE_MARKERS: &[&str] = &["E4", "E-4", "E-4B", "NIGHTWATCH"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectionMethod {
    Hex,
    Callsign,
    Tail,
    Type,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Classification {
    #[serde(rename = "E-6B")]
    E6B,
    #[serde(rename = "E-4B")]
    E4B,
    #[serde(rename = "other-military")]
    OtherMilitary,
}

#[derive(Debug, Clone, Serialize)]
pub struct HfgcsAircraft {
    pub identifier: String,
    pub hex: Option<String>,
    pub flight: Option<String>,
    pub tail: Option<String>,
    pub aircraft_type: Option<String>,
    pub detection_method: DetectionMethod,
    pub classification: Classification,
    pub first_detected: DateTime<Utc>,
    pub last_message: DateTime<Utc>,
    pub message_count: u64,
}

pub struct HfgcsTracker {
    active: DashMap<String, HfgcsAircraft>,
    bus: Arc<EventBus>,
    stale_seconds: i64,
}

impl HfgcsTracker {
    pub fn new(bus: Arc<EventBus>, stale_seconds: i64) -> Self {
        Self {
            active: DashMap::new(),
            bus,
            stale_seconds,
        }
    }

    /// Run the detection chain against a message and update the active list.
    /// `aircraft_type` is the registry-resolved type string for the airframe,
    /// when known. Non-military messages are a cheap no-op.
    pub fn observe(&self, msg: &Message, aircraft_type: Option<&str>) -> Option<DetectionMethod> {
        let (method, classification) = Self::detect(msg, aircraft_type)?;
        let key = msg.best_identifier()?;

        let mut is_new = false;
        let snapshot = {
            let mut entry = self.active.entry(key.clone()).or_insert_with(|| {
                is_new = true;
                HfgcsAircraft {
                    identifier: key.clone(),
                    hex: msg.hex.as_ref().map(|h| h.to_uppercase()),
                    flight: msg.callsign().map(String::from),
                    tail: msg.tail.clone(),
                    aircraft_type: aircraft_type.map(String::from),
                    detection_method: method,
                    classification,
                    first_detected: msg.timestamp,
                    last_message: msg.timestamp,
                    message_count: 0,
                }
            });
            let aircraft = entry.value_mut();
            aircraft.message_count += 1;
            if msg.timestamp > aircraft.last_message {
                aircraft.last_message = msg.timestamp;
            }
            if let Some(flight) = msg.callsign() {
                aircraft.flight = Some(flight.to_string());
            }
            if aircraft.aircraft_type.is_none() {
                aircraft.aircraft_type = aircraft_type.map(String::from);
            }
            aircraft.clone()
        };

        if is_new {
            info!(
                identifier = %key,
                method = ?method,
                classification = ?classification,
                "HFGCS aircraft detected"
            );
            metrics::counter!("hfgcs.detected").increment(1);
        }
        self.bus.publish(
            Topic::HfgcsAircraft,
            &json!({
                "event": if is_new { "detected" } else { "updated" },
                "aircraft": snapshot,
            }),
        );

        Some(method)
    }

    /// Detection chain; first hit wins.
    fn detect(
        msg: &Message,
        aircraft_type: Option<&str>,
    ) -> Option<(DetectionMethod, Classification)> {
        if let Some(hex) = msg.hex.as_deref() {
            let hex = hex.to_uppercase();
            if E4B_HEX.contains(&hex.as_str()) {
                return Some((DetectionMethod::Hex, Classification::E4B));
            }
            if E6B_HEX.contains(&hex.as_str()) {
                return Some((DetectionMethod::Hex, Classification::E6B));
            }
        }

        if let Some(callsign) = msg.callsign() {
            let callsign = callsign.to_uppercase();
            if CALLSIGN_PREFIXES.iter().any(|p| callsign.starts_with(p)) {
                return Some((DetectionMethod::Callsign, Classification::E6B));
            }
        }

        if let Some(tail) = msg.tail.as_deref() {
            let tail = tail.trim().to_uppercase();
            if let Some((_, classification)) = TAILS.iter().find(|(t, _)| *t == tail) {
                return Some((DetectionMethod::Tail, *classification));
            }
        }

        if let Some(classification) = aircraft_type.and_then(Self::classify_type) {
            return Some((DetectionMethod::Type, classification));
        }

        None
    }

    /// Classify a free-form aircraft type string (from the registration
    /// table).
    pub fn classify_type(type_string: &str) -> Option<Classification> {
        let upper = type_string.to_uppercase();
        if E6B_TYPE_MARKERS.iter().any(|m| upper.contains(m)) {
            return Some(Classification::E6B);
        }
        if E4B_TYPE_MARKERS.iter().any(|m| upper.contains(m)) {
            return Some(Classification::E4B);
        }
        None
    }

    pub fn list_active(&self) -> Vec<HfgcsAircraft> {
        self.active.iter().map(|e| e.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    /// Emit `lost` for aircraft past the stale window and drop them.
    pub fn evict_stale(&self, now: DateTime<Utc>) -> Vec<String> {
        let cutoff = now - chrono::Duration::seconds(self.stale_seconds);
        let lost: Vec<HfgcsAircraft> = self
            .active
            .iter()
            .filter(|e| e.value().last_message < cutoff)
            .map(|e| e.value().clone())
            .collect();

        let mut keys = Vec::with_capacity(lost.len());
        for aircraft in lost {
            self.active.remove(&aircraft.identifier);
            info!(identifier = %aircraft.identifier, "HFGCS aircraft lost");
            self.bus.publish(
                Topic::HfgcsAircraft,
                &json!({ "event": "lost", "aircraft": aircraft }),
            );
            keys.push(aircraft.identifier);
        }
        keys
    }
}
