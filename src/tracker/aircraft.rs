//! Live aircraft map with bounded per-aircraft track history.
//!
//! Keyed by ICAO hex when available, falling back to tail then flight.
//! Upserts are O(1); the track ring never exceeds the configured capacity
//! and its timestamps are strictly increasing (out-of-order points are
//! dropped).

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tracing::debug;

use crate::messages::{Kinematics, Message, Position};

pub const DEFAULT_TRACK_CAPACITY: usize = 200;
pub const DEFAULT_STALE_SECONDS: i64 = 300;

#[derive(Debug, Clone, Serialize)]
pub struct TrackPoint {
    pub lat: f64,
    pub lon: f64,
    pub altitude_ft: Option<i32>,
    pub ground_speed: Option<f64>,
    pub heading: Option<f64>,
    pub vertical_rate: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LiveAircraft {
    pub identifier: String,
    pub hex: Option<String>,
    pub tail: Option<String>,
    pub flight: Option<String>,
    pub registration: Option<String>,
    pub aircraft_type: Option<String>,
    pub position: Option<Position>,
    pub kinematics: Option<Kinematics>,
    pub last_seen: DateTime<Utc>,
    pub message_count: u64,
    pub track: VecDeque<TrackPoint>,
}

pub struct AircraftTracker {
    aircraft: DashMap<String, LiveAircraft>,
    track_capacity: usize,
    stale_seconds: i64,
}

impl AircraftTracker {
    pub fn new(track_capacity: usize, stale_seconds: i64) -> Self {
        Self {
            aircraft: DashMap::new(),
            track_capacity,
            stale_seconds,
        }
    }

    /// Apply a message to the live map. Returns the map key and whether this
    /// was the aircraft's first sighting.
    pub fn upsert(&self, msg: &Message) -> Option<(String, bool)> {
        let key = msg.best_identifier()?;
        let mut created = false;

        let mut entry = self.aircraft.entry(key.clone()).or_insert_with(|| {
            created = true;
            LiveAircraft {
                identifier: key.clone(),
                hex: None,
                tail: None,
                flight: None,
                registration: None,
                aircraft_type: None,
                position: None,
                kinematics: None,
                last_seen: msg.timestamp,
                message_count: 0,
                track: VecDeque::with_capacity(16),
            }
        });

        let aircraft = entry.value_mut();
        if let Some(hex) = &msg.hex {
            aircraft.hex = Some(hex.to_uppercase());
        }
        if let Some(tail) = &msg.tail {
            aircraft.tail = Some(tail.clone());
        }
        if let Some(flight) = msg.callsign() {
            aircraft.flight = Some(flight.to_string());
        }
        if let Some(kin) = &msg.kinematics {
            aircraft.kinematics = Some(kin.clone());
        }
        aircraft.message_count += 1;
        if msg.timestamp > aircraft.last_seen {
            aircraft.last_seen = msg.timestamp;
        }

        if let Some(pos) = &msg.position {
            aircraft.position = Some(pos.clone());

            let in_order = aircraft
                .track
                .back()
                .map(|last| msg.timestamp > last.timestamp)
                .unwrap_or(true);
            if in_order {
                let kin = msg.kinematics.as_ref();
                aircraft.track.push_back(TrackPoint {
                    lat: pos.lat,
                    lon: pos.lon,
                    altitude_ft: pos.altitude_ft,
                    ground_speed: kin.and_then(|k| k.ground_speed),
                    heading: kin.and_then(|k| k.heading),
                    vertical_rate: kin.and_then(|k| k.vertical_rate),
                    timestamp: msg.timestamp,
                });
                while aircraft.track.len() > self.track_capacity {
                    aircraft.track.pop_front();
                }
            }
        }

        Some((key, created))
    }

    /// Backfill identity resolved out of band (hex→registration table).
    pub fn set_registration(
        &self,
        key: &str,
        registration: String,
        aircraft_type: Option<String>,
    ) {
        if let Some(mut entry) = self.aircraft.get_mut(key) {
            entry.registration = Some(registration);
            if aircraft_type.is_some() {
                entry.aircraft_type = aircraft_type;
            }
        }
    }

    /// Look up by map key first, then scan for a tail/flight match.
    pub fn get(&self, identifier: &str) -> Option<LiveAircraft> {
        let wanted = identifier.trim().to_uppercase();
        if let Some(entry) = self.aircraft.get(&wanted) {
            return Some(entry.value().clone());
        }
        self.aircraft.iter().find_map(|entry| {
            let a = entry.value();
            let matches = a.hex.as_deref() == Some(wanted.as_str())
                || a.tail.as_deref().map(str::to_uppercase) == Some(wanted.clone())
                || a.flight.as_deref().map(str::to_uppercase) == Some(wanted.clone())
                || a.registration.as_deref().map(str::to_uppercase) == Some(wanted.clone());
            matches.then(|| a.clone())
        })
    }

    pub fn list_active(&self) -> Vec<LiveAircraft> {
        self.aircraft.iter().map(|e| e.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.aircraft.len()
    }

    pub fn is_empty(&self) -> bool {
        self.aircraft.is_empty()
    }

    /// Drop aircraft not heard from within the stale window. Returns the
    /// evicted keys.
    pub fn evict_stale(&self, now: DateTime<Utc>) -> Vec<String> {
        let cutoff = now - chrono::Duration::seconds(self.stale_seconds);
        let stale: Vec<String> = self
            .aircraft
            .iter()
            .filter(|e| e.value().last_seen < cutoff)
            .map(|e| e.key().clone())
            .collect();
        for key in &stale {
            self.aircraft.remove(key);
        }
        if !stale.is_empty() {
            debug!(evicted = stale.len(), remaining = self.aircraft.len(), "evicted stale aircraft");
        }
        stale
    }
}

impl Default for AircraftTracker {
    fn default() -> Self {
        Self::new(DEFAULT_TRACK_CAPACITY, DEFAULT_STALE_SECONDS)
    }
}
