//! TAR1090 / readsb JSON snapshot backend.

use async_trait::async_trait;
use serde::Deserialize;

use crate::sources::adsb::{check_status, AdsbBackend, AdsbStateVector, FetchError};

#[derive(Debug, Clone)]
pub struct Tar1090Config {
    pub url: String,
    pub poll_interval_ms: u64,
}

impl Default for Tar1090Config {
    fn default() -> Self {
        Self {
            url: "http://localhost:8080/data/aircraft.json".to_string(),
            poll_interval_ms: 2000,
        }
    }
}

#[derive(Debug, Deserialize)]
struct AircraftJson {
    #[allow(dead_code)]
    now: f64,
    #[serde(default)]
    aircraft: Vec<AircraftEntry>,
}

#[derive(Debug, Deserialize)]
struct AircraftEntry {
    hex: String,
    #[serde(default)]
    flight: Option<String>,
    #[serde(default)]
    lat: Option<f64>,
    #[serde(default)]
    lon: Option<f64>,
    /// Feet, or the literal string "ground" while taxiing.
    #[serde(default)]
    alt_baro: Option<serde_json::Value>,
    #[serde(default)]
    gs: Option<f64>,
    #[serde(default)]
    track: Option<f64>,
    #[serde(default)]
    baro_rate: Option<f64>,
    #[serde(default)]
    squawk: Option<String>,
}

pub struct Tar1090Backend {
    config: Tar1090Config,
}

impl Tar1090Backend {
    pub fn new(config: Tar1090Config) -> Self {
        Self { config }
    }

    fn decode(entry: AircraftEntry) -> Option<AdsbStateVector> {
        // Entries without a position are metadata-only and are ignored.
        let (lat, lon) = (entry.lat?, entry.lon?);
        let (altitude_ft, on_ground) = match entry.alt_baro {
            Some(serde_json::Value::Number(n)) => (n.as_f64(), false),
            Some(serde_json::Value::String(s)) if s == "ground" => (None, true),
            _ => (None, false),
        };
        Some(AdsbStateVector {
            hex: entry.hex,
            callsign: entry.flight,
            lat,
            lon,
            altitude_ft,
            ground_speed_kt: entry.gs,
            track_deg: entry.track,
            vertical_rate_fpm: entry.baro_rate,
            on_ground,
            squawk: entry.squawk,
        })
    }
}

#[async_trait]
impl AdsbBackend for Tar1090Backend {
    fn kind(&self) -> &'static str {
        "tar1090"
    }

    fn api(&self) -> &'static str {
        "tar1090"
    }

    async fn fetch(&self, client: &reqwest::Client) -> Result<Vec<AdsbStateVector>, FetchError> {
        let response = client.get(&self.config.url).send().await?;
        let body: AircraftJson = check_status(response)?.json().await?;
        Ok(body
            .aircraft
            .into_iter()
            .filter_map(Self::decode)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_skips_entries_without_position() {
        let body: AircraftJson = serde_json::from_str(
            r#"{
                "now": 1700000000.0,
                "aircraft": [
                    {"hex": "4cac55", "flight": "BAW38 ", "lat": 55.5, "lon": -4.58,
                     "alt_baro": 35000, "gs": 450.0, "track": 180.0, "baro_rate": 0},
                    {"hex": "abcdef"},
                    {"hex": "a1b2c3", "lat": 51.1, "lon": 0.2, "alt_baro": "ground"}
                ]
            }"#,
        )
        .unwrap();

        let vectors: Vec<_> = body
            .aircraft
            .into_iter()
            .filter_map(Tar1090Backend::decode)
            .collect();
        assert_eq!(vectors.len(), 2);
        assert_eq!(vectors[0].hex, "4cac55");
        assert_eq!(vectors[0].altitude_ft, Some(35000.0));
        assert!(!vectors[0].on_ground);
        assert!(vectors[1].on_ground);
        assert_eq!(vectors[1].altitude_ft, None);
    }
}
