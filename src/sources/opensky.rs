//! OpenSky Network `/api/states/all` backend.
//!
//! OpenSky state vectors are positional JSON arrays with metric units;
//! altitude converts to feet and velocity to knots during decode.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use crate::sources::adsb::{
    check_status, AdsbBackend, AdsbStateVector, FetchError, FEET_PER_METER, KNOTS_PER_MPS,
};

const FPM_PER_MPS: f64 = 196.850_393_7;

#[derive(Debug, Clone)]
pub struct OpenSkyConfig {
    pub api_url: String,
    pub default_lat: f64,
    pub default_lon: f64,
    /// Half-width of the bounding box, in degrees.
    pub default_radius: f64,
    pub poll_interval_ms: u64,
}

impl Default for OpenSkyConfig {
    fn default() -> Self {
        Self {
            api_url: "https://opensky-network.org/api".to_string(),
            default_lat: 39.0,
            default_lon: -77.0,
            default_radius: 2.0,
            poll_interval_ms: 10_000,
        }
    }
}

#[derive(Debug, Deserialize)]
struct StatesResponse {
    #[allow(dead_code)]
    time: i64,
    #[serde(default)]
    states: Option<Vec<Vec<Value>>>,
}

pub struct OpenSkyBackend {
    config: OpenSkyConfig,
}

impl OpenSkyBackend {
    pub fn new(config: OpenSkyConfig) -> Self {
        Self { config }
    }

    /// Decode one positional state vector:
    /// `[icao24, callsign, origin_country, time_position, last_contact,
    ///   lon, lat, baro_alt_m, on_ground, velocity_mps, true_track,
    ///   vertical_rate_mps, ...]`
    fn decode(state: &[Value]) -> Option<AdsbStateVector> {
        let hex = state.first()?.as_str()?.trim().to_string();
        let lon = state.get(5)?.as_f64()?;
        let lat = state.get(6)?.as_f64()?;

        let callsign = state
            .get(1)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(String::from);
        let altitude_ft = state
            .get(7)
            .and_then(Value::as_f64)
            .map(|m| m * FEET_PER_METER);
        let on_ground = state.get(8).and_then(Value::as_bool).unwrap_or(false);
        let ground_speed_kt = state
            .get(9)
            .and_then(Value::as_f64)
            .map(|mps| mps * KNOTS_PER_MPS);
        let track_deg = state.get(10).and_then(Value::as_f64);
        let vertical_rate_fpm = state
            .get(11)
            .and_then(Value::as_f64)
            .map(|mps| mps * FPM_PER_MPS);

        Some(AdsbStateVector {
            hex,
            callsign,
            lat,
            lon,
            altitude_ft,
            ground_speed_kt,
            track_deg,
            vertical_rate_fpm,
            on_ground,
            squawk: None,
        })
    }
}

#[async_trait]
impl AdsbBackend for OpenSkyBackend {
    fn kind(&self) -> &'static str {
        "opensky"
    }

    fn api(&self) -> &'static str {
        "opensky"
    }

    async fn fetch(&self, client: &reqwest::Client) -> Result<Vec<AdsbStateVector>, FetchError> {
        let url = format!("{}/states/all", self.config.api_url.trim_end_matches('/'));
        let response = client
            .get(&url)
            .query(&[
                ("lamin", self.config.default_lat - self.config.default_radius),
                ("lamax", self.config.default_lat + self.config.default_radius),
                ("lomin", self.config.default_lon - self.config.default_radius),
                ("lomax", self.config.default_lon + self.config.default_radius),
            ])
            .send()
            .await?;
        let body: StatesResponse = check_status(response)?.json().await?;
        Ok(body
            .states
            .unwrap_or_default()
            .iter()
            .filter_map(|s| Self::decode(s))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_converts_metric_units() {
        let state = json!([
            "adfeb4", "ORDER01 ", "United States", 1700000000, 1700000001,
            -77.05, 38.95, 10668.0, false, 231.5, 270.0, -5.08
        ]);
        let sv = OpenSkyBackend::decode(state.as_array().unwrap()).unwrap();

        assert_eq!(sv.hex, "adfeb4");
        assert_eq!(sv.callsign.as_deref(), Some("ORDER01"));
        // 10668 m == FL350.
        assert!((sv.altitude_ft.unwrap() - 35_000.0).abs() < 1.0);
        // 231.5 m/s ~= 450 kt.
        assert!((sv.ground_speed_kt.unwrap() - 450.0).abs() < 1.0);
        // -5.08 m/s ~= -1000 fpm.
        assert!((sv.vertical_rate_fpm.unwrap() + 1000.0).abs() < 2.0);
    }

    #[test]
    fn test_decode_requires_position() {
        let state = json!(["abc123", null, "Nowhere", null, null, null, null]);
        assert!(OpenSkyBackend::decode(state.as_array().unwrap()).is_none());
    }

    #[test]
    fn test_null_states_field_yields_empty_snapshot() {
        let body: StatesResponse =
            serde_json::from_str(r#"{"time": 1700000000, "states": null}"#).unwrap();
        assert!(body.states.is_none());
    }
}
