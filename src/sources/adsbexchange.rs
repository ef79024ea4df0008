//! ADS-B Exchange keyed API backend.

use async_trait::async_trait;
use serde::Deserialize;

use crate::sources::adsb::{check_status, AdsbBackend, AdsbStateVector, FetchError};

#[derive(Debug, Clone)]
pub struct AdsbExchangeConfig {
    pub api_url: String,
    pub api_key: String,
    pub default_lat: f64,
    pub default_lon: f64,
    /// Search radius in nautical miles.
    pub default_dist: f64,
    pub poll_interval_ms: u64,
}

impl Default for AdsbExchangeConfig {
    fn default() -> Self {
        Self {
            api_url: "https://adsbexchange-com1.p.rapidapi.com/v2".to_string(),
            api_key: String::new(),
            default_lat: 39.0,
            default_lon: -77.0,
            default_dist: 250.0,
            poll_interval_ms: 5000,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ExchangeResponse {
    #[serde(default)]
    ac: Vec<ExchangeAircraft>,
}

#[derive(Debug, Deserialize)]
struct ExchangeAircraft {
    hex: String,
    #[serde(default)]
    flight: Option<String>,
    #[serde(default)]
    lat: Option<f64>,
    #[serde(default)]
    lon: Option<f64>,
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

pub struct AdsbExchangeBackend {
    config: AdsbExchangeConfig,
}

impl AdsbExchangeBackend {
    pub fn new(config: AdsbExchangeConfig) -> Self {
        Self { config }
    }

    fn decode(entry: ExchangeAircraft) -> Option<AdsbStateVector> {
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
impl AdsbBackend for AdsbExchangeBackend {
    fn kind(&self) -> &'static str {
        "adsbexchange"
    }

    fn api(&self) -> &'static str {
        "adsbexchange"
    }

    async fn fetch(&self, client: &reqwest::Client) -> Result<Vec<AdsbStateVector>, FetchError> {
        let url = format!(
            "{}/lat/{}/lon/{}/dist/{}/",
            self.config.api_url.trim_end_matches('/'),
            self.config.default_lat,
            self.config.default_lon,
            self.config.default_dist,
        );
        let response = client
            .get(&url)
            .header("x-rapidapi-key", &self.config.api_key)
            .send()
            .await?;
        let body: ExchangeResponse = check_status(response)?.json().await?;
        Ok(body.ac.into_iter().filter_map(Self::decode).collect())
    }
}
