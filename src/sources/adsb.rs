//! Shared ADS-B polling behavior.
//!
//! Concrete providers (TAR1090, OpenSky, ADS-B Exchange) implement
//! [`AdsbBackend::fetch`] and delegate everything else here: flight-phase
//! derivation, coordinate formatting, the significant-change gate, rate-limit
//! backoff, and message construction.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, warn};

use crate::bus::{EventBus, Topic};
use crate::messages::{FlightPhase, Kinematics, Message, Position, SourceInfo, SourceType};
use crate::sources::{send_or_drop, MessageSink, Source, SourceState, SourceStats, SourceTask};

/// Degrees of lat/lon movement that counts as a position change (~150 m).
const POSITION_DELTA_DEG: f64 = 0.0015;
const ALTITUDE_DELTA_FT: f64 = 1000.0;
const GROUND_SPEED_DELTA_KT: f64 = 50.0;
const HEADING_DELTA_DEG: f64 = 30.0;

pub const MAX_POLL_INTERVAL_MS: u64 = 60_000;

pub const FEET_PER_METER: f64 = 3.280_839_895;
pub const KNOTS_PER_MPS: f64 = 1.943_844_49;

/// One normalized upstream state vector. Entries without a position never
/// get this far; backends skip them during decode.
#[derive(Debug, Clone)]
pub struct AdsbStateVector {
    pub hex: String,
    pub callsign: Option<String>,
    pub lat: f64,
    pub lon: f64,
    pub altitude_ft: Option<f64>,
    pub ground_speed_kt: Option<f64>,
    pub track_deg: Option<f64>,
    pub vertical_rate_fpm: Option<f64>,
    pub on_ground: bool,
    pub squawk: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("rate limited by upstream")]
    RateLimited,
    #[error("upstream error: {0}")]
    Upstream(String),
}

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        FetchError::Upstream(e.to_string())
    }
}

/// Map an HTTP response to the fetch outcome, folding 429 into the
/// rate-limit signal the poll loop backs off on.
pub fn check_status(response: reqwest::Response) -> Result<reqwest::Response, FetchError> {
    if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
        return Err(FetchError::RateLimited);
    }
    if !response.status().is_success() {
        return Err(FetchError::Upstream(format!(
            "HTTP {}",
            response.status()
        )));
    }
    Ok(response)
}

#[async_trait]
pub trait AdsbBackend: Send + Sync {
    /// Provider identifier, used for the message `source.type`.
    fn kind(&self) -> &'static str;

    /// API label carried on every emitted message.
    fn api(&self) -> &'static str;

    /// Fetch one snapshot of state vectors.
    async fn fetch(&self, client: &reqwest::Client) -> Result<Vec<AdsbStateVector>, FetchError>;
}

/// Flight-phase derivation from kinematics alone.
pub fn derive_flight_phase(sv: &AdsbStateVector) -> FlightPhase {
    let altitude = sv.altitude_ft;
    let vertical_rate = sv.vertical_rate_fpm;

    if sv.on_ground || altitude.is_some_and(|a| a < 100.0) {
        return FlightPhase::Taxi;
    }
    let (alt, vr) = match (altitude, vertical_rate) {
        (Some(alt), Some(vr)) => (alt, vr),
        (Some(alt), None) => (alt, 0.0),
        _ => return FlightPhase::Unknown,
    };
    if vr > 1000.0 && alt < 20_000.0 {
        return FlightPhase::Takeoff;
    }
    if vr < -1000.0 {
        return FlightPhase::Descent;
    }
    if alt < 10_000.0 && vr.abs() <= 500.0 {
        return FlightPhase::Approach;
    }
    if alt >= 20_000.0 && vr.abs() <= 500.0 {
        return FlightPhase::Cruise;
    }
    FlightPhase::Unknown
}

/// `N/S DDMM E/W DDDMM` with zero-padded 4/5 digit groups, e.g.
/// `N5530W00435`.
pub fn coordinates_string(lat: f64, lon: f64) -> String {
    fn split(value: f64) -> (u32, u32) {
        let abs = value.abs();
        let mut degrees = abs.trunc() as u32;
        let mut minutes = ((abs - abs.trunc()) * 60.0).round() as u32;
        if minutes == 60 {
            degrees += 1;
            minutes = 0;
        }
        (degrees, minutes)
    }
    let (lat_deg, lat_min) = split(lat);
    let (lon_deg, lon_min) = split(lon);
    format!(
        "{}{:02}{:02}{}{:03}{:02}",
        if lat < 0.0 { 'S' } else { 'N' },
        lat_deg,
        lat_min,
        if lon < 0.0 { 'W' } else { 'E' },
        lon_deg,
        lon_min,
    )
}

/// Snapshot state for one airframe, kept between polls to gate emission.
#[derive(Debug, Clone)]
pub struct LastEmitted {
    pub lat: f64,
    pub lon: f64,
    pub altitude_ft: Option<f64>,
    pub ground_speed_kt: Option<f64>,
    pub track_deg: Option<f64>,
    pub phase: FlightPhase,
}

impl LastEmitted {
    fn from_vector(sv: &AdsbStateVector, phase: FlightPhase) -> Self {
        Self {
            lat: sv.lat,
            lon: sv.lon,
            altitude_ft: sv.altitude_ft,
            ground_speed_kt: sv.ground_speed_kt,
            track_deg: sv.track_deg,
            phase,
        }
    }
}

fn option_delta_at_least(prev: Option<f64>, next: Option<f64>, threshold: f64) -> bool {
    match (prev, next) {
        (Some(p), Some(n)) => (p - n).abs() >= threshold,
        (None, None) => false,
        // A field appearing or vanishing is a state change worth emitting.
        _ => true,
    }
}

fn heading_delta(prev: f64, next: f64) -> f64 {
    let diff = (prev - next).abs() % 360.0;
    diff.min(360.0 - diff)
}

/// The emit gate: true when any change predicate fires (or on first
/// sighting).
pub fn is_significant_change(
    prev: Option<&LastEmitted>,
    sv: &AdsbStateVector,
    phase: FlightPhase,
) -> bool {
    let Some(prev) = prev else {
        return true;
    };
    if (prev.lat - sv.lat).abs() > POSITION_DELTA_DEG
        || (prev.lon - sv.lon).abs() > POSITION_DELTA_DEG
    {
        return true;
    }
    if option_delta_at_least(prev.altitude_ft, sv.altitude_ft, ALTITUDE_DELTA_FT) {
        return true;
    }
    if option_delta_at_least(prev.ground_speed_kt, sv.ground_speed_kt, GROUND_SPEED_DELTA_KT) {
        return true;
    }
    if let (Some(p), Some(n)) = (prev.track_deg, sv.track_deg) {
        if heading_delta(p, n) >= HEADING_DELTA_DEG {
            return true;
        }
    }
    prev.phase != phase
}

/// Run one snapshot through the significant-change gate, updating the
/// per-hex last-emitted map. Returns the vectors to emit with their derived
/// phases.
pub fn filter_significant(
    last_emitted: &mut HashMap<String, LastEmitted>,
    snapshot: &[AdsbStateVector],
) -> Vec<(AdsbStateVector, FlightPhase)> {
    let mut emit = Vec::new();
    for sv in snapshot {
        let key = sv.hex.to_uppercase();
        let phase = derive_flight_phase(sv);
        if is_significant_change(last_emitted.get(&key), sv, phase) {
            last_emitted.insert(key, LastEmitted::from_vector(sv, phase));
            emit.push((sv.clone(), phase));
        }
    }
    emit
}

/// Build the canonical message for one emitted state vector.
pub fn build_message(sv: &AdsbStateVector, phase: FlightPhase, api: &str) -> Message {
    let mut msg = Message::new(
        SourceType::Adsb,
        SourceInfo {
            kind: "adsb".to_string(),
            station_id: None,
            frequency: None,
            api: Some(api.to_string()),
        },
    );
    msg.hex = Some(sv.hex.to_uppercase());
    msg.flight = sv
        .callsign
        .as_deref()
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(String::from);
    msg.position = Some(Position {
        lat: sv.lat,
        lon: sv.lon,
        altitude_ft: sv.altitude_ft.map(|a| a.round() as i32),
        coordinates_string: Some(coordinates_string(sv.lat, sv.lon)),
    });
    msg.kinematics = Some(Kinematics {
        ground_speed: sv.ground_speed_kt,
        heading: sv.track_deg,
        vertical_rate: sv.vertical_rate_fpm,
        on_ground: Some(sv.on_ground),
        squawk: sv.squawk.clone(),
    });
    msg.flight_phase = Some(phase);
    msg
}

/// A poll-based ADS-B source wrapping a provider backend.
pub struct AdsbSource {
    backend: Arc<dyn AdsbBackend>,
    sink: MessageSink,
    bus: Arc<EventBus>,
    state: Arc<SourceState>,
    task: SourceTask,
    client: reqwest::Client,
    base_interval_ms: u64,
    current_interval_ms: Arc<AtomicU64>,
    last_emitted: Arc<Mutex<HashMap<String, LastEmitted>>>,
}

impl AdsbSource {
    pub fn new(
        backend: Arc<dyn AdsbBackend>,
        sink: MessageSink,
        bus: Arc<EventBus>,
        poll_interval_ms: u64,
    ) -> Self {
        let state = Arc::new(SourceState::new(backend.kind(), bus.clone()));
        Self {
            backend,
            sink,
            bus,
            state,
            task: SourceTask::new(),
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(20))
                .build()
                .expect("reqwest client"),
            base_interval_ms: poll_interval_ms,
            current_interval_ms: Arc::new(AtomicU64::new(poll_interval_ms)),
            last_emitted: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    async fn poll_once(
        backend: &Arc<dyn AdsbBackend>,
        client: &reqwest::Client,
        sink: &MessageSink,
        bus: &Arc<EventBus>,
        state: &Arc<SourceState>,
        last_emitted: &Arc<Mutex<HashMap<String, LastEmitted>>>,
        base_interval_ms: u64,
        current_interval_ms: &Arc<AtomicU64>,
    ) {
        match backend.fetch(client).await {
            Ok(snapshot) => {
                state.set_connected(true, None);
                // A successful poll restores the base cadence.
                current_interval_ms.store(base_interval_ms, Ordering::Relaxed);
                state.set_tracked_entities(snapshot.len());

                let to_emit = {
                    let mut last = last_emitted.lock().unwrap();
                    filter_significant(&mut last, &snapshot)
                };

                let mut sent = 0u64;
                for (sv, phase) in &to_emit {
                    let msg = build_message(sv, *phase, backend.api());
                    // On overflow the snapshot itself is the coalesced state;
                    // the next poll re-evaluates every aircraft.
                    if send_or_drop(sink, msg, backend.kind()) {
                        sent += 1;
                    }
                }
                state.record_messages(sent);

                bus.publish(
                    Topic::AdsbBatch,
                    &json!({
                        "source": backend.kind(),
                        "aircraft_total": snapshot.len(),
                        "emitted": to_emit.len(),
                    }),
                );
                debug!(
                    source = backend.kind(),
                    total = snapshot.len(),
                    emitted = to_emit.len(),
                    "poll cycle complete"
                );
            }
            Err(FetchError::RateLimited) => {
                let next = (current_interval_ms.load(Ordering::Relaxed) * 2)
                    .min(MAX_POLL_INTERVAL_MS);
                current_interval_ms.store(next, Ordering::Relaxed);
                metrics::counter!("source.rate_limited", "source" => backend.kind()).increment(1);
                warn!(
                    source = backend.kind(),
                    next_interval_ms = next,
                    "rate limited, backing off"
                );
            }
            Err(e) => {
                // Keep the previous snapshot; transient upstream failures
                // never crash the poll loop.
                state.set_connected(false, Some(&e.to_string()));
            }
        }
    }
}

#[async_trait]
impl Source for AdsbSource {
    fn name(&self) -> &str {
        self.state.name()
    }

    async fn start(&self) -> Result<()> {
        let backend = self.backend.clone();
        let client = self.client.clone();
        let sink = self.sink.clone();
        let bus = self.bus.clone();
        let state = self.state.clone();
        let last_emitted = self.last_emitted.clone();
        let base_interval_ms = self.base_interval_ms;
        let current_interval_ms = self.current_interval_ms.clone();
        let cancel = self.task.cancel_token();

        let handle = tokio::spawn(async move {
            loop {
                Self::poll_once(
                    &backend,
                    &client,
                    &sink,
                    &bus,
                    &state,
                    &last_emitted,
                    base_interval_ms,
                    &current_interval_ms,
                )
                .await;

                let interval = current_interval_ms.load(Ordering::Relaxed);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_millis(interval)) => {}
                }
            }
            state.set_connected(false, Some("stopped"));
        });
        self.task.set_handle(handle);
        Ok(())
    }

    async fn stop(&self) {
        self.task.stop().await;
    }

    fn stats(&self) -> SourceStats {
        self.state
            .stats(self.current_interval_ms.load(Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vector(hex: &str, lat: f64, lon: f64, alt: f64, gs: f64, track: f64) -> AdsbStateVector {
        AdsbStateVector {
            hex: hex.to_string(),
            callsign: Some("TEST1".into()),
            lat,
            lon,
            altitude_ft: Some(alt),
            ground_speed_kt: Some(gs),
            track_deg: Some(track),
            vertical_rate_fpm: Some(0.0),
            on_ground: false,
            squawk: None,
        }
    }

    #[test]
    fn test_flight_phase_table() {
        let mut sv = vector("A", 0.0, 0.0, 35_000.0, 450.0, 180.0);
        assert_eq!(derive_flight_phase(&sv), FlightPhase::Cruise);

        sv.on_ground = true;
        assert_eq!(derive_flight_phase(&sv), FlightPhase::Taxi);
        sv.on_ground = false;

        sv.altitude_ft = Some(50.0);
        assert_eq!(derive_flight_phase(&sv), FlightPhase::Taxi);

        sv.altitude_ft = Some(8000.0);
        sv.vertical_rate_fpm = Some(1500.0);
        assert_eq!(derive_flight_phase(&sv), FlightPhase::Takeoff);

        sv.vertical_rate_fpm = Some(-1500.0);
        assert_eq!(derive_flight_phase(&sv), FlightPhase::Descent);

        sv.vertical_rate_fpm = Some(-200.0);
        assert_eq!(derive_flight_phase(&sv), FlightPhase::Approach);

        sv.altitude_ft = Some(15_000.0);
        assert_eq!(derive_flight_phase(&sv), FlightPhase::Unknown);

        sv.altitude_ft = None;
        sv.vertical_rate_fpm = None;
        assert_eq!(derive_flight_phase(&sv), FlightPhase::Unknown);
    }

    #[test]
    fn test_coordinates_string_format() {
        assert_eq!(coordinates_string(55.5, -4.583), "N5530W00435");
        assert_eq!(coordinates_string(-33.95, 151.18), "S3357E15111");
        assert_eq!(coordinates_string(0.0, 0.0), "N0000E00000");
        // Minute rounding carries into degrees instead of printing 60.
        assert_eq!(coordinates_string(54.9999, -0.9999), "N5500W00100");
    }

    #[test]
    fn test_first_sighting_always_emits() {
        let mut last = HashMap::new();
        let emitted = filter_significant(&mut last, &[vector("4CAC55", 55.5, -4.58, 35_000.0, 450.0, 180.0)]);
        assert_eq!(emitted.len(), 1);
    }

    #[test]
    fn test_identical_snapshot_is_suppressed_then_altitude_change_emits() {
        let mut last = HashMap::new();
        let sv = vector("4CAC55", 55.50, -4.58, 35_000.0, 450.0, 180.0);

        assert_eq!(filter_significant(&mut last, &[sv.clone()]).len(), 1);
        assert_eq!(filter_significant(&mut last, &[sv.clone()]).len(), 0);

        let mut changed = sv;
        changed.altitude_ft = Some(36_100.0);
        let emitted = filter_significant(&mut last, &[changed]);
        assert_eq!(emitted.len(), 1);
    }

    #[test]
    fn test_each_change_predicate_fires() {
        let base = vector("A", 50.0, 10.0, 30_000.0, 400.0, 90.0);
        let phase = derive_flight_phase(&base);
        let prev = LastEmitted::from_vector(&base, phase);

        let mut moved = base.clone();
        moved.lat += 0.002;
        assert!(is_significant_change(Some(&prev), &moved, phase));

        let mut climbed = base.clone();
        climbed.altitude_ft = Some(31_000.0);
        assert!(is_significant_change(Some(&prev), &climbed, phase));

        let mut faster = base.clone();
        faster.ground_speed_kt = Some(455.0);
        assert!(is_significant_change(Some(&prev), &faster, phase));

        let mut turned = base.clone();
        turned.track_deg = Some(125.0);
        assert!(is_significant_change(Some(&prev), &turned, phase));

        // Heading delta is modular: 350° -> 10° is a 20° turn, under the gate.
        let mut wrap_prev = prev.clone();
        wrap_prev.track_deg = Some(350.0);
        let mut wrapped = base.clone();
        wrapped.track_deg = Some(10.0);
        assert!(!is_significant_change(Some(&wrap_prev), &wrapped, phase));

        assert!(!is_significant_change(Some(&prev), &base, phase));
    }

    struct ScriptedBackend {
        responses: Mutex<std::collections::VecDeque<Result<Vec<AdsbStateVector>, FetchError>>>,
    }

    #[async_trait]
    impl AdsbBackend for ScriptedBackend {
        fn kind(&self) -> &'static str {
            "scripted"
        }

        fn api(&self) -> &'static str {
            "scripted"
        }

        async fn fetch(
            &self,
            _client: &reqwest::Client,
        ) -> Result<Vec<AdsbStateVector>, FetchError> {
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(Vec::new()))
        }
    }

    #[tokio::test]
    async fn test_rate_limit_doubles_interval_and_success_restores() {
        let responses = std::collections::VecDeque::from([
            Err(FetchError::RateLimited),
            Err(FetchError::RateLimited),
            Ok(vec![vector("A", 50.0, 10.0, 30_000.0, 400.0, 90.0)]),
        ]);
        let backend = Arc::new(ScriptedBackend {
            responses: Mutex::new(responses),
        });
        let (sink, mut rx) = tokio::sync::mpsc::channel(16);
        let bus = Arc::new(EventBus::default());
        let source = AdsbSource::new(backend, sink, bus, 1000);

        let poll = || {
            AdsbSource::poll_once(
                &source.backend,
                &source.client,
                &source.sink,
                &source.bus,
                &source.state,
                &source.last_emitted,
                source.base_interval_ms,
                &source.current_interval_ms,
            )
        };

        poll().await;
        assert_eq!(source.current_interval_ms.load(Ordering::Relaxed), 2000);
        poll().await;
        assert_eq!(source.current_interval_ms.load(Ordering::Relaxed), 4000);
        // 2xx restores the configured cadence and emits the snapshot.
        poll().await;
        assert_eq!(source.current_interval_ms.load(Ordering::Relaxed), 1000);
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_backoff_is_capped() {
        let responses: std::collections::VecDeque<_> =
            (0..12).map(|_| Err(FetchError::RateLimited)).collect();
        let backend = Arc::new(ScriptedBackend {
            responses: Mutex::new(responses),
        });
        let (sink, _rx) = tokio::sync::mpsc::channel(16);
        let source = AdsbSource::new(backend, sink, Arc::new(EventBus::default()), 1000);

        for _ in 0..12 {
            AdsbSource::poll_once(
                &source.backend,
                &source.client,
                &source.sink,
                &source.bus,
                &source.state,
                &source.last_emitted,
                source.base_interval_ms,
                &source.current_interval_ms,
            )
            .await;
        }
        assert_eq!(
            source.current_interval_ms.load(Ordering::Relaxed),
            MAX_POLL_INTERVAL_MS
        );
    }

    #[test]
    fn test_build_message_carries_position_and_phase() {
        let sv = vector("4cac55", 55.5, -4.583, 35_000.0, 450.0, 180.0);
        let msg = build_message(&sv, FlightPhase::Cruise, "tar1090");
        assert_eq!(msg.source_type, SourceType::Adsb);
        assert_eq!(msg.hex.as_deref(), Some("4CAC55"));
        assert_eq!(msg.flight.as_deref(), Some("TEST1"));
        let pos = msg.position.unwrap();
        assert_eq!(pos.altitude_ft, Some(35_000));
        assert_eq!(pos.coordinates_string.as_deref(), Some("N5530W00435"));
        assert_eq!(msg.flight_phase, Some(FlightPhase::Cruise));
        assert_eq!(msg.source.api.as_deref(), Some("tar1090"));
    }
}
