//! Single-pass message enrichment pipeline.
//!
//! Every inbound message flows through: number → categorize → extract →
//! validate → branch (persist / track) → publish. A malformed record never
//! halts the pipeline; each stage counts its own failures and moves on.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, instrument, warn};

use crate::aircraft_repo::AircraftRepository;
use crate::bus::{EventBus, Topic};
use crate::messages::{Category, Message, OooiEvent, SourceType, Validation};
use crate::messages_repo::MessagesRepository;
use crate::schema_validator::SchemaValidator;
use crate::tracker::{AircraftTracker, HfgcsTracker};

static OOOI_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(OUT|OFF|ON|IN)\s+(\d{3,4})Z?\b").unwrap());
static POS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\bPOS\b.*([NS]\d{4,6}[EW]\d{5,7})").unwrap());
static COORD_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"([NS])(\d{4,6})([EW])(\d{5,7})").unwrap());
static ALT_FL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\bFL(\d{3})\b").unwrap());
static ALT_FT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b(\d{4,5})\s*FT\b").unwrap());
static CPDLC_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(REQUEST|CLEARED|CLIMB|DESCEND)\b").unwrap());
static WEATHER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(METAR|TAF|SPECI|ATIS)\b").unwrap());
static HFGCS_TEXT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(SKYKING|EAM)\b").unwrap());

/// Datalink labels that carry CPDLC uplink/downlink payloads.
const CPDLC_LABELS: &[&str] = &["A6", "AA", "B9", "BA"];

/// HFGCS primary voice frequencies (kHz).
const HFGCS_FREQUENCIES_KHZ: &[f64] = &[4724.0, 6739.0, 8992.0, 11175.0, 13200.0, 15016.0];

pub struct MessageProcessor {
    counter: AtomicU64,
    validator: Arc<SchemaValidator>,
    messages: MessagesRepository,
    aircraft_repo: AircraftRepository,
    tracker: Arc<AircraftTracker>,
    hfgcs: Arc<HfgcsTracker>,
    bus: Arc<EventBus>,
    /// hex → registry type string; `None` caches a miss so each hex is
    /// looked up at most once per process lifetime.
    type_cache: DashMap<String, Option<String>>,
}

impl MessageProcessor {
    pub fn new(
        validator: Arc<SchemaValidator>,
        messages: MessagesRepository,
        aircraft_repo: AircraftRepository,
        tracker: Arc<AircraftTracker>,
        hfgcs: Arc<HfgcsTracker>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            counter: AtomicU64::new(0),
            validator,
            messages,
            aircraft_repo,
            tracker,
            hfgcs,
            bus,
            type_cache: DashMap::new(),
        }
    }

    /// Run a message through the full pipeline. Returns the enriched message,
    /// or `None` when the record was dropped (duplicate or store failure).
    #[instrument(skip(self, msg), fields(id = %msg.id, source_type = msg.source_type.as_str()))]
    pub async fn process(&self, mut msg: Message) -> Option<Message> {
        metrics::counter!("processor.messages.total").increment(1);
        msg.message_number = Some(self.counter.fetch_add(1, Ordering::Relaxed) + 1);

        let category = categorize(&msg);
        msg.category = Some(category);
        metrics::counter!("processor.categorized", "category" => category.as_str()).increment(1);

        extract_structured(&mut msg, category);

        // ADS-B state vectors are machine-shaped; everything else gets a
        // schema check whose result rides along with the message.
        if msg.source_type != SourceType::Adsb {
            match self.validator.validate_acars_message(&msg) {
                Ok(validation) => {
                    if !validation.valid {
                        metrics::counter!("processor.validation.failed").increment(1);
                    }
                    msg.validation = Some(validation);
                }
                Err(e) => {
                    metrics::counter!("processor.validation.errored").increment(1);
                    warn!(error = %e, "schema validation errored");
                    msg.validation = Some(Validation {
                        valid: false,
                        errors: vec![e.to_string()],
                    });
                }
            }
        }

        let aircraft_type = self.resolve_aircraft_type(&msg).await;

        if msg.source_type == SourceType::Adsb {
            // Live map + bus only; ADS-B volume would dominate the store.
            if let Some((key, created)) = self.tracker.upsert(&msg) {
                if created {
                    self.backfill_registration(key);
                }
            }
        } else {
            match self.messages.save_message(&msg).await {
                Ok(true) => {}
                Ok(false) => {
                    metrics::counter!("processor.persist.duplicate").increment(1);
                    return None;
                }
                Err(e) => {
                    metrics::counter!("processor.persist.failed").increment(1);
                    warn!(error = %e, "store rejected message, dropping record");
                    return None;
                }
            }
        }

        self.hfgcs.observe(&msg, aircraft_type.as_deref());

        self.bus.publish(Topic::Message, &msg);
        Some(msg)
    }

    /// Registry type string for the message's airframe, cached per hex.
    async fn resolve_aircraft_type(&self, msg: &Message) -> Option<String> {
        let hex = msg.hex.as_deref()?.to_uppercase();
        if let Some(cached) = self.type_cache.get(&hex) {
            return cached.value().clone();
        }
        let resolved = match self.aircraft_repo.lookup_registration(&hex).await {
            Ok(record) => record.and_then(|r| r.aircraft_type),
            Err(e) => {
                debug!(error = %e, hex = %hex, "registration lookup failed");
                None
            }
        };
        self.type_cache.insert(hex, resolved.clone());
        resolved
    }

    /// Fill the live record's registration from the hex table, off the hot
    /// path.
    fn backfill_registration(&self, key: String) {
        let repo = self.aircraft_repo.clone();
        let tracker = self.tracker.clone();
        tokio::spawn(async move {
            match repo.lookup_registration(&key).await {
                Ok(Some(record)) => {
                    tracker.set_registration(&key, record.registration, record.aircraft_type);
                }
                Ok(None) => {}
                Err(e) => debug!(error = %e, key = %key, "registration backfill failed"),
            }
        });
    }
}

/// First-match-wins categorization.
pub fn categorize(msg: &Message) -> Category {
    let text = msg.text.as_deref().unwrap_or("");

    if OOOI_RE.is_match(text) {
        return Category::Oooi;
    }
    if POS_RE.is_match(text) {
        return Category::Position;
    }
    if CPDLC_RE.is_match(text)
        && msg
            .label
            .as_deref()
            .is_some_and(|l| CPDLC_LABELS.contains(&l))
    {
        return Category::Cpdlc;
    }
    if WEATHER_RE.is_match(text) {
        return Category::Weather;
    }
    if msg.source_type == SourceType::Adsb {
        return Category::Adsb;
    }
    if is_hfgcs(msg, text) {
        return Category::Hfgcs;
    }
    // A clearance-style request without a CPDLC label is ordinary ATC
    // coordination text.
    if text.contains("REQUEST") {
        return Category::AtcRequest;
    }
    Category::Freetext
}

fn is_hfgcs(msg: &Message, text: &str) -> bool {
    if matches!(msg.source_type, SourceType::Hfgcs | SourceType::Eam) {
        return true;
    }
    if let Some(freq) = msg.source.frequency {
        if HFGCS_FREQUENCIES_KHZ.iter().any(|f| (f - freq).abs() < 1.0) {
            return true;
        }
    }
    HFGCS_TEXT_RE.is_match(text)
}

/// Category-specific structured extraction.
fn extract_structured(msg: &mut Message, category: Category) {
    let text = msg.text.clone().unwrap_or_default();
    match category {
        Category::Oooi => {
            if let Some(caps) = OOOI_RE.captures(&text) {
                msg.oooi = Some(OooiEvent {
                    event: caps[1].to_string(),
                    time: caps[2].to_string(),
                });
            }
        }
        Category::Position => {
            if let Some(caps) = COORD_RE.captures(&text) {
                let coordinates_string = caps[0].to_string();
                if let Some((lat, lon)) = parse_coordinates(&caps) {
                    let altitude_ft = extract_altitude(&text);
                    msg.position = Some(crate::messages::Position {
                        lat,
                        lon,
                        altitude_ft,
                        coordinates_string: Some(coordinates_string),
                    });
                }
            }
        }
        Category::Cpdlc => {
            msg.cpdlc_type = Some(if text.contains("REQUEST") {
                "request".to_string()
            } else {
                "clearance".to_string()
            });
        }
        Category::Hfgcs => {
            if msg.hfgcs_type.is_none() {
                msg.hfgcs_type = Some(if text.contains("SKYKING") {
                    "SKYKING".to_string()
                } else if text.contains("EAM") {
                    "EAM".to_string()
                } else {
                    "broadcast".to_string()
                });
            }
        }
        _ => {}
    }
}

/// Decode `N5530W00435`-style tokens: DDMM / DDDMM, with optional trailing
/// seconds pairs.
fn parse_coordinates(caps: &regex::Captures<'_>) -> Option<(f64, f64)> {
    let lat = parse_angle(&caps[2], 2)?;
    let lon = parse_angle(&caps[4], 3)?;
    let lat = if &caps[1] == "S" { -lat } else { lat };
    let lon = if &caps[3] == "W" { -lon } else { lon };
    (lat.abs() <= 90.0 && lon.abs() <= 180.0).then_some((lat, lon))
}

fn parse_angle(digits: &str, degree_width: usize) -> Option<f64> {
    if digits.len() < degree_width + 2 {
        return None;
    }
    let degrees: f64 = digits[..degree_width].parse().ok()?;
    let minutes: f64 = digits[degree_width..degree_width + 2].parse().ok()?;
    let seconds: f64 = if digits.len() >= degree_width + 4 {
        digits[degree_width + 2..degree_width + 4].parse().ok()?
    } else {
        0.0
    };
    Some(degrees + minutes / 60.0 + seconds / 3600.0)
}

fn extract_altitude(text: &str) -> Option<i32> {
    if let Some(caps) = ALT_FL_RE.captures(text) {
        return caps[1].parse::<i32>().ok().map(|fl| fl * 100);
    }
    ALT_FT_RE
        .captures(text)
        .and_then(|caps| caps[1].parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::temp_pool;
    use crate::messages::SourceInfo;

    fn text_msg(source_type: SourceType, text: &str, label: Option<&str>) -> Message {
        let mut msg = Message::new(source_type, SourceInfo::default());
        msg.text = Some(text.to_string());
        msg.label = label.map(String::from);
        msg
    }

    async fn processor() -> (tempfile::TempDir, Arc<EventBus>, MessageProcessor) {
        let (dir, pool) = temp_pool();
        let bus = Arc::new(EventBus::default());
        let tracker = Arc::new(AircraftTracker::default());
        let hfgcs = Arc::new(HfgcsTracker::new(bus.clone(), 600));
        let processor = MessageProcessor::new(
            Arc::new(SchemaValidator::new().unwrap()),
            MessagesRepository::new(pool.clone()),
            AircraftRepository::new(pool),
            tracker,
            hfgcs,
            bus.clone(),
        );
        (dir, bus, processor)
    }

    #[test]
    fn test_categorize_first_match_wins() {
        let msg = text_msg(SourceType::Acars, "OUT 1420 OFF 1425", Some("H1"));
        assert_eq!(categorize(&msg), Category::Oooi);

        let msg = text_msg(SourceType::Acars, "POS N5530W00435 FL350", None);
        assert_eq!(categorize(&msg), Category::Position);

        let msg = text_msg(SourceType::Acars, "REQUEST CLIMB FL370", Some("B9"));
        assert_eq!(categorize(&msg), Category::Cpdlc);

        let msg = text_msg(SourceType::Acars, "METAR EGLL 251450Z 24012KT", None);
        assert_eq!(categorize(&msg), Category::Weather);

        let msg = text_msg(SourceType::Acars, "REQUEST DIRECT WAYPOINT", None);
        assert_eq!(categorize(&msg), Category::AtcRequest);

        let msg = text_msg(SourceType::Acars, "free text here", None);
        assert_eq!(categorize(&msg), Category::Freetext);
    }

    #[test]
    fn test_hfgcs_by_frequency_and_text() {
        let mut msg = text_msg(SourceType::Acars, "voice traffic", None);
        msg.source.frequency = Some(11175.0);
        assert_eq!(categorize(&msg), Category::Hfgcs);

        let msg = text_msg(SourceType::Hfgcs, "SKYKING SKYKING DO NOT ANSWER", None);
        assert_eq!(categorize(&msg), Category::Hfgcs);
    }

    #[test]
    fn test_position_extraction_decodes_coordinates() {
        let mut msg = text_msg(SourceType::Acars, "POS N5530W00435 FL350", None);
        extract_structured(&mut msg, Category::Position);
        let pos = msg.position.unwrap();
        assert!((pos.lat - 55.5).abs() < 0.001);
        assert!((pos.lon - (-4.583)).abs() < 0.01);
        assert_eq!(pos.altitude_ft, Some(35000));
        assert_eq!(pos.coordinates_string.as_deref(), Some("N5530W00435"));
    }

    #[tokio::test]
    async fn test_oooi_pipeline_enriches_persists_and_publishes() {
        let (_dir, bus, processor) = processor().await;
        let mut rx = bus.subscribe(Topic::Message);

        let mut msg = text_msg(SourceType::Acars, "OUT 1420 OFF 1425", Some("H1"));
        msg.flight = Some("UAL123".into());

        let processed = processor.process(msg).await.unwrap();
        assert_eq!(processed.category, Some(Category::Oooi));
        let oooi = processed.oooi.as_ref().unwrap();
        assert!(["OUT", "OFF"].contains(&oooi.event.as_str()));
        assert!(["1420", "1425"].contains(&oooi.time.as_str()));
        assert_eq!(processed.message_number, Some(1));
        assert!(processed.validation.as_ref().unwrap().valid);

        let event = crate::bus::next_event(&mut rx, Topic::Message).await.unwrap();
        assert_eq!(event.topic, "message");
        assert_eq!(event.data["category"], "oooi");
    }

    #[tokio::test]
    async fn test_adsb_messages_are_tracked_but_not_persisted() {
        let (_dir, _bus, processor) = processor().await;

        let mut msg = Message::new(SourceType::Adsb, SourceInfo::default());
        msg.hex = Some("4CAC55".into());
        msg.position = Some(crate::messages::Position {
            lat: 55.5,
            lon: -4.58,
            altitude_ft: Some(35000),
            coordinates_string: None,
        });

        processor.process(msg).await.unwrap();
        assert_eq!(processor.tracker.len(), 1);
        assert_eq!(processor.messages.message_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_record_is_dropped_not_fatal() {
        let (_dir, _bus, processor) = processor().await;

        let mut msg = text_msg(SourceType::Acars, "hello", None);
        msg.id = "fixed-id".into();
        assert!(processor.process(msg.clone()).await.is_some());
        assert!(processor.process(msg).await.is_none());
        assert_eq!(processor.messages.message_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_invalid_message_is_persisted_with_validation_attached() {
        let (_dir, _bus, processor) = processor().await;

        // HFGCS schema requires text; omit it.
        let msg = Message::new(SourceType::Hfgcs, SourceInfo::default());
        let processed = processor.process(msg).await.unwrap();
        let validation = processed.validation.unwrap();
        assert!(!validation.valid);
        assert!(!validation.errors.is_empty());
        assert_eq!(processor.messages.message_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_message_numbers_are_monotonic() {
        let (_dir, _bus, processor) = processor().await;
        for expected in 1..=3u64 {
            let msg = text_msg(SourceType::Acars, "x", None);
            let processed = processor.process(msg).await.unwrap();
            assert_eq!(processed.message_number, Some(expected));
        }
    }
}
