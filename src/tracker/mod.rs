//! Live in-memory state: the aircraft map and the HFGCS watch list.

pub mod aircraft;
pub mod hfgcs;

pub use aircraft::{AircraftTracker, LiveAircraft, TrackPoint};
pub use hfgcs::{Classification, DetectionMethod, HfgcsTracker};

use anyhow::Result;
use serde::Serialize;

use crate::aircraft_repo::{AircraftRepository, RegistrationRecord};
use crate::messages::{Message, Position};
use crate::messages_repo::MessagesRepository;

/// Combined answer for a track query: live ring + identity metadata +
/// persisted message history, resolved across flight/tail/hex.
#[derive(Debug, Serialize)]
pub struct AircraftTrackView {
    pub identifier: String,
    pub track_points: Vec<TrackPoint>,
    pub last_position: Option<Position>,
    pub metadata: Option<RegistrationRecord>,
    pub message_history: Vec<Message>,
}

pub async fn get_aircraft_track(
    identifier: &str,
    tracker: &AircraftTracker,
    messages: &MessagesRepository,
    registry: &AircraftRepository,
    history_limit: usize,
) -> Result<Option<AircraftTrackView>> {
    let live = tracker.get(identifier);
    let history = messages.get_messages_by_flight(identifier, history_limit).await?;
    if live.is_none() && history.is_empty() {
        return Ok(None);
    }

    let hex = live
        .as_ref()
        .and_then(|a| a.hex.clone())
        .or_else(|| history.iter().find_map(|m| m.hex.clone()));
    let metadata = match hex {
        Some(hex) => registry.lookup_registration(&hex).await?,
        None => None,
    };

    let (track_points, last_position) = match &live {
        Some(aircraft) => (
            aircraft.track.iter().cloned().collect(),
            aircraft.position.clone(),
        ),
        None => (Vec::new(), None),
    };

    Ok(Some(AircraftTrackView {
        identifier: identifier.trim().to_uppercase(),
        track_points,
        last_position,
        metadata,
        message_history: history,
    }))
}
