//! AirWave - real-time aviation-data mission-control backend
//!
//! Ingests live aviation feeds (ACARS, ADS-B, HF voice transcriptions,
//! radio livestreams), normalizes them into a canonical message model,
//! persists and indexes them in an embedded store, correlates them into
//! live aircraft tracks, an HFGCS watch list, and Emergency Action
//! Messages, and fans events out to subscribers over an in-process bus.

pub mod aircraft_repo;
pub mod audio;
pub mod bus;
pub mod commands;
pub mod config;
pub mod db;
pub mod eam;
pub mod eam_repo;
pub mod errors;
pub mod messages;
pub mod messages_repo;
pub mod metrics;
pub mod processor;
pub mod recordings_repo;
pub mod schema_validator;
pub mod settings_repo;
pub mod sources;
pub mod tracker;

pub use bus::{EventBus, Topic};
pub use errors::AppError;
pub use messages::{Category, FlightPhase, Message, SourceType};
pub use processor::MessageProcessor;
pub use tracker::{AircraftTracker, HfgcsTracker};
