//! The long-running service: boot, wire, supervise, drain.
//!
//! Boot order is dependency order: store → schema validator → config →
//! trackers → processor → sources. Shutdown reverses it: sources stop
//! first, the processor drains its ingress queue, the store checkpoints,
//! and only then do bus subscribers go away.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::aircraft_repo::AircraftRepository;
use crate::audio::{
    RecordingPipeline, TranscriptionWorker, VoxConfig, VoxRecorder, WhisperClient, WhisperConfig,
    TRANSCRIPTION_QUEUE_SIZE,
};
use crate::bus::{EventBus, Topic, DEFAULT_QUEUE_CAPACITY};
use crate::config::ConfigManager;
use crate::db;
use crate::eam::EamAggregator;
use crate::eam_repo::EamRepository;
use crate::errors::AppError;
use crate::messages_repo::MessagesRepository;
use crate::processor::MessageProcessor;
use crate::recordings_repo::RecordingsRepository;
use crate::schema_validator::SchemaValidator;
use crate::settings_repo::SettingsRepository;
use crate::sources::adsb::AdsbSource;
use crate::sources::adsbexchange::{AdsbExchangeBackend, AdsbExchangeConfig};
use crate::sources::airframes::{AirframesConfig, AirframesSource};
use crate::sources::eamwatch::{EamWatchConfig, EamWatchSource};
use crate::sources::manager::SourceManager;
use crate::sources::opensky::{OpenSkyBackend, OpenSkyConfig};
use crate::sources::tar1090::{Tar1090Backend, Tar1090Config};
use crate::sources::youtube::{YouTubeAudioConfig, YouTubeAudioSource};
use crate::sources::{Source, INGRESS_QUEUE_SIZE};
use crate::tracker::aircraft::{DEFAULT_STALE_SECONDS, DEFAULT_TRACK_CAPACITY};
use crate::tracker::hfgcs::DEFAULT_HFGCS_STALE_SECONDS;
use crate::tracker::{AircraftTracker, HfgcsTracker};

const EVICTION_TICK: Duration = Duration::from_secs(30);
const STATS_TICK: Duration = Duration::from_secs(60);

pub async fn handle_run(data_dir: Option<PathBuf>) -> Result<()> {
    // --- Store ---------------------------------------------------------
    let data_dir = data_dir.unwrap_or_else(|| PathBuf::from("data"));
    let db_path = data_dir.join("airwave.db");
    let pool = db::open_pool(&db_path)
        .map_err(|e| AppError::Fatal(format!("opening store {}: {e}", db_path.display())))?;
    db::init_schema(&pool).map_err(|e| AppError::Fatal(format!("initializing schema: {e}")))?;
    info!(path = %db_path.display(), "store ready");

    let messages_repo = MessagesRepository::new(pool.clone());
    let aircraft_repo = AircraftRepository::new(pool.clone());
    let recordings_repo = RecordingsRepository::new(pool.clone());
    let eam_repo = EamRepository::new(pool.clone());

    // --- Schema validator ----------------------------------------------
    let validator = Arc::new(SchemaValidator::new()?);
    info!(schemas = validator.schema_names().len(), "schema validator ready");

    // --- Config --------------------------------------------------------
    let config = Arc::new(
        ConfigManager::load(SettingsRepository::new(pool.clone()))
            .await
            .context("loading configuration")?,
    );

    if let Some(port) = config
        .get_u64("system", "metrics_port", 0)
        .try_into()
        .ok()
        .filter(|p: &u16| *p != 0)
    {
        if let Err(e) = crate::metrics::init_metrics(port) {
            warn!(error = %e, "metrics exporter unavailable, continuing without it");
        }
    }

    // --- Bus & trackers -------------------------------------------------
    let queue_capacity = config.get_u64("broadcast", "queue_capacity", DEFAULT_QUEUE_CAPACITY as u64)
        as usize;
    let bus = Arc::new(EventBus::new(queue_capacity));

    let aircraft_stale =
        config.get_i64("system", "aircraft_stale_seconds", DEFAULT_STALE_SECONDS);
    let hfgcs_stale =
        config.get_i64("system", "hfgcs_stale_seconds", DEFAULT_HFGCS_STALE_SECONDS);
    let tracker = Arc::new(AircraftTracker::new(DEFAULT_TRACK_CAPACITY, aircraft_stale));
    let hfgcs = Arc::new(HfgcsTracker::new(bus.clone(), hfgcs_stale));

    // --- Processor ------------------------------------------------------
    let processor = Arc::new(MessageProcessor::new(
        validator,
        messages_repo.clone(),
        aircraft_repo.clone(),
        tracker.clone(),
        hfgcs.clone(),
        bus.clone(),
    ));

    let (ingress_tx, mut ingress_rx) = mpsc::channel(INGRESS_QUEUE_SIZE);
    let drain_processor = processor.clone();
    let drain_task = tokio::spawn(async move {
        // Runs until every sender is gone AND the queue is empty, which is
        // exactly the shutdown drain contract.
        while let Some(msg) = ingress_rx.recv().await {
            drain_processor.process(msg).await;
        }
        info!("processor ingress drained");
    });

    // --- EAM pipeline ---------------------------------------------------
    let aggregator = Arc::new(EamAggregator::new(
        recordings_repo.clone(),
        eam_repo.clone(),
        bus.clone(),
    ));

    let whisper_config = WhisperConfig {
        server_url: config
            .get_string("whisper", "server_url")
            .unwrap_or_else(|| WhisperConfig::default().server_url),
        language: config
            .get_string("whisper", "language")
            .unwrap_or_else(|| "en".to_string()),
        model: config
            .get_string("whisper", "model")
            .unwrap_or_else(|| "base.en".to_string()),
    };
    let (jobs_tx, jobs_rx) = mpsc::channel(TRANSCRIPTION_QUEUE_SIZE);
    let worker_cancel = CancellationToken::new();
    let transcription_task = tokio::spawn(
        TranscriptionWorker::new(
            jobs_rx,
            WhisperClient::new(whisper_config),
            recordings_repo.clone(),
            bus.clone(),
            aggregator.clone(),
        )
        .run(worker_cancel.clone()),
    );

    // --- Sources --------------------------------------------------------
    let mut manager = SourceManager::new();
    let mut enabled_sources: Vec<&'static str> = Vec::new();

    if config.get_bool("tar1090", "enabled", false) {
        enabled_sources.push("tar1090");
        let config = config.clone();
        let sink = ingress_tx.clone();
        let bus = bus.clone();
        manager.register("tar1090", move || {
            let backend = Tar1090Backend::new(Tar1090Config {
                url: config
                    .get_string("tar1090", "url")
                    .unwrap_or_else(|| Tar1090Config::default().url),
                poll_interval_ms: config.get_u64("tar1090", "poll_interval", 2000),
            });
            Arc::new(AdsbSource::new(
                Arc::new(backend),
                sink.clone(),
                bus.clone(),
                config.get_u64("tar1090", "poll_interval", 2000),
            )) as Arc<dyn Source>
        });
    }

    if config.get_bool("opensky", "enabled", false) {
        enabled_sources.push("opensky");
        let config = config.clone();
        let sink = ingress_tx.clone();
        let bus = bus.clone();
        manager.register("opensky", move || {
            let defaults = OpenSkyConfig::default();
            let backend = OpenSkyBackend::new(OpenSkyConfig {
                api_url: defaults.api_url.clone(),
                default_lat: config.get_f64("opensky", "default_lat", defaults.default_lat),
                default_lon: config.get_f64("opensky", "default_lon", defaults.default_lon),
                default_radius: config.get_f64("opensky", "default_radius", defaults.default_radius),
                poll_interval_ms: config.get_u64("opensky", "poll_interval", 10_000),
            });
            Arc::new(AdsbSource::new(
                Arc::new(backend),
                sink.clone(),
                bus.clone(),
                config.get_u64("opensky", "poll_interval", 10_000),
            )) as Arc<dyn Source>
        });
    }

    if config.get_bool("adsbexchange", "enabled", false) {
        enabled_sources.push("adsbexchange");
        let config = config.clone();
        let sink = ingress_tx.clone();
        let bus = bus.clone();
        manager.register("adsbexchange", move || {
            let defaults = AdsbExchangeConfig::default();
            let backend = AdsbExchangeBackend::new(AdsbExchangeConfig {
                api_url: config
                    .get_string("adsbexchange", "api_url")
                    .unwrap_or_else(|| defaults.api_url.clone()),
                api_key: config
                    .get_string("adsbexchange", "api_key")
                    .unwrap_or_default(),
                default_lat: config.get_f64("adsbexchange", "default_lat", defaults.default_lat),
                default_lon: config.get_f64("adsbexchange", "default_lon", defaults.default_lon),
                default_dist: config.get_f64("adsbexchange", "default_dist", defaults.default_dist),
                poll_interval_ms: config.get_u64("adsbexchange", "poll_interval", 5000),
            });
            Arc::new(AdsbSource::new(
                Arc::new(backend),
                sink.clone(),
                bus.clone(),
                config.get_u64("adsbexchange", "poll_interval", 5000),
            )) as Arc<dyn Source>
        });
    }

    if config.get_bool("airframes", "enabled", true) {
        enabled_sources.push("airframes");
        let config = config.clone();
        let sink = ingress_tx.clone();
        let bus = bus.clone();
        manager.register("airframes", move || {
            Arc::new(AirframesSource::new(
                AirframesConfig {
                    ws_url: config.get_string("airframes", "ws_url"),
                    api_key: config.get_string("airframes", "api_key"),
                },
                sink.clone(),
                bus.clone(),
            )) as Arc<dyn Source>
        });
    }

    if config.get_bool("eamwatch", "enabled", false) {
        enabled_sources.push("eamwatch");
        let config = config.clone();
        let sink = ingress_tx.clone();
        let bus = bus.clone();
        manager.register("eamwatch", move || {
            let defaults = EamWatchConfig::default();
            Arc::new(EamWatchSource::new(
                EamWatchConfig {
                    api_url: config
                        .get_string("eamwatch", "api_url")
                        .unwrap_or_else(|| defaults.api_url.clone()),
                    api_token: config
                        .get_string("eamwatch", "api_token")
                        .unwrap_or_default(),
                    poll_interval_ms: config.get_u64("eamwatch", "poll_interval", 60_000),
                },
                sink.clone(),
                bus.clone(),
            )) as Arc<dyn Source>
        });
    }

    if config.get_bool("youtube", "enabled", false) {
        enabled_sources.push("youtube");
        let config = config.clone();
        let bus = bus.clone();
        let recordings = recordings_repo.clone();
        let jobs = jobs_tx.clone();
        let recordings_dir = data_dir.join("atc-recordings");
        manager.register("youtube", move || {
            let feed_id = config
                .get_string("youtube", "feed_id")
                .unwrap_or_else(|| "youtube-1".to_string());
            let vox_config = VoxConfig {
                sample_rate: config.get_u64("audio", "sample_rate", 16_000) as u32,
                vad_threshold: config.get_i64("audio", "vad_threshold", 500) as i16,
                speech_onset_ms: config.get_u64("audio", "speech_onset_ms", 1000),
                silence_hang_ms: config.get_u64("audio", "silence_hang_ms", 500),
                max_segment_ms: config.get_u64("audio", "max_segment_ms", 30_000),
                recordings_dir: recordings_dir.clone(),
            };
            let pipeline = RecordingPipeline::new(
                VoxRecorder::new(feed_id.clone(), vox_config.clone()),
                recordings.clone(),
                bus.clone(),
                jobs.clone(),
            );
            Arc::new(YouTubeAudioSource::new(
                YouTubeAudioConfig {
                    feed_id,
                    stream_url: config.get_string("youtube", "stream_url").unwrap_or_default(),
                    sample_rate: vox_config.sample_rate,
                },
                pipeline,
                bus.clone(),
            )) as Arc<dyn Source>
        });
    }

    manager.start_all().await;
    let manager = Arc::new(tokio::sync::Mutex::new(manager));

    // --- Background ticks -----------------------------------------------
    let tick_cancel = CancellationToken::new();

    // Config changes restart the affected source so it picks up the new
    // settings; each source's builder re-reads config on every start.
    let (restart_tx, mut restart_rx) = mpsc::channel::<&'static str>(16);
    let restart_task = {
        let manager = manager.clone();
        let cancel = tick_cancel.clone();
        tokio::spawn(async move {
            loop {
                let name = tokio::select! {
                    _ = cancel.cancelled() => break,
                    name = restart_rx.recv() => match name {
                        Some(name) => name,
                        None => break,
                    },
                };
                let mut manager = manager.lock().await;
                match manager.restart(name).await {
                    Ok(()) => info!(source = name, "source restarted after config change"),
                    Err(e) => warn!(source = name, error = %e, "source restart failed"),
                }
            }
        })
    };
    for source_name in &enabled_sources {
        let category = *source_name;
        let Some(keys) = ConfigManager::category_keys(category) else {
            continue;
        };
        for key in keys {
            let tx = restart_tx.clone();
            let name = *source_name;
            config.on_change(category, key, move |_| {
                let _ = tx.try_send(name);
            });
        }
    }
    let eviction_task = {
        let tracker = tracker.clone();
        let hfgcs = hfgcs.clone();
        let cancel = tick_cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(EVICTION_TICK) => {}
                }
                let now = Utc::now();
                tracker.evict_stale(now);
                hfgcs.evict_stale(now);
            }
        })
    };

    let stats_task = {
        let messages = messages_repo.clone();
        let tracker = tracker.clone();
        let hfgcs = hfgcs.clone();
        let bus = bus.clone();
        let cancel = tick_cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(STATS_TICK) => {}
                }
                let today = messages.today_totals().await.unwrap_or_default();
                bus.publish(
                    Topic::StatsUpdated,
                    &serde_json::json!({
                        "live_aircraft": tracker.len(),
                        "hfgcs_active": hfgcs.len(),
                        "today_by_source": today,
                    }),
                );
            }
        })
    };

    info!("airwave up");

    // --- Wait for shutdown ----------------------------------------------
    wait_for_shutdown().await;
    info!("shutdown signal received, draining");

    // Stop restart handling before tearing sources down, then stop sources
    // so nothing new enters the pipeline.
    tick_cancel.cancel();
    drop(restart_tx);
    let _ = tokio::time::timeout(Duration::from_secs(5), restart_task).await;
    manager.lock().await.stop_all().await;

    // Drop our ingress handle; the manager's builders hold the remaining
    // sink clones, so dropping it lets the drain task finish once in-flight
    // messages are processed.
    drop(ingress_tx);
    drop(manager);
    if tokio::time::timeout(Duration::from_secs(10), drain_task).await.is_err() {
        warn!("processor drain exceeded timeout");
    }

    // Transcription worker.
    drop(jobs_tx);
    worker_cancel.cancel();
    let _ = tokio::time::timeout(Duration::from_secs(5), transcription_task).await;
    let _ = tokio::time::timeout(Duration::from_secs(5), eviction_task).await;
    let _ = tokio::time::timeout(Duration::from_secs(5), stats_task).await;

    // Flush the store last; an accepted write is never lost.
    if let Err(e) = db::flush_wal(pool).await {
        error!(error = %e, "wal checkpoint failed during shutdown");
    }

    info!("airwave stopped");
    Ok(())
}

async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            Ok(signal) => signal,
            Err(e) => {
                error!(error = %e, "cannot install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
