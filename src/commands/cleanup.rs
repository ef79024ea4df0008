//! One-shot retention pass over the store.

use std::path::PathBuf;

use anyhow::Result;
use tracing::info;

use crate::config::ConfigManager;
use crate::db;
use crate::errors::AppError;
use crate::settings_repo::SettingsRepository;

pub async fn handle_cleanup(
    data_dir: Option<PathBuf>,
    message_retention_days: Option<i64>,
    aircraft_stale_hours: Option<i64>,
    photo_retention_days: Option<i64>,
) -> Result<()> {
    let data_dir = data_dir.unwrap_or_else(|| PathBuf::from("data"));
    let db_path = data_dir.join("airwave.db");
    let pool = db::open_pool(&db_path)
        .map_err(|e| AppError::Fatal(format!("opening store {}: {e}", db_path.display())))?;
    db::init_schema(&pool).map_err(|e| AppError::Fatal(format!("initializing schema: {e}")))?;

    let config = ConfigManager::load(SettingsRepository::new(pool.clone())).await?;

    let message_days = message_retention_days
        .unwrap_or_else(|| config.get_i64("system", "database_retention_days", 7));
    let aircraft_hours = aircraft_stale_hours.unwrap_or(24);
    let photo_days = photo_retention_days
        .unwrap_or_else(|| config.get_i64("system", "photo_retention_days", 30));

    let report = db::cleanup(pool, message_days, aircraft_hours, photo_days).await?;
    info!(
        messages = report.messages_deleted,
        recordings = report.recordings_deleted,
        aircraft = report.aircraft_deleted,
        photos = report.photos_deleted,
        "cleanup finished"
    );
    Ok(())
}
