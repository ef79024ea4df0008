//! Key/value settings storage backing the config manager.

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use serde_json::Value;

use crate::db::{fmt_ts, DbPool};

#[derive(Clone)]
pub struct SettingsRepository {
    pool: DbPool,
}

impl SettingsRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn get_setting(&self, category: &str, key: &str) -> Result<Option<Value>> {
        let pool = self.pool.clone();
        let (category, key) = (category.to_string(), key.to_string());
        tokio::task::spawn_blocking(move || {
            let conn = pool.get()?;
            let raw: Option<String> = conn
                .query_row(
                    "SELECT value_json FROM settings WHERE category = ?1 AND key = ?2",
                    params![category, key],
                    |row| row.get(0),
                )
                .optional()?;
            raw.map(|s| serde_json::from_str(&s).context("stored setting value"))
                .transpose()
        })
        .await?
    }

    pub async fn set_setting(&self, category: &str, key: &str, value: &Value) -> Result<()> {
        let pool = self.pool.clone();
        let (category, key) = (category.to_string(), key.to_string());
        let raw = serde_json::to_string(value).context("serializing setting value")?;
        tokio::task::spawn_blocking(move || {
            let conn = pool.get()?;
            conn.execute(
                "INSERT INTO settings (category, key, value_json, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT (category, key) DO UPDATE SET
                     value_json = excluded.value_json,
                     updated_at = excluded.updated_at",
                params![category, key, raw, fmt_ts(Utc::now())],
            )?;
            Ok(())
        })
        .await?
    }

    pub async fn list_category(&self, category: &str) -> Result<Vec<(String, Value)>> {
        let pool = self.pool.clone();
        let category = category.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get()?;
            let mut stmt = conn.prepare(
                "SELECT key, value_json FROM settings WHERE category = ?1 ORDER BY key",
            )?;
            let rows = stmt.query_map([&category], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;
            let mut entries = Vec::new();
            for row in rows {
                let (key, raw) = row?;
                entries.push((key, serde_json::from_str(&raw).context("stored setting")?));
            }
            Ok(entries)
        })
        .await?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::temp_pool;
    use serde_json::json;

    #[tokio::test]
    async fn test_set_then_get_round_trips_json() {
        let (_dir, pool) = temp_pool();
        let repo = SettingsRepository::new(pool);

        repo.set_setting("tar1090", "poll_interval", &json!(2000))
            .await
            .unwrap();
        assert_eq!(
            repo.get_setting("tar1090", "poll_interval").await.unwrap(),
            Some(json!(2000))
        );
        assert_eq!(repo.get_setting("tar1090", "missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_set_overwrites_previous_value() {
        let (_dir, pool) = temp_pool();
        let repo = SettingsRepository::new(pool);

        repo.set_setting("audio", "vad_threshold", &json!(500)).await.unwrap();
        repo.set_setting("audio", "vad_threshold", &json!(650)).await.unwrap();
        assert_eq!(
            repo.get_setting("audio", "vad_threshold").await.unwrap(),
            Some(json!(650))
        );
        assert_eq!(repo.list_category("audio").await.unwrap().len(), 1);
    }
}
