//! Layered runtime configuration.
//!
//! Values resolve store-over-environment: `AIRWAVE_<CATEGORY>_<KEY>`
//! environment variables provide defaults, and rows in the `settings` table
//! override them. `set` persists first, then fires change listeners
//! synchronously; listeners must be fast and offload blocking work.

use std::collections::HashMap;
use std::sync::{Mutex, RwLock};

use anyhow::Result;
use once_cell::sync::Lazy;
use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::AppError;
use crate::settings_repo::SettingsRepository;

/// The fixed option surface. Unknown categories or keys are rejected before
/// any write reaches the store.
static OPTION_REGISTRY: Lazy<HashMap<&'static str, &'static [&'static str]>> = Lazy::new(|| {
    let mut registry: HashMap<&'static str, &'static [&'static str]> = HashMap::new();
    registry.insert("airframes", &["enabled", "api_key", "api_url", "ws_url"]);
    registry.insert("tar1090", &["enabled", "url", "poll_interval"]);
    registry.insert(
        "adsbexchange",
        &[
            "enabled",
            "api_key",
            "api_url",
            "default_lat",
            "default_lon",
            "default_dist",
            "poll_interval",
        ],
    );
    registry.insert(
        "opensky",
        &[
            "enabled",
            "default_lat",
            "default_lon",
            "default_radius",
            "poll_interval",
        ],
    );
    registry.insert(
        "eamwatch",
        &["enabled", "api_url", "api_token", "poll_interval"],
    );
    registry.insert("whisper", &["server_url", "language", "model"]);
    registry.insert(
        "audio",
        &[
            "sample_rate",
            "speech_onset_ms",
            "silence_hang_ms",
            "max_segment_ms",
            "vad_threshold",
            "recordings_dir",
        ],
    );
    registry.insert("youtube", &["enabled", "feed_id", "stream_url"]);
    registry.insert("broadcast", &["enabled", "queue_capacity"]);
    registry.insert(
        "system",
        &[
            "database_retention_days",
            "log_level",
            "data_dir",
            "metrics_port",
            "aircraft_stale_seconds",
            "hfgcs_stale_seconds",
            "photo_retention_days",
        ],
    );
    registry.insert("photos", &["enabled", "photos_dir"]);
    registry.insert("twitter", &["enabled", "api_key"]);
    registry
});

type Listener = Box<dyn Fn(&Value) + Send + Sync>;

pub struct ConfigManager {
    settings: SettingsRepository,
    cache: RwLock<HashMap<(String, String), Value>>,
    listeners: Mutex<Vec<(String, String, Listener)>>,
}

impl ConfigManager {
    /// Build the manager and prime the cache from the store.
    pub async fn load(settings: SettingsRepository) -> Result<Self> {
        let manager = Self {
            settings,
            cache: RwLock::new(HashMap::new()),
            listeners: Mutex::new(Vec::new()),
        };

        let mut primed = 0usize;
        for category in OPTION_REGISTRY.keys() {
            for (key, value) in manager.settings.list_category(category).await? {
                manager
                    .cache
                    .write()
                    .unwrap()
                    .insert((category.to_string(), key), value);
                primed += 1;
            }
        }
        debug!(overrides = primed, "configuration loaded");
        Ok(manager)
    }

    /// The fixed key set for a category, if the category exists.
    pub fn category_keys(category: &str) -> Option<&'static [&'static str]> {
        OPTION_REGISTRY.get(category).copied()
    }

    fn validate_key(category: &str, key: &str) -> Result<(), AppError> {
        match OPTION_REGISTRY.get(category) {
            None => Err(AppError::Validation(format!(
                "unknown config category '{category}'"
            ))),
            Some(keys) if !keys.contains(&key) => Err(AppError::Validation(format!(
                "unknown config key '{category}.{key}'"
            ))),
            Some(_) => Ok(()),
        }
    }

    /// Resolve a value: store override first, then environment default.
    pub fn get(&self, category: &str, key: &str) -> Result<Option<Value>, AppError> {
        Self::validate_key(category, key)?;

        if let Some(value) = self
            .cache
            .read()
            .unwrap()
            .get(&(category.to_string(), key.to_string()))
        {
            return Ok(Some(value.clone()));
        }

        let env_name = format!(
            "AIRWAVE_{}_{}",
            category.to_uppercase(),
            key.to_uppercase()
        );
        if let Ok(raw) = std::env::var(&env_name) {
            // Numbers and booleans parse as JSON; anything else is a string.
            let value = serde_json::from_str(&raw).unwrap_or(Value::String(raw));
            return Ok(Some(value));
        }

        Ok(None)
    }

    /// Validate, persist, cache, then fire matching listeners synchronously.
    pub async fn set(&self, category: &str, key: &str, value: Value) -> Result<(), AppError> {
        Self::validate_key(category, key)?;

        self.settings
            .set_setting(category, key, &value)
            .await
            .map_err(|e| AppError::Transient(format!("persisting {category}.{key}: {e}")))?;

        self.cache
            .write()
            .unwrap()
            .insert((category.to_string(), key.to_string()), value.clone());

        let listeners = self.listeners.lock().unwrap();
        for (cat, k, callback) in listeners.iter() {
            if cat == category && k == key {
                callback(&value);
            }
        }
        Ok(())
    }

    /// Register a change listener for one (category, key). Fired after every
    /// successful `set` of that key.
    pub fn on_change<F>(&self, category: &str, key: &str, callback: F)
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        if let Err(e) = Self::validate_key(category, key) {
            warn!(error = %e, "ignoring listener for unknown config key");
            return;
        }
        self.listeners.lock().unwrap().push((
            category.to_string(),
            key.to_string(),
            Box::new(callback),
        ));
    }

    pub fn get_bool(&self, category: &str, key: &str, default: bool) -> bool {
        match self.get(category, key) {
            Ok(Some(Value::Bool(b))) => b,
            Ok(Some(Value::String(s))) => s == "true" || s == "1",
            _ => default,
        }
    }

    pub fn get_u64(&self, category: &str, key: &str, default: u64) -> u64 {
        match self.get(category, key) {
            Ok(Some(Value::Number(n))) => n.as_u64().unwrap_or(default),
            Ok(Some(Value::String(s))) => s.parse().unwrap_or(default),
            _ => default,
        }
    }

    pub fn get_i64(&self, category: &str, key: &str, default: i64) -> i64 {
        match self.get(category, key) {
            Ok(Some(Value::Number(n))) => n.as_i64().unwrap_or(default),
            Ok(Some(Value::String(s))) => s.parse().unwrap_or(default),
            _ => default,
        }
    }

    pub fn get_f64(&self, category: &str, key: &str, default: f64) -> f64 {
        match self.get(category, key) {
            Ok(Some(Value::Number(n))) => n.as_f64().unwrap_or(default),
            Ok(Some(Value::String(s))) => s.parse().unwrap_or(default),
            _ => default,
        }
    }

    pub fn get_string(&self, category: &str, key: &str) -> Option<String> {
        match self.get(category, key) {
            Ok(Some(Value::String(s))) if !s.is_empty() => Some(s),
            Ok(Some(other)) => Some(other.to_string()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::temp_pool;
    use serde_json::json;
    use serial_test::serial;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    async fn manager() -> (tempfile::TempDir, ConfigManager) {
        let (dir, pool) = temp_pool();
        let mgr = ConfigManager::load(SettingsRepository::new(pool)).await.unwrap();
        (dir, mgr)
    }

    #[tokio::test]
    async fn test_unknown_keys_are_rejected_before_set() {
        let (_dir, mgr) = manager().await;
        let err = mgr.set("tar1090", "bogus_knob", json!(1)).await.unwrap_err();
        assert_eq!(err.id(), "validation");
        let err = mgr.set("nonsense", "enabled", json!(true)).await.unwrap_err();
        assert_eq!(err.id(), "validation");
    }

    #[tokio::test]
    #[serial]
    async fn test_store_value_wins_over_environment() {
        let (_dir, mgr) = manager().await;
        unsafe {
            std::env::set_var("AIRWAVE_TAR1090_POLL_INTERVAL", "5000");
        }
        assert_eq!(mgr.get_u64("tar1090", "poll_interval", 1000), 5000);

        mgr.set("tar1090", "poll_interval", json!(2500)).await.unwrap();
        assert_eq!(mgr.get_u64("tar1090", "poll_interval", 1000), 2500);
        unsafe {
            std::env::remove_var("AIRWAVE_TAR1090_POLL_INTERVAL");
        }
    }

    #[tokio::test]
    async fn test_listeners_fire_synchronously_on_set() {
        let (_dir, mgr) = manager().await;
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = fired.clone();
        mgr.on_change("audio", "vad_threshold", move |v| {
            assert_eq!(v, &json!(650));
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });

        mgr.set("audio", "vad_threshold", json!(650)).await.unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // A different key must not fire the listener.
        mgr.set("audio", "sample_rate", json!(16000)).await.unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_overrides_survive_reload() {
        let (_dir, pool) = temp_pool();
        {
            let mgr = ConfigManager::load(SettingsRepository::new(pool.clone()))
                .await
                .unwrap();
            mgr.set("opensky", "default_radius", json!(250.0)).await.unwrap();
        }
        let mgr = ConfigManager::load(SettingsRepository::new(pool)).await.unwrap();
        assert_eq!(mgr.get_f64("opensky", "default_radius", 100.0), 250.0);
    }
}
