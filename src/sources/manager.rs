//! Lifecycle coordinator for all configured sources.
//!
//! Each source is registered with a builder closure so `restart` can tear
//! the old instance down, rebuild from current configuration, and start
//! fresh.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Result};
use tracing::{info, warn};

use crate::sources::{Source, SourceStats};

type SourceBuilder = Box<dyn Fn() -> Arc<dyn Source> + Send + Sync>;

pub struct SourceManager {
    builders: HashMap<String, SourceBuilder>,
    running: HashMap<String, Arc<dyn Source>>,
    /// Registration order, preserved for deterministic boot/shutdown.
    order: Vec<String>,
}

impl SourceManager {
    pub fn new() -> Self {
        Self {
            builders: HashMap::new(),
            running: HashMap::new(),
            order: Vec::new(),
        }
    }

    /// Register a source under a stable name. The builder is re-invoked on
    /// every (re)start so it always sees current configuration.
    pub fn register<F>(&mut self, name: impl Into<String>, builder: F)
    where
        F: Fn() -> Arc<dyn Source> + Send + Sync + 'static,
    {
        let name = name.into();
        self.order.push(name.clone());
        self.builders.insert(name, Box::new(builder));
    }

    pub async fn start_all(&mut self) {
        for name in self.order.clone() {
            if let Err(e) = self.start(&name).await {
                warn!(source = %name, error = %e, "failed to start source");
            }
        }
        info!(running = self.running.len(), "sources started");
    }

    pub async fn start(&mut self, name: &str) -> Result<()> {
        if self.running.contains_key(name) {
            bail!("source '{name}' is already running");
        }
        let Some(builder) = self.builders.get(name) else {
            bail!("unknown source '{name}'");
        };
        let source = builder();
        source.start().await?;
        info!(source = %name, "source started");
        self.running.insert(name.to_string(), source);
        Ok(())
    }

    /// Stop one source, awaiting its clean shutdown.
    pub async fn stop(&mut self, name: &str) -> Result<()> {
        match self.running.remove(name) {
            Some(source) => {
                source.stop().await;
                info!(source = %name, "source stopped");
                Ok(())
            }
            None => bail!("source '{name}' is not running"),
        }
    }

    /// Stop, rebuild from current config, start.
    pub async fn restart(&mut self, name: &str) -> Result<()> {
        if self.running.contains_key(name) {
            self.stop(name).await?;
        }
        self.start(name).await
    }

    pub async fn stop_all(&mut self) {
        // Reverse registration order, mirroring boot.
        for name in self.order.clone().into_iter().rev() {
            if self.running.contains_key(name.as_str()) {
                let _ = self.stop(&name).await;
            }
        }
    }

    pub fn running_count(&self) -> usize {
        self.running.len()
    }

    pub fn stats(&self) -> Vec<(String, SourceStats)> {
        self.order
            .iter()
            .filter_map(|name| {
                self.running
                    .get(name)
                    .map(|source| (name.clone(), source.stats()))
            })
            .collect()
    }
}

impl Default for SourceManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSource {
        starts: Arc<AtomicUsize>,
        stops: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Source for CountingSource {
        fn name(&self) -> &str {
            "counting"
        }

        async fn start(&self) -> Result<()> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn stop(&self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }

        fn stats(&self) -> SourceStats {
            SourceStats {
                connected: true,
                tracked_entities: 0,
                last_update: None,
                update_interval_ms: 1000,
                message_count: 0,
            }
        }
    }

    fn counters() -> (Arc<AtomicUsize>, Arc<AtomicUsize>) {
        (Arc::new(AtomicUsize::new(0)), Arc::new(AtomicUsize::new(0)))
    }

    #[tokio::test]
    async fn test_restart_rebuilds_the_source() {
        let (starts, stops) = counters();
        let (starts_clone, stops_clone) = (starts.clone(), stops.clone());

        let mut manager = SourceManager::new();
        manager.register("counting", move || {
            Arc::new(CountingSource {
                starts: starts_clone.clone(),
                stops: stops_clone.clone(),
            }) as Arc<dyn Source>
        });

        manager.start_all().await;
        assert_eq!(manager.running_count(), 1);
        assert_eq!(starts.load(Ordering::SeqCst), 1);

        manager.restart("counting").await.unwrap();
        assert_eq!(stops.load(Ordering::SeqCst), 1);
        assert_eq!(starts.load(Ordering::SeqCst), 2);
        assert_eq!(manager.running_count(), 1);

        manager.stop_all().await;
        assert_eq!(stops.load(Ordering::SeqCst), 2);
        assert_eq!(manager.running_count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_source_errors() {
        let mut manager = SourceManager::new();
        assert!(manager.start("nope").await.is_err());
        assert!(manager.stop("nope").await.is_err());
    }

    #[tokio::test]
    async fn test_stats_reports_running_sources() {
        let (starts, stops) = counters();
        let mut manager = SourceManager::new();
        manager.register("counting", move || {
            Arc::new(CountingSource {
                starts: starts.clone(),
                stops: stops.clone(),
            }) as Arc<dyn Source>
        });
        assert!(manager.stats().is_empty());
        manager.start_all().await;
        let stats = manager.stats();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].0, "counting");
    }
}
