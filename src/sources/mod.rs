//! Upstream feed sources.
//!
//! A source owns its poll/stream loop and a last-seen snapshot, normalizes
//! upstream records into canonical messages, and pushes them into the
//! processor's bounded ingress queue. Sources never block the processor:
//! on a full queue the record is dropped (text feeds) or superseded by the
//! next snapshot (ADS-B), and the drop is counted.

pub mod adsb;
pub mod adsbexchange;
pub mod airframes;
pub mod eamwatch;
pub mod manager;
pub mod opensky;
pub mod tar1090;
pub mod youtube;

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::bus::{EventBus, Topic};
use crate::messages::Message;

/// Bound on how long `stop()` may wait for a source's in-flight work.
pub const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Ingress queue from all sources into the processor.
pub const INGRESS_QUEUE_SIZE: usize = 4096;

pub type MessageSink = mpsc::Sender<Message>;

#[derive(Debug, Clone, Serialize)]
pub struct SourceStats {
    pub connected: bool,
    pub tracked_entities: usize,
    pub last_update: Option<DateTime<Utc>>,
    pub update_interval_ms: u64,
    pub message_count: u64,
}

/// Lifecycle contract shared by poll, stream, and audio sources.
#[async_trait]
pub trait Source: Send + Sync {
    fn name(&self) -> &str;

    /// Open resources and schedule work; returns without blocking. The
    /// source reports readiness or failure via `source_status` events.
    async fn start(&self) -> Result<()>;

    /// Cancel in-flight work and release resources. Returns after the last
    /// in-flight callback, bounded by [`STOP_TIMEOUT`].
    async fn stop(&self);

    fn stats(&self) -> SourceStats;
}

/// Connection/throughput bookkeeping shared by every source implementation.
/// Publishes `source_status` on connectivity transitions only.
pub struct SourceState {
    name: String,
    bus: Arc<EventBus>,
    connected: AtomicBool,
    message_count: AtomicU64,
    tracked_entities: AtomicUsize,
    last_update: RwLock<Option<DateTime<Utc>>>,
}

impl SourceState {
    pub fn new(name: impl Into<String>, bus: Arc<EventBus>) -> Self {
        Self {
            name: name.into(),
            bus,
            connected: AtomicBool::new(false),
            message_count: AtomicU64::new(0),
            tracked_entities: AtomicUsize::new(0),
            last_update: RwLock::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_connected(&self, ok: bool, error: Option<&str>) {
        let was = self.connected.swap(ok, Ordering::SeqCst);
        if was != ok {
            if ok {
                info!(source = %self.name, "source connected");
            } else {
                warn!(source = %self.name, error = error.unwrap_or("unknown"), "source disconnected");
            }
            self.bus.publish(
                Topic::SourceStatus,
                &json!({ "source": self.name, "ok": ok, "error": error }),
            );
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn record_messages(&self, count: u64) {
        self.message_count.fetch_add(count, Ordering::Relaxed);
        *self.last_update.write().unwrap() = Some(Utc::now());
    }

    pub fn set_tracked_entities(&self, count: usize) {
        self.tracked_entities.store(count, Ordering::Relaxed);
    }

    pub fn stats(&self, update_interval_ms: u64) -> SourceStats {
        SourceStats {
            connected: self.connected.load(Ordering::SeqCst),
            tracked_entities: self.tracked_entities.load(Ordering::Relaxed),
            last_update: *self.last_update.read().unwrap(),
            update_interval_ms,
            message_count: self.message_count.load(Ordering::Relaxed),
        }
    }
}

/// Non-blocking hand-off into the processor. Returns false when the queue
/// was full and the record had to be dropped.
pub fn send_or_drop(sink: &MessageSink, msg: Message, source: &str) -> bool {
    match sink.try_send(msg) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(_)) => {
            metrics::counter!("source.ingress.dropped", "source" => source.to_string())
                .increment(1);
            false
        }
        Err(mpsc::error::TrySendError::Closed(_)) => false,
    }
}

/// A cancellable background task with the 5-second stop bound.
pub struct SourceTask {
    cancel: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl SourceTask {
    pub fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
            handle: Mutex::new(None),
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn set_handle(&self, handle: JoinHandle<()>) {
        *self.handle.lock().unwrap() = Some(handle);
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    /// Cancel and wait, aborting anything that overruns the stop bound.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let handle = self.handle.lock().unwrap().take();
        if let Some(handle) = handle {
            let abort = handle.abort_handle();
            if tokio::time::timeout(STOP_TIMEOUT, handle).await.is_err() {
                warn!("source task exceeded stop timeout, aborting");
                abort.abort();
            }
        }
    }
}

impl Default for SourceTask {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{SourceInfo, SourceType};

    #[tokio::test]
    async fn test_send_or_drop_counts_overflow() {
        let (tx, mut rx) = mpsc::channel(2);
        let msg = || Message::new(SourceType::Acars, SourceInfo::default());

        assert!(send_or_drop(&tx, msg(), "test"));
        assert!(send_or_drop(&tx, msg(), "test"));
        // Queue full: the record is dropped, not blocked on.
        assert!(!send_or_drop(&tx, msg(), "test"));

        rx.recv().await.unwrap();
        assert!(send_or_drop(&tx, msg(), "test"));
    }

    #[tokio::test]
    async fn test_source_status_fires_only_on_transitions() {
        let bus = Arc::new(EventBus::default());
        let mut rx = bus.subscribe(Topic::SourceStatus);
        let state = SourceState::new("tar1090", bus.clone());

        state.set_connected(true, None);
        state.set_connected(true, None);
        state.set_connected(false, Some("timeout"));

        let first = crate::bus::next_event(&mut rx, Topic::SourceStatus).await.unwrap();
        assert_eq!(first.data["ok"], true);
        let second = crate::bus::next_event(&mut rx, Topic::SourceStatus).await.unwrap();
        assert_eq!(second.data["ok"], false);
        assert_eq!(second.data["error"], "timeout");
        // No third event was published for the repeated `true`.
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_source_task_stop_is_bounded() {
        let task = SourceTask::new();
        let cancel = task.cancel_token();
        task.set_handle(tokio::spawn(async move {
            cancel.cancelled().await;
        }));
        assert!(task.is_running());
        task.stop().await;
        assert!(!task.is_running());
    }
}
