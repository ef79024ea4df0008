//! Airframes ACARS/VDL/HFDL feed.
//!
//! Consumes JSON records from the upstream WebSocket when an endpoint is
//! configured. Without one (development, air-gapped testing) a timer-driven
//! mock feed generates deterministic ACARS traffic so the rest of the
//! pipeline stays exercised.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use serde::Deserialize;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::EventBus;
use crate::messages::{Message, SourceInfo, SourceType};
use crate::sources::{send_or_drop, MessageSink, Source, SourceState, SourceStats, SourceTask};

const MAX_RETRY_DELAY_SECS: u64 = 60;
const MOCK_INTERVAL_MS: u64 = 15_000;

#[derive(Debug, Clone, Default)]
pub struct AirframesConfig {
    /// Upstream WebSocket endpoint; `None` enables the mock feed.
    pub ws_url: Option<String>,
    pub api_key: Option<String>,
}

/// One upstream record. Field names follow the Airframes JSON shape.
#[derive(Debug, Deserialize)]
struct AirframesRecord {
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    kind: Option<String>,
    #[serde(default)]
    flight: Option<String>,
    #[serde(default)]
    tail: Option<String>,
    #[serde(default)]
    airline: Option<String>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    label: Option<String>,
    #[serde(default)]
    station_id: Option<String>,
    #[serde(default)]
    frequency: Option<f64>,
}

fn normalize(record: AirframesRecord) -> Message {
    let source_type = match record.kind.as_deref() {
        Some("vdlm2") => SourceType::Vdlm2,
        Some("hfdl") => SourceType::Hfdl,
        _ => SourceType::Acars,
    };
    let mut msg = Message::new(
        source_type,
        SourceInfo {
            kind: source_type.as_str().to_string(),
            station_id: record.station_id,
            frequency: record.frequency,
            api: Some("airframes".to_string()),
        },
    );
    if let Some(ts) = record.timestamp {
        msg.timestamp = ts;
    }
    msg.flight = record.flight;
    msg.tail = record.tail;
    msg.airline = record.airline;
    msg.text = record.text;
    msg.label = record.label;
    msg
}

/// Deterministic ACARS traffic for the mock feed, cycled in order.
const MOCK_MESSAGES: &[(&str, &str, &str, &str)] = &[
    ("UAL123", "N76543", "H1", "OUT 1420 OFF 1425 DEST KSFO"),
    ("BAW38", "G-XLEA", "B9", "REQUEST CLIMB FL380"),
    ("DAL89", "N301DX", "10", "POS N5530W00435 FL350"),
    ("SWA1234", "N900WN", "C1", "METAR KMDW 251851Z 22008KT 10SM FEW250"),
    ("FDX921", "N102FE", "22", "freetext ops normal"),
];

pub struct AirframesSource {
    config: AirframesConfig,
    sink: MessageSink,
    state: Arc<SourceState>,
    task: SourceTask,
}

impl AirframesSource {
    pub fn new(config: AirframesConfig, sink: MessageSink, bus: Arc<EventBus>) -> Self {
        Self {
            config,
            sink,
            state: Arc::new(SourceState::new("airframes", bus)),
            task: SourceTask::new(),
        }
    }

    async fn run_ws(
        url: String,
        sink: MessageSink,
        state: Arc<SourceState>,
        cancel: CancellationToken,
    ) {
        let mut retry_delay = 1u64;
        loop {
            if cancel.is_cancelled() {
                break;
            }
            match connect_async(url.as_str()).await {
                Ok((mut ws, _response)) => {
                    info!(url = %url, "connected to airframes feed");
                    state.set_connected(true, None);
                    retry_delay = 1;

                    loop {
                        let frame = tokio::select! {
                            _ = cancel.cancelled() => return,
                            frame = ws.next() => frame,
                        };
                        match frame {
                            Some(Ok(WsMessage::Text(payload))) => {
                                match serde_json::from_str::<AirframesRecord>(&payload) {
                                    Ok(record) => {
                                        let msg = normalize(record);
                                        if send_or_drop(&sink, msg, "airframes") {
                                            state.record_messages(1);
                                        }
                                    }
                                    Err(e) => {
                                        metrics::counter!("airframes.parse_failed").increment(1);
                                        debug!(error = %e, "unparseable airframes record");
                                    }
                                }
                            }
                            Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_))) => {}
                            Some(Ok(WsMessage::Close(_))) | None => {
                                warn!("airframes feed closed by upstream");
                                break;
                            }
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                warn!(error = %e, "airframes feed read error");
                                break;
                            }
                        }
                    }
                    state.set_connected(false, Some("connection closed"));
                }
                Err(e) => {
                    state.set_connected(false, Some(&e.to_string()));
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(Duration::from_secs(retry_delay)) => {}
            }
            retry_delay = (retry_delay * 2).min(MAX_RETRY_DELAY_SECS);
        }
    }

    async fn run_mock(sink: MessageSink, state: Arc<SourceState>, cancel: CancellationToken) {
        info!("no airframes endpoint configured, running mock feed");
        state.set_connected(true, None);
        let mut index = 0usize;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(Duration::from_millis(MOCK_INTERVAL_MS)) => {}
            }
            let (flight, tail, label, text) = MOCK_MESSAGES[index % MOCK_MESSAGES.len()];
            index += 1;

            let record = AirframesRecord {
                timestamp: Some(Utc::now()),
                kind: Some("acars".to_string()),
                flight: Some(flight.to_string()),
                tail: Some(tail.to_string()),
                airline: None,
                text: Some(text.to_string()),
                label: Some(label.to_string()),
                station_id: Some("MOCK-1".to_string()),
                frequency: Some(131.55),
            };
            if send_or_drop(&sink, normalize(record), "airframes") {
                state.record_messages(1);
            }
        }
    }
}

#[async_trait]
impl Source for AirframesSource {
    fn name(&self) -> &str {
        self.state.name()
    }

    async fn start(&self) -> Result<()> {
        let sink = self.sink.clone();
        let state = self.state.clone();
        let cancel = self.task.cancel_token();

        let handle = match self.config.ws_url.clone() {
            Some(url) => {
                // The feed authenticates via an api_key query parameter.
                let url = match &self.config.api_key {
                    Some(key) if !key.is_empty() => format!("{url}?api_key={key}"),
                    _ => url,
                };
                tokio::spawn(Self::run_ws(url, sink, state.clone(), cancel))
            }
            None => tokio::spawn(Self::run_mock(sink, state.clone(), cancel)),
        };
        self.task.set_handle(handle);
        Ok(())
    }

    async fn stop(&self) {
        self.task.stop().await;
        self.state.set_connected(false, Some("stopped"));
    }

    fn stats(&self) -> SourceStats {
        self.state.stats(if self.config.ws_url.is_some() {
            0
        } else {
            MOCK_INTERVAL_MS
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_maps_record_kinds() {
        let record: AirframesRecord = serde_json::from_str(
            r#"{"kind": "hfdl", "flight": "UAL123", "tail": "N76543",
                "text": "OUT 1420", "label": "H1", "station_id": "KJFK-1",
                "frequency": 8912.0}"#,
        )
        .unwrap();
        let msg = normalize(record);
        assert_eq!(msg.source_type, SourceType::Hfdl);
        assert_eq!(msg.flight.as_deref(), Some("UAL123"));
        assert_eq!(msg.source.station_id.as_deref(), Some("KJFK-1"));
        assert_eq!(msg.source.api.as_deref(), Some("airframes"));

        let bare: AirframesRecord = serde_json::from_str(r#"{"text": "hello"}"#).unwrap();
        assert_eq!(normalize(bare).source_type, SourceType::Acars);
    }

    #[test]
    fn test_mock_corpus_exercises_categories() {
        // The mock feed must cover OOOI, CPDLC, position, and weather so the
        // development pipeline sees every branch.
        let texts: Vec<&str> = MOCK_MESSAGES.iter().map(|(_, _, _, t)| *t).collect();
        assert!(texts.iter().any(|t| t.contains("OUT ")));
        assert!(texts.iter().any(|t| t.contains("REQUEST")));
        assert!(texts.iter().any(|t| t.contains("POS ")));
        assert!(texts.iter().any(|t| t.contains("METAR")));
    }
}
