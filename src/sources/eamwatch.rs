//! EAM.watch poll source: community-logged EAM/SKYKING broadcasts.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::bus::EventBus;
use crate::messages::{Message, SourceInfo, SourceType};
use crate::sources::{send_or_drop, MessageSink, Source, SourceState, SourceStats, SourceTask};

#[derive(Debug, Clone)]
pub struct EamWatchConfig {
    pub api_url: String,
    pub api_token: String,
    pub poll_interval_ms: u64,
}

impl Default for EamWatchConfig {
    fn default() -> Self {
        Self {
            api_url: "https://eam.watch/api".to_string(),
            api_token: String::new(),
            poll_interval_ms: 60_000,
        }
    }
}

#[derive(Debug, Deserialize)]
struct EamWatchResponse {
    #[serde(default)]
    messages: Vec<EamWatchRecord>,
    #[serde(default)]
    next_cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EamWatchRecord {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    header: Option<String>,
    body: String,
    #[serde(default)]
    confidence: Option<i64>,
    detected_at: DateTime<Utc>,
    #[serde(default)]
    codeword: Option<String>,
    #[serde(default)]
    time_code: Option<String>,
    #[serde(default)]
    authentication: Option<String>,
}

fn normalize(record: EamWatchRecord) -> Message {
    let mut msg = Message::new(
        SourceType::Eam,
        SourceInfo {
            kind: "eam".to_string(),
            station_id: None,
            frequency: None,
            api: Some("eamwatch".to_string()),
        },
    );
    msg.timestamp = record.detected_at;
    msg.hfgcs_type = Some(record.kind);
    let mut text = String::new();
    if let Some(header) = &record.header {
        text.push_str(header);
        text.push(' ');
    }
    text.push_str(&record.body);
    if let Some(confidence) = record.confidence {
        debug!(confidence, "eam.watch record confidence");
    }
    if let Some(codeword) = &record.codeword {
        text.push_str(" CODEWORD ");
        text.push_str(codeword);
    }
    if let Some(time_code) = &record.time_code {
        text.push_str(" TIME ");
        text.push_str(time_code);
    }
    if let Some(authentication) = &record.authentication {
        text.push_str(" AUTHENTICATION ");
        text.push_str(authentication);
    }
    msg.text = Some(text);
    msg
}

pub struct EamWatchSource {
    config: EamWatchConfig,
    sink: MessageSink,
    state: Arc<SourceState>,
    task: SourceTask,
    client: reqwest::Client,
    cursor: Arc<Mutex<Option<String>>>,
}

impl EamWatchSource {
    pub fn new(config: EamWatchConfig, sink: MessageSink, bus: Arc<EventBus>) -> Self {
        Self {
            config,
            sink,
            state: Arc::new(SourceState::new("eamwatch", bus)),
            task: SourceTask::new(),
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(20))
                .build()
                .expect("reqwest client"),
            cursor: Arc::new(Mutex::new(None)),
        }
    }

    async fn poll_once(
        client: &reqwest::Client,
        config: &EamWatchConfig,
        cursor: &Arc<Mutex<Option<String>>>,
        sink: &MessageSink,
        state: &Arc<SourceState>,
    ) {
        let url = format!("{}/messages", config.api_url.trim_end_matches('/'));
        let since = cursor.lock().unwrap().clone();

        let mut request = client
            .get(&url)
            .bearer_auth(&config.api_token);
        if let Some(since) = since {
            request = request.query(&[("since", since)]);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                state.set_connected(false, Some(&e.to_string()));
                return;
            }
        };

        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            state.set_connected(false, Some("unauthorized: check eamwatch.api_token"));
            return;
        }
        if !response.status().is_success() {
            state.set_connected(false, Some(&format!("HTTP {}", response.status())));
            return;
        }

        let body: EamWatchResponse = match response.json().await {
            Ok(body) => body,
            Err(e) => {
                warn!(error = %e, "bad eam.watch payload");
                state.set_connected(false, Some("bad payload"));
                return;
            }
        };

        state.set_connected(true, None);
        if let Some(next) = body.next_cursor {
            *cursor.lock().unwrap() = Some(next);
        }

        let mut sent = 0u64;
        for record in body.messages {
            if send_or_drop(sink, normalize(record), "eamwatch") {
                sent += 1;
            }
        }
        if sent > 0 {
            state.record_messages(sent);
        }
    }
}

#[async_trait]
impl Source for EamWatchSource {
    fn name(&self) -> &str {
        self.state.name()
    }

    async fn start(&self) -> Result<()> {
        let client = self.client.clone();
        let config = self.config.clone();
        let cursor = self.cursor.clone();
        let sink = self.sink.clone();
        let state = self.state.clone();
        let cancel = self.task.cancel_token();

        let handle = tokio::spawn(async move {
            loop {
                Self::poll_once(&client, &config, &cursor, &sink, &state).await;
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_millis(config.poll_interval_ms)) => {}
                }
            }
            state.set_connected(false, Some("stopped"));
        });
        self.task.set_handle(handle);
        Ok(())
    }

    async fn stop(&self) {
        self.task.stop().await;
    }

    fn stats(&self) -> SourceStats {
        self.state.stats(self.config.poll_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_builds_searchable_text() {
        let record: EamWatchRecord = serde_json::from_str(
            r#"{"type": "SKYKING", "body": "DO NOT ANSWER",
                "confidence": 92, "detected_at": "2026-07-04T11:02:00Z",
                "codeword": "BLUEBIRD", "time_code": "02",
                "authentication": "TANGO UNIFORM"}"#,
        )
        .unwrap();
        let msg = normalize(record);
        assert_eq!(msg.source_type, SourceType::Eam);
        assert_eq!(msg.hfgcs_type.as_deref(), Some("SKYKING"));
        let text = msg.text.unwrap();
        assert!(text.contains("CODEWORD BLUEBIRD"));
        assert!(text.contains("TIME 02"));
        assert!(text.contains("AUTHENTICATION TANGO UNIFORM"));
        assert_eq!(
            msg.timestamp,
            "2026-07-04T11:02:00Z".parse::<DateTime<Utc>>().unwrap()
        );
    }

    #[test]
    fn test_normalize_with_header_prefixes_body() {
        let record: EamWatchRecord = serde_json::from_str(
            r#"{"type": "EAM", "header": "ABC123",
                "body": "ALPHA BRAVO CHARLIE",
                "detected_at": "2026-07-04T11:02:00Z"}"#,
        )
        .unwrap();
        let msg = normalize(record);
        assert_eq!(msg.text.as_deref(), Some("ABC123 ALPHA BRAVO CHARLIE"));
    }
}
