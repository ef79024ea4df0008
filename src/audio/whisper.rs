//! Client for the external Whisper transcription server.

use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use crate::errors::AppError;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct WhisperConfig {
    pub server_url: String,
    pub language: String,
    pub model: String,
}

impl Default for WhisperConfig {
    fn default() -> Self {
        Self {
            server_url: "http://localhost:9000/transcribe".to_string(),
            language: "en".to_string(),
            model: "base.en".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WhisperResponse {
    pub text: String,
    #[serde(default)]
    pub segments: Vec<WhisperSegment>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WhisperSegment {
    pub t0: f64,
    pub t1: f64,
    pub text: String,
}

#[derive(Clone)]
pub struct WhisperClient {
    client: reqwest::Client,
    config: WhisperConfig,
}

impl WhisperClient {
    pub fn new(config: WhisperConfig) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .expect("reqwest client"),
            config,
        }
    }

    /// POST a WAV and return the transcription. Times out at 60 s and is
    /// retried once; persistent failure surfaces as `TranscriptionFailed`.
    pub async fn transcribe(&self, wav: Vec<u8>) -> Result<WhisperResponse, AppError> {
        match self.post(wav.clone()).await {
            Ok(response) => Ok(response),
            Err(first) => {
                warn!(error = %first, "whisper request failed, retrying once");
                metrics::counter!("whisper.retries").increment(1);
                self.post(wav).await.map_err(|e| {
                    AppError::ServiceUnavailable(format!("TranscriptionFailed: {e}"))
                })
            }
        }
    }

    async fn post(&self, wav: Vec<u8>) -> Result<WhisperResponse, String> {
        let response = self
            .client
            .post(&self.config.server_url)
            .query(&[
                ("language", self.config.language.as_str()),
                ("model", self.config.model.as_str()),
            ])
            .header(reqwest::header::CONTENT_TYPE, "audio/wav")
            .body(wav)
            .send()
            .await
            .map_err(|e| e.to_string())?;

        if !response.status().is_success() {
            return Err(format!("HTTP {}", response.status()));
        }
        response.json().await.map_err(|e| e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_parses_with_and_without_segments() {
        let with: WhisperResponse = serde_json::from_str(
            r#"{"text": "SKYKING SKYKING", "segments": [{"t0": 0.0, "t1": 2.4, "text": "SKYKING SKYKING"}]}"#,
        )
        .unwrap();
        assert_eq!(with.segments.len(), 1);

        let without: WhisperResponse = serde_json::from_str(r#"{"text": "static"}"#).unwrap();
        assert!(without.segments.is_empty());
        assert_eq!(without.text, "static");
    }
}
