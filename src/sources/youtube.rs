//! YouTube livestream audio source.
//!
//! Spawns ffmpeg to decode the stream's audio track to 16-kHz mono s16le
//! PCM on stdout and frames it into the VOX pipeline. The subprocess is
//! restarted with exponential backoff when it exits, terminated gracefully
//! on stop, and force-killed three seconds later if it lingers.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::audio::RecordingPipeline;
use crate::bus::EventBus;
use crate::sources::{Source, SourceState, SourceStats, SourceTask};

const MAX_RESTART_DELAY_SECS: u64 = 60;
const KILL_GRACE: Duration = Duration::from_secs(3);
const PCM_CHUNK_BYTES: usize = 8192;

#[derive(Debug, Clone)]
pub struct YouTubeAudioConfig {
    pub feed_id: String,
    pub stream_url: String,
    pub sample_rate: u32,
}

impl Default for YouTubeAudioConfig {
    fn default() -> Self {
        Self {
            feed_id: "youtube-1".to_string(),
            stream_url: String::new(),
            sample_rate: 16_000,
        }
    }
}

pub struct YouTubeAudioSource {
    config: YouTubeAudioConfig,
    pipeline: Arc<Mutex<RecordingPipeline>>,
    state: Arc<SourceState>,
    task: SourceTask,
}

impl YouTubeAudioSource {
    pub fn new(
        config: YouTubeAudioConfig,
        pipeline: RecordingPipeline,
        bus: Arc<EventBus>,
    ) -> Self {
        let name = format!("youtube:{}", config.feed_id);
        Self {
            config,
            pipeline: Arc::new(Mutex::new(pipeline)),
            state: Arc::new(SourceState::new(name, bus)),
            task: SourceTask::new(),
        }
    }

    fn spawn_ffmpeg(config: &YouTubeAudioConfig) -> std::io::Result<Child> {
        Command::new("ffmpeg")
            .args([
                "-hide_banner",
                "-loglevel",
                "error",
                "-i",
                &config.stream_url,
                "-vn",
                "-f",
                "s16le",
                "-acodec",
                "pcm_s16le",
                "-ac",
                "1",
                "-ar",
                &config.sample_rate.to_string(),
                "pipe:1",
            ])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
    }

    /// SIGTERM, wait up to the grace period, then SIGKILL.
    async fn terminate(mut child: Child) {
        if let Some(pid) = child.id() {
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
        }
        if tokio::time::timeout(KILL_GRACE, child.wait()).await.is_err() {
            warn!("ffmpeg ignored SIGTERM, killing");
            let _ = child.kill().await;
        }
    }

    async fn run(
        config: YouTubeAudioConfig,
        pipeline: Arc<Mutex<RecordingPipeline>>,
        state: Arc<SourceState>,
        cancel: CancellationToken,
    ) {
        let mut restart_delay = 1u64;

        loop {
            if cancel.is_cancelled() {
                break;
            }

            let mut child = match Self::spawn_ffmpeg(&config) {
                Ok(child) => child,
                Err(e) => {
                    state.set_connected(false, Some(&format!("ffmpeg spawn failed: {e}")));
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(Duration::from_secs(restart_delay)) => {}
                    }
                    restart_delay = (restart_delay * 2).min(MAX_RESTART_DELAY_SECS);
                    continue;
                }
            };
            let Some(mut stdout) = child.stdout.take() else {
                warn!("ffmpeg started without stdout pipe");
                Self::terminate(child).await;
                continue;
            };

            info!(feed_id = %config.feed_id, "ffmpeg decoding started");
            state.set_connected(true, None);
            restart_delay = 1;

            let mut buffer = vec![0u8; PCM_CHUNK_BYTES];
            // One decoded byte can straddle a read boundary.
            let mut carry: Option<u8> = None;

            loop {
                let read = tokio::select! {
                    _ = cancel.cancelled() => {
                        Self::terminate(child).await;
                        let mut pipeline = pipeline.lock().await;
                        pipeline.flush().await;
                        state.set_connected(false, Some("stopped"));
                        return;
                    }
                    read = stdout.read(&mut buffer) => read,
                };

                match read {
                    Ok(0) => {
                        warn!(feed_id = %config.feed_id, "ffmpeg stream ended");
                        break;
                    }
                    Ok(n) => {
                        let mut bytes = Vec::with_capacity(n + 1);
                        if let Some(first) = carry.take() {
                            bytes.push(first);
                        }
                        bytes.extend_from_slice(&buffer[..n]);
                        if bytes.len() % 2 == 1 {
                            carry = bytes.pop();
                        }

                        let samples: Vec<i16> = bytes
                            .chunks_exact(2)
                            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
                            .collect();
                        let mut pipeline = pipeline.lock().await;
                        pipeline.feed(&samples).await;
                        state.record_messages(0);
                    }
                    Err(e) => {
                        warn!(feed_id = %config.feed_id, error = %e, "pcm read error");
                        break;
                    }
                }
            }

            Self::terminate(child).await;
            {
                let mut pipeline = pipeline.lock().await;
                pipeline.flush().await;
            }
            state.set_connected(false, Some("ffmpeg exited"));

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(Duration::from_secs(restart_delay)) => {}
            }
            restart_delay = (restart_delay * 2).min(MAX_RESTART_DELAY_SECS);
        }
    }
}

#[async_trait]
impl Source for YouTubeAudioSource {
    fn name(&self) -> &str {
        self.state.name()
    }

    async fn start(&self) -> Result<()> {
        let config = self.config.clone();
        let pipeline = self.pipeline.clone();
        let state = self.state.clone();
        let cancel = self.task.cancel_token();

        let handle = tokio::spawn(Self::run(config, pipeline, state, cancel));
        self.task.set_handle(handle);
        Ok(())
    }

    async fn stop(&self) {
        self.task.stop().await;
    }

    fn stats(&self) -> SourceStats {
        self.state.stats(0)
    }
}
