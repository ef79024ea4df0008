//! Audio capture pipeline: VOX gating, segment persistence, and
//! transcription dispatch.

pub mod vox;
pub mod whisper;

pub use vox::{ClosedSegment, StereoVox, VoxConfig, VoxRecorder};
pub use whisper::{WhisperClient, WhisperConfig, WhisperResponse};

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::bus::{EventBus, Topic};
use crate::eam::EamAggregator;
use crate::recordings_repo::{RecordingSegment, RecordingsRepository, TranscriptionSpan};

/// In-flight transcription requests; beyond this, new segments wait on disk
/// until the worker catches up.
pub const TRANSCRIPTION_QUEUE_SIZE: usize = 64;

impl ClosedSegment {
    pub fn into_record(self) -> RecordingSegment {
        RecordingSegment {
            segment_id: self.segment_id,
            feed_id: self.feed_id,
            start_time: self.start_time,
            duration_ms: self.duration_ms,
            filepath: self.filepath.to_string_lossy().into_owned(),
            filesize: self.filesize,
            transcribed: false,
            transcription_text: None,
            transcribed_at: None,
        }
    }
}

/// Per-feed pipeline: PCM in, persisted + queued segments out.
pub struct RecordingPipeline {
    vox: VoxRecorder,
    recordings: RecordingsRepository,
    bus: Arc<EventBus>,
    jobs: mpsc::Sender<RecordingSegment>,
}

impl RecordingPipeline {
    pub fn new(
        vox: VoxRecorder,
        recordings: RecordingsRepository,
        bus: Arc<EventBus>,
        jobs: mpsc::Sender<RecordingSegment>,
    ) -> Self {
        Self {
            vox,
            recordings,
            bus,
            jobs,
        }
    }

    pub async fn feed(&mut self, samples: &[i16]) {
        for closed in self.vox.feed(samples) {
            self.handle_closed(closed).await;
        }
    }

    /// Close any open segment (stream end / shutdown).
    pub async fn flush(&mut self) {
        if let Some(closed) = self.vox.flush() {
            self.handle_closed(closed).await;
        }
    }

    async fn handle_closed(&self, closed: ClosedSegment) {
        let record = closed.into_record();

        if let Err(e) = self.recordings.save_recording(&record).await {
            warn!(
                segment_id = %record.segment_id,
                error = %e,
                "failed to persist recording segment"
            );
            metrics::counter!("audio.segment.persist_failed").increment(1);
            return;
        }

        self.bus.publish(Topic::RecordingComplete, &record);

        // Transcription is best-effort; a full queue just means the segment
        // waits for a later sweep rather than blocking capture.
        if self.jobs.try_send(record.clone()).is_err() {
            metrics::counter!("audio.transcription.queue_full").increment(1);
            debug!(segment_id = %record.segment_id, "transcription queue full");
        }
    }
}

/// Drains the transcription queue against the external Whisper server and
/// feeds results onward to the EAM aggregator.
pub struct TranscriptionWorker {
    jobs: mpsc::Receiver<RecordingSegment>,
    client: WhisperClient,
    recordings: RecordingsRepository,
    bus: Arc<EventBus>,
    aggregator: Arc<EamAggregator>,
}

impl TranscriptionWorker {
    pub fn new(
        jobs: mpsc::Receiver<RecordingSegment>,
        client: WhisperClient,
        recordings: RecordingsRepository,
        bus: Arc<EventBus>,
        aggregator: Arc<EamAggregator>,
    ) -> Self {
        Self {
            jobs,
            client,
            recordings,
            bus,
            aggregator,
        }
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        loop {
            let segment = tokio::select! {
                _ = cancel.cancelled() => break,
                segment = self.jobs.recv() => match segment {
                    Some(segment) => segment,
                    None => break,
                },
            };
            self.transcribe_one(segment).await;
        }
        debug!("transcription worker stopped");
    }

    async fn transcribe_one(&self, mut segment: RecordingSegment) {
        let wav = match tokio::fs::read(&segment.filepath).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(path = %segment.filepath, error = %e, "cannot read segment wav");
                return;
            }
        };

        let response = match self.client.transcribe(wav).await {
            Ok(response) => response,
            Err(e) => {
                warn!(segment_id = %segment.segment_id, error = %e, "transcription failed");
                metrics::counter!("whisper.failed").increment(1);
                return;
            }
        };

        let spans: Vec<TranscriptionSpan> = response
            .segments
            .iter()
            .map(|s| TranscriptionSpan {
                t0: s.t0,
                t1: s.t1,
                text: s.text.clone(),
            })
            .collect();

        match self
            .recordings
            .mark_transcribed(&segment.segment_id, &response.text, &spans)
            .await
        {
            Ok(true) => {}
            Ok(false) => return, // already filled once
            Err(e) => {
                warn!(segment_id = %segment.segment_id, error = %e, "failed to store transcription");
                return;
            }
        }

        segment.transcribed = true;
        segment.transcription_text = Some(response.text.clone());
        metrics::counter!("whisper.transcribed").increment(1);

        self.bus.publish(
            Topic::TranscriptionComplete,
            &serde_json::json!({
                "segment_id": segment.segment_id,
                "feed_id": segment.feed_id,
                "text": response.text,
                "spans": spans.len(),
            }),
        );

        if let Err(e) = self.aggregator.on_transcription(&segment).await {
            warn!(segment_id = %segment.segment_id, error = %e, "EAM aggregation failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::temp_pool;
    use chrono::Utc;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_pipeline_persists_publishes_and_queues() {
        let (_db_dir, pool) = temp_pool();
        let wav_dir = TempDir::new().unwrap();
        let bus = Arc::new(EventBus::default());
        let mut status_rx = bus.subscribe(Topic::RecordingComplete);
        let (jobs_tx, mut jobs_rx) = mpsc::channel(TRANSCRIPTION_QUEUE_SIZE);

        let config = VoxConfig {
            recordings_dir: wav_dir.path().to_path_buf(),
            ..VoxConfig::default()
        };
        let recordings = RecordingsRepository::new(pool);
        let mut pipeline = RecordingPipeline::new(
            VoxRecorder::new("hfgcs-1", config),
            recordings.clone(),
            bus.clone(),
            jobs_tx,
        );

        let speech: Vec<i16> = (0..32_000)
            .map(|i| if i % 2 == 0 { 2000 } else { -2000 })
            .collect();
        pipeline.feed(&speech).await;
        pipeline.feed(&vec![0i16; 16_000]).await;

        // Queued for transcription.
        let queued = jobs_rx.recv().await.unwrap();
        assert_eq!(queued.feed_id, "hfgcs-1");
        assert!(!queued.transcribed);

        // Persisted.
        let stored = recordings
            .get_recording(&queued.segment_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.duration_ms, 2500);

        // Announced.
        let event = crate::bus::next_event(&mut status_rx, Topic::RecordingComplete)
            .await
            .unwrap();
        assert_eq!(event.data["segment_id"], queued.segment_id);
    }

    #[tokio::test]
    async fn test_worker_exits_when_queue_closes() {
        let (_db_dir, pool) = temp_pool();
        let bus = Arc::new(EventBus::default());
        let (jobs_tx, jobs_rx) = mpsc::channel::<RecordingSegment>(4);
        let recordings = RecordingsRepository::new(pool.clone());
        let aggregator = Arc::new(EamAggregator::new(
            recordings.clone(),
            crate::eam_repo::EamRepository::new(pool),
            bus.clone(),
        ));
        let worker = TranscriptionWorker::new(
            jobs_rx,
            WhisperClient::new(WhisperConfig::default()),
            recordings,
            bus,
            aggregator,
        );

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(worker.run(cancel));
        drop(jobs_tx);
        tokio::time::timeout(std::time::Duration::from_secs(2), handle)
            .await
            .expect("worker should stop when the queue closes")
            .unwrap();
    }

    #[tokio::test]
    async fn test_closed_segment_converts_to_record() {
        // into_record carries every field across unchanged.
        let closed = ClosedSegment {
            segment_id: "s1".into(),
            feed_id: "f".into(),
            start_time: Utc::now(),
            duration_ms: 1234,
            filepath: std::path::PathBuf::from("/tmp/f_1.wav"),
            filesize: 99,
            truncated: false,
        };
        let record = closed.clone().into_record();
        assert_eq!(record.segment_id, "s1");
        assert_eq!(record.duration_ms, 1234);
        assert_eq!(record.filepath, "/tmp/f_1.wav");
        assert!(!record.transcribed);
    }
}
