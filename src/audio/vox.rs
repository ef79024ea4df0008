//! Voice-operated recording gate.
//!
//! A per-feed state machine over int16 mono PCM. Sustained amplitude above
//! the threshold opens a WAV segment (the onset run is included), sustained
//! silence or the segment length cap closes it. A capped segment rolls
//! straight into a new one so long transmissions lose nothing.

use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use hound::{SampleFormat, WavSpec, WavWriter};
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct VoxConfig {
    pub sample_rate: u32,
    /// Amplitude gate on int16 samples.
    pub vad_threshold: i16,
    pub speech_onset_ms: u64,
    pub silence_hang_ms: u64,
    pub max_segment_ms: u64,
    pub recordings_dir: PathBuf,
}

impl Default for VoxConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            vad_threshold: 500,
            speech_onset_ms: 1000,
            silence_hang_ms: 500,
            max_segment_ms: 30_000,
            recordings_dir: PathBuf::from("data/atc-recordings"),
        }
    }
}

/// A finished on-disk segment, ready to persist and transcribe.
#[derive(Debug, Clone)]
pub struct ClosedSegment {
    pub segment_id: String,
    pub feed_id: String,
    pub start_time: DateTime<Utc>,
    pub duration_ms: u64,
    pub filepath: PathBuf,
    pub filesize: u64,
    /// Closed by the length cap rather than silence.
    pub truncated: bool,
}

enum VoxState {
    Idle,
    Speaking,
}

pub struct VoxRecorder {
    feed_id: String,
    config: VoxConfig,
    state: VoxState,
    onset_samples_needed: usize,
    silence_samples_needed: usize,
    max_samples: usize,
    /// Loud samples buffered while counting toward onset, written out when
    /// the segment opens so the start of speech is not clipped.
    onset_run: Vec<i16>,
    silence_run: usize,
    writer: Option<WavWriter<BufWriter<File>>>,
    segment_path: Option<PathBuf>,
    segment_start: Option<DateTime<Utc>>,
    samples_written: usize,
    base_time: DateTime<Utc>,
    clock_samples: u64,
}

impl VoxRecorder {
    pub fn new(feed_id: impl Into<String>, config: VoxConfig) -> Self {
        Self::with_base_time(feed_id, config, Utc::now())
    }

    /// Fixed time base; segment timestamps advance with the sample clock,
    /// which keeps them strictly increasing regardless of wall-clock jitter.
    pub fn with_base_time(
        feed_id: impl Into<String>,
        config: VoxConfig,
        base_time: DateTime<Utc>,
    ) -> Self {
        let per_ms = config.sample_rate as u64 / 1000;
        Self {
            feed_id: feed_id.into(),
            onset_samples_needed: (config.speech_onset_ms * per_ms) as usize,
            silence_samples_needed: (config.silence_hang_ms * per_ms) as usize,
            max_samples: (config.max_segment_ms * per_ms) as usize,
            config,
            state: VoxState::Idle,
            onset_run: Vec::new(),
            silence_run: 0,
            writer: None,
            segment_path: None,
            segment_start: None,
            samples_written: 0,
            base_time,
            clock_samples: 0,
        }
    }

    pub fn feed_id(&self) -> &str {
        &self.feed_id
    }

    fn stream_time(&self) -> DateTime<Utc> {
        self.base_time
            + Duration::milliseconds(
                (self.clock_samples * 1000 / self.config.sample_rate as u64) as i64,
            )
    }

    /// Push PCM through the gate. Returns every segment closed by this call.
    pub fn feed(&mut self, samples: &[i16]) -> Vec<ClosedSegment> {
        let mut closed = Vec::new();
        let threshold = self.config.vad_threshold as i32;

        for &sample in samples {
            self.clock_samples += 1;
            let loud = (sample as i32).abs() >= threshold;

            match self.state {
                VoxState::Idle => {
                    if loud {
                        self.onset_run.push(sample);
                        if self.onset_run.len() >= self.onset_samples_needed {
                            if let Err(e) = self.open_segment() {
                                warn!(feed_id = %self.feed_id, error = %e, "failed to open segment");
                                self.onset_run.clear();
                            }
                        }
                    } else {
                        self.onset_run.clear();
                    }
                }
                VoxState::Speaking => {
                    self.write_sample(sample);
                    if loud {
                        self.silence_run = 0;
                    } else {
                        self.silence_run += 1;
                    }

                    if self.silence_run >= self.silence_samples_needed {
                        if let Some(segment) = self.close_segment(false) {
                            closed.push(segment);
                        }
                        self.state = VoxState::Idle;
                    } else if self.samples_written >= self.max_samples {
                        if let Some(segment) = self.close_segment(true) {
                            closed.push(segment);
                        }
                        // Speech is still running: roll straight into the
                        // next segment with no onset requirement.
                        if let Err(e) = self.open_rollover_segment() {
                            warn!(feed_id = %self.feed_id, error = %e, "failed to roll segment");
                            self.state = VoxState::Idle;
                        }
                    }
                }
            }
        }

        closed
    }

    /// Close any open segment (shutdown or end of stream).
    pub fn flush(&mut self) -> Option<ClosedSegment> {
        match self.state {
            VoxState::Speaking => {
                let segment = self.close_segment(true);
                self.state = VoxState::Idle;
                segment
            }
            VoxState::Idle => None,
        }
    }

    fn open_segment(&mut self) -> Result<()> {
        // The onset run has already played out; backdate the start to its
        // first sample.
        let onset_ms =
            (self.onset_run.len() as u64 * 1000 / self.config.sample_rate as u64) as i64;
        let start = self.stream_time() - Duration::milliseconds(onset_ms);
        self.create_writer(start)?;

        let pending = std::mem::take(&mut self.onset_run);
        for sample in pending {
            self.write_sample(sample);
        }
        self.silence_run = 0;
        self.state = VoxState::Speaking;
        Ok(())
    }

    fn open_rollover_segment(&mut self) -> Result<()> {
        let start = self.stream_time();
        self.create_writer(start)?;
        self.silence_run = 0;
        Ok(())
    }

    fn create_writer(&mut self, start: DateTime<Utc>) -> Result<()> {
        std::fs::create_dir_all(&self.config.recordings_dir).with_context(|| {
            format!(
                "creating recordings directory {}",
                self.config.recordings_dir.display()
            )
        })?;
        let filename = format!("{}_{}.wav", self.feed_id, start.timestamp_millis());
        let path = self.config.recordings_dir.join(filename);

        let spec = WavSpec {
            channels: 1,
            sample_rate: self.config.sample_rate,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let writer = WavWriter::create(&path, spec)
            .with_context(|| format!("creating wav file {}", path.display()))?;

        self.writer = Some(writer);
        self.segment_path = Some(path);
        self.segment_start = Some(start);
        self.samples_written = 0;
        Ok(())
    }

    fn write_sample(&mut self, sample: i16) {
        if let Some(writer) = self.writer.as_mut() {
            if let Err(e) = writer.write_sample(sample) {
                warn!(feed_id = %self.feed_id, error = %e, "wav write failed");
            }
            self.samples_written += 1;
        }
    }

    fn close_segment(&mut self, truncated: bool) -> Option<ClosedSegment> {
        let writer = self.writer.take()?;
        let path = self.segment_path.take()?;
        let start = self.segment_start.take()?;

        if let Err(e) = writer.finalize() {
            warn!(feed_id = %self.feed_id, error = %e, "wav finalize failed");
            return None;
        }
        // Make the segment durable before anything downstream sees it.
        match File::open(&path) {
            Ok(file) => {
                if let Err(e) = file.sync_all() {
                    warn!(path = %path.display(), error = %e, "wav fsync failed");
                }
            }
            Err(e) => warn!(path = %path.display(), error = %e, "wav reopen for fsync failed"),
        }

        let filesize = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        let duration_ms =
            self.samples_written as u64 * 1000 / self.config.sample_rate as u64;
        self.samples_written = 0;

        debug!(
            feed_id = %self.feed_id,
            path = %path.display(),
            duration_ms,
            truncated,
            "closed voice segment"
        );
        metrics::counter!("vox.segments.closed").increment(1);

        Some(ClosedSegment {
            segment_id: Uuid::new_v4().to_string(),
            feed_id: self.feed_id.clone(),
            start_time: start,
            duration_ms,
            filepath: path,
            filesize,
            truncated,
        })
    }
}

/// Splits an interleaved stereo stream into independent L/R recorders.
pub struct StereoVox {
    left: VoxRecorder,
    right: VoxRecorder,
}

impl StereoVox {
    pub fn new(feed_id: &str, config: VoxConfig) -> Self {
        Self {
            left: VoxRecorder::new(format!("{feed_id}_L"), config.clone()),
            right: VoxRecorder::new(format!("{feed_id}_R"), config),
        }
    }

    pub fn feed_interleaved(&mut self, samples: &[i16]) -> Vec<ClosedSegment> {
        let mut left = Vec::with_capacity(samples.len() / 2);
        let mut right = Vec::with_capacity(samples.len() / 2);
        for pair in samples.chunks_exact(2) {
            left.push(pair[0]);
            right.push(pair[1]);
        }
        let mut closed = self.left.feed(&left);
        closed.extend(self.right.feed(&right));
        closed
    }

    pub fn flush(&mut self) -> Vec<ClosedSegment> {
        let mut closed = Vec::new();
        closed.extend(self.left.flush());
        closed.extend(self.right.flush());
        closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> VoxConfig {
        VoxConfig {
            recordings_dir: dir.path().to_path_buf(),
            ..VoxConfig::default()
        }
    }

    fn speech(seconds: f64) -> Vec<i16> {
        // Alternating polarity keeps the waveform loud without clipping.
        (0..(seconds * 16_000.0) as usize)
            .map(|i| if i % 2 == 0 { 2000 } else { -2000 })
            .collect()
    }

    fn silence(seconds: f64) -> Vec<i16> {
        vec![0i16; (seconds * 16_000.0) as usize]
    }

    #[test]
    fn test_speech_then_silence_produces_exactly_one_segment() {
        let dir = TempDir::new().unwrap();
        let mut vox = VoxRecorder::new("feed1", config(&dir));

        let mut closed = vox.feed(&speech(2.0));
        closed.extend(vox.feed(&silence(1.0)));

        assert_eq!(closed.len(), 1);
        let segment = &closed[0];
        // 2 s of speech plus the 500 ms silence hang.
        assert_eq!(segment.duration_ms, 2500);
        assert!(!segment.truncated);
        assert!(segment.filepath.exists());
        assert!(segment.filesize > 0);
        assert!(segment
            .filepath
            .file_name()
            .unwrap()
            .to_str()
            .unwrap()
            .starts_with("feed1_"));
    }

    #[test]
    fn test_sub_onset_blip_is_ignored() {
        let dir = TempDir::new().unwrap();
        let mut vox = VoxRecorder::new("feed1", config(&dir));

        // 0.5 s of speech is under the 1 s onset requirement.
        let mut closed = vox.feed(&speech(0.5));
        closed.extend(vox.feed(&silence(1.0)));
        assert!(closed.is_empty());
        assert!(vox.flush().is_none());
    }

    #[test]
    fn test_max_segment_truncates_and_continues() {
        let dir = TempDir::new().unwrap();
        let mut vox = VoxRecorder::new("feed1", config(&dir));

        // 45 s of continuous speech against a 30 s cap.
        let mut closed = vox.feed(&speech(45.0));
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].duration_ms, 30_000);
        assert!(closed[0].truncated);

        closed.extend(vox.flush());
        assert_eq!(closed.len(), 2);
        assert_eq!(closed[1].duration_ms, 15_000);
        assert!(closed[1].start_time > closed[0].start_time);
    }

    #[test]
    fn test_segment_start_backdates_to_onset() {
        let dir = TempDir::new().unwrap();
        let base = Utc::now();
        let mut vox = VoxRecorder::with_base_time("feed1", config(&dir), base);

        let mut closed = vox.feed(&speech(1.5));
        closed.extend(vox.feed(&silence(1.0)));
        assert_eq!(closed.len(), 1);
        // Speech began at the stream origin even though the segment only
        // opened after the onset window elapsed.
        assert_eq!(closed[0].start_time, base);
    }

    #[test]
    fn test_wav_file_is_valid_and_16khz_mono() {
        let dir = TempDir::new().unwrap();
        let mut vox = VoxRecorder::new("feed1", config(&dir));
        let mut closed = vox.feed(&speech(1.2));
        closed.extend(vox.feed(&silence(1.0)));

        let reader = hound::WavReader::open(&closed[0].filepath).unwrap();
        let spec = reader.spec();
        assert_eq!(spec.channels, 1);
        assert_eq!(spec.sample_rate, 16_000);
        assert_eq!(spec.bits_per_sample, 16);
        assert_eq!(reader.len() as u64, closed[0].duration_ms * 16);
    }

    #[test]
    fn test_stereo_split_records_independently() {
        let dir = TempDir::new().unwrap();
        let mut stereo = StereoVox::new("feed1", config(&dir));

        // Left channel loud, right channel silent.
        let mut interleaved = Vec::new();
        for i in 0..(16_000 * 2) {
            interleaved.push(if i % 2 == 0 { 2000i16 } else { -2000 });
            interleaved.push(0i16);
        }
        let mut closed = stereo.feed_interleaved(&interleaved);
        let mut tail = Vec::new();
        for _ in 0..16_000 {
            tail.push(0i16);
            tail.push(0i16);
        }
        closed.extend(stereo.feed_interleaved(&tail));

        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].feed_id, "feed1_L");
    }
}
