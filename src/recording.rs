//! Video/audio recording driven by emulated time.
//!
//! Frames and samples are stamped from the emulated frame and sample
//! counters, never from wall time, so a capture made in turbo mode
//! plays back at normal speed. The encoder backend is a plug point;
//! the default backend only accounts what it is fed, which is exactly
//! what the pipeline needs until a real codec is wired in.

use std::sync::Arc;

use log::{info, warn};

use crate::features::{self, FeatureRegistry};
use crate::machine::clock::FRAMES_PER_SECOND;

pub const DEFAULT_SAMPLE_RATE: u32 = 44_100;

/// Everything an encoder needs to start a session.
#[derive(Debug, Clone)]
pub struct RecordingConfig {
    pub path: String,
    pub video_codec: String,
    pub audio_codec: String,
    pub video_bitrate_kbps: u32,
    pub audio_bitrate_kbps: u32,
    pub fps: f64,
    pub sample_rate: u32,
}

/// Encoder backend plug point.
pub trait Encoder: Send {
    fn init(&mut self, config: &RecordingConfig) -> bool;
    /// One video frame with its emulated-time timestamp in seconds.
    fn encode_video(&mut self, frame: &[u8], timestamp: f64);
    /// A chunk of mono samples with its emulated-time timestamp.
    fn encode_audio(&mut self, samples: &[i16], timestamp: f64);
    fn finalize(&mut self);
}

/// Stats-only backend used until a real codec is plugged in.
#[derive(Debug, Default)]
pub struct NullEncoder {
    pub frames: u64,
    pub samples: u64,
    pub video_bytes: u64,
    pub last_video_timestamp: f64,
    pub last_audio_timestamp: f64,
}

impl Encoder for NullEncoder {
    fn init(&mut self, config: &RecordingConfig) -> bool {
        info!(
            "recording: session to {} (video={}, audio={}, {:.2} fps)",
            config.path, config.video_codec, config.audio_codec, config.fps
        );
        true
    }

    fn encode_video(&mut self, frame: &[u8], timestamp: f64) {
        self.frames += 1;
        self.video_bytes += frame.len() as u64;
        self.last_video_timestamp = timestamp;
    }

    fn encode_audio(&mut self, samples: &[i16], timestamp: f64) {
        self.samples += samples.len() as u64;
        self.last_audio_timestamp = timestamp;
    }

    fn finalize(&mut self) {
        info!(
            "recording: finalized after {} frames / {} samples",
            self.frames, self.samples
        );
    }
}

/// Owns the capture counters and the encoder backend.
pub struct RecordingManager {
    features: Arc<FeatureRegistry>,
    encoder: Box<dyn Encoder>,
    recording: bool,
    frames_captured: u64,
    samples_captured: u64,
    fps: f64,
    sample_rate: u32,
}

impl RecordingManager {
    pub fn new(features: Arc<FeatureRegistry>) -> Self {
        Self {
            features,
            encoder: Box::new(NullEncoder::default()),
            recording: false,
            frames_captured: 0,
            samples_captured: 0,
            fps: FRAMES_PER_SECOND,
            sample_rate: DEFAULT_SAMPLE_RATE,
        }
    }

    /// Swap the encoder backend. Only allowed while stopped.
    pub fn set_encoder(&mut self, encoder: Box<dyn Encoder>) -> bool {
        if self.recording {
            return false;
        }
        self.encoder = encoder;
        true
    }

    pub fn is_recording(&self) -> bool {
        self.recording
    }

    pub fn frames_captured(&self) -> u64 {
        self.frames_captured
    }

    /// Begin a capture session. Gated by the `recording` feature.
    pub fn start_recording(
        &mut self,
        path: &str,
        video_codec: &str,
        audio_codec: &str,
        video_bitrate_kbps: u32,
        audio_bitrate_kbps: u32,
    ) -> bool {
        if !self.features.is_enabled(features::RECORDING) {
            warn!("recording: feature disabled, enable with 'feature recording on'");
            return false;
        }
        if self.recording {
            warn!("recording: session already active");
            return false;
        }

        let config = RecordingConfig {
            path: path.to_string(),
            video_codec: video_codec.to_string(),
            audio_codec: audio_codec.to_string(),
            video_bitrate_kbps,
            audio_bitrate_kbps,
            fps: self.fps,
            sample_rate: self.sample_rate,
        };

        if !self.encoder.init(&config) {
            warn!("recording: encoder init failed");
            return false;
        }

        self.frames_captured = 0;
        self.samples_captured = 0;
        self.recording = true;
        true
    }

    pub fn stop_recording(&mut self) {
        if !self.recording {
            return;
        }
        self.recording = false;
        self.encoder.finalize();
    }

    /// Capture one emulated frame. Timestamp = frames / fps.
    pub fn capture_frame(&mut self, frame: &[u8]) {
        if !self.recording {
            return;
        }
        let timestamp = self.frames_captured as f64 / self.fps;
        self.encoder.encode_video(frame, timestamp);
        self.frames_captured += 1;
    }

    /// Capture an audio chunk. Timestamp = samples / sample rate.
    pub fn capture_audio(&mut self, samples: &[i16]) {
        if !self.recording {
            return;
        }
        let timestamp = self.samples_captured as f64 / self.sample_rate as f64;
        self.encoder.encode_audio(samples, timestamp);
        self.samples_captured += samples.len() as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    /// Encoder that reports timestamps back to the test.
    struct ProbeEncoder {
        video_tx: mpsc::Sender<f64>,
        audio_tx: mpsc::Sender<f64>,
        finalized_tx: mpsc::Sender<()>,
    }

    impl Encoder for ProbeEncoder {
        fn init(&mut self, _config: &RecordingConfig) -> bool {
            true
        }

        fn encode_video(&mut self, _frame: &[u8], timestamp: f64) {
            let _ = self.video_tx.send(timestamp);
        }

        fn encode_audio(&mut self, _samples: &[i16], timestamp: f64) {
            let _ = self.audio_tx.send(timestamp);
        }

        fn finalize(&mut self) {
            let _ = self.finalized_tx.send(());
        }
    }

    fn manager_with_feature(on: bool) -> RecordingManager {
        let features = Arc::new(FeatureRegistry::new(None));
        features.set(features::RECORDING, on);
        RecordingManager::new(features)
    }

    #[test]
    fn test_feature_gate() {
        let mut manager = manager_with_feature(false);
        assert!(!manager.start_recording("out.mkv", "h264", "aac", 0, 0));
        assert!(!manager.is_recording());

        let mut manager = manager_with_feature(true);
        assert!(manager.start_recording("out.mkv", "h264", "aac", 0, 0));
        assert!(manager.is_recording());
        // Double start is rejected
        assert!(!manager.start_recording("other.mkv", "h264", "aac", 0, 0));
    }

    #[test]
    fn test_emulated_timestamps() {
        let (video_tx, video_rx) = mpsc::channel();
        let (audio_tx, audio_rx) = mpsc::channel();
        let (finalized_tx, finalized_rx) = mpsc::channel();

        let mut manager = manager_with_feature(true);
        assert!(manager.set_encoder(Box::new(ProbeEncoder {
            video_tx,
            audio_tx,
            finalized_tx,
        })));
        assert!(manager.start_recording("out.mkv", "h264", "aac", 2000, 192));

        let frame = vec![0u8; 6912];
        manager.capture_frame(&frame);
        manager.capture_frame(&frame);
        manager.capture_frame(&frame);

        let t0 = video_rx.recv().unwrap();
        let t1 = video_rx.recv().unwrap();
        let t2 = video_rx.recv().unwrap();
        assert_eq!(t0, 0.0);
        assert!((t1 - 1.0 / FRAMES_PER_SECOND).abs() < 1e-9);
        assert!((t2 - 2.0 / FRAMES_PER_SECOND).abs() < 1e-9);

        manager.capture_audio(&[0i16; 441]);
        manager.capture_audio(&[0i16; 441]);
        let a0 = audio_rx.recv().unwrap();
        let a1 = audio_rx.recv().unwrap();
        assert_eq!(a0, 0.0);
        assert!((a1 - 441.0 / DEFAULT_SAMPLE_RATE as f64).abs() < 1e-9);

        manager.stop_recording();
        assert!(finalized_rx.recv().is_ok());
        // Captures after stop are dropped
        manager.capture_frame(&frame);
        assert!(video_rx.try_recv().is_err());
    }
}
