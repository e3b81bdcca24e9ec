//! Wake word detection
//!
//! Runs offline and continuously on the microphone frame stream. Each frame's
//! RMS energy is appended to a sliding window; every keyword model scores the
//! window and the best score is compared against the threshold. A wake event
//! fires only after the threshold has held for `min_consecutive_frames`, and
//! is followed by a cool-down during which nothing fires.

use std::collections::VecDeque;
use std::path::Path;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use super::audio::AudioChunk;
use super::fanout::FrameReceiver;
use crate::config::{KeywordSource, WakeConfig};
use crate::{Error, Result};

/// Mean window energy below which no model is consulted
const ENERGY_GATE: f32 = 0.01;

/// A trigger phrase detected in the audio stream
#[derive(Debug, Clone, PartialEq)]
pub struct WakeEvent {
    /// Capture time of the frame that completed the detection
    pub timestamp: Instant,
    /// Label of the keyword model that fired
    pub keyword: String,
    /// Model score at the time of firing (0.0-1.0)
    pub confidence: f32,
}

impl WakeEvent {
    /// Event stamped now, for manual activation and tests
    #[must_use]
    pub fn now(keyword: impl Into<String>, confidence: f32) -> Self {
        Self {
            timestamp: Instant::now(),
            keyword: keyword.into(),
            confidence,
        }
    }
}

/// An offline keyword model scoring per-frame energy windows
pub trait KeywordModel: Send {
    /// Label reported in wake events
    fn label(&self) -> &str;

    /// Frames of history the model needs
    fn window_frames(&self) -> usize;

    /// Score the most recent `window_frames()` energies, oldest first
    fn score(&self, energies: &[f32]) -> f32;
}

/// Keyword model matching the energy envelope of a recorded phrase
#[derive(Debug, Clone)]
pub struct EnvelopeTemplate {
    label: String,
    envelope: Vec<f32>,
}

impl EnvelopeTemplate {
    /// # Errors
    ///
    /// Returns error if the envelope is empty or flat
    pub fn new(label: impl Into<String>, envelope: Vec<f32>) -> Result<Self> {
        let label = label.into();
        let envelope = centered(&envelope);
        if envelope.iter().all(|v| v.abs() < f32::EPSILON) {
            return Err(Error::WakeWord(format!("keyword {label} has a flat envelope")));
        }
        Ok(Self { label, envelope })
    }

    /// Load an envelope stored as a JSON array of floats
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or parsed
    pub fn load(label: impl Into<String>, path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::WakeWord(format!("cannot read template {}: {e}", path.display()))
        })?;
        let envelope: Vec<f32> = serde_json::from_str(&content)?;
        Self::new(label, envelope)
    }
}

impl KeywordModel for EnvelopeTemplate {
    fn label(&self) -> &str {
        &self.label
    }

    fn window_frames(&self) -> usize {
        self.envelope.len()
    }

    fn score(&self, energies: &[f32]) -> f32 {
        cosine_similarity(&centered(energies), &self.envelope).max(0.0)
    }
}

/// Subtract the mean so a constant level scores zero against any shape
#[allow(clippy::cast_precision_loss)]
fn centered(values: &[f32]) -> Vec<f32> {
    if values.is_empty() {
        return Vec::new();
    }
    let mean = values.iter().sum::<f32>() / values.len() as f32;
    values.iter().map(|v| v - mean).collect()
}

/// Cosine similarity between two equal-length vectors (0.0 if lengths differ)
#[must_use]
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }

    let mut dot = 0.0_f32;
    let mut norm_a = 0.0_f32;
    let mut norm_b = 0.0_f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom <= f32::EPSILON {
        return 0.0;
    }

    dot / denom
}

/// Detects wake words in audio
pub struct WakeWordDetector {
    models: Vec<Box<dyn KeywordModel>>,
    threshold: f32,
    min_consecutive_frames: usize,
    cooldown: Duration,
    energies: VecDeque<f32>,
    history: usize,
    consecutive: usize,
    cooldown_left: Duration,
}

impl std::fmt::Debug for WakeWordDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WakeWordDetector")
            .field("models", &self.labels())
            .field("threshold", &self.threshold)
            .field("min_consecutive_frames", &self.min_consecutive_frames)
            .field("cooldown", &self.cooldown)
            .finish_non_exhaustive()
    }
}

impl WakeWordDetector {
    /// Create a detector from already-built models
    ///
    /// # Errors
    ///
    /// Returns error if `models` is empty
    pub fn new(models: Vec<Box<dyn KeywordModel>>, config: &WakeConfig) -> Result<Self> {
        if models.is_empty() {
            return Err(Error::WakeWord("no keyword models configured".to_string()));
        }

        let history = models.iter().map(|m| m.window_frames()).max().unwrap_or(1).max(1);

        tracing::debug!(
            keywords = ?models.iter().map(|m| m.label().to_string()).collect::<Vec<_>>(),
            threshold = config.threshold,
            "wake word detector initialized"
        );

        Ok(Self {
            models,
            threshold: config.threshold,
            min_consecutive_frames: config.min_consecutive_frames.max(1),
            cooldown: config.cooldown,
            energies: VecDeque::with_capacity(history),
            history,
            consecutive: 0,
            cooldown_left: Duration::ZERO,
        })
    }

    /// Build envelope models for every configured keyword
    ///
    /// # Errors
    ///
    /// Returns error if a template cannot be loaded or none are configured
    pub fn from_config(config: &WakeConfig) -> Result<Self> {
        let models = config
            .keywords
            .iter()
            .map(|spec| {
                let model = match &spec.source {
                    KeywordSource::File(path) => EnvelopeTemplate::load(&spec.label, path)?,
                    KeywordSource::Envelope(env) => {
                        EnvelopeTemplate::new(&spec.label, env.clone())?
                    }
                };
                Ok(Box::new(model) as Box<dyn KeywordModel>)
            })
            .collect::<Result<Vec<_>>>()?;

        Self::new(models, config)
    }

    /// Feed one frame; returns a wake event when the phrase is recognized
    pub fn process(&mut self, chunk: &AudioChunk) -> Option<WakeEvent> {
        if self.energies.len() == self.history {
            self.energies.pop_front();
        }
        self.energies.push_back(chunk.energy());

        if !self.cooldown_left.is_zero() {
            self.cooldown_left = self.cooldown_left.saturating_sub(chunk.duration());
            self.consecutive = 0;
            return None;
        }

        let Some((label, score)) = self.best_score() else {
            self.consecutive = 0;
            return None;
        };

        if score < self.threshold {
            self.consecutive = 0;
            return None;
        }

        self.consecutive += 1;
        tracing::trace!(
            keyword = %label,
            score,
            consecutive = self.consecutive,
            "wake score above threshold"
        );

        if self.consecutive < self.min_consecutive_frames {
            return None;
        }

        self.consecutive = 0;
        self.cooldown_left = self.cooldown;

        tracing::info!(keyword = %label, confidence = score, "wake word detected");
        Some(WakeEvent {
            timestamp: chunk.captured_at,
            keyword: label,
            confidence: score,
        })
    }

    fn best_score(&self) -> Option<(String, f32)> {
        self.models
            .iter()
            .filter_map(|model| {
                let n = model.window_frames();
                if self.energies.len() < n {
                    return None;
                }
                let window: Vec<f32> = self
                    .energies
                    .iter()
                    .skip(self.energies.len() - n)
                    .copied()
                    .collect();
                #[allow(clippy::cast_precision_loss)]
                let mean = window.iter().sum::<f32>() / n as f32;
                if mean < ENERGY_GATE {
                    return None;
                }
                Some((model.label(), model.score(&window)))
            })
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(label, score)| (label.to_string(), score))
    }

    /// Forget accumulated history (used while the feed is paused)
    pub fn reset(&mut self) {
        self.energies.clear();
        self.consecutive = 0;
    }

    /// Whether the detector is inside its post-detection cool-down
    #[must_use]
    pub fn in_cooldown(&self) -> bool {
        !self.cooldown_left.is_zero()
    }

    /// Labels of the loaded keyword models
    #[must_use]
    pub fn labels(&self) -> Vec<&str> {
        self.models.iter().map(|m| m.label()).collect()
    }
}

/// Run the detector over the frame stream until `shutdown` fires
///
/// While `paused` is `true`, frames are consumed and discarded so the
/// detector cannot hear the companion's own voice. Events are handed off
/// with `try_send`; if the controller is backed up, the event is dropped
/// rather than stalling the audio path. A new value on `settings` rebuilds
/// the detector; if the new keywords cannot be loaded the old detector stays.
pub async fn run_wake_listener(
    mut detector: WakeWordDetector,
    mut frames: FrameReceiver,
    mut paused: watch::Receiver<bool>,
    mut settings: watch::Receiver<WakeConfig>,
    events: mpsc::Sender<WakeEvent>,
    shutdown: CancellationToken,
) {
    tracing::info!(keywords = ?detector.labels(), "wake word listener started");
    let mut settings_open = true;

    loop {
        let chunk = tokio::select! {
            biased;
            () = shutdown.cancelled() => break,
            changed = settings.changed(), if settings_open => {
                if changed.is_err() {
                    settings_open = false;
                    continue;
                }
                let config = settings.borrow_and_update().clone();
                match WakeWordDetector::from_config(&config) {
                    Ok(rebuilt) => {
                        tracing::info!(keywords = ?rebuilt.labels(), "wake detector rebuilt");
                        detector = rebuilt;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "new wake settings rejected, keeping detector");
                    }
                }
                continue;
            }
            changed = paused.changed() => {
                if changed.is_err() {
                    break;
                }
                let now_paused = *paused.borrow_and_update();
                if now_paused {
                    tracing::debug!("wake detection paused");
                    detector.reset();
                } else {
                    tracing::debug!("wake detection resumed");
                    frames.drain();
                }
                continue;
            }
            frame = frames.recv() => match frame {
                Some(chunk) => chunk,
                None => {
                    tracing::warn!("microphone stream ended, wake listener stopping");
                    break;
                }
            },
        };

        if *paused.borrow() {
            continue;
        }

        if let Some(event) = detector.process(&chunk) {
            match events.try_send(event) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(event)) => {
                    tracing::warn!(keyword = %event.keyword, "controller busy, wake event dropped");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => break,
            }
        }
    }

    tracing::info!("wake word listener stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::voice::audio::SAMPLE_RATE;

    /// Model returning scripted scores, one per call
    struct Scripted {
        scores: std::sync::Mutex<VecDeque<f32>>,
    }

    impl KeywordModel for Scripted {
        fn label(&self) -> &str {
            "scripted"
        }

        fn window_frames(&self) -> usize {
            1
        }

        fn score(&self, _: &[f32]) -> f32 {
            self.scores
                .lock()
                .ok()
                .and_then(|mut s| s.pop_front())
                .unwrap_or(0.0)
        }
    }

    fn config(min_consecutive_frames: usize, cooldown: Duration) -> WakeConfig {
        WakeConfig {
            keywords: Vec::new(),
            threshold: 0.8,
            min_consecutive_frames,
            cooldown,
            barge_in: false,
        }
    }

    fn scripted(scores: &[f32], cfg: &WakeConfig) -> WakeWordDetector {
        let model = Scripted {
            scores: std::sync::Mutex::new(scores.iter().copied().collect()),
        };
        WakeWordDetector::new(vec![Box::new(model)], cfg).unwrap()
    }

    fn loud_frame() -> AudioChunk {
        AudioChunk::new(vec![0.5; 320], SAMPLE_RATE)
    }

    #[test]
    fn test_cosine_similarity() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0], &[1.0, 2.0]).abs() < f32::EPSILON);
        assert!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]).abs() < f32::EPSILON);
    }

    #[test]
    fn single_frame_spike_is_suppressed() {
        let cfg = config(3, Duration::ZERO);
        let mut detector = scripted(&[0.95, 0.1, 0.95, 0.95, 0.1], &cfg);

        for _ in 0..5 {
            assert!(detector.process(&loud_frame()).is_none());
        }
    }

    #[test]
    fn sustained_score_fires_once() {
        let cfg = config(3, Duration::ZERO);
        let mut detector = scripted(&[0.9, 0.9, 0.92], &cfg);

        assert!(detector.process(&loud_frame()).is_none());
        assert!(detector.process(&loud_frame()).is_none());
        let event = detector.process(&loud_frame()).unwrap();
        assert_eq!(event.keyword, "scripted");
        assert!((event.confidence - 0.92).abs() < 1e-6);
    }

    #[test]
    fn cooldown_suppresses_repeat_triggers() {
        // 20 ms frames, 100 ms cool-down => the next 5 frames are ignored
        let cfg = config(1, Duration::from_millis(100));
        let mut detector = scripted(&[0.9; 10], &cfg);

        assert!(detector.process(&loud_frame()).is_some());
        for _ in 0..5 {
            assert!(detector.process(&loud_frame()).is_none());
        }
        assert!(!detector.in_cooldown());
        assert!(detector.process(&loud_frame()).is_some());
    }

    #[test]
    fn silence_is_gated() {
        let cfg = config(1, Duration::ZERO);
        let mut detector = scripted(&[1.0; 4], &cfg);
        let quiet = AudioChunk::new(vec![0.0; 320], SAMPLE_RATE);
        assert!(detector.process(&quiet).is_none());
    }

    #[test]
    fn empty_envelope_is_rejected() {
        assert!(EnvelopeTemplate::new("x", vec![]).is_err());
        assert!(EnvelopeTemplate::new("x", vec![0.0, 0.0]).is_err());
        assert!(EnvelopeTemplate::new("x", vec![0.4; 8]).is_err());
    }

    #[test]
    fn envelope_ignores_level_but_not_shape() {
        let template = EnvelopeTemplate::new("x", vec![0.1, 0.9, 0.1, 0.9]).unwrap();
        assert!(template.score(&[0.3, 0.3, 0.3, 0.3]) < f32::EPSILON);
        assert!((template.score(&[0.2, 0.6, 0.2, 0.6]) - 1.0).abs() < 1e-5);
        assert!(template.score(&[0.9, 0.1, 0.9, 0.1]) < f32::EPSILON);
    }

    #[test]
    fn requires_at_least_one_model() {
        assert!(WakeWordDetector::new(Vec::new(), &config(1, Duration::ZERO)).is_err());
    }
}
