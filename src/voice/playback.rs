//! Audio playback to speakers

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, StreamConfig};
use tokio_util::sync::CancellationToken;

use super::audio::AudioBuffer;
use crate::{Error, Result};

/// How a call to [`AudioSink::play`] ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackOutcome {
    Finished,
    Stopped,
}

/// Output device abstraction; one buffer at a time, in call order
#[async_trait]
pub trait AudioSink: Send + Sync {
    /// Play `buffer` to completion, or stop mid-buffer when `cancel` fires
    ///
    /// # Errors
    ///
    /// Returns error if the output device fails
    async fn play(&self, buffer: AudioBuffer, cancel: &CancellationToken) -> Result<PlaybackOutcome>;
}

/// Plays audio to the default output device
#[derive(Debug, Clone, Default)]
pub struct AudioPlayback {
    _private: (),
}

impl AudioPlayback {
    /// Check that an output device exists
    ///
    /// # Errors
    ///
    /// Returns error if no output device is available
    pub fn new() -> Result<Self> {
        let device = cpal::default_host()
            .default_output_device()
            .ok_or_else(|| Error::Audio("no output device available".to_string()))?;

        tracing::debug!(
            device = device.name().unwrap_or_default(),
            "audio playback initialized"
        );

        Ok(Self { _private: () })
    }
}

#[async_trait]
impl AudioSink for AudioPlayback {
    async fn play(&self, buffer: AudioBuffer, cancel: &CancellationToken) -> Result<PlaybackOutcome> {
        if buffer.is_empty() {
            return Ok(PlaybackOutcome::Finished);
        }

        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let mut task = tokio::task::spawn_blocking(move || play_blocking(&buffer, &stop_flag));

        let joined = tokio::select! {
            joined = &mut task => joined,
            () = cancel.cancelled() => {
                stop.store(true, Ordering::SeqCst);
                task.await
            }
        };

        let finished = joined.map_err(|e| Error::Audio(format!("playback task failed: {e}")))??;
        Ok(if finished {
            PlaybackOutcome::Finished
        } else {
            tracing::debug!("playback stopped mid-buffer");
            PlaybackOutcome::Stopped
        })
    }
}

/// Pick an output config for `sample_rate`, falling back to the device default
fn output_config(device: &cpal::Device, sample_rate: u32) -> Result<StreamConfig> {
    let wanted = SampleRate(sample_rate);
    let matching = device
        .supported_output_configs()
        .map_err(|e| Error::Audio(e.to_string()))?
        .filter(|c| c.min_sample_rate() <= wanted && c.max_sample_rate() >= wanted)
        .min_by_key(cpal::SupportedStreamConfigRange::channels);

    if let Some(range) = matching {
        return Ok(range.with_sample_rate(wanted).config());
    }

    device
        .default_output_config()
        .map(|c| c.config())
        .map_err(|e| Error::Audio(e.to_string()))
}

/// Play on the current thread; returns `false` if stopped early
fn play_blocking(buffer: &AudioBuffer, stop: &AtomicBool) -> Result<bool> {
    let device = cpal::default_host()
        .default_output_device()
        .ok_or_else(|| Error::Audio("no output device".to_string()))?;

    let config = output_config(&device, buffer.sample_rate)?;
    let channels = usize::from(config.channels.max(1));
    let samples = Arc::new(resample(&buffer.samples, buffer.sample_rate, config.sample_rate.0));
    let total = samples.len();

    let position = Arc::new(AtomicUsize::new(0));
    let callback_samples = Arc::clone(&samples);
    let callback_position = Arc::clone(&position);
    let device_error: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
    let error_slot = Arc::clone(&device_error);

    let stream = device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                let mut pos = callback_position.load(Ordering::Relaxed);
                for frame in data.chunks_mut(channels) {
                    let sample = callback_samples.get(pos).copied().unwrap_or(0.0);
                    frame.fill(sample);
                    if pos < callback_samples.len() {
                        pos += 1;
                    }
                }
                callback_position.store(pos, Ordering::Relaxed);
            },
            move |err| {
                tracing::error!(error = %err, "audio playback error");
                if let Ok(mut slot) = error_slot.lock() {
                    *slot = Some(err.to_string());
                }
            },
            None,
        )
        .map_err(|e| Error::Audio(e.to_string()))?;

    stream.play().map_err(|e| Error::Audio(e.to_string()))?;

    let rate = u64::from(config.sample_rate.0.max(1));
    let expected = Duration::from_millis((total as u64).saturating_mul(1000) / rate);
    let deadline = std::time::Instant::now() + expected + Duration::from_millis(500);

    let mut finished = false;
    while std::time::Instant::now() < deadline {
        if stop.load(Ordering::SeqCst) {
            break;
        }
        if position.load(Ordering::Relaxed) >= total {
            finished = true;
            // let the device drain its last callback buffer
            std::thread::sleep(Duration::from_millis(100));
            break;
        }
        if let Some(err) = device_error.lock().ok().and_then(|mut slot| slot.take()) {
            return Err(Error::Audio(err));
        }
        std::thread::sleep(Duration::from_millis(20));
    }

    drop(stream);
    tracing::debug!(samples = total, finished, "playback complete");
    Ok(finished || !stop.load(Ordering::SeqCst))
}

/// Linear resampling to the device rate
#[must_use]
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
pub fn resample(samples: &[f32], from: u32, to: u32) -> Vec<f32> {
    if from == to || from == 0 || to == 0 || samples.is_empty() {
        return samples.to_vec();
    }

    let ratio = f64::from(from) / f64::from(to);
    let out_len = ((samples.len() as f64) / ratio).round() as usize;
    (0..out_len)
        .map(|i| {
            let src = i as f64 * ratio;
            let idx = src.floor() as usize;
            let frac = (src - src.floor()) as f32;
            let a = samples.get(idx).copied().unwrap_or(0.0);
            let b = samples.get(idx + 1).copied().unwrap_or(a);
            a + (b - a) * frac
        })
        .collect()
}

/// In-memory sink that records what would have been played
///
/// Each buffer "plays" for its real duration scaled by `speed_up`, so
/// stopping mid-buffer can be observed.
#[derive(Debug, Clone, Default)]
pub struct RecordingSink {
    played: Arc<Mutex<Vec<AudioBuffer>>>,
    stopped: Arc<AtomicUsize>,
    speed_up: u32,
}

impl RecordingSink {
    /// Sink that finishes every buffer instantly
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sink that takes `duration / speed_up` to play each buffer
    #[must_use]
    pub fn realtime(speed_up: u32) -> Self {
        Self {
            speed_up: speed_up.max(1),
            ..Self::default()
        }
    }

    /// Buffers played to completion, in order
    #[must_use]
    pub fn played(&self) -> Vec<AudioBuffer> {
        self.played.lock().map(|p| p.clone()).unwrap_or_default()
    }

    /// Buffers cut short by cancellation
    #[must_use]
    pub fn stopped(&self) -> usize {
        self.stopped.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AudioSink for RecordingSink {
    async fn play(&self, buffer: AudioBuffer, cancel: &CancellationToken) -> Result<PlaybackOutcome> {
        if self.speed_up > 0 && buffer.sample_rate > 0 {
            let nanos = (buffer.samples.len() as u64).saturating_mul(1_000_000_000)
                / u64::from(buffer.sample_rate)
                / u64::from(self.speed_up);
            tokio::select! {
                () = cancel.cancelled() => {
                    self.stopped.fetch_add(1, Ordering::SeqCst);
                    return Ok(PlaybackOutcome::Stopped);
                }
                () = tokio::time::sleep(Duration::from_nanos(nanos)) => {}
            }
        } else if cancel.is_cancelled() {
            self.stopped.fetch_add(1, Ordering::SeqCst);
            return Ok(PlaybackOutcome::Stopped);
        }

        if let Ok(mut played) = self.played.lock() {
            played.push(buffer);
        }
        Ok(PlaybackOutcome::Finished)
    }
}
