//! Audio capture from microphone
//!
//! [`Microphone`] owns the physical input stream and publishes fixed-size
//! mono frames into a [`FrameFanout`]. [`AudioCaptureService`] turns the live
//! frame stream into one finalized [`Utterance`] per session.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, Stream, StreamConfig};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use super::audio::{AudioChunk, EndMarker, FRAME_SAMPLES, SAMPLE_RATE, Utterance};
use super::fanout::{FrameFanout, FrameSource};
use crate::config::CaptureConfig;
use crate::error::CaptureError;

/// Frames kept from before the first voiced frame so word onsets are not clipped
const PRE_ROLL_FRAMES: usize = 10;

/// Captures audio from the default input device
///
/// The stream stops when this value is dropped. `cpal::Stream` is not
/// `Send`, so keep the microphone on the thread that opened it.
pub struct Microphone {
    _stream: Stream,
    device_name: String,
}

impl Microphone {
    /// Open the default input device and start publishing frames
    ///
    /// # Errors
    ///
    /// Returns error if no suitable input device exists or the OS refuses access
    pub fn open(fanout: FrameFanout) -> Result<Self, CaptureError> {
        let host = cpal::default_host();

        let device = host
            .default_input_device()
            .ok_or_else(|| CaptureError::DeviceUnavailable("no input device available".to_string()))?;
        let device_name = device.name().unwrap_or_default();

        let supported_config = device
            .supported_input_configs()
            .map_err(|e| device_error(&e.to_string()))?
            .find(|c| {
                c.min_sample_rate() <= SampleRate(SAMPLE_RATE)
                    && c.max_sample_rate() >= SampleRate(SAMPLE_RATE)
            })
            .ok_or_else(|| {
                CaptureError::DeviceUnavailable("no 16kHz input config found".to_string())
            })?;

        let config: StreamConfig = supported_config
            .with_sample_rate(SampleRate(SAMPLE_RATE))
            .config();
        let channels = usize::from(config.channels.max(1));

        let mut framer = Framer::new(channels);
        let stream = device
            .build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    framer.push(data, |chunk| {
                        fanout.publish(chunk);
                    });
                },
                |err| {
                    tracing::error!(error = %err, "audio capture error");
                },
                None,
            )
            .map_err(|e| device_error(&e.to_string()))?;

        stream.play().map_err(|e| device_error(&e.to_string()))?;

        tracing::info!(
            device = %device_name,
            sample_rate = SAMPLE_RATE,
            channels,
            "microphone opened"
        );

        Ok(Self {
            _stream: stream,
            device_name,
        })
    }

    #[must_use]
    pub fn device_name(&self) -> &str {
        &self.device_name
    }
}

impl Drop for Microphone {
    fn drop(&mut self) {
        tracing::debug!(device = %self.device_name, "microphone closed");
    }
}

/// Splits interleaved callback buffers into mono [`FRAME_SAMPLES`] frames
struct Framer {
    channels: usize,
    pending: Vec<f32>,
}

impl Framer {
    fn new(channels: usize) -> Self {
        Self {
            channels,
            pending: Vec::with_capacity(FRAME_SAMPLES * 2),
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn push(&mut self, data: &[f32], mut emit: impl FnMut(AudioChunk)) {
        if self.channels == 1 {
            self.pending.extend_from_slice(data);
        } else {
            let scale = self.channels as f32;
            self.pending.extend(
                data.chunks(self.channels)
                    .map(|frame| frame.iter().sum::<f32>() / scale),
            );
        }

        while self.pending.len() >= FRAME_SAMPLES {
            let rest = self.pending.split_off(FRAME_SAMPLES);
            let frame = std::mem::replace(&mut self.pending, rest);
            emit(AudioChunk::new(frame, SAMPLE_RATE));
        }
    }
}

fn device_error(message: &str) -> CaptureError {
    let lower = message.to_lowercase();
    if lower.contains("permission") || lower.contains("denied") || lower.contains("not authorized")
    {
        CaptureError::PermissionDenied
    } else {
        CaptureError::DeviceUnavailable(message.to_string())
    }
}

/// Exclusive hold on the capture phase
///
/// Released on drop, on every exit path.
#[derive(Debug)]
pub struct CaptureLease {
    _permit: OwnedSemaphorePermit,
}

impl Drop for CaptureLease {
    fn drop(&mut self) {
        tracing::trace!("capture lease released");
    }
}

/// Finalizes utterances from the live frame stream
#[derive(Debug, Clone)]
pub struct AudioCaptureService {
    source: FrameSource,
    config: CaptureConfig,
    lease: Arc<Semaphore>,
}

impl AudioCaptureService {
    #[must_use]
    pub fn new(source: FrameSource, config: CaptureConfig) -> Self {
        Self {
            source,
            config,
            lease: Arc::new(Semaphore::new(1)),
        }
    }

    /// Service sharing this one's lease but with a different configuration
    #[must_use]
    pub fn with_config(&self, config: CaptureConfig) -> Self {
        Self {
            source: self.source.clone(),
            config,
            lease: Arc::clone(&self.lease),
        }
    }

    #[must_use]
    pub const fn config(&self) -> &CaptureConfig {
        &self.config
    }

    /// Whether a capture is currently holding the lease
    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.lease.available_permits() == 0
    }

    fn acquire(&self) -> Result<CaptureLease, CaptureError> {
        Arc::clone(&self.lease)
            .try_acquire_owned()
            .map(|permit| CaptureLease { _permit: permit })
            .map_err(|_| CaptureError::DeviceUnavailable("capture already in progress".to_string()))
    }

    /// Capture one utterance
    ///
    /// Frames are buffered from the first voiced frame (plus a short pre-roll)
    /// until `trailing_silence` of quiet follows speech, or until
    /// `max_utterance` has passed since voice onset.
    ///
    /// # Errors
    ///
    /// - `DeviceUnavailable` if another capture holds the device or the frame stream ends
    /// - `NoSpeechTimeout` if nothing voiced is heard within `no_speech_timeout`
    /// - `Cancelled` if `cancel` fires
    pub async fn capture(&self, cancel: &CancellationToken) -> Result<Utterance, CaptureError> {
        let _lease = self.acquire()?;
        let mut frames = self.source.subscribe();
        let cfg = &self.config;

        tracing::debug!(
            trailing_silence_ms = u64::try_from(cfg.trailing_silence.as_millis()).unwrap_or(u64::MAX),
            max_utterance_ms = u64::try_from(cfg.max_utterance.as_millis()).unwrap_or(u64::MAX),
            "capture started"
        );

        let no_speech = tokio::time::sleep(cfg.no_speech_timeout);
        tokio::pin!(no_speech);

        let mut pre_roll: VecDeque<AudioChunk> = VecDeque::with_capacity(PRE_ROLL_FRAMES);
        let mut chunks: Vec<AudioChunk> = Vec::new();
        let mut heard_voice = false;
        // speech length, counted from voice onset
        let mut spoken = Duration::ZERO;
        let mut silence = Duration::ZERO;

        loop {
            let chunk = tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    tracing::debug!("capture cancelled");
                    return Err(CaptureError::Cancelled);
                }
                () = &mut no_speech, if !heard_voice => {
                    return Err(CaptureError::NoSpeechTimeout(cfg.no_speech_timeout));
                }
                frame = frames.recv() => match frame {
                    Some(chunk) => chunk,
                    None => {
                        return Err(CaptureError::DeviceUnavailable(
                            "microphone stream ended".to_string(),
                        ));
                    }
                },
            };

            let duration = chunk.duration();
            let voiced = chunk.energy() >= cfg.vad_threshold;

            if voiced {
                if !heard_voice {
                    tracing::trace!(pre_roll = pre_roll.len(), "voice onset");
                    chunks.extend(pre_roll.drain(..));
                }
                heard_voice = true;
                silence = Duration::ZERO;
                spoken += duration;
                chunks.push(chunk);
            } else if heard_voice {
                silence += duration;
                spoken += duration;
                chunks.push(chunk);
            } else {
                if pre_roll.len() == PRE_ROLL_FRAMES {
                    pre_roll.pop_front();
                }
                pre_roll.push_back(chunk);
            }

            if heard_voice && silence >= cfg.trailing_silence {
                return Ok(finish(chunks, EndMarker::Silence, frames.dropped()));
            }

            if spoken >= cfg.max_utterance {
                return Ok(finish(chunks, EndMarker::MaxDuration, frames.dropped()));
            }
        }
    }
}

fn finish(chunks: Vec<AudioChunk>, end: EndMarker, dropped: u64) -> Utterance {
    let utterance = Utterance { chunks, end };
    tracing::debug!(
        end = ?end,
        duration_ms = u64::try_from(utterance.duration().as_millis()).unwrap_or(u64::MAX),
        dropped_frames = dropped,
        "utterance finalized"
    );
    utterance
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn framer_downmixes_and_splits() {
        let mut framer = Framer::new(2);
        let mut frames = Vec::new();

        let stereo: Vec<f32> = [0.2, 0.4].repeat(FRAME_SAMPLES + 10);
        framer.push(&stereo, |c| frames.push(c));

        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].samples.len(), FRAME_SAMPLES);
        assert!((frames[0].samples[0] - 0.3).abs() < 1e-6);
        assert_eq!(framer.pending.len(), 10);
    }

    #[test]
    fn permission_errors_are_recognized() {
        assert_eq!(
            device_error("Access denied by the system"),
            CaptureError::PermissionDenied
        );
        assert!(matches!(
            device_error("device disconnected"),
            CaptureError::DeviceUnavailable(_)
        ));
    }
}
