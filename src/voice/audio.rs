//! Audio value types shared by the pipeline stages

use std::time::{Duration, Instant};

use crate::{Error, Result};

/// Sample rate for audio capture (16kHz for speech)
pub const SAMPLE_RATE: u32 = 16000;

/// Samples per frame published by the microphone (20 ms at 16kHz)
pub const FRAME_SAMPLES: usize = 320;

/// One block of mono PCM from the microphone
///
/// Immutable once produced; each stage receives it by value.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioChunk {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub captured_at: Instant,
}

impl AudioChunk {
    #[must_use]
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
            captured_at: Instant::now(),
        }
    }

    /// Playing time of this chunk
    #[must_use]
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        let samples = u64::try_from(self.samples.len()).unwrap_or(u64::MAX);
        Duration::from_nanos(samples.saturating_mul(1_000_000_000) / u64::from(self.sample_rate))
    }

    /// RMS energy of the chunk
    #[must_use]
    pub fn energy(&self) -> f32 {
        rms_energy(&self.samples)
    }
}

/// Why an utterance ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndMarker {
    /// Trailing silence after speech
    Silence,
    /// Hit the maximum utterance length
    MaxDuration,
}

/// A finalized unit of user speech
#[derive(Debug, Clone, PartialEq)]
pub struct Utterance {
    pub chunks: Vec<AudioChunk>,
    pub end: EndMarker,
}

impl Utterance {
    /// Sample rate of the first chunk, or [`SAMPLE_RATE`] if empty
    #[must_use]
    pub fn sample_rate(&self) -> u32 {
        self.chunks.first().map_or(SAMPLE_RATE, |c| c.sample_rate)
    }

    /// Total captured duration
    #[must_use]
    pub fn duration(&self) -> Duration {
        self.chunks.iter().map(AudioChunk::duration).sum()
    }

    /// Concatenated samples
    #[must_use]
    pub fn samples(&self) -> Vec<f32> {
        let len = self.chunks.iter().map(|c| c.samples.len()).sum();
        let mut out = Vec::with_capacity(len);
        for chunk in &self.chunks {
            out.extend_from_slice(&chunk.samples);
        }
        out
    }

    /// Encode as 16-bit mono WAV for recognition backends
    ///
    /// # Errors
    ///
    /// Returns error if WAV encoding fails
    pub fn to_wav(&self) -> Result<Vec<u8>> {
        samples_to_wav(&self.samples(), self.sample_rate())
    }
}

/// Synthesized audio ready for playback
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl AudioBuffer {
    #[must_use]
    pub const fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    /// Scale by `volume / 50`, clamping to [-1, 1]
    ///
    /// 50 leaves the buffer untouched, 0 mutes it.
    #[must_use]
    pub fn with_volume(mut self, volume: u8) -> Self {
        if volume == 50 {
            return self;
        }
        let gain = f32::from(volume.min(100)) / 50.0;
        for sample in &mut self.samples {
            *sample = (*sample * gain).clamp(-1.0, 1.0);
        }
        self
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Convert f32 samples to WAV bytes for STT APIs
///
/// # Errors
///
/// Returns error if WAV encoding fails
pub fn samples_to_wav(samples: &[f32], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer =
            hound::WavWriter::new(&mut cursor, spec).map_err(|e| Error::Audio(e.to_string()))?;

        for &sample in samples {
            #[allow(clippy::cast_possible_truncation)]
            let sample_i16 = (sample * 32767.0).clamp(-32768.0, 32767.0) as i16;
            writer
                .write_sample(sample_i16)
                .map_err(|e| Error::Audio(e.to_string()))?;
        }

        writer.finalize().map_err(|e| Error::Audio(e.to_string()))?;
    }

    Ok(cursor.into_inner())
}

/// Calculate RMS energy of audio samples
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn rms_energy(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }

    let sum_squares: f32 = samples.iter().map(|s| s * s).sum();
    (sum_squares / samples.len() as f32).sqrt()
}
