//! Text-to-speech (TTS) processing
//!
//! [`SpeechSynthesizer::pipeline`] synthesizes up to `concurrency` segments
//! at once but yields them strictly in sequence order: a segment that
//! finishes early waits in the buffer until every earlier segment has been
//! released. Segments that fail are logged and skipped.

use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use super::audio::AudioBuffer;
use crate::config::TtsConfig;
use crate::dialogue::TextSegment;
use crate::error::{StatusClass, SynthesisError, classify_status};
use crate::retry::{RetryPolicy, retry_with_backoff};
use crate::{Error, Result};

/// An online synthesis service
#[async_trait]
pub trait SynthesisBackend: Send + Sync {
    /// Synthesize one piece of text (single attempt, no retry)
    async fn synthesize(&self, text: &str) -> Result<AudioBuffer, SynthesisError>;
}

/// `OpenAI`-compatible speech endpoint
pub struct OpenAiSpeechBackend {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    voice: String,
    speed: f32,
    model: String,
}

impl OpenAiSpeechBackend {
    /// # Errors
    ///
    /// Returns error if the API key is missing
    pub fn new(config: &TtsConfig) -> Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| Error::Config("API key required for TTS".to_string()))?;

        Ok(Self {
            client: reqwest::Client::new(),
            endpoint: config.endpoint.clone(),
            api_key,
            voice: config.voice.clone(),
            speed: config.speed,
            model: config.model.clone(),
        })
    }
}

#[async_trait]
impl SynthesisBackend for OpenAiSpeechBackend {
    async fn synthesize(&self, text: &str) -> Result<AudioBuffer, SynthesisError> {
        #[derive(serde::Serialize)]
        struct TtsRequest<'a> {
            model: &'a str,
            input: &'a str,
            voice: &'a str,
            speed: f32,
            response_format: &'a str,
        }

        let request = TtsRequest {
            model: &self.model,
            input: text,
            voice: &self.voice,
            speed: self.speed,
            response_format: "mp3",
        };

        let response = self
            .client
            .post(&self.endpoint)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request)
            .send()
            .await
            .map_err(|e| SynthesisError::Network(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            let message = format!("TTS error {status}: {body}");
            return Err(match classify_status(status.as_u16()) {
                StatusClass::Auth => SynthesisError::Auth(message),
                StatusClass::RateLimited | StatusClass::Server => SynthesisError::Network(message),
                StatusClass::Client if body.contains("voice") => {
                    SynthesisError::UnsupportedVoice(self.voice.clone())
                }
                StatusClass::Client => SynthesisError::Decode(message),
            });
        }

        let audio = response
            .bytes()
            .await
            .map_err(|e| SynthesisError::Network(e.to_string()))?;
        decode_mp3(&audio)
    }
}

/// Decode MP3 bytes to mono f32 samples at the stream's own sample rate
///
/// # Errors
///
/// Returns `Decode` if the data is not valid MP3
pub fn decode_mp3(mp3_data: &[u8]) -> Result<AudioBuffer, SynthesisError> {
    let mut decoder = minimp3::Decoder::new(Cursor::new(mp3_data));
    let mut samples = Vec::new();
    let mut sample_rate = 0;

    loop {
        match decoder.next_frame() {
            Ok(frame) => {
                sample_rate = u32::try_from(frame.sample_rate).unwrap_or(0);
                if frame.channels == 2 {
                    samples.extend(frame.data.chunks(2).map(|pair| {
                        let left = f32::from(pair[0]) / 32768.0;
                        let right = f32::from(pair.get(1).copied().unwrap_or(pair[0])) / 32768.0;
                        f32::midpoint(left, right)
                    }));
                } else {
                    samples.extend(frame.data.iter().map(|&s| f32::from(s) / 32768.0));
                }
            }
            Err(minimp3::Error::Eof) => break,
            Err(e) => return Err(SynthesisError::Decode(format!("MP3 decode error: {e}"))),
        }
    }

    if samples.is_empty() || sample_rate == 0 {
        return Err(SynthesisError::Decode("no audio frames in response".to_string()));
    }

    Ok(AudioBuffer::new(samples, sample_rate))
}

/// Whether a segment has anything a voice could say
#[must_use]
pub fn is_speakable(text: &str) -> bool {
    text.chars().any(char::is_alphanumeric)
}

/// Audio for one segment, released in sequence order
#[derive(Debug, Clone, PartialEq)]
pub struct SynthesizedSegment {
    pub seq: u64,
    pub text: String,
    pub audio: AudioBuffer,
}

/// Converts text segments into playable audio
#[derive(Clone)]
pub struct SpeechSynthesizer {
    backend: Arc<dyn SynthesisBackend>,
    policy: RetryPolicy,
    segment_timeout: Duration,
    concurrency: usize,
    volume: u8,
}

impl std::fmt::Debug for SpeechSynthesizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpeechSynthesizer")
            .field("concurrency", &self.concurrency)
            .field("volume", &self.volume)
            .finish_non_exhaustive()
    }
}

impl SpeechSynthesizer {
    #[must_use]
    pub fn new(backend: Arc<dyn SynthesisBackend>, policy: RetryPolicy, config: &TtsConfig) -> Self {
        Self {
            backend,
            policy,
            segment_timeout: config.segment_timeout,
            concurrency: config.concurrency.clamp(1, 3),
            volume: config.volume,
        }
    }

    /// Segments synthesized at once
    #[must_use]
    pub const fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Synthesize a single piece of text with retry and volume applied
    ///
    /// # Errors
    ///
    /// - `EmptyText` if nothing in `text` is speakable
    /// - `Network` after retries are exhausted
    /// - `Auth`, `UnsupportedVoice`, `Decode` immediately
    /// - `Cancelled` if `cancel` fires
    pub async fn synthesize(
        &self,
        text: &str,
        cancel: &CancellationToken,
    ) -> Result<AudioBuffer, SynthesisError> {
        if !is_speakable(text) {
            return Err(SynthesisError::EmptyText);
        }

        let audio = retry_with_backoff(
            &self.policy,
            self.segment_timeout,
            cancel,
            "speech synthesis",
            |_| {
                let backend = Arc::clone(&self.backend);
                async move { backend.synthesize(text).await }
            },
        )
        .await?;

        Ok(audio.with_volume(self.volume))
    }

    /// Pipeline segments into ordered audio
    ///
    /// Up to `concurrency` requests are in flight; output order always
    /// matches input order. The stream ends when `segments` closes or
    /// `cancel` fires.
    pub fn pipeline(
        &self,
        segments: mpsc::Receiver<TextSegment>,
        cancel: CancellationToken,
    ) -> impl Stream<Item = SynthesizedSegment> + Send + 'static {
        let synth = self.clone();
        let stop = cancel.clone();

        ReceiverStream::new(segments)
            .take_until(stop.cancelled_owned())
            .map(move |segment| {
                let synth = synth.clone();
                let cancel = cancel.clone();
                async move {
                    let result = synth.synthesize(&segment.text, &cancel).await;
                    (segment, result)
                }
            })
            .buffered(self.concurrency)
            .filter_map(|(segment, result)| async move {
                match result {
                    Ok(audio) => {
                        tracing::debug!(
                            seq = segment.seq,
                            samples = audio.samples.len(),
                            "segment synthesized"
                        );
                        Some(SynthesizedSegment {
                            seq: segment.seq,
                            text: segment.text,
                            audio,
                        })
                    }
                    Err(SynthesisError::Cancelled) => None,
                    Err(e) => {
                        tracing::warn!(
                            seq = segment.seq,
                            error = %e,
                            "segment synthesis failed, skipping"
                        );
                        None
                    }
                }
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl SynthesisBackend for Echo {
        async fn synthesize(&self, text: &str) -> Result<AudioBuffer, SynthesisError> {
            #[allow(clippy::cast_precision_loss)]
            let marker = text.len() as f32 / 100.0;
            Ok(AudioBuffer::new(vec![marker; 4], 24000))
        }
    }

    fn config() -> TtsConfig {
        TtsConfig {
            endpoint: String::new(),
            model: "tts-1".into(),
            api_key: None,
            voice: "nova".into(),
            speed: 1.0,
            volume: 50,
            concurrency: 2,
            segment_timeout: Duration::from_secs(1),
        }
    }

    #[test]
    fn speakable_text() {
        assert!(is_speakable("Hi!"));
        assert!(is_speakable("晴れ"));
        assert!(!is_speakable("... !?"));
        assert!(!is_speakable("   "));
    }

    #[tokio::test]
    async fn punctuation_only_segment_is_empty_text() {
        let synth = SpeechSynthesizer::new(Arc::new(Echo), RetryPolicy::default(), &config());
        let result = synth.synthesize("...", &CancellationToken::new()).await;
        assert_eq!(result, Err(SynthesisError::EmptyText));
    }

    #[tokio::test]
    async fn volume_is_applied() {
        let mut cfg = config();
        cfg.volume = 100;
        let synth = SpeechSynthesizer::new(Arc::new(Echo), RetryPolicy::default(), &cfg);
        let audio = synth.synthesize("abcd", &CancellationToken::new()).await.unwrap();
        assert!((audio.samples[0] - 0.08).abs() < 1e-6);
    }

    #[tokio::test]
    async fn pipeline_skips_failed_segments() {
        let synth = SpeechSynthesizer::new(Arc::new(Echo), RetryPolicy::default(), &config());
        let (tx, rx) = mpsc::channel(8);
        for (seq, text) in [(0, "Hello there."), (1, "..."), (2, "Bye.")] {
            tx.send(TextSegment {
                seq,
                text: text.to_string(),
            })
            .await
            .unwrap();
        }
        drop(tx);

        let out: Vec<u64> = synth
            .pipeline(rx, CancellationToken::new())
            .map(|s| s.seq)
            .collect()
            .await;
        assert_eq!(out, vec![0, 2]);
    }

    #[test]
    fn concurrency_is_clamped() {
        let mut cfg = config();
        cfg.concurrency = 10;
        let synth = SpeechSynthesizer::new(Arc::new(Echo), RetryPolicy::default(), &cfg);
        assert_eq!(synth.concurrency(), 3);
    }

    #[test]
    fn garbage_is_not_mp3() {
        assert!(matches!(
            decode_mp3(b"definitely not audio"),
            Err(SynthesisError::Decode(_))
        ));
    }
}
