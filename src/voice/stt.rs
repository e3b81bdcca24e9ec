//! Speech-to-text (STT) processing

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::audio::Utterance;
use crate::config::AsrConfig;
use crate::error::{RecognitionError, StatusClass, classify_status};
use crate::retry::{RetryPolicy, retry_with_backoff};
use crate::{Error, Result};

/// An online recognition service
#[async_trait]
pub trait RecognitionBackend: Send + Sync {
    /// Transcribe one utterance (single attempt, no retry)
    async fn transcribe(&self, utterance: &Utterance) -> Result<String, RecognitionError>;
}

/// Response from OpenAI Whisper transcription API
#[derive(serde::Deserialize)]
struct WhisperResponse {
    text: String,
}

/// `OpenAI` Whisper-compatible transcription backend
pub struct WhisperBackend {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
}

impl WhisperBackend {
    /// # Errors
    ///
    /// Returns error if the API key is missing
    pub fn new(config: &AsrConfig) -> Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| Error::Config("API key required for speech recognition".to_string()))?;

        Ok(Self {
            client: reqwest::Client::new(),
            endpoint: config.endpoint.clone(),
            api_key,
            model: config.model.clone(),
        })
    }
}

#[async_trait]
impl RecognitionBackend for WhisperBackend {
    async fn transcribe(&self, utterance: &Utterance) -> Result<String, RecognitionError> {
        let audio = utterance
            .to_wav()
            .map_err(|e| RecognitionError::Malformed(e.to_string()))?;
        tracing::debug!(audio_bytes = audio.len(), "starting Whisper transcription");

        let form = reqwest::multipart::Form::new()
            .part(
                "file",
                reqwest::multipart::Part::bytes(audio)
                    .file_name("audio.wav")
                    .mime_str("audio/wav")
                    .map_err(|e| RecognitionError::Malformed(e.to_string()))?,
            )
            .text("model", self.model.clone());

        let response = self
            .client
            .post(&self.endpoint)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .multipart(form)
            .send()
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "Whisper request failed");
                RecognitionError::Network(e.to_string())
            })?;

        let status = response.status();
        tracing::debug!(status = %status, "received response");

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %body, "Whisper API error");
            let message = format!("Whisper API error {status}: {body}");
            return Err(match classify_status(status.as_u16()) {
                StatusClass::Auth => RecognitionError::Auth(message),
                StatusClass::RateLimited | StatusClass::Server => {
                    RecognitionError::Network(message)
                }
                StatusClass::Client => RecognitionError::Malformed(message),
            });
        }

        let result: WhisperResponse = response.json().await.map_err(|e| {
            tracing::error!(error = %e, "failed to parse response");
            if e.is_decode() {
                RecognitionError::Malformed(e.to_string())
            } else {
                RecognitionError::Network(e.to_string())
            }
        })?;

        Ok(result.text)
    }
}

/// Converts finalized utterances into text with bounded retry
#[derive(Clone)]
pub struct SpeechRecognizer {
    backend: Arc<dyn RecognitionBackend>,
    policy: RetryPolicy,
    call_timeout: Duration,
}

impl SpeechRecognizer {
    #[must_use]
    pub fn new(
        backend: Arc<dyn RecognitionBackend>,
        policy: RetryPolicy,
        call_timeout: Duration,
    ) -> Self {
        Self {
            backend,
            policy,
            call_timeout,
        }
    }

    /// Transcribe `utterance`, retrying transient failures
    ///
    /// # Errors
    ///
    /// - `Network` after the retry policy is exhausted
    /// - `Auth` / `Malformed` immediately
    /// - `EmptyResult` if the backend heard no words
    /// - `Cancelled` if `cancel` fires
    pub async fn recognize(
        &self,
        utterance: &Utterance,
        cancel: &CancellationToken,
    ) -> Result<String, RecognitionError> {
        let text = retry_with_backoff(
            &self.policy,
            self.call_timeout,
            cancel,
            "speech recognition",
            |attempt| {
                let backend = Arc::clone(&self.backend);
                async move {
                    tracing::debug!(attempt, "recognition attempt");
                    backend.transcribe(utterance).await
                }
            },
        )
        .await?;

        let transcript = text.trim();
        if transcript.is_empty() {
            tracing::debug!("recognition returned no words");
            return Err(RecognitionError::EmptyResult);
        }

        tracing::info!(transcript, "transcription complete");
        Ok(transcript.to_string())
    }
}

impl std::fmt::Debug for SpeechRecognizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpeechRecognizer")
            .field("policy", &self.policy)
            .field("call_timeout", &self.call_timeout)
            .finish_non_exhaustive()
    }
}
