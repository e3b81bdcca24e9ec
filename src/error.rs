//! Error types for the companion voice pipeline

use std::time::Duration;

use thiserror::Error;

use crate::retry::Retryable;

/// Result type alias for crate-level operations
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors raised outside a running session (startup, devices, config)
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Audio device error
    #[error("audio error: {0}")]
    Audio(String),

    /// Wake word model error
    #[error("wake word error: {0}")]
    WakeWord(String),

    /// Capture failure surfaced outside a session
    #[error(transparent)]
    Capture(#[from] CaptureError),

    /// Synthesis failure surfaced outside a session
    #[error(transparent)]
    Synthesis(#[from] SynthesisError),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Failure to capture an utterance from the microphone
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CaptureError {
    /// No input device, device busy, or the frame stream ended
    #[error("capture device unavailable: {0}")]
    DeviceUnavailable(String),

    /// The OS refused access to the microphone
    #[error("microphone permission denied")]
    PermissionDenied,

    /// Nothing above the voice threshold before the no-speech timeout
    #[error("no speech detected within {0:?}")]
    NoSpeechTimeout(Duration),

    /// Session was cancelled while capturing
    #[error("capture cancelled")]
    Cancelled,
}

/// Failure to turn an utterance into text
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecognitionError {
    /// Transport failure, server error, or call timeout
    #[error("recognition network error: {0}")]
    Network(String),

    /// Credentials rejected
    #[error("recognition auth error: {0}")]
    Auth(String),

    /// Backend answered but produced no words
    #[error("recognition produced an empty transcript")]
    EmptyResult,

    /// Backend answered with something that is not a transcript
    #[error("malformed recognition response: {0}")]
    Malformed(String),

    /// Session was cancelled mid-call
    #[error("recognition cancelled")]
    Cancelled,
}

/// Failure while streaming a reply from the language model
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DialogueError {
    /// Connection, first-token, or idle timeout
    #[error("dialogue timed out: {0}")]
    Timeout(String),

    /// Transport failure or server error
    #[error("dialogue network error: {0}")]
    Network(String),

    /// Credentials rejected
    #[error("dialogue auth error: {0}")]
    Auth(String),

    /// Backend asked us to slow down
    #[error("dialogue rate limited: {0}")]
    RateLimit(String),

    /// Stream framing or payload could not be parsed
    #[error("malformed dialogue stream: {0}")]
    MalformedStream(String),

    /// Session was cancelled mid-stream
    #[error("dialogue cancelled")]
    Cancelled,
}

/// Failure to synthesize one text segment
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SynthesisError {
    /// Transport failure, server error, or segment timeout
    #[error("synthesis network error: {0}")]
    Network(String),

    /// Credentials rejected
    #[error("synthesis auth error: {0}")]
    Auth(String),

    /// Backend does not know the configured voice
    #[error("unsupported voice: {0}")]
    UnsupportedVoice(String),

    /// Segment has nothing speakable in it
    #[error("segment has no speakable text")]
    EmptyText,

    /// Returned audio could not be decoded
    #[error("audio decode error: {0}")]
    Decode(String),

    /// Session was cancelled mid-call
    #[error("synthesis cancelled")]
    Cancelled,
}

impl Retryable for RecognitionError {
    fn is_transient(&self) -> bool {
        matches!(self, Self::Network(_))
    }

    fn timed_out(after: Duration) -> Self {
        Self::Network(format!("call timed out after {after:?}"))
    }

    fn cancelled() -> Self {
        Self::Cancelled
    }
}

impl Retryable for DialogueError {
    fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Network(_) | Self::RateLimit(_))
    }

    fn timed_out(after: Duration) -> Self {
        Self::Timeout(format!("no response after {after:?}"))
    }

    fn cancelled() -> Self {
        Self::Cancelled
    }
}

impl Retryable for SynthesisError {
    fn is_transient(&self) -> bool {
        matches!(self, Self::Network(_))
    }

    fn timed_out(after: Duration) -> Self {
        Self::Network(format!("segment timed out after {after:?}"))
    }

    fn cancelled() -> Self {
        Self::Cancelled
    }
}

/// Coarse classification of an HTTP status shared by all backends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    /// 401 / 403
    Auth,
    /// 429
    RateLimited,
    /// 5xx
    Server,
    /// Any other non-success status
    Client,
}

/// Classify a non-success HTTP status
#[must_use]
pub const fn classify_status(status: u16) -> StatusClass {
    match status {
        401 | 403 => StatusClass::Auth,
        429 => StatusClass::RateLimited,
        500..=599 => StatusClass::Server,
        _ => StatusClass::Client,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_failures_are_never_transient() {
        assert!(!RecognitionError::Auth("401".into()).is_transient());
        assert!(!DialogueError::Auth("403".into()).is_transient());
        assert!(!SynthesisError::Auth("401".into()).is_transient());
    }

    #[test]
    fn malformed_failures_are_never_transient() {
        assert!(!RecognitionError::Malformed("not json".into()).is_transient());
        assert!(!DialogueError::MalformedStream("bad frame".into()).is_transient());
    }

    #[test]
    fn timeouts_count_as_network_failures() {
        let asr = RecognitionError::timed_out(Duration::from_secs(1));
        assert!(matches!(asr, RecognitionError::Network(_)));
        assert!(asr.is_transient());

        let llm = DialogueError::timed_out(Duration::from_secs(1));
        assert!(matches!(llm, DialogueError::Timeout(_)));
        assert!(llm.is_transient());
    }

    #[test]
    fn rate_limit_is_transient() {
        assert!(DialogueError::RateLimit("429".into()).is_transient());
    }

    #[test]
    fn status_classes() {
        assert_eq!(classify_status(401), StatusClass::Auth);
        assert_eq!(classify_status(403), StatusClass::Auth);
        assert_eq!(classify_status(429), StatusClass::RateLimited);
        assert_eq!(classify_status(503), StatusClass::Server);
        assert_eq!(classify_status(400), StatusClass::Client);
    }
}
