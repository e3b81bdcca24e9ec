//! Configuration snapshot for the companion voice pipeline
//!
//! [`Config`] is built once (env > toml > default) and handed to the
//! controller behind an `Arc`. Sessions keep the snapshot they were opened
//! with; a reload only affects sessions opened afterwards.

pub mod file;

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::commands::{CommandSpec, builtin_commands};
use crate::dialogue::SegmenterConfig;
use crate::persona::Personality;
use crate::retry::RetryPolicy;
use crate::{Error, Result};

use file::{CommandFileEntry, CompanionConfigFile, KeywordFileEntry};

/// Envelope used when no keyword model is configured: two syllables,
/// stressed second ("hi-PET")
pub const DEFAULT_WAKE_ENVELOPE: &[f32] = &[
    0.05, 0.30, 0.65, 0.80, 0.60, 0.25, 0.15, 0.40, 0.85, 1.00, 0.90, 0.55, 0.20, 0.05,
];

/// Companion configuration snapshot
#[derive(Debug, Clone)]
pub struct Config {
    /// Companion display name used in prompts
    pub name: String,

    /// Wake word detection
    pub wake: WakeConfig,

    /// Utterance capture
    pub capture: CaptureConfig,

    /// Speech recognition backend
    pub asr: AsrConfig,

    /// Language model backend
    pub llm: LlmConfig,

    /// Reply segmentation
    pub segmenter: SegmenterConfig,

    /// Speech synthesis backend
    pub tts: TtsConfig,

    /// Local command routing
    pub commands: CommandsConfig,

    /// Retry policy for every backend call
    pub retry: RetryPolicy,

    /// Time a cancelled session gets to wind down before it is aborted
    pub cancel_budget: Duration,
}

/// Wake word detection configuration
#[derive(Debug, Clone, PartialEq)]
pub struct WakeConfig {
    /// Keyword models
    pub keywords: Vec<KeywordSpec>,

    /// Score threshold (0.0-1.0)
    pub threshold: f32,

    /// Consecutive frames above threshold required to fire
    pub min_consecutive_frames: usize,

    /// Suppression window after a wake event
    pub cooldown: Duration,

    /// A wake event while speaking cancels the session instead of being dropped
    pub barge_in: bool,
}

/// Keyword model description
#[derive(Debug, Clone, PartialEq)]
pub struct KeywordSpec {
    /// Label reported in wake events
    pub label: String,

    /// Where the envelope template comes from
    pub source: KeywordSource,
}

/// Source of a keyword envelope template
#[derive(Debug, Clone, PartialEq)]
pub enum KeywordSource {
    /// JSON array of floats on disk
    File(PathBuf),
    /// Inline envelope
    Envelope(Vec<f32>),
}

/// Utterance capture configuration
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// RMS level above which a frame counts as voice
    pub vad_threshold: f32,

    /// Silence after speech that ends the utterance
    pub trailing_silence: Duration,

    /// Hard cap on utterance length
    pub max_utterance: Duration,

    /// Give up if no voice is heard within this window
    pub no_speech_timeout: Duration,

    /// Frames buffered per consumer before the oldest are dropped
    pub fanout_capacity: usize,
}

/// Speech recognition configuration
#[derive(Debug, Clone)]
pub struct AsrConfig {
    /// Transcription endpoint
    pub endpoint: String,

    /// Model identifier (e.g. "whisper-1")
    pub model: String,

    /// API key
    pub api_key: Option<String>,

    /// Per-call timeout
    pub timeout: Duration,
}

/// Language model configuration
#[derive(Debug, Clone)]
pub struct LlmConfig {
    /// OpenAI-compatible base URL
    pub base_url: String,

    /// Model identifier
    pub model: String,

    /// API key
    pub api_key: Option<String>,

    /// Active personality
    pub personality: Personality,

    /// Maximum tokens per reply
    pub max_tokens: u32,

    /// Sampling temperature
    pub temperature: f32,

    /// Reply length limit in characters (0 = unlimited)
    pub response_length_limit: usize,

    /// Most recent turns sent as history
    pub history_turns: usize,

    /// Estimated token budget for history
    pub history_tokens: usize,

    /// Time allowed for the first delta to arrive
    pub first_token_timeout: Duration,

    /// Time allowed between deltas once streaming
    pub idle_timeout: Duration,
}

/// Speech synthesis configuration
#[derive(Debug, Clone)]
pub struct TtsConfig {
    /// Synthesis endpoint
    pub endpoint: String,

    /// Model identifier (e.g. "tts-1")
    pub model: String,

    /// API key
    pub api_key: Option<String>,

    /// Voice identifier
    pub voice: String,

    /// Speech rate multiplier
    pub speed: f32,

    /// Output volume 0-100 (50 = unity gain)
    pub volume: u8,

    /// Segments synthesized concurrently (1-3)
    pub concurrency: usize,

    /// Per-segment timeout
    pub segment_timeout: Duration,
}

/// Command routing configuration
#[derive(Debug, Clone)]
pub struct CommandsConfig {
    /// Route transcripts through the command table before the language model
    pub enabled: bool,

    /// Built-in commands followed by custom ones
    pub table: Vec<CommandSpec>,

    /// Maximum edit distance per word for a fuzzy match
    pub max_distance: usize,

    /// Minimum Jaro-Winkler similarity per word for a fuzzy match
    pub min_similarity: f64,
}

impl Default for CommandsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            table: builtin_commands(),
            max_distance: 1,
            min_similarity: 0.9,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_sources(CompanionConfigFile::default(), |_| None)
    }
}

impl Config {
    /// Load configuration from the environment and a TOML file
    ///
    /// With `path = None` the standard location is used and a missing or
    /// broken file falls back to defaults.
    ///
    /// # Errors
    ///
    /// Returns error if an explicit config file cannot be loaded
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let fc = match path {
            Some(path) => file::read_config_file(path)?,
            None => file::load_config_file(),
        };

        let config = Self::from_sources(fc, |key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Build a snapshot from a parsed file and an environment lookup
    ///
    /// Precedence per field: env > file > default.
    pub fn from_sources(fc: CompanionConfigFile, env: impl Fn(&str) -> Option<String>) -> Self {
        let openai_key = env("OPENAI_API_KEY");

        let keywords = fc.wake.keywords.map_or_else(
            || {
                vec![KeywordSpec {
                    label: "hi-pet".to_string(),
                    source: KeywordSource::Envelope(DEFAULT_WAKE_ENVELOPE.to_vec()),
                }]
            },
            |entries| entries.into_iter().filter_map(keyword_spec).collect(),
        );

        let wake = WakeConfig {
            keywords,
            threshold: parse_env(&env, "COMPANION_WAKE_THRESHOLD")
                .or(fc.wake.threshold)
                .unwrap_or(0.6),
            min_consecutive_frames: fc.wake.min_consecutive_frames.unwrap_or(3),
            cooldown: millis(fc.wake.cooldown_ms, 2000),
            barge_in: env("COMPANION_BARGE_IN")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .or(fc.wake.barge_in)
                .unwrap_or(false),
        };

        let capture = CaptureConfig {
            vad_threshold: fc.capture.vad_threshold.unwrap_or(0.02),
            trailing_silence: millis(fc.capture.trailing_silence_ms, 800),
            max_utterance: millis(fc.capture.max_utterance_ms, 10_000),
            no_speech_timeout: millis(fc.capture.no_speech_timeout_ms, 5_000),
            fanout_capacity: fc.capture.fanout_capacity.unwrap_or(64),
        };

        let asr = AsrConfig {
            endpoint: env("COMPANION_ASR_ENDPOINT")
                .or(fc.asr.endpoint)
                .unwrap_or_else(|| "https://api.openai.com/v1/audio/transcriptions".to_string()),
            model: fc.asr.model.unwrap_or_else(|| "whisper-1".to_string()),
            api_key: env("COMPANION_ASR_API_KEY")
                .or(fc.asr.api_key)
                .or_else(|| openai_key.clone()),
            timeout: millis(fc.asr.timeout_ms, 15_000),
        };

        let personality = env("COMPANION_PERSONALITY")
            .or(fc.llm.personality)
            .map_or_else(Personality::default, |id| {
                Personality::from_id_or_default(&id)
            });

        let llm = LlmConfig {
            base_url: env("COMPANION_LLM_BASE_URL")
                .or(fc.llm.base_url)
                .map_or_else(
                    || "https://api.openai.com/v1".to_string(),
                    |url| url.trim_matches('`').trim_end_matches('/').to_string(),
                ),
            model: env("COMPANION_LLM_MODEL")
                .or(fc.llm.model)
                .unwrap_or_else(|| "gpt-4o-mini".to_string()),
            api_key: env("COMPANION_LLM_API_KEY")
                .or(fc.llm.api_key)
                .or_else(|| openai_key.clone()),
            personality,
            max_tokens: fc.llm.max_tokens.unwrap_or(150),
            temperature: fc.llm.temperature.unwrap_or(0.7),
            response_length_limit: fc.llm.response_length_limit.unwrap_or(0),
            history_turns: fc.llm.history_turns.unwrap_or(6),
            history_tokens: fc.llm.history_tokens.unwrap_or(1500),
            first_token_timeout: millis(fc.llm.first_token_timeout_ms, 10_000),
            idle_timeout: millis(fc.llm.idle_timeout_ms, 15_000),
        };

        let defaults = SegmenterConfig::default();
        let segmenter = SegmenterConfig {
            clause_min_chars: fc.llm.clause_min_chars.unwrap_or(defaults.clause_min_chars),
            max_pending_chars: fc
                .llm
                .max_segment_chars
                .unwrap_or(defaults.max_pending_chars),
        };

        let tts = TtsConfig {
            endpoint: env("COMPANION_TTS_ENDPOINT")
                .or(fc.tts.endpoint)
                .unwrap_or_else(|| "https://api.openai.com/v1/audio/speech".to_string()),
            model: fc.tts.model.unwrap_or_else(|| "tts-1".to_string()),
            api_key: env("COMPANION_TTS_API_KEY")
                .or(fc.tts.api_key)
                .or(openai_key),
            voice: env("COMPANION_TTS_VOICE")
                .or(fc.tts.voice)
                .unwrap_or_else(|| "nova".to_string()),
            speed: fc.tts.speed.unwrap_or(1.0),
            volume: fc.tts.volume.unwrap_or(50).min(100),
            concurrency: fc.tts.concurrency.unwrap_or(2).clamp(1, 3),
            segment_timeout: millis(fc.tts.segment_timeout_ms, 10_000),
        };

        let mut table = builtin_commands();
        table.extend(fc.commands.custom.into_iter().filter_map(command_spec));
        let commands = CommandsConfig {
            enabled: fc.commands.enabled.unwrap_or(true),
            table,
            max_distance: fc.commands.max_distance.unwrap_or(1),
            min_similarity: fc.commands.min_similarity.unwrap_or(0.9),
        };

        let base = RetryPolicy::default();
        let retry = RetryPolicy {
            max_attempts: fc.retry.max_attempts.unwrap_or(base.max_attempts).max(1),
            base_delay: fc
                .retry
                .base_delay_ms
                .map_or(base.base_delay, Duration::from_millis),
            max_delay: fc
                .retry
                .max_delay_ms
                .map_or(base.max_delay, Duration::from_millis),
        };

        Self {
            name: env("COMPANION_NAME")
                .or(fc.name)
                .unwrap_or_else(|| "Pip".to_string()),
            wake,
            capture,
            asr,
            llm,
            segmenter,
            tts,
            commands,
            retry,
            cancel_budget: millis(fc.cancel_budget_ms, 2_000),
        }
    }

    /// Check values that cannot be clamped into range
    ///
    /// # Errors
    ///
    /// Returns error describing the first invalid setting
    pub fn validate(&self) -> Result<()> {
        if !(self.wake.threshold > 0.0 && self.wake.threshold <= 1.0) {
            return Err(Error::Config(format!(
                "wake threshold must be in (0, 1], got {}",
                self.wake.threshold
            )));
        }

        if self.wake.keywords.is_empty() {
            return Err(Error::Config("at least one wake keyword is required".to_string()));
        }

        if self.wake.min_consecutive_frames == 0 {
            return Err(Error::Config(
                "wake.min_consecutive_frames must be at least 1".to_string(),
            ));
        }

        if self.capture.fanout_capacity == 0 {
            return Err(Error::Config("capture.fanout_capacity must be at least 1".to_string()));
        }

        if self.segmenter.max_pending_chars == 0 {
            return Err(Error::Config("llm.max_segment_chars must be at least 1".to_string()));
        }

        if !(0.0..=1.0).contains(&self.commands.min_similarity) {
            return Err(Error::Config(format!(
                "commands.min_similarity must be in [0, 1], got {}",
                self.commands.min_similarity
            )));
        }

        Ok(())
    }

    /// Rendered system prompt for the active personality
    #[must_use]
    pub fn system_prompt(&self) -> String {
        self.llm
            .personality
            .system_prompt(&self.name, self.llm.response_length_limit)
    }
}

fn keyword_spec(entry: KeywordFileEntry) -> Option<KeywordSpec> {
    let source = match (entry.template, entry.envelope) {
        (Some(path), _) => KeywordSource::File(path),
        (None, Some(envelope)) => KeywordSource::Envelope(envelope),
        (None, None) => {
            tracing::warn!(label = %entry.label, "keyword has no template or envelope, skipping");
            return None;
        }
    };

    Some(KeywordSpec {
        label: entry.label,
        source,
    })
}

fn command_spec(entry: CommandFileEntry) -> Option<CommandSpec> {
    if entry.name.trim().is_empty() {
        tracing::warn!("custom command without a name, skipping");
        return None;
    }

    Some(CommandSpec {
        name: entry.name,
        action: entry.action.unwrap_or_else(|| "custom_command".to_string()),
        phrases: entry.phrases,
    })
}

fn parse_env<T: FromStr>(env: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    env(key).and_then(|v| v.parse().ok())
}

fn millis(value: Option<u64>, default: u64) -> Duration {
    Duration::from_millis(value.unwrap_or(default))
}
