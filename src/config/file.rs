//! TOML configuration file loading
//!
//! Supports `~/.config/companion/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::{Error, Result};

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct CompanionConfigFile {
    /// Display name used in prompts
    pub name: Option<String>,

    /// Wake word detection
    #[serde(default)]
    pub wake: WakeFileConfig,

    /// Utterance capture
    #[serde(default)]
    pub capture: CaptureFileConfig,

    /// Speech recognition backend
    #[serde(default)]
    pub asr: AsrFileConfig,

    /// Language model backend
    #[serde(default)]
    pub llm: LlmFileConfig,

    /// Speech synthesis backend
    #[serde(default)]
    pub tts: TtsFileConfig,

    /// Local command routing
    #[serde(default)]
    pub commands: CommandsFileConfig,

    /// Retry policy shared by all backends
    #[serde(default)]
    pub retry: RetryFileConfig,

    /// Time allowed for a cancelled session to wind down, in milliseconds
    pub cancel_budget_ms: Option<u64>,
}

/// Wake word configuration
#[derive(Debug, Default, Deserialize)]
pub struct WakeFileConfig {
    /// Keyword models to load
    pub keywords: Option<Vec<KeywordFileEntry>>,

    /// Score threshold (0.0-1.0)
    pub threshold: Option<f32>,

    /// Consecutive frames above threshold required to fire
    pub min_consecutive_frames: Option<usize>,

    /// Suppression window after a wake event, in milliseconds
    pub cooldown_ms: Option<u64>,

    /// Let a wake event interrupt the companion while it is speaking
    pub barge_in: Option<bool>,
}

/// One keyword model entry
#[derive(Debug, Clone, Deserialize)]
pub struct KeywordFileEntry {
    /// Label reported in wake events (e.g. "hi-pet")
    pub label: String,

    /// JSON file holding the energy envelope template
    pub template: Option<PathBuf>,

    /// Inline energy envelope template
    pub envelope: Option<Vec<f32>>,
}

/// Capture configuration
#[derive(Debug, Default, Deserialize)]
pub struct CaptureFileConfig {
    pub vad_threshold: Option<f32>,
    pub trailing_silence_ms: Option<u64>,
    pub max_utterance_ms: Option<u64>,
    pub no_speech_timeout_ms: Option<u64>,
    pub fanout_capacity: Option<usize>,
}

/// Speech recognition configuration
#[derive(Debug, Default, Deserialize)]
pub struct AsrFileConfig {
    pub endpoint: Option<String>,
    pub model: Option<String>,
    pub api_key: Option<String>,
    pub timeout_ms: Option<u64>,
}

/// Language model configuration
#[derive(Debug, Default, Deserialize)]
pub struct LlmFileConfig {
    /// OpenAI-compatible base URL (e.g. "https://api.openai.com/v1")
    pub base_url: Option<String>,
    pub model: Option<String>,
    pub api_key: Option<String>,
    pub personality: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub response_length_limit: Option<usize>,
    pub history_turns: Option<usize>,
    pub history_tokens: Option<usize>,
    pub first_token_timeout_ms: Option<u64>,
    pub idle_timeout_ms: Option<u64>,
    /// Pending characters before clause punctuation closes a segment
    pub clause_min_chars: Option<usize>,
    /// Pending characters before a segment is cut without punctuation
    pub max_segment_chars: Option<usize>,
}

/// Speech synthesis configuration
#[derive(Debug, Default, Deserialize)]
pub struct TtsFileConfig {
    pub endpoint: Option<String>,
    pub model: Option<String>,
    pub api_key: Option<String>,
    pub voice: Option<String>,
    pub speed: Option<f32>,
    pub volume: Option<u8>,
    pub concurrency: Option<usize>,
    pub segment_timeout_ms: Option<u64>,
}

/// Command routing configuration
#[derive(Debug, Default, Deserialize)]
pub struct CommandsFileConfig {
    pub enabled: Option<bool>,
    pub max_distance: Option<usize>,
    pub min_similarity: Option<f64>,
    /// Extra commands appended to the built-in table
    #[serde(default)]
    pub custom: Vec<CommandFileEntry>,
}

/// One custom command entry
#[derive(Debug, Clone, Deserialize)]
pub struct CommandFileEntry {
    /// Command name reported to the executor; also matched as a phrase
    pub name: String,

    /// Action category, "custom_command" when omitted
    pub action: Option<String>,

    /// Other ways of saying it
    #[serde(default)]
    pub phrases: Vec<String>,
}

/// Retry configuration
#[derive(Debug, Default, Deserialize)]
pub struct RetryFileConfig {
    pub max_attempts: Option<u32>,
    pub base_delay_ms: Option<u64>,
    pub max_delay_ms: Option<u64>,
}

/// Load the TOML config file from the standard path
///
/// Returns `CompanionConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file() -> CompanionConfigFile {
    let Some(path) = config_file_path() else {
        return CompanionConfigFile::default();
    };

    if !path.exists() {
        return CompanionConfigFile::default();
    }

    match read_config_file(&path) {
        Ok(config) => config,
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to load config file, using defaults"
            );
            CompanionConfigFile::default()
        }
    }
}

/// Read and parse an explicit config file
///
/// # Errors
///
/// Returns error if the file cannot be read or is not valid TOML
pub fn read_config_file(path: &Path) -> Result<CompanionConfigFile> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
    let config = toml::from_str(&content)?;
    tracing::info!(path = %path.display(), "loaded config file");
    Ok(config)
}

/// Return the config file path: `~/.config/companion/config.toml`
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("companion").join("config.toml"))
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn parses_partial_file() {
        let config: CompanionConfigFile = toml::from_str(
            r#"
            name = "Pip"

            [wake]
            threshold = 0.7
            barge_in = true

            [[wake.keywords]]
            label = "hi-pet"
            envelope = [0.1, 0.8, 0.4]

            [llm]
            personality = "devoted"
            "#,
        )
        .unwrap();

        assert_eq!(config.name.as_deref(), Some("Pip"));
        assert_eq!(config.wake.threshold, Some(0.7));
        assert_eq!(config.wake.barge_in, Some(true));
        let keywords = config.wake.keywords.unwrap();
        assert_eq!(keywords[0].label, "hi-pet");
        assert_eq!(keywords[0].envelope.as_deref(), Some(&[0.1, 0.8, 0.4][..]));
        assert_eq!(config.llm.personality.as_deref(), Some("devoted"));
        assert!(config.tts.voice.is_none());
    }

    #[test]
    fn reads_explicit_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[tts]\nvolume = 80").unwrap();

        let config = read_config_file(file.path()).unwrap();
        assert_eq!(config.tts.volume, Some(80));
    }

    #[test]
    fn explicit_file_errors_are_reported() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[tts\nvolume = ").unwrap();

        assert!(matches!(read_config_file(file.path()), Err(Error::Toml(_))));
        assert!(matches!(
            read_config_file(Path::new("/nonexistent/companion.toml")),
            Err(Error::Config(_))
        ));
    }
}
