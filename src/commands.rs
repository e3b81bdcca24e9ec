//! Desktop command routing
//!
//! Before a transcript reaches the language model it is checked against a
//! table of known commands: first an exact match on the normalized text,
//! then a fuzzy token-window match tolerant of small recognition errors.
//! Replies from the command-parser personality are parsed into the same
//! [`CommandMatch`]. Executing a command is left to whoever listens on the
//! UI channel.

use serde::{Deserialize, Serialize};
use strsim::{jaro_winkler, levenshtein};

use crate::config::CommandsConfig;

/// Confidence reported for a fuzzy match
const FUZZY_CONFIDENCE: f32 = 0.8;

/// Tokens shorter than this must match exactly
const MIN_FUZZY_TOKEN_CHARS: usize = 4;

/// Politeness and filler words dropped before matching
const FILLER_WORDS: &[&str] = &[
    "please", "the", "a", "an", "can", "could", "would", "will", "you", "kindly", "just",
];

/// Built-in commands: name, action, extra phrases
const BUILTIN_COMMANDS: &[(&str, &str, &[&str])] = &[
    ("lock screen", "system_control", &["lock computer"]),
    ("sleep mode", "system_control", &["put computer to sleep"]),
    ("shut down computer", "system_control", &["power off computer"]),
    ("restart computer", "system_control", &["reboot computer"]),
    ("mute", "volume_control", &["mute sound"]),
    ("unmute", "volume_control", &["unmute sound"]),
    ("volume up", "volume_control", &["turn volume up", "louder"]),
    ("volume down", "volume_control", &["turn volume down", "quieter"]),
    ("max volume", "volume_control", &["volume max"]),
    ("play music", "media_control", &["start music"]),
    ("pause music", "media_control", &[]),
    ("stop music", "media_control", &[]),
    ("next track", "media_control", &["next song", "skip song"]),
    ("previous track", "media_control", &["previous song", "last song"]),
    ("open browser", "launch_app", &["launch browser", "start browser"]),
    ("open calculator", "launch_app", &["calculator"]),
    ("open notepad", "launch_app", &["notepad"]),
    ("open task manager", "launch_app", &["task manager"]),
    ("open google", "web_search", &[]),
    ("open youtube", "web_search", &[]),
    ("control panel", "system_setting", &["open control panel"]),
    ("bluetooth settings", "system_setting", &["open bluetooth settings"]),
    ("display settings", "system_setting", &["open display settings"]),
    ("sound settings", "system_setting", &["open sound settings"]),
];

/// One entry in the command table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    /// Canonical command name reported to the executor
    pub name: String,
    /// Action category (e.g. "volume_control", "launch_app")
    pub action: String,
    /// Additional phrasings; the name itself always matches
    pub phrases: Vec<String>,
}

impl CommandSpec {
    #[must_use]
    pub fn new(name: &str, action: &str, phrases: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            action: action.to_string(),
            phrases: phrases.iter().map(|p| (*p).to_string()).collect(),
        }
    }
}

/// The built-in command table
#[must_use]
pub fn builtin_commands() -> Vec<CommandSpec> {
    BUILTIN_COMMANDS
        .iter()
        .map(|(name, action, phrases)| CommandSpec::new(name, action, phrases))
        .collect()
}

/// How a command was recognized
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchKind {
    /// The whole utterance is a known phrase
    Exact,
    /// A known phrase appears in the utterance, allowing small misspellings
    Fuzzy,
    /// The language model returned a structured command
    Parsed,
}

/// A command ready to hand to the executor
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandMatch {
    pub command: String,
    pub action: String,
    /// 0.0-1.0
    pub confidence: f32,
    pub kind: MatchKind,
}

/// Matches transcripts against the command table
#[derive(Debug, Clone)]
pub struct CommandRouter {
    /// (normalized phrase tokens, table index), longest phrase first
    phrases: Vec<(Vec<String>, usize)>,
    table: Vec<CommandSpec>,
    max_distance: usize,
    min_similarity: f64,
}

impl CommandRouter {
    #[must_use]
    pub fn new(config: &CommandsConfig) -> Self {
        let table = config.table.clone();
        let mut phrases: Vec<(Vec<String>, usize)> = table
            .iter()
            .enumerate()
            .flat_map(|(i, spec)| {
                std::iter::once(spec.name.as_str())
                    .chain(spec.phrases.iter().map(String::as_str))
                    .map(move |phrase| (tokens(phrase), i))
            })
            .filter(|(tokens, _)| !tokens.is_empty())
            .collect();
        phrases.sort_by_key(|(tokens, _)| {
            std::cmp::Reverse(tokens.iter().map(String::len).sum::<usize>())
        });

        Self {
            phrases,
            table,
            max_distance: config.max_distance,
            min_similarity: config.min_similarity,
        }
    }

    /// Route a transcript to a command, if it names one
    #[must_use]
    pub fn route(&self, transcript: &str) -> Option<CommandMatch> {
        let words = tokens(transcript);
        if words.is_empty() {
            return None;
        }

        if let Some((_, i)) = self.phrases.iter().find(|(phrase, _)| *phrase == words) {
            return Some(self.matched(*i, 1.0, MatchKind::Exact));
        }

        self.phrases
            .iter()
            .find(|(phrase, _)| self.appears_in(phrase, &words))
            .map(|(_, i)| self.matched(*i, FUZZY_CONFIDENCE, MatchKind::Fuzzy))
    }

    fn matched(&self, index: usize, confidence: f32, kind: MatchKind) -> CommandMatch {
        let spec = &self.table[index];
        CommandMatch {
            command: spec.name.clone(),
            action: spec.action.clone(),
            confidence,
            kind,
        }
    }

    fn appears_in(&self, phrase: &[String], words: &[String]) -> bool {
        phrase.len() <= words.len()
            && words
                .windows(phrase.len())
                .any(|window| window.iter().zip(phrase).all(|(w, p)| self.token_matches(w, p)))
    }

    fn token_matches(&self, word: &str, expected: &str) -> bool {
        if word == expected {
            return true;
        }
        if expected.chars().count() < MIN_FUZZY_TOKEN_CHARS {
            return false;
        }
        levenshtein(word, expected) <= self.max_distance
            && jaro_winkler(word, expected) >= self.min_similarity
    }
}

#[derive(Deserialize)]
struct ParsedCommand {
    is_command: Option<bool>,
    command: Option<String>,
    #[serde(default)]
    confidence: f32,
    action: Option<String>,
}

/// Parse a command-parser reply (bare or fenced JSON)
///
/// Returns `None` for replies that are not JSON or that say no command
/// was requested.
#[must_use]
pub fn parse_command_reply(reply: &str) -> Option<CommandMatch> {
    let body = reply.trim();
    let body = body
        .strip_prefix("```json")
        .or_else(|| body.strip_prefix("```"))
        .unwrap_or(body);
    let body = body.strip_suffix("```").unwrap_or(body).trim();

    let parsed: ParsedCommand = match serde_json::from_str(body) {
        Ok(parsed) => parsed,
        Err(e) => {
            tracing::debug!(error = %e, "structured reply is not a command object");
            return None;
        }
    };

    let command = parsed.command.filter(|c| !c.trim().is_empty())?;
    if parsed.is_command == Some(false) {
        return None;
    }

    Some(CommandMatch {
        command,
        action: parsed.action.unwrap_or_else(|| "unknown".to_string()),
        confidence: parsed.confidence.clamp(0.0, 1.0),
        kind: MatchKind::Parsed,
    })
}

/// Lowercase words with punctuation and filler removed
fn tokens(text: &str) -> Vec<String> {
    text.to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .collect::<String>()
        .split_whitespace()
        .filter(|w| !FILLER_WORDS.contains(w))
        .map(str::to_string)
        .collect()
}
