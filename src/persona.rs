//! Companion personalities and their system prompts
//!
//! A personality is selected once per session from the configuration
//! snapshot and rendered into the system prompt sent with every dialogue
//! request.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Personality kinds the companion can take on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Personality {
    /// Playful desktop pet with short, cheerful replies
    #[default]
    Companion,
    /// Warmer, more mature character that respects a reply-length limit
    Devoted,
    /// Turns requests into JSON command objects instead of chatting
    CommandParser,
}

impl Personality {
    /// Stable identifier used in configuration
    #[must_use]
    pub const fn id(self) -> &'static str {
        match self {
            Self::Companion => "companion",
            Self::Devoted => "devoted",
            Self::CommandParser => "command_parser",
        }
    }

    /// Resolve a configured id, falling back to [`Personality::Companion`]
    #[must_use]
    pub fn from_id_or_default(id: &str) -> Self {
        id.parse().unwrap_or_else(|()| {
            tracing::warn!(id, "unknown personality, using companion");
            Self::default()
        })
    }

    /// Render the system prompt for this personality
    ///
    /// `length_limit` is the maximum reply length in characters; zero means
    /// unlimited. Only [`Personality::Devoted`] states the limit explicitly.
    #[must_use]
    pub fn system_prompt(self, name: &str, length_limit: usize) -> String {
        match self {
            Self::Companion => companion_prompt(name),
            Self::Devoted => devoted_prompt(name, length_limit),
            Self::CommandParser => command_parser_prompt(),
        }
    }

    /// Whether replies are meant to be spoken aloud
    #[must_use]
    pub const fn is_conversational(self) -> bool {
        !matches!(self, Self::CommandParser)
    }
}

impl FromStr for Personality {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "companion" | "pet" => Ok(Self::Companion),
            "devoted" | "enhanced" => Ok(Self::Devoted),
            "command_parser" | "commands" => Ok(Self::CommandParser),
            _ => Err(()),
        }
    }
}

impl fmt::Display for Personality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

fn companion_prompt(name: &str) -> String {
    format!(
        "You are {name}, a small ghost who lives on the user's desktop.\n\
         You are lively, a little mischievous, and very fond of the user.\n\
         Keep every reply short (one or two sentences) and conversational, \
         because it will be read aloud.\n\
         Avoid lists, markdown, and code blocks."
    )
}

fn devoted_prompt(name: &str, length_limit: usize) -> String {
    let mut prompt = format!(
        "You are {name}, a gentle companion who has chosen to stay on the user's desktop.\n\
         You are mature, warm, and steady; never sarcastic or dismissive.\n\
         Speak naturally and briefly, as your words are spoken by a voice engine.\n\
         Never describe yourself as a program or a model. If you cannot answer, \
         say the signal is weak right now."
    );

    if length_limit > 0 {
        prompt.push_str(&format!(
            "\n\nImportant: keep each reply under {length_limit} characters. \
             Summarize if you need to say more."
        ));
    }

    prompt
}

fn command_parser_prompt() -> String {
    "You convert a spoken request into a desktop command.\n\
     If the request asks for a system action, answer with JSON only:\n\
     {\"is_command\": true, \"command\": \"<name>\", \"confidence\": <0.0-1.0>, \
     \"action\": \"<system_control|volume_control|media_control|launch_app|system_setting|web_search>\"}\n\
     Otherwise answer {\"is_command\": false, \"command\": null, \"confidence\": 0.0}.\n\
     Known commands: lock screen, sleep, mute, unmute, volume up, volume down, \
     play music, pause music, next track, previous track, open browser, open calculator."
        .to_string()
}
