//! One-way notifications from the controller to the UI
//!
//! The controller never waits on the UI. [`UiHandle`] wraps an unbounded
//! channel; if the receiving side is gone, events are dropped silently.

use serde::Serialize;
use tokio::sync::mpsc;

use crate::commands::{CommandMatch, MatchKind};
use crate::session::SessionState;

/// Expression the companion shows alongside a bubble
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Mood {
    Listening,
    Thinking,
    Talking,
    Apologetic,
    Neutral,
}

/// Event delivered to the UI collaborator
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UiEvent {
    /// Show text in the speech bubble
    Display { text: String, mood: Mood },
    /// Controller state changed
    StateChanged { state: SessionState },
    /// The user asked for a desktop command; executing it is up to the receiver
    Command {
        command: String,
        action: String,
        confidence: f32,
        kind: MatchKind,
    },
}

/// Bubble text shown when a session opens
pub const LISTENING_TEXT: &str = "I'm listening~";

/// Bubble text shown while the request is being processed
pub const THINKING_TEXT: &str = "Thinking...";

/// Shown when the utterance could not be understood
pub const DIDNT_CATCH_TEXT: &str = "Hmm, I didn't catch that.";

/// Spoken or shown when the reply could not be completed
pub const APOLOGY_TEXT: &str = "Sorry, my signal is weak right now.";

/// Sender half handed to the controller
#[derive(Debug, Clone)]
pub struct UiHandle {
    tx: mpsc::UnboundedSender<UiEvent>,
}

impl UiHandle {
    /// Create a handle and the receiver the UI drains
    #[must_use]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<UiEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Handle whose events go nowhere
    #[must_use]
    pub fn detached() -> Self {
        Self::channel().0
    }

    pub fn display(&self, text: impl Into<String>, mood: Mood) {
        self.send(UiEvent::Display {
            text: text.into(),
            mood,
        });
    }

    pub fn state_changed(&self, state: SessionState) {
        self.send(UiEvent::StateChanged { state });
    }

    pub fn command(&self, hit: &CommandMatch) {
        self.send(UiEvent::Command {
            command: hit.command.clone(),
            action: hit.action.clone(),
            confidence: hit.confidence,
            kind: hit.kind,
        });
    }

    fn send(&self, event: UiEvent) {
        if self.tx.send(event).is_err() {
            tracing::trace!("ui receiver dropped, event discarded");
        }
    }
}
