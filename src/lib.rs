//! Companion Voice - hands-free voice loop for a desktop companion
//!
//! This library provides the pieces of the voice loop:
//! - Microphone fan-out and wake word detection
//! - Utterance capture, speech recognition and speech synthesis
//! - Streaming dialogue with sentence segmentation
//! - The session controller tying them together
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   frames   ┌─────────────────┐  WakeEvent  ┌──────────────┐
//! │  Microphone  ├──────┬────►│ WakeWordDetector├────────────►│  Controller  │
//! └──────────────┘      │     └─────────────────┘             └──────┬───────┘
//!                       │                                            │ spawns
//!                       │     ┌──────────────────────────────────────▼───────┐
//!                       └────►│ Session: capture → ASR → LLM → segment → TTS │
//!                             │          → playback (in order)               │
//!                             └──────────────────────────────────────────────┘
//! ```

pub mod commands;
pub mod config;
pub mod context;
pub mod controller;
pub mod dialogue;
pub mod error;
pub mod events;
pub mod persona;
pub mod retry;
pub mod session;
pub mod voice;

pub use commands::{CommandMatch, CommandRouter};
pub use config::Config;
pub use context::{ConversationContext, ConversationTurn, Role};
pub use controller::{ControlCommand, ControllerHandle, VoiceSessionController};
pub use dialogue::{DialogueBackend, DialogueEngine, OpenAiChatBackend, Segmenter, TextSegment};
pub use error::{CaptureError, DialogueError, Error, RecognitionError, Result, SynthesisError};
pub use events::{Mood, UiEvent, UiHandle};
pub use persona::Personality;
pub use retry::RetryPolicy;
pub use session::{Backends, SessionOutcome, SessionState};
