//! One voice session: capture, recognize, think, speak
//!
//! A session runs as a single task owned by the controller. It never touches
//! the controller's state directly; it reports progress over a channel tagged
//! with its id and returns a [`SessionOutcome`] when it ends. The reply
//! producer, the synthesis pipeline and playback run concurrently inside the
//! session task, so speaking overlaps with the reply still streaming in.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use futures::StreamExt;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::commands::{CommandRouter, parse_command_reply};
use crate::config::Config;
use crate::context::ConversationTurn;
use crate::dialogue::{
    DialogueBackend, DialogueEngine, DialogueSettings, ReplyEvent, SegmenterConfig, Segmenter,
    StreamingReply, TextSegment, classify_reply_start,
};
use crate::error::{CaptureError, DialogueError, RecognitionError};
use crate::events::{APOLOGY_TEXT, DIDNT_CATCH_TEXT, LISTENING_TEXT, Mood, THINKING_TEXT, UiHandle};
use crate::persona::Personality;
use crate::voice::{
    AudioCaptureService, AudioSink, PlaybackOutcome, RecognitionBackend, SpeechRecognizer,
    SpeechSynthesizer, SynthesisBackend, SynthesizedSegment, WakeEvent,
};

/// Segments buffered between the segmenter and synthesis
const SEGMENT_QUEUE: usize = 32;

/// Controller-visible session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Wake listening, no session
    Idle,
    Capturing,
    Recognizing,
    /// Reply streaming; may overlap with `Speaking`
    Thinking,
    /// Playback draining
    Speaking,
    Cancelling,
}

impl SessionState {
    /// Whether `self -> next` is a legal transition
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        use SessionState::{Cancelling, Capturing, Idle, Recognizing, Speaking, Thinking};
        matches!(
            (self, next),
            (Idle, Capturing)
                | (Capturing, Recognizing)
                | (Recognizing, Thinking)
                | (Thinking, Speaking)
                | (Capturing | Recognizing | Thinking | Speaking, Cancelling | Idle)
                | (Cancelling, Idle)
        )
    }

    #[must_use]
    pub const fn is_idle(self) -> bool {
        matches!(self, Self::Idle)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Capturing => "capturing",
            Self::Recognizing => "recognizing",
            Self::Thinking => "thinking",
            Self::Speaking => "speaking",
            Self::Cancelling => "cancelling",
        };
        f.write_str(name)
    }
}

/// Bookkeeping for the active session, owned by the controller
#[derive(Debug)]
pub struct VoiceSession {
    pub id: Uuid,
    pub state: SessionState,
    pub started_at: Instant,
    pub cancel: CancellationToken,
    /// Wake event that opened the session
    pub wake: WakeEvent,
}

impl VoiceSession {
    #[must_use]
    pub fn open(wake: WakeEvent) -> Self {
        Self {
            id: Uuid::new_v4(),
            state: SessionState::Capturing,
            started_at: Instant::now(),
            cancel: CancellationToken::new(),
            wake,
        }
    }
}

/// State report from a session task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionProgress {
    pub session: Uuid,
    pub state: SessionState,
}

/// How a session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    /// Reply fully spoken (or displayed, for structured replies)
    Completed,
    /// Capture failed; silent return to idle
    CaptureFailed(CaptureError),
    /// Recognition failed or heard nothing
    RecognitionFailed(RecognitionError),
    /// Dialogue failed before or during streaming
    DialogueFailed(DialogueError),
    /// Reply streamed fine but none of it could be voiced
    SynthesisFailed,
    /// Transcript matched a desktop command; the dialogue was skipped
    Command(String),
    /// Cancelled by barge-in, interrupt or shutdown
    Cancelled,
}

/// What a session hands back to the controller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOutcome {
    pub end: SessionEnd,
    /// Recorded once the transcript is known and the session was not cancelled
    pub user_turn: Option<ConversationTurn>,
    /// Recorded only for a completed reply
    pub assistant_turn: Option<ConversationTurn>,
}

impl SessionOutcome {
    fn ended(end: SessionEnd) -> Self {
        Self {
            end,
            user_turn: None,
            assistant_turn: None,
        }
    }
}

/// Backend trait objects shared by every session
#[derive(Clone)]
pub struct Backends {
    pub recognition: Arc<dyn RecognitionBackend>,
    pub dialogue: Arc<dyn DialogueBackend>,
    pub synthesis: Arc<dyn SynthesisBackend>,
    pub sink: Arc<dyn AudioSink>,
}

impl fmt::Debug for Backends {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backends").finish_non_exhaustive()
    }
}

/// Stage services configured from one config snapshot
#[derive(Clone)]
pub struct Pipeline {
    pub capture: AudioCaptureService,
    pub recognizer: SpeechRecognizer,
    pub dialogue: DialogueEngine,
    pub synthesizer: SpeechSynthesizer,
    pub sink: Arc<dyn AudioSink>,
    pub segmenter: SegmenterConfig,
    pub personality: Personality,
    /// Command table consulted before the dialogue; `None` when disabled
    pub commands: Option<Arc<CommandRouter>>,
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("capture", &self.capture)
            .field("synthesizer", &self.synthesizer)
            .field("segmenter", &self.segmenter)
            .field("personality", &self.personality)
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    /// Wire the stage services for `config`
    #[must_use]
    pub fn new(config: &Config, backends: &Backends, capture: &AudioCaptureService) -> Self {
        Self {
            capture: capture.with_config(config.capture.clone()),
            recognizer: SpeechRecognizer::new(
                Arc::clone(&backends.recognition),
                config.retry.clone(),
                config.asr.timeout,
            ),
            dialogue: DialogueEngine::new(
                Arc::clone(&backends.dialogue),
                config.retry.clone(),
                DialogueSettings::from(&config.llm),
                config.system_prompt(),
            ),
            synthesizer: SpeechSynthesizer::new(
                Arc::clone(&backends.synthesis),
                config.retry.clone(),
                &config.tts,
            ),
            sink: Arc::clone(&backends.sink),
            segmenter: config.segmenter,
            personality: config.llm.personality,
            commands: config
                .commands
                .enabled
                .then(|| Arc::new(CommandRouter::new(&config.commands))),
        }
    }
}

/// Handle for reporting progress to the controller
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    session: Uuid,
    tx: mpsc::UnboundedSender<SessionProgress>,
}

impl ProgressReporter {
    #[must_use]
    pub const fn new(session: Uuid, tx: mpsc::UnboundedSender<SessionProgress>) -> Self {
        Self { session, tx }
    }

    fn report(&self, state: SessionState) {
        let progress = SessionProgress {
            session: self.session,
            state,
        };
        if self.tx.send(progress).is_err() {
            tracing::debug!(session = %self.session, "controller gone, progress dropped");
        }
    }
}

/// Run one session to completion
///
/// `history` is a snapshot of the conversation before this session.
pub async fn run_session(
    pipeline: Pipeline,
    history: Vec<ConversationTurn>,
    ui: UiHandle,
    progress: ProgressReporter,
    cancel: CancellationToken,
) -> SessionOutcome {
    let session = progress.session;
    ui.display(LISTENING_TEXT, Mood::Listening);

    let utterance = match pipeline.capture.capture(&cancel).await {
        Ok(utterance) => utterance,
        Err(CaptureError::Cancelled) => return SessionOutcome::ended(SessionEnd::Cancelled),
        Err(e) => {
            tracing::info!(%session, error = %e, "capture failed");
            return SessionOutcome::ended(SessionEnd::CaptureFailed(e));
        }
    };

    progress.report(SessionState::Recognizing);
    ui.display(THINKING_TEXT, Mood::Thinking);

    let transcript = match pipeline.recognizer.recognize(&utterance, &cancel).await {
        Ok(text) => text,
        Err(RecognitionError::Cancelled) => return SessionOutcome::ended(SessionEnd::Cancelled),
        Err(e) => {
            tracing::info!(%session, error = %e, "recognition failed");
            ui.display(DIDNT_CATCH_TEXT, Mood::Neutral);
            return SessionOutcome::ended(SessionEnd::RecognitionFailed(e));
        }
    };
    drop(utterance);

    if let Some(hit) = pipeline.commands.as_ref().and_then(|r| r.route(&transcript)) {
        tracing::info!(
            %session,
            command = %hit.command,
            action = %hit.action,
            kind = ?hit.kind,
            "transcript routed to command"
        );
        ui.command(&hit);
        ui.display(format!("On it: {}", hit.command), Mood::Neutral);
        return SessionOutcome::ended(SessionEnd::Command(hit.command));
    }

    let user_turn = ConversationTurn::user(&transcript);
    progress.report(SessionState::Thinking);

    let reply = match pipeline.dialogue.open(&history, &transcript, &cancel).await {
        Ok(reply) => reply,
        Err(DialogueError::Cancelled) => return SessionOutcome::ended(SessionEnd::Cancelled),
        Err(e) => {
            tracing::warn!(%session, error = %e, "dialogue connection failed");
            ui.display(APOLOGY_TEXT, Mood::Apologetic);
            return SessionOutcome {
                end: SessionEnd::DialogueFailed(e),
                user_turn: Some(user_turn),
                assistant_turn: None,
            };
        }
    };

    let spoken = speak_reply(&pipeline, reply, &ui, &progress, &cancel).await;

    if cancel.is_cancelled() {
        return SessionOutcome::ended(SessionEnd::Cancelled);
    }

    match spoken.result {
        Ok(_) if spoken.queued > 0 && spoken.played == 0 => {
            tracing::warn!(%session, queued = spoken.queued, "no segment could be voiced");
            ui.display(APOLOGY_TEXT, Mood::Apologetic);
            speak_apology(&pipeline, &progress, 0, &cancel).await;
            SessionOutcome {
                end: SessionEnd::SynthesisFailed,
                user_turn: Some(user_turn),
                assistant_turn: None,
            }
        }
        Ok(text) => {
            let text = text.trim();
            tracing::info!(%session, chars = text.len(), played = spoken.played, "reply complete");
            SessionOutcome {
                end: SessionEnd::Completed,
                user_turn: Some(user_turn),
                assistant_turn: (!text.is_empty()).then(|| ConversationTurn::assistant(text)),
            }
        }
        Err(e) => {
            tracing::warn!(%session, error = %e, queued = spoken.queued, "reply stream failed");
            ui.display(APOLOGY_TEXT, Mood::Apologetic);
            if spoken.queued > 0 {
                speak_apology(&pipeline, &progress, spoken.played, &cancel).await;
            }
            SessionOutcome {
                end: SessionEnd::DialogueFailed(e),
                user_turn: Some(user_turn),
                assistant_turn: None,
            }
        }
    }
}

struct Spoken {
    /// Full reply text, or the mid-stream error
    result: Result<String, DialogueError>,
    /// Segments handed to synthesis
    queued: u64,
    /// Segments played to completion
    played: u64,
}

/// Stream the reply into the segmenter, synthesis and playback concurrently
async fn speak_reply(
    pipeline: &Pipeline,
    mut reply: StreamingReply,
    ui: &UiHandle,
    progress: &ProgressReporter,
    cancel: &CancellationToken,
) -> Spoken {
    let (segment_tx, segment_rx) = mpsc::channel::<TextSegment>(SEGMENT_QUEUE);
    let (audio_tx, mut audio_rx) = mpsc::channel::<SynthesizedSegment>(1);
    let speakable = pipeline.personality.is_conversational();
    let segmenter_config = pipeline.segmenter;

    let produce = async move {
        let mut segmenter = Segmenter::new(segmenter_config);
        let mut full = String::new();
        let mut structured = if speakable { None } else { Some(true) };

        let result = loop {
            match reply.next().await {
                Some(ReplyEvent::Delta(delta)) => {
                    full.push_str(&delta);
                    ui.display(full.clone(), Mood::Talking);

                    let ready = match structured {
                        Some(true) => Vec::new(),
                        Some(false) => segmenter.push(&delta),
                        None => {
                            structured = classify_reply_start(&full);
                            if structured == Some(false) {
                                segmenter.push(&full)
                            } else {
                                Vec::new()
                            }
                        }
                    };

                    for segment in ready {
                        if segment_tx.send(segment).await.is_err() {
                            break;
                        }
                    }
                }
                Some(ReplyEvent::Finished) | None => {
                    if structured == Some(true) {
                        tracing::debug!("structured reply, not speaking it");
                        if let Some(hit) = parse_command_reply(&full) {
                            ui.command(&hit);
                        }
                        break Ok(full);
                    }

                    // still ambiguous at the end means it was prose
                    let mut ready = if structured.is_none() {
                        segmenter.push(&full)
                    } else {
                        Vec::new()
                    };
                    ready.extend(segmenter.finish());
                    for segment in ready {
                        if segment_tx.send(segment).await.is_err() {
                            break;
                        }
                    }
                    break Ok(full);
                }
                Some(ReplyEvent::Errored(e)) => break Err(e),
            }
        };

        drop(segment_tx);
        (result, segmenter.emitted())
    };

    let synthesize = async move {
        let stream = pipeline.synthesizer.pipeline(segment_rx, cancel.clone());
        futures::pin_mut!(stream);
        while let Some(segment) = stream.next().await {
            if audio_tx.send(segment).await.is_err() {
                break;
            }
        }
        drop(audio_tx);
    };

    let play = async move {
        let mut played = 0u64;
        while let Some(segment) = audio_rx.recv().await {
            if played == 0 {
                progress.report(SessionState::Speaking);
            }
            tracing::debug!(seq = segment.seq, text = %segment.text, "playing segment");
            match pipeline.sink.play(segment.audio, cancel).await {
                Ok(PlaybackOutcome::Finished) => played += 1,
                Ok(PlaybackOutcome::Stopped) => break,
                Err(e) => tracing::warn!(seq = segment.seq, error = %e, "playback failed"),
            }
            if cancel.is_cancelled() {
                break;
            }
        }
        played
    };

    let ((result, queued), (), played) = tokio::join!(produce, synthesize, play);

    Spoken {
        result,
        queued,
        played,
    }
}

/// Speak the apology after already-queued audio has drained
async fn speak_apology(
    pipeline: &Pipeline,
    progress: &ProgressReporter,
    played: u64,
    cancel: &CancellationToken,
) {
    match pipeline.synthesizer.synthesize(APOLOGY_TEXT, cancel).await {
        Ok(audio) => {
            if played == 0 {
                progress.report(SessionState::Speaking);
            }
            if let Err(e) = pipeline.sink.play(audio, cancel).await {
                tracing::warn!(error = %e, "apology playback failed");
            }
        }
        Err(e) => tracing::debug!(error = %e, "apology could not be synthesized, staying silent"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legal_transitions() {
        use SessionState::*;
        assert!(Idle.can_transition_to(Capturing));
        assert!(Capturing.can_transition_to(Recognizing));
        assert!(Recognizing.can_transition_to(Thinking));
        assert!(Thinking.can_transition_to(Speaking));
        assert!(Speaking.can_transition_to(Idle));
        assert!(Thinking.can_transition_to(Cancelling));
        assert!(Cancelling.can_transition_to(Idle));
    }

    #[test]
    fn illegal_transitions() {
        use SessionState::*;
        assert!(!Idle.can_transition_to(Speaking));
        assert!(!Idle.can_transition_to(Cancelling));
        assert!(!Speaking.can_transition_to(Thinking));
        assert!(!Cancelling.can_transition_to(Capturing));
        assert!(!Capturing.can_transition_to(Thinking));
    }

    #[test]
    fn display_names() {
        assert_eq!(SessionState::Thinking.to_string(), "thinking");
        assert_eq!(
            serde_json::to_value(SessionState::Cancelling).unwrap(),
            "cancelling"
        );
    }
}
