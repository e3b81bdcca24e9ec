//! Session controller
//!
//! Owns the session state and the conversation context. Every state change
//! happens inside [`VoiceSessionController::run`], driven by wake events,
//! control commands, progress from the session task, and the session task
//! finishing. At most one session exists at a time.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::config::{Config, WakeConfig};
use crate::context::{ContextLimits, ConversationContext};
use crate::events::UiHandle;
use crate::session::{
    Backends, Pipeline, ProgressReporter, SessionEnd, SessionOutcome, SessionProgress,
    SessionState, VoiceSession, run_session,
};
use crate::voice::{AudioCaptureService, WakeEvent};

/// Commands accepted while running
#[derive(Debug)]
pub enum ControlCommand {
    /// Cancel the active session, if any
    Interrupt,
    /// Replace the configuration; applies from the next session, except
    /// wake settings which reach the listener immediately
    Reload(Box<Config>),
}

/// Cloneable handle for talking to a running controller
#[derive(Debug, Clone)]
pub struct ControllerHandle {
    commands: mpsc::UnboundedSender<ControlCommand>,
    state: watch::Receiver<SessionState>,
}

impl ControllerHandle {
    /// Cancel the active session
    pub fn interrupt(&self) {
        self.send(ControlCommand::Interrupt);
    }

    /// Swap in a new configuration
    pub fn reload(&self, config: Config) {
        self.send(ControlCommand::Reload(Box::new(config)));
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Receiver that observes every state change
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    fn send(&self, command: ControlCommand) {
        if self.commands.send(command).is_err() {
            tracing::debug!("controller stopped, command dropped");
        }
    }
}

struct ActiveSession {
    session: VoiceSession,
    /// Snapshot the session was opened with
    config: Arc<Config>,
    handle: JoinHandle<SessionOutcome>,
    /// Set once cancellation starts, cleared once the task is aborted
    abort_at: Option<tokio::time::Instant>,
}

/// Drives voice sessions from wake events
pub struct VoiceSessionController {
    config: Arc<Config>,
    backends: Backends,
    capture: AudioCaptureService,
    ui: UiHandle,
    context: ConversationContext,
    state_tx: watch::Sender<SessionState>,
    pause_tx: watch::Sender<bool>,
    wake_tx: watch::Sender<WakeConfig>,
    commands: mpsc::UnboundedReceiver<ControlCommand>,
    wake_events: mpsc::Receiver<WakeEvent>,
    progress_tx: mpsc::UnboundedSender<SessionProgress>,
    progress_rx: mpsc::UnboundedReceiver<SessionProgress>,
    /// When the last session returned to idle; older wake events are stale
    last_session_end: Option<Instant>,
    /// Wake event held over a barge-in cancellation
    pending_wake: Option<WakeEvent>,
}

impl std::fmt::Debug for VoiceSessionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VoiceSessionController")
            .field("state", &*self.state_tx.borrow())
            .field("turns", &self.context.len())
            .finish_non_exhaustive()
    }
}

impl VoiceSessionController {
    #[must_use]
    pub fn new(
        config: Config,
        backends: Backends,
        capture: AudioCaptureService,
        wake_events: mpsc::Receiver<WakeEvent>,
        ui: UiHandle,
    ) -> (Self, ControllerHandle) {
        let (state_tx, state_rx) = watch::channel(SessionState::Idle);
        let (pause_tx, _) = watch::channel(false);
        let (wake_tx, _) = watch::channel(config.wake.clone());
        let (command_tx, commands) = mpsc::unbounded_channel();
        let (progress_tx, progress_rx) = mpsc::unbounded_channel();

        let controller = Self {
            config: Arc::new(config),
            backends,
            capture,
            ui,
            context: ConversationContext::new(ContextLimits::default()),
            state_tx,
            pause_tx,
            wake_tx,
            commands,
            wake_events,
            progress_tx,
            progress_rx,
            last_session_end: None,
            pending_wake: None,
        };
        let handle = ControllerHandle {
            commands: command_tx,
            state: state_rx,
        };
        (controller, handle)
    }

    /// Receiver telling the wake listener to pause while the companion speaks
    #[must_use]
    pub fn wake_pause(&self) -> watch::Receiver<bool> {
        self.pause_tx.subscribe()
    }

    /// Receiver carrying wake settings; updated when a reload changes them
    #[must_use]
    pub fn wake_settings(&self) -> watch::Receiver<WakeConfig> {
        self.wake_tx.subscribe()
    }

    /// Run until `shutdown` fires or the wake event stream closes
    ///
    /// Returns the conversation context for the caller to keep or inspect.
    pub async fn run(mut self, shutdown: CancellationToken) -> ConversationContext {
        let mut active: Option<ActiveSession> = None;
        let mut wake_open = true;

        tracing::info!(
            name = %self.config.name,
            barge_in = self.config.wake.barge_in,
            "session controller started"
        );

        loop {
            let abort_at = active.as_ref().and_then(|a| a.abort_at);

            tokio::select! {
                biased;

                () = shutdown.cancelled() => break,

                Some(command) = self.commands.recv() => {
                    self.handle_command(command, &mut active);
                }

                Some(progress) = self.progress_rx.recv() => {
                    self.apply_progress(progress, &mut active);
                }

                () = sleep_until_abort(abort_at) => {
                    if let Some(a) = active.as_mut() {
                        tracing::warn!(
                            session = %a.session.id,
                            budget = ?a.config.cancel_budget,
                            "session ignored cancellation, aborting"
                        );
                        a.handle.abort();
                        a.abort_at = None;
                    }
                }

                joined = join_active(&mut active) => {
                    self.finish_session(joined, &mut active);
                }

                event = self.wake_events.recv(), if wake_open => match event {
                    Some(event) => self.on_wake(event, &mut active),
                    None => {
                        tracing::info!("wake event stream closed");
                        wake_open = false;
                        if active.is_none() {
                            break;
                        }
                    }
                },
            }

            if !wake_open && active.is_none() {
                break;
            }
        }

        if let Some(mut a) = active.take() {
            self.begin_cancel(&mut a);
            let budget = a.config.cancel_budget;
            match tokio::time::timeout(budget, &mut a.handle).await {
                Ok(joined) => self.record(joined),
                Err(_) => {
                    tracing::warn!(session = %a.session.id, "session did not stop in time, aborting");
                    a.handle.abort();
                }
            }
            self.enter_idle();
        }

        tracing::info!(turns = self.context.len(), "session controller stopped");
        self.context
    }

    fn state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    fn set_state(&self, state: SessionState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            tracing::debug!(from = %previous, to = %state, "session state");
            self.ui.state_changed(state);
        }
    }

    fn handle_command(&mut self, command: ControlCommand, active: &mut Option<ActiveSession>) {
        match command {
            ControlCommand::Interrupt => match active {
                Some(a) => {
                    tracing::info!(session = %a.session.id, "interrupt requested");
                    self.pending_wake = None;
                    self.begin_cancel(a);
                }
                None => tracing::debug!("interrupt with no active session"),
            },
            ControlCommand::Reload(config) => {
                if let Err(e) = config.validate() {
                    tracing::warn!(error = %e, "rejected config reload");
                    return;
                }
                tracing::info!("configuration reloaded");
                let changed = self.wake_tx.send_if_modified(|wake| {
                    if *wake == config.wake {
                        return false;
                    }
                    *wake = config.wake.clone();
                    true
                });
                if changed {
                    tracing::info!("wake settings changed, listener will rebuild its detector");
                }
                self.config = Arc::new(*config);
            }
        }
    }

    fn on_wake(&mut self, event: WakeEvent, active: &mut Option<ActiveSession>) {
        if self
            .last_session_end
            .is_some_and(|ended| event.timestamp <= ended)
        {
            tracing::debug!(keyword = %event.keyword, "stale wake event dropped");
            return;
        }

        let Some(a) = active.as_mut() else {
            self.open_session(event, active);
            return;
        };

        if a.config.wake.barge_in && a.session.state == SessionState::Speaking {
            tracing::info!(
                session = %a.session.id,
                keyword = %event.keyword,
                "barge-in, cancelling playback"
            );
            self.begin_cancel(a);
            self.pending_wake = Some(event);
        } else {
            tracing::debug!(
                session = %a.session.id,
                state = %a.session.state,
                keyword = %event.keyword,
                "session active, wake event ignored"
            );
        }
    }

    fn open_session(&mut self, event: WakeEvent, active: &mut Option<ActiveSession>) {
        let session = VoiceSession::open(event);
        tracing::info!(
            session = %session.id,
            keyword = %session.wake.keyword,
            confidence = session.wake.confidence,
            "session opened"
        );

        let config = Arc::clone(&self.config);
        let pipeline = Pipeline::new(&config, &self.backends, &self.capture);
        let history = self
            .context
            .window(config.llm.history_turns, config.llm.history_tokens);
        let reporter = ProgressReporter::new(session.id, self.progress_tx.clone());
        let handle = tokio::spawn(run_session(
            pipeline,
            history,
            self.ui.clone(),
            reporter,
            session.cancel.clone(),
        ));

        self.set_state(SessionState::Capturing);
        *active = Some(ActiveSession {
            session,
            config,
            handle,
            abort_at: None,
        });
    }

    fn apply_progress(&mut self, progress: SessionProgress, active: &mut Option<ActiveSession>) {
        let Some(a) = active.as_mut() else {
            return;
        };
        if a.session.id != progress.session || a.session.cancel.is_cancelled() {
            return;
        }

        let next = progress.state;
        if !a.session.state.can_transition_to(next) {
            tracing::warn!(from = %a.session.state, to = %next, "illegal transition ignored");
            return;
        }

        a.session.state = next;
        self.set_state(next);

        if next == SessionState::Speaking && !a.config.wake.barge_in {
            self.pause_tx.send_replace(true);
        }
    }

    fn begin_cancel(&self, active: &mut ActiveSession) {
        if active.session.cancel.is_cancelled() {
            return;
        }
        active.session.cancel.cancel();
        active.session.state = SessionState::Cancelling;
        active.abort_at = Some(tokio::time::Instant::now() + active.config.cancel_budget);
        self.set_state(SessionState::Cancelling);
    }

    fn finish_session(
        &mut self,
        joined: Result<SessionOutcome, JoinError>,
        active: &mut Option<ActiveSession>,
    ) {
        if let Some(a) = active.take() {
            tracing::info!(
                session = %a.session.id,
                elapsed = ?a.session.started_at.elapsed(),
                "session closed"
            );
        }
        self.record(joined);
        self.enter_idle();

        if let Some(event) = self.pending_wake.take() {
            self.open_session(event, active);
        }
    }

    /// Append the session's turns to the context
    fn record(&mut self, joined: Result<SessionOutcome, JoinError>) {
        let outcome = match joined {
            Ok(outcome) => outcome,
            Err(e) if e.is_cancelled() => {
                tracing::debug!("session task aborted");
                return;
            }
            Err(e) => {
                tracing::error!(error = %e, "session task panicked");
                return;
            }
        };

        match &outcome.end {
            SessionEnd::Completed => tracing::debug!("session completed"),
            SessionEnd::Cancelled => tracing::debug!("session cancelled"),
            SessionEnd::CaptureFailed(e) => tracing::debug!(error = %e, "session ended at capture"),
            SessionEnd::RecognitionFailed(e) => {
                tracing::debug!(error = %e, "session ended at recognition");
            }
            SessionEnd::DialogueFailed(e) => tracing::debug!(error = %e, "session ended at dialogue"),
            SessionEnd::SynthesisFailed => tracing::debug!("session ended at synthesis"),
            SessionEnd::Command(name) => tracing::debug!(command = %name, "session ended as command"),
        }

        if let Some(turn) = outcome.user_turn {
            self.context.push(turn);
        }
        if let Some(turn) = outcome.assistant_turn {
            self.context.push(turn);
        }
    }

    fn enter_idle(&mut self) {
        self.last_session_end = Some(Instant::now());
        self.pause_tx.send_replace(false);
        if !self.state().is_idle() {
            self.set_state(SessionState::Idle);
        }
    }
}

async fn join_active(active: &mut Option<ActiveSession>) -> Result<SessionOutcome, JoinError> {
    match active {
        Some(a) => (&mut a.handle).await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_abort(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
