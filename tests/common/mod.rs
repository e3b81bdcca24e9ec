//! Shared test utilities

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use companion_voice::config::WakeConfig;
use companion_voice::context::ConversationContext;
use companion_voice::dialogue::{DeltaStream, DialogueBackend, DialogueRequest};
use companion_voice::events::UiEvent;
use companion_voice::session::Backends;
use companion_voice::voice::{
    AudioBuffer, AudioCaptureService, AudioChunk, FRAME_SAMPLES, FrameFanout, RecognitionBackend,
    RecordingSink, SAMPLE_RATE, SynthesisBackend, Utterance, WakeEvent,
};
use companion_voice::{
    Config, ControllerHandle, DialogueError, RecognitionError, RetryPolicy, SessionState,
    SynthesisError, UiHandle, VoiceSessionController,
};

/// Sample rate of the fake synthesizer's output
pub const TTS_RATE: u32 = 24000;

/// Config tuned for fast tests
#[must_use]
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.retry = RetryPolicy {
        max_attempts: 3,
        base_delay: Duration::from_millis(5),
        max_delay: Duration::from_millis(20),
    };
    config.asr.timeout = Duration::from_millis(100);
    config.capture.no_speech_timeout = Duration::from_millis(500);
    config.llm.first_token_timeout = Duration::from_millis(500);
    config.llm.idle_timeout = Duration::from_millis(500);
    config.tts.segment_timeout = Duration::from_millis(500);
    config.cancel_budget = Duration::from_millis(500);
    config
}

/// A 20 ms frame loud enough to count as speech
#[must_use]
pub fn voiced_frame() -> AudioChunk {
    let samples = (0..FRAME_SAMPLES)
        .map(|i| if i % 2 == 0 { 0.3 } else { -0.3 })
        .collect();
    AudioChunk::new(samples, SAMPLE_RATE)
}

/// A 20 ms frame of silence
#[must_use]
pub fn silent_frame() -> AudioChunk {
    AudioChunk::new(vec![0.0; FRAME_SAMPLES], SAMPLE_RATE)
}

/// Publish `voiced` frames of speech followed by a second of silence
pub async fn publish_utterance(fanout: &FrameFanout, voiced: usize) {
    for _ in 0..voiced {
        fanout.publish(voiced_frame());
        tokio::task::yield_now().await;
    }
    for _ in 0..50 {
        fanout.publish(silent_frame());
        tokio::task::yield_now().await;
    }
}

/// Wait until a capture holds the device
pub async fn wait_until_capturing(capture: &AudioCaptureService) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !capture.is_busy() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("capture never started");
}

/// Speech recognition backend answering from a script
///
/// Each call pops the next step; once the script is empty every call
/// returns `fallback`.
pub struct ScriptedAsr {
    steps: Mutex<VecDeque<AsrStep>>,
    fallback: String,
    calls: AtomicUsize,
}

pub enum AsrStep {
    /// Answer after a delay
    Reply(Duration, Result<String, RecognitionError>),
}

impl ScriptedAsr {
    #[must_use]
    pub fn answering(text: &str) -> Arc<Self> {
        Self::scripted(Vec::new(), text)
    }

    #[must_use]
    pub fn scripted(steps: Vec<AsrStep>, fallback: &str) -> Arc<Self> {
        Arc::new(Self {
            steps: Mutex::new(steps.into()),
            fallback: fallback.to_string(),
            calls: AtomicUsize::new(0),
        })
    }

    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RecognitionBackend for ScriptedAsr {
    async fn transcribe(&self, utterance: &Utterance) -> Result<String, RecognitionError> {
        assert!(!utterance.chunks.is_empty(), "empty utterance sent to ASR");
        self.calls.fetch_add(1, Ordering::SeqCst);
        let step = self.steps.lock().unwrap().pop_front();
        match step {
            Some(AsrStep::Reply(delay, result)) => {
                tokio::time::sleep(delay).await;
                result
            }
            None => Ok(self.fallback.clone()),
        }
    }
}

/// Language model backend streaming scripted deltas
pub struct ScriptedLlm {
    replies: Mutex<VecDeque<Vec<Result<String, DialogueError>>>>,
    delta_delay: Duration,
    requests: Mutex<Vec<DialogueRequest>>,
}

impl ScriptedLlm {
    /// Every call streams `deltas` with no delay
    #[must_use]
    pub fn streaming(deltas: &[&str]) -> Arc<Self> {
        Self::with_replies(
            vec![deltas.iter().map(|d| Ok((*d).to_string())).collect()],
            Duration::ZERO,
        )
    }

    /// One scripted reply per call; the last reply repeats
    #[must_use]
    pub fn with_replies(
        replies: Vec<Vec<Result<String, DialogueError>>>,
        delta_delay: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            delta_delay,
            requests: Mutex::new(Vec::new()),
        })
    }

    #[must_use]
    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    #[must_use]
    pub fn requests(&self) -> Vec<DialogueRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl DialogueBackend for ScriptedLlm {
    async fn open(&self, request: &DialogueRequest) -> Result<DeltaStream, DialogueError> {
        self.requests.lock().unwrap().push(request.clone());
        let reply = {
            let mut replies = self.replies.lock().unwrap();
            if replies.len() > 1 {
                replies.pop_front().unwrap_or_default()
            } else {
                replies.front().cloned().unwrap_or_default()
            }
        };
        let delay = self.delta_delay;
        let stream = futures::stream::iter(reply).then(move |delta| async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            delta
        });
        Ok(Box::pin(stream))
    }
}

/// Synthesis backend that encodes the text into the samples
///
/// Each byte becomes one sample so [`decode_text`] can recover what was
/// played. `delay` picks how long each text takes to synthesize and `fail`
/// which texts are rejected outright.
pub struct EncodingTts {
    delay: Box<dyn Fn(&str) -> Duration + Send + Sync>,
    fail: Box<dyn Fn(&str) -> bool + Send + Sync>,
    calls: AtomicUsize,
}

impl EncodingTts {
    #[must_use]
    pub fn instant() -> Arc<Self> {
        Self::with_delay(|_| Duration::ZERO)
    }

    #[must_use]
    pub fn with_delay(delay: impl Fn(&str) -> Duration + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            delay: Box::new(delay),
            fail: Box::new(|_| false),
            calls: AtomicUsize::new(0),
        })
    }

    /// Reject every text matching `fail` with a permanent error
    #[must_use]
    pub fn failing_on(fail: impl Fn(&str) -> bool + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            delay: Box::new(|_| Duration::ZERO),
            fail: Box::new(fail),
            calls: AtomicUsize::new(0),
        })
    }

    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SynthesisBackend for EncodingTts {
    async fn synthesize(&self, text: &str) -> Result<AudioBuffer, SynthesisError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = (self.delay)(text);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if (self.fail)(text) {
            return Err(SynthesisError::UnsupportedVoice(format!("cannot say {text:?}")));
        }
        let samples = text.bytes().map(|b| f32::from(b) / 256.0).collect();
        Ok(AudioBuffer::new(samples, TTS_RATE))
    }
}

/// Recover the text an [`EncodingTts`] buffer was made from
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn decode_text(buffer: &AudioBuffer) -> String {
    let bytes: Vec<u8> = buffer
        .samples
        .iter()
        .map(|s| (s * 256.0).round() as u8)
        .collect();
    String::from_utf8(bytes).expect("buffer was not made by EncodingTts")
}

/// A running controller wired to fake backends
pub struct Harness {
    pub fanout: FrameFanout,
    pub capture: AudioCaptureService,
    pub wake_tx: mpsc::Sender<WakeEvent>,
    pub handle: ControllerHandle,
    pub ui: mpsc::UnboundedReceiver<UiEvent>,
    pub sink: RecordingSink,
    pub pause: watch::Receiver<bool>,
    pub wake_settings: watch::Receiver<WakeConfig>,
    pub shutdown: CancellationToken,
    controller: JoinHandle<ConversationContext>,
}

impl Harness {
    pub fn start(
        config: Config,
        asr: Arc<dyn RecognitionBackend>,
        llm: Arc<dyn DialogueBackend>,
        tts: Arc<dyn SynthesisBackend>,
        sink: RecordingSink,
    ) -> Self {
        let fanout = FrameFanout::new(config.capture.fanout_capacity);
        let capture = AudioCaptureService::new(fanout.source(), config.capture.clone());
        let (wake_tx, wake_rx) = mpsc::channel(8);
        let (ui, ui_rx) = UiHandle::channel();
        let backends = Backends {
            recognition: asr,
            dialogue: llm,
            synthesis: tts,
            sink: Arc::new(sink.clone()),
        };

        let (controller, handle) =
            VoiceSessionController::new(config, backends, capture.clone(), wake_rx, ui);
        let pause = controller.wake_pause();
        let wake_settings = controller.wake_settings();
        let shutdown = CancellationToken::new();
        let controller = tokio::spawn(controller.run(shutdown.clone()));

        Self {
            fanout,
            capture,
            wake_tx,
            handle,
            ui: ui_rx,
            sink,
            pause,
            wake_settings,
            shutdown,
            controller,
        }
    }

    /// Fire a wake event
    pub async fn wake(&self) {
        self.wake_tx
            .send(WakeEvent::now("pip", 0.95))
            .await
            .expect("controller gone");
    }

    /// Wait for the capture, then say something
    pub async fn speak(&self) {
        wait_until_capturing(&self.capture).await;
        publish_utterance(&self.fanout, 10).await;
    }

    /// Wake the companion and say something
    pub async fn converse(&self) {
        self.wake().await;
        self.speak().await;
    }

    /// Collect UI events until the controller reports idle
    pub async fn until_idle(&mut self) -> Vec<UiEvent> {
        let mut seen = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), async {
            while let Some(event) = self.ui.recv().await {
                let idle = matches!(
                    event,
                    UiEvent::StateChanged {
                        state: SessionState::Idle
                    }
                );
                seen.push(event);
                if idle {
                    break;
                }
            }
        })
        .await
        .expect("controller never returned to idle");
        seen
    }

    /// Wait for a particular state
    pub async fn until_state(&mut self, wanted: SessionState) -> Vec<UiEvent> {
        let mut seen = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), async {
            while let Some(event) = self.ui.recv().await {
                let hit = matches!(event, UiEvent::StateChanged { state } if state == wanted);
                seen.push(event);
                if hit {
                    break;
                }
            }
        })
        .await
        .unwrap_or_else(|_| panic!("never reached {wanted}"));
        seen
    }

    /// Stop the controller and return its conversation
    pub async fn stop(self) -> ConversationContext {
        self.shutdown.cancel();
        self.controller.await.expect("controller panicked")
    }
}

/// States in the order they were announced
#[must_use]
pub fn states(events: &[UiEvent]) -> Vec<SessionState> {
    events
        .iter()
        .filter_map(|e| match e {
            UiEvent::StateChanged { state } => Some(*state),
            _ => None,
        })
        .collect()
}

/// Texts displayed, in order
#[must_use]
pub fn displayed(events: &[UiEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| match e {
            UiEvent::Display { text, .. } => Some(text.clone()),
            _ => None,
        })
        .collect()
}

/// Commands announced, as (command, action) pairs
#[must_use]
pub fn commands(events: &[UiEvent]) -> Vec<(String, String)> {
    events
        .iter()
        .filter_map(|e| match e {
            UiEvent::Command {
                command, action, ..
            } => Some((command.clone(), action.clone())),
            _ => None,
        })
        .collect()
}

/// Texts the sink played, in order
#[must_use]
pub fn spoken(sink: &RecordingSink) -> Vec<String> {
    sink.played().iter().map(decode_text).collect()
}
