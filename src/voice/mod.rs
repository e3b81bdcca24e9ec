//! Voice processing module
//!
//! Handles the microphone fan-out, wake word detection, utterance capture,
//! speech recognition, speech synthesis and playback.

mod audio;
mod capture;
mod fanout;
mod playback;
mod stt;
mod tts;
mod wake_word;

pub use audio::{
    AudioBuffer, AudioChunk, EndMarker, FRAME_SAMPLES, SAMPLE_RATE, Utterance, rms_energy,
    samples_to_wav,
};
pub use capture::{AudioCaptureService, CaptureLease, Microphone};
pub use fanout::{FrameFanout, FrameReceiver, FrameSource};
pub use playback::{AudioPlayback, AudioSink, PlaybackOutcome, RecordingSink, resample};
pub use stt::{RecognitionBackend, SpeechRecognizer, WhisperBackend};
pub use tts::{
    OpenAiSpeechBackend, SpeechSynthesizer, SynthesisBackend, SynthesizedSegment, decode_mp3,
    is_speakable,
};
pub use wake_word::{
    EnvelopeTemplate, KeywordModel, WakeEvent, WakeWordDetector, cosine_similarity,
    run_wake_listener,
};
