//! Voice pipeline integration tests
//!
//! Tests voice components without requiring audio hardware

use std::io::Cursor;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio_test::{assert_err, assert_ok};
use tokio_util::sync::CancellationToken;

use companion_voice::CaptureError;
use companion_voice::config::{
    CaptureConfig, DEFAULT_WAKE_ENVELOPE, KeywordSource, KeywordSpec, WakeConfig,
};
use companion_voice::voice::{
    AudioCaptureService, AudioChunk, EndMarker, FRAME_SAMPLES, FrameFanout, SAMPLE_RATE,
    WakeWordDetector, run_wake_listener, samples_to_wav,
};

mod common;

use common::{publish_utterance, silent_frame, test_config, voiced_frame, wait_until_capturing};

/// A frame whose RMS energy is exactly `level`
fn frame_at(level: f32) -> AudioChunk {
    let samples = (0..FRAME_SAMPLES)
        .map(|i| if i % 2 == 0 { level } else { -level })
        .collect();
    AudioChunk::new(samples, SAMPLE_RATE)
}

/// Frames tracing the default wake envelope, padded with silence
fn wake_phrase() -> Vec<AudioChunk> {
    let mut frames: Vec<AudioChunk> = (0..20).map(|_| silent_frame()).collect();
    frames.extend(DEFAULT_WAKE_ENVELOPE.iter().map(|e| frame_at(e * 0.3)));
    frames.extend((0..20).map(|_| silent_frame()));
    frames
}

fn wake_config() -> WakeConfig {
    WakeConfig {
        keywords: vec![KeywordSpec {
            label: "hi-pet".to_string(),
            source: KeywordSource::Envelope(DEFAULT_WAKE_ENVELOPE.to_vec()),
        }],
        threshold: 0.6,
        min_consecutive_frames: 3,
        cooldown: Duration::from_secs(2),
        barge_in: false,
    }
}

#[test]
fn test_wake_phrase_fires_once() {
    let mut detector = WakeWordDetector::from_config(&wake_config()).unwrap();

    let events: Vec<_> = wake_phrase()
        .iter()
        .filter_map(|frame| detector.process(frame))
        .collect();

    assert_eq!(events.len(), 1);
    assert_eq!(events[0].keyword, "hi-pet");
    assert!(events[0].confidence >= 0.6);
    assert!(detector.in_cooldown());
}

#[test]
fn test_steady_hum_never_fires() {
    let mut detector = WakeWordDetector::from_config(&wake_config()).unwrap();

    let fired = (0..200)
        .map(|_| frame_at(0.2))
        .filter_map(|frame| detector.process(&frame))
        .count();

    assert_eq!(fired, 0);
}

#[test]
fn test_repeated_phrase_inside_cooldown_is_suppressed() {
    let mut detector = WakeWordDetector::from_config(&wake_config()).unwrap();

    // two phrases back to back: ~1.1 s apart, inside the 2 s cool-down
    let mut frames = wake_phrase();
    frames.extend(wake_phrase());
    let fired = frames
        .iter()
        .filter_map(|frame| detector.process(frame))
        .count();

    assert_eq!(fired, 1);
}

#[tokio::test]
async fn test_wake_listener_delivers_events() {
    let fanout = FrameFanout::new(256);
    let detector = WakeWordDetector::from_config(&wake_config()).unwrap();
    let (_pause_tx, pause_rx) = watch::channel(false);
    let (_settings_tx, settings_rx) = watch::channel(wake_config());
    let (events_tx, mut events_rx) = mpsc::channel(4);
    let shutdown = CancellationToken::new();

    let listener = tokio::spawn(run_wake_listener(
        detector,
        fanout.subscribe(),
        pause_rx,
        settings_rx,
        events_tx,
        shutdown.clone(),
    ));

    for frame in wake_phrase() {
        fanout.publish(frame);
        tokio::task::yield_now().await;
    }

    let event = tokio::time::timeout(Duration::from_secs(1), events_rx.recv())
        .await
        .expect("no wake event")
        .unwrap();
    assert_eq!(event.keyword, "hi-pet");

    shutdown.cancel();
    listener.await.unwrap();
}

#[tokio::test]
async fn test_paused_listener_stays_quiet() {
    let fanout = FrameFanout::new(256);
    let detector = WakeWordDetector::from_config(&wake_config()).unwrap();
    let (pause_tx, pause_rx) = watch::channel(true);
    let (_settings_tx, settings_rx) = watch::channel(wake_config());
    let (events_tx, mut events_rx) = mpsc::channel(4);
    let shutdown = CancellationToken::new();

    let listener = tokio::spawn(run_wake_listener(
        detector,
        fanout.subscribe(),
        pause_rx,
        settings_rx,
        events_tx,
        shutdown.clone(),
    ));

    for frame in wake_phrase() {
        fanout.publish(frame);
        tokio::task::yield_now().await;
    }
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(events_rx.try_recv().is_err());

    // resuming does not replay what was heard while paused
    pause_tx.send(false).unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(events_rx.try_recv().is_err());

    shutdown.cancel();
    listener.await.unwrap();
}

#[tokio::test]
async fn test_listener_picks_up_new_wake_settings() {
    let fanout = FrameFanout::new(256);
    let deaf = WakeConfig {
        min_consecutive_frames: 50,
        ..wake_config()
    };
    let detector = WakeWordDetector::from_config(&deaf).unwrap();
    let (_pause_tx, pause_rx) = watch::channel(false);
    let (settings_tx, settings_rx) = watch::channel(deaf);
    let (events_tx, mut events_rx) = mpsc::channel(4);
    let shutdown = CancellationToken::new();

    let listener = tokio::spawn(run_wake_listener(
        detector,
        fanout.subscribe(),
        pause_rx,
        settings_rx,
        events_tx,
        shutdown.clone(),
    ));

    for frame in wake_phrase() {
        fanout.publish(frame);
        tokio::task::yield_now().await;
    }
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(events_rx.try_recv().is_err());

    let mut renamed = wake_config();
    renamed.keywords[0].label = "hey-pip".to_string();
    settings_tx.send(renamed).unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    for frame in wake_phrase() {
        fanout.publish(frame);
        tokio::task::yield_now().await;
    }
    let event = tokio::time::timeout(Duration::from_secs(1), events_rx.recv())
        .await
        .expect("rebuilt detector never fired")
        .unwrap();
    assert_eq!(event.keyword, "hey-pip");

    shutdown.cancel();
    listener.await.unwrap();
}

#[tokio::test]
async fn test_listener_keeps_detector_when_new_settings_are_broken() {
    let fanout = FrameFanout::new(256);
    let detector = WakeWordDetector::from_config(&wake_config()).unwrap();
    let (_pause_tx, pause_rx) = watch::channel(false);
    let (settings_tx, settings_rx) = watch::channel(wake_config());
    let (events_tx, mut events_rx) = mpsc::channel(4);
    let shutdown = CancellationToken::new();

    let listener = tokio::spawn(run_wake_listener(
        detector,
        fanout.subscribe(),
        pause_rx,
        settings_rx,
        events_tx,
        shutdown.clone(),
    ));

    let broken = WakeConfig {
        keywords: vec![KeywordSpec {
            label: "flat".to_string(),
            source: KeywordSource::Envelope(vec![0.5; 8]),
        }],
        ..wake_config()
    };
    settings_tx.send(broken).unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    for frame in wake_phrase() {
        fanout.publish(frame);
        tokio::task::yield_now().await;
    }
    let event = tokio::time::timeout(Duration::from_secs(1), events_rx.recv())
        .await
        .expect("old detector stopped firing")
        .unwrap();
    assert_eq!(event.keyword, "hi-pet");

    shutdown.cancel();
    listener.await.unwrap();
}

#[tokio::test]
async fn test_listener_stops_when_microphone_goes_away() {
    let fanout = FrameFanout::new(16);
    let detector = WakeWordDetector::from_config(&wake_config()).unwrap();
    let (_pause_tx, pause_rx) = watch::channel(false);
    let (_settings_tx, settings_rx) = watch::channel(wake_config());
    let (events_tx, _events_rx) = mpsc::channel(4);

    let listener = tokio::spawn(run_wake_listener(
        detector,
        fanout.subscribe(),
        pause_rx,
        settings_rx,
        events_tx,
        CancellationToken::new(),
    ));

    drop(fanout);
    tokio::time::timeout(Duration::from_secs(1), listener)
        .await
        .expect("listener kept running")
        .unwrap();
}

fn capture_service(fanout: &FrameFanout) -> AudioCaptureService {
    AudioCaptureService::new(fanout.source(), test_config().capture)
}

#[tokio::test]
async fn test_capture_ends_on_trailing_silence() {
    let fanout = FrameFanout::new(128);
    let capture = capture_service(&fanout);
    let cancel = CancellationToken::new();

    let task = {
        let capture = capture.clone();
        tokio::spawn(async move { capture.capture(&cancel).await })
    };

    wait_until_capturing(&capture).await;
    publish_utterance(&fanout, 25).await;

    let utterance = assert_ok!(task.await.unwrap());
    assert_eq!(utterance.end, EndMarker::Silence);

    // 25 voiced frames plus exactly 800 ms (40 frames) of trailing silence
    assert_eq!(utterance.chunks.len(), 65);
    assert_eq!(utterance.duration(), Duration::from_millis(1300));
    assert!(!capture.is_busy());
}

#[tokio::test]
async fn test_capture_keeps_pre_roll() {
    let fanout = FrameFanout::new(128);
    let capture = capture_service(&fanout);
    let cancel = CancellationToken::new();

    let task = {
        let capture = capture.clone();
        tokio::spawn(async move { capture.capture(&cancel).await })
    };

    wait_until_capturing(&capture).await;
    for _ in 0..3 {
        fanout.publish(silent_frame());
        tokio::task::yield_now().await;
    }
    publish_utterance(&fanout, 5).await;

    let utterance = assert_ok!(task.await.unwrap());
    // the quiet frames just before the onset are kept
    assert_eq!(utterance.chunks.len(), 3 + 5 + 40);
    assert!(utterance.chunks[0].energy() < f32::EPSILON);
}

#[tokio::test]
async fn test_capture_stops_at_max_duration() {
    let fanout = FrameFanout::new(128);
    let mut config = test_config().capture;
    config.max_utterance = Duration::from_millis(400);
    let capture = AudioCaptureService::new(fanout.source(), config);
    let cancel = CancellationToken::new();

    let task = {
        let capture = capture.clone();
        tokio::spawn(async move { capture.capture(&cancel).await })
    };

    wait_until_capturing(&capture).await;
    for _ in 0..40 {
        fanout.publish(voiced_frame());
        tokio::task::yield_now().await;
    }

    let utterance = assert_ok!(task.await.unwrap());
    assert_eq!(utterance.end, EndMarker::MaxDuration);
    assert_eq!(utterance.duration(), Duration::from_millis(400));
}

#[tokio::test]
async fn test_max_duration_counts_from_voice_onset() {
    let fanout = FrameFanout::new(128);
    let mut config = test_config().capture;
    config.max_utterance = Duration::from_millis(400);
    let capture = AudioCaptureService::new(fanout.source(), config);
    let cancel = CancellationToken::new();

    let task = {
        let capture = capture.clone();
        tokio::spawn(async move { capture.capture(&cancel).await })
    };

    wait_until_capturing(&capture).await;
    // 600 ms of quiet before the user starts talking
    for _ in 0..30 {
        fanout.publish(silent_frame());
        tokio::task::yield_now().await;
    }
    for _ in 0..40 {
        fanout.publish(voiced_frame());
        tokio::task::yield_now().await;
    }

    let utterance = assert_ok!(task.await.unwrap());
    assert_eq!(utterance.end, EndMarker::MaxDuration);
    // 10 pre-roll frames plus 400 ms (20 frames) of speech
    assert_eq!(utterance.chunks.len(), 10 + 20);
    assert!(utterance.chunks[10].energy() > 0.1);
}

#[tokio::test]
async fn test_capture_times_out_without_speech() {
    let fanout = FrameFanout::new(128);
    let capture = capture_service(&fanout);

    let result = capture.capture(&CancellationToken::new()).await;

    assert!(matches!(assert_err!(result), CaptureError::NoSpeechTimeout(_)));
    assert!(!capture.is_busy());
}

#[tokio::test]
async fn test_capture_is_exclusive() {
    let fanout = FrameFanout::new(128);
    let capture = capture_service(&fanout);
    let cancel = CancellationToken::new();

    let first = {
        let capture = capture.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { capture.capture(&cancel).await })
    };
    wait_until_capturing(&capture).await;

    let second = capture.capture(&cancel).await;
    assert!(matches!(assert_err!(second), CaptureError::DeviceUnavailable(_)));

    cancel.cancel();
    assert_eq!(first.await.unwrap(), Err(CaptureError::Cancelled));

    // the lease is released on cancellation
    assert!(!capture.is_busy());
}

#[tokio::test]
async fn test_capture_reports_closed_stream() {
    let fanout = FrameFanout::new(16);
    let config = CaptureConfig {
        no_speech_timeout: Duration::from_secs(5),
        ..test_config().capture
    };
    let capture = AudioCaptureService::new(fanout.source(), config);
    drop(fanout);

    let result = capture.capture(&CancellationToken::new()).await;
    assert!(matches!(assert_err!(result), CaptureError::DeviceUnavailable(_)));
}

#[test]
fn test_wav_header_and_length() {
    let samples: Vec<f32> = (0..SAMPLE_RATE)
        .map(|i| {
            #[allow(clippy::cast_precision_loss)]
            let t = i as f32 / SAMPLE_RATE as f32;
            0.5 * (2.0 * std::f32::consts::PI * 440.0 * t).sin()
        })
        .collect();

    let wav = samples_to_wav(&samples, SAMPLE_RATE).unwrap();
    assert_eq!(&wav[0..4], b"RIFF");
    assert_eq!(&wav[8..12], b"WAVE");

    let reader = hound::WavReader::new(Cursor::new(wav)).unwrap();
    let spec = reader.spec();
    assert_eq!(spec.channels, 1);
    assert_eq!(spec.sample_rate, SAMPLE_RATE);
    assert_eq!(spec.bits_per_sample, 16);
    assert_eq!(reader.len(), SAMPLE_RATE);
}
