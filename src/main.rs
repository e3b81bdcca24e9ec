use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use companion_voice::events::{Mood, UiEvent, UiHandle};
use companion_voice::session::Backends;
use companion_voice::voice::{
    AudioBuffer, AudioCaptureService, AudioPlayback, AudioSink, FrameFanout, Microphone,
    OpenAiSpeechBackend, SpeechSynthesizer, WakeWordDetector, WhisperBackend, rms_energy,
    run_wake_listener,
};
use companion_voice::{Config, ControllerHandle, OpenAiChatBackend, VoiceSessionController};

/// Wake events buffered between the detector and the controller
const WAKE_QUEUE: usize = 4;

/// Companion - hands-free voice loop for a desktop companion
#[derive(Parser)]
#[command(name = "companion", version, about)]
struct Cli {
    /// Path to the config file (defaults to the platform config dir)
    #[arg(short, long, env = "COMPANION_CONFIG")]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
#[allow(clippy::enum_variant_names)]
enum Command {
    /// Test microphone input
    TestMic {
        /// Duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
    },
    /// Test speaker output
    TestSpeaker,
    /// Test TTS output
    TestTts {
        /// Text to speak
        #[arg(default_value = "Hello! This is a test of the text to speech system.")]
        text: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "info,companion_voice=info",
        1 => "info,companion_voice=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

#[allow(clippy::future_not_send)]
async fn run(cli: Cli) -> anyhow::Result<()> {
    let config_path = cli.config.as_deref();

    if let Some(cmd) = cli.command {
        return match cmd {
            Command::TestMic { duration } => test_mic(duration).await,
            Command::TestSpeaker => test_speaker().await,
            Command::TestTts { text } => test_tts(Config::load(config_path)?, &text).await,
        };
    }

    let config = Config::load(config_path)?;
    tracing::debug!(?config, "loaded configuration");

    let backends = Backends {
        recognition: Arc::new(WhisperBackend::new(&config.asr)?),
        dialogue: Arc::new(OpenAiChatBackend::new(&config.llm)?),
        synthesis: Arc::new(OpenAiSpeechBackend::new(&config.tts)?),
        sink: Arc::new(AudioPlayback::new()?),
    };

    let fanout = FrameFanout::new(config.capture.fanout_capacity);
    let detector = WakeWordDetector::from_config(&config.wake)?;
    let wake_frames = fanout.subscribe();
    let capture = AudioCaptureService::new(fanout.source(), config.capture.clone());

    // cpal streams are not Send; the microphone lives on this task
    let microphone = Microphone::open(fanout)?;

    let (wake_tx, wake_rx) = mpsc::channel(WAKE_QUEUE);
    let (ui, ui_rx) = UiHandle::channel();
    let shutdown = CancellationToken::new();
    let name = config.name.clone();
    let keywords: Vec<String> = config.wake.keywords.iter().map(|k| k.label.clone()).collect();

    let (controller, handle) = VoiceSessionController::new(config, backends, capture, wake_rx, ui);

    let listener = tokio::spawn(run_wake_listener(
        detector,
        wake_frames,
        controller.wake_pause(),
        controller.wake_settings(),
        wake_tx,
        shutdown.clone(),
    ));
    let printer = tokio::spawn(print_ui_events(ui_rx));
    tokio::spawn(watch_signals(
        shutdown.clone(),
        handle,
        cli.config.clone(),
    ));

    tracing::info!(
        device = microphone.device_name(),
        keywords = ?keywords,
        "{name} ready - say the wake word"
    );

    let context = controller.run(shutdown.clone()).await;
    shutdown.cancel();

    if let Err(e) = listener.await {
        tracing::warn!(error = %e, "wake listener task failed");
    }
    drop(microphone);
    printer.abort();

    tracing::info!(turns = context.len(), "goodbye");
    Ok(())
}

/// Render UI events on the terminal
async fn print_ui_events(mut events: mpsc::UnboundedReceiver<UiEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            UiEvent::Display { text, mood } => {
                let face = match mood {
                    Mood::Listening => "(o_o)",
                    Mood::Thinking => "(-_-)",
                    Mood::Talking => "(^o^)",
                    Mood::Apologetic => "(;_;)",
                    Mood::Neutral => "(._.)",
                };
                println!("{face} {text}");
            }
            UiEvent::StateChanged { state } => tracing::debug!(%state, "ui state"),
            UiEvent::Command {
                command,
                action,
                confidence,
                kind,
            } => {
                // executing commands is up to the desktop shell
                println!("[command] {action}: {command} ({confidence:.2}, {kind:?})");
            }
        }
    }
}

/// Ctrl-C shuts down; SIGHUP reloads the config file
async fn watch_signals(shutdown: CancellationToken, handle: ControllerHandle, path: Option<PathBuf>) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut hangup = match signal(SignalKind::hangup()) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(error = %e, "SIGHUP handler unavailable");
                wait_ctrl_c(&shutdown).await;
                return;
            }
        };

        loop {
            tokio::select! {
                result = tokio::signal::ctrl_c() => {
                    if let Err(e) = result {
                        tracing::warn!(error = %e, "ctrl-c handler failed");
                    }
                    tracing::info!("shutting down");
                    shutdown.cancel();
                    return;
                }
                Some(()) = hangup.recv() => match Config::load(path.as_deref()) {
                    Ok(config) => handle.reload(config),
                    Err(e) => tracing::warn!(error = %e, "config reload failed"),
                },
                () = shutdown.cancelled() => return,
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = (handle, path);
        wait_ctrl_c(&shutdown).await;
    }
}

async fn wait_ctrl_c(shutdown: &CancellationToken) {
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                tracing::warn!(error = %e, "ctrl-c handler failed");
            }
            tracing::info!("shutting down");
            shutdown.cancel();
        }
        () = shutdown.cancelled() => {}
    }
}

/// Test microphone input
#[allow(clippy::future_not_send)]
async fn test_mic(duration: u64) -> anyhow::Result<()> {
    println!("Testing microphone for {duration} seconds...");
    println!("Speak into your microphone!\n");

    let fanout = FrameFanout::new(256);
    let mut frames = fanout.subscribe();
    let microphone = Microphone::open(fanout)?;

    println!("Device: {}", microphone.device_name());
    println!("---");

    for i in 0..duration {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
        let mut samples = Vec::new();
        while let Ok(Some(chunk)) = tokio::time::timeout_at(deadline, frames.recv()).await {
            samples.extend_from_slice(&chunk.samples);
        }

        let energy = rms_energy(&samples);
        let peak = samples.iter().map(|s| s.abs()).fold(0.0f32, f32::max);

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let meter_len = (energy * 100.0).min(50.0) as usize;
        let meter: String = "█".repeat(meter_len) + &" ".repeat(50 - meter_len);

        println!(
            "[{:2}s] RMS: {:.4} | Peak: {:.4} | [{}]",
            i + 1,
            energy,
            peak,
            meter
        );
    }

    drop(microphone);

    println!("\n---");
    println!("If you saw movement in the meter, your mic is working!");
    println!("If RMS stayed near 0, check:");
    println!("  1. Is your mic plugged in?");
    println!("  2. Run: pactl info | grep 'Default Source'");
    println!("  3. Run: arecord -l (to list devices)");
    println!("  4. Try: pavucontrol (to check levels)");

    Ok(())
}

/// Test speaker output with a sine wave
async fn test_speaker() -> anyhow::Result<()> {
    println!("Testing speaker output...");
    println!("You should hear a 440Hz tone for 2 seconds\n");

    let playback = AudioPlayback::new()?;

    let sample_rate = 24000_u32;
    let frequency = 440.0_f32;

    #[allow(clippy::cast_precision_loss)]
    let samples: Vec<f32> = (0..sample_rate * 2)
        .map(|i| {
            let t = i as f32 / sample_rate as f32;
            (2.0 * std::f32::consts::PI * frequency * t).sin() * 0.3
        })
        .collect();

    println!("Playing {} samples at {} Hz...", samples.len(), sample_rate);

    playback
        .play(AudioBuffer::new(samples, sample_rate), &CancellationToken::new())
        .await?;

    println!("\n---");
    println!("If you heard the tone, your speakers are working!");
    println!("If you didn't hear anything, check:");
    println!("  1. Run: pactl info | grep 'Default Sink'");
    println!("  2. Run: pactl list sinks short");
    println!("  3. Try: pavucontrol (to check output levels)");

    Ok(())
}

/// Test TTS output
async fn test_tts(config: Config, text: &str) -> anyhow::Result<()> {
    println!("Testing TTS with text: \"{text}\"\n");

    let backend = OpenAiSpeechBackend::new(&config.tts)?;
    let synthesizer = SpeechSynthesizer::new(Arc::new(backend), config.retry.clone(), &config.tts);
    let cancel = CancellationToken::new();

    println!("Synthesizing speech with voice {}...", config.tts.voice);
    let audio = synthesizer.synthesize(text, &cancel).await?;
    println!(
        "Got {} samples at {} Hz",
        audio.samples.len(),
        audio.sample_rate
    );

    println!("Playing audio...");
    AudioPlayback::new()?.play(audio, &cancel).await?;

    println!("\n---");
    println!("If you heard the speech, TTS is working!");

    Ok(())
}
