use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use voxvim::audio::{self, MicSource, TARGET_RATE};
use voxvim::command::{CommandProcessor, CommandResult};
use voxvim::config::{Config, TranscriptionConfig, VadKind};
use voxvim::dispatch::Dispatcher;
use voxvim::editor::Nvim;
use voxvim::history::History;
use voxvim::llm::OpenAiCompat;
use voxvim::recorder::{RecordError, Recorder, Utterance};
use voxvim::stats::{Stage, Stats};
use voxvim::transcriber::{Transcriber, WhisperApi};
use voxvim::vad::VadEngine;
use voxvim::wav;

#[derive(Parser)]
#[command(name = "voxvim", about = "Speak Ex commands into a running Neovim")]
struct Cli {
    /// Config file (default: ./config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Neovim socket, overrides [editor].socket
    #[arg(long, global = true)]
    socket: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Listen, transcribe and run commands in Neovim (default)
    Run,
    /// List audio input devices
    Devices,
    /// Record one utterance to a WAV file
    Record {
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Print transcripts without touching the editor
    Transcribe,
}

type MicRecorder = Recorder<MicSource, VadEngine>;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("voxvim=info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref());
    if let Some(socket) = cli.socket {
        config.editor.socket = socket;
    }

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(&config),
        Command::Devices => list_devices(),
        Command::Record { output } => record_once(&config, output.as_deref()),
        Command::Transcribe => run_transcribe_mode(&config),
    }
}

fn list_devices() -> Result<()> {
    for name in audio::list_devices()? {
        println!("{}", name);
    }
    Ok(())
}

fn stop_flag() -> Result<Arc<AtomicBool>> {
    let stop = Arc::new(AtomicBool::new(false));
    let handler = Arc::clone(&stop);
    ctrlc::set_handler(move || handler.store(true, Ordering::SeqCst))
        .context("installing Ctrl-C handler")?;
    Ok(stop)
}

fn build_vad(config: &Config) -> Result<VadEngine> {
    let vad = match config.vad.engine {
        VadKind::WebRtc => VadEngine::webrtc(config.vad.aggressiveness, TARGET_RATE)?,
        VadKind::Silero => match VadEngine::silero(&config.vad.silero_model, TARGET_RATE) {
            Ok(v) => v,
            Err(e) => {
                warn!("Silero VAD failed ({}), using energy-based", e);
                VadEngine::energy()
            }
        },
        VadKind::Energy => VadEngine::energy(),
    };
    info!("VAD: {}", vad.name());
    Ok(vad)
}

fn open_recorder(config: &Config, stop: Arc<AtomicBool>) -> Result<MicRecorder> {
    let mic = MicSource::open(config.audio.device.as_deref()).context("opening microphone")?;
    let vad = build_vad(config)?;
    Ok(Recorder::new(mic, vad, config.audio.recorder()).with_stop_flag(stop))
}

fn build_transcriber(config: &Config) -> Result<Box<dyn Transcriber>> {
    match &config.transcription {
        TranscriptionConfig::OpenAiCompat {
            base_url,
            model,
            api_key,
            ..
        } => {
            info!("Transcription: {} via {}", model, base_url);
            Ok(Box::new(WhisperApi::new(base_url, model, api_key.clone())?))
        }
        #[cfg(feature = "parakeet")]
        TranscriptionConfig::Parakeet { model_path } => Ok(Box::new(
            voxvim::transcriber::parakeet::Parakeet::new(model_path)?,
        )),
        #[cfg(not(feature = "parakeet"))]
        TranscriptionConfig::Parakeet { .. } => {
            anyhow::bail!("Parakeet not enabled. Build with --features parakeet")
        }
    }
}

/// Block for one utterance, starting from a fresh stream
fn listen(recorder: &mut MicRecorder, stats: &mut Stats) -> Result<Utterance, RecordError> {
    let stale = recorder.source().drain();
    if stale > 0 {
        info!(frames = stale, "discarded audio captured between cycles");
    }
    recorder.classifier_mut().reset();
    println!("Waiting for you to start speaking…");
    stats.time(Stage::Record, || recorder.record_until_silence())
}

fn transcribe(
    config: &Config,
    transcriber: &mut dyn Transcriber,
    utterance: &Utterance,
    stats: &mut Stats,
) -> Result<String> {
    wav::save(&config.audio.wav_path, utterance)
        .with_context(|| format!("writing {}", config.audio.wav_path.display()))?;
    let bytes = wav::encode(utterance).context("encoding WAV")?;
    let samples = utterance.samples();
    let text = stats
        .time(Stage::Transcribe, || transcriber.transcribe(&bytes, &samples))
        .context("transcribing")?;
    Ok(text.trim().to_string())
}

fn run(config: &Config) -> Result<()> {
    let stop = stop_flag()?;
    let mut recorder = open_recorder(config, Arc::clone(&stop))?;
    let mut transcriber = build_transcriber(config)?;

    let editor = Nvim::connect(&config.editor.socket)
        .with_context(|| format!("connecting to nvim at {}", config.editor.socket.display()))?;
    let llm = OpenAiCompat::new(
        &config.llm.base_url,
        &config.llm.model,
        config.llm.api_key.clone(),
        config.llm.temperature,
    )?;
    info!("LLM: {} via {}", llm.model(), config.llm.base_url);
    let history = History::load(config.history.path.clone())?;
    let mut dispatcher =
        Dispatcher::new(editor, llm, history)
            .with_max_attempts(config.retry.max_attempts)
            .with_stop_flag(Arc::clone(&stop));
    let commands = CommandProcessor::new(&config.commands);
    let mut stats = Stats::default();

    while !stop.load(Ordering::SeqCst) {
        let utterance = match listen(&mut recorder, &mut stats) {
            Ok(u) => u,
            Err(RecordError::Cancelled { .. }) => break,
            Err(e @ RecordError::TimedOut { .. }) => {
                warn!("{}", e);
                continue;
            }
            Err(e) => return Err(e).context("recording"),
        };

        println!("Processing…");
        let text = match transcribe(config, transcriber.as_mut(), &utterance, &mut stats) {
            Ok(text) => text,
            Err(e) => {
                error!("{:#}", e);
                continue;
            }
        };
        println!("Transcribed: {}", text);

        match commands.process(&text) {
            CommandResult::Skip => continue,
            CommandResult::Shutdown => {
                info!("Quit phrase heard, shutting down");
                break;
            }
            CommandResult::PassThrough(text) => match dispatcher.handle(&text, &mut stats) {
                Ok(done) => info!(attempts = done.attempts, "Executed: {}", done.command),
                Err(e) => error!("{:#}", e),
            },
        }

        thread::sleep(Duration::from_millis(config.pause_ms));
    }

    let dropped = recorder.source().overflows();
    if dropped > 0 {
        info!(frames = dropped, "audio frames dropped while busy");
    }
    println!("\n{}", stats.summary());
    Ok(())
}

fn record_once(config: &Config, output: Option<&Path>) -> Result<()> {
    let stop = stop_flag()?;
    let mut recorder = open_recorder(config, stop)?;
    let utterance = match listen(&mut recorder, &mut Stats::default()) {
        Ok(u) => u,
        Err(RecordError::Cancelled { .. }) => return Ok(()),
        Err(e) => return Err(e).context("recording"),
    };
    let path = output.unwrap_or(config.audio.wav_path.as_path());
    wav::save(path, &utterance).with_context(|| format!("writing {}", path.display()))?;
    println!(
        "Wrote {} ({:.1}s)",
        path.display(),
        utterance.duration().as_secs_f32()
    );
    Ok(())
}

fn run_transcribe_mode(config: &Config) -> Result<()> {
    let stop = stop_flag()?;
    let mut recorder = open_recorder(config, Arc::clone(&stop))?;
    let mut transcriber = build_transcriber(config)?;
    let mut stats = Stats::default();

    eprintln!("Transcribe mode. Press Ctrl+C to stop.\n");
    while !stop.load(Ordering::SeqCst) {
        let utterance = match listen(&mut recorder, &mut stats) {
            Ok(u) => u,
            Err(RecordError::Cancelled { .. }) => break,
            Err(e @ RecordError::TimedOut { .. }) => {
                warn!("{}", e);
                continue;
            }
            Err(e) => return Err(e).context("recording"),
        };
        match transcribe(config, transcriber.as_mut(), &utterance, &mut stats) {
            Ok(text) if !text.is_empty() => println!("{}", text),
            Ok(_) => {}
            Err(e) => error!("{:#}", e),
        }
    }

    println!("\n{}", stats.summary());
    Ok(())
}
