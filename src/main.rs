use std::path::{Path, PathBuf};

use anyhow::{Context, anyhow};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use learnie_voice::VoiceConfig;
use learnie_voice::core::codec;
use learnie_voice::core::fallback::{TranscriptionClient, TtsClient};

/// Learnie voice client
#[derive(Parser, Debug)]
#[command(name = "learnie-voice")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short = 'c', long = "config", value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Hold a spoken conversation through the microphone and speaker
    Talk,

    /// Speak text through the fallback TTS endpoint
    Say {
        text: String,

        /// Write the MP3 here instead of playing it
        #[arg(short = 'o', long = "output")]
        output: Option<PathBuf>,
    },

    /// Transcribe a WAV file through the fallback endpoint
    Transcribe { file: PathBuf },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if it exists (must be done before config loading)
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    // Must be done before any TLS connections are attempted
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow!("Failed to install default crypto provider"))?;

    let cli = Cli::parse();

    let config = if let Some(config_path) = cli.config {
        info!("Loading configuration from {}", config_path.display());
        VoiceConfig::from_file(&config_path)?
    } else {
        VoiceConfig::from_env()?
    };

    match cli.command {
        Commands::Talk => talk(&config).await,
        Commands::Say { text, output } => say(&config, &text, output.as_deref()).await,
        Commands::Transcribe { file } => transcribe(&config, &file).await,
    }
}

#[cfg(feature = "audio-io")]
async fn talk(config: &VoiceConfig) -> anyhow::Result<()> {
    use std::sync::Arc;

    use learnie_voice::core::capture::{CapturePipeline, CpalSource};
    use learnie_voice::core::playback::{PlaybackQueue, RodioSink};
    use learnie_voice::core::realtime::{ConnectionManager, REALTIME_OUTPUT_SAMPLE_RATE};
    use learnie_voice::{ConversationPhase, SessionController, SessionUpdate};
    use tokio::io::{AsyncBufReadExt, BufReader};

    if !config.has_realtime_credentials() {
        anyhow::bail!("Set OPENAI_API_KEY or LEARNIE_TOKEN_URL to start a conversation");
    }

    let source = match &config.audio.input_device {
        Some(name) => CpalSource::with_device(name.clone()),
        None => CpalSource::new(),
    };
    let capture = Arc::new(CapturePipeline::new(
        Arc::new(source),
        config.capture_settings(),
    ));
    let sink = RodioSink::open().await?;
    let playback = Arc::new(PlaybackQueue::new(
        Arc::new(sink),
        REALTIME_OUTPUT_SAMPLE_RATE,
    ));
    let manager = Arc::new(ConnectionManager::new(
        Arc::new(config.connector()?),
        config.realtime.clone(),
        config.connection_settings(),
    ));
    let controller = SessionController::new(manager, capture, playback, config.session_settings())?;

    let mut updates = controller.subscribe();
    let printer = tokio::spawn(async move {
        while let Ok(update) = updates.recv().await {
            match update {
                SessionUpdate::Phase { prompt, .. } => println!("[{}]", prompt),
                SessionUpdate::Transcript { role, delta } => println!("{}: {}", role, delta),
                SessionUpdate::Error(message) => eprintln!("! {}", message),
                SessionUpdate::Processing(_) | SessionUpdate::History(_) => {}
            }
        }
    });

    println!("Commands: empty line interrupts, /clear wipes history, /quit ends. Anything else is sent as text.");
    controller.start_conversation().await?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                match line.trim() {
                    "" => controller.interrupt().await?,
                    "/quit" => break,
                    "/clear" => controller.clear_history().await?,
                    "/start" => controller.start_conversation().await?,
                    text => {
                        if let Err(e) = controller.send_text(text).await {
                            eprintln!("! {}", e.user_message());
                        }
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
        if controller.phase() == ConversationPhase::Idle {
            info!("Conversation ended; type /start to begin again");
        }
    }

    controller.stop().await?;
    printer.abort();
    Ok(())
}

#[cfg(not(feature = "audio-io"))]
async fn talk(_config: &VoiceConfig) -> anyhow::Result<()> {
    anyhow::bail!("This build has no audio devices; rebuild with --features audio-io")
}

async fn say(config: &VoiceConfig, text: &str, output: Option<&Path>) -> anyhow::Result<()> {
    let client = TtsClient::new(config.tts_settings())?;
    let audio = client.synthesize(text).await?;

    if let Some(path) = output {
        std::fs::write(path, &audio)
            .with_context(|| format!("Failed to write to {}", path.display()))?;
        println!("Speech written to {}", path.display());
        return Ok(());
    }
    play_clip(audio).await
}

#[cfg(feature = "audio-io")]
async fn play_clip(audio: bytes::Bytes) -> anyhow::Result<()> {
    use learnie_voice::core::playback::{AudioSink, RodioSink};

    let sink = RodioSink::open().await?;
    sink.play_clip(audio).await?;
    Ok(())
}

#[cfg(not(feature = "audio-io"))]
async fn play_clip(_audio: bytes::Bytes) -> anyhow::Result<()> {
    anyhow::bail!("This build has no audio devices; pass --output or rebuild with --features audio-io")
}

async fn transcribe(config: &VoiceConfig, file: &Path) -> anyhow::Result<()> {
    let settings = config
        .transcription_settings()
        .ok_or_else(|| anyhow!("Set LEARNIE_TRANSCRIPTION_URL to use transcription"))?;
    let client = TranscriptionClient::new(settings)?;

    let (samples, sample_rate) = read_wav(file)?;
    info!(
        "Read {} samples at {} Hz from {}",
        samples.len(),
        sample_rate,
        file.display()
    );

    let reply = client.transcribe_samples(&samples, sample_rate).await?;
    match reply.transcribed_text {
        Some(text) => println!("{}", text),
        None => println!("{}", reply.message),
    }
    Ok(())
}

/// Read a WAV file as mono f32 samples, averaging channels.
fn read_wav(path: &Path) -> anyhow::Result<(Vec<f32>, u32)> {
    let reader = hound::WavReader::open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    let spec = reader.spec();

    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader.into_samples::<f32>().collect::<Result<_, _>>()?,
        hound::SampleFormat::Int => {
            let scale = (1i64 << (spec.bits_per_sample.saturating_sub(1))) as f32;
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<Result<_, _>>()?
        }
    };

    let mono = codec::downmix_to_mono(&interleaved, spec.channels);
    Ok((mono, spec.sample_rate))
}
