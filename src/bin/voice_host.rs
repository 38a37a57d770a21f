//! Headless voice host: stdin/stdout JSON bridge over the session coordinator.
//!
//! Reads `CommandEnvelope` messages as newline-delimited JSON from stdin and
//! writes `ResponseEnvelope` and `EventEnvelope` messages to stdout. All
//! tracing output goes to stderr so stdout remains a clean JSON channel.

use clap::{Parser, Subcommand};
use plate_voice::audio::capture::CpalMicrophone;
use plate_voice::audio::playback::CpalOutput;
use plate_voice::host::stdio::run_stdio_bridge;
use plate_voice::realtime::websocket::WebSocketProvider;
use plate_voice::session::{Capabilities, VoiceCoordinator};
use plate_voice::token::HttpTokenService;
use plate_voice::VoiceConfig;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Real-time voice session host.
#[derive(Parser)]
#[command(name = "plate-voice-host", version, about)]
struct Cli {
    /// Path to TOML configuration file.
    #[arg(short, long, env = "PLATE_VOICE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the JSON bridge (default).
    Serve,

    /// List available audio devices.
    Devices,

    /// Write the effective configuration to the config path.
    InitConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(VoiceConfig::default_config_path);
    let config = VoiceConfig::load_or_default(&config_path)?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config).await,
        Command::Devices => list_devices(),
        Command::InitConfig => {
            config.save_to_file(&config_path)?;
            eprintln!("wrote {}", config_path.display());
            Ok(())
        }
    }
}

async fn serve(config: VoiceConfig) -> anyhow::Result<()> {
    info!(
        backend = %config.backend.effective_url(),
        "plate-voice-host starting"
    );

    let caps = Capabilities {
        microphone: Arc::new(CpalMicrophone::new(&config.audio)),
        tokens: Arc::new(HttpTokenService::from_config(&config.backend)?),
        provider: Arc::new(WebSocketProvider::new(&config.realtime)),
        output: Arc::new(CpalOutput::new(&config.audio)),
    };
    let coordinator = VoiceCoordinator::new(config.session.clone(), caps);

    // Ctrl+C stands in for the page unloading.
    let unload = coordinator.unload_signal();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received Ctrl+C, ending voice session");
            unload.cancel();
        }
    });

    run_stdio_bridge(coordinator).await.map_err(|e| {
        tracing::error!(error = %e, "plate-voice-host exited with error");
        anyhow::anyhow!("plate-voice-host failed: {e}")
    })?;

    info!("plate-voice-host shut down cleanly");
    Ok(())
}

fn list_devices() -> anyhow::Result<()> {
    println!("Input devices:");
    for name in CpalMicrophone::list_input_devices()? {
        println!("  - {name}");
    }

    println!("\nOutput devices:");
    for name in CpalOutput::list_output_devices()? {
        println!("  - {name}");
    }

    Ok(())
}
