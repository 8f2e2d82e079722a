//! Taptype - Push-to-talk dictation for the Linux desktop
//!
//! Run with `taptype` or `taptype daemon` to start the daemon.
//! Use `taptype transcribe <file>` to transcribe an audio file.
//! Use `taptype history` to list saved dictations.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use taptype::config::{self, Config};
use taptype::hotkey::keymap;
use taptype::{engine, history::HistoryStore};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "taptype")]
#[command(author, version, about = "Push-to-talk dictation for the Linux desktop")]
#[command(long_about = "
Taptype is a push-to-talk dictation tool for Wayland Linux systems.
Hold a hotkey to record; speech is transcribed in short chunks while
you talk, and the joined text is pasted at the cursor on release.

SETUP:
  1. Add yourself to the input group: sudo usermod -aG input $USER
  2. Log out and back in
  3. Start ydotool daemon: systemctl --user enable --now ydotool
  4. Install a backend: whisper-cli (whisper.cpp) or sherpa-onnx-offline
  5. Run: taptype (to start the daemon)
")]
struct Cli {
    /// Path to config file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Increase verbosity (-v = debug, -vv = trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (errors only)
    #[arg(short, long)]
    quiet: bool,

    /// Override hotkey (e.g., F1, ScrollLock, Pause)
    #[arg(long, value_name = "KEY")]
    hotkey: Option<String>,

    /// Use toggle mode (press to start/stop) instead of push-to-talk
    #[arg(long)]
    toggle: bool,

    /// Override transcription backend (whisper or parakeet)
    #[arg(long, value_name = "BACKEND")]
    engine: Option<String>,

    /// Override whisper model (tiny, base, small, medium, large-v3)
    #[arg(long, value_name = "MODEL")]
    model: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run as daemon (default if no command specified)
    Daemon,

    /// Transcribe an audio file with the configured backend
    Transcribe {
        /// Path to audio file (WAV preferred; others converted via ffmpeg)
        file: PathBuf,
    },

    /// Show current configuration and supported hotkeys
    Config,

    /// List saved dictations (requires save_history = true)
    History {
        /// Number of entries to show
        #[arg(long, default_value = "10")]
        limit: u32,
    },

    /// Show daemon state (for Waybar/polybar integration)
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.quiet {
        "error"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(format!("taptype={},warn", log_level))),
        )
        .with_target(false)
        .init();

    let mut config = config::load_config(cli.config.as_deref())?;

    // Apply CLI overrides
    if let Some(hotkey) = cli.hotkey {
        config.hotkey.key = hotkey;
    }
    if cli.toggle {
        config.hotkey.mode = config::ActivationMode::Toggle;
    }
    if let Some(backend) = cli.engine {
        config.engine.backend = match backend.to_lowercase().as_str() {
            "parakeet" => config::EngineKind::Parakeet,
            "whisper" => config::EngineKind::Whisper,
            other => anyhow::bail!("unknown engine '{}', expected whisper or parakeet", other),
        };
    }
    if let Some(model) = cli.model {
        config.engine.whisper.model = model;
    }

    let config_path = cli.config.clone().or_else(Config::default_path);

    match cli.command.unwrap_or(Commands::Daemon) {
        Commands::Daemon => {
            let mut daemon = taptype::daemon::Daemon::new(config, config_path);
            daemon.run().await?;
        }

        Commands::Transcribe { file } => {
            transcribe_file(&config, &file).await?;
        }

        Commands::Config => {
            show_config(&config)?;
        }

        Commands::History { limit } => {
            show_history(&config, limit)?;
        }

        Commands::Status => {
            show_status(&config);
        }
    }

    Ok(())
}

/// Transcribe a single audio file and print the text
async fn transcribe_file(config: &Config, path: &PathBuf) -> anyhow::Result<()> {
    if !path.exists() {
        anyhow::bail!("audio file not found: {:?}", path);
    }

    let engine = engine::create_engine(&config.engine);
    println!("Transcribing {:?} with {}...", path, engine.label());

    let result = engine.transcribe(path).await?;
    println!("\n{}", result.text);
    Ok(())
}

/// Show current configuration
fn show_config(config: &Config) -> anyhow::Result<()> {
    println!("Current Configuration\n");
    println!("=====================\n");

    println!("[hotkey]");
    println!("  key = {:?}", config.hotkey.key);
    println!("  mode = {:?}", config.hotkey.mode);

    println!("\n[audio]");
    println!("  device = {:?}", config.audio.device);
    println!("  sample_rate = {}", config.audio.sample_rate);
    println!("  chunk_secs = {}", config.audio.chunk_secs);
    println!("  max_duration_secs = {}", config.audio.max_duration_secs);

    println!("\n[engine]");
    println!("  backend = {:?}", config.engine.backend);
    println!("  whisper.model = {:?}", config.engine.whisper.model);
    println!("  whisper.language = {:?}", config.engine.whisper.language);
    println!("  parakeet.use_gpu = {}", config.engine.parakeet.use_gpu);

    println!("\n[output]");
    println!("  settle_delay_ms = {}", config.output.settle_delay_ms);
    println!("  save_history = {}", config.output.save_history);

    println!("\n[history]");
    println!("  max_entries = {}", config.history.max_entries);
    println!("  path = {:?}", config.resolve_history_path());

    if let Some(ref state_file) = config.state_file {
        println!("\nstate_file = {:?}", state_file);
        if let Some(resolved) = config.resolve_state_file() {
            println!("  (resolves to: {:?})", resolved);
        }
    }

    println!("\nSupported hotkeys:");
    let names: Vec<&str> = keymap::SUPPORTED_KEYS.iter().map(|(name, _)| *name).collect();
    println!("  {}", names.join(", "));

    println!("\n---");
    println!(
        "Config file: {:?}",
        Config::default_path().unwrap_or_else(|| PathBuf::from("(not found)"))
    );
    println!("Models dir: {:?}", Config::models_dir());

    Ok(())
}

/// List recent history entries
fn show_history(config: &Config, limit: u32) -> anyhow::Result<()> {
    let path = config.resolve_history_path();
    if !path.exists() {
        println!("No history database at {:?}", path);
        println!("Enable with save_history = true under [output] in config.toml");
        return Ok(());
    }

    let store = taptype::history::SqliteHistory::open(&path, config.history.max_entries)?;
    let entries = store.recent(limit)?;

    if entries.is_empty() {
        println!("History is empty");
        return Ok(());
    }

    for entry in entries {
        println!(
            "{}  [{}, {:.1}s]\n  {}",
            entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
            entry.engine,
            entry.duration_ms as f64 / 1000.0,
            entry.text
        );
    }

    Ok(())
}

/// Print the daemon state from the state file
fn show_status(config: &Config) {
    match config.resolve_state_file() {
        Some(path) => {
            let state =
                std::fs::read_to_string(&path).unwrap_or_else(|_| "stopped".to_string());
            println!("{}", state.trim());
        }
        None => {
            eprintln!("state_file is disabled in config.toml; set it to \"auto\" to enable status");
            std::process::exit(1);
        }
    }
}
