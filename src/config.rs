//! Configuration loading and types for taptype
//!
//! Configuration is loaded in layers:
//! 1. Built-in defaults
//! 2. Config file (~/.config/taptype/config.toml)
//! 3. Environment variables (TAPTYPE_*)
//! 4. CLI arguments (highest priority)

use crate::error::TaptypeError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default configuration file content
pub const DEFAULT_CONFIG: &str = r#"# Taptype Configuration
#
# Location: ~/.config/taptype/config.toml
# All settings can be overridden via CLI flags

# State file for external integrations (Waybar, polybar, etc.)
# Use "auto" for default location ($XDG_RUNTIME_DIR/taptype/state),
# a custom path, or "disabled" to turn off. The daemon writes state
# ("idle", "recording", "transcribing") to this file whenever it changes.
state_file = "auto"

[hotkey]
# Key to hold for push-to-talk
# Supported: F1-F12, Insert, Home, End, PageUp, PageDown,
# NumpadAdd, NumpadSubtract, NumpadMultiply, NumpadDivide,
# Pause, ScrollLock
key = "F1"

# Activation mode: "push_to_talk" or "toggle"
# - push_to_talk: Hold hotkey to record, release to transcribe (default)
# - toggle: Press hotkey once to start recording, press again to stop
# mode = "push_to_talk"

[audio]
# Audio input device ("default" uses system default)
device = "default"

# Sample rate in Hz (both backends expect 16000)
sample_rate = 16000

# Seconds of audio per transcription chunk
chunk_secs = 2.0

# Maximum recording duration in seconds (safety limit)
max_duration_secs = 120

[engine]
# Transcription backend: "whisper" or "parakeet"
backend = "whisper"

[engine.whisper]
# Model to use for transcription
# Options: tiny, base, small, medium, large-v3, large-v3-turbo
# Or an absolute path to a custom ggml .bin model file
model = "base"

# Language for transcription ("auto" for auto-detection)
language = "en"

# Path to the whisper-cli binary (omit to search PATH)
# binary = "/usr/local/bin/whisper-cli"

# Number of CPU threads for inference (omit for auto-detection)
# threads = 4

[engine.parakeet]
# Try CUDA first, falling back to CPU if the process crashes
use_gpu = true

# Path to the sherpa-onnx-offline binary (omit to search PATH)
# binary = "/usr/local/bin/sherpa-onnx-offline"

# Directory holding encoder/decoder/joiner .onnx files and tokens.txt
# (omit for the default under ~/.local/share/taptype/models/parakeet)
# model_dir = "/path/to/parakeet-tdt"

[output]
# Delay between clipboard write and Ctrl+V injection, in milliseconds
settle_delay_ms = 100

# Save finished dictations to the history database
save_history = false

[history]
# Keep only the newest N entries (0 = unlimited)
max_entries = 100
"#;

/// Hotkey activation mode
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ActivationMode {
    /// Hold key to record, release to stop (default)
    #[default]
    PushToTalk,
    /// Press once to start recording, press again to stop
    Toggle,
}

/// Transcription backend selection
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    /// whisper.cpp CLI binary
    #[default]
    Whisper,
    /// sherpa-onnx offline binary (Parakeet TDT model)
    Parakeet,
}

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub hotkey: HotkeyConfig,

    #[serde(default)]
    pub audio: AudioConfig,

    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub output: OutputConfig,

    #[serde(default)]
    pub history: HistoryConfig,

    /// Optional path to state file for external integrations (e.g., Waybar).
    /// "auto" resolves under $XDG_RUNTIME_DIR, "disabled" turns it off.
    #[serde(default)]
    pub state_file: Option<String>,
}

/// Hotkey detection configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HotkeyConfig {
    /// Symbolic key name, e.g. "F1", "ScrollLock", "Pause"
    #[serde(default = "default_hotkey_key")]
    pub key: String,

    /// Activation mode: push_to_talk (hold to record) or toggle (press to start/stop)
    #[serde(default)]
    pub mode: ActivationMode,
}

impl Default for HotkeyConfig {
    fn default() -> Self {
        Self {
            key: default_hotkey_key(),
            mode: ActivationMode::default(),
        }
    }
}

/// Audio capture configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AudioConfig {
    /// cpal input device name, or "default"
    #[serde(default = "default_device")]
    pub device: String,

    /// Sample rate in Hz (backends expect 16000)
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,

    /// Seconds of audio per transcription chunk
    #[serde(default = "default_chunk_secs")]
    pub chunk_secs: f32,

    /// Maximum recording duration in seconds (safety limit)
    #[serde(default = "default_max_duration")]
    pub max_duration_secs: u32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            device: default_device(),
            sample_rate: default_sample_rate(),
            chunk_secs: default_chunk_secs(),
            max_duration_secs: default_max_duration(),
        }
    }
}

/// Transcription engine configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct EngineConfig {
    /// Which backend to invoke (read once at session start)
    #[serde(default)]
    pub backend: EngineKind,

    #[serde(default)]
    pub whisper: WhisperEngineConfig,

    #[serde(default)]
    pub parakeet: ParakeetEngineConfig,
}

/// whisper.cpp CLI backend configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WhisperEngineConfig {
    /// Path to the whisper-cli binary (None = search PATH)
    #[serde(default)]
    pub binary: Option<String>,

    /// Model name (tiny, base, ...) or absolute path to a .bin file
    #[serde(default = "default_whisper_model")]
    pub model: String,

    /// Language code ("auto" for auto-detection)
    #[serde(default = "default_language")]
    pub language: String,

    /// Number of threads for inference (None = auto-detect)
    #[serde(default)]
    pub threads: Option<usize>,
}

impl Default for WhisperEngineConfig {
    fn default() -> Self {
        Self {
            binary: None,
            model: default_whisper_model(),
            language: default_language(),
            threads: None,
        }
    }
}

/// sherpa-onnx (Parakeet TDT) backend configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ParakeetEngineConfig {
    /// Path to the sherpa-onnx-offline binary (None = search PATH)
    #[serde(default)]
    pub binary: Option<String>,

    /// Directory holding the transducer model files (None = default data dir)
    #[serde(default)]
    pub model_dir: Option<String>,

    /// Try the CUDA provider first, falling back to CPU on crash
    #[serde(default = "default_true")]
    pub use_gpu: bool,
}

impl Default for ParakeetEngineConfig {
    fn default() -> Self {
        Self {
            binary: None,
            model_dir: None,
            use_gpu: true,
        }
    }
}

/// Text output configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OutputConfig {
    /// Delay between clipboard write and Ctrl+V injection (ms)
    #[serde(default = "default_settle_delay")]
    pub settle_delay_ms: u64,

    /// Save finished dictations to the history database
    #[serde(default)]
    pub save_history: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            settle_delay_ms: default_settle_delay(),
            save_history: false,
        }
    }
}

/// History store configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HistoryConfig {
    /// Keep only the newest N entries (0 = unlimited)
    #[serde(default = "default_max_entries")]
    pub max_entries: u32,

    /// Database path (None = default under the data dir)
    #[serde(default)]
    pub path: Option<String>,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            max_entries: default_max_entries(),
            path: None,
        }
    }
}

fn default_hotkey_key() -> String {
    "F1".to_string()
}

fn default_device() -> String {
    "default".to_string()
}

fn default_sample_rate() -> u32 {
    16000
}

fn default_chunk_secs() -> f32 {
    2.0
}

fn default_max_duration() -> u32 {
    120
}

fn default_whisper_model() -> String {
    "base".to_string()
}

fn default_language() -> String {
    "en".to_string()
}

fn default_settle_delay() -> u64 {
    100
}

fn default_max_entries() -> u32 {
    100
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Get the default config file path
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", "taptype")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Get the config directory path
    pub fn config_dir() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", "taptype")
            .map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the data directory path (models, history)
    pub fn data_dir() -> PathBuf {
        directories::ProjectDirs::from("", "", "taptype")
            .map(|dirs| dirs.data_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."))
    }

    /// Get the models directory path
    pub fn models_dir() -> PathBuf {
        Self::data_dir().join("models")
    }

    /// Get the runtime directory for ephemeral files (state file)
    pub fn runtime_dir() -> PathBuf {
        std::env::var("XDG_RUNTIME_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
            .join("taptype")
    }

    /// Root directory for per-session chunk temp files
    pub fn temp_root() -> PathBuf {
        std::env::temp_dir().join("taptype")
    }

    /// Resolve the state file path from config.
    /// Returns None if state_file is not configured or explicitly disabled.
    pub fn resolve_state_file(&self) -> Option<PathBuf> {
        self.state_file
            .as_ref()
            .and_then(|path| match path.to_lowercase().as_str() {
                "disabled" | "none" | "off" | "false" => None,
                "auto" => Some(Self::runtime_dir().join("state")),
                _ => Some(PathBuf::from(path)),
            })
    }

    /// Resolve the history database path
    pub fn resolve_history_path(&self) -> PathBuf {
        self.history
            .path
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| Self::data_dir().join("history.db"))
    }

    /// Ensure all required directories exist
    pub fn ensure_directories() -> std::io::Result<()> {
        if let Some(config_dir) = Self::config_dir() {
            std::fs::create_dir_all(&config_dir)?;
        }

        let models_dir = Self::models_dir();
        std::fs::create_dir_all(&models_dir)?;

        std::fs::create_dir_all(Self::temp_root())?;

        Ok(())
    }
}

/// Load configuration from file, with defaults for missing values
pub fn load_config(path: Option<&Path>) -> Result<Config, TaptypeError> {
    let mut config = Config {
        state_file: Some("auto".to_string()),
        ..Config::default()
    };

    let config_path = path.map(PathBuf::from).or_else(Config::default_path);

    if let Some(ref path) = config_path {
        if path.exists() {
            tracing::debug!("Loading config from {:?}", path);
            let contents = std::fs::read_to_string(path)
                .map_err(|e| TaptypeError::Config(format!("Failed to read config: {}", e)))?;

            config = toml::from_str(&contents)
                .map_err(|e| TaptypeError::Config(format!("Invalid config: {}", e)))?;
        } else {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
        }
    }

    // Override from environment variables
    if let Ok(key) = std::env::var("TAPTYPE_HOTKEY") {
        config.hotkey.key = key;
    }
    if let Ok(model) = std::env::var("TAPTYPE_MODEL") {
        config.engine.whisper.model = model;
    }
    if let Ok(backend) = std::env::var("TAPTYPE_ENGINE") {
        config.engine.backend = match backend.to_lowercase().as_str() {
            "parakeet" => EngineKind::Parakeet,
            _ => EngineKind::Whisper,
        };
    }

    Ok(config)
}

/// Save configuration to file
pub fn save_config(config: &Config, path: &Path) -> Result<(), TaptypeError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| TaptypeError::Config(format!("Failed to create config dir: {}", e)))?;
    }

    let contents = toml::to_string_pretty(config)
        .map_err(|e| TaptypeError::Config(format!("Failed to serialize config: {}", e)))?;

    std::fs::write(path, contents)
        .map_err(|e| TaptypeError::Config(format!("Failed to write config: {}", e)))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.hotkey.key, "F1");
        assert_eq!(config.hotkey.mode, ActivationMode::PushToTalk);
        assert_eq!(config.audio.sample_rate, 16000);
        assert_eq!(config.engine.backend, EngineKind::Whisper);
        assert_eq!(config.engine.whisper.model, "base");
        assert!(config.engine.parakeet.use_gpu);
        assert!(!config.output.save_history);
        assert_eq!(config.history.max_entries, 100);
    }

    #[test]
    fn test_default_config_template_parses() {
        let config: Config = toml::from_str(DEFAULT_CONFIG).unwrap();
        assert_eq!(config.hotkey.key, "F1");
        assert_eq!(config.state_file.as_deref(), Some("auto"));
    }

    #[test]
    fn test_parse_config_toml() {
        let toml_str = r#"
            [hotkey]
            key = "ScrollLock"
            mode = "toggle"

            [engine]
            backend = "parakeet"

            [engine.parakeet]
            use_gpu = false

            [output]
            settle_delay_ms = 250
            save_history = true
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.hotkey.key, "ScrollLock");
        assert_eq!(config.hotkey.mode, ActivationMode::Toggle);
        assert_eq!(config.engine.backend, EngineKind::Parakeet);
        assert!(!config.engine.parakeet.use_gpu);
        assert_eq!(config.output.settle_delay_ms, 250);
        assert!(config.output.save_history);
        // Untouched sections keep their defaults
        assert_eq!(config.engine.whisper.model, "base");
        assert_eq!(config.audio.chunk_secs, 2.0);
    }

    #[test]
    fn test_state_file_resolution() {
        let mut config = Config {
            state_file: Some("disabled".to_string()),
            ..Config::default()
        };
        assert!(config.resolve_state_file().is_none());

        config.state_file = Some("/run/user/1000/custom".to_string());
        assert_eq!(
            config.resolve_state_file(),
            Some(PathBuf::from("/run/user/1000/custom"))
        );

        config.state_file = Some("auto".to_string());
        assert!(config.resolve_state_file().is_some());
    }

    #[test]
    fn test_save_and_reload_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let mut config = Config::default();
        config.hotkey.key = "F9".to_string();
        config.output.save_history = true;

        save_config(&config, &path).unwrap();
        let reloaded = load_config(Some(&path)).unwrap();
        assert_eq!(reloaded.hotkey.key, "F9");
        assert!(reloaded.output.save_history);
    }
}
