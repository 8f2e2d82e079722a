//! Error types for taptype
//!
//! Uses thiserror for ergonomic error definitions with clear messages
//! that guide users toward fixing common issues.

use std::path::PathBuf;
use thiserror::Error;

/// Top-level error type for the taptype application
#[derive(Error, Debug)]
pub enum TaptypeError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Hotkey error: {0}")]
    Hotkey(#[from] HotkeyError),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Output error: {0}")]
    Output(#[from] OutputError),

    #[error("History error: {0}")]
    History(#[from] HistoryError),

    #[error("Audio capture error: {0}")]
    Audio(#[from] AudioError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors related to hotkey detection
#[derive(Error, Debug)]
pub enum HotkeyError {
    #[error("Cannot open input device '{0}'. Is the user in the 'input' group?\n  Run: sudo usermod -aG input $USER\n  Then log out and back in.")]
    DeviceAccess(String),

    #[error("Unknown key name: '{0}'. Run 'taptype config' to list supported keys.")]
    UnknownKey(String),

    #[error("No keyboard device found in /dev/input/")]
    NoKeyboard,

    #[error("Hotkey registration failed: {0}")]
    RegistrationFailed(String),

    #[error("evdev error: {0}")]
    Evdev(String),
}

/// Errors from the transcription engine adapters
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Backend executable not found: {0}")]
    BinaryNotFound(PathBuf),

    #[error("Model file not found: {name} ({path}). Download the model before recording.")]
    ModelFileNotFound { name: String, path: PathBuf },

    #[error("Backend launch failed: {0}")]
    Launch(String),

    #[error("Backend exited with code {code}: {stderr}")]
    Execution { code: i32, stderr: String },
}

/// Errors related to text output
#[derive(Error, Debug)]
pub enum OutputError {
    #[error("wl-copy not found in PATH. Install wl-clipboard via your package manager.")]
    WlCopyNotFound,

    #[error("ydotool not found in PATH. Install via your package manager.")]
    YdotoolNotFound,

    #[error("ydotool daemon not running.\n  Start with: systemctl --user start ydotool")]
    YdotoolNotRunning,

    #[error("Clipboard write failed: {0}")]
    ClipboardFailed(String),

    #[error("Paste injection failed: {0}")]
    InjectionFailed(String),
}

/// Errors from the history store
#[derive(Error, Debug)]
pub enum HistoryError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors related to audio capture
#[derive(Error, Debug)]
pub enum AudioError {
    #[error("Audio connection failed: {0}")]
    Connection(String),

    #[error("Audio device not found: '{0}'. List devices with: pactl list sources short")]
    DeviceNotFound(String),

    #[error("Audio stream error: {0}")]
    StreamError(String),
}

/// Result type alias using TaptypeError
pub type Result<T> = std::result::Result<T, TaptypeError>;

#[cfg(target_os = "linux")]
impl From<evdev::Error> for HotkeyError {
    fn from(e: evdev::Error) -> Self {
        HotkeyError::Evdev(e.to_string())
    }
}
