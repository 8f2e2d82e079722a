//! Taptype - push-to-talk dictation for the Linux desktop
//!
//! Hold a hotkey, speak, release: audio is captured in short chunks,
//! each chunk is transcribed while the next records, and the joined
//! text is pasted at the cursor via clipboard + Ctrl+V.
//!
//! Pipeline:
//!
//! ```text
//! hotkey (evdev) -> audio capture (cpal) -> session manager
//!                                               |
//!                           engine adapter (whisper-cli / sherpa-onnx)
//!                                               |
//!                       output (wl-copy + ydotool) -> history (sqlite)
//! ```
//!
//! Transcription is delegated to external binaries; the adapters in
//! [`engine`] spawn one process per chunk and parse its output.

pub mod audio;
pub mod config;
pub mod daemon;
pub mod engine;
pub mod error;
pub mod history;
pub mod hotkey;
pub mod output;
pub mod session;

pub use config::Config;
pub use daemon::Daemon;
pub use error::{Result, TaptypeError};
