//! Transcription engine adapters
//!
//! Wraps external speech-to-text executables behind a uniform
//! transcribe/abort contract:
//! - whisper.cpp CLI binary (plain-text output, timestamps stripped)
//! - sherpa-onnx offline binary running a Parakeet TDT transducer
//!   (JSON output, CUDA-to-CPU provider fallback)
//!
//! Both adapters spawn the backend per audio chunk, capture stdout and
//! stderr fully, and track the in-flight child pid so an abort can
//! SIGTERM it.

pub mod parakeet;
pub mod whisper;

use crate::config::{EngineConfig, EngineKind};
use crate::error::EngineError;
use chrono::{DateTime, Utc};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;
use tokio::process::Command;

/// Result of transcribing a single audio chunk
#[derive(Debug, Clone)]
pub struct TranscriptionResult {
    /// Transcribed text (may be empty)
    pub text: String,
    /// Whether this is an incremental chunk result (false for the
    /// end-of-session result)
    pub partial: bool,
    /// When this result was produced
    pub timestamp: DateTime<Utc>,
    /// Zero-based chunk index within the session (-1 for the final result)
    pub chunk_index: i64,
}

/// Trait for transcription backend implementations
#[async_trait::async_trait]
pub trait EngineAdapter: Send + Sync {
    /// Transcribe one audio file to text.
    ///
    /// Missing binary/model files fail fast with a descriptive error
    /// before any process is spawned. A backend that runs cleanly but
    /// produces no recognizable text yields an empty-text result, not
    /// an error.
    async fn transcribe(&self, audio_path: &Path) -> Result<TranscriptionResult, EngineError>;

    /// Kill the in-flight backend process, if any. Safe to call when idle.
    fn abort(&self);

    /// Reset the per-session chunk index counter. Called at session start.
    fn reset_session(&self);

    /// Whether the backend executable can be resolved
    fn is_available(&self) -> bool;

    /// Whether the required model files are present
    fn is_model_installed(&self) -> bool;

    /// Short label identifying backend and model, for history and status
    fn label(&self) -> String;
}

/// Factory function to create the adapter for the configured backend
pub fn create_engine(config: &EngineConfig) -> std::sync::Arc<dyn EngineAdapter> {
    match config.backend {
        EngineKind::Whisper => std::sync::Arc::new(whisper::WhisperEngine::new(&config.whisper)),
        EngineKind::Parakeet => {
            std::sync::Arc::new(parakeet::ParakeetEngine::new(&config.parakeet))
        }
    }
}

/// Captured output of a finished backend process
pub(crate) struct BackendOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Spawn the backend, record its pid in `in_flight`, and wait for exit
/// with both streams captured.
pub(crate) async fn run_backend(
    binary: &Path,
    args: &[String],
    envs: &[(String, String)],
    in_flight: &Mutex<Option<i32>>,
) -> Result<BackendOutput, EngineError> {
    let mut cmd = Command::new(binary);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    for (key, value) in envs {
        cmd.env(key, value);
    }

    let child = cmd
        .spawn()
        .map_err(|e| EngineError::Launch(format!("{}: {}", binary.display(), e)))?;

    if let Ok(mut slot) = in_flight.lock() {
        *slot = child.id().map(|pid| pid as i32);
    }

    let output = child.wait_with_output().await;

    if let Ok(mut slot) = in_flight.lock() {
        *slot = None;
    }

    let output = output.map_err(|e| EngineError::Launch(e.to_string()))?;
    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

    if output.status.success() {
        Ok(BackendOutput { stdout, stderr })
    } else {
        Err(EngineError::Execution {
            code: output.status.code().unwrap_or(-1),
            stderr: stderr.trim().to_string(),
        })
    }
}

/// SIGTERM the recorded in-flight pid, if any. No-op when idle.
pub(crate) fn abort_in_flight(in_flight: &Mutex<Option<i32>>) {
    let pid = match in_flight.lock() {
        Ok(mut slot) => slot.take(),
        Err(_) => None,
    };
    if let Some(pid) = pid {
        tracing::debug!("Sending SIGTERM to backend process {}", pid);
        if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
            tracing::debug!("Failed to signal backend process {}: {}", pid, e);
        }
    }
}

/// How long a format conversion may take before we give up on it
const CONVERT_TIMEOUT: Duration = Duration::from_secs(30);

/// Audio file handed to a backend, deleting any transcoded copy on drop
pub(crate) struct PreparedAudio {
    path: PathBuf,
    converted: bool,
}

impl PreparedAudio {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PreparedAudio {
    fn drop(&mut self) {
        if self.converted {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

/// Ensure the audio file is in a format the backends accept.
///
/// WAV files pass through untouched. Anything else is transcoded to
/// 16 kHz mono WAV via ffmpeg with a hard timeout; on timeout or any
/// failure the original file is used as-is rather than stalling the
/// session.
pub(crate) async fn prepare_audio(audio_path: &Path) -> PreparedAudio {
    let is_wav = audio_path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("wav"))
        .unwrap_or(false);

    if is_wav {
        return PreparedAudio {
            path: audio_path.to_path_buf(),
            converted: false,
        };
    }

    let converted = audio_path.with_extension("16k.wav");
    let result = tokio::time::timeout(
        CONVERT_TIMEOUT,
        Command::new("ffmpeg")
            .arg("-i")
            .arg(audio_path)
            .args(["-ar", "16000", "-ac", "1", "-y"])
            .arg(&converted)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status(),
    )
    .await;

    match result {
        Ok(Ok(status)) if status.success() => PreparedAudio {
            path: converted,
            converted: true,
        },
        Ok(Ok(status)) => {
            tracing::debug!("ffmpeg exited with {:?}, using original audio", status.code());
            let _ = std::fs::remove_file(&converted);
            PreparedAudio {
                path: audio_path.to_path_buf(),
                converted: false,
            }
        }
        Ok(Err(e)) => {
            tracing::debug!("ffmpeg not available ({}), using original audio", e);
            PreparedAudio {
                path: audio_path.to_path_buf(),
                converted: false,
            }
        }
        Err(_) => {
            tracing::warn!("ffmpeg conversion timed out, using original audio");
            let _ = std::fs::remove_file(&converted);
            PreparedAudio {
                path: audio_path.to_path_buf(),
                converted: false,
            }
        }
    }
}

/// Collapse whitespace runs to single spaces and trim
pub(crate) fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collapse_whitespace() {
        assert_eq!(collapse_whitespace("  hello   world \n"), "hello world");
        assert_eq!(collapse_whitespace(""), "");
        assert_eq!(collapse_whitespace("   \t "), "");
    }

    #[tokio::test]
    async fn test_prepare_audio_wav_passthrough() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chunk_0000.wav");
        std::fs::write(&path, b"not really wav").unwrap();

        let prepared = prepare_audio(&path).await;
        assert_eq!(prepared.path(), path.as_path());
        drop(prepared);
        // Passthrough must not delete the caller's file
        assert!(path.exists());
    }

    #[test]
    fn test_abort_with_no_process_is_noop() {
        let in_flight = Mutex::new(None);
        abort_in_flight(&in_flight);
    }
}
