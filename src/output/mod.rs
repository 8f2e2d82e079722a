//! Text delivery to the focused application
//!
//! The finished dictation is placed on the Wayland clipboard with
//! wl-copy, then pasted into the focused window by replaying Ctrl+V
//! through ydotool. ydotool speaks to the uinput kernel interface, so
//! this works on every Wayland compositor.
//!
//! Clipboard failure is fatal for the dispatch; paste failure is not,
//! since the text is already on the clipboard and the user can paste
//! by hand.
//!
//! Requires: wl-clipboard installed, ydotoold daemon running for the
//! paste step.

use crate::config::OutputConfig;
use crate::error::OutputError;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Ctrl+V as ydotool key sequence (KEY_LEFTCTRL=29 down, KEY_V=47
/// down/up, KEY_LEFTCTRL up)
const PASTE_SEQUENCE: [&str; 4] = ["29:1", "47:1", "47:0", "29:0"];

/// Delivers finished dictations to the focused application
#[async_trait::async_trait]
pub trait OutputSink: Send + Sync {
    /// Copy text to the clipboard and paste it into the focused window
    async fn auto_type(&self, text: &str) -> Result<(), OutputError>;
}

/// wl-copy plus ydotool paste injection
pub struct OutputDispatcher {
    /// Delay between clipboard write and Ctrl+V, giving the clipboard
    /// manager time to take ownership
    settle_delay: Duration,
}

impl OutputDispatcher {
    pub fn new(config: &OutputConfig) -> Self {
        Self {
            settle_delay: Duration::from_millis(config.settle_delay_ms),
        }
    }

    async fn copy_to_clipboard(&self, text: &str) -> Result<(), OutputError> {
        let mut child = Command::new("wl-copy")
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    OutputError::WlCopyNotFound
                } else {
                    OutputError::ClipboardFailed(e.to_string())
                }
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(text.as_bytes())
                .await
                .map_err(|e| OutputError::ClipboardFailed(e.to_string()))?;
            // Close stdin to signal EOF
            drop(stdin);
        }

        let status = child
            .wait()
            .await
            .map_err(|e| OutputError::ClipboardFailed(e.to_string()))?;

        if !status.success() {
            return Err(OutputError::ClipboardFailed(
                "wl-copy exited with error".to_string(),
            ));
        }

        tracing::info!("Text copied to clipboard ({} chars)", text.len());
        Ok(())
    }

    async fn inject_paste(&self) -> Result<(), OutputError> {
        let output = Command::new("ydotool")
            .arg("key")
            .args(PASTE_SEQUENCE)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    OutputError::YdotoolNotFound
                } else {
                    OutputError::InjectionFailed(e.to_string())
                }
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("socket") || stderr.contains("connect") || stderr.contains("daemon")
            {
                return Err(OutputError::YdotoolNotRunning);
            }
            return Err(OutputError::InjectionFailed(stderr.to_string()));
        }

        Ok(())
    }
}

#[async_trait::async_trait]
impl OutputSink for OutputDispatcher {
    async fn auto_type(&self, text: &str) -> Result<(), OutputError> {
        if text.trim().is_empty() {
            return Ok(());
        }

        self.copy_to_clipboard(text).await?;

        tokio::time::sleep(self.settle_delay).await;

        // The text is already on the clipboard, so a failed paste only
        // warrants a warning
        if let Err(e) = self.inject_paste().await {
            tracing::warn!("Paste injection failed, text left on clipboard: {}", e);
        }

        Ok(())
    }
}

/// Check whether an executable is reachable on PATH
pub fn tool_available(name: &str) -> bool {
    which::which(name).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_blank_text_is_a_noop() {
        let dispatcher = OutputDispatcher::new(&OutputConfig::default());
        // Must not touch the clipboard or spawn anything
        dispatcher.auto_type("").await.unwrap();
        dispatcher.auto_type("   \n\t").await.unwrap();
    }

    #[test]
    fn test_settle_delay_from_config() {
        let config = OutputConfig {
            settle_delay_ms: 250,
            save_history: false,
        };
        let dispatcher = OutputDispatcher::new(&config);
        assert_eq!(dispatcher.settle_delay, Duration::from_millis(250));
    }

    #[test]
    fn test_paste_sequence_shape() {
        // Presses must be balanced with releases, in reverse order for
        // the modifier
        assert_eq!(PASTE_SEQUENCE, ["29:1", "47:1", "47:0", "29:0"]);
    }
}
