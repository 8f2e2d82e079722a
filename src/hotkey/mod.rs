//! Global hotkey detection
//!
//! Listens for the configured push-to-talk key on raw input devices and
//! turns key transitions into start/stop events for the session
//! manager. The translation itself lives in [`HotkeyState`], a pure
//! state machine, so debounce, toggle, and capture behavior are
//! testable without a keyboard.
//!
//! When no input device can be opened (user not in the `input` group,
//! no keyboard present) the coordinator degrades to a SIGUSR1-driven
//! toggle so the daemon stays usable from scripts and desktop keybinds.

pub mod keymap;

#[cfg(target_os = "linux")]
pub mod evdev_source;

use crate::config::ActivationMode;
use crate::error::HotkeyError;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Events emitted by the hotkey coordinator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HotkeyEvent {
    /// Recording should start
    Start,
    /// Recording should stop
    Stop,
    /// A key was captured while in capture mode (canonical key name)
    Captured(String),
    /// The activation mode changed (e.g. forced toggle fallback)
    ModeChanged(ActivationMode),
    /// Listener failure, reported but non-fatal
    Error(String),
}

/// A single key transition from an input source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawKeyEvent {
    /// Linux input event code
    pub code: u16,
    /// true on key down, false on key up (repeats are filtered out
    /// by the source)
    pub pressed: bool,
}

/// Source of raw key events, normally evdev
#[async_trait::async_trait]
pub trait KeySource: Send {
    /// Start forwarding key transitions into `tx` until stopped
    async fn start(&mut self, tx: mpsc::Sender<RawKeyEvent>) -> Result<(), HotkeyError>;

    async fn stop(&mut self);
}

/// Pure hotkey state machine.
///
/// Holds the debounce latch, the toggle recording flag, and the
/// capture flag. Feed it every key transition; it returns the event to
/// emit, if any.
#[derive(Debug)]
pub struct HotkeyState {
    code: u16,
    mode: ActivationMode,
    /// Debounce latch: set on key down, cleared on key up. Auto-repeat
    /// and double key-down must not retrigger.
    key_down: bool,
    /// Toggle mode only: whether a recording is in progress
    recording: bool,
    /// Capture mode: the next key down is reported, not acted on
    capturing: bool,
}

impl HotkeyState {
    pub fn new(code: u16, mode: ActivationMode) -> Self {
        Self {
            code,
            mode,
            key_down: false,
            recording: false,
            capturing: false,
        }
    }

    pub fn mode(&self) -> ActivationMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: ActivationMode) {
        self.mode = mode;
        self.recording = false;
    }

    pub fn set_code(&mut self, code: u16) {
        self.code = code;
        self.key_down = false;
    }

    /// Enter capture mode: the next key down is consumed and reported
    pub fn begin_capture(&mut self) {
        self.capturing = true;
    }

    pub fn end_capture(&mut self) {
        self.capturing = false;
    }

    /// Process one key transition
    pub fn on_raw_event(&mut self, event: RawKeyEvent) -> Option<HotkeyEvent> {
        if self.capturing {
            if !event.pressed {
                return None;
            }
            // Unsupported keys stay in capture so the user can try again
            let name = keymap::key_name(event.code)?;
            self.capturing = false;
            return Some(HotkeyEvent::Captured(name.to_string()));
        }

        if event.code != self.code {
            return None;
        }

        if event.pressed {
            if self.key_down {
                return None;
            }
            self.key_down = true;
            match self.mode {
                ActivationMode::PushToTalk => Some(HotkeyEvent::Start),
                ActivationMode::Toggle => {
                    self.recording = !self.recording;
                    if self.recording {
                        Some(HotkeyEvent::Start)
                    } else {
                        Some(HotkeyEvent::Stop)
                    }
                }
            }
        } else {
            if !self.key_down {
                return None;
            }
            self.key_down = false;
            match self.mode {
                ActivationMode::PushToTalk => Some(HotkeyEvent::Stop),
                ActivationMode::Toggle => None,
            }
        }
    }

    /// Process an external toggle pulse (signal fallback). Always
    /// toggles, regardless of configured mode.
    pub fn on_toggle_pulse(&mut self) -> HotkeyEvent {
        self.recording = !self.recording;
        if self.recording {
            HotkeyEvent::Start
        } else {
            HotkeyEvent::Stop
        }
    }
}

/// Wires a key source to the session manager's event channel
pub struct HotkeyCoordinator {
    state: Arc<Mutex<HotkeyState>>,
    events: mpsc::Sender<HotkeyEvent>,
    config_path: Option<PathBuf>,
    /// Kept alive for the lifetime of the coordinator; dropping the
    /// source stops its listener
    source: Option<Box<dyn KeySource>>,
    tasks: Vec<JoinHandle<()>>,
    stop: Option<tokio::sync::oneshot::Sender<()>>,
}

impl HotkeyCoordinator {
    pub fn new(
        key: &str,
        mode: ActivationMode,
        events: mpsc::Sender<HotkeyEvent>,
        config_path: Option<PathBuf>,
    ) -> Result<Self, HotkeyError> {
        let code = keymap::key_code(key).ok_or_else(|| HotkeyError::UnknownKey(key.to_string()))?;
        Ok(Self {
            state: Arc::new(Mutex::new(HotkeyState::new(code, mode))),
            events,
            config_path,
            source: None,
            tasks: Vec::new(),
            stop: None,
        })
    }

    /// Start listening on the given source. On device failure, fall
    /// back to SIGUSR1 toggle mode and report the mode change.
    pub async fn start(&mut self, mut source: Box<dyn KeySource>) -> Result<(), HotkeyError> {
        let (raw_tx, mut raw_rx) = mpsc::channel::<RawKeyEvent>(64);

        match source.start(raw_tx).await {
            Ok(()) => {
                let state = Arc::clone(&self.state);
                let events = self.events.clone();
                self.tasks.push(tokio::spawn(async move {
                    while let Some(raw) = raw_rx.recv().await {
                        let emitted = match state.lock() {
                            Ok(mut s) => s.on_raw_event(raw),
                            Err(_) => None,
                        };
                        if let Some(event) = emitted {
                            if events.send(event).await.is_err() {
                                break;
                            }
                        }
                    }
                }));
                self.source = Some(source);
            }
            Err(e) => {
                tracing::warn!("Hotkey listener unavailable ({}), using SIGUSR1 toggle", e);
                if let Ok(mut s) = self.state.lock() {
                    s.set_mode(ActivationMode::Toggle);
                }
                let _ = self
                    .events
                    .send(HotkeyEvent::ModeChanged(ActivationMode::Toggle))
                    .await;
                self.start_signal_fallback()?;
            }
        }

        Ok(())
    }

    /// Listen for SIGUSR1 and treat each delivery as a toggle press
    fn start_signal_fallback(&mut self) -> Result<(), HotkeyError> {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigusr1 = signal(SignalKind::user_defined1())
            .map_err(|e| HotkeyError::RegistrationFailed(e.to_string()))?;
        let (stop_tx, mut stop_rx) = tokio::sync::oneshot::channel();
        self.stop = Some(stop_tx);

        let state = Arc::clone(&self.state);
        let events = self.events.clone();
        self.tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    received = sigusr1.recv() => {
                        if received.is_none() {
                            break;
                        }
                        let event = match state.lock() {
                            Ok(mut s) => s.on_toggle_pulse(),
                            Err(_) => continue,
                        };
                        if events.send(event).await.is_err() {
                            break;
                        }
                    }
                }
            }
        }));

        Ok(())
    }

    pub fn stop(&mut self) {
        // Dropping the source tears down its listener thread
        self.source = None;
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }

    /// Switch to a new hotkey and persist it to the config file
    pub fn update_hotkey(&self, key: &str) -> Result<(), HotkeyError> {
        let code = keymap::key_code(key).ok_or_else(|| HotkeyError::UnknownKey(key.to_string()))?;

        if let Ok(mut state) = self.state.lock() {
            state.set_code(code);
        }

        if let Some(ref path) = self.config_path {
            let persisted = crate::config::load_config(Some(path)).and_then(|mut config| {
                config.hotkey.key = key.to_string();
                crate::config::save_config(&config, path)
            });
            if let Err(e) = persisted {
                tracing::warn!("Failed to persist hotkey change: {}", e);
            }
        }

        tracing::info!("Hotkey updated to {}", key);
        Ok(())
    }

    pub fn set_mode(&self, mode: ActivationMode) {
        if let Ok(mut state) = self.state.lock() {
            state.set_mode(mode);
        }
    }

    pub fn start_capturing(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.begin_capture();
        }
    }

    pub fn stop_capturing(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.end_capture();
        }
    }
}

impl Drop for HotkeyCoordinator {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const F1: u16 = 59;
    const F2: u16 = 60;

    fn down(code: u16) -> RawKeyEvent {
        RawKeyEvent {
            code,
            pressed: true,
        }
    }

    fn up(code: u16) -> RawKeyEvent {
        RawKeyEvent {
            code,
            pressed: false,
        }
    }

    #[test]
    fn test_push_to_talk_cycle() {
        let mut state = HotkeyState::new(F1, ActivationMode::PushToTalk);
        assert_eq!(state.on_raw_event(down(F1)), Some(HotkeyEvent::Start));
        assert_eq!(state.on_raw_event(up(F1)), Some(HotkeyEvent::Stop));
    }

    #[test]
    fn test_repeated_key_down_fires_once() {
        let mut state = HotkeyState::new(F1, ActivationMode::PushToTalk);
        assert_eq!(state.on_raw_event(down(F1)), Some(HotkeyEvent::Start));
        assert_eq!(state.on_raw_event(down(F1)), None);
        assert_eq!(state.on_raw_event(down(F1)), None);
        assert_eq!(state.on_raw_event(up(F1)), Some(HotkeyEvent::Stop));
    }

    #[test]
    fn test_other_keys_ignored() {
        let mut state = HotkeyState::new(F1, ActivationMode::PushToTalk);
        assert_eq!(state.on_raw_event(down(F2)), None);
        assert_eq!(state.on_raw_event(up(F2)), None);
    }

    #[test]
    fn test_toggle_mode() {
        let mut state = HotkeyState::new(F1, ActivationMode::Toggle);
        assert_eq!(state.on_raw_event(down(F1)), Some(HotkeyEvent::Start));
        assert_eq!(state.on_raw_event(up(F1)), None);
        assert_eq!(state.on_raw_event(down(F1)), Some(HotkeyEvent::Stop));
        assert_eq!(state.on_raw_event(up(F1)), None);
    }

    #[test]
    fn test_capture_consumes_next_key_down() {
        let mut state = HotkeyState::new(F1, ActivationMode::PushToTalk);
        state.begin_capture();

        // Key up and unsupported keys are ignored while capturing
        assert_eq!(state.on_raw_event(up(F2)), None);
        assert_eq!(state.on_raw_event(down(30)), None);

        assert_eq!(
            state.on_raw_event(down(F2)),
            Some(HotkeyEvent::Captured("F2".to_string()))
        );

        // Capture is one-shot, and the hotkey itself was not triggered
        assert_eq!(state.on_raw_event(down(F1)), Some(HotkeyEvent::Start));
    }

    #[test]
    fn test_capture_does_not_start_recording() {
        let mut state = HotkeyState::new(F1, ActivationMode::PushToTalk);
        state.begin_capture();
        assert_eq!(
            state.on_raw_event(down(F1)),
            Some(HotkeyEvent::Captured("F1".to_string()))
        );
    }

    #[test]
    fn test_toggle_pulse() {
        let mut state = HotkeyState::new(F1, ActivationMode::Toggle);
        assert_eq!(state.on_toggle_pulse(), HotkeyEvent::Start);
        assert_eq!(state.on_toggle_pulse(), HotkeyEvent::Stop);
    }

    #[test]
    fn test_mode_change_resets_recording() {
        let mut state = HotkeyState::new(F1, ActivationMode::Toggle);
        assert_eq!(state.on_raw_event(down(F1)), Some(HotkeyEvent::Start));
        state.set_mode(ActivationMode::Toggle);
        state.key_down = false;
        assert_eq!(state.on_raw_event(down(F1)), Some(HotkeyEvent::Start));
    }
}
