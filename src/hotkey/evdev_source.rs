//! evdev-based key source
//!
//! Reads key transitions at the kernel level via /dev/input, which
//! works on every Wayland compositor because it bypasses the display
//! server entirely. The user must be in the 'input' group.
//!
//! All key transitions are forwarded raw; filtering for the configured
//! hotkey (and capture mode) happens in the coordinator's state
//! machine.

use super::{KeySource, RawKeyEvent};
use crate::error::HotkeyError;
use evdev::{Device, InputEventKind, Key};
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;
use tokio::sync::{mpsc, oneshot};

pub struct EvdevKeySource {
    stop_signal: Option<oneshot::Sender<()>>,
}

impl EvdevKeySource {
    pub fn new() -> Self {
        Self { stop_signal: None }
    }
}

impl Default for EvdevKeySource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl KeySource for EvdevKeySource {
    async fn start(&mut self, tx: mpsc::Sender<RawKeyEvent>) -> Result<(), HotkeyError> {
        let device_paths = find_keyboard_devices()?;
        if device_paths.is_empty() {
            return Err(HotkeyError::NoKeyboard);
        }

        tracing::debug!(
            "Found {} keyboard device(s): {:?}",
            device_paths.len(),
            device_paths
        );

        let (stop_tx, stop_rx) = oneshot::channel();
        self.stop_signal = Some(stop_tx);

        tokio::task::spawn_blocking(move || {
            listener_loop(device_paths, tx, stop_rx);
        });

        Ok(())
    }

    async fn stop(&mut self) {
        if let Some(stop) = self.stop_signal.take() {
            let _ = stop.send(());
        }
    }
}

/// Poll all keyboard devices and forward key transitions.
/// Runs in a blocking task.
fn listener_loop(
    device_paths: Vec<PathBuf>,
    tx: mpsc::Sender<RawKeyEvent>,
    mut stop_rx: oneshot::Receiver<()>,
) {
    // Open every keyboard in non-blocking mode so fetch_events never stalls
    let mut devices: Vec<Device> = device_paths
        .iter()
        .filter_map(|path| match Device::open(path) {
            Ok(device) => {
                let fd = device.as_raw_fd();
                unsafe {
                    let flags = libc::fcntl(fd, libc::F_GETFL);
                    if flags != -1 {
                        libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
                    }
                }
                tracing::debug!("Opened device (non-blocking): {:?}", path);
                Some(device)
            }
            Err(e) => {
                tracing::warn!("Failed to open {:?}: {}", path, e);
                None
            }
        })
        .collect();

    if devices.is_empty() {
        tracing::error!("No keyboard devices could be opened");
        return;
    }

    loop {
        match stop_rx.try_recv() {
            Ok(_) | Err(oneshot::error::TryRecvError::Closed) => {
                tracing::debug!("Key listener stopping");
                return;
            }
            Err(oneshot::error::TryRecvError::Empty) => {}
        }

        for device in &mut devices {
            if let Ok(events) = device.fetch_events() {
                for event in events {
                    if let InputEventKind::Key(key) = event.kind() {
                        let pressed = match event.value() {
                            1 => true,
                            0 => false,
                            // 2 = auto-repeat
                            _ => continue,
                        };
                        let raw = RawKeyEvent {
                            code: key.code(),
                            pressed,
                        };
                        if tx.blocking_send(raw).is_err() {
                            return;
                        }
                    }
                }
            }
        }

        // Avoid busy-waiting between polls
        std::thread::sleep(std::time::Duration::from_millis(5));
    }
}

/// Find all input devices that look like keyboards
fn find_keyboard_devices() -> Result<Vec<PathBuf>, HotkeyError> {
    let mut keyboards = Vec::new();

    let input_dir = std::fs::read_dir("/dev/input")
        .map_err(|e| HotkeyError::DeviceAccess(format!("/dev/input: {}", e)))?;

    for entry in input_dir {
        let entry = entry.map_err(|e| HotkeyError::DeviceAccess(e.to_string()))?;
        let path = entry.path();

        let is_event_device = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.starts_with("event"))
            .unwrap_or(false);

        if !is_event_device {
            continue;
        }

        match Device::open(&path) {
            Ok(device) => {
                // A keyboard should report letter keys and Enter
                let has_keys = device
                    .supported_keys()
                    .map(|keys| {
                        keys.contains(Key::KEY_A)
                            && keys.contains(Key::KEY_Z)
                            && keys.contains(Key::KEY_ENTER)
                    })
                    .unwrap_or(false);

                if has_keys {
                    tracing::debug!(
                        "Found keyboard: {:?} ({:?})",
                        path,
                        device.name().unwrap_or("unknown")
                    );
                    keyboards.push(path);
                }
            }
            Err(e) => {
                // Permission denied is the common case for users outside
                // the input group
                if e.kind() == std::io::ErrorKind::PermissionDenied {
                    return Err(HotkeyError::DeviceAccess(path.display().to_string()));
                }
                tracing::trace!("Skipping {:?}: {}", path, e);
            }
        }
    }

    Ok(keyboards)
}
