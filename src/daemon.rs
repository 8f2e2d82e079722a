//! Daemon event loop
//!
//! Wires the hotkey coordinator, chunked audio capture, session
//! manager, and output dispatcher together. The loop reacts to hotkey
//! start/stop events, pumps audio chunks into the session as they
//! arrive, and enforces the maximum recording duration.

use crate::audio::ChunkedCapture;
use crate::config::Config;
use crate::engine;
use crate::error::Result;
use crate::history::{HistoryStore, SqliteHistory};
use crate::hotkey::{evdev_source::EvdevKeySource, HotkeyCoordinator, HotkeyEvent};
use crate::output::{OutputDispatcher, OutputSink};
use crate::session::{SessionEvent, SessionManager};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;

/// Write state to file for external integrations (e.g., Waybar)
fn write_state_file(path: &PathBuf, state: &str) {
    if let Some(parent) = path.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            tracing::warn!("Failed to create state file directory: {}", e);
            return;
        }
    }

    if let Err(e) = std::fs::write(path, state) {
        tracing::warn!("Failed to write state file: {}", e);
    } else {
        tracing::trace!("State file updated: {}", state);
    }
}

fn cleanup_state_file(path: &PathBuf) {
    if path.exists() {
        if let Err(e) = std::fs::remove_file(path) {
            tracing::warn!("Failed to remove state file: {}", e);
        }
    }
}

/// Write PID file so scripts can signal the daemon (SIGUSR1 toggle)
fn write_pid_file() -> Option<PathBuf> {
    let pid_path = Config::runtime_dir().join("pid");

    if let Some(parent) = pid_path.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            tracing::warn!("Failed to create PID file directory: {}", e);
            return None;
        }
    }

    let pid = std::process::id();
    if let Err(e) = std::fs::write(&pid_path, pid.to_string()) {
        tracing::warn!("Failed to write PID file: {}", e);
        return None;
    }

    tracing::debug!("PID file written: {:?} (pid={})", pid_path, pid);
    Some(pid_path)
}

fn cleanup_pid_file(path: &PathBuf) {
    if path.exists() {
        if let Err(e) = std::fs::remove_file(path) {
            tracing::warn!("Failed to remove PID file: {}", e);
        }
    }
}

/// Main daemon that orchestrates all components
pub struct Daemon {
    config: Config,
    config_path: Option<PathBuf>,
    state_file_path: Option<PathBuf>,
    pid_file_path: Option<PathBuf>,
}

impl Daemon {
    pub fn new(config: Config, config_path: Option<PathBuf>) -> Self {
        let state_file_path = config.resolve_state_file();
        Self {
            config,
            config_path,
            state_file_path,
            pid_file_path: None,
        }
    }

    fn update_state(&self, state_name: &str) {
        if let Some(ref path) = self.state_file_path {
            write_state_file(path, state_name);
        }
    }

    /// Run the daemon main loop
    pub async fn run(&mut self) -> Result<()> {
        tracing::info!("Starting taptype daemon");

        self.pid_file_path = write_pid_file();

        let mut sigterm = signal(SignalKind::terminate())
            .map_err(|e| crate::error::TaptypeError::Config(format!("SIGTERM handler: {}", e)))?;
        let mut sigint = signal(SignalKind::interrupt())
            .map_err(|e| crate::error::TaptypeError::Config(format!("SIGINT handler: {}", e)))?;

        Config::ensure_directories().map_err(|e| {
            crate::error::TaptypeError::Config(format!("Failed to create directories: {}", e))
        })?;

        if let Some(ref path) = self.state_file_path {
            tracing::info!("State file: {:?}", path);
        }

        // History store, only when enabled
        let history: Option<Arc<dyn HistoryStore>> = if self.config.output.save_history {
            let path = self.config.resolve_history_path();
            match SqliteHistory::open(&path, self.config.history.max_entries) {
                Ok(store) => {
                    tracing::info!("History enabled: {:?}", path);
                    Some(Arc::new(store))
                }
                Err(e) => {
                    tracing::warn!("History disabled, failed to open {:?}: {}", path, e);
                    None
                }
            }
        } else {
            None
        };

        // Session pipeline
        let (session_tx, mut session_rx) = mpsc::channel::<SessionEvent>(64);
        let engine_config = self.config.engine.clone();
        let session = SessionManager::new(
            Box::new(move || engine::create_engine(&engine_config)),
            Arc::new(OutputDispatcher::new(&self.config.output)) as Arc<dyn OutputSink>,
            history,
            session_tx,
            Config::temp_root(),
        );

        {
            let probe = engine::create_engine(&self.config.engine);
            if !probe.is_available() {
                tracing::warn!("Backend for {} not found, recording will fail", probe.label());
            } else if !probe.is_model_installed() {
                tracing::warn!("Model for {} not installed, recording will fail", probe.label());
            }
        }

        // Hotkey coordinator
        let (hotkey_tx, mut hotkey_rx) = mpsc::channel::<HotkeyEvent>(32);
        let mut coordinator = HotkeyCoordinator::new(
            &self.config.hotkey.key,
            self.config.hotkey.mode,
            hotkey_tx,
            self.config_path.clone(),
        )?;
        coordinator.start(Box::new(EvdevKeySource::new())).await?;

        tracing::info!(
            "Listening for hotkey: {} ({:?} mode)",
            self.config.hotkey.key,
            self.config.hotkey.mode
        );

        let max_duration = Duration::from_secs(self.config.audio.max_duration_secs as u64);
        let mut capture: Option<ChunkedCapture> = None;
        let mut chunk_rx: Option<mpsc::Receiver<Vec<u8>>> = None;
        let mut recording_deadline: Option<tokio::time::Instant> = None;

        self.update_state("idle");

        loop {
            tokio::select! {
                Some(event) = hotkey_rx.recv() => match event {
                    HotkeyEvent::Start => {
                        if capture.is_some() {
                            tracing::debug!("Already recording, ignoring start");
                            continue;
                        }
                        match self.start_recording(&session).await {
                            Ok((new_capture, rx)) => {
                                capture = Some(new_capture);
                                chunk_rx = Some(rx);
                                recording_deadline =
                                    Some(tokio::time::Instant::now() + max_duration);
                            }
                            Err(e) => {
                                tracing::error!("Failed to start recording: {}", e);
                                session.abort_session();
                            }
                        }
                    }
                    HotkeyEvent::Stop => {
                        if capture.is_none() {
                            tracing::debug!("Not recording, ignoring stop");
                            continue;
                        }
                        recording_deadline = None;
                        self.stop_recording(&session, &mut capture, &mut chunk_rx).await;
                    }
                    HotkeyEvent::Captured(name) => {
                        tracing::info!("Captured key: {}", name);
                        if let Err(e) = coordinator.update_hotkey(&name) {
                            tracing::warn!("Failed to apply captured key: {}", e);
                        }
                    }
                    HotkeyEvent::ModeChanged(mode) => {
                        tracing::info!("Activation mode changed to {:?}", mode);
                    }
                    HotkeyEvent::Error(e) => {
                        tracing::error!("Hotkey listener error: {}", e);
                    }
                },

                Some(wav) = recv_chunk(&mut chunk_rx) => {
                    if let Err(e) = session.process_audio_chunk(&wav) {
                        tracing::error!("Failed to enqueue audio chunk: {}", e);
                    }
                }

                Some(event) = session_rx.recv() => match event {
                    SessionEvent::Partial(result) => {
                        tracing::debug!(
                            "Partial [{}]: {:?}",
                            result.chunk_index,
                            result.text
                        );
                    }
                    SessionEvent::Final(result) => {
                        tracing::info!("Transcribed: {:?}", result.text);
                    }
                    SessionEvent::Error(e) => {
                        tracing::error!("Session error: {}", e);
                    }
                },

                _ = sleep_until_deadline(recording_deadline) => {
                    tracing::warn!(
                        "Maximum recording duration reached ({}s), stopping",
                        self.config.audio.max_duration_secs
                    );
                    recording_deadline = None;
                    self.stop_recording(&session, &mut capture, &mut chunk_rx).await;
                }

                _ = sigterm.recv() => {
                    tracing::info!("Received SIGTERM, shutting down");
                    break;
                }

                _ = sigint.recv() => {
                    tracing::info!("Received SIGINT, shutting down");
                    break;
                }
            }
        }

        // Shutdown: abandon any in-progress session
        if let Some(mut active) = capture.take() {
            let _ = active.stop().await;
        }
        session.abort_session();
        coordinator.stop();

        if let Some(ref path) = self.state_file_path {
            cleanup_state_file(path);
        }
        if let Some(ref path) = self.pid_file_path {
            cleanup_pid_file(path);
        }

        tracing::info!("Daemon stopped");
        Ok(())
    }

    async fn start_recording(
        &self,
        session: &SessionManager,
    ) -> Result<(ChunkedCapture, mpsc::Receiver<Vec<u8>>)> {
        session.start_session()?;

        let mut capture = ChunkedCapture::new(&self.config.audio);
        let rx = match capture.start().await {
            Ok(rx) => rx,
            Err(e) => {
                session.abort_session();
                return Err(e.into());
            }
        };

        tracing::info!("Recording started");
        self.update_state("recording");
        Ok((capture, rx))
    }

    async fn stop_recording(
        &self,
        session: &SessionManager,
        capture: &mut Option<ChunkedCapture>,
        chunk_rx: &mut Option<mpsc::Receiver<Vec<u8>>>,
    ) {
        tracing::info!("Recording stopped");
        self.update_state("transcribing");

        if let Some(mut active) = capture.take() {
            match active.stop().await {
                Ok(final_chunk) => {
                    // Deliver any chunks still sitting in the channel,
                    // then the trailing partial chunk
                    if let Some(mut rx) = chunk_rx.take() {
                        while let Ok(wav) = rx.try_recv() {
                            if let Err(e) = session.process_audio_chunk(&wav) {
                                tracing::error!("Failed to enqueue audio chunk: {}", e);
                            }
                        }
                    }
                    if let Some(wav) = final_chunk {
                        if let Err(e) = session.process_audio_chunk(&wav) {
                            tracing::error!("Failed to enqueue final chunk: {}", e);
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!("Recording error: {}", e);
                    *chunk_rx = None;
                }
            }
        }

        match session.end_session().await {
            Ok(Some(done)) if done.text.is_empty() => {
                tracing::debug!("Transcription was empty");
            }
            Ok(_) => {}
            Err(e) => {
                tracing::error!("Failed to finish session: {}", e);
            }
        }

        self.update_state("idle");
    }
}

/// Receive from an optional channel, pending forever when absent
async fn recv_chunk(chunk_rx: &mut Option<mpsc::Receiver<Vec<u8>>>) -> Option<Vec<u8>> {
    match chunk_rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Sleep until the deadline, pending forever when absent
async fn sleep_until_deadline(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
