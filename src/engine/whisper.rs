//! whisper.cpp CLI backend
//!
//! Invokes the whisper-cli binary (from whisper.cpp) per audio chunk
//! and cleans its plain-text output. The binary must be installed
//! separately or built from whisper.cpp.

use super::{EngineAdapter, TranscriptionResult};
use crate::config::{Config, WhisperEngineConfig};
use crate::error::EngineError;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

/// Adapter for the whisper.cpp CLI binary
pub struct WhisperEngine {
    config: WhisperEngineConfig,
    /// Zero-based chunk counter, reset at session start
    chunk_index: AtomicI64,
    /// Pid of the in-flight backend process
    in_flight: Mutex<Option<i32>>,
    /// Matches bracketed timestamp annotations like [00:00:00.000 --> 00:00:02.000]
    timestamp_re: Regex,
}

impl WhisperEngine {
    pub fn new(config: &WhisperEngineConfig) -> Self {
        Self {
            config: config.clone(),
            chunk_index: AtomicI64::new(0),
            in_flight: Mutex::new(None),
            timestamp_re: Regex::new(r"\[.*?\]").expect("static regex"),
        }
    }

    /// Strip timestamp annotations and normalize whitespace
    fn clean_output(&self, text: &str) -> String {
        let stripped = self.timestamp_re.replace_all(text, "");
        super::collapse_whitespace(&stripped)
    }

    fn resolve_binary(&self) -> Result<PathBuf, EngineError> {
        if let Some(ref configured) = self.config.binary {
            let path = PathBuf::from(configured);
            if path.exists() {
                return Ok(path);
            }
            return Err(EngineError::BinaryNotFound(path));
        }

        let candidates = [
            which::which("whisper-cli").ok(),
            which::which("whisper-cpp").ok(),
            which::which("whisper").ok(),
            Some(PathBuf::from("/usr/local/bin/whisper-cli")),
            Some(PathBuf::from("/usr/bin/whisper-cli")),
        ];

        candidates
            .into_iter()
            .flatten()
            .find(|path| path.exists())
            .ok_or_else(|| EngineError::BinaryNotFound(PathBuf::from("whisper-cli")))
    }

    fn resolve_model(&self) -> Result<PathBuf, EngineError> {
        let model = &self.config.model;

        // Absolute paths are used directly
        let direct = PathBuf::from(model);
        if direct.is_absolute() {
            if direct.exists() {
                return Ok(direct);
            }
            return Err(EngineError::ModelFileNotFound {
                name: model.clone(),
                path: direct,
            });
        }

        // Model names map to ggml files in the models directory; quantized
        // and versioned variants are accepted too.
        let models_dir = Config::models_dir();
        let variants = [
            format!("ggml-{}.bin", model),
            format!("ggml-{}-v3.bin", model),
            format!("ggml-{}-v2.bin", model),
            format!("ggml-{}-q8_0.bin", model),
            format!("ggml-{}-q5_0.bin", model),
        ];

        for variant in &variants {
            let path = models_dir.join(variant);
            if path.exists() {
                return Ok(path);
            }
        }

        Err(EngineError::ModelFileNotFound {
            name: model.clone(),
            path: models_dir.join(format!("ggml-{}.bin", model)),
        })
    }

    fn threads(&self) -> usize {
        match self.config.threads {
            Some(0) | None => num_cpus::get().min(4),
            Some(n) => n,
        }
    }
}

#[async_trait::async_trait]
impl EngineAdapter for WhisperEngine {
    async fn transcribe(&self, audio_path: &Path) -> Result<TranscriptionResult, EngineError> {
        let binary = self.resolve_binary()?;
        let model = self.resolve_model()?;
        let timestamp = chrono::Utc::now();

        let prepared = super::prepare_audio(audio_path).await;

        let mut args = vec![
            "-m".to_string(),
            model.display().to_string(),
            "-f".to_string(),
            prepared.path().display().to_string(),
            "-nt".to_string(),
            "-t".to_string(),
            self.threads().to_string(),
        ];
        if self.config.language != "auto" {
            args.push("-l".to_string());
            args.push(self.config.language.clone());
        }

        tracing::debug!("Running whisper backend: {:?} {:?}", binary, args);
        let start = std::time::Instant::now();

        let output = super::run_backend(&binary, &args, &[], &self.in_flight).await?;
        let text = self.clean_output(&output.stdout);

        tracing::debug!(
            "Whisper chunk transcribed in {:.2}s ({} chars)",
            start.elapsed().as_secs_f32(),
            text.len()
        );

        Ok(TranscriptionResult {
            text,
            partial: true,
            timestamp,
            chunk_index: self.chunk_index.fetch_add(1, Ordering::SeqCst),
        })
    }

    fn abort(&self) {
        super::abort_in_flight(&self.in_flight);
    }

    fn reset_session(&self) {
        self.chunk_index.store(0, Ordering::SeqCst);
    }

    fn is_available(&self) -> bool {
        self.resolve_binary().is_ok()
    }

    fn is_model_installed(&self) -> bool {
        self.resolve_model().is_ok()
    }

    fn label(&self) -> String {
        format!("whisper/{}", self.config.model)
    }
}
