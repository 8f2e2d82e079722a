//! sherpa-onnx (Parakeet TDT) backend
//!
//! Invokes the sherpa-onnx-offline binary against a NeMo transducer
//! model. The transducer writes its JSON result to stderr rather than
//! stdout, so output parsing scans both streams.
//!
//! When GPU use is enabled the adapter tries the CUDA provider first
//! and retries on CPU only if the CUDA process crashes (non-zero exit
//! or launch failure). A clean run with empty text is a final answer,
//! not a reason to retry.

use super::{EngineAdapter, TranscriptionResult};
use crate::config::{Config, ParakeetEngineConfig};
use crate::error::EngineError;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

/// Model files required by the transducer, checked before every run
const MODEL_FILES: [(&str, &str); 4] = [
    ("encoder", "encoder.int8.onnx"),
    ("decoder", "decoder.int8.onnx"),
    ("joiner", "joiner.int8.onnx"),
    ("tokens", "tokens.txt"),
];

/// Adapter for the sherpa-onnx-offline binary
pub struct ParakeetEngine {
    config: ParakeetEngineConfig,
    chunk_index: AtomicI64,
    in_flight: Mutex<Option<i32>>,
}

impl ParakeetEngine {
    pub fn new(config: &ParakeetEngineConfig) -> Self {
        Self {
            config: config.clone(),
            chunk_index: AtomicI64::new(0),
            in_flight: Mutex::new(None),
        }
    }

    fn resolve_binary(&self) -> Result<PathBuf, EngineError> {
        if let Some(ref configured) = self.config.binary {
            let path = PathBuf::from(configured);
            if path.exists() {
                return Ok(path);
            }
            return Err(EngineError::BinaryNotFound(path));
        }

        which::which("sherpa-onnx-offline")
            .ok()
            .filter(|path| path.exists())
            .ok_or_else(|| EngineError::BinaryNotFound(PathBuf::from("sherpa-onnx-offline")))
    }

    fn model_dir(&self) -> PathBuf {
        self.config
            .model_dir
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| Config::models_dir().join("parakeet"))
    }

    fn check_model_files(&self) -> Result<(), EngineError> {
        let dir = self.model_dir();
        for (name, file) in MODEL_FILES {
            let path = dir.join(file);
            if !path.exists() {
                return Err(EngineError::ModelFileNotFound {
                    name: name.to_string(),
                    path,
                });
            }
        }
        Ok(())
    }

    fn providers(&self) -> Vec<&'static str> {
        if self.config.use_gpu {
            vec!["cuda", "cpu"]
        } else {
            vec!["cpu"]
        }
    }
}

#[async_trait::async_trait]
impl EngineAdapter for ParakeetEngine {
    async fn transcribe(&self, audio_path: &Path) -> Result<TranscriptionResult, EngineError> {
        let binary = self.resolve_binary()?;
        self.check_model_files()?;

        let dir = self.model_dir();
        let timestamp = chrono::Utc::now();
        let prepared = super::prepare_audio(audio_path).await;

        let base_args = vec![
            format!("--encoder={}", dir.join("encoder.int8.onnx").display()),
            format!("--decoder={}", dir.join("decoder.int8.onnx").display()),
            format!("--joiner={}", dir.join("joiner.int8.onnx").display()),
            format!("--tokens={}", dir.join("tokens.txt").display()),
            "--model-type=nemo_transducer".to_string(),
        ];

        // Shared libraries live next to the binary in the upstream
        // release tarballs
        let envs = match binary.parent() {
            Some(parent) => {
                let existing = std::env::var("LD_LIBRARY_PATH").unwrap_or_default();
                vec![(
                    "LD_LIBRARY_PATH".to_string(),
                    format!("{}:{}", parent.display(), existing),
                )]
            }
            None => vec![],
        };

        let providers = self.providers();
        let mut last_err = None;

        for (attempt, provider) in providers.iter().enumerate() {
            let mut args = base_args.clone();
            args.push(format!("--provider={}", provider));
            args.push(prepared.path().display().to_string());

            tracing::debug!("Running parakeet backend (provider={})", provider);

            match super::run_backend(&binary, &args, &envs, &self.in_flight).await {
                Ok(output) => {
                    let text = parse_output(&output.stdout, &output.stderr);
                    return Ok(TranscriptionResult {
                        text,
                        partial: true,
                        timestamp,
                        chunk_index: self.chunk_index.fetch_add(1, Ordering::SeqCst),
                    });
                }
                Err(e) => {
                    if attempt + 1 < providers.len() {
                        tracing::warn!(
                            "Parakeet provider '{}' failed ({}), falling back",
                            provider,
                            e
                        );
                    }
                    last_err = Some(e);
                }
            }
        }

        Err(last_err.unwrap_or_else(|| EngineError::Launch("no provider attempted".to_string())))
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
        self.check_model_files().is_ok()
    }

    fn label(&self) -> String {
        "parakeet".to_string()
    }
}

/// Extract transcription text from the captured streams.
///
/// The transducer emits a JSON record with a "text" field; depending on
/// the build it lands on stdout or stderr, so both are scanned, primary
/// stream first. Older plain-text builds are handled by filtering the
/// diagnostic lines out of stdout.
fn parse_output(stdout: &str, stderr: &str) -> String {
    for raw in [stdout, stderr] {
        for line in raw.lines() {
            let trimmed = line.trim();
            if !trimmed.starts_with('{') {
                continue;
            }
            if let Ok(value) = serde_json::from_str::<serde_json::Value>(trimmed) {
                if let Some(text) = value.get("text").and_then(|t| t.as_str()) {
                    if !text.trim().is_empty() {
                        return text.trim().to_string();
                    }
                }
            }
        }
    }

    // Plain-text fallback: keep only lines that look like transcription
    let kept: Vec<&str> = stdout
        .lines()
        .map(str::trim)
        .filter(|line| {
            !line.is_empty()
                && !line.starts_with('/')
                && !line.starts_with("Duration")
                && !line.starts_with("Wave")
                && !line.starts_with("num_")
                && !line.starts_with("decoding")
                && !line.starts_with("Elapsed")
                && !line.starts_with("Real time")
        })
        .collect();

    super::collapse_whitespace(&kept.join(" "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path
    }

    fn model_dir(dir: &Path) -> PathBuf {
        let models = dir.join("parakeet");
        std::fs::create_dir_all(&models).unwrap();
        for (_, file) in MODEL_FILES {
            std::fs::write(models.join(file), b"").unwrap();
        }
        models
    }

    fn wav_file(dir: &Path) -> PathBuf {
        let path = dir.join("chunk_0000.wav");
        std::fs::write(&path, b"fake audio").unwrap();
        path
    }

    #[test]
    fn test_parse_output_json_on_stderr() {
        let stderr = "some log line\n{\"text\": \" hello world \", \"tokens\": []}\n";
        assert_eq!(parse_output("", stderr), "hello world");
    }

    #[test]
    fn test_parse_output_prefers_stdout() {
        let stdout = "{\"text\": \"from stdout\"}";
        let stderr = "{\"text\": \"from stderr\"}";
        assert_eq!(parse_output(stdout, stderr), "from stdout");
    }

    #[test]
    fn test_parse_output_plain_text_fallback() {
        let stdout = "/tmp/chunk.wav\nDuration: 2.00s\nhello there\nElapsed: 0.5s\nReal time factor: 0.25\n";
        assert_eq!(parse_output(stdout, ""), "hello there");
    }

    #[test]
    fn test_parse_output_empty() {
        assert_eq!(parse_output("", ""), "");
    }

    #[tokio::test]
    async fn test_missing_model_file_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let binary = write_script(dir.path(), "fake-sherpa", "echo '{\"text\": \"hi\"}'");
        let models = dir.path().join("parakeet");
        std::fs::create_dir_all(&models).unwrap();
        // Only the encoder present; decoder and friends missing
        std::fs::write(models.join("encoder.int8.onnx"), b"").unwrap();

        let engine = ParakeetEngine::new(&ParakeetEngineConfig {
            binary: Some(binary.display().to_string()),
            model_dir: Some(models.display().to_string()),
            use_gpu: false,
        });

        let err = engine.transcribe(&wav_file(dir.path())).await.unwrap_err();
        match err {
            EngineError::ModelFileNotFound { name, path } => {
                assert_eq!(name, "decoder");
                assert!(path.ends_with("decoder.int8.onnx"));
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn test_gpu_crash_falls_back_to_cpu() {
        let dir = tempfile::tempdir().unwrap();
        let models = model_dir(dir.path());
        // Crash on the cuda provider, answer on cpu
        let binary = write_script(
            dir.path(),
            "fake-sherpa",
            r#"case "$*" in
  *provider=cuda*) exit 7 ;;
esac
echo '{"text": "hello from cpu"}'"#,
        );

        let engine = ParakeetEngine::new(&ParakeetEngineConfig {
            binary: Some(binary.display().to_string()),
            model_dir: Some(models.display().to_string()),
            use_gpu: true,
        });

        let result = engine.transcribe(&wav_file(dir.path())).await.unwrap();
        assert_eq!(result.text, "hello from cpu");
    }

    #[tokio::test]
    async fn test_empty_text_does_not_trigger_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let models = model_dir(dir.path());
        let counter = dir.path().join("invocations");
        // Exit cleanly with no text; count each invocation
        let binary = write_script(
            dir.path(),
            "fake-sherpa",
            &format!("echo x >> {}\nexit 0", counter.display()),
        );

        let engine = ParakeetEngine::new(&ParakeetEngineConfig {
            binary: Some(binary.display().to_string()),
            model_dir: Some(models.display().to_string()),
            use_gpu: true,
        });

        let result = engine.transcribe(&wav_file(dir.path())).await.unwrap();
        assert_eq!(result.text, "");

        let invocations = std::fs::read_to_string(&counter).unwrap();
        assert_eq!(invocations.lines().count(), 1, "cpu retry must not happen");
    }

    #[tokio::test]
    async fn test_all_providers_fail_surfaces_last_error() {
        let dir = tempfile::tempdir().unwrap();
        let models = model_dir(dir.path());
        let binary = write_script(
            dir.path(),
            "fake-sherpa",
            r#"case "$*" in
  *provider=cuda*) echo 'cuda oom' >&2; exit 2 ;;
  *provider=cpu*) echo 'cpu broken' >&2; exit 5 ;;
esac"#,
        );

        let engine = ParakeetEngine::new(&ParakeetEngineConfig {
            binary: Some(binary.display().to_string()),
            model_dir: Some(models.display().to_string()),
            use_gpu: true,
        });

        let err = engine.transcribe(&wav_file(dir.path())).await.unwrap_err();
        match err {
            EngineError::Execution { code, stderr } => {
                assert_eq!(code, 5);
                assert!(stderr.contains("cpu broken"));
            }
            other => panic!("unexpected error: {}", other),
        }
    }
}
