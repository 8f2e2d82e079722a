//! cpal-based chunked audio capture
//!
//! Records from the configured input device and emits fixed-length
//! WAV-encoded chunks while recording is in progress, so transcription
//! can start before the user releases the hotkey. Works with PipeWire,
//! PulseAudio, and ALSA backends.
//!
//! Note: cpal::Stream is not Send, so the capture runs in a dedicated
//! thread and communicates via channels.

use crate::config::AudioConfig;
use crate::error::AudioError;
use std::io::Cursor;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// Commands sent to the capture thread
enum CaptureCommand {
    /// Stop recording; replies with the final partial chunk, if any
    Stop(oneshot::Sender<Option<Vec<u8>>>),
}

/// Chunked audio capture
pub struct ChunkedCapture {
    config: AudioConfig,
    cmd_tx: Option<std::sync::mpsc::Sender<CaptureCommand>>,
    thread_handle: Option<thread::JoinHandle<()>>,
}

impl ChunkedCapture {
    pub fn new(config: &AudioConfig) -> Self {
        Self {
            config: config.clone(),
            cmd_tx: None,
            thread_handle: None,
        }
    }

    /// Start recording. WAV-encoded chunks of roughly `chunk_secs`
    /// arrive on the returned channel until `stop` is called.
    pub async fn start(&mut self) -> Result<mpsc::Receiver<Vec<u8>>, AudioError> {
        use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};

        let host = cpal::default_host();
        let device = if self.config.device == "default" {
            host.default_input_device()
                .ok_or_else(|| AudioError::DeviceNotFound("default".to_string()))?
        } else {
            find_audio_device(&host, &self.config.device)?
        };

        let device_name = device.name().unwrap_or_else(|_| "unknown".to_string());
        tracing::info!("Using audio device: {}", device_name);

        let supported_config = device
            .default_input_config()
            .map_err(|e| AudioError::Connection(e.to_string()))?;

        let source_rate = supported_config.sample_rate().0;
        let source_channels = supported_config.channels() as usize;
        let target_rate = self.config.sample_rate;
        let sample_format = supported_config.sample_format();

        tracing::debug!(
            "Device config: {} Hz, {} channel(s), format: {:?}",
            source_rate,
            source_channels,
            sample_format
        );

        let (chunk_tx, chunk_rx) = mpsc::channel::<Vec<u8>>(32);
        let (cmd_tx, cmd_rx) = std::sync::mpsc::channel::<CaptureCommand>();

        let samples = Arc::new(Mutex::new(Vec::<f32>::new()));
        let chunk_interval = Duration::from_secs_f32(self.config.chunk_secs.max(0.1));

        let thread_handle = thread::spawn(move || {
            let stream_config = cpal::StreamConfig {
                channels: supported_config.channels(),
                sample_rate: supported_config.sample_rate(),
                buffer_size: cpal::BufferSize::Default,
            };

            let err_fn = |err| tracing::error!("Audio stream error: {}", err);
            let sink = Arc::clone(&samples);

            let stream_result = match sample_format {
                cpal::SampleFormat::F32 => build_stream::<f32>(
                    &device,
                    &stream_config,
                    sink,
                    source_rate,
                    target_rate,
                    source_channels,
                    err_fn,
                ),
                cpal::SampleFormat::I16 => build_stream::<i16>(
                    &device,
                    &stream_config,
                    sink,
                    source_rate,
                    target_rate,
                    source_channels,
                    err_fn,
                ),
                cpal::SampleFormat::U16 => build_stream::<u16>(
                    &device,
                    &stream_config,
                    sink,
                    source_rate,
                    target_rate,
                    source_channels,
                    err_fn,
                ),
                format => {
                    tracing::error!("Unsupported sample format: {:?}", format);
                    return;
                }
            };

            let stream = match stream_result {
                Ok(s) => s,
                Err(e) => {
                    tracing::error!("Failed to build audio stream: {}", e);
                    return;
                }
            };

            if let Err(e) = stream.play() {
                tracing::error!("Failed to start audio stream: {}", e);
                return;
            }

            tracing::debug!("Audio capture thread started");

            loop {
                match cmd_rx.recv_timeout(chunk_interval) {
                    // Chunk boundary: flush whatever accumulated
                    Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                        let drained = drain_samples(&samples);
                        if drained.is_empty() {
                            continue;
                        }
                        let wav = encode_wav(&drained, target_rate);
                        if chunk_tx.blocking_send(wav).is_err() {
                            break;
                        }
                    }
                    Ok(CaptureCommand::Stop(reply)) => {
                        drop(stream);
                        let drained = drain_samples(&samples);
                        let final_chunk = if drained.is_empty() {
                            None
                        } else {
                            Some(encode_wav(&drained, target_rate))
                        };
                        let _ = reply.send(final_chunk);
                        return;
                    }
                    Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,
                }
            }

            tracing::debug!("Audio capture thread stopped");
        });

        self.cmd_tx = Some(cmd_tx);
        self.thread_handle = Some(thread_handle);

        Ok(chunk_rx)
    }

    /// Stop recording, returning the final partial chunk if any audio
    /// accumulated since the last boundary
    pub async fn stop(&mut self) -> Result<Option<Vec<u8>>, AudioError> {
        let final_chunk = if let Some(cmd_tx) = self.cmd_tx.take() {
            let (reply_tx, reply_rx) = oneshot::channel();
            if cmd_tx.send(CaptureCommand::Stop(reply_tx)).is_ok() {
                match tokio::time::timeout(Duration::from_secs(2), reply_rx).await {
                    Ok(Ok(chunk)) => chunk,
                    Ok(Err(_)) => {
                        return Err(AudioError::StreamError("capture thread gone".to_string()))
                    }
                    Err(_) => {
                        return Err(AudioError::StreamError(
                            "capture thread did not stop in time".to_string(),
                        ))
                    }
                }
            } else {
                None
            }
        } else {
            None
        };

        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }

        Ok(final_chunk)
    }
}

fn drain_samples(samples: &Arc<Mutex<Vec<f32>>>) -> Vec<f32> {
    match samples.lock() {
        Ok(mut guard) => std::mem::take(&mut *guard),
        Err(_) => Vec::new(),
    }
}

/// Find an input device by name: exact match first, then
/// case-insensitive, then substring
fn find_audio_device(host: &cpal::Host, device_name: &str) -> Result<cpal::Device, AudioError> {
    use cpal::traits::{DeviceTrait, HostTrait};

    let devices: Vec<cpal::Device> = host
        .input_devices()
        .map_err(|e| AudioError::Connection(e.to_string()))?
        .collect();

    let search_lower = device_name.to_lowercase();

    for exactness in 0..3 {
        for device in &devices {
            let Ok(name) = device.name() else { continue };
            let matched = match exactness {
                0 => name == device_name,
                1 => name.to_lowercase() == search_lower,
                _ => name.to_lowercase().contains(&search_lower),
            };
            if matched {
                tracing::debug!("Found audio device: {} (searched for: {})", name, device_name);
                return host
                    .input_devices()
                    .map_err(|e| AudioError::Connection(e.to_string()))?
                    .find(|d| d.name().map(|n| n == name).unwrap_or(false))
                    .ok_or_else(|| AudioError::DeviceNotFound(device_name.to_string()));
            }
        }
    }

    Err(AudioError::DeviceNotFound(device_name.to_string()))
}

/// Build an input stream that mixes to mono, resamples to the target
/// rate, and appends into the shared buffer
fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    samples: Arc<Mutex<Vec<f32>>>,
    source_rate: u32,
    target_rate: u32,
    source_channels: usize,
    err_fn: impl Fn(cpal::StreamError) + Send + 'static,
) -> Result<cpal::Stream, AudioError>
where
    T: cpal::Sample + cpal::SizedSample + Send + 'static,
    f32: cpal::FromSample<T>,
{
    use cpal::traits::DeviceTrait;

    let stream = device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                let mono_f32: Vec<f32> = data
                    .chunks(source_channels)
                    .map(|frame| {
                        let sum: f32 = frame
                            .iter()
                            .map(|&s| <f32 as cpal::FromSample<T>>::from_sample_(s))
                            .sum();
                        sum / source_channels as f32
                    })
                    .collect();

                let resampled = if source_rate != target_rate {
                    resample(&mono_f32, source_rate, target_rate)
                } else {
                    mono_f32
                };

                if let Ok(mut guard) = samples.lock() {
                    guard.extend_from_slice(&resampled);
                }
            },
            err_fn,
            None,
        )
        .map_err(|e| AudioError::StreamError(e.to_string()))?;

    Ok(stream)
}

/// Linear interpolation resampling
fn resample(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || samples.is_empty() {
        return samples.to_vec();
    }

    let ratio = to_rate as f64 / from_rate as f64;
    let new_len = (samples.len() as f64 * ratio).ceil() as usize;
    let mut output = Vec::with_capacity(new_len);

    for i in 0..new_len {
        let src_idx = i as f64 / ratio;
        let idx = src_idx.floor() as usize;
        let frac = (src_idx - idx as f64) as f32;

        let sample = if idx + 1 < samples.len() {
            samples[idx] * (1.0 - frac) + samples[idx + 1] * frac
        } else {
            samples.get(idx).copied().unwrap_or(0.0)
        };

        output.push(sample);
    }

    output
}

/// Encode f32 samples as a 16-bit mono WAV file in memory
pub fn encode_wav(samples: &[f32], sample_rate: u32) -> Vec<u8> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = Cursor::new(Vec::new());
    {
        // Writing to an in-memory cursor cannot fail
        let mut writer = hound::WavWriter::new(&mut cursor, spec).expect("in-memory wav writer");
        for &sample in samples {
            let clamped = sample.clamp(-1.0, 1.0);
            let value = (clamped * i16::MAX as f32) as i16;
            let _ = writer.write_sample(value);
        }
        let _ = writer.finalize();
    }
    cursor.into_inner()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resample_same_rate() {
        let samples = vec![1.0, 2.0, 3.0, 4.0];
        assert_eq!(resample(&samples, 16000, 16000), samples);
    }

    #[test]
    fn test_resample_downsample() {
        let samples = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0];
        let result = resample(&samples, 48000, 16000);
        assert!(result.len() >= 2 && result.len() <= 4);
    }

    #[test]
    fn test_resample_upsample() {
        let samples = vec![1.0, 2.0];
        assert_eq!(resample(&samples, 8000, 16000).len(), 4);
    }

    #[test]
    fn test_resample_empty() {
        assert!(resample(&[], 48000, 16000).is_empty());
    }

    #[test]
    fn test_encode_wav_is_readable() {
        let samples = vec![0.0_f32, 0.5, -0.5, 1.0, -1.0];
        let bytes = encode_wav(&samples, 16000);

        let mut reader = hound::WavReader::new(Cursor::new(bytes)).unwrap();
        let spec = reader.spec();
        assert_eq!(spec.channels, 1);
        assert_eq!(spec.sample_rate, 16000);
        assert_eq!(spec.bits_per_sample, 16);

        let decoded: Vec<i16> = reader.samples::<i16>().map(|s| s.unwrap()).collect();
        assert_eq!(decoded.len(), samples.len());
        assert_eq!(decoded[0], 0);
        assert_eq!(decoded[3], i16::MAX);
    }

    #[test]
    fn test_encode_wav_clamps_out_of_range() {
        let bytes = encode_wav(&[2.0, -2.0], 16000);
        let mut reader = hound::WavReader::new(Cursor::new(bytes)).unwrap();
        let decoded: Vec<i16> = reader.samples::<i16>().map(|s| s.unwrap()).collect();
        assert_eq!(decoded[0], i16::MAX);
        assert_eq!(decoded[1], -i16::MAX);
    }
}
