//! Microphone capture.
//!
//! [`MicrophoneSource`] is the platform capability the coordinator consumes.
//! [`CpalMicrophone`] implements it with cpal: the input device is opened on a
//! dedicated thread (cpal streams are not `Send` on every platform) and kept
//! open until the returned stream's track is stopped or its consumer goes
//! away. Audio is delivered as mono chunks at the configured rate.

use crate::config::AudioConfig;
use crate::error::{Result, VoiceError};
use crate::media::{AudioChunk, MediaStream};
use async_trait::async_trait;
use cpal::StreamConfig;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// How often the capture thread checks whether it should release the device.
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Platform capability: request an audio-only local media stream.
#[async_trait]
pub trait MicrophoneSource: Send + Sync {
    /// Acquire the microphone.
    ///
    /// # Errors
    ///
    /// Returns [`VoiceError::Capture`] when the device is denied or unavailable.
    async fn acquire(&self) -> Result<MediaStream>;
}

/// Microphone capture via cpal.
pub struct CpalMicrophone {
    config: AudioConfig,
}

impl CpalMicrophone {
    pub fn new(config: &AudioConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }

    /// List available input devices.
    ///
    /// # Errors
    ///
    /// Returns an error if devices cannot be enumerated.
    pub fn list_input_devices() -> Result<Vec<String>> {
        let host = cpal::default_host();
        let devices = host
            .input_devices()
            .map_err(|e| VoiceError::Capture(format!("cannot enumerate devices: {e}")))?;

        let mut names = Vec::new();
        for device in devices {
            if let Ok(desc) = device.description() {
                names.push(desc.name().to_owned());
            }
        }
        Ok(names)
    }
}

#[async_trait]
impl MicrophoneSource for CpalMicrophone {
    async fn acquire(&self) -> Result<MediaStream> {
        let stream_id = format!("mic-{}", uuid::Uuid::new_v4());
        let (stream, tx) =
            MediaStream::audio_channel(stream_id.clone(), self.config.capture_queue_chunks);
        let stopped = stream.stopped();
        let (ready_tx, ready_rx) = oneshot::channel();
        let config = self.config.clone();

        std::thread::Builder::new()
            .name("mic-capture".to_owned())
            .spawn(move || run_capture(&config, tx, stopped, ready_tx))
            .map_err(|e| VoiceError::Capture(format!("failed to spawn capture thread: {e}")))?;

        match ready_rx.await {
            Ok(Ok(())) => {
                info!(stream_id = %stream_id, "microphone acquired");
                Ok(stream)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(VoiceError::Capture(
                "capture thread exited before opening the device".into(),
            )),
        }
    }
}

/// Body of the capture thread: open the device, report readiness, then hold
/// the stream until stopped.
fn run_capture(
    config: &AudioConfig,
    tx: mpsc::Sender<AudioChunk>,
    stopped: CancellationToken,
    ready: oneshot::Sender<Result<()>>,
) {
    let watch_tx = tx.clone();
    let stream = match open_input(config, tx) {
        Ok(stream) => stream,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };

    if ready.send(Ok(())).is_err() {
        // Caller gave up waiting; release the device straight away.
        return;
    }

    while !stopped.is_cancelled() && !watch_tx.is_closed() {
        std::thread::sleep(STOP_POLL_INTERVAL);
    }

    drop(stream);
    info!("audio capture stopped");
}

fn select_input_device(config: &AudioConfig) -> Result<cpal::Device> {
    let host = cpal::default_host();
    if let Some(ref name) = config.input_device {
        host.input_devices()
            .map_err(|e| VoiceError::Capture(format!("cannot enumerate devices: {e}")))?
            .find(|d| {
                d.description()
                    .ok()
                    .map(|desc| desc.name() == name)
                    .unwrap_or(false)
            })
            .ok_or_else(|| VoiceError::Capture(format!("input device '{name}' not found")))
    } else {
        host.default_input_device()
            .ok_or_else(|| VoiceError::Capture("no default input device".into()))
    }
}

fn open_input(config: &AudioConfig, tx: mpsc::Sender<AudioChunk>) -> Result<cpal::Stream> {
    let device = select_input_device(config)?;
    let device_name = device
        .description()
        .map(|d| d.name().to_owned())
        .unwrap_or_else(|_| "<unknown>".into());
    info!("using input device: {device_name}");

    let default_config = device
        .default_input_config()
        .map_err(|e| VoiceError::Capture(format!("no default input config: {e}")))?;

    let native_rate = default_config.sample_rate();
    let native_channels = default_config.channels();
    let target_rate = config.input_sample_rate;

    let stream_config = StreamConfig {
        channels: native_channels,
        sample_rate: native_rate,
        buffer_size: cpal::BufferSize::Default,
    };

    let stream = device
        .build_input_stream(
            &stream_config,
            move |data: &[f32], _info: &cpal::InputCallbackInfo| {
                let mono = if native_channels > 1 {
                    to_mono(data, native_channels)
                } else {
                    data.to_vec()
                };
                let samples = resample(&mono, native_rate, target_rate);
                let chunk = AudioChunk {
                    samples,
                    sample_rate: target_rate,
                    captured_at: Instant::now(),
                };
                // Never block the audio thread.
                if tx.try_send(chunk).is_err() {
                    debug!("capture channel full, dropping chunk");
                }
            },
            move |err| {
                error!("audio input stream error: {err}");
            },
            None,
        )
        .map_err(|e| VoiceError::Capture(format!("failed to build input stream: {e}")))?;

    stream
        .play()
        .map_err(|e| VoiceError::Capture(format!("failed to start input stream: {e}")))?;

    info!(
        "audio capture started: native {}Hz x{} -> {}Hz mono",
        native_rate, native_channels, target_rate
    );
    Ok(stream)
}

/// Convert interleaved multi-channel audio to mono by averaging channels.
fn to_mono(data: &[f32], channels: u16) -> Vec<f32> {
    let ch = channels as usize;
    data.chunks_exact(ch)
        .map(|frame| frame.iter().sum::<f32>() / ch as f32)
        .collect()
}

/// Linear-interpolation resampler. Adequate for speech.
pub(crate) fn resample(samples: &[f32], src_rate: u32, dst_rate: u32) -> Vec<f32> {
    if src_rate == dst_rate || samples.is_empty() || dst_rate == 0 {
        return samples.to_vec();
    }

    let ratio = src_rate as f64 / dst_rate as f64;
    let out_len = (samples.len() as f64 / ratio) as usize;
    let mut output = Vec::with_capacity(out_len);

    for i in 0..out_len {
        let src_pos = i as f64 * ratio;
        let idx = src_pos as usize;
        let frac = src_pos - idx as f64;

        let sample = if idx + 1 < samples.len() {
            samples[idx] as f64 * (1.0 - frac) + samples[idx + 1] as f64 * frac
        } else {
            samples[idx.min(samples.len() - 1)] as f64
        };

        output.push(sample as f32);
    }

    output
}
