//! Microphone access check
//!
//! Opens the default input device and runs a capture stream for a moment.
//! The samples are discarded; the point is to fail early when there is no
//! device or the OS refuses access.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, Stream, StreamConfig};

use super::AudioError;

/// How long the probe stream runs
const PROBE_DURATION: Duration = Duration::from_millis(150);

/// Input device that passed the probe
#[derive(Debug, Clone)]
pub struct MicrophoneInfo {
    pub device_name: String,
    pub sample_rate: u32,
    pub channels: u16,
    /// Samples delivered during the probe (0 can mean access was muted by the OS)
    pub samples_seen: u64,
}

/// Open the default input device, capture briefly, and release it.
///
/// Blocks for `PROBE_DURATION`; call from `spawn_blocking` in async code.
pub fn probe_microphone() -> Result<MicrophoneInfo, AudioError> {
    let host = cpal::default_host();

    let device = host
        .default_input_device()
        .ok_or(AudioError::NoInputDevice)?;

    let device_name = device.name().unwrap_or_else(|_| "unknown".to_string());
    log::info!("Probing audio input device: {}", device_name);

    let supported_config = device
        .default_input_config()
        .map_err(|_| AudioError::NoSupportedConfig)?;

    let sample_format = supported_config.sample_format();
    let config: StreamConfig = supported_config.into();
    let samples_seen = Arc::new(AtomicU64::new(0));

    let stream = match sample_format {
        SampleFormat::I16 => build_probe_stream::<i16>(&device, &config, samples_seen.clone()),
        SampleFormat::U16 => build_probe_stream::<u16>(&device, &config, samples_seen.clone()),
        SampleFormat::F32 => build_probe_stream::<f32>(&device, &config, samples_seen.clone()),
        _ => Err(AudioError::NoSupportedConfig),
    }?;

    stream.play().map_err(|e| {
        AudioError::StreamCreationFailed(format!("Failed to start stream: {}", e))
    })?;

    std::thread::sleep(PROBE_DURATION);
    drop(stream);

    let samples_seen = samples_seen.load(Ordering::Relaxed);
    if samples_seen == 0 {
        log::warn!("Microphone probe received no samples (device may be muted)");
    }

    Ok(MicrophoneInfo {
        device_name,
        sample_rate: config.sample_rate.0,
        channels: config.channels,
        samples_seen,
    })
}

fn build_probe_stream<T>(
    device: &Device,
    config: &StreamConfig,
    samples_seen: Arc<AtomicU64>,
) -> Result<Stream, AudioError>
where
    T: cpal::SizedSample + Send + 'static,
{
    let err_fn = |err| log::error!("Microphone probe stream error: {}", err);

    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                samples_seen.fetch_add(data.len() as u64, Ordering::Relaxed);
            },
            err_fn,
            None,
        )
        .map_err(|e| AudioError::StreamCreationFailed(e.to_string()))
}
