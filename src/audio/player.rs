//! Playback of the remote audio stream
//!
//! Decoded PCM is pushed into a bounded ring buffer; a CPAL output stream on a
//! dedicated thread pulls from it. When the buffer is full the oldest audio is
//! evicted, so a stalled device never grows memory without bound.
//!
//! ```text
//! Track reader (tokio)            Playback thread (CPAL)
//! ┌──────────────────┐            ┌──────────────────────┐
//! │ decode Opus      │──push──▶   │ PlaybackBuffer::fill │
//! │ push_samples()   │  (Mutex)   │   ├─ resample 48k→dev│
//! └──────────────────┘            │   └─ map channels    │
//!                                 └──────────────────────┘
//! ```

use std::collections::VecDeque;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{
    Device, Sample, SampleFormat, SampleRate, Stream, StreamConfig, SupportedStreamConfig,
};

use super::decoder::{OPUS_CHANNELS, OPUS_SAMPLE_RATE};
use super::AudioError;

/// Maximum audio held between decoder and device
const MAX_BUFFER_SECS: f32 = 2.0;

/// Ring buffer of interleaved stereo samples at the Opus rate
///
/// Thread-safety: This struct is NOT internally synchronized.
/// Wrap in `Arc<Mutex<>>` if shared across threads.
#[derive(Debug)]
pub struct PlaybackBuffer {
    samples: VecDeque<f32>,
    max_frames: usize,
    sample_rate: u32,
    frames_evicted: u64,
    underruns: u64,
}

impl PlaybackBuffer {
    /// Create a buffer holding at most `max_duration_secs` of stereo audio
    pub fn new(max_duration_secs: f32, sample_rate: u32) -> Self {
        let max_frames = (max_duration_secs * sample_rate as f32).ceil() as usize;

        Self {
            samples: VecDeque::with_capacity(max_frames * OPUS_CHANNELS),
            max_frames,
            sample_rate,
            frames_evicted: 0,
            underruns: 0,
        }
    }

    /// Append interleaved stereo samples, evicting the oldest frames if full.
    /// A trailing partial frame is dropped.
    pub fn push(&mut self, interleaved: &[f32]) {
        let whole = interleaved.len() - interleaved.len() % OPUS_CHANNELS;
        self.samples.extend(&interleaved[..whole]);

        let frames = self.len_frames();
        if frames > self.max_frames {
            let excess = frames - self.max_frames;
            self.samples.drain(..excess * OPUS_CHANNELS);
            self.frames_evicted += excess as u64;
        }
    }

    /// Take the oldest stereo frame
    pub fn pop_frame(&mut self) -> Option<[f32; 2]> {
        if self.samples.len() < OPUS_CHANNELS {
            return None;
        }
        let left = self.samples.pop_front()?;
        let right = self.samples.pop_front()?;
        Some([left, right])
    }

    /// Fill a device buffer of `out_channels` interleaved channels.
    ///
    /// Missing audio is written as silence and counted as an underrun.
    pub fn fill(&mut self, out: &mut [f32], out_channels: usize, cursor: &mut PlaybackCursor) {
        if out_channels == 0 {
            return;
        }

        for frame in out.chunks_mut(out_channels) {
            while cursor.phase >= 1.0 {
                cursor.frame = match self.pop_frame() {
                    Some(f) => f,
                    None => {
                        self.underruns += 1;
                        [0.0, 0.0]
                    }
                };
                cursor.phase -= 1.0;
            }
            cursor.phase += cursor.step;

            let [left, right] = cursor.frame;
            match frame.len() {
                1 => frame[0] = (left + right) * 0.5,
                _ => {
                    frame[0] = left;
                    frame[1] = right;
                    for extra in frame.iter_mut().skip(2) {
                        *extra = 0.0;
                    }
                }
            }
        }
    }

    pub fn len_frames(&self) -> usize {
        self.samples.len() / OPUS_CHANNELS
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Buffered audio in milliseconds
    pub fn duration_ms(&self) -> u64 {
        (self.len_frames() as u64 * 1000) / self.sample_rate as u64
    }

    pub fn frames_evicted(&self) -> u64 {
        self.frames_evicted
    }

    pub fn underruns(&self) -> u64 {
        self.underruns
    }
}

/// Sample-and-hold resampling position between the source and device rates
#[derive(Debug, Clone)]
pub struct PlaybackCursor {
    step: f64,
    phase: f64,
    frame: [f32; 2],
}

impl PlaybackCursor {
    pub fn new(source_rate: u32, device_rate: u32) -> Self {
        let step = if device_rate == 0 {
            1.0
        } else {
            source_rate as f64 / device_rate as f64
        };
        Self {
            step,
            phase: 1.0,
            frame: [0.0, 0.0],
        }
    }
}

/// Plays decoded audio on the default output device.
///
/// The CPAL stream lives on its own thread; dropping the player stops it.
pub struct AudioPlayer {
    buffer: Arc<Mutex<PlaybackBuffer>>,
    stop_tx: Option<mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
    device_name: String,
}

impl AudioPlayer {
    /// Open the default output device and start playing (silence until
    /// samples arrive). Blocks until the stream is running or has failed.
    pub fn start() -> Result<Self, AudioError> {
        let buffer = Arc::new(Mutex::new(PlaybackBuffer::new(
            MAX_BUFFER_SECS,
            OPUS_SAMPLE_RATE,
        )));

        let (ready_tx, ready_rx) = mpsc::sync_channel::<Result<String, AudioError>>(1);
        let (stop_tx, stop_rx) = mpsc::channel::<()>();

        let thread_buffer = buffer.clone();
        let thread = std::thread::Builder::new()
            .name("audio-playback".to_string())
            .spawn(move || {
                let stream = match open_output_stream(thread_buffer) {
                    Ok((stream, name)) => {
                        let _ = ready_tx.send(Ok(name));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                // Returns on stop() or when the player is dropped
                let _ = stop_rx.recv();
                drop(stream);
                log::debug!("Playback thread exiting");
            })
            .map_err(|e| AudioError::StreamCreationFailed(e.to_string()))?;

        let device_name = ready_rx
            .recv()
            .map_err(|_| AudioError::PlaybackFailed("playback thread exited".to_string()))??;

        log::info!("Audio playback started on {}", device_name);

        Ok(Self {
            buffer,
            stop_tx: Some(stop_tx),
            thread: Some(thread),
            device_name,
        })
    }

    /// Queue interleaved stereo samples at 48 kHz
    pub fn push_samples(&self, interleaved: &[f32]) {
        if let Ok(mut guard) = self.buffer.lock() {
            guard.push(interleaved);
        }
    }

    /// Buffered audio not yet played
    pub fn buffered_ms(&self) -> u64 {
        self.buffer.lock().map(|g| g.duration_ms()).unwrap_or(0)
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    /// Stop playback and wait for the device thread
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        // Dropping the sender wakes the playback thread
        self.stop_tx.take();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::warn!("Playback thread panicked");
            }
        }
        if let Ok(guard) = self.buffer.lock() {
            log::info!(
                "Audio playback stopped ({} frames evicted, {} underruns)",
                guard.frames_evicted(),
                guard.underruns()
            );
        }
    }
}

impl Drop for AudioPlayer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn open_output_stream(buffer: Arc<Mutex<PlaybackBuffer>>) -> Result<(Stream, String), AudioError> {
    let host = cpal::default_host();

    let device = host
        .default_output_device()
        .ok_or(AudioError::NoOutputDevice)?;

    let name = device.name().unwrap_or_else(|_| "unknown".to_string());
    let supported_config = preferred_output_config(&device)?;

    log::info!(
        "Audio output: {} Hz, {} channels, {:?}",
        supported_config.sample_rate().0,
        supported_config.channels(),
        supported_config.sample_format()
    );

    let sample_format = supported_config.sample_format();
    let config: StreamConfig = supported_config.into();

    let stream = match sample_format {
        SampleFormat::F32 => build_output_stream_typed::<f32>(&device, &config, buffer),
        SampleFormat::I16 => build_output_stream_typed::<i16>(&device, &config, buffer),
        SampleFormat::U16 => build_output_stream_typed::<u16>(&device, &config, buffer),
        _ => Err(AudioError::NoSupportedConfig),
    }?;

    stream
        .play()
        .map_err(|e| AudioError::PlaybackFailed(e.to_string()))?;

    Ok((stream, name))
}

/// Prefer stereo at the Opus rate so no resampling is needed
fn preferred_output_config(device: &Device) -> Result<SupportedStreamConfig, AudioError> {
    let rate = SampleRate(OPUS_SAMPLE_RATE);

    if let Ok(mut ranges) = device.supported_output_configs() {
        if let Some(range) = ranges.find(|r| {
            r.channels() as usize == OPUS_CHANNELS
                && r.min_sample_rate() <= rate
                && r.max_sample_rate() >= rate
        }) {
            return Ok(range.with_sample_rate(rate));
        }
    }

    device
        .default_output_config()
        .map_err(|_| AudioError::NoSupportedConfig)
}

fn build_output_stream_typed<T>(
    device: &Device,
    config: &StreamConfig,
    buffer: Arc<Mutex<PlaybackBuffer>>,
) -> Result<Stream, AudioError>
where
    T: cpal::SizedSample + cpal::FromSample<f32> + Send + 'static,
{
    let err_fn = |err| log::error!("Audio output stream error: {}", err);
    let channels = config.channels as usize;
    let mut cursor = PlaybackCursor::new(OPUS_SAMPLE_RATE, config.sample_rate.0);
    let mut scratch: Vec<f32> = Vec::new();

    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                scratch.resize(data.len(), 0.0);
                match buffer.lock() {
                    Ok(mut guard) => guard.fill(&mut scratch, channels, &mut cursor),
                    Err(_) => scratch.iter_mut().for_each(|s| *s = 0.0),
                }
                for (out, &sample) in data.iter_mut().zip(scratch.iter()) {
                    *out = sample.to_sample::<T>();
                }
            },
            err_fn,
            None,
        )
        .map_err(|e| AudioError::StreamCreationFailed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_push_and_pop() {
        let mut buffer = PlaybackBuffer::new(1.0, 48000);
        assert!(buffer.is_empty());

        buffer.push(&[0.1, 0.2, 0.3, 0.4]);
        assert_eq!(buffer.len_frames(), 2);

        assert_eq!(buffer.pop_frame(), Some([0.1, 0.2]));
        assert_eq!(buffer.pop_frame(), Some([0.3, 0.4]));
        assert_eq!(buffer.pop_frame(), None);
    }

    #[test]
    fn test_buffer_drops_partial_frame() {
        let mut buffer = PlaybackBuffer::new(1.0, 48000);
        buffer.push(&[0.1, 0.2, 0.3]);
        assert_eq!(buffer.len_frames(), 1);
    }

    #[test]
    fn test_buffer_eviction_keeps_newest() {
        // 0.5s at 4 Hz = 2 frames max
        let mut buffer = PlaybackBuffer::new(0.5, 4);

        buffer.push(&[1.0, 1.0, 2.0, 2.0, 3.0, 3.0]);

        assert_eq!(buffer.len_frames(), 2);
        assert_eq!(buffer.frames_evicted(), 1);
        assert_eq!(buffer.pop_frame(), Some([2.0, 2.0]));
    }

    #[test]
    fn test_buffer_duration() {
        let mut buffer = PlaybackBuffer::new(1.0, 48000);
        buffer.push(&vec![0.0; 960 * 2]);
        assert_eq!(buffer.duration_ms(), 20);
    }

    #[test]
    fn test_fill_same_rate_stereo() {
        let mut buffer = PlaybackBuffer::new(1.0, 48000);
        buffer.push(&[0.1, 0.2, 0.3, 0.4]);
        let mut cursor = PlaybackCursor::new(48000, 48000);

        let mut out = vec![9.0; 6];
        buffer.fill(&mut out, 2, &mut cursor);

        assert_eq!(out, vec![0.1, 0.2, 0.3, 0.4, 0.0, 0.0]);
        assert_eq!(buffer.underruns(), 1);
    }

    #[test]
    fn test_fill_mono_device_averages_channels() {
        let mut buffer = PlaybackBuffer::new(1.0, 48000);
        buffer.push(&[0.2, 0.4]);
        let mut cursor = PlaybackCursor::new(48000, 48000);

        let mut out = vec![0.0; 1];
        buffer.fill(&mut out, 1, &mut cursor);

        assert!((out[0] - 0.3).abs() < 1e-6);
    }

    #[test]
    fn test_fill_lower_device_rate_skips_frames() {
        let mut buffer = PlaybackBuffer::new(1.0, 48000);
        // 4 source frames into a device running at half the rate
        buffer.push(&[1.0, 1.0, 2.0, 2.0, 3.0, 3.0, 4.0, 4.0]);
        let mut cursor = PlaybackCursor::new(48000, 24000);

        let mut out = vec![0.0; 4];
        buffer.fill(&mut out, 2, &mut cursor);

        assert_eq!(out, vec![1.0, 1.0, 3.0, 3.0]);
        assert_eq!(buffer.len_frames(), 1);
    }

    #[test]
    fn test_fill_higher_device_rate_holds_frames() {
        let mut buffer = PlaybackBuffer::new(1.0, 48000);
        buffer.push(&[1.0, 1.0, 2.0, 2.0]);
        let mut cursor = PlaybackCursor::new(48000, 96000);

        let mut out = vec![0.0; 8];
        buffer.fill(&mut out, 2, &mut cursor);

        assert_eq!(out, vec![1.0, 1.0, 1.0, 1.0, 2.0, 2.0, 2.0, 2.0]);
    }

    #[test]
    #[ignore] // Requires an audio output device
    fn test_player_starts_on_default_device() {
        let player = AudioPlayer::start().expect("playback failed to start");
        player.push_samples(&vec![0.0; 960 * 2]);
        assert!(!player.device_name().is_empty());
        player.stop();
    }
}
