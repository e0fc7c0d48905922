//! Audio devices for the voice-chat client
//!
//! The client never sends audio. The microphone is only opened briefly to
//! confirm access before connecting; the remote Opus track is decoded and
//! played on the default output device.

mod decoder;
mod microphone;
mod player;

pub use decoder::{OpusDecoder, OPUS_CHANNELS, OPUS_SAMPLE_RATE};
pub use microphone::{probe_microphone, MicrophoneInfo};
pub use player::{AudioPlayer, PlaybackBuffer, PlaybackCursor};

/// Errors from audio devices and decoding.
#[derive(Debug, Clone, PartialEq)]
pub enum AudioError {
    NoInputDevice,
    NoOutputDevice,
    NoSupportedConfig,
    StreamCreationFailed(String),
    PlaybackFailed(String),
    DecoderFailed(String),
}

impl std::fmt::Display for AudioError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AudioError::NoInputDevice => write!(f, "No audio input device found"),
            AudioError::NoOutputDevice => write!(f, "No audio output device found"),
            AudioError::NoSupportedConfig => write!(f, "No supported audio configuration"),
            AudioError::StreamCreationFailed(e) => {
                write!(f, "Failed to create audio stream: {}", e)
            }
            AudioError::PlaybackFailed(e) => write!(f, "Failed to start playback: {}", e),
            AudioError::DecoderFailed(e) => write!(f, "Opus decoder error: {}", e),
        }
    }
}

impl std::error::Error for AudioError {}
