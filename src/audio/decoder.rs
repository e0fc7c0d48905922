//! Opus decoding for the remote audio track

use super::AudioError;

/// WebRTC Opus always runs at 48 kHz
pub const OPUS_SAMPLE_RATE: u32 = 48_000;

/// Decoded output is interleaved stereo
pub const OPUS_CHANNELS: usize = 2;

/// Largest Opus frame: 120 ms at 48 kHz
const MAX_FRAME_SAMPLES: usize = 5_760;

/// Decodes RTP Opus payloads into interleaved stereo f32 PCM
pub struct OpusDecoder {
    inner: opus::Decoder,
    pcm: Vec<f32>,
    packets_decoded: u64,
}

impl OpusDecoder {
    pub fn new() -> Result<Self, AudioError> {
        let inner = opus::Decoder::new(OPUS_SAMPLE_RATE, opus::Channels::Stereo)
            .map_err(|e| AudioError::DecoderFailed(e.to_string()))?;

        Ok(Self {
            inner,
            pcm: vec![0.0; MAX_FRAME_SAMPLES * OPUS_CHANNELS],
            packets_decoded: 0,
        })
    }

    /// Decode one RTP payload.
    ///
    /// Returns the interleaved samples for this packet; the slice is only
    /// valid until the next call. Empty payloads decode to nothing.
    pub fn decode(&mut self, payload: &[u8]) -> Result<&[f32], AudioError> {
        if payload.is_empty() {
            return Ok(&[]);
        }

        let frames = self
            .inner
            .decode_float(payload, &mut self.pcm, false)
            .map_err(|e| AudioError::DecoderFailed(e.to_string()))?;

        self.packets_decoded += 1;
        if self.packets_decoded % 500 == 0 {
            log::debug!("OpusDecoder: {} packets decoded", self.packets_decoded);
        }

        Ok(&self.pcm[..frames * OPUS_CHANNELS])
    }

    pub fn packets_decoded(&self) -> u64 {
        self.packets_decoded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_payload_decodes_to_nothing() {
        let mut decoder = OpusDecoder::new().unwrap();
        assert!(decoder.decode(&[]).unwrap().is_empty());
        assert_eq!(decoder.packets_decoded(), 0);
    }

    #[test]
    fn test_encoded_silence_decodes_to_stereo_frame() {
        let mut encoder =
            opus::Encoder::new(OPUS_SAMPLE_RATE, opus::Channels::Stereo, opus::Application::Voip)
                .unwrap();
        // 20 ms of stereo silence
        let silence = vec![0.0f32; 960 * OPUS_CHANNELS];
        let packet = encoder.encode_vec_float(&silence, 4000).unwrap();

        let mut decoder = OpusDecoder::new().unwrap();
        let pcm = decoder.decode(&packet).unwrap();

        assert_eq!(pcm.len(), 960 * OPUS_CHANNELS);
        assert_eq!(decoder.packets_decoded(), 1);
    }
}
