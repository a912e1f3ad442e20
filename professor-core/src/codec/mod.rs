//! PCM wire codec.
//!
//! Audio crosses the session as base64 text wrapping 16-bit signed
//! little-endian PCM, mono. Capture frames go out at 16 kHz; spoken replies
//! come back at 24 kHz.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};

use crate::buffering::chunk::PlaybackBuffer;
use crate::error::{ProfessorError, Result};

/// Microphone sample rate expected by the remote session (Hz).
pub const INPUT_SAMPLE_RATE: u32 = 16_000;

/// Sample rate of spoken replies from the remote session (Hz).
pub const OUTPUT_SAMPLE_RATE: u32 = 24_000;

const I16_SCALE: f32 = 32_768.0;

/// MIME tag attached to every outgoing capture chunk.
pub fn input_mime_type() -> String {
    format!("audio/pcm;rate={INPUT_SAMPLE_RATE}")
}

/// One unit of encoded audio exchanged with the remote session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncodedChunk {
    /// base64 of i16 LE samples.
    pub data: String,
    pub mime_type: String,
}

impl EncodedChunk {
    /// Number of PCM bytes carried, without decoding.
    pub fn pcm_len(&self) -> usize {
        let padding = self.data.bytes().rev().take_while(|b| *b == b'=').count();
        (self.data.len() / 4 * 3).saturating_sub(padding)
    }
}

/// Encode f32 samples into a capture chunk.
///
/// Samples are clamped to [-1, 1], scaled by 32768 and truncated toward zero;
/// `as` saturates, so +1.0 lands on `i16::MAX`.
pub fn encode(samples: &[f32]) -> EncodedChunk {
    let mut pcm = Vec::with_capacity(samples.len() * 2);
    for &s in samples {
        let v = (s.clamp(-1.0, 1.0) * I16_SCALE) as i16;
        pcm.extend_from_slice(&v.to_le_bytes());
    }
    EncodedChunk {
        data: STANDARD.encode(&pcm),
        mime_type: input_mime_type(),
    }
}

/// Decode base64 PCM text into a mono playback buffer tagged with `output_rate`.
///
/// # Errors
/// `ProfessorError::MalformedChunk` when the text is not base64 or the
/// decoded byte length is odd.
pub fn decode(data: &str, output_rate: u32) -> Result<PlaybackBuffer> {
    let bytes = STANDARD
        .decode(data.trim())
        .map_err(|e| ProfessorError::MalformedChunk(format!("invalid base64: {e}")))?;

    if bytes.len() % 2 != 0 {
        return Err(ProfessorError::MalformedChunk(format!(
            "odd PCM byte length {}",
            bytes.len()
        )));
    }

    let samples = bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / I16_SCALE)
        .collect();

    Ok(PlaybackBuffer::new(samples, output_rate))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    const STEP: f32 = 1.0 / 32_768.0;

    #[test]
    fn decode_of_encode_stays_within_one_quantization_step() {
        let samples: Vec<f32> = (0..=400).map(|i| -1.0 + i as f32 * 0.005).collect();
        let decoded = decode(&encode(&samples).data, INPUT_SAMPLE_RATE).expect("decode");

        assert_eq!(decoded.samples.len(), samples.len());
        for (orig, back) in samples.iter().zip(&decoded.samples) {
            assert_abs_diff_eq!(*orig, *back, epsilon = STEP + f32::EPSILON);
        }
    }

    #[test]
    fn full_scale_saturates_instead_of_wrapping() {
        let decoded = decode(&encode(&[1.0, -1.0, 1.7]).data, OUTPUT_SAMPLE_RATE).unwrap();
        assert_abs_diff_eq!(decoded.samples[0], i16::MAX as f32 / 32_768.0);
        assert_abs_diff_eq!(decoded.samples[1], -1.0);
        assert_abs_diff_eq!(decoded.samples[2], i16::MAX as f32 / 32_768.0);
    }

    #[test]
    fn encode_packs_little_endian() {
        let chunk = encode(&[0.5]);
        let bytes = STANDARD.decode(&chunk.data).unwrap();
        assert_eq!(bytes, 16_384i16.to_le_bytes());
        assert_eq!(chunk.mime_type, "audio/pcm;rate=16000");
        assert_eq!(chunk.pcm_len(), 2);
    }

    #[test]
    fn empty_frame_round_trips_to_empty_buffer() {
        let chunk = encode(&[]);
        assert!(chunk.data.is_empty());
        let decoded = decode(&chunk.data, OUTPUT_SAMPLE_RATE).unwrap();
        assert!(decoded.is_empty());
        assert_eq!(decoded.sample_rate, OUTPUT_SAMPLE_RATE);
    }

    #[test]
    fn odd_byte_length_is_malformed() {
        let odd = STANDARD.encode([1u8, 2, 3]);
        match decode(&odd, OUTPUT_SAMPLE_RATE) {
            Err(ProfessorError::MalformedChunk(msg)) => assert!(msg.contains("odd")),
            other => panic!("expected MalformedChunk, got {other:?}"),
        }
    }

    #[test]
    fn non_base64_text_is_malformed() {
        assert!(matches!(
            decode("not*base64!", OUTPUT_SAMPLE_RATE),
            Err(ProfessorError::MalformedChunk(_))
        ));
    }

    #[test]
    fn decoded_buffer_carries_requested_rate() {
        let decoded = decode(&encode(&[0.0; 240]).data, OUTPUT_SAMPLE_RATE).unwrap();
        assert_eq!(decoded.sample_rate, 24_000);
        assert_abs_diff_eq!(decoded.duration_secs(), 0.01, epsilon = 1e-9);
    }
}
