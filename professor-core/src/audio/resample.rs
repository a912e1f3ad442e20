//! Sample-rate conversion using a rubato `FastFixedIn` resampler.
//!
//! Two directions need it:
//! - capture: the microphone runs at the device's native rate (often 48 kHz),
//!   the remote session wants 16 kHz;
//! - playback: replies arrive at 24 kHz, the output device runs at its own rate.
//!
//! When both rates match, `RateConverter` is a passthrough and no rubato
//! session is created.

use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use tracing::error;

use crate::error::{ProfessorError, Result};

/// Converts f32 mono audio from one fixed sample rate to another.
pub struct RateConverter {
    from_rate: u32,
    to_rate: u32,
    /// `None` in passthrough mode.
    resampler: Option<FastFixedIn<f32>>,
    /// Holds partial input between calls.
    input_buf: Vec<f32>,
    /// Input frames per rubato call.
    chunk_size: usize,
    /// Pre-allocated `[1][output_frames_max]`.
    output_buf: Vec<Vec<f32>>,
}

impl RateConverter {
    /// # Errors
    /// `ProfessorError::AudioStream` if rubato rejects the ratio or chunk size.
    pub fn new(from_rate: u32, to_rate: u32, chunk_size: usize) -> Result<Self> {
        if from_rate == to_rate {
            return Ok(Self {
                from_rate,
                to_rate,
                resampler: None,
                input_buf: Vec::new(),
                chunk_size,
                output_buf: Vec::new(),
            });
        }
        if from_rate == 0 || to_rate == 0 {
            return Err(ProfessorError::AudioStream(format!(
                "cannot resample {from_rate} Hz -> {to_rate} Hz"
            )));
        }

        let ratio = to_rate as f64 / from_rate as f64;
        let resampler = FastFixedIn::<f32>::new(ratio, 1.0, PolynomialDegree::Cubic, chunk_size, 1)
            .map_err(|e| ProfessorError::AudioStream(format!("resampler init: {e}")))?;

        let max_out = resampler.output_frames_max();
        tracing::debug!(from_rate, to_rate, chunk_size, max_out, "resampler ready");

        Ok(Self {
            from_rate,
            to_rate,
            resampler: Some(resampler),
            input_buf: Vec::with_capacity(chunk_size * 2),
            chunk_size,
            output_buf: vec![vec![0f32; max_out]; 1],
        })
    }

    /// Feed samples; returns whatever output is ready (may be empty).
    pub fn process(&mut self, samples: &[f32]) -> Vec<f32> {
        let Some(ref mut resampler) = self.resampler else {
            return samples.to_vec();
        };

        self.input_buf.extend_from_slice(samples);
        let mut result = Vec::new();

        let mut offset = 0;
        while self.input_buf.len() - offset >= self.chunk_size {
            let input_slice = &self.input_buf[offset..offset + self.chunk_size];
            match resampler.process_into_buffer(&[input_slice], &mut self.output_buf, None) {
                Ok((_consumed, produced)) => {
                    result.extend_from_slice(&self.output_buf[0][..produced]);
                }
                Err(e) => error!("resampler process error: {e}"),
            }
            offset += self.chunk_size;
        }
        self.input_buf.drain(..offset);

        result
    }

    /// Push out any held input by zero-padding it to a full chunk.
    pub fn flush(&mut self) -> Vec<f32> {
        if self.resampler.is_none() || self.input_buf.is_empty() {
            self.input_buf.clear();
            return Vec::new();
        }
        let pad = self.chunk_size - self.input_buf.len();
        let silence = vec![0f32; pad];
        self.process(&silence)
    }

    pub fn is_passthrough(&self) -> bool {
        self.resampler.is_none()
    }

    pub fn rates(&self) -> (u32, u32) {
        (self.from_rate, self.to_rate)
    }

    /// Drop held input and filter history; the next sample starts a new signal.
    pub fn reset(&mut self) -> Result<()> {
        *self = Self::new(self.from_rate, self.to_rate, self.chunk_size)?;
        Ok(())
    }
}

/// Streaming converter for audio that is cut into back-to-back buffers.
///
/// Rubato runs one input frame per call, so nothing is held back between
/// buffers: each `process` returns everything its input produced and the
/// next buffer continues from the same filter history. Joining the outputs
/// gives the same signal as converting the whole stream at once.
pub fn streaming_converter(from_rate: u32, to_rate: u32) -> Result<RateConverter> {
    RateConverter::new(from_rate, to_rate, 1)
}

/// One-shot conversion of a whole buffer, trimmed to the exact expected length.
pub fn convert_buffer(samples: &[f32], from_rate: u32, to_rate: u32) -> Result<Vec<f32>> {
    if from_rate == to_rate || samples.is_empty() {
        return Ok(samples.to_vec());
    }
    let mut rc = RateConverter::new(from_rate, to_rate, 1024)?;
    let (from, to) = (u64::from(from_rate), u64::from(to_rate));
    let expected = ((samples.len() as u64 * to + from / 2) / from) as usize;

    let mut out = rc.process(samples);
    out.extend(rc.flush());
    out.resize(expected, 0.0);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passthrough_identity() {
        let mut rc = RateConverter::new(16_000, 16_000, 960).unwrap();
        assert!(rc.is_passthrough());
        let samples: Vec<f32> = (0..480).map(|i| i as f32 * 0.001).collect();
        assert_eq!(rc.process(&samples), samples);
        assert!(rc.flush().is_empty());
    }

    #[test]
    fn ratio_48k_to_16k_correct_length() {
        let mut rc = RateConverter::new(48_000, 16_000, 960).unwrap();
        let out = rc.process(&vec![0.0f32; 960]);
        assert!(
            (out.len() as isize - 320).unsigned_abs() <= 10,
            "output len={} expected≈320",
            out.len()
        );
    }

    #[test]
    fn partial_input_waits_until_flush() {
        let mut rc = RateConverter::new(48_000, 16_000, 960).unwrap();
        assert!(rc.process(&vec![0.0f32; 500]).is_empty());
        assert!(!rc.flush().is_empty());
        assert!(rc.flush().is_empty());
    }

    #[test]
    fn whole_buffer_conversion_hits_exact_length() {
        let out = convert_buffer(&vec![0.25f32; 2_400], 24_000, 48_000).unwrap();
        assert_eq!(out.len(), 4_800);

        let out = convert_buffer(&vec![0.25f32; 2_400], 24_000, 44_100).unwrap();
        assert_eq!(out.len(), 4_410);
    }

    fn tone(freq: f32, rate: u32, len: usize) -> Vec<f32> {
        let step = std::f32::consts::TAU * freq / rate as f32;
        (0..len).map(|i| 0.5 * (step * i as f32).sin()).collect()
    }

    fn max_step(samples: &[f32]) -> f32 {
        samples
            .windows(2)
            .map(|w| (w[1] - w[0]).abs())
            .fold(0.0, f32::max)
    }

    #[test]
    fn chunked_stream_matches_single_pass() {
        let tone = tone(300.0, 24_000, 4_800);

        let mut whole = streaming_converter(24_000, 48_000).unwrap();
        let expected = whole.process(&tone);

        let mut chained = streaming_converter(24_000, 48_000).unwrap();
        let first = chained.process(&tone[..2_400]);
        let second = chained.process(&tone[2_400..]);
        assert!(
            (first.len() as isize - 4_800).unsigned_abs() <= 4,
            "first chunk produced {}",
            first.len()
        );

        let joined: Vec<f32> = first.iter().chain(second.iter()).copied().collect();
        assert_eq!(joined, expected);
    }

    #[test]
    fn chunk_seam_has_no_step() {
        let tone = tone(300.0, 24_000, 4_800);
        let mut rc = streaming_converter(24_000, 48_000).unwrap();
        let first = rc.process(&tone[..2_400]);
        let second = rc.process(&tone[2_400..]);

        // 0.5 * sin at 300 Hz moves at most ~0.0196 per 48 kHz frame.
        let seam = [&first[first.len() - 8..], &second[..8]].concat();
        assert!(max_step(&seam) < 0.03, "seam step {}", max_step(&seam));
        assert!(max_step(&second) < 0.03);
    }

    #[test]
    fn reset_forgets_history() {
        let mut rc = streaming_converter(24_000, 48_000).unwrap();
        let fresh = rc.process(&[0.5; 64]);
        rc.process(&[0.9; 64]);
        rc.reset().unwrap();
        assert_eq!(rc.process(&[0.5; 64]), fresh);
        assert_eq!(rc.rates(), (24_000, 48_000));
    }

    #[test]
    fn zero_rate_is_rejected() {
        assert!(RateConverter::new(0, 16_000, 960).is_err());
    }
}
