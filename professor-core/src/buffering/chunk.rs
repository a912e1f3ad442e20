//! Decoded audio owned by the playback scheduler.

/// A contiguous block of mono PCM samples at a known sample rate.
///
/// Produced by [`crate::codec::decode`]; owned by the playback scheduler
/// until its end-of-playback notification arrives.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackBuffer {
    /// Mono f32 samples in [-1.0, 1.0].
    pub samples: Vec<f32>,
    /// Sample rate in Hz (24000 for remote speech).
    pub sample_rate: u32,
}

impl PlaybackBuffer {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    /// Playback length in seconds.
    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::PlaybackBuffer;

    #[test]
    fn duration_follows_sample_count_and_rate() {
        let buf = PlaybackBuffer::new(vec![0.0; 12_000], 24_000);
        assert!((buf.duration_secs() - 0.5).abs() < 1e-12);
        assert!(!buf.is_empty());
    }

    #[test]
    fn zero_rate_has_zero_duration() {
        let buf = PlaybackBuffer::new(vec![0.0; 10], 0);
        assert_eq!(buf.duration_secs(), 0.0);
    }
}
