//! Speaker output via cpal.
//!
//! The output stream renders a small mixer of scheduled voices. The device
//! clock is the count of frames the callback has rendered, so
//! `current_time()` advances exactly with what has been played and a voice
//! scheduled at `t` starts on frame `round(t * rate)`.
//!
//! When a voice's last frame has been rendered the callback removes it and
//! posts `playback_ended` for its id. Stopped voices are removed silently.
//!
//! Replies arrive as many short 24 kHz buffers. `VoiceChain` runs them
//! through one streaming converter so the device-rate voices join exactly.

#[cfg(feature = "audio-cpal")]
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

#[cfg(feature = "audio-cpal")]
use cpal::{
    traits::{DeviceTrait, StreamTrait},
    FromSample, SampleFormat, SampleRate, SizedSample, Stream, StreamConfig,
};
#[cfg(feature = "audio-cpal")]
use parking_lot::Mutex;
#[cfg(feature = "audio-cpal")]
use tracing::{error, info, warn};

use crate::{
    audio::resample::{streaming_converter, RateConverter},
    buffering::chunk::PlaybackBuffer,
    error::Result,
};
#[cfg(feature = "audio-cpal")]
use crate::{
    audio::device::{select_device, Direction},
    engine::events::EventSender,
    error::ProfessorError,
    playback::{AudioOutput, SourceId},
};

/// One scheduled buffer, already converted to the device rate.
#[derive(Debug)]
pub(crate) struct Voice {
    pub id: u64,
    pub start_frame: u64,
    pub samples: Vec<f32>,
}

impl Voice {
    pub fn end_frame(&self) -> u64 {
        self.start_frame + self.samples.len() as u64
    }
}

/// Mix every voice overlapping `[base, base + frames)` into interleaved
/// `out`, then drop the voices that finished. Returns the finished ids.
pub(crate) fn render_block(
    voices: &mut Vec<Voice>,
    out: &mut [f32],
    channels: usize,
    base: u64,
    finished: &mut Vec<u64>,
) {
    out.fill(0.0);
    let frames = (out.len() / channels.max(1)) as u64;
    let horizon = base + frames;

    for voice in voices.iter() {
        let from = voice.start_frame.max(base);
        let to = voice.end_frame().min(horizon);
        for pos in from..to {
            let s = voice.samples[(pos - voice.start_frame) as usize];
            let off = (pos - base) as usize * channels;
            for slot in &mut out[off..off + channels] {
                *slot += s;
            }
        }
    }
    for slot in out.iter_mut() {
        *slot = slot.clamp(-1.0, 1.0);
    }

    voices.retain(|v| {
        let done = v.end_frame() <= horizon;
        if done {
            finished.push(v.id);
        }
        !done
    });
}

/// Start times closer than this continue the previous voice.
const SEAM_TOLERANCE_SECS: f64 = 1e-6;

/// Converts reply buffers to the device rate and places them on the device
/// timeline.
///
/// A buffer scheduled exactly where the previous one ended keeps the same
/// converter and starts on the previous voice's end frame, so consecutive
/// chunks join without a step. Anything else (a gap, a rate change, or a
/// `reset` after an interruption) starts a fresh converter.
pub(crate) struct VoiceChain {
    device_rate: u32,
    converter: Option<RateConverter>,
    /// Source-clock end time and device end frame of the last placed voice.
    tail: Option<(f64, u64)>,
}

impl VoiceChain {
    pub fn new(device_rate: u32) -> Self {
        Self {
            device_rate,
            converter: None,
            tail: None,
        }
    }

    /// Convert `buffer` and place it at `start_at`, never before
    /// `earliest_frame`.
    pub fn place(
        &mut self,
        id: u64,
        buffer: &PlaybackBuffer,
        start_at: f64,
        earliest_frame: u64,
    ) -> Result<Voice> {
        let continued = match (self.tail.take(), &self.converter) {
            (Some((end, frame)), Some(converter))
                if converter.rates().0 == buffer.sample_rate
                    && (start_at - end).abs() < SEAM_TOLERANCE_SECS
                    && frame >= earliest_frame =>
            {
                Some(frame)
            }
            _ => None,
        };

        let mut converter = match (continued, self.converter.take()) {
            (Some(_), Some(converter)) => converter,
            _ => streaming_converter(buffer.sample_rate, self.device_rate)?,
        };
        // Never start in the past: that would clip the head of the buffer.
        let start_frame = continued.unwrap_or_else(|| {
            ((start_at * self.device_rate as f64).round() as u64).max(earliest_frame)
        });

        let voice = Voice {
            id,
            start_frame,
            samples: converter.process(&buffer.samples),
        };
        self.tail = Some((start_at + buffer.duration_secs(), voice.end_frame()));
        self.converter = Some(converter);
        Ok(voice)
    }

    /// Forget the previous voice; the next buffer starts a new signal.
    pub fn reset(&mut self) {
        self.tail = None;
        self.converter = None;
    }
}

/// Convert a mixed f32 block into the device's sample type.
#[cfg(feature = "audio-cpal")]
fn write_converted<T>(mixed: &[f32], out: &mut [T])
where
    T: FromSample<f32>,
{
    for (dst, &src) in out.iter_mut().zip(mixed) {
        *dst = T::from_sample_(src);
    }
}

/// Handle to an open speaker stream.
///
/// **Not `Send`**: owns a `cpal::Stream`.
#[cfg(feature = "audio-cpal")]
pub struct CpalOutput {
    stream: Option<Stream>,
    voices: Arc<Mutex<Vec<Voice>>>,
    frames_rendered: Arc<AtomicU64>,
    chain: VoiceChain,
}

#[cfg(feature = "audio-cpal")]
impl CpalOutput {
    /// Open the preferred output device (or the default) and start rendering.
    ///
    /// # Errors
    /// `NoDefaultOutputDevice`, `DeviceAcquisition`, or `AudioStream` for
    /// sample formats the mixer cannot write.
    pub fn open_with_preference(
        preferred_device_name: Option<&str>,
        events: EventSender,
    ) -> Result<Self> {
        let host = cpal::default_host();
        let device = select_device(&host, Direction::Output, preferred_device_name)?;
        info!(
            device = device.name().unwrap_or_default().as_str(),
            "opening output device"
        );

        let supported = device
            .default_output_config()
            .map_err(|e| ProfessorError::DeviceAcquisition(e.to_string()))?;
        let sample_rate = supported.sample_rate().0;
        let channels = supported.channels();
        let sample_format = supported.sample_format();
        info!(sample_rate, channels, ?sample_format, "output config selected");

        let config = StreamConfig {
            channels,
            sample_rate: SampleRate(sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let voices: Arc<Mutex<Vec<Voice>>> = Arc::new(Mutex::new(Vec::new()));
        let frames_rendered = Arc::new(AtomicU64::new(0));
        let mixer = Mixer {
            voices: Arc::clone(&voices),
            frames_rendered: Arc::clone(&frames_rendered),
            events,
        };

        let stream = match sample_format {
            SampleFormat::F32 => build_output_stream::<f32>(&device, &config, mixer)?,
            SampleFormat::I16 => build_output_stream::<i16>(&device, &config, mixer)?,
            SampleFormat::U16 => build_output_stream::<u16>(&device, &config, mixer)?,
            SampleFormat::I32 => build_output_stream::<i32>(&device, &config, mixer)?,
            SampleFormat::U8 => build_output_stream::<u8>(&device, &config, mixer)?,
            fmt => {
                return Err(ProfessorError::AudioStream(format!(
                    "unsupported output sample format: {fmt:?}"
                )))
            }
        };

        stream
            .play()
            .map_err(|e| ProfessorError::AudioStream(e.to_string()))?;

        Ok(Self {
            stream: Some(stream),
            voices,
            frames_rendered,
            chain: VoiceChain::new(sample_rate),
        })
    }
}

/// State shared between `CpalOutput` and its render callback.
#[cfg(feature = "audio-cpal")]
struct Mixer {
    voices: Arc<Mutex<Vec<Voice>>>,
    frames_rendered: Arc<AtomicU64>,
    events: EventSender,
}

#[cfg(feature = "audio-cpal")]
fn build_output_stream<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    mixer: Mixer,
) -> Result<Stream>
where
    T: SizedSample + FromSample<f32> + Send + 'static,
{
    let ch = (config.channels as usize).max(1);
    let Mixer {
        voices,
        frames_rendered,
        events,
    } = mixer;
    let cb_events = events.clone();
    let mut mixed: Vec<f32> = Vec::new();
    let mut finished: Vec<u64> = Vec::with_capacity(16);

    device
        .build_output_stream(
            config,
            move |data: &mut [T], _info: &cpal::OutputCallbackInfo| {
                let base = frames_rendered.load(Ordering::Acquire);
                mixed.resize(data.len(), 0.0);
                {
                    let mut voices = voices.lock();
                    render_block(&mut voices, &mut mixed, ch, base, &mut finished);
                }
                write_converted(&mixed, data);
                frames_rendered.store(base + (data.len() / ch) as u64, Ordering::Release);
                for id in finished.drain(..) {
                    cb_events.playback_ended(SourceId(id));
                }
            },
            move |err| {
                error!("output stream error: {err}");
                events.device_failed(format!("output stream: {err}"));
            },
            None,
        )
        .map_err(|e| ProfessorError::AudioStream(e.to_string()))
}

#[cfg(feature = "audio-cpal")]
impl AudioOutput for CpalOutput {
    fn current_time(&self) -> f64 {
        self.frames_rendered.load(Ordering::Acquire) as f64 / self.chain.device_rate as f64
    }

    fn start_source(&mut self, id: SourceId, buffer: PlaybackBuffer, start_at: f64) -> Result<()> {
        let rendered = self.frames_rendered.load(Ordering::Acquire);
        let voice = self.chain.place(id.0, &buffer, start_at, rendered)?;
        self.voices.lock().push(voice);
        Ok(())
    }

    fn stop_source(&mut self, id: SourceId) {
        self.voices.lock().retain(|v| v.id != id.0);
        self.chain.reset();
    }

    fn close(&mut self) {
        self.voices.lock().clear();
        self.chain.reset();
        if let Some(stream) = self.stream.take() {
            if let Err(e) = stream.pause() {
                warn!("failed to pause output stream: {e}");
            }
            info!("output device released");
        }
    }
}

#[cfg(feature = "audio-cpal")]
impl Drop for CpalOutput {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn voice(id: u64, start_frame: u64, len: usize, value: f32) -> Voice {
        Voice {
            id,
            start_frame,
            samples: vec![value; len],
        }
    }

    #[test]
    fn renders_voice_into_every_channel_at_its_offset() {
        let mut voices = vec![voice(1, 2, 3, 0.5)];
        let mut out = vec![9.0f32; 8 * 2];
        let mut finished = Vec::new();

        render_block(&mut voices, &mut out, 2, 0, &mut finished);

        let left: Vec<f32> = out.iter().step_by(2).copied().collect();
        assert_eq!(left, vec![0.0, 0.0, 0.5, 0.5, 0.5, 0.0, 0.0, 0.0]);
        assert_eq!(out[4], out[5]);
        assert_eq!(finished, vec![1]);
        assert!(voices.is_empty());
    }

    #[test]
    fn voice_spanning_blocks_finishes_in_the_later_block() {
        let mut voices = vec![voice(7, 2, 4, 0.25)];
        let mut out = vec![0f32; 4];
        let mut finished = Vec::new();

        render_block(&mut voices, &mut out, 1, 0, &mut finished);
        assert_eq!(out, vec![0.0, 0.0, 0.25, 0.25]);
        assert!(finished.is_empty());

        render_block(&mut voices, &mut out, 1, 4, &mut finished);
        assert_eq!(out, vec![0.25, 0.25, 0.0, 0.0]);
        assert_eq!(finished, vec![7]);
    }

    fn tone_buffer(range: std::ops::Range<usize>) -> PlaybackBuffer {
        let step = std::f32::consts::TAU * 300.0 / 24_000.0;
        let samples = range.map(|i| 0.5 * (step * i as f32).sin()).collect();
        PlaybackBuffer::new(samples, 24_000)
    }

    fn mix(voices: Vec<Voice>, frames: usize) -> Vec<f32> {
        let mut voices = voices;
        let mut out = vec![0f32; frames];
        render_block(&mut voices, &mut out, 1, 0, &mut Vec::new());
        out
    }

    #[test]
    fn back_to_back_chunks_join_without_a_click() {
        let mut chain = VoiceChain::new(48_000);
        let first = chain.place(1, &tone_buffer(0..2_400), 0.0, 0).unwrap();
        let second = chain.place(2, &tone_buffer(2_400..4_800), 0.1, 0).unwrap();
        assert_eq!(second.start_frame, first.end_frame());

        let seam = first.end_frame() as usize;
        let track = mix(vec![first, second], seam + 4_000);
        let step = track[seam - 8..seam + 8]
            .windows(2)
            .map(|w| (w[1] - w[0]).abs())
            .fold(0.0f32, f32::max);
        // A 300 Hz tone at 0.5 moves at most ~0.0196 per 48 kHz frame.
        assert!(step < 0.03, "seam step {step}");
    }

    #[test]
    fn reset_after_interruption_restarts_the_chain() {
        let mut chain = VoiceChain::new(48_000);
        let fresh = chain.place(1, &tone_buffer(0..2_400), 0.0, 0).unwrap();
        chain.reset();

        let replay = chain.place(2, &tone_buffer(0..2_400), 0.05, 0).unwrap();
        assert_eq!(replay.start_frame, 2_400);
        assert_eq!(replay.samples, fresh.samples);
    }

    #[test]
    fn gap_between_buffers_is_not_bridged() {
        let mut chain = VoiceChain::new(48_000);
        let first = chain.place(1, &tone_buffer(0..2_400), 0.0, 0).unwrap();
        let later = chain.place(2, &tone_buffer(0..2_400), 0.5, 0).unwrap();
        assert_eq!(later.start_frame, 24_000);
        assert_eq!(later.samples, first.samples);
    }

    #[test]
    fn late_buffer_starts_at_the_render_position() {
        let mut chain = VoiceChain::new(48_000);
        let voice = chain.place(1, &tone_buffer(0..240), 0.0, 960).unwrap();
        assert_eq!(voice.start_frame, 960);
    }

    #[cfg(feature = "audio-cpal")]
    #[test]
    fn mixed_block_converts_to_integer_formats() {
        let mixed = [0.0f32, 1.0, -1.0];
        let mut pcm16 = [7i16; 3];
        write_converted(&mixed, &mut pcm16);
        assert_eq!(pcm16[0], 0);
        assert!(pcm16[1] >= i16::MAX - 1);
        assert_eq!(pcm16[2], i16::MIN);

        let mut pcm8 = [0u8; 1];
        write_converted(&mixed[..1], &mut pcm8);
        assert_eq!(pcm8[0], 128);
    }

    #[test]
    fn overlapping_voices_sum_and_clamp() {
        let mut voices = vec![voice(1, 0, 2, 0.75), voice(2, 0, 2, 0.75)];
        let mut out = vec![0f32; 2];
        let mut finished = Vec::new();

        render_block(&mut voices, &mut out, 1, 0, &mut finished);
        assert_eq!(out, vec![1.0, 1.0]);
        assert_eq!(finished.len(), 2);
    }
}
