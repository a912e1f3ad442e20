//! Microphone capture via cpal.
//!
//! # Design constraints
//!
//! The cpal input callback runs on an OS audio thread at elevated priority.
//! It must not block on a mutex or perform I/O, and should not allocate once
//! warmed up. It downmixes to mono into a reused scratch buffer and writes
//! into the SPSC ring producer, whose `push_slice` is lock-free.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use crate::audio::InputStream;
use crate::buffering::AudioProducer;
use crate::engine::events::EventSender;
use crate::error::Result;

#[cfg(feature = "audio-cpal")]
use crate::buffering::Producer;
#[cfg(feature = "audio-cpal")]
use crate::error::ProfessorError;
#[cfg(feature = "audio-cpal")]
use cpal::{
    traits::{DeviceTrait, StreamTrait},
    FromSample, SampleFormat, SampleRate, SizedSample, Stream, StreamConfig,
};
#[cfg(feature = "audio-cpal")]
use tracing::{error, info, warn};

/// Handle to an active microphone stream.
///
/// **Not `Send`**: `cpal::Stream` is bound to its creation thread on
/// Windows/macOS. Create and drop it on the same OS thread.
pub struct AudioCapture {
    #[cfg(feature = "audio-cpal")]
    stream: Option<Stream>,
    /// Set to `false` to make the callback a no-op.
    running: Arc<AtomicBool>,
    /// Device capture rate (Hz).
    pub sample_rate: u32,
}

#[cfg(feature = "audio-cpal")]
impl AudioCapture {
    /// Open the preferred input device (or the default) and push mono f32
    /// samples into `producer`.
    ///
    /// Stream errors reported later by cpal are posted to `events` as a
    /// device failure.
    ///
    /// # Errors
    /// `NoDefaultInputDevice` when no microphone exists, `DeviceAcquisition`
    /// or `AudioStream` when cpal refuses the device.
    pub fn open_with_preference(
        producer: AudioProducer,
        preferred_device_name: Option<&str>,
        events: EventSender,
    ) -> Result<Self> {
        use crate::audio::device::{select_device, Direction};

        let host = cpal::default_host();
        let device = select_device(&host, Direction::Input, preferred_device_name)?;

        info!(
            device = device.name().unwrap_or_default().as_str(),
            "opening input device"
        );

        let supported = device
            .default_input_config()
            .map_err(|e| ProfessorError::DeviceAcquisition(e.to_string()))?;
        let sample_rate = supported.sample_rate().0;
        let channels = supported.channels();
        info!(sample_rate, channels, "input config selected");

        let config = StreamConfig {
            channels,
            sample_rate: SampleRate(sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let running = Arc::new(AtomicBool::new(true));
        let stream = match supported.sample_format() {
            SampleFormat::F32 => {
                build_mono_stream::<f32>(&device, &config, producer, &running, events)?
            }
            SampleFormat::I16 => {
                build_mono_stream::<i16>(&device, &config, producer, &running, events)?
            }
            SampleFormat::U8 => {
                build_mono_stream::<u8>(&device, &config, producer, &running, events)?
            }
            fmt => {
                return Err(ProfessorError::AudioStream(format!(
                    "unsupported input sample format: {fmt:?}"
                )))
            }
        };

        stream
            .play()
            .map_err(|e| ProfessorError::AudioStream(e.to_string()))?;

        Ok(Self {
            stream: Some(stream),
            running,
            sample_rate,
        })
    }
}

#[cfg(feature = "audio-cpal")]
fn build_mono_stream<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    mut producer: AudioProducer,
    running: &Arc<AtomicBool>,
    events: EventSender,
) -> Result<Stream>
where
    T: SizedSample + Send + 'static,
    f32: FromSample<T>,
{
    let ch = (config.channels as usize).max(1);
    let running = Arc::clone(running);
    let mut mono: Vec<f32> = Vec::new();

    device
        .build_input_stream(
            config,
            move |data: &[T], _info: &cpal::InputCallbackInfo| {
                if !running.load(Ordering::Relaxed) {
                    return;
                }
                let frames = data.len() / ch;
                mono.resize(frames, 0.0);
                for (f, out) in mono.iter_mut().enumerate() {
                    let base = f * ch;
                    let sum: f32 = data[base..base + ch]
                        .iter()
                        .map(|s| <f32 as FromSample<T>>::from_sample_(*s))
                        .sum();
                    *out = sum / ch as f32;
                }
                let written = producer.push_slice(&mono);
                if written < mono.len() {
                    warn!("capture ring full: dropped {} samples", mono.len() - written);
                }
            },
            move |err| {
                error!("input stream error: {err}");
                events.device_failed(format!("input stream: {err}"));
            },
            None,
        )
        .map_err(|e| ProfessorError::AudioStream(e.to_string()))
}

/// Stub when the `audio-cpal` feature is disabled.
#[cfg(not(feature = "audio-cpal"))]
impl AudioCapture {
    pub fn open_with_preference(
        _producer: AudioProducer,
        _preferred_device_name: Option<&str>,
        _events: EventSender,
    ) -> Result<Self> {
        Err(crate::error::ProfessorError::DeviceAcquisition(
            "compiled without audio-cpal feature".into(),
        ))
    }
}

impl InputStream for AudioCapture {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn close(&mut self) {
        self.running.store(false, Ordering::Release);
        self.release_stream();
    }
}

impl AudioCapture {
    #[cfg(feature = "audio-cpal")]
    fn release_stream(&mut self) {
        if let Some(stream) = self.stream.take() {
            if let Err(e) = stream.pause() {
                warn!("failed to pause input stream: {e}");
            }
            info!("input device released");
        }
    }

    #[cfg(not(feature = "audio-cpal"))]
    fn release_stream(&mut self) {}
}

impl Drop for AudioCapture {
    fn drop(&mut self) {
        self.close();
    }
}
