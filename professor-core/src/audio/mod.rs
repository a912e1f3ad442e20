//! Audio devices.
//!
//! The controller never touches cpal directly. It acquires devices through
//! an [`AudioBackend`], which hands back an [`InputStream`] (microphone
//! feeding the capture ring) and an [`AudioOutput`] (speaker clock and source
//! scheduling). Two backends exist:
//!
//! - [`CpalBackend`]: real devices via cpal (feature `audio-cpal`);
//! - [`virtual_device::VirtualBackend`]: a manual clock, for tests and the
//!   replay tool.
//!
//! # Threading note
//!
//! `cpal::Stream` is `!Send` on most platforms (COM on Windows, CoreAudio on
//! macOS). Streams are therefore opened and dropped on the session worker
//! thread; the backend itself is `Send` and only carries device preferences.

pub mod capture;
pub mod device;
pub mod output;
pub mod resample;
pub mod virtual_device;

use crate::buffering::AudioProducer;
use crate::engine::events::EventSender;
use crate::error::Result;
use crate::playback::AudioOutput;

#[cfg(not(feature = "audio-cpal"))]
use crate::error::ProfessorError;

/// A live microphone stream writing mono f32 into the capture ring.
pub trait InputStream {
    /// Rate of the samples pushed into the ring (Hz).
    fn sample_rate(&self) -> u32;

    /// Stop the stream and release the input device. Idempotent.
    fn close(&mut self);
}

/// Factory for the exclusive audio resources of one session.
pub trait AudioBackend: Send + 'static {
    /// Open the output device. Natural completion of each started source is
    /// reported through `events`.
    ///
    /// # Errors
    /// A device error when no usable output exists.
    fn open_output(&mut self, events: EventSender) -> Result<Box<dyn AudioOutput>>;

    /// Open the input device and start pushing captured samples into `producer`.
    ///
    /// # Errors
    /// A device error when no usable input exists.
    fn open_input(
        &mut self,
        producer: AudioProducer,
        events: EventSender,
    ) -> Result<Box<dyn InputStream>>;
}

/// Real microphone and speakers through cpal.
#[derive(Debug, Clone, Default)]
pub struct CpalBackend {
    pub preferred_input: Option<String>,
    pub preferred_output: Option<String>,
}

impl CpalBackend {
    pub fn new(preferred_input: Option<String>, preferred_output: Option<String>) -> Self {
        Self {
            preferred_input,
            preferred_output,
        }
    }
}

#[cfg(feature = "audio-cpal")]
impl AudioBackend for CpalBackend {
    fn open_output(&mut self, events: EventSender) -> Result<Box<dyn AudioOutput>> {
        let output =
            output::CpalOutput::open_with_preference(self.preferred_output.as_deref(), events)?;
        Ok(Box::new(output))
    }

    fn open_input(
        &mut self,
        producer: AudioProducer,
        events: EventSender,
    ) -> Result<Box<dyn InputStream>> {
        let input = capture::AudioCapture::open_with_preference(
            producer,
            self.preferred_input.as_deref(),
            events,
        )?;
        Ok(Box::new(input))
    }
}

/// Stub when the `audio-cpal` feature is disabled.
#[cfg(not(feature = "audio-cpal"))]
impl AudioBackend for CpalBackend {
    fn open_output(&mut self, _events: EventSender) -> Result<Box<dyn AudioOutput>> {
        Err(ProfessorError::DeviceAcquisition(
            "compiled without audio-cpal feature".into(),
        ))
    }

    fn open_input(
        &mut self,
        _producer: AudioProducer,
        _events: EventSender,
    ) -> Result<Box<dyn InputStream>> {
        Err(ProfessorError::DeviceAcquisition(
            "compiled without audio-cpal feature".into(),
        ))
    }
}
