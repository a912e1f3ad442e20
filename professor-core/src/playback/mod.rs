//! Gapless playback scheduling.
//!
//! Spoken replies arrive as independent messages with arbitrary jitter.
//! `PlaybackScheduler` lays them end to end on the output device's clock:
//!
//! ```text
//! cursor = max(cursor, now)
//! start buffer at cursor
//! cursor += buffer.duration
//! ```
//!
//! As long as delivery keeps pace with playback there is no silence between
//! buffers and never any overlap. When delivery falls behind, the next
//! buffer re-anchors to `now`.

use std::collections::BTreeMap;

use tracing::{debug, info};

use crate::buffering::chunk::PlaybackBuffer;
use crate::error::Result;

/// Identifies one scheduled buffer on the output device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceId(pub u64);

/// Output device as seen by the scheduler.
///
/// The device owns playback of started sources and reports each natural
/// completion through the session event queue (`EventSender::playback_ended`).
/// Stopped sources need not be reported.
pub trait AudioOutput {
    /// Current position of the device clock, in seconds.
    fn current_time(&self) -> f64;

    /// Schedule `buffer` to begin at device time `start_at`.
    fn start_source(&mut self, id: SourceId, buffer: PlaybackBuffer, start_at: f64) -> Result<()>;

    /// Halt a source immediately, wherever it is.
    fn stop_source(&mut self, id: SourceId);

    /// Release the device.
    fn close(&mut self);
}

/// Placement of one buffer on the device clock.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledSource {
    pub id: SourceId,
    pub start: f64,
    pub duration: f64,
}

impl ScheduledSource {
    pub fn end(&self) -> f64 {
        self.start + self.duration
    }
}

/// Outcome of an end-of-playback notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackStatus {
    /// Other sources are still scheduled or playing.
    Playing,
    /// The last active source finished; nothing is queued.
    Drained,
    /// The id was not active (already stopped by an interrupt, or stale).
    Ignored,
}

pub struct PlaybackScheduler {
    output: Option<Box<dyn AudioOutput>>,
    /// Device time at which the next buffer starts. 0.0 = not anchored.
    cursor: f64,
    active: BTreeMap<SourceId, ScheduledSource>,
    next_id: u64,
}

impl PlaybackScheduler {
    pub fn new(output: Box<dyn AudioOutput>) -> Self {
        Self {
            output: Some(output),
            cursor: 0.0,
            active: BTreeMap::new(),
            next_id: 0,
        }
    }

    /// Schedule `buffer` directly after everything already queued.
    ///
    /// Returns `Ok(None)` for empty buffers and after `shutdown()`.
    pub fn enqueue(&mut self, buffer: PlaybackBuffer) -> Result<Option<ScheduledSource>> {
        let Some(output) = self.output.as_mut() else {
            return Ok(None);
        };
        if buffer.is_empty() {
            debug!("skipping empty playback buffer");
            return Ok(None);
        }

        let now = output.current_time();
        self.cursor = self.cursor.max(now);

        let id = SourceId(self.next_id);
        self.next_id += 1;
        let scheduled = ScheduledSource {
            id,
            start: self.cursor,
            duration: buffer.duration_secs(),
        };

        output.start_source(id, buffer, scheduled.start)?;
        self.active.insert(id, scheduled);
        self.cursor += scheduled.duration;

        debug!(
            source = id.0,
            start = scheduled.start,
            duration = scheduled.duration,
            queued = self.active.len(),
            "buffer scheduled"
        );
        Ok(Some(scheduled))
    }

    /// Record that `id` finished playing naturally.
    pub fn source_ended(&mut self, id: SourceId) -> PlaybackStatus {
        if self.active.remove(&id).is_none() {
            return PlaybackStatus::Ignored;
        }
        if self.active.is_empty() {
            PlaybackStatus::Drained
        } else {
            PlaybackStatus::Playing
        }
    }

    /// Stop everything now and forget the cursor. Returns how many sources were cut.
    pub fn interrupt(&mut self) -> usize {
        let stopped = self.stop_all();
        self.cursor = 0.0;
        if stopped > 0 {
            info!(stopped, "playback interrupted");
        }
        stopped
    }

    /// Stop everything and release the output device. Idempotent.
    pub fn shutdown(&mut self) {
        self.stop_all();
        self.cursor = 0.0;
        if let Some(mut output) = self.output.take() {
            output.close();
            debug!("output device released");
        }
    }

    fn stop_all(&mut self) -> usize {
        let ids: Vec<SourceId> = std::mem::take(&mut self.active).into_keys().collect();
        if let Some(output) = self.output.as_mut() {
            for id in &ids {
                output.stop_source(*id);
            }
        }
        ids.len()
    }

    pub fn active_len(&self) -> usize {
        self.active.len()
    }

    pub fn is_idle(&self) -> bool {
        self.active.is_empty()
    }

    pub fn cursor(&self) -> f64 {
        self.cursor
    }

    pub fn is_shut_down(&self) -> bool {
        self.output.is_none()
    }
}

impl Drop for PlaybackScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}
