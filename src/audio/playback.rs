//! # Playback Scheduler
//!
//! Schedules decoded model audio back-to-back on the output device.
//!
//! ## Scheduling Rule:
//! A running cursor holds the next free start time on the device clock. Each
//! unit starts at `max(cursor, device_now)` and the cursor advances by the
//! unit's duration. Under steady delivery units abut exactly; when delivery
//! lags behind the device clock the next unit starts "now" instead of in the
//! past, so units never overlap.
//!
//! ## Interruption:
//! `flush()` stops every unit that is playing or waiting to play and pulls
//! the cursor back to the device's current time, so the first unit of the
//! next model turn plays immediately.

use std::collections::VecDeque;
use tracing::{debug, info};

use crate::audio::codec::{decode_encoded, EncodedChunk, PcmBuffer};
use crate::error::LiveResult;

/// A speaker that plays buffers at absolute times on its own clock.
pub trait OutputDevice: Send {
    /// Current position of the device clock, in seconds.
    fn current_time(&self) -> f64;

    /// Queue `buffer` to start playing at `start_at` seconds on the device clock.
    fn schedule(&mut self, unit_id: u64, buffer: PcmBuffer, start_at: f64) -> LiveResult<()>;

    /// Stop a unit, whether it is already playing or still waiting.
    fn stop_unit(&mut self, unit_id: u64);

    /// Release the hardware. Must be idempotent.
    fn close(&mut self);
}

/// One decoded buffer placed on the device timeline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlaybackUnit {
    pub id: u64,
    pub start: f64,
    pub duration: f64,
}

impl PlaybackUnit {
    pub fn end(&self) -> f64 {
        self.start + self.duration
    }
}

/// Gapless scheduler for one session's output device.
pub struct PlaybackScheduler {
    device: Option<Box<dyn OutputDevice>>,
    cursor: f64,
    units: VecDeque<PlaybackUnit>,
    next_id: u64,
}

impl PlaybackScheduler {
    pub fn new(device: Box<dyn OutputDevice>) -> Self {
        let cursor = device.current_time();
        Self {
            device: Some(device),
            cursor,
            units: VecDeque::new(),
            next_id: 0,
        }
    }

    /// Decode `chunk` and schedule it right after everything already queued.
    ///
    /// ## Returns:
    /// - **Ok(Some(unit))**: the unit was placed on the timeline
    /// - **Ok(None)**: the scheduler is closed, or the chunk holds no samples
    /// - **Err(MalformedAudio)**: the chunk could not be decoded and was dropped;
    ///   the schedule is unchanged
    pub fn enqueue(&mut self, chunk: &EncodedChunk) -> LiveResult<Option<PlaybackUnit>> {
        let Some(device) = self.device.as_mut() else {
            debug!("Playback closed, ignoring audio chunk");
            return Ok(None);
        };

        let buffer = decode_encoded(chunk)?;
        let duration = buffer.duration_secs();
        if buffer.frame_count() == 0 {
            return Ok(None);
        }

        let now = device.current_time();
        // Completed units no longer need to be tracked
        self.units.retain(|unit| unit.end() > now);

        let start = self.cursor.max(now);
        let unit = PlaybackUnit {
            id: self.next_id,
            start,
            duration,
        };
        self.next_id += 1;

        device.schedule(unit.id, buffer, start)?;
        self.cursor = start + duration;
        self.units.push_back(unit);

        debug!(
            unit_id = unit.id,
            start = unit.start,
            duration = unit.duration,
            "Scheduled playback unit"
        );
        Ok(Some(unit))
    }

    /// Stop everything scheduled or playing and reset the cursor to now.
    pub fn flush(&mut self) {
        let Some(device) = self.device.as_mut() else {
            return;
        };

        let stopped = self.units.len();
        for unit in self.units.drain(..) {
            device.stop_unit(unit.id);
        }
        self.cursor = device.current_time();

        if stopped > 0 {
            info!(stopped, "Playback flushed");
        }
    }

    /// Flush and release the output device. Idempotent.
    pub fn close(&mut self) {
        self.flush();
        if let Some(mut device) = self.device.take() {
            device.close();
            info!("Playback device closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.device.is_none()
    }

    /// Next free start time on the device clock.
    pub fn cursor(&self) -> f64 {
        self.cursor
    }

    /// Units that are playing or waiting to play.
    pub fn scheduled_units(&self) -> Vec<PlaybackUnit> {
        let now = self
            .device
            .as_ref()
            .map(|device| device.current_time())
            .unwrap_or(f64::INFINITY);
        self.units.iter().filter(|unit| unit.end() > now).copied().collect()
    }
}

impl Drop for PlaybackScheduler {
    fn drop(&mut self) {
        self.close();
    }
}
