//! # Audio Capture Pipeline
//!
//! Turns the continuous microphone signal into fixed-size encoded frames.
//!
//! ## Key Components:
//! - **InputDevice**: the microphone seam; real hardware lives in `cpal_device`,
//!   tests use a fake that pushes samples by hand
//! - **FrameSlicer**: accumulates arbitrary-length device callbacks and emits
//!   frames of exactly `frame_size` samples
//! - **CaptureHandle**: owns the opened device for the lifetime of a stream;
//!   stopping it releases the device and is idempotent
//!
//! ## Ordering:
//! Frames are emitted synchronously inside the device callback, in the order
//! samples arrived. A frame is never emitted twice and never reordered.

use std::sync::Arc;
use tracing::{debug, info};

use crate::audio::codec::{encode_frame, AudioFormat, EncodedChunk};
use crate::error::{LiveError, LiveResult};
use crate::state::SessionMetrics;

/// Callback receiving raw microphone samples (mono, normalized floats).
pub type SampleSink = Box<dyn FnMut(&[f32]) + Send + 'static>;

/// A microphone that has already been granted to this process.
///
/// Acquiring the device (and therefore the permission prompt) happens in
/// [`AudioBackend::open_input`](crate::audio::AudioBackend::open_input);
/// `start` only begins delivering samples.
pub trait InputDevice: Send {
    /// Sample rate of the samples passed to the sink.
    fn sample_rate(&self) -> u32;

    /// Begin delivering samples to `sink`, in chronological order.
    fn start(&mut self, sink: SampleSink) -> LiveResult<()>;

    /// Stop delivering samples and release the hardware. Must be idempotent.
    fn stop(&mut self);
}

/// Slices a continuous signal into frames of a fixed sample count.
#[derive(Debug)]
pub struct FrameSlicer {
    frame_size: usize,
    pending: Vec<f32>,
}

impl FrameSlicer {
    pub fn new(frame_size: usize) -> Self {
        Self {
            frame_size: frame_size.max(1),
            pending: Vec::with_capacity(frame_size.max(1)),
        }
    }

    /// Samples buffered towards the next frame.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Append `samples` and call `emit` once for every completed frame.
    pub fn push<F>(&mut self, mut samples: &[f32], mut emit: F)
    where
        F: FnMut(&[f32]),
    {
        while !samples.is_empty() {
            let wanted = self.frame_size - self.pending.len();
            let take = wanted.min(samples.len());

            if self.pending.is_empty() && take == self.frame_size {
                // Whole frame available in the input, skip the copy
                emit(&samples[..take]);
            } else {
                self.pending.extend_from_slice(&samples[..take]);
                if self.pending.len() == self.frame_size {
                    emit(&self.pending);
                    self.pending.clear();
                }
            }
            samples = &samples[take..];
        }
    }
}

/// Capture pipeline configuration for one stream.
#[derive(Debug, Clone, Copy)]
pub struct CaptureSettings {
    pub format: AudioFormat,
    pub frame_size: usize,
}

/// Starts microphone streams that deliver encoded frames.
pub struct CapturePipeline;

impl CapturePipeline {
    /// Start streaming `device` as encoded frames into `on_frame`.
    ///
    /// The device is owned by the returned handle until it is stopped.
    ///
    /// ## Errors:
    /// Propagates the device's start error, e.g. `PermissionDenied` when the
    /// OS revokes access between acquisition and start.
    pub fn start<F>(
        mut device: Box<dyn InputDevice>,
        settings: CaptureSettings,
        metrics: Arc<SessionMetrics>,
        mut on_frame: F,
    ) -> LiveResult<CaptureHandle>
    where
        F: FnMut(EncodedChunk) + Send + 'static,
    {
        if device.sample_rate() != settings.format.sample_rate {
            return Err(LiveError::Device(format!(
                "microphone delivers {} Hz but frames are declared as {} Hz",
                device.sample_rate(),
                settings.format.sample_rate
            )));
        }

        let mut slicer = FrameSlicer::new(settings.frame_size);
        let format = settings.format;

        let sink: SampleSink = Box::new(move |samples: &[f32]| {
            slicer.push(samples, |frame| {
                metrics.record_frame_captured();
                on_frame(encode_frame(frame, format));
            });
        });

        device.start(sink)?;
        info!(
            sample_rate = format.sample_rate,
            frame_size = settings.frame_size,
            "Audio capture started"
        );

        Ok(CaptureHandle {
            device: Some(device),
        })
    }
}

/// Running capture stream. Dropping the handle stops it.
pub struct CaptureHandle {
    device: Option<Box<dyn InputDevice>>,
}

impl CaptureHandle {
    /// Release the microphone. Calling this on a stopped handle is a no-op.
    pub fn stop(&mut self) {
        if let Some(mut device) = self.device.take() {
            device.stop();
            info!("Audio capture stopped");
        } else {
            debug!("Audio capture already stopped");
        }
    }

    pub fn is_active(&self) -> bool {
        self.device.is_some()
    }
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::codec::decode_encoded;
    use crate::testing::FakeMicrophone;
    use std::sync::Mutex;

    fn settings(frame_size: usize) -> CaptureSettings {
        CaptureSettings {
            format: AudioFormat::capture(),
            frame_size,
        }
    }

    #[test]
    fn test_slicer_emits_fixed_frames() {
        let mut slicer = FrameSlicer::new(4);
        let mut frames = Vec::new();

        slicer.push(&[0.1, 0.2, 0.3], |f| frames.push(f.to_vec()));
        assert!(frames.is_empty());
        assert_eq!(slicer.pending(), 3);

        slicer.push(&[0.4, 0.5, 0.6, 0.7, 0.8, 0.9, 1.0], |f| frames.push(f.to_vec()));
        assert_eq!(frames, vec![vec![0.1, 0.2, 0.3, 0.4], vec![0.5, 0.6, 0.7, 0.8]]);
        assert_eq!(slicer.pending(), 2);
    }

    #[test]
    fn test_slicer_passes_whole_frames_through() {
        let mut slicer = FrameSlicer::new(2);
        let mut frames = Vec::new();
        slicer.push(&[1.0, 2.0, 3.0, 4.0], |f| frames.push(f.to_vec()));
        assert_eq!(frames, vec![vec![1.0, 2.0], vec![3.0, 4.0]]);
        assert_eq!(slicer.pending(), 0);
    }

    #[test]
    fn test_capture_frames_in_order() {
        let mic = FakeMicrophone::new(16_000);
        let control = mic.control();
        let frames = Arc::new(Mutex::new(Vec::new()));
        let sink = frames.clone();

        let mut handle = CapturePipeline::start(
            Box::new(mic),
            settings(4),
            SessionMetrics::shared(),
            move |chunk| sink.lock().unwrap().push(chunk),
        )
        .unwrap();

        // Ten samples of a ramp delivered in uneven callbacks
        let ramp: Vec<f32> = (0..10).map(|i| i as f32 / 100.0).collect();
        control.push(&ramp[..3]);
        control.push(&ramp[3..9]);
        control.push(&ramp[9..]);

        let frames = frames.lock().unwrap();
        assert_eq!(frames.len(), 2);
        let first = decode_encoded(&frames[0]).unwrap();
        let second = decode_encoded(&frames[1]).unwrap();
        assert!(first.channels[0][0] < second.channels[0][0]);
        assert_eq!(frames[0].mime_type(), "audio/pcm;rate=16000");

        handle.stop();
        assert!(!control.is_streaming());
    }

    #[test]
    fn test_stop_is_idempotent() {
        let mic = FakeMicrophone::new(16_000);
        let control = mic.control();
        let mut handle =
            CapturePipeline::start(Box::new(mic), settings(4), SessionMetrics::shared(), |_| {})
                .unwrap();

        handle.stop();
        handle.stop();
        assert!(!handle.is_active());
        assert_eq!(control.stop_calls(), 1);
    }

    #[test]
    fn test_rate_mismatch_is_rejected() {
        let mic = FakeMicrophone::new(48_000);
        let result =
            CapturePipeline::start(Box::new(mic), settings(4), SessionMetrics::shared(), |_| {});
        assert!(matches!(result, Err(LiveError::Device(_))));
    }
}
