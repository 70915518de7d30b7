//! # Audio Module
//!
//! Everything that touches PCM samples: the codec, the microphone capture
//! pipeline, and the gapless playback scheduler.
//!
//! ## Key Components:
//! - **codec**: float <-> 16-bit PCM conversion and base64 transport text
//! - **capture**: slices the microphone signal into fixed-size encoded frames
//! - **playback**: schedules received audio back-to-back, flushes on barge-in
//! - **resample**: streaming sample rate conversion between device and wire rates
//! - **cpal_device**: real hardware backend (behind the `device` feature)
//!
//! ## Audio Format Requirements:
//! - **Capture**: 16kHz, mono, 16-bit PCM
//! - **Playback**: 24kHz, mono, 16-bit PCM
//! - **Encoding**: Little-endian signed integers
//!
//! The session controller never talks to hardware directly. It asks an
//! [`AudioBackend`] for devices, which keeps the controller testable with
//! in-memory fakes.

pub mod capture; // Microphone framing
pub mod codec; // PCM encode/decode
pub mod playback; // Gapless scheduling
pub mod resample; // Rate conversion

#[cfg(feature = "device")]
pub mod cpal_device; // Hardware backend

use crate::audio::capture::InputDevice;
use crate::audio::codec::AudioFormat;
use crate::audio::playback::OutputDevice;
use crate::error::LiveResult;

/// Source of microphone and speaker devices.
///
/// ## Permissions:
/// `open_input` is where the user is asked for microphone access. A refusal
/// is reported as `LiveError::PermissionDenied` and nothing stays open.
pub trait AudioBackend: Send + Sync {
    /// Acquire the microphone, delivering samples in `format`.
    fn open_input(&self, format: AudioFormat) -> LiveResult<Box<dyn InputDevice>>;

    /// Acquire the speaker for buffers in `format`.
    fn open_output(&self, format: AudioFormat) -> LiveResult<Box<dyn OutputDevice>>;
}
