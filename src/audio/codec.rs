//! # PCM Codec
//!
//! Converts between normalized floating-point samples and 16-bit
//! little-endian signed PCM, and between raw bytes and the base64 text used
//! on the wire.
//!
//! ## Audio Format:
//! - **Capture**: 16kHz, mono, 16-bit PCM (`audio/pcm;rate=16000`)
//! - **Playback**: 24kHz, mono, 16-bit PCM as returned by the service
//! - **Encoding**: Little-endian signed integers, interleaved by channel
//!
//! ## Scaling:
//! Encoding multiplies by 32768 and truncates toward zero. Input outside
//! [-1, 1] is not clamped: the integer wraps to 16 bits, so `1.0` encodes as
//! `-32768`. Decoding divides by 32768.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};
use std::io::Cursor;

use crate::error::{LiveError, LiveResult};

/// Scale factor between normalized floats and 16-bit PCM.
pub const PCM_SCALE: f32 = 32768.0;

/// Bytes per 16-bit sample.
pub const BYTES_PER_SAMPLE: usize = 2;

/// Declared format of a PCM payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

impl AudioFormat {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self { sample_rate, channels }
    }

    pub fn mono(sample_rate: u32) -> Self {
        Self::new(sample_rate, 1)
    }

    /// Microphone format expected by the service.
    pub fn capture() -> Self {
        Self::mono(16_000)
    }

    /// Format of audio returned by the service.
    pub fn playback() -> Self {
        Self::mono(24_000)
    }

    /// MIME type declared on outbound frames.
    pub fn mime_type(&self) -> String {
        format!("audio/pcm;rate={}", self.sample_rate)
    }

    /// Parse a `audio/pcm;rate=N` MIME type, falling back to `default` for
    /// anything that is missing or unreadable.
    pub fn from_mime_type(mime: &str, default: AudioFormat) -> Self {
        let rate = mime
            .split(';')
            .filter_map(|param| param.trim().strip_prefix("rate="))
            .find_map(|value| value.trim().parse::<u32>().ok());

        match rate {
            Some(sample_rate) if sample_rate > 0 => Self::new(sample_rate, default.channels),
            _ => default,
        }
    }
}

/// Encoded 16-bit PCM payload plus its declared format.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedChunk {
    pub format: AudioFormat,
    pub bytes: Vec<u8>,
}

impl EncodedChunk {
    pub fn new(format: AudioFormat, bytes: Vec<u8>) -> Self {
        Self { format, bytes }
    }

    /// Build a chunk from its base64 transport representation.
    pub fn from_transport_text(text: &str, format: AudioFormat) -> LiveResult<Self> {
        Ok(Self::new(format, from_transport_text(text)?))
    }

    pub fn to_transport_text(&self) -> String {
        to_transport_text(&self.bytes)
    }

    pub fn mime_type(&self) -> String {
        self.format.mime_type()
    }

    /// Number of sample frames (one sample per channel) in the payload.
    pub fn frame_count(&self) -> usize {
        let frame_bytes = BYTES_PER_SAMPLE * self.format.channels.max(1) as usize;
        self.bytes.len() / frame_bytes
    }

    pub fn duration_secs(&self) -> f64 {
        if self.format.sample_rate == 0 {
            return 0.0;
        }
        self.frame_count() as f64 / self.format.sample_rate as f64
    }
}

/// Decoded PCM, one sample vector per channel.
#[derive(Debug, Clone, PartialEq)]
pub struct PcmBuffer {
    pub sample_rate: u32,
    pub channels: Vec<Vec<f32>>,
}

impl PcmBuffer {
    pub fn frame_count(&self) -> usize {
        self.channels.first().map(Vec::len).unwrap_or(0)
    }

    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frame_count() as f64 / self.sample_rate as f64
    }

    /// Average all channels into one.
    pub fn to_mono(&self) -> Vec<f32> {
        match self.channels.len() {
            0 => Vec::new(),
            1 => self.channels[0].clone(),
            n => (0..self.frame_count())
                .map(|i| self.channels.iter().map(|ch| ch[i]).sum::<f32>() / n as f32)
                .collect(),
        }
    }
}

/// Convert one float sample to 16-bit PCM with wrap-around semantics.
fn quantize(sample: f32) -> i16 {
    let scaled = (sample * PCM_SCALE) as f64;
    if !scaled.is_finite() {
        return 0;
    }
    // f64 -> i64 truncates toward zero, i64 -> i16 keeps the low 16 bits
    (scaled.trunc() as i64) as i16
}

/// Encode normalized samples as 16-bit little-endian PCM.
///
/// Samples are written in the order given; for multi-channel formats the
/// caller passes them already interleaved.
pub fn encode_frame(samples: &[f32], format: AudioFormat) -> EncodedChunk {
    let mut bytes = Vec::with_capacity(samples.len() * BYTES_PER_SAMPLE);
    for &sample in samples {
        // Writing into a Vec cannot fail
        let _ = bytes.write_i16::<LittleEndian>(quantize(sample));
    }
    EncodedChunk::new(format, bytes)
}

/// Decode 16-bit little-endian PCM into per-channel float samples.
///
/// ## Errors:
/// Returns `MalformedAudio` if the channel count is zero or the byte length
/// is not a multiple of `2 * channels`.
pub fn decode_chunk(bytes: &[u8], sample_rate: u32, channels: u16) -> LiveResult<PcmBuffer> {
    if channels == 0 {
        return Err(LiveError::MalformedAudio("channel count must be at least 1".to_string()));
    }

    let channel_count = channels as usize;
    let frame_bytes = BYTES_PER_SAMPLE * channel_count;
    if bytes.len() % frame_bytes != 0 {
        return Err(LiveError::MalformedAudio(format!(
            "{} bytes is not a multiple of {} ({} channel(s) of 16-bit PCM)",
            bytes.len(),
            frame_bytes,
            channels
        )));
    }

    let frame_count = bytes.len() / frame_bytes;
    let mut decoded = vec![Vec::with_capacity(frame_count); channel_count];
    let mut cursor = Cursor::new(bytes);

    for _ in 0..frame_count {
        for channel in decoded.iter_mut() {
            let sample = cursor
                .read_i16::<LittleEndian>()
                .map_err(|e| LiveError::MalformedAudio(e.to_string()))?;
            channel.push(sample as f32 / PCM_SCALE);
        }
    }

    Ok(PcmBuffer {
        sample_rate,
        channels: decoded,
    })
}

/// Decode an [`EncodedChunk`] using its declared format.
pub fn decode_encoded(chunk: &EncodedChunk) -> LiveResult<PcmBuffer> {
    decode_chunk(&chunk.bytes, chunk.format.sample_rate, chunk.format.channels)
}

/// Standard base64 encoding of raw bytes.
pub fn to_transport_text(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// Inverse of [`to_transport_text`].
pub fn from_transport_text(text: &str) -> LiveResult<Vec<u8>> {
    Ok(STANDARD.decode(text.trim())?)
}
