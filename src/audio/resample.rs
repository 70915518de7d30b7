//! # Sample Rate Conversion
//!
//! Streaming resampler between a device's native rate and the rates the
//! service speaks, built on `rubato::FftFixedIn`.
//!
//! ## How it works:
//! - Device callbacks arrive in arbitrary lengths; they are gathered into the
//!   fixed input blocks the FFT resampler needs
//! - Resampler state carries over from one call to the next, so nothing is
//!   lost or duplicated at callback boundaries
//! - The filter delay is trimmed from the start of the output: output sample
//!   `n` lines up with input time `n / to_rate`
//! - `finish` pads with silence until the output covers exactly the input's
//!   duration
//!
//! Equal rates pass samples straight through.

use rubato::{FftFixedIn, Resampler};

use crate::error::{LiveError, LiveResult};

/// Requested input block size, in frames.
const BLOCK_FRAMES: usize = 512;

/// Upper bound on silent blocks pushed by `finish`.
const MAX_FLUSH_BLOCKS: usize = 32;

/// Mono resampler that keeps its state across calls.
pub struct StreamResampler {
    from_rate: u32,
    to_rate: u32,
    inner: Option<FftFixedIn<f32>>,
    block: Vec<f32>,
    block_frames: usize,
    /// Output samples still to discard for the filter delay
    delay: usize,
    frames_in: u64,
    frames_out: u64,
}

impl StreamResampler {
    pub fn new(from_rate: u32, to_rate: u32) -> LiveResult<Self> {
        if from_rate == 0 || to_rate == 0 {
            return Err(LiveError::Device(format!(
                "cannot resample {} Hz to {} Hz",
                from_rate, to_rate
            )));
        }

        let inner = if from_rate == to_rate {
            None
        } else {
            let resampler =
                FftFixedIn::<f32>::new(from_rate as usize, to_rate as usize, BLOCK_FRAMES, 1, 1)
                    .map_err(|e| {
                        LiveError::Device(format!(
                            "cannot resample {} Hz to {} Hz: {}",
                            from_rate, to_rate, e
                        ))
                    })?;
            Some(resampler)
        };

        let block_frames = inner
            .as_ref()
            .map(|r| r.input_frames_next())
            .unwrap_or(BLOCK_FRAMES);
        let delay = inner.as_ref().map(|r| r.output_delay()).unwrap_or(0);

        Ok(Self {
            from_rate,
            to_rate,
            inner,
            block: Vec::with_capacity(block_frames),
            block_frames,
            delay,
            frames_in: 0,
            frames_out: 0,
        })
    }

    /// Feed `input` and call `emit` with every stretch of output produced.
    pub fn push<F>(&mut self, mut input: &[f32], mut emit: F) -> LiveResult<()>
    where
        F: FnMut(&[f32]),
    {
        self.frames_in += input.len() as u64;

        if self.inner.is_none() {
            if !input.is_empty() {
                self.frames_out += input.len() as u64;
                emit(input);
            }
            return Ok(());
        }

        while !input.is_empty() {
            let take = (self.block_frames - self.block.len()).min(input.len());
            self.block.extend_from_slice(&input[..take]);
            input = &input[take..];

            if self.block.len() == self.block_frames {
                self.process_block(None, &mut emit)?;
            }
        }
        Ok(())
    }

    /// Flush what is still buffered, padding with silence, until the output
    /// length matches the input duration at the target rate.
    pub fn finish<F>(&mut self, mut emit: F) -> LiveResult<()>
    where
        F: FnMut(&[f32]),
    {
        if self.inner.is_none() {
            return Ok(());
        }

        let expected = self.expected_output();
        for _ in 0..MAX_FLUSH_BLOCKS {
            if self.frames_out >= expected {
                break;
            }
            self.block.resize(self.block_frames, 0.0);
            self.process_block(Some(expected), &mut emit)?;
        }
        self.block.clear();
        Ok(())
    }

    /// Output frames produced so far.
    pub fn frames_out(&self) -> u64 {
        self.frames_out
    }

    fn expected_output(&self) -> u64 {
        (self.frames_in as f64 * self.to_rate as f64 / self.from_rate as f64).round() as u64
    }

    fn process_block<F>(&mut self, limit: Option<u64>, emit: &mut F) -> LiveResult<()>
    where
        F: FnMut(&[f32]),
    {
        let Some(inner) = self.inner.as_mut() else {
            return Ok(());
        };
        let result = inner.process(&[&self.block[..]], None);
        self.block.clear();

        let output = result.map_err(|e| LiveError::Device(format!("resampling failed: {}", e)))?;
        let Some(samples) = output.first() else {
            return Ok(());
        };

        let skip = self.delay.min(samples.len());
        self.delay -= skip;
        let mut samples = &samples[skip..];

        if let Some(limit) = limit {
            let room = limit.saturating_sub(self.frames_out) as usize;
            samples = &samples[..room.min(samples.len())];
        }

        if !samples.is_empty() {
            self.frames_out += samples.len() as u64;
            emit(samples);
        }
        Ok(())
    }
}

/// Resample one self-contained buffer.
pub fn resample_once(samples: &[f32], from_rate: u32, to_rate: u32) -> LiveResult<Vec<f32>> {
    if from_rate == to_rate {
        return Ok(samples.to_vec());
    }
    let mut resampler = StreamResampler::new(from_rate, to_rate)?;
    let mut output = Vec::new();
    resampler.push(samples, |chunk| output.extend_from_slice(chunk))?;
    resampler.finish(|chunk| output.extend_from_slice(chunk))?;
    Ok(output)
}
