//! # Hardware Audio Backend
//!
//! Microphone and speaker on the host's default devices, via `cpal`.
//!
//! ## Threading:
//! `cpal::Stream` cannot move between threads on every platform, so each
//! device owns a dedicated thread that builds the stream, keeps it alive and
//! drops it when the device is stopped. The rest of the crate only sees the
//! `Send` handles defined here.
//!
//! ## Microphone:
//! Opened at the device's native rate and sample format (f32, i16 or u16).
//! Each callback is downmixed to mono and fed through a [`StreamResampler`]
//! that keeps its state between callbacks.
//!
//! ## Speaker:
//! Keeps a timeline at the playback rate, measured in rendered frames.
//! Scheduled buffers are mixed in when the timeline reaches their start
//! frame, and the mixed signal is resampled to the device rate on its way
//! out. The device clock is exactly "timeline frames rendered so far".

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SizedSample};
use std::collections::VecDeque;
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use tracing::{debug, error, info};

use crate::audio::capture::{InputDevice, SampleSink};
use crate::audio::codec::{AudioFormat, PcmBuffer};
use crate::audio::playback::OutputDevice;
use crate::audio::resample::{resample_once, StreamResampler};
use crate::audio::AudioBackend;
use crate::error::{LiveError, LiveResult};

/// Timeline frames rendered per resampler feed on the speaker side.
const RENDER_FRAMES: usize = 256;

/// Default host devices.
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalBackend;

impl CpalBackend {
    pub fn new() -> Self {
        Self
    }
}

impl AudioBackend for CpalBackend {
    fn open_input(&self, format: AudioFormat) -> LiveResult<Box<dyn InputDevice>> {
        Ok(Box::new(CpalMicrophone::open(format.sample_rate)?))
    }

    fn open_output(&self, format: AudioFormat) -> LiveResult<Box<dyn OutputDevice>> {
        Ok(Box::new(CpalSpeaker::open(format.sample_rate)?))
    }
}

/// Average interleaved frames of any sample format into mono floats.
fn downmix<T>(data: &[T], channels: usize, out: &mut Vec<f32>)
where
    T: Sample,
    f32: FromSample<T>,
{
    let channels = channels.max(1);
    out.clear();
    out.extend(data.chunks_exact(channels).map(|frame| {
        frame.iter().map(|&s| s.to_sample::<f32>()).sum::<f32>() / channels as f32
    }));
}

/// Map a microphone setup error. Only an OS refusal counts as a denied
/// permission; everything else is a device problem.
fn microphone_error(context: &str, backend_specific: bool, detail: String) -> LiveError {
    let lowered = detail.to_lowercase();
    let refused = backend_specific
        && ["denied", "permission", "not permitted"]
            .iter()
            .any(|word| lowered.contains(word));

    if refused {
        LiveError::PermissionDenied(format!("{}: {}", context, detail))
    } else {
        LiveError::Device(format!("{}: {}", context, detail))
    }
}

/// Thread that owns one `cpal::Stream` until told to stop.
struct StreamThread {
    stop: Option<std_mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl StreamThread {
    /// Run `build` on a new thread and wait until the stream is playing.
    fn spawn<F>(name: &str, build: F) -> LiveResult<Self>
    where
        F: FnOnce() -> LiveResult<cpal::Stream> + Send + 'static,
    {
        let (ready_tx, ready_rx) = std_mpsc::channel::<LiveResult<()>>();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

        let thread = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let stream = match build() {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));
                // Blocks until the sender is dropped
                let _ = stop_rx.recv();
                drop(stream);
            })
            .map_err(|e| LiveError::Device(format!("failed to spawn audio thread: {}", e)))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                stop: Some(stop_tx),
                thread: Some(thread),
            }),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => Err(LiveError::Device("audio thread exited during setup".to_string())),
        }
    }

    fn shutdown(&mut self) {
        self.stop.take();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("Audio thread panicked");
            }
        }
    }
}

impl Drop for StreamThread {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ----------------------------------------------------------------------------
// Microphone
// ----------------------------------------------------------------------------

type SharedSink = Arc<Mutex<Option<SampleSink>>>;

fn lock_sink(sink: &SharedSink) -> MutexGuard<'_, Option<SampleSink>> {
    sink.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Default input device, resampled to the requested rate.
pub struct CpalMicrophone {
    sample_rate: u32,
    sink: SharedSink,
    stream: Option<StreamThread>,
}

impl CpalMicrophone {
    /// Acquire the default microphone. Samples are discarded until `start`.
    ///
    /// ## Errors:
    /// - `PermissionDenied` when the OS refuses access to the microphone
    /// - `Device` when there is no input device or its format is unusable
    pub fn open(sample_rate: u32) -> LiveResult<Self> {
        let sink: SharedSink = Arc::new(Mutex::new(None));
        let callback_sink = sink.clone();

        let stream = StreamThread::spawn("live-mentor-mic", move || {
            build_input_stream(sample_rate, callback_sink)
        })?;

        Ok(Self {
            sample_rate,
            sink,
            stream: Some(stream),
        })
    }
}

fn build_input_stream(target_rate: u32, sink: SharedSink) -> LiveResult<cpal::Stream> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or_else(|| LiveError::Device("no default input device available".to_string()))?;

    let name = device.name().unwrap_or_else(|_| "unknown".into());
    let default_config = device.default_input_config().map_err(|e| {
        let backend = matches!(e, cpal::DefaultStreamConfigError::BackendSpecific { .. });
        microphone_error("cannot query microphone", backend, e.to_string())
    })?;

    let sample_format = default_config.sample_format();
    let config = default_config.config();
    let native_rate = config.sample_rate.0;
    info!(
        device = %name,
        native_rate,
        channels = config.channels,
        ?sample_format,
        target_rate,
        "Opening microphone"
    );

    let resampler = StreamResampler::new(native_rate, target_rate)?;
    let stream = match sample_format {
        cpal::SampleFormat::F32 => input_stream::<f32>(&device, &config, resampler, sink),
        cpal::SampleFormat::I16 => input_stream::<i16>(&device, &config, resampler, sink),
        cpal::SampleFormat::U16 => input_stream::<u16>(&device, &config, resampler, sink),
        other => Err(LiveError::Device(format!(
            "unsupported microphone format {:?}",
            other
        ))),
    }?;

    stream.play().map_err(|e| {
        let backend = matches!(e, cpal::PlayStreamError::BackendSpecific { .. });
        microphone_error("cannot start microphone", backend, e.to_string())
    })?;
    Ok(stream)
}

fn input_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mut resampler: StreamResampler,
    sink: SharedSink,
) -> LiveResult<cpal::Stream>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let channels = config.channels as usize;
    let mut mono: Vec<f32> = Vec::new();

    device
        .build_input_stream(
            config,
            move |data: &[T], _info: &cpal::InputCallbackInfo| {
                let mut guard = lock_sink(&sink);
                let Some(sink) = guard.as_mut() else {
                    return;
                };
                downmix(data, channels, &mut mono);
                if let Err(e) = resampler.push(&mono, |samples| sink(samples)) {
                    error!("Microphone resampling failed: {}", e);
                }
            },
            |err| error!("Microphone stream error: {}", err),
            None,
        )
        .map_err(|e| {
            let backend = matches!(e, cpal::BuildStreamError::BackendSpecific { .. });
            microphone_error("cannot open microphone", backend, e.to_string())
        })
}

impl InputDevice for CpalMicrophone {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn start(&mut self, sink: SampleSink) -> LiveResult<()> {
        if self.stream.is_none() {
            return Err(LiveError::Device("microphone already released".to_string()));
        }
        *lock_sink(&self.sink) = Some(sink);
        Ok(())
    }

    fn stop(&mut self) {
        lock_sink(&self.sink).take();
        if let Some(mut stream) = self.stream.take() {
            stream.shutdown();
            debug!("Microphone released");
        }
    }
}

impl Drop for CpalMicrophone {
    fn drop(&mut self) {
        self.stop();
    }
}

// ----------------------------------------------------------------------------
// Speaker
// ----------------------------------------------------------------------------

struct TimelineUnit {
    id: u64,
    start_frame: u64,
    samples: Vec<f32>,
}

impl TimelineUnit {
    fn end_frame(&self) -> u64 {
        self.start_frame + self.samples.len() as u64
    }
}

#[derive(Default)]
struct Timeline {
    rendered_frames: u64,
    units: Vec<TimelineUnit>,
}

impl Timeline {
    /// Mix the next `out.len()` timeline frames into `out` (mono).
    fn render(&mut self, out: &mut [f32]) {
        let first = self.rendered_frames;
        out.iter_mut().for_each(|sample| *sample = 0.0);

        for unit in &self.units {
            let end = first + out.len() as u64;
            if unit.start_frame >= end || unit.end_frame() <= first {
                continue;
            }
            let from = unit.start_frame.max(first);
            let to = unit.end_frame().min(end);
            for frame in from..to {
                out[(frame - first) as usize] += unit.samples[(frame - unit.start_frame) as usize];
            }
        }

        self.rendered_frames += out.len() as u64;
        let now = self.rendered_frames;
        self.units.retain(|unit| unit.end_frame() > now);
    }
}

/// Timeline plus the conversion to the device rate.
struct SpeakerMixer {
    timeline: Timeline,
    resampler: StreamResampler,
    ready: VecDeque<f32>,
    block: Vec<f32>,
}

impl SpeakerMixer {
    fn new(timeline_rate: u32, device_rate: u32) -> LiveResult<Self> {
        Ok(Self {
            timeline: Timeline::default(),
            resampler: StreamResampler::new(timeline_rate, device_rate)?,
            ready: VecDeque::new(),
            block: vec![0.0; RENDER_FRAMES],
        })
    }

    /// Fill `out` with mono samples at the device rate.
    fn fill(&mut self, out: &mut [f32]) {
        while self.ready.len() < out.len() {
            self.timeline.render(&mut self.block);
            let ready = &mut self.ready;
            if let Err(e) = self
                .resampler
                .push(&self.block, |samples| ready.extend(samples.iter().copied()))
            {
                error!("Speaker resampling failed: {}", e);
                break;
            }
        }
        for sample in out.iter_mut() {
            *sample = self.ready.pop_front().unwrap_or(0.0);
        }
    }
}

type SharedMixer = Arc<Mutex<SpeakerMixer>>;

fn lock_mixer(mixer: &SharedMixer) -> MutexGuard<'_, SpeakerMixer> {
    mixer.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Default output device with a sample-accurate schedule.
pub struct CpalSpeaker {
    timeline_rate: u32,
    mixer: SharedMixer,
    stream: Option<StreamThread>,
}

impl CpalSpeaker {
    /// Open the default speaker for buffers at `timeline_rate`.
    pub fn open(timeline_rate: u32) -> LiveResult<Self> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| LiveError::Device("no default output device available".to_string()))?;
        let native_rate = device
            .default_output_config()
            .map_err(|e| LiveError::Device(format!("cannot query speaker: {}", e)))?
            .sample_rate()
            .0;

        let mixer: SharedMixer = Arc::new(Mutex::new(SpeakerMixer::new(timeline_rate, native_rate)?));
        let callback_mixer = mixer.clone();
        let stream = StreamThread::spawn("live-mentor-speaker", move || {
            build_output_stream(native_rate, callback_mixer)
        })?;

        Ok(Self {
            timeline_rate,
            mixer,
            stream: Some(stream),
        })
    }
}

fn build_output_stream(native_rate: u32, mixer: SharedMixer) -> LiveResult<cpal::Stream> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| LiveError::Device("no default output device available".to_string()))?;
    let name = device.name().unwrap_or_else(|_| "unknown".into());
    let default_config = device
        .default_output_config()
        .map_err(|e| LiveError::Device(format!("cannot query speaker: {}", e)))?;
    let sample_format = default_config.sample_format();
    let config = cpal::StreamConfig {
        channels: default_config.channels(),
        sample_rate: cpal::SampleRate(native_rate),
        buffer_size: cpal::BufferSize::Default,
    };
    info!(
        device = %name,
        native_rate,
        channels = config.channels,
        ?sample_format,
        "Opening speaker"
    );

    let stream = match sample_format {
        cpal::SampleFormat::F32 => output_stream::<f32>(&device, &config, mixer),
        cpal::SampleFormat::I16 => output_stream::<i16>(&device, &config, mixer),
        cpal::SampleFormat::U16 => output_stream::<u16>(&device, &config, mixer),
        other => Err(LiveError::Device(format!("unsupported output format {:?}", other))),
    }?;

    stream
        .play()
        .map_err(|e| LiveError::Device(format!("cannot start speaker: {}", e)))?;
    Ok(stream)
}

fn output_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mixer: SharedMixer,
) -> LiveResult<cpal::Stream>
where
    T: SizedSample + FromSample<f32>,
{
    let channels = config.channels.max(1) as usize;
    let mut mono: Vec<f32> = Vec::new();

    device
        .build_output_stream(
            config,
            move |data: &mut [T], _info: &cpal::OutputCallbackInfo| {
                let frames = data.len() / channels;
                mono.resize(frames, 0.0);
                lock_mixer(&mixer).fill(&mut mono);
                for (frame, sample) in data.chunks_mut(channels).zip(mono.iter()) {
                    let value = T::from_sample(*sample);
                    frame.iter_mut().for_each(|out| *out = value);
                }
            },
            |err| error!("Speaker stream error: {}", err),
            None,
        )
        .map_err(|e| LiveError::Device(format!("cannot open speaker: {}", e)))
}

impl OutputDevice for CpalSpeaker {
    fn current_time(&self) -> f64 {
        lock_mixer(&self.mixer).timeline.rendered_frames as f64 / self.timeline_rate as f64
    }

    fn schedule(&mut self, unit_id: u64, buffer: PcmBuffer, start_at: f64) -> LiveResult<()> {
        if self.stream.is_none() {
            return Err(LiveError::Device("speaker already closed".to_string()));
        }
        let samples = resample_once(&buffer.to_mono(), buffer.sample_rate, self.timeline_rate)?;
        let start_frame = (start_at * self.timeline_rate as f64).round().max(0.0) as u64;
        lock_mixer(&self.mixer).timeline.units.push(TimelineUnit {
            id: unit_id,
            start_frame,
            samples,
        });
        Ok(())
    }

    fn stop_unit(&mut self, unit_id: u64) {
        lock_mixer(&self.mixer)
            .timeline
            .units
            .retain(|unit| unit.id != unit_id);
    }

    fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            stream.shutdown();
            lock_mixer(&self.mixer).timeline.units.clear();
            debug!("Speaker released");
        }
    }
}

impl Drop for CpalSpeaker {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_downmix_averages_frames() {
        let mut mono = Vec::new();
        downmix(&[1.0f32, 0.0, 0.5, 0.5], 2, &mut mono);
        assert_eq!(mono, vec![0.5, 0.5]);
    }

    #[test]
    fn test_downmix_converts_integer_formats() {
        let mut mono = Vec::new();
        downmix(&[16_384i16, 16_384, -16_384, -16_384], 2, &mut mono);
        assert_eq!(mono, vec![0.5, -0.5]);

        downmix(&[32_768u16, 32_768], 1, &mut mono);
        assert_eq!(mono, vec![0.0, 0.0]);
    }

    #[test]
    fn test_only_refusals_map_to_permission_denied() {
        let denied = microphone_error("cannot open microphone", true, "Access is denied.".into());
        assert!(matches!(denied, LiveError::PermissionDenied(_)));

        let unsupported = microphone_error(
            "cannot open microphone",
            false,
            "The requested stream configuration is not supported by the device.".into(),
        );
        assert!(matches!(unsupported, LiveError::Device(_)));

        let busy = microphone_error("cannot open microphone", true, "device busy".into());
        assert!(matches!(busy, LiveError::Device(_)));
    }

    #[test]
    fn test_timeline_mixes_at_start_frame() {
        let mut timeline = Timeline::default();
        timeline.units.push(TimelineUnit {
            id: 0,
            start_frame: 2,
            samples: vec![0.5, 0.5, 0.5],
        });

        let mut out = vec![0.0; 4];
        timeline.render(&mut out);
        assert_eq!(out, vec![0.0, 0.0, 0.5, 0.5]);

        timeline.render(&mut out);
        assert_eq!(out, vec![0.5, 0.0, 0.0, 0.0]);
        assert!(timeline.units.is_empty());
        assert_eq!(timeline.rendered_frames, 8);
    }

    #[test]
    fn test_mixer_at_equal_rates_plays_units_in_place() {
        let mut mixer = SpeakerMixer::new(24_000, 24_000).unwrap();
        mixer.timeline.units.push(TimelineUnit {
            id: 0,
            start_frame: 3,
            samples: vec![0.25; 1234],
        });

        let mut out = vec![0.0; 1300];
        mixer.fill(&mut out);
        assert_eq!(&out[..3], &[0.0, 0.0, 0.0]);
        assert!(out[3..1237].iter().all(|s| *s == 0.25));
        assert!(out[1237..].iter().all(|s| *s == 0.0));
    }
}
