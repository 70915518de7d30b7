//! In-memory devices, connector and observer for unit tests.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::audio::capture::{InputDevice, SampleSink};
use crate::audio::codec::{AudioFormat, EncodedChunk, PcmBuffer};
use crate::audio::playback::OutputDevice;
use crate::audio::AudioBackend;
use crate::error::{LiveError, LiveResult};
use crate::live::transport::{Connector, Link, SessionSetup};
use crate::live::{ServerEvent, Speaker};
use crate::session::{SessionObserver, SessionState, SessionStatus};
use crate::transcript::TranscriptSink;

/// Poll `condition` until it holds, panicking after two seconds.
pub async fn wait_until<F>(mut condition: F)
where
    F: FnMut() -> bool,
{
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached within 2s");
}

// ----------------------------------------------------------------------------
// Microphone
// ----------------------------------------------------------------------------

#[derive(Default)]
struct MicState {
    sink: Mutex<Option<SampleSink>>,
    streaming: AtomicBool,
    stop_calls: AtomicUsize,
}

/// Microphone whose samples are pushed by the test.
pub struct FakeMicrophone {
    sample_rate: u32,
    state: Arc<MicState>,
    open_devices: Option<Arc<AtomicUsize>>,
}

/// Test-side handle to a [`FakeMicrophone`].
#[derive(Clone)]
pub struct MicControl {
    state: Arc<MicState>,
}

impl FakeMicrophone {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            state: Arc::new(MicState::default()),
            open_devices: None,
        }
    }

    pub fn control(&self) -> MicControl {
        MicControl {
            state: self.state.clone(),
        }
    }
}

impl InputDevice for FakeMicrophone {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn start(&mut self, sink: SampleSink) -> LiveResult<()> {
        *self.state.sink.lock().unwrap() = Some(sink);
        self.state.streaming.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&mut self) {
        if self.state.streaming.swap(false, Ordering::SeqCst) {
            self.state.stop_calls.fetch_add(1, Ordering::SeqCst);
        }
        self.state.sink.lock().unwrap().take();
    }
}

impl Drop for FakeMicrophone {
    fn drop(&mut self) {
        if let Some(open) = self.open_devices.as_ref() {
            open.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl MicControl {
    /// Deliver samples as if from the device callback.
    pub fn push(&self, samples: &[f32]) {
        if let Some(sink) = self.state.sink.lock().unwrap().as_mut() {
            sink(samples);
        }
    }

    pub fn is_streaming(&self) -> bool {
        self.state.streaming.load(Ordering::SeqCst)
    }

    pub fn stop_calls(&self) -> usize {
        self.state.stop_calls.load(Ordering::SeqCst)
    }
}

// ----------------------------------------------------------------------------
// Speaker
// ----------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct ScheduledUnit {
    id: u64,
    start_at: f64,
    duration: f64,
    stopped: bool,
}

#[derive(Default)]
struct SpeakerState {
    now: Mutex<f64>,
    units: Mutex<Vec<ScheduledUnit>>,
    close_calls: AtomicUsize,
    broken: AtomicBool,
}

/// Speaker with a manually advanced clock that records what it was asked to play.
pub struct FakeSpeaker {
    state: Arc<SpeakerState>,
    open_devices: Option<Arc<AtomicUsize>>,
}

/// Test-side handle to a [`FakeSpeaker`].
#[derive(Clone)]
pub struct SpeakerControl {
    state: Arc<SpeakerState>,
}

impl FakeSpeaker {
    pub fn new() -> Self {
        Self {
            state: Arc::new(SpeakerState::default()),
            open_devices: None,
        }
    }

    pub fn control(&self) -> SpeakerControl {
        SpeakerControl {
            state: self.state.clone(),
        }
    }
}

impl OutputDevice for FakeSpeaker {
    fn current_time(&self) -> f64 {
        *self.state.now.lock().unwrap()
    }

    fn schedule(&mut self, unit_id: u64, buffer: PcmBuffer, start_at: f64) -> LiveResult<()> {
        if self.state.broken.load(Ordering::SeqCst) {
            return Err(LiveError::Device("speaker unplugged".to_string()));
        }
        self.state.units.lock().unwrap().push(ScheduledUnit {
            id: unit_id,
            start_at,
            duration: buffer.duration_secs(),
            stopped: false,
        });
        Ok(())
    }

    fn stop_unit(&mut self, unit_id: u64) {
        for unit in self.state.units.lock().unwrap().iter_mut() {
            if unit.id == unit_id {
                unit.stopped = true;
            }
        }
    }

    fn close(&mut self) {
        self.state.close_calls.fetch_add(1, Ordering::SeqCst);
    }
}

impl Drop for FakeSpeaker {
    fn drop(&mut self) {
        if let Some(open) = self.open_devices.as_ref() {
            open.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl SpeakerControl {
    pub fn advance(&self, seconds: f64) {
        *self.state.now.lock().unwrap() += seconds;
    }

    /// Units scheduled and not stopped.
    pub fn active_units(&self) -> usize {
        self.state
            .units
            .lock()
            .unwrap()
            .iter()
            .filter(|unit| !unit.stopped)
            .count()
    }

    pub fn stopped_units(&self) -> Vec<u64> {
        self.state
            .units
            .lock()
            .unwrap()
            .iter()
            .filter(|unit| unit.stopped)
            .map(|unit| unit.id)
            .collect()
    }

    /// Durations of every unit ever scheduled, in scheduling order.
    pub fn scheduled_durations(&self) -> Vec<f64> {
        self.state
            .units
            .lock()
            .unwrap()
            .iter()
            .map(|unit| unit.duration)
            .collect()
    }

    /// Start times the device was asked to use, in scheduling order.
    pub fn scheduled_starts(&self) -> Vec<f64> {
        self.state
            .units
            .lock()
            .unwrap()
            .iter()
            .map(|unit| unit.start_at)
            .collect()
    }

    pub fn close_calls(&self) -> usize {
        self.state.close_calls.load(Ordering::SeqCst)
    }

    /// Make every later `schedule` call fail like a vanished device.
    pub fn break_device(&self) {
        self.state.broken.store(true, Ordering::SeqCst);
    }
}

// ----------------------------------------------------------------------------
// Backend
// ----------------------------------------------------------------------------

/// Audio backend handing out fakes and counting devices still alive.
#[derive(Default)]
pub struct FakeBackend {
    deny_microphone: AtomicBool,
    open_devices: Arc<AtomicUsize>,
    microphone: Mutex<Option<MicControl>>,
    speaker: Mutex<Option<SpeakerControl>>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `open_input` calls fail as if the user said no.
    pub fn deny_microphone(&self, deny: bool) {
        self.deny_microphone.store(deny, Ordering::SeqCst);
    }

    /// Devices opened and not yet dropped.
    pub fn open_devices(&self) -> usize {
        self.open_devices.load(Ordering::SeqCst)
    }

    pub fn microphone(&self) -> Option<MicControl> {
        self.microphone.lock().unwrap().clone()
    }

    pub fn speaker(&self) -> Option<SpeakerControl> {
        self.speaker.lock().unwrap().clone()
    }
}

impl AudioBackend for FakeBackend {
    fn open_input(&self, format: AudioFormat) -> LiveResult<Box<dyn InputDevice>> {
        if self.deny_microphone.load(Ordering::SeqCst) {
            return Err(LiveError::PermissionDenied("microphone access refused".to_string()));
        }
        let mut microphone = FakeMicrophone::new(format.sample_rate);
        self.open_devices.fetch_add(1, Ordering::SeqCst);
        microphone.open_devices = Some(self.open_devices.clone());
        *self.microphone.lock().unwrap() = Some(microphone.control());
        Ok(Box::new(microphone))
    }

    fn open_output(&self, _format: AudioFormat) -> LiveResult<Box<dyn OutputDevice>> {
        let mut speaker = FakeSpeaker::new();
        self.open_devices.fetch_add(1, Ordering::SeqCst);
        speaker.open_devices = Some(self.open_devices.clone());
        *self.speaker.lock().unwrap() = Some(speaker.control());
        Ok(Box::new(speaker))
    }
}

// ----------------------------------------------------------------------------
// Connector
// ----------------------------------------------------------------------------

#[derive(Clone)]
enum ConnectMode {
    Accept,
    Fail(String),
    Hang,
}

/// The service side of a fake link.
pub struct RemoteEnd {
    events: Option<mpsc::UnboundedSender<ServerEvent>>,
    frames: mpsc::UnboundedReceiver<EncodedChunk>,
}

impl RemoteEnd {
    /// Send an event to the client. Ignored once the client is gone.
    pub fn emit(&self, event: ServerEvent) {
        if let Some(events) = self.events.as_ref() {
            let _ = events.send(event);
        }
    }

    /// End the inbound stream without a close message.
    pub fn hang_up(mut self) {
        self.events = None;
    }

    pub async fn next_frame(&mut self) -> Option<EncodedChunk> {
        self.frames.recv().await
    }
}

/// Connector that accepts, fails or never completes.
pub struct FakeConnector {
    mode: Mutex<ConnectMode>,
    calls: AtomicUsize,
    last_setup: Mutex<Option<SessionSetup>>,
    remote: Mutex<Option<RemoteEnd>>,
}

impl FakeConnector {
    fn with_mode(mode: ConnectMode) -> Self {
        Self {
            mode: Mutex::new(mode),
            calls: AtomicUsize::new(0),
            last_setup: Mutex::new(None),
            remote: Mutex::new(None),
        }
    }

    pub fn accepting() -> Self {
        Self::with_mode(ConnectMode::Accept)
    }

    pub fn failing(detail: &str) -> Self {
        Self::with_mode(ConnectMode::Fail(detail.to_string()))
    }

    pub fn hanging() -> Self {
        Self::with_mode(ConnectMode::Hang)
    }

    /// Leave every later connect attempt pending.
    pub fn hang_from_now(&self) {
        *self.mode.lock().unwrap() = ConnectMode::Hang;
    }

    pub fn connect_calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_setup(&self) -> Option<SessionSetup> {
        self.last_setup.lock().unwrap().clone()
    }

    /// Take the service side of the most recent link.
    pub fn remote(&self) -> Option<RemoteEnd> {
        self.remote.lock().unwrap().take()
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, setup: &SessionSetup) -> LiveResult<Link> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_setup.lock().unwrap() = Some(setup.clone());

        let mode = self.mode.lock().unwrap().clone();
        match mode {
            ConnectMode::Accept => {
                let (outbound, frames) = mpsc::unbounded_channel();
                let (events, inbound) = mpsc::unbounded_channel();
                *self.remote.lock().unwrap() = Some(RemoteEnd {
                    events: Some(events),
                    frames,
                });
                Ok(Link {
                    outbound,
                    inbound,
                    tasks: Vec::new(),
                })
            }
            ConnectMode::Fail(detail) => Err(LiveError::Connection(detail)),
            ConnectMode::Hang => std::future::pending::<LiveResult<Link>>().await,
        }
    }
}

// ----------------------------------------------------------------------------
// Observer
// ----------------------------------------------------------------------------

/// Records every status change and transcript fragment.
///
/// `hold_on` pauses the thread that reports a given state until `release`
/// is called, which lets a test run other calls in the middle of a
/// transition.
#[derive(Default)]
pub struct RecordingObserver {
    statuses: Mutex<Vec<SessionStatus>>,
    transcripts: Mutex<Vec<(Speaker, String)>>,
    hold: Mutex<Option<SessionState>>,
    held: AtomicBool,
    released: Mutex<bool>,
    wake: Condvar,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn states(&self) -> Vec<SessionState> {
        self.statuses
            .lock()
            .unwrap()
            .iter()
            .map(|status| status.state)
            .collect()
    }

    pub fn labels(&self) -> Vec<String> {
        self.statuses
            .lock()
            .unwrap()
            .iter()
            .map(|status| status.label.clone())
            .collect()
    }

    pub fn transcripts(&self) -> Vec<(Speaker, String)> {
        self.transcripts.lock().unwrap().clone()
    }

    /// Block the next report of `state` until [`release`](Self::release).
    pub fn hold_on(&self, state: SessionState) {
        *self.released.lock().unwrap() = false;
        *self.hold.lock().unwrap() = Some(state);
    }

    /// Whether a reporting thread is currently blocked.
    pub fn is_holding(&self) -> bool {
        self.held.load(Ordering::SeqCst)
    }

    pub fn release(&self) {
        *self.released.lock().unwrap() = true;
        self.wake.notify_all();
    }
}

impl TranscriptSink for RecordingObserver {
    fn on_transcript(&self, speaker: Speaker, text: &str) {
        self.transcripts
            .lock()
            .unwrap()
            .push((speaker, text.to_string()));
    }
}

impl SessionObserver for RecordingObserver {
    fn on_status_change(&self, status: &SessionStatus) {
        self.statuses.lock().unwrap().push(status.clone());

        let hold = {
            let mut hold = self.hold.lock().unwrap();
            if *hold == Some(status.state) {
                hold.take()
            } else {
                None
            }
        };
        if hold.is_some() {
            self.held.store(true, Ordering::SeqCst);
            let mut released = self.released.lock().unwrap();
            while !*released {
                released = self.wake.wait(released).unwrap();
            }
            self.held.store(false, Ordering::SeqCst);
        }
    }
}
