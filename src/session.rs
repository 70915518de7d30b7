//! # Session Controller
//!
//! Orchestrates one live tutoring session: microphone, transport, playback
//! and transcript, and the state the UI observes.
//!
//! ## Session Lifecycle:
//! 1. **Idle**: nothing is open, `start()` is accepted
//! 2. **Connecting**: microphone requested, transport opening
//! 3. **Active**: frames stream out, audio and transcripts stream in
//! 4. **Closing**: `stop()` is releasing resources
//! 5. **Failed**: a terminal error was reported; the controller settles
//!    back to **Idle** immediately so the user can retry
//!
//! ## Event Flow:
//! The transport delivers `ServerEvent`s on one channel. A single pump task
//! consumes it in arrival order: transcripts go to the log and the observer,
//! audio to the playback scheduler, interruptions flush playback, and
//! `Closed`/`Error` tear the session down.
//!
//! ## Thread Safety:
//! Controller state sits behind a `std::sync::Mutex` that is never held
//! across an `.await` or while calling the observer. Every session attempt
//! gets a generation number; work that finishes after its session was
//! stopped sees a newer generation and backs out without touching the
//! current session.

use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::audio::capture::{CaptureHandle, CapturePipeline, CaptureSettings, InputDevice};
use crate::audio::playback::PlaybackScheduler;
use crate::audio::AudioBackend;
use crate::config::AppConfig;
use crate::error::{LiveError, LiveResult};
use crate::live::{Connector, LiveSession, ServerEvent};
use crate::persona::Subject;
use crate::state::SessionMetrics;
use crate::transcript::{TranscriptEntry, TranscriptLog, TranscriptSink};

/// Controller lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Idle,
    Connecting,
    Active,
    Closing,
    Failed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Connecting => "connecting",
            SessionState::Active => "active",
            SessionState::Closing => "closing",
            SessionState::Failed => "failed",
        }
    }
}

/// State plus the human-readable phase label shown to the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionStatus {
    pub state: SessionState,
    pub label: String,
}

/// Everything the UI layer hears from the controller.
pub trait SessionObserver: TranscriptSink {
    fn on_status_change(&self, status: &SessionStatus);
}

/// Resources owned by one session attempt.
#[derive(Default)]
struct Resources {
    microphone: Option<Box<dyn InputDevice>>,
    capture: Option<CaptureHandle>,
    playback: Option<PlaybackScheduler>,
    transport: Option<Arc<LiveSession>>,
    pump: Option<JoinHandle<()>>,
}

impl Resources {
    /// Release in dependency order: stop producing audio, silence the
    /// speaker, then hang up.
    fn release(mut self, abort_pump: bool) {
        if let Some(mut capture) = self.capture.take() {
            capture.stop();
        }
        if let Some(mut microphone) = self.microphone.take() {
            microphone.stop();
        }
        if let Some(mut playback) = self.playback.take() {
            playback.close();
        }
        if let Some(transport) = self.transport.take() {
            transport.close();
        }
        if let Some(pump) = self.pump.take() {
            if abort_pump {
                pump.abort();
            }
        }
    }
}

struct Inner {
    state: SessionState,
    generation: u64,
    session_id: Option<Uuid>,
    subject: Option<Subject>,
    resources: Resources,
    transcript: TranscriptLog,
}

/// State shared between the controller and its event pump.
struct Shared {
    inner: Mutex<Inner>,
    observer: Arc<dyn SessionObserver>,
    metrics: Arc<SessionMetrics>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn notify(&self, state: SessionState, label: impl Into<String>) {
        let status = SessionStatus {
            state,
            label: label.into(),
        };
        debug!(state = state.as_str(), label = %status.label, "Session status changed");
        self.observer.on_status_change(&status);
    }

    /// Terminal failure of session attempt `generation`: report it, release
    /// everything, and settle in `Idle`.
    ///
    /// Does nothing if that attempt was already stopped.
    fn fail(&self, generation: u64, err: LiveError, label: &str, abort_pump: bool) -> LiveError {
        let (teardown, resources) = {
            let mut inner = self.lock();
            if inner.generation != generation || inner.state == SessionState::Idle {
                return err;
            }
            inner.state = SessionState::Failed;
            inner.generation += 1;
            (inner.generation, std::mem::take(&mut inner.resources))
        };

        error!(code = err.code(), "Live session failed: {}", err);
        self.metrics.record_session_failed();
        self.notify(SessionState::Failed, label);

        resources.release(abort_pump);
        self.settle_idle(teardown);
        err
    }

    /// Finish the teardown that moved the controller to generation
    /// `teardown`. A newer `stop()` or `start()` owns the state from then
    /// on and is left alone.
    fn settle_idle(&self, teardown: u64) {
        {
            let mut inner = self.lock();
            if inner.generation != teardown {
                debug!(
                    state = inner.state.as_str(),
                    "Newer session attempt running, not settling to idle"
                );
                return;
            }
            inner.state = SessionState::Idle;
            inner.session_id = None;
        }
        self.notify(SessionState::Idle, "idle");
    }
}

/// Drives live tutoring sessions, one at a time.
pub struct SessionController {
    config: AppConfig,
    backend: Arc<dyn AudioBackend>,
    connector: Arc<dyn Connector>,
    shared: Arc<Shared>,
}

impl SessionController {
    pub fn new(
        config: AppConfig,
        backend: Arc<dyn AudioBackend>,
        connector: Arc<dyn Connector>,
        observer: Arc<dyn SessionObserver>,
    ) -> Self {
        Self {
            config,
            backend,
            connector,
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    state: SessionState::Idle,
                    generation: 0,
                    session_id: None,
                    subject: None,
                    resources: Resources::default(),
                    transcript: TranscriptLog::new(),
                }),
                observer,
                metrics: SessionMetrics::shared(),
            }),
        }
    }

    /// Start a tutoring session on `subject`.
    ///
    /// ## Flow:
    /// 1. Reject with `AlreadyActive` unless idle
    /// 2. Request the microphone (the permission prompt) and the speaker
    /// 3. Open the transport with the subject's persona
    /// 4. On `Opened`, stream microphone frames out and go `Active`
    ///
    /// ## Errors:
    /// Permission and connection failures are reported to the observer,
    /// leave the controller `Idle`, and are returned. A `stop()` that
    /// arrives while connecting makes this return a `Connection` error
    /// without further status changes.
    pub async fn start(&self, subject: Subject) -> LiveResult<()> {
        let shared = &self.shared;
        let generation = {
            let mut inner = shared.lock();
            if inner.state != SessionState::Idle {
                warn!(state = inner.state.as_str(), "Rejected start, session already running");
                return Err(LiveError::AlreadyActive);
            }
            inner.state = SessionState::Connecting;
            inner.generation += 1;
            inner.session_id = Some(Uuid::new_v4());
            inner.subject = Some(subject);
            inner.transcript.clear();
            inner.generation
        };

        shared.metrics.record_session_started();
        info!(subject = %subject, "Starting live session");
        shared.notify(SessionState::Connecting, "connecting");

        let audio = &self.config.audio;
        let microphone = match self.backend.open_input(audio.capture_format()) {
            Ok(device) => device,
            Err(err) => {
                let label = match err {
                    LiveError::PermissionDenied(_) => "microphone denied",
                    _ => "microphone unavailable",
                };
                return Err(shared.fail(generation, err, label, true));
            }
        };

        let speaker = match self.backend.open_output(audio.playback_format()) {
            Ok(device) => device,
            Err(err) => {
                let mut microphone = microphone;
                microphone.stop();
                return Err(shared.fail(generation, err, "speaker unavailable", true));
            }
        };

        // Park the devices where stop() can find them while we connect
        {
            let mut inner = shared.lock();
            if inner.generation != generation {
                drop(inner);
                let (mut microphone, mut speaker) = (microphone, speaker);
                microphone.stop();
                speaker.close();
                return Err(stopped_while_connecting());
            }
            inner.resources.microphone = Some(microphone);
            inner.resources.playback = Some(PlaybackScheduler::new(speaker));
        }

        let persona = subject.persona();
        let setup = persona.session_setup(&self.config.session);
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let transport = LiveSession::connect(
            self.connector.as_ref(),
            &setup,
            events_tx,
            self.config.live.connect_timeout(),
            shared.metrics.clone(),
        )
        .await;

        match events_rx.recv().await {
            Some(ServerEvent::Opened) => {}
            Some(ServerEvent::Error { detail }) => {
                transport.close();
                let err = LiveError::Connection(detail);
                let label = format!("connection failed: {}", err);
                return Err(shared.fail(generation, err, &label, true));
            }
            other => {
                transport.close();
                let err = LiveError::Connection(format!("unexpected first event: {:?}", other));
                return Err(shared.fail(generation, err, "connection failed", true));
            }
        }

        let settings = CaptureSettings {
            format: audio.capture_format(),
            frame_size: audio.frame_size,
        };

        let transport_id = transport.id();
        let session_id = {
            let mut inner = shared.lock();
            if inner.generation != generation || inner.state != SessionState::Connecting {
                // Whatever is still parked belongs to this attempt only if
                // nobody has moved the generation on
                let parked = if inner.generation == generation {
                    std::mem::take(&mut inner.resources)
                } else {
                    Resources::default()
                };
                drop(inner);
                transport.close();
                parked.release(true);
                return Err(stopped_while_connecting());
            }

            let Some(microphone) = inner.resources.microphone.take() else {
                drop(inner);
                transport.close();
                let err = LiveError::Internal("microphone released before streaming".to_string());
                return Err(shared.fail(generation, err, "microphone unavailable", true));
            };

            let sender = transport.clone();
            match CapturePipeline::start(microphone, settings, shared.metrics.clone(), move |frame| {
                sender.send(frame)
            }) {
                Ok(capture) => inner.resources.capture = Some(capture),
                Err(err) => {
                    drop(inner);
                    transport.close();
                    return Err(shared.fail(generation, err, "microphone unavailable", true));
                }
            }

            inner.resources.transport = Some(transport);
            inner.resources.pump = Some(tokio::spawn(pump_events(
                shared.clone(),
                generation,
                events_rx,
            )));
            inner.state = SessionState::Active;
            inner.session_id
        };

        info!(
            session_id = ?session_id,
            transport_id = %transport_id,
            tutor = persona.tutor_name,
            role = persona.role,
            voice = persona.voice_id,
            "Live session active"
        );
        shared.notify(SessionState::Active, "active: you may speak");
        Ok(())
    }

    /// Stop the current session and return to `Idle`.
    ///
    /// Safe to call in any state and any number of times.
    pub fn stop(&self) {
        let shared = &self.shared;
        let (teardown, resources) = {
            let mut inner = shared.lock();
            if inner.state == SessionState::Idle {
                debug!("Stop requested while idle");
                return;
            }
            inner.state = SessionState::Closing;
            inner.generation += 1;
            (inner.generation, std::mem::take(&mut inner.resources))
        };

        info!("Stopping live session");
        shared.notify(SessionState::Closing, "closing");

        resources.release(true);
        shared.settle_idle(teardown);
    }

    pub fn state(&self) -> SessionState {
        self.shared.lock().state
    }

    pub fn session_id(&self) -> Option<Uuid> {
        self.shared.lock().session_id
    }

    pub fn subject(&self) -> Option<Subject> {
        self.shared.lock().subject
    }

    /// Turns of the current (or most recent) session.
    pub fn transcript(&self) -> Vec<TranscriptEntry> {
        self.shared.lock().transcript.entries().to_vec()
    }

    pub fn metrics(&self) -> Arc<SessionMetrics> {
        self.shared.metrics.clone()
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        self.stop();
    }
}

/// How a session that reached `Active` came to an end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    /// `stop()` was called, or the status feed went away
    Stopped,
    /// The session failed; carries the failure label
    Failed(String),
}

/// Follow a feed of status changes until the controller is back in `Idle`.
///
/// Frontends forward `on_status_change` into an unbounded channel and wait
/// on this next to their own shutdown triggers, so a remote close or a
/// connection error ends the wait as well.
pub async fn wait_for_session_end(
    statuses: &mut mpsc::UnboundedReceiver<SessionStatus>,
) -> SessionEnd {
    let mut failure = None;
    while let Some(status) = statuses.recv().await {
        match status.state {
            SessionState::Failed => failure = Some(status.label),
            SessionState::Idle => break,
            _ => {}
        }
    }
    match failure {
        Some(label) => SessionEnd::Failed(label),
        None => SessionEnd::Stopped,
    }
}

fn stopped_while_connecting() -> LiveError {
    LiveError::Connection("session stopped while connecting".to_string())
}

/// Consume transport events for session attempt `generation`, in order.
async fn pump_events(
    shared: Arc<Shared>,
    generation: u64,
    mut events: mpsc::UnboundedReceiver<ServerEvent>,
) {
    while let Some(event) = events.recv().await {
        match event {
            ServerEvent::PartialTranscript { speaker, text } => {
                trace!(speaker = speaker.as_str(), "Transcript fragment");
                {
                    let mut inner = shared.lock();
                    if inner.generation != generation {
                        return;
                    }
                    inner.transcript.push(speaker, &text);
                }
                shared.observer.on_transcript(speaker, &text);
            }
            ServerEvent::AudioChunk { payload } => {
                let scheduled = {
                    let mut inner = shared.lock();
                    if inner.generation != generation {
                        return;
                    }
                    let Some(playback) = inner.resources.playback.as_mut() else {
                        continue;
                    };
                    playback.enqueue(&payload)
                };
                match scheduled {
                    Ok(Some(_)) => shared.metrics.record_chunk_scheduled(),
                    Ok(None) => {}
                    Err(err) if !err.is_terminal() => {
                        shared.metrics.record_chunk_malformed();
                        warn!("Dropped malformed audio chunk: {}", err);
                    }
                    Err(err) => {
                        shared.fail(generation, err, "speaker failed", false);
                        return;
                    }
                }
            }
            ServerEvent::Interrupted => {
                let mut inner = shared.lock();
                if inner.generation != generation {
                    return;
                }
                if let Some(playback) = inner.resources.playback.as_mut() {
                    playback.flush();
                }
                shared.metrics.record_interruption();
                debug!("User interrupted, playback flushed");
            }
            ServerEvent::Opened => {}
            ServerEvent::Closed { reason } => {
                let reason = reason.unwrap_or_else(|| "closed by remote".to_string());
                info!(reason = %reason, "Live service closed the session");
                let label = format!("connection closed: {}", reason);
                shared.fail(generation, LiveError::Connection(reason), &label, false);
                return;
            }
            ServerEvent::Error { detail } => {
                let label = format!("connection error: {}", detail);
                shared.fail(generation, LiveError::Connection(detail), &label, false);
                return;
            }
        }
    }
}
