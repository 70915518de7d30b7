//! # Streaming Transport
//!
//! Duplex session with the remote conversational service.
//!
//! ## State Machine:
//! `Unconnected -> Connecting -> Open -> Closed`. `Open -> Closed` happens on
//! an explicit `close()` or when the remote side ends the stream.
//!
//! ## Key Components:
//! - **Connector**: opens the raw link (WebSocket in production, in-memory in tests)
//! - **Link**: outbound frame queue, inbound event queue, and the I/O tasks behind them
//! - **LiveSession**: owns a link, enforces the state machine, and forwards
//!   events to the consumer's channel
//! - **GeminiLiveConnector**: WebSocket connector speaking the live protocol
//!
//! ## Event Delivery:
//! Events go to a single `mpsc` channel in arrival order. Once the session is
//! closed nothing else is dispatched, so a consumer never sees audio from a
//! session it already tore down.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::audio::codec::{AudioFormat, EncodedChunk};
use crate::config::LiveServiceConfig;
use crate::error::{LiveError, LiveResult};
use crate::live::protocol::{RealtimeInputMessage, ServerEvent, ServerMessage, SetupMessage};
use crate::state::SessionMetrics;

/// What the service should be for this session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSetup {
    pub system_instruction: String,
    pub voice_id: String,
    pub input_transcription: bool,
    pub output_transcription: bool,
}

/// Raw duplex link produced by a [`Connector`].
///
/// Dropping `outbound` asks the writer to finish; `tasks` are aborted when
/// the owning session closes.
pub struct Link {
    pub outbound: mpsc::UnboundedSender<EncodedChunk>,
    pub inbound: mpsc::UnboundedReceiver<ServerEvent>,
    pub tasks: Vec<JoinHandle<()>>,
}

/// Opens links to the conversational service.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Establish the connection and complete the setup handshake.
    async fn connect(&self, setup: &SessionSetup) -> LiveResult<Link>;
}

/// Transport lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Unconnected,
    Connecting,
    Open,
    Closed,
}

impl TransportState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportState::Unconnected => "unconnected",
            TransportState::Connecting => "connecting",
            TransportState::Open => "open",
            TransportState::Closed => "closed",
        }
    }
}

struct SessionInner {
    state: TransportState,
    outbound: Option<mpsc::UnboundedSender<EncodedChunk>>,
    events: Option<mpsc::UnboundedSender<ServerEvent>>,
    tasks: Vec<JoinHandle<()>>,
}

/// One duplex session with the service.
pub struct LiveSession {
    id: Uuid,
    inner: Mutex<SessionInner>,
    metrics: Arc<SessionMetrics>,
}

impl LiveSession {
    fn new(events: mpsc::UnboundedSender<ServerEvent>, metrics: Arc<SessionMetrics>) -> Self {
        Self {
            id: Uuid::new_v4(),
            inner: Mutex::new(SessionInner {
                state: TransportState::Unconnected,
                outbound: None,
                events: Some(events),
                tasks: Vec::new(),
            }),
            metrics,
        }
    }

    /// Open a session and start dispatching events to `events`.
    ///
    /// On success `Opened` is the first event. On failure (including the
    /// connect timeout) a single `Error` event is dispatched and the session
    /// is already `Closed` when this returns.
    pub async fn connect(
        connector: &dyn Connector,
        setup: &SessionSetup,
        events: mpsc::UnboundedSender<ServerEvent>,
        timeout: Duration,
        metrics: Arc<SessionMetrics>,
    ) -> Arc<LiveSession> {
        let session = Arc::new(LiveSession::new(events, metrics));
        session.lock().state = TransportState::Connecting;
        info!(transport_id = %session.id, voice = %setup.voice_id, "Connecting to live service");

        let link = match tokio::time::timeout(timeout, connector.connect(setup)).await {
            Ok(Ok(link)) => link,
            Ok(Err(e)) => {
                error!(transport_id = %session.id, "Connection failed: {}", e);
                session.fail(e.to_string());
                return session;
            }
            Err(_) => {
                error!(transport_id = %session.id, ?timeout, "Connection timed out");
                session.fail(format!("connection timed out after {} ms", timeout.as_millis()));
                return session;
            }
        };

        let Link {
            outbound,
            inbound,
            tasks,
        } = link;

        {
            let mut inner = session.lock();
            inner.state = TransportState::Open;
            inner.outbound = Some(outbound);
            inner.tasks = tasks;
            if let Some(events) = inner.events.as_ref() {
                let _ = events.send(ServerEvent::Opened);
            }
        }
        info!(transport_id = %session.id, "Live session open");

        let forwarder = tokio::spawn(forward_events(Arc::downgrade(&session), inbound));
        session.lock().tasks.push(forwarder);

        session
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> TransportState {
        self.lock().state
    }

    pub fn is_open(&self) -> bool {
        self.state() == TransportState::Open
    }

    /// Queue a frame for transmission without blocking.
    ///
    /// Frames offered while the session is not open are dropped and counted.
    pub fn send(&self, frame: EncodedChunk) {
        let inner = self.lock();
        let state = inner.state;
        let queued = match (state, inner.outbound.as_ref()) {
            (TransportState::Open, Some(outbound)) => outbound.send(frame).is_ok(),
            _ => false,
        };
        drop(inner);

        if queued {
            self.metrics.record_frame_sent();
        } else {
            self.metrics.record_frame_dropped();
            trace!(transport_id = %self.id, state = state.as_str(), "Dropped outbound frame");
        }
    }

    /// Close the session. Idempotent; no events are dispatched afterwards.
    pub fn close(&self) {
        let (previous, tasks) = {
            let mut inner = self.lock();
            let previous = inner.state;
            inner.state = TransportState::Closed;
            inner.outbound = None;
            inner.events = None;
            (previous, std::mem::take(&mut inner.tasks))
        };

        // A remote close leaves the I/O tasks for us to reap
        for task in tasks {
            task.abort();
        }
        if previous != TransportState::Closed {
            info!(transport_id = %self.id, from = previous.as_str(), "Live session closed");
        }
    }

    /// Dispatch one event if the session is still open.
    ///
    /// Terminal events close the session as they are dispatched. Returns
    /// `false` once nothing more will be delivered.
    fn dispatch(&self, event: ServerEvent) -> bool {
        let mut inner = self.lock();
        if inner.state != TransportState::Open {
            return false;
        }

        let terminal = event.is_terminal();
        let delivered = inner
            .events
            .as_ref()
            .map(|events| events.send(event).is_ok())
            .unwrap_or(false);

        if terminal || !delivered {
            inner.state = TransportState::Closed;
            inner.outbound = None;
            inner.events = None;
            return false;
        }
        true
    }

    /// Connect-phase failure: exactly one `Error` event, then `Closed`.
    fn fail(&self, detail: String) {
        let mut inner = self.lock();
        if let Some(events) = inner.events.take() {
            let _ = events.send(ServerEvent::Error { detail });
        }
        inner.state = TransportState::Closed;
        inner.outbound = None;
    }

    fn lock(&self) -> MutexGuard<'_, SessionInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for LiveSession {
    fn drop(&mut self) {
        let inner = self.inner.get_mut().unwrap_or_else(|poisoned| poisoned.into_inner());
        for task in inner.tasks.drain(..) {
            task.abort();
        }
    }
}

/// Relay link events to the session consumer until either side is done.
async fn forward_events(
    session: Weak<LiveSession>,
    mut inbound: mpsc::UnboundedReceiver<ServerEvent>,
) {
    while let Some(event) = inbound.recv().await {
        let Some(session) = session.upgrade() else {
            return;
        };
        if !session.dispatch(event) {
            debug!(transport_id = %session.id, "Event forwarding finished");
            return;
        }
    }

    // Link ended without saying why
    if let Some(session) = session.upgrade() {
        if session.is_open() {
            warn!(transport_id = %session.id, "Live service stream ended");
        }
        session.dispatch(ServerEvent::Closed {
            reason: Some("connection lost".to_string()),
        });
    }
}

// ----------------------------------------------------------------------------
// WebSocket connector
// ----------------------------------------------------------------------------

/// Connects to the live service over a WebSocket.
pub struct GeminiLiveConnector {
    config: LiveServiceConfig,
    playback_format: AudioFormat,
}

impl GeminiLiveConnector {
    pub fn new(config: LiveServiceConfig, playback_format: AudioFormat) -> Self {
        Self {
            config,
            playback_format,
        }
    }
}

#[async_trait]
impl Connector for GeminiLiveConnector {
    async fn connect(&self, setup: &SessionSetup) -> LiveResult<Link> {
        if self.config.api_key.is_empty() {
            return Err(LiveError::Config("no API key configured".to_string()));
        }

        let url = self.config.url();
        let (stream, _response) = tokio_tungstenite::connect_async(url.as_str()).await?;
        let (mut write, mut read) = stream.split();

        let setup_message = SetupMessage::new(
            &self.config.model,
            &setup.system_instruction,
            &setup.voice_id,
            setup.input_transcription,
            setup.output_transcription,
        );
        write
            .send(Message::Text(serde_json::to_string(&setup_message)?))
            .await?;
        debug!(model = %self.config.model, "Setup message sent");

        // The service answers the setup before anything else
        loop {
            let text = match read.next().await {
                Some(Ok(Message::Text(text))) => text,
                Some(Ok(Message::Binary(data))) => String::from_utf8_lossy(&data).into_owned(),
                Some(Ok(Message::Close(frame))) => {
                    let reason = frame
                        .map(|f| f.reason.into_owned())
                        .unwrap_or_else(|| "no reason given".to_string());
                    return Err(LiveError::Connection(format!(
                        "closed during setup: {}",
                        reason
                    )));
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(e.into()),
                None => {
                    return Err(LiveError::Connection("closed during setup".to_string()));
                }
            };

            if ServerMessage::parse(&text)?.is_setup_complete() {
                info!("Live service setup complete");
                break;
            }
        }

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<EncodedChunk>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<ServerEvent>();
        let playback_format = self.playback_format;

        // Writer: runs until the session drops its sender, then says goodbye
        tokio::spawn(async move {
            while let Some(chunk) = outbound_rx.recv().await {
                let payload = match serde_json::to_string(&RealtimeInputMessage::audio(&chunk)) {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!("Failed to serialize audio frame: {}", e);
                        continue;
                    }
                };
                if let Err(e) = write.send(Message::Text(payload)).await {
                    debug!("Discarding outbound audio after send failure: {}", e);
                    return;
                }
            }
            let _ = write.send(Message::Close(None)).await;
            let _ = write.close().await;
        });

        // Reader: service messages become events
        let reader = tokio::spawn(async move {
            while let Some(message) = read.next().await {
                let text = match message {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Binary(data)) => String::from_utf8_lossy(&data).into_owned(),
                    Ok(Message::Close(frame)) => {
                        let reason = frame.map(|f| f.reason.into_owned());
                        let _ = inbound_tx.send(ServerEvent::Closed { reason });
                        return;
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        let _ = inbound_tx.send(ServerEvent::Error {
                            detail: e.to_string(),
                        });
                        return;
                    }
                };

                let message = match ServerMessage::parse(&text) {
                    Ok(message) => message,
                    Err(e) => {
                        warn!("Ignoring unreadable server message: {}", e);
                        continue;
                    }
                };

                for event in message.into_events(playback_format) {
                    let terminal = event.is_terminal();
                    if inbound_tx.send(event).is_err() || terminal {
                        return;
                    }
                }
            }
        });

        Ok(Link {
            outbound: outbound_tx,
            inbound: inbound_rx,
            tasks: vec![reader],
        })
    }
}
