//! # Live Mentor - Terminal Driver
//!
//! Runs one spoken tutoring session on the default microphone and speaker.
//!
//! ## What happens:
//! 1. **Configuration** is loaded from `config.toml`, `.env` and the environment
//! 2. **Logging** is set up (`RUST_LOG` controls verbosity)
//! 3. **A session** starts for the configured subject (`APP_SESSION__SUBJECT`)
//! 4. **Status changes and transcripts** are written to the log as they arrive
//! 5. **Ctrl+C / SIGTERM** stops the session and releases the devices
//! 6. **A remote close or connection error** ends the program with an error
//!
//! ## Key Rust Concepts Used:
//! - **Arc<dyn Trait>**: the controller receives its devices, connector and
//!   observer as shared trait objects
//! - **tokio::select!**: waits for whichever shutdown signal comes first

use anyhow::Result;
use live_mentor::audio::cpal_device::CpalBackend;
use live_mentor::live::{GeminiLiveConnector, Speaker};
use live_mentor::transcript::TranscriptSink;
use live_mentor::{
    wait_for_session_end, AppConfig, SessionController, SessionEnd, SessionObserver,
    SessionStatus, Subject,
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Observer that writes everything to the log and forwards status changes
/// to the main task.
struct LogObserver {
    tutor: &'static str,
    statuses: mpsc::UnboundedSender<SessionStatus>,
}

impl TranscriptSink for LogObserver {
    fn on_transcript(&self, speaker: Speaker, text: &str) {
        match speaker {
            Speaker::User => info!(target: "live_mentor::transcript", "you: {}", text.trim()),
            Speaker::Model => {
                info!(target: "live_mentor::transcript", "{}: {}", self.tutor, text.trim())
            }
        }
    }
}

impl SessionObserver for LogObserver {
    fn on_status_change(&self, status: &SessionStatus) {
        info!(state = status.state.as_str(), "{}", status.label);
        let _ = self.statuses.send(status.clone());
    }
}

/// The main application entry point.
///
/// ## Error Handling:
/// Configuration problems, a failed session start and a session that fails
/// while running end the program with an error. A signal ends it cleanly.
#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env file is fine
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    let subject: Subject = config
        .session
        .subject
        .parse()
        .map_err(|e: String| anyhow::anyhow!(e))?;
    let persona = subject.persona();

    info!("Starting live-mentor v{}", env!("CARGO_PKG_VERSION"));
    info!(
        subject = %subject,
        tutor = persona.tutor_name,
        role = persona.role,
        model = %config.live.model,
        "Configuration loaded"
    );
    if config.live.api_key.is_empty() {
        warn!("No API key configured, set GEMINI_API_KEY");
    }

    let connector = GeminiLiveConnector::new(config.live.clone(), config.audio.playback_format());
    let (status_tx, mut status_rx) = mpsc::unbounded_channel();
    let observer = LogObserver {
        tutor: persona.tutor_name,
        statuses: status_tx,
    };
    let controller = SessionController::new(
        config,
        Arc::new(CpalBackend::new()),
        Arc::new(connector),
        Arc::new(observer),
    );

    if let Err(e) = controller.start(subject).await {
        error!("Could not start the session: {}", e);
        return Err(e.into());
    }

    let outcome = tokio::select! {
        signal = wait_for_shutdown() => {
            signal?;
            SessionEnd::Stopped
        }
        end = wait_for_session_end(&mut status_rx) => end,
    };

    controller.stop();
    let metrics = controller.metrics().snapshot();
    info!(
        frames_sent = metrics.frames_sent,
        frames_dropped = metrics.frames_dropped,
        drop_rate = metrics.drop_rate(),
        chunks_scheduled = metrics.chunks_scheduled,
        interruptions = metrics.interruptions,
        "Session finished"
    );

    match outcome {
        SessionEnd::Stopped => Ok(()),
        SessionEnd::Failed(label) => Err(anyhow::anyhow!("session ended: {}", label)),
    }
}

/// Initialize the tracing (logging) system.
///
/// ## Environment Variables:
/// - `RUST_LOG`: Controls what gets logged (e.g., "debug", "live_mentor=trace")
/// - If not set, defaults to "live_mentor=debug"
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "live_mentor=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn wait_for_shutdown() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => {
            info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            info!("Received SIGINT");
        }
    }

    Ok(())
}
