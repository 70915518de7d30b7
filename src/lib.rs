//! # Live Mentor
//!
//! Real-time spoken tutoring over a bidirectional audio stream. The student
//! talks into the microphone, a hosted conversational model answers with
//! speech, and both sides are transcribed as they speak.
//!
//! ## Architecture:
//! - **audio**: PCM codec, microphone capture pipeline, gapless playback
//! - **live**: wire protocol and streaming transport to the model service
//! - **session**: the controller that ties one tutoring session together
//! - **persona**: subjects and the tutor persona used for each
//! - **transcript**: turn-by-turn transcript of the conversation
//! - **config / error / state**: configuration, error taxonomy, metrics
//!
//! ## Example:
//! ```ignore
//! let controller = SessionController::new(config, backend, connector, observer);
//! controller.start(Subject::Bioethics).await?;
//! // ... conversation ...
//! controller.stop();
//! ```

pub mod audio; // Codec, capture and playback
pub mod config; // Configuration management
pub mod error; // Error taxonomy
pub mod live; // Remote service transport
pub mod persona; // Subjects and tutors
pub mod session; // Session controller
pub mod state; // Session metrics
pub mod transcript; // Transcript log

#[cfg(test)]
pub(crate) mod testing; // Fake devices and connector

pub use config::AppConfig;
pub use error::{LiveError, LiveResult};
pub use persona::Subject;
pub use session::{
    wait_for_session_end, SessionController, SessionEnd, SessionObserver, SessionState,
    SessionStatus,
};
