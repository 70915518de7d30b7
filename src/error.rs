//! # Error Handling
//!
//! Error taxonomy for the live tutoring pipeline. Every failure the audio
//! pipeline can hit maps onto one variant, and each variant has a fixed
//! recovery policy:
//!
//! - **PermissionDenied**: terminal for the current start attempt, controller returns to idle
//! - **AlreadyActive**: a second `start()` was rejected, the running session is untouched
//! - **Connection**: the transport failed to open or the remote side went away
//! - **MalformedAudio**: one received chunk was dropped, playback keeps going
//! - **Device**: an audio device failed for a reason other than permissions
//! - **Config**: configuration file or environment problems
//! - **Internal**: anything else
//!
//! Outbound frames that cannot be sent are not errors at all: they are counted
//! and dropped (see `LiveSession::send`).

use std::fmt;

/// Errors produced by the live tutoring pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum LiveError {
    /// Microphone (or other device) access was refused by the user or OS
    PermissionDenied(String),

    /// A session is already connecting or active
    AlreadyActive,

    /// Transport failed to open, timed out, or was closed by the remote side
    Connection(String),

    /// A PCM payload could not be decoded
    MalformedAudio(String),

    /// Audio device failure unrelated to permissions
    Device(String),

    /// Configuration file or environment variable problems
    Config(String),

    /// Unexpected internal failures
    Internal(String),
}

impl LiveError {
    /// Short machine-readable code, used in logs and status labels.
    pub fn code(&self) -> &'static str {
        match self {
            LiveError::PermissionDenied(_) => "permission_denied",
            LiveError::AlreadyActive => "already_active",
            LiveError::Connection(_) => "connection_error",
            LiveError::MalformedAudio(_) => "malformed_audio",
            LiveError::Device(_) => "device_error",
            LiveError::Config(_) => "config_error",
            LiveError::Internal(_) => "internal_error",
        }
    }

    /// Whether the error ends the current session attempt.
    ///
    /// Malformed audio is recovered locally by dropping the chunk.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, LiveError::MalformedAudio(_) | LiveError::AlreadyActive)
    }
}

impl fmt::Display for LiveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LiveError::PermissionDenied(msg) => write!(f, "Permission denied: {}", msg),
            LiveError::AlreadyActive => write!(f, "A live session is already active"),
            LiveError::Connection(msg) => write!(f, "Connection error: {}", msg),
            LiveError::MalformedAudio(msg) => write!(f, "Malformed audio: {}", msg),
            LiveError::Device(msg) => write!(f, "Audio device error: {}", msg),
            LiveError::Config(msg) => write!(f, "Configuration error: {}", msg),
            LiveError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for LiveError {}

impl From<anyhow::Error> for LiveError {
    fn from(err: anyhow::Error) -> Self {
        LiveError::Internal(err.to_string())
    }
}

/// Server messages that fail to parse are a protocol problem on the connection.
impl From<serde_json::Error> for LiveError {
    fn from(err: serde_json::Error) -> Self {
        LiveError::Connection(format!("invalid server message: {}", err))
    }
}

impl From<config::ConfigError> for LiveError {
    fn from(err: config::ConfigError) -> Self {
        LiveError::Config(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for LiveError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        LiveError::Connection(err.to_string())
    }
}

/// Bad transport text means the audio payload itself is unusable.
impl From<base64::DecodeError> for LiveError {
    fn from(err: base64::DecodeError) -> Self {
        LiveError::MalformedAudio(format!("invalid base64 payload: {}", err))
    }
}

/// Shorthand for results carrying a [`LiveError`].
pub type LiveResult<T> = Result<T, LiveError>;
