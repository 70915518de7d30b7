//! # Live Service Module
//!
//! Connection to the remote conversational service.
//!
//! ## Key Components:
//! - **protocol**: JSON wire messages and the typed `ServerEvent` stream
//! - **transport**: the `LiveSession` state machine and its connectors

pub mod protocol; // Wire messages
pub mod transport; // Session state machine

pub use protocol::{ServerEvent, Speaker};
pub use transport::{Connector, GeminiLiveConnector, LiveSession, SessionSetup, TransportState};
