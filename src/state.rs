//! # Session Metrics
//!
//! Counters shared by every component of the live pipeline. The capture
//! callback runs on the audio device thread and the transport and playback
//! run on tokio tasks, so all counters are atomics: incrementing one never
//! blocks the real-time audio path.
//!
//! ## What is counted:
//! - **frames_captured**: frames sliced from the microphone signal
//! - **frames_sent**: frames handed to an open transport
//! - **frames_dropped**: frames offered while the transport was not open
//! - **chunks_scheduled / chunks_malformed**: received audio that was queued or dropped
//! - **interruptions**: barge-in flushes of the playback schedule
//! - **sessions_started / sessions_failed**: controller lifecycle outcomes

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Shared diagnostic counters for the live pipeline.
#[derive(Debug)]
pub struct SessionMetrics {
    frames_captured: AtomicU64,
    frames_sent: AtomicU64,
    frames_dropped: AtomicU64,
    chunks_scheduled: AtomicU64,
    chunks_malformed: AtomicU64,
    interruptions: AtomicU64,
    sessions_started: AtomicU64,
    sessions_failed: AtomicU64,
    created_at: DateTime<Utc>,
}

/// Point-in-time copy of [`SessionMetrics`], safe to serialize or log.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub frames_captured: u64,
    pub frames_sent: u64,
    pub frames_dropped: u64,
    pub chunks_scheduled: u64,
    pub chunks_malformed: u64,
    pub interruptions: u64,
    pub sessions_started: u64,
    pub sessions_failed: u64,
    pub uptime_seconds: i64,
}

impl SessionMetrics {
    pub fn new() -> Self {
        Self {
            frames_captured: AtomicU64::new(0),
            frames_sent: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
            chunks_scheduled: AtomicU64::new(0),
            chunks_malformed: AtomicU64::new(0),
            interruptions: AtomicU64::new(0),
            sessions_started: AtomicU64::new(0),
            sessions_failed: AtomicU64::new(0),
            created_at: Utc::now(),
        }
    }

    /// Convenience for the common `Arc<SessionMetrics>` ownership.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn record_frame_captured(&self) {
        self.frames_captured.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_frame_sent(&self) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_frame_dropped(&self) {
        self.frames_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_chunk_scheduled(&self) {
        self.chunks_scheduled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_chunk_malformed(&self) {
        self.chunks_malformed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_interruption(&self) {
        self.interruptions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_session_started(&self) {
        self.sessions_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_session_failed(&self) {
        self.sessions_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Read every counter into a [`MetricsSnapshot`].
    ///
    /// Counters are read individually, so a snapshot taken while audio is
    /// flowing may be off by one between related fields.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            frames_captured: self.frames_captured.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            chunks_scheduled: self.chunks_scheduled.load(Ordering::Relaxed),
            chunks_malformed: self.chunks_malformed.load(Ordering::Relaxed),
            interruptions: self.interruptions.load(Ordering::Relaxed),
            sessions_started: self.sessions_started.load(Ordering::Relaxed),
            sessions_failed: self.sessions_failed.load(Ordering::Relaxed),
            uptime_seconds: Utc::now()
                .signed_duration_since(self.created_at)
                .num_seconds(),
        }
    }
}

impl Default for SessionMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsSnapshot {
    /// Fraction of offered frames that never reached the transport.
    pub fn drop_rate(&self) -> f64 {
        let offered = self.frames_sent + self.frames_dropped;
        if offered > 0 {
            self.frames_dropped as f64 / offered as f64
        } else {
            0.0
        }
    }
}
