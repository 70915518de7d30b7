//! # Transcript
//!
//! Collects the partial transcript fragments of a session into turns.
//!
//! Fragments arrive as small pieces of text for either speaker. Consecutive
//! fragments from the same speaker belong to the same turn and are joined; a
//! fragment identical to the one just appended is a repeat from the service
//! and is ignored.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::live::Speaker;

/// Receives transcript fragments as they arrive.
pub trait TranscriptSink: Send + Sync {
    fn on_transcript(&self, speaker: Speaker, text: &str);
}

/// One speaker's turn in the conversation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TranscriptEntry {
    pub speaker: Speaker,
    pub text: String,
    pub started_at: DateTime<Utc>,
}

/// Turn-merging transcript of one session.
#[derive(Debug, Default)]
pub struct TranscriptLog {
    entries: Vec<TranscriptEntry>,
    last_fragment: Option<String>,
}

impl TranscriptLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a fragment. Returns `false` if it was empty or a repeat.
    pub fn push(&mut self, speaker: Speaker, fragment: &str) -> bool {
        if fragment.trim().is_empty() {
            return false;
        }

        match self.entries.last_mut() {
            Some(last) if last.speaker == speaker => {
                if self.last_fragment.as_deref() == Some(fragment) {
                    return false;
                }
                last.text.push_str(fragment);
            }
            _ => self.entries.push(TranscriptEntry {
                speaker,
                text: fragment.trim_start().to_string(),
                started_at: Utc::now(),
            }),
        }

        self.last_fragment = Some(fragment.to_string());
        true
    }

    pub fn entries(&self) -> &[TranscriptEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.last_fragment = None;
    }
}
