//! # Live Service Wire Protocol
//!
//! JSON messages exchanged with the bidirectional streaming endpoint, and the
//! typed [`ServerEvent`]s they turn into.
//!
//! ## Client -> Server:
//! - **setup**: first message on the socket; model, voice, persona and
//!   transcription flags
//! - **realtimeInput**: one base64 PCM frame per message
//!
//! ## Server -> Client:
//! - **setupComplete**: the session is ready to stream
//! - **serverContent**: transcriptions, model audio, interruption flag
//! - **goAway**: the server is about to disconnect

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::audio::codec::{AudioFormat, EncodedChunk};
use crate::error::LiveResult;

/// Who produced a transcript fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    User,
    Model,
}

impl Speaker {
    pub fn as_str(&self) -> &'static str {
        match self {
            Speaker::User => "user",
            Speaker::Model => "model",
        }
    }
}

/// Event produced by the transport, dispatched once and in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    /// The session is open and accepts audio
    Opened,
    /// Incremental transcript text for one side of the conversation
    PartialTranscript { speaker: Speaker, text: String },
    /// A chunk of model speech
    AudioChunk { payload: EncodedChunk },
    /// The user barged in; queued model audio is stale
    Interrupted,
    /// The connection ended without an error
    Closed { reason: Option<String> },
    /// The connection failed
    Error { detail: String },
}

impl ServerEvent {
    /// `Closed` and `Error` end the event stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ServerEvent::Closed { .. } | ServerEvent::Error { .. })
    }
}

// ----------------------------------------------------------------------------
// Outbound messages
// ----------------------------------------------------------------------------

/// Initial configuration message.
#[derive(Debug, Clone, Serialize)]
pub struct SetupMessage {
    pub setup: Setup,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Setup {
    pub model: String,
    pub generation_config: GenerationConfig,
    pub system_instruction: Content,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_audio_transcription: Option<TranscriptionConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_audio_transcription: Option<TranscriptionConfig>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub response_modalities: Vec<String>,
    pub speech_config: SpeechConfig,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeechConfig {
    pub voice_config: VoiceConfig,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceConfig {
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrebuiltVoiceConfig {
    pub voice_name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Content {
    pub parts: Vec<TextPart>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TextPart {
    pub text: String,
}

/// Enables transcription of one direction. Serializes as `{}`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TranscriptionConfig {}

impl SetupMessage {
    pub fn new(
        model: &str,
        system_instruction: &str,
        voice_name: &str,
        input_transcription: bool,
        output_transcription: bool,
    ) -> Self {
        let model = if model.starts_with("models/") {
            model.to_string()
        } else {
            format!("models/{}", model)
        };

        Self {
            setup: Setup {
                model,
                generation_config: GenerationConfig {
                    response_modalities: vec!["AUDIO".to_string()],
                    speech_config: SpeechConfig {
                        voice_config: VoiceConfig {
                            prebuilt_voice_config: PrebuiltVoiceConfig {
                                voice_name: voice_name.to_string(),
                            },
                        },
                    },
                },
                system_instruction: Content {
                    parts: vec![TextPart {
                        text: system_instruction.to_string(),
                    }],
                },
                input_audio_transcription: input_transcription.then(TranscriptionConfig::default),
                output_audio_transcription: output_transcription
                    .then(TranscriptionConfig::default),
            },
        }
    }
}

/// Streaming input message carrying one audio frame.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInputMessage {
    pub realtime_input: RealtimeInput,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInput {
    pub media_chunks: Vec<MediaChunk>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaChunk {
    pub mime_type: String,
    pub data: String,
}

impl RealtimeInputMessage {
    pub fn audio(chunk: &EncodedChunk) -> Self {
        Self {
            realtime_input: RealtimeInput {
                media_chunks: vec![MediaChunk {
                    mime_type: chunk.mime_type(),
                    data: chunk.to_transport_text(),
                }],
            },
        }
    }
}

// ----------------------------------------------------------------------------
// Inbound messages
// ----------------------------------------------------------------------------

/// Any message the server sends. Unknown fields are ignored.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    #[serde(default)]
    pub setup_complete: Option<serde_json::Value>,
    #[serde(default)]
    pub server_content: Option<ServerContent>,
    #[serde(default)]
    pub go_away: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerContent {
    #[serde(default)]
    pub model_turn: Option<ModelTurn>,
    #[serde(default)]
    pub input_transcription: Option<Transcription>,
    #[serde(default)]
    pub output_transcription: Option<Transcription>,
    #[serde(default)]
    pub interrupted: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModelTurn {
    #[serde(default)]
    pub parts: Vec<Part>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(default)]
    pub inline_data: Option<InlineData>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InlineData {
    #[serde(default)]
    pub mime_type: String,
    pub data: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Transcription {
    #[serde(default)]
    pub text: String,
}

impl ServerMessage {
    /// Parse one text (or UTF-8 binary) frame.
    pub fn parse(text: &str) -> LiveResult<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn is_setup_complete(&self) -> bool {
        self.setup_complete.is_some()
    }

    /// Split the message into events, in dispatch order: user transcript,
    /// model transcript, audio parts, interruption, go-away.
    ///
    /// Audio parts whose base64 payload is unreadable are logged and skipped;
    /// the rest of the message is still delivered.
    pub fn into_events(self, default_format: AudioFormat) -> Vec<ServerEvent> {
        let mut events = Vec::new();

        if let Some(content) = self.server_content {
            if let Some(transcription) = content.input_transcription {
                if !transcription.text.is_empty() {
                    events.push(ServerEvent::PartialTranscript {
                        speaker: Speaker::User,
                        text: transcription.text,
                    });
                }
            }

            if let Some(transcription) = content.output_transcription {
                if !transcription.text.is_empty() {
                    events.push(ServerEvent::PartialTranscript {
                        speaker: Speaker::Model,
                        text: transcription.text,
                    });
                }
            }

            let parts = content.model_turn.map(|turn| turn.parts).unwrap_or_default();
            for inline in parts.into_iter().filter_map(|part| part.inline_data) {
                if !inline.mime_type.is_empty() && !inline.mime_type.starts_with("audio/") {
                    continue;
                }
                let format = AudioFormat::from_mime_type(&inline.mime_type, default_format);
                match EncodedChunk::from_transport_text(&inline.data, format) {
                    Ok(payload) => events.push(ServerEvent::AudioChunk { payload }),
                    Err(e) => warn!("Dropping undecodable audio part: {}", e),
                }
            }

            if content.interrupted {
                events.push(ServerEvent::Interrupted);
            }
        }

        if self.go_away.is_some() {
            events.push(ServerEvent::Closed {
                reason: Some("server going away".to_string()),
            });
        }

        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_setup_message_shape() {
        let message = SetupMessage::new("gemini-test", "Be brief.", "Kore", true, false);
        let value = serde_json::to_value(&message).unwrap();

        assert_eq!(value["setup"]["model"], "models/gemini-test");
        assert_eq!(value["setup"]["generationConfig"]["responseModalities"][0], "AUDIO");
        assert_eq!(
            value["setup"]["generationConfig"]["speechConfig"]["voiceConfig"]
                ["prebuiltVoiceConfig"]["voiceName"],
            "Kore"
        );
        assert_eq!(value["setup"]["systemInstruction"]["parts"][0]["text"], "Be brief.");
        assert_eq!(value["setup"]["inputAudioTranscription"], json!({}));
        assert!(value["setup"].get("outputAudioTranscription").is_none());
    }

    #[test]
    fn test_realtime_input_shape() {
        let chunk = EncodedChunk::new(AudioFormat::capture(), vec![1, 0, 2, 0]);
        let value = serde_json::to_value(RealtimeInputMessage::audio(&chunk)).unwrap();
        let media = &value["realtimeInput"]["mediaChunks"][0];
        assert_eq!(media["mimeType"], "audio/pcm;rate=16000");
        assert_eq!(media["data"], "AQACAA==");
    }

    #[test]
    fn test_setup_complete() {
        let message = ServerMessage::parse(r#"{"setupComplete":{}}"#).unwrap();
        assert!(message.is_setup_complete());
        assert!(message.into_events(AudioFormat::playback()).is_empty());
    }

    #[test]
    fn test_server_content_event_order() {
        let text = json!({
            "serverContent": {
                "inputTranscription": {"text": "what is an EIA?"},
                "outputTranscription": {"text": "An EIA is"},
                "modelTurn": {"parts": [
                    {"inlineData": {"mimeType": "audio/pcm;rate=24000", "data": "AAABAA=="}},
                    {"text": "ignored"}
                ]},
                "interrupted": true
            }
        })
        .to_string();

        let events = ServerMessage::parse(&text)
            .unwrap()
            .into_events(AudioFormat::playback());

        assert_eq!(events.len(), 4);
        assert_eq!(
            events[0],
            ServerEvent::PartialTranscript {
                speaker: Speaker::User,
                text: "what is an EIA?".to_string()
            }
        );
        assert!(matches!(
            events[1],
            ServerEvent::PartialTranscript { speaker: Speaker::Model, .. }
        ));
        match &events[2] {
            ServerEvent::AudioChunk { payload } => {
                assert_eq!(payload.bytes, vec![0, 0, 1, 0]);
                assert_eq!(payload.format.sample_rate, 24_000);
            }
            other => panic!("expected audio, got {:?}", other),
        }
        assert_eq!(events[3], ServerEvent::Interrupted);
    }

    #[test]
    fn test_bad_audio_part_is_skipped() {
        let text = json!({
            "serverContent": {
                "modelTurn": {"parts": [
                    {"inlineData": {"mimeType": "audio/pcm", "data": "%%%"}},
                    {"inlineData": {"mimeType": "audio/pcm", "data": "AAA="}}
                ]}
            }
        })
        .to_string();

        let events = ServerMessage::parse(&text)
            .unwrap()
            .into_events(AudioFormat::playback());
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn test_go_away_closes() {
        let events = ServerMessage::parse(r#"{"goAway":{"timeLeft":"5s"}}"#)
            .unwrap()
            .into_events(AudioFormat::playback());
        assert!(matches!(events.as_slice(), [ServerEvent::Closed { .. }]));
        assert!(events[0].is_terminal());
    }

    #[test]
    fn test_invalid_json_is_connection_error() {
        let err = ServerMessage::parse("not json").unwrap_err();
        assert_eq!(err.code(), "connection_error");
    }
}
