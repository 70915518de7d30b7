//! # Configuration Management
//!
//! Loads the live tutoring configuration from multiple sources:
//! - TOML configuration file (config.toml)
//! - Environment variables (with APP_ prefix, `__` between section and key)
//! - Default values (built into the code)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. `GEMINI_API_KEY` / `API_KEY` for the service key
//! 2. Environment variables (APP_LIVE__MODEL, APP_AUDIO__FRAME_SIZE, etc.)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

use crate::audio::codec::AudioFormat;

/// Main configuration, grouped by concern.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub live: LiveServiceConfig,
    pub audio: AudioConfig,
    pub session: SessionConfig,
}

/// Remote conversational service settings.
///
/// ## Fields:
/// - `endpoint`: WebSocket URL of the bidirectional streaming endpoint
/// - `model`: model identifier sent in the setup message
/// - `api_key`: appended to the endpoint as the `key` query parameter
/// - `connect_timeout_ms`: upper bound on the `Connecting` phase
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveServiceConfig {
    pub endpoint: String,
    pub model: String,
    pub api_key: String,
    pub connect_timeout_ms: u64,
}

/// Audio format settings for capture and playback.
///
/// Both directions are mono: the microphone is downmixed before framing and
/// the service only speaks mono. The frame size is fixed for the lifetime of
/// a session; it is never adjusted while streaming.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    pub capture_sample_rate: u32,
    pub playback_sample_rate: u32,
    pub frame_size: usize,
}

/// Per-session behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Subject used by the terminal driver (`aia` or `bioethics`)
    pub subject: String,
    pub input_transcription: bool,
    pub output_transcription: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            live: LiveServiceConfig {
                endpoint: "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent".to_string(),
                model: "gemini-2.5-flash-native-audio-preview-12-2025".to_string(),
                api_key: String::new(),
                connect_timeout_ms: 10_000,
            },
            audio: AudioConfig {
                capture_sample_rate: 16_000,
                playback_sample_rate: 24_000,
                frame_size: 4096,
            },
            session: SessionConfig {
                subject: "aia".to_string(),
                input_transcription: true,
                output_transcription: true,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from defaults, `config.toml` and the environment.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_LIVE__MODEL=...`: Override the model
    /// - `APP_LIVE__CONNECT_TIMEOUT_MS=5000`: Shorter connect timeout
    /// - `APP_AUDIO__FRAME_SIZE=2048`: Smaller capture frames
    /// - `GEMINI_API_KEY=...` or `API_KEY=...`: Service key
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );

        for var in ["API_KEY", "GEMINI_API_KEY"] {
            if let Ok(key) = env::var(var) {
                settings = settings.set_override("live.api_key", key)?;
            }
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    pub fn validate(&self) -> Result<()> {
        if self.live.endpoint.trim().is_empty() {
            return Err(anyhow::anyhow!("Live service endpoint cannot be empty"));
        }

        if !self.live.endpoint.starts_with("ws://") && !self.live.endpoint.starts_with("wss://") {
            return Err(anyhow::anyhow!(
                "Live service endpoint must be a ws:// or wss:// URL, got {}",
                self.live.endpoint
            ));
        }

        if self.live.model.trim().is_empty() {
            return Err(anyhow::anyhow!("Live service model cannot be empty"));
        }

        if self.live.connect_timeout_ms == 0 {
            return Err(anyhow::anyhow!("Connect timeout must be greater than 0"));
        }

        if self.audio.capture_sample_rate == 0 || self.audio.playback_sample_rate == 0 {
            return Err(anyhow::anyhow!("Sample rates must be greater than 0"));
        }

        if self.audio.frame_size == 0 {
            return Err(anyhow::anyhow!("Capture frame size must be greater than 0"));
        }

        Ok(())
    }
}

impl LiveServiceConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Endpoint URL with the API key attached, if one is configured.
    pub fn url(&self) -> String {
        if self.api_key.is_empty() {
            self.endpoint.clone()
        } else {
            format!("{}?key={}", self.endpoint, self.api_key)
        }
    }
}

impl AudioConfig {
    pub fn capture_format(&self) -> AudioFormat {
        AudioFormat::mono(self.capture_sample_rate)
    }

    pub fn playback_format(&self) -> AudioFormat {
        AudioFormat::mono(self.playback_sample_rate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.audio.capture_sample_rate, 16_000);
        assert_eq!(config.audio.playback_sample_rate, 24_000);
        assert_eq!(config.audio.frame_size, 4096);
        assert_eq!(config.live.connect_timeout(), Duration::from_secs(10));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.audio.frame_size = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.live.endpoint = "https://example.com".to_string();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.live.connect_timeout_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_url_includes_key() {
        let mut config = AppConfig::default();
        assert!(!config.live.url().contains("?key="));
        config.live.api_key = "secret".to_string();
        assert!(config.live.url().ends_with("?key=secret"));
    }

    #[test]
    fn test_formats() {
        let config = AppConfig::default();
        assert_eq!(config.audio.capture_format().mime_type(), "audio/pcm;rate=16000");
        assert_eq!(config.audio.playback_format().sample_rate, 24_000);
    }

    #[test]
    fn test_stale_channel_setting_still_yields_mono() {
        let config: AppConfig = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default()).unwrap())
            .set_override("audio.channels", 2)
            .unwrap()
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert!(config.validate().is_ok());
        assert_eq!(config.audio.capture_format().channels, 1);
        assert_eq!(config.audio.playback_format().channels, 1);

        // Four mono samples make a four-frame, quarter-millisecond chunk
        let frame = crate::audio::codec::encode_frame(&[0.1; 4], config.audio.capture_format());
        assert_eq!(frame.frame_count(), 4);
        assert!((frame.duration_secs() - 0.00025).abs() < 1e-12);
    }
}
