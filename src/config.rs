//! Bridge and remote-session configuration

use crate::codec::DEFAULT_JPEG_QUALITY;
use crate::history::DEFAULT_MAX_TURN_PAIRS;
use std::time::Duration;

const LIVE_API_URL: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1alpha.GenerativeService.BidiGenerateContent";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("environment variable {name} is not set: {source}")]
    MissingEnv {
        name: &'static str,
        #[source]
        source: std::env::VarError,
    },
}

/// Fixed parameters of one bridge instance.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Sample rate of captured audio sent to the session.
    pub inbound_audio_rate: u32,
    /// Sample rate of synthesized audio returned by the session.
    pub outbound_audio_rate: u32,
    /// Samples per emitted reply frame.
    pub output_frame_size: usize,
    /// Minimum spacing between video frames forwarded to the session.
    pub video_throttle: Duration,
    pub max_turn_pairs: usize,
    pub jpeg_quality: u8,
    /// Capacity of the capture-to-session queue.
    pub inbound_capacity: usize,
    /// Capacity of the reply audio queue, in frames.
    pub outbound_capacity: usize,
    /// Capacity of the local video echo queue.
    pub video_echo_capacity: usize,
    /// How long a producer waits on a full queue before giving up.
    pub put_timeout: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            inbound_audio_rate: 16000,
            outbound_audio_rate: 24000,
            output_frame_size: 480,
            video_throttle: Duration::from_secs(1),
            max_turn_pairs: DEFAULT_MAX_TURN_PAIRS,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
            inbound_capacity: 256,
            outbound_capacity: 1024,
            video_echo_capacity: 32,
            put_timeout: Duration::from_secs(2),
        }
    }
}

/// Response modality options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseModality {
    Text,
    Audio,
}

impl ResponseModality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "TEXT",
            Self::Audio => "AUDIO",
        }
    }
}

/// Media resolution options for video input
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaResolution {
    Low,
    Medium,
    High,
}

impl MediaResolution {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "MEDIA_RESOLUTION_LOW",
            Self::Medium => "MEDIA_RESOLUTION_MEDIUM",
            Self::High => "MEDIA_RESOLUTION_HIGH",
        }
    }
}

/// Configuration for the Gemini Live connector
#[derive(Debug, Clone)]
pub struct GeminiConfig {
    pub url: String,
    pub model: String,
    pub response_modality: ResponseModality,
    pub system_instruction: Option<String>,
    pub temperature: Option<f32>,
    pub media_resolution: Option<MediaResolution>,
    pub transcribe: bool,
    pub setup_timeout: Duration,
}

impl Default for GeminiConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            model: "models/gemini-2.0-flash-exp".to_string(),
            response_modality: ResponseModality::Audio,
            system_instruction: None,
            temperature: None,
            media_resolution: Some(MediaResolution::Medium),
            transcribe: true,
            setup_timeout: Duration::from_secs(10),
        }
    }
}

impl GeminiConfig {
    /// Defaults with the endpoint URL built from an API key.
    pub fn from_api_key(api_key: &str) -> Self {
        Self {
            url: format!("{}?key={}", LIVE_API_URL, api_key),
            ..Default::default()
        }
    }

    /// Read `GEMINI_API_KEY` (required) and `GEMINI_MODEL` (optional).
    pub fn from_env() -> Result<Self, ConfigError> {
        let api_key = std::env::var("GEMINI_API_KEY").map_err(|source| ConfigError::MissingEnv {
            name: "GEMINI_API_KEY",
            source,
        })?;

        let mut config = Self::from_api_key(&api_key);
        if let Ok(model) = std::env::var("GEMINI_MODEL") {
            if !model.is_empty() {
                config.model = model;
            }
        }
        Ok(config)
    }
}
