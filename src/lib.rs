//! CareLive - realtime audio/video bridge between a patient-facing transport
//! and the Gemini Live API, plus vital-sign risk alerting.

#![forbid(unsafe_code)]

pub mod bridge;
pub mod channel;
pub mod codec;
pub mod config;
pub mod gemini;
pub mod history;
pub mod session;
pub mod trigger;
pub mod vitals;

pub use bridge::{BridgeError, MediaSessionBridge, SessionState};
pub use codec::{AudioChunk, AudioFrame, Blob, EncodingError, VideoFrame};
pub use config::{BridgeConfig, GeminiConfig};
pub use gemini::GeminiConnector;
pub use history::{ConversationHistory, Role, Turn};
pub use session::{ReplyChunk, SessionConnector, SessionError};
pub use trigger::{DebouncedTrigger, Severity, TriggerConfig};
