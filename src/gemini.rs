//! Gemini Live API session
//!
//! Implements the remote-session contract over the Live API's bidirectional
//! WebSocket. The socket is split so the bridge's writer task and receive
//! loop never contend: the sink sits behind a mutex, the stream is owned by
//! the reader.

use crate::codec::Blob;
use crate::config::GeminiConfig;
use crate::history::{Role, Turn};
use crate::session::{
    Control, Outgoing, ReplyChunk, Result, SessionConnector, SessionError, SessionHandle,
    SessionSink, SessionStream,
};

use async_trait::async_trait;
use base64::engine::general_purpose;
use base64::Engine;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use smallvec::{smallvec, SmallVec};
use std::collections::VecDeque;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

type WsConnection = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Generation configuration for setup.
#[derive(Debug, Serialize, Deserialize, Default, Clone)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub response_modalities: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_resolution: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Default, Clone, PartialEq)]
pub struct Part {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Default, Clone, PartialEq)]
pub struct Content {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    pub parts: Vec<Part>,
}

impl Content {
    fn text(role: &str, text: &str) -> Self {
        Self {
            role: Some(role.to_string()),
            parts: vec![Part {
                text: Some(text.to_string()),
            }],
        }
    }
}

/// Session setup message.
#[derive(Debug, Serialize, Deserialize, Default, Clone)]
#[serde(rename_all = "camelCase")]
pub struct BidiGenerateContentSetup {
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation_config: Option<GenerationConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_audio_transcription: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_audio_transcription: Option<serde_json::Value>,
}

#[derive(Debug, Serialize, Deserialize, Default, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ClientContent {
    pub turns: Vec<Content>,
    pub turn_complete: bool,
}

/// A chunk of realtime input
#[derive(Debug, Serialize, Deserialize, Default, Clone)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInput {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio: Option<Blob>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video: Option<Blob>,
}

/// Message sent from client to server.
#[derive(Debug, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub enum ClientMessage {
    Setup(BidiGenerateContentSetup),
    ClientContent(ClientContent),
    RealtimeInput(RealtimeInput),
}

/// Server -> client messages
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ServerMessage {
    SetupComplete {
        #[serde(rename = "setupComplete")]
        _setup_complete: serde_json::Value,
    },
    ServerContent {
        #[serde(rename = "serverContent")]
        server_content: serde_json::Value,
    },
    GoAway {
        #[serde(rename = "goAway")]
        go_away: serde_json::Value,
    },
    Other(serde_json::Value),
}

/// What a single server message amounts to.
#[derive(Debug, PartialEq)]
pub enum ServerEvent {
    SetupComplete,
    Chunks(Vec<ReplyChunk>),
}

/// Build the setup message for a configuration.
pub fn setup_message(config: &GeminiConfig) -> ClientMessage {
    let generation_config = GenerationConfig {
        response_modalities: vec![config.response_modality.as_str().to_string()],
        temperature: config.temperature,
        media_resolution: config.media_resolution.map(|r| r.as_str().to_string()),
    };

    let transcription = config.transcribe.then(|| serde_json::json!({}));

    ClientMessage::Setup(BidiGenerateContentSetup {
        model: config.model.clone(),
        generation_config: Some(generation_config),
        system_instruction: config
            .system_instruction
            .as_deref()
            .map(|instruction| Content::text("system", instruction)),
        input_audio_transcription: transcription.clone(),
        output_audio_transcription: transcription,
    })
}

/// Prior turns as client content, or `None` if there is nothing to replay.
pub fn seed_message(seed: &[Turn]) -> Option<ClientMessage> {
    let turns: Vec<Content> = seed
        .iter()
        .filter(|turn| !turn.text.is_empty())
        .map(|turn| {
            let role = match turn.role {
                Role::User => "user",
                Role::Assistant => "model",
            };
            Content::text(role, &turn.text)
        })
        .collect();

    if turns.is_empty() {
        return None;
    }

    Some(ClientMessage::ClientContent(ClientContent {
        turns,
        turn_complete: false,
    }))
}

/// Decode one text frame from the server.
pub fn decode_server_message(text: &str) -> Result<ServerEvent> {
    let message: ServerMessage = serde_json::from_str(text)?;

    let event = match message {
        ServerMessage::SetupComplete { .. } => ServerEvent::SetupComplete,
        ServerMessage::ServerContent { server_content } => {
            ServerEvent::Chunks(server_content_chunks(&server_content))
        }
        ServerMessage::GoAway { go_away } => {
            info!("Server requested disconnection: {}", go_away);
            ServerEvent::Chunks(vec![ReplyChunk::Control(Control::GoAway)])
        }
        ServerMessage::Other(value) => {
            debug!("Ignoring server message: {}", value);
            ServerEvent::Chunks(Vec::new())
        }
    };
    Ok(event)
}

/// Flatten a `serverContent` payload into reply chunks, in stream order.
fn server_content_chunks(content: &serde_json::Value) -> Vec<ReplyChunk> {
    let mut chunks = Vec::new();

    if let Some(text) = transcript_text(content, "inputTranscription") {
        chunks.push(ReplyChunk::Control(Control::InputTranscript(text)));
    }

    if let Some(model_turn) = content.get("modelTurn") {
        match model_turn.get("parts").and_then(|p| p.as_array()) {
            Some(parts) => {
                for part in parts {
                    if let Some(text) = part.get("text").and_then(|t| t.as_str()) {
                        if !text.is_empty() {
                            chunks.push(ReplyChunk::Text(text.to_string()));
                        }
                    } else if let Some(inline_data) = part.get("inlineData") {
                        if let Some(audio) = inline_audio(inline_data) {
                            chunks.push(ReplyChunk::Audio(audio));
                        }
                    }
                }
            }
            None => warn!("Received model turn without parts array: {:?}", model_turn),
        }
    }

    if let Some(text) = transcript_text(content, "outputTranscription") {
        chunks.push(ReplyChunk::Control(Control::OutputTranscript(text)));
    }

    if flag(content, "interrupted") {
        chunks.push(ReplyChunk::Control(Control::Interrupted));
    }

    if flag(content, "turnComplete") {
        chunks.push(ReplyChunk::Control(Control::TurnComplete));
    }

    chunks
}

fn transcript_text(content: &serde_json::Value, key: &str) -> Option<String> {
    let text = content.get(key)?.get("text")?.as_str()?;
    (!text.is_empty()).then(|| text.to_string())
}

fn flag(content: &serde_json::Value, key: &str) -> bool {
    content.get(key).and_then(|v| v.as_bool()).unwrap_or(false)
}

fn inline_audio(inline_data: &serde_json::Value) -> Option<Vec<u8>> {
    let mime = inline_data
        .get("mimeType")
        .and_then(|m| m.as_str())
        .unwrap_or("audio/pcm");
    if !mime.starts_with("audio/") {
        debug!("Skipping inline data of type {}", mime);
        return None;
    }

    let data_str = match inline_data.get("data").and_then(|d| d.as_str()) {
        Some(data) => data,
        None => {
            warn!("Received inline data without data field: {:?}", inline_data);
            return None;
        }
    };

    match general_purpose::STANDARD.decode(data_str) {
        Ok(data) if !data.is_empty() => Some(data),
        Ok(_) => None,
        Err(e) => {
            error!("Failed to decode base64 audio data: {:?}", e);
            None
        }
    }
}

/// Realtime input as wire messages, one per blob.
pub fn realtime_messages(input: Outgoing) -> SmallVec<[ClientMessage; 2]> {
    match input {
        Outgoing::Audio(blob) => smallvec![ClientMessage::RealtimeInput(RealtimeInput {
            audio: Some(blob),
            video: None,
        })],
        Outgoing::Video(blobs) => blobs
            .into_iter()
            .map(|blob| {
                ClientMessage::RealtimeInput(RealtimeInput {
                    audio: None,
                    video: Some(blob),
                })
            })
            .collect(),
    }
}

async fn send_message(
    writer: &mut SplitSink<WsConnection, Message>,
    msg: &ClientMessage,
) -> Result<()> {
    let json = serde_json::to_string(msg)?;
    debug!("Sending message ({} bytes)", json.len());
    writer.send(Message::text(json)).await?;
    Ok(())
}

/// Opens Gemini Live sessions.
pub struct GeminiConnector {
    config: GeminiConfig,
}

impl GeminiConnector {
    pub fn new(config: GeminiConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl SessionConnector for GeminiConnector {
    async fn connect(&self, seed: &[Turn]) -> Result<SessionHandle> {
        info!("Connecting to Gemini API with model {}", self.config.model);

        let (ws, resp) = connect_async(self.config.url.as_str()).await?;
        debug!("WebSocket connection response: {:?}", resp.status());

        let (mut writer, mut reader) = ws.split();

        send_message(&mut writer, &setup_message(&self.config)).await?;
        info!("Setup message sent, waiting for acknowledgment");

        tokio::time::timeout(self.config.setup_timeout, wait_for_setup_complete(&mut reader))
            .await
            .map_err(|_| {
                error!("Timeout waiting for setup complete message");
                SessionError::Timeout
            })??;

        if let Some(msg) = seed_message(seed) {
            info!("Seeding session with {} prior turns", seed.len());
            send_message(&mut writer, &msg).await?;
        }

        info!("Gemini session setup complete");
        Ok(SessionHandle {
            sink: Box::new(GeminiSink {
                writer: Mutex::new(writer),
            }),
            stream: Box::new(GeminiStream {
                reader,
                pending: VecDeque::new(),
            }),
        })
    }
}

async fn wait_for_setup_complete(reader: &mut SplitStream<WsConnection>) -> Result<()> {
    while let Some(message) = reader.next().await {
        let text = match message? {
            Message::Text(text) => text.as_str().to_string(),
            Message::Binary(bytes) => match String::from_utf8(bytes.to_vec()) {
                Ok(text) => text,
                Err(_) => continue,
            },
            Message::Close(frame) => {
                error!("Connection closed during setup: {:?}", frame);
                return Err(SessionError::ConnectionClosed);
            }
            _ => continue,
        };

        match decode_server_message(&text)? {
            ServerEvent::SetupComplete => return Ok(()),
            ServerEvent::Chunks(chunks) => {
                debug!("Ignoring {} chunks received before setup completed", chunks.len());
            }
        }
    }
    Err(SessionError::SetupNotComplete)
}

/// Write half of a Gemini session.
struct GeminiSink {
    writer: Mutex<SplitSink<WsConnection, Message>>,
}

#[async_trait]
impl SessionSink for GeminiSink {
    async fn send(&self, input: Outgoing) -> Result<()> {
        // lock held across the burst so the images stay adjacent
        let mut writer = self.writer.lock().await;
        for msg in realtime_messages(input) {
            send_message(&mut writer, &msg).await?;
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let mut writer = self.writer.lock().await;
        match writer.close().await {
            Ok(()) | Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Read half of a Gemini session.
struct GeminiStream {
    reader: SplitStream<WsConnection>,
    pending: VecDeque<ReplyChunk>,
}

impl GeminiStream {
    fn absorb(&mut self, text: &str) {
        match decode_server_message(text) {
            Ok(ServerEvent::Chunks(chunks)) => self.pending.extend(chunks),
            Ok(ServerEvent::SetupComplete) => debug!("Duplicate setupComplete ignored"),
            Err(e) => {
                error!("Failed to parse server message: {:?}", e);
                error!("Raw message: {}", text);
            }
        }
    }
}

#[async_trait]
impl SessionStream for GeminiStream {
    async fn next_chunk(&mut self) -> Option<Result<ReplyChunk>> {
        loop {
            if let Some(chunk) = self.pending.pop_front() {
                return Some(Ok(chunk));
            }

            match self.reader.next().await? {
                Ok(Message::Text(text)) => self.absorb(text.as_str()),
                Ok(Message::Binary(bytes)) => match std::str::from_utf8(&bytes) {
                    Ok(text) => self.absorb(text),
                    Err(_) => debug!("Received binary message ({} bytes)", bytes.len()),
                },
                Ok(Message::Close(frame)) => {
                    info!("WebSocket closed: {:?}", frame);
                    return None;
                }
                Ok(_) => {
                    // ping/pong
                }
                Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => return None,
                Err(e) => return Some(Err(e.into())),
            }
        }
    }
}
