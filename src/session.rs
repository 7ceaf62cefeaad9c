//! Contract between the bridge and a remote streaming session
//!
//! A connector opens a session seeded with prior conversation turns and hands
//! back the two halves of the connection: a sink for realtime input and a
//! stream of typed reply chunks.

use crate::codec::Blob;
use crate::history::Turn;
use async_trait::async_trait;
use smallvec::SmallVec;
use tokio_tungstenite::tungstenite::Error as WsError;

/// Error type for remote session operations
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),

    #[error("JSON serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Setup not complete")]
    SetupNotComplete,

    #[error("Timeout")]
    Timeout,

    #[error("Protocol error: {0}")]
    Protocol(String),
}

pub type Result<T> = std::result::Result<T, SessionError>;

/// Realtime input forwarded to the remote session.
#[derive(Debug, Clone, PartialEq)]
pub enum Outgoing {
    Audio(Blob),
    /// A video frame, optionally followed by a still image, sent back to back.
    Video(SmallVec<[Blob; 2]>),
}

/// Out-of-band signals carried on the reply stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Control {
    /// Transcript of the user's speech.
    InputTranscript(String),
    /// Transcript of the synthesized reply.
    OutputTranscript(String),
    /// The model finished its turn.
    TurnComplete,
    /// The model's turn was cut short by new user input.
    Interrupted,
    /// The remote side is about to close the session.
    GoAway,
}

/// A chunk of the remote session's reply stream.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplyChunk {
    /// Raw little-endian PCM16 at the session's output rate.
    Audio(Vec<u8>),
    Text(String),
    Control(Control),
}

/// Write half of a remote session.
#[async_trait]
pub trait SessionSink: Send + Sync {
    async fn send(&self, input: Outgoing) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Read half of a remote session.
#[async_trait]
pub trait SessionStream: Send {
    /// Next reply chunk. `None` is an orderly close; `Some(Err(_))` is a fault.
    async fn next_chunk(&mut self) -> Option<Result<ReplyChunk>>;
}

/// An open session, split so sending and receiving can run concurrently.
pub struct SessionHandle {
    pub sink: Box<dyn SessionSink>,
    pub stream: Box<dyn SessionStream>,
}

/// Opens remote sessions.
#[async_trait]
pub trait SessionConnector: Send + Sync {
    async fn connect(&self, seed: &[Turn]) -> Result<SessionHandle>;
}
