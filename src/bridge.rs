//! Realtime duplex media bridge
//!
//! Owns one remote session for its lifetime. Captured audio and video are
//! encoded on the caller, queued, and forwarded by a writer task; replies are
//! read by a receive loop, reframed to a fixed frame size, and queued for the
//! transport. The transport only ever talks to the bridge through
//! `receive_*`, `emit_*` and `shutdown`.
//!
//! ```text
//! Idle -> Connecting -> Active -> Closing -> Closed
//!   \          \___________________________/^
//!    \_____________________________________/
//! ```

use crate::channel::{BoundedChannel, ChannelError};
use crate::codec::{
    encode_audio, encode_image, AudioChunk, AudioFrame, AudioReframer, EncodingError, VideoFrame,
};
use crate::config::BridgeConfig;
use crate::history::ConversationHistory;
use crate::session::{
    Control, Outgoing, ReplyChunk, SessionConnector, SessionError, SessionSink, SessionStream,
};
use crate::trigger::{DebouncedTrigger, TriggerConfig};

use smallvec::SmallVec;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Active,
    Closing,
    Closed,
}

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("failed to open remote session: {0}")]
    Connect(#[source] SessionError),

    #[error(transparent)]
    Encoding(#[from] EncodingError),

    #[error("inbound queue stayed full for {0:?}")]
    QueueTimeout(Duration),

    #[error("bridge cannot be started from state {0:?}")]
    AlreadyStarted(SessionState),
}

pub type Result<T> = std::result::Result<T, BridgeError>;

/// State shared between the caller-facing handle and the background tasks.
struct Shared {
    config: BridgeConfig,
    state: watch::Sender<SessionState>,
    quit: watch::Sender<bool>,
    /// Number of finished model turns.
    turns: watch::Sender<u64>,
    inbound: BoundedChannel<Outgoing>,
    outbound: BoundedChannel<AudioFrame>,
    video_echo: BoundedChannel<VideoFrame>,
    throttle: Mutex<DebouncedTrigger>,
    history: Mutex<ConversationHistory>,
}

/// The in-progress exchange, committed to history at the end of each turn.
struct TurnBuffer {
    reframer: AudioReframer,
    user: String,
    assistant: String,
}

impl TurnBuffer {
    fn take(&mut self) -> Option<(String, String)> {
        if self.user.is_empty() && self.assistant.is_empty() {
            return None;
        }
        Some((std::mem::take(&mut self.user), std::mem::take(&mut self.assistant)))
    }
}

pub struct MediaSessionBridge {
    shared: Arc<Shared>,
    connector: Arc<dyn SessionConnector>,
}

impl MediaSessionBridge {
    pub fn new(config: BridgeConfig, connector: Arc<dyn SessionConnector>) -> Self {
        let history = ConversationHistory::new(config.max_turn_pairs);
        Self::with_history(config, connector, history)
    }

    /// A bridge whose first session is seeded with an earlier conversation.
    pub fn with_history(
        config: BridgeConfig,
        connector: Arc<dyn SessionConnector>,
        history: ConversationHistory,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::Idle);
        let (quit, _) = watch::channel(false);
        let (turns, _) = watch::channel(0);

        let shared = Shared {
            inbound: BoundedChannel::new(config.inbound_capacity, config.put_timeout),
            outbound: BoundedChannel::new(config.outbound_capacity, config.put_timeout),
            video_echo: BoundedChannel::new(config.video_echo_capacity, config.put_timeout),
            throttle: Mutex::new(DebouncedTrigger::new(TriggerConfig::throttle(
                config.video_throttle,
            ))),
            history: Mutex::new(history),
            state,
            quit,
            turns,
            config,
        };

        Self {
            shared: Arc::new(shared),
            connector,
        }
    }

    pub fn state(&self) -> SessionState {
        *self.shared.state.borrow()
    }

    /// Watch state transitions, e.g. to notice a dropped session.
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.shared.state.subscribe()
    }

    /// Counts finished or interrupted model turns.
    pub fn subscribe_turns(&self) -> watch::Receiver<u64> {
        self.shared.turns.subscribe()
    }

    /// Snapshot of the conversation so far.
    pub async fn history(&self) -> ConversationHistory {
        self.shared.history.lock().await.clone()
    }

    /// Open the remote session and start pumping.
    pub async fn start(&self) -> Result<()> {
        let mut previous = SessionState::Idle;
        let started = self.shared.state.send_if_modified(|state| {
            previous = *state;
            if *state == SessionState::Idle {
                *state = SessionState::Connecting;
                true
            } else {
                false
            }
        });
        if !started {
            return Err(BridgeError::AlreadyStarted(previous));
        }

        let seed = self.shared.history.lock().await.snapshot();
        info!("Connecting remote session with {} seed turns", seed.len());

        let handle = match self.connector.connect(&seed).await {
            Ok(handle) => handle,
            Err(e) => {
                error!("Failed to connect remote session: {}", e);
                self.shared.close_queues();
                self.shared.quit.send_replace(false);
                self.shared.state.send_replace(SessionState::Closed);
                return Err(BridgeError::Connect(e));
            }
        };

        let activated = self.shared.state.send_if_modified(|state| {
            if *state == SessionState::Connecting {
                *state = SessionState::Active;
                true
            } else {
                false
            }
        });

        let sink: Arc<dyn SessionSink> = Arc::from(handle.sink);

        if !activated {
            // shutdown arrived while connecting
            info!("Shutdown requested during connect, closing new session");
            if let Err(e) = sink.close().await {
                warn!("Failed to close remote session: {}", e);
            }
            self.shared.close_queues();
            self.shared.quit.send_replace(false);
            self.shared.state.send_replace(SessionState::Closed);
            return Ok(());
        }

        info!("Remote session active");
        let writer = tokio::spawn(run_writer(self.shared.clone(), sink.clone()));
        tokio::spawn(run_receive_loop(
            self.shared.clone(),
            sink,
            writer,
            handle.stream,
        ));
        Ok(())
    }

    /// Forward a chunk of captured audio. A no-op unless the session is active.
    pub async fn receive_audio(&self, chunk: AudioChunk) -> Result<()> {
        let expected = self.shared.config.inbound_audio_rate;
        if chunk.sample_rate != expected {
            return Err(EncodingError::SampleRate {
                expected,
                actual: chunk.sample_rate,
            }
            .into());
        }

        if self.state() != SessionState::Active {
            debug!("Dropping audio chunk, session not active");
            return Ok(());
        }

        let blob = encode_audio(&chunk.samples, chunk.sample_rate);
        self.forward(Outgoing::Audio(blob)).await
    }

    /// Echo a captured frame locally and, when the throttle allows, forward
    /// it to the remote session followed by the optional still image.
    pub async fn receive_video(&self, frame: VideoFrame, still: Option<&VideoFrame>) -> Result<()> {
        self.receive_video_at(frame, still, Instant::now()).await
    }

    /// [`receive_video`](Self::receive_video) with an explicit capture time.
    pub async fn receive_video_at(
        &self,
        frame: VideoFrame,
        still: Option<&VideoFrame>,
        now: Instant,
    ) -> Result<()> {
        frame.check_shape()?;
        if let Some(still) = still {
            still.check_shape()?;
        }

        let forwarded = if self.state() == SessionState::Active {
            self.forward_video(&frame, still, now).await
        } else {
            Ok(())
        };

        // the echo never depends on the session path
        let echoed = match self.shared.video_echo.put(frame).await {
            Ok(()) | Err(ChannelError::Closed) => Ok(()),
            Err(ChannelError::QueueTimeout(d)) => Err(BridgeError::QueueTimeout(d)),
        };

        forwarded.and(echoed)
    }

    /// Forward a burst if the throttle is open. The throttle only records the
    /// send when the burst was actually queued.
    async fn forward_video(
        &self,
        frame: &VideoFrame,
        still: Option<&VideoFrame>,
        now: Instant,
    ) -> Result<()> {
        let mut throttle = self.shared.throttle.lock().await;
        let previous = throttle.clone();
        if throttle.observe(true, now).is_none() {
            return Ok(());
        }

        let result = self.send_burst(frame, still).await;
        if result.is_err() {
            *throttle = previous;
        }
        result
    }

    async fn send_burst(&self, frame: &VideoFrame, still: Option<&VideoFrame>) -> Result<()> {
        let quality = self.shared.config.jpeg_quality;
        let mut burst = SmallVec::new();
        burst.push(encode_image(frame, quality)?);
        if let Some(still) = still {
            burst.push(encode_image(still, quality)?);
        }
        debug!("Forwarding video burst of {} images", burst.len());
        self.forward(Outgoing::Video(burst)).await
    }

    /// Next frame of synthesized reply audio. `None` once the session is over
    /// and every queued frame has been delivered.
    pub async fn emit_audio(&self) -> Option<AudioFrame> {
        self.shared.outbound.get().await
    }

    /// Next locally echoed video frame.
    pub async fn emit_video(&self) -> Option<VideoFrame> {
        self.shared.video_echo.get().await
    }

    /// Tear the session down and wait until it is closed. Safe to call any
    /// number of times and from any state.
    pub async fn shutdown(&self) {
        let mut previous = SessionState::Idle;
        self.shared.state.send_if_modified(|state| {
            previous = *state;
            match *state {
                SessionState::Idle => {
                    *state = SessionState::Closed;
                    true
                }
                SessionState::Connecting => {
                    *state = SessionState::Closing;
                    true
                }
                _ => false,
            }
        });

        match previous {
            SessionState::Idle => {
                info!("Shutdown before connect");
                self.shared.close_queues();
                return;
            }
            SessionState::Connecting | SessionState::Active => {
                info!("Shutdown requested");
                self.shared.quit.send_replace(true);
            }
            SessionState::Closing | SessionState::Closed => {}
        }

        let mut state_rx = self.shared.state.subscribe();
        loop {
            let closed = *state_rx.borrow_and_update() == SessionState::Closed;
            if closed || state_rx.changed().await.is_err() {
                break;
            }
        }
    }

    async fn forward(&self, item: Outgoing) -> Result<()> {
        match self.shared.inbound.put(item).await {
            Ok(()) | Err(ChannelError::Closed) => Ok(()),
            Err(ChannelError::QueueTimeout(d)) => {
                warn!("Inbound queue full for {:?}", d);
                Err(BridgeError::QueueTimeout(d))
            }
        }
    }
}

impl Shared {
    fn close_queues(&self) {
        self.inbound.close();
        self.outbound.close();
        self.video_echo.close();
    }

    /// Queue a reply frame, retrying while the transport lags behind.
    /// Returns false if the session is going away.
    async fn deliver(&self, frame: AudioFrame, quit_rx: &mut watch::Receiver<bool>) -> bool {
        loop {
            let quit = *quit_rx.borrow_and_update();
            if quit {
                return false;
            }

            tokio::select! {
                res = self.outbound.put(frame.clone()) => match res {
                    Ok(()) => return true,
                    Err(ChannelError::Closed) => return false,
                    Err(ChannelError::QueueTimeout(d)) => {
                        warn!("Outbound audio queue full for {:?}, retrying", d);
                    }
                },
                changed = quit_rx.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                }
            }
        }
    }

    /// Apply one reply chunk. Returns false when the loop should stop.
    async fn handle_chunk(
        &self,
        chunk: ReplyChunk,
        turn: &mut TurnBuffer,
        quit_rx: &mut watch::Receiver<bool>,
    ) -> bool {
        match chunk {
            ReplyChunk::Audio(bytes) => {
                for frame in turn.reframer.push(&bytes) {
                    if !self.deliver(frame, quit_rx).await {
                        return false;
                    }
                }
            }
            ReplyChunk::Text(text) | ReplyChunk::Control(Control::OutputTranscript(text)) => {
                turn.assistant.push_str(&text);
            }
            ReplyChunk::Control(Control::InputTranscript(text)) => {
                turn.user.push_str(&text);
            }
            ReplyChunk::Control(control @ (Control::TurnComplete | Control::Interrupted)) => {
                debug!("Turn ended: {:?}", control);
                if let Some(frame) = turn.reframer.flush() {
                    if !self.deliver(frame, quit_rx).await {
                        return false;
                    }
                }
                if let Some((user, assistant)) = turn.take() {
                    self.history.lock().await.append(&user, &assistant);
                }
                self.turns.send_modify(|count| *count += 1);
            }
            ReplyChunk::Control(Control::GoAway) => {
                info!("Remote session is going away");
                return false;
            }
        }
        true
    }

    async fn teardown(
        &self,
        sink: Arc<dyn SessionSink>,
        mut writer: JoinHandle<()>,
        mut turn: TurnBuffer,
    ) {
        self.state.send_replace(SessionState::Closing);
        info!("Closing remote session");

        if let Some(frame) = turn.reframer.flush() {
            if let Err(e) = self.outbound.put(frame).await {
                warn!("Dropped final reply frame: {}", e);
            }
        }
        if let Some((user, assistant)) = turn.take() {
            self.history.lock().await.append(&user, &assistant);
        }

        // let the writer drain what was already accepted
        self.inbound.close();
        if tokio::time::timeout(self.config.put_timeout, &mut writer)
            .await
            .is_err()
        {
            warn!("Writer task did not drain in time, aborting");
            writer.abort();
        }

        if let Err(e) = sink.close().await {
            warn!("Failed to close remote session: {}", e);
        }

        self.outbound.close();
        self.video_echo.close();
        self.quit.send_replace(false);
        self.state.send_replace(SessionState::Closed);
        info!("Remote session closed");
    }
}

async fn run_writer(shared: Arc<Shared>, sink: Arc<dyn SessionSink>) {
    info!("Session writer task started");

    while let Some(item) = shared.inbound.get().await {
        if let Err(e) = sink.send(item).await {
            error!("Failed to send to remote session: {}", e);
            shared.quit.send_replace(true);
            break;
        }
    }

    info!("Session writer task shutting down");
}

async fn run_receive_loop(
    shared: Arc<Shared>,
    sink: Arc<dyn SessionSink>,
    writer: JoinHandle<()>,
    mut stream: Box<dyn SessionStream>,
) {
    let mut quit_rx = shared.quit.subscribe();
    let mut turn = TurnBuffer {
        reframer: AudioReframer::new(
            shared.config.outbound_audio_rate,
            shared.config.output_frame_size,
        ),
        user: String::new(),
        assistant: String::new(),
    };

    loop {
        let quit = *quit_rx.borrow_and_update();
        if quit {
            info!("Quit signal observed");
            break;
        }

        let next = tokio::select! {
            changed = quit_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
            next = stream.next_chunk() => next,
        };

        match next {
            Some(Ok(chunk)) => {
                if !shared.handle_chunk(chunk, &mut turn, &mut quit_rx).await {
                    break;
                }
            }
            Some(Err(e)) => {
                error!("Remote session read failed: {}", e);
                break;
            }
            None => {
                info!("Remote session ended the stream");
                break;
            }
        }
    }

    shared.teardown(sink, writer, turn).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::Turn;
    use crate::session::{Result as SessionResult, SessionHandle};
    use async_trait::async_trait;
    use base64::engine::general_purpose;
    use base64::Engine;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::{mpsc, Notify};

    const WAIT: Duration = Duration::from_secs(2);

    struct MockSink {
        sent: mpsc::UnboundedSender<Outgoing>,
        closed: Arc<AtomicBool>,
        /// Never completes a send, like a wedged socket.
        stall: bool,
    }

    #[async_trait]
    impl SessionSink for MockSink {
        async fn send(&self, input: Outgoing) -> SessionResult<()> {
            if self.stall {
                std::future::pending::<()>().await;
            }
            self.sent
                .send(input)
                .map_err(|_| SessionError::ConnectionClosed)
        }

        async fn close(&self) -> SessionResult<()> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    struct MockStream {
        replies: mpsc::UnboundedReceiver<SessionResult<ReplyChunk>>,
    }

    #[async_trait]
    impl SessionStream for MockStream {
        async fn next_chunk(&mut self) -> Option<SessionResult<ReplyChunk>> {
            self.replies.recv().await
        }
    }

    struct MockConnector {
        fail: bool,
        /// When set, `connect` waits for a notification.
        gate: Option<Arc<Notify>>,
        seeds: std::sync::Mutex<Vec<Vec<Turn>>>,
        session: std::sync::Mutex<Option<(MockSink, MockStream)>>,
    }

    #[async_trait]
    impl SessionConnector for MockConnector {
        async fn connect(&self, seed: &[Turn]) -> SessionResult<SessionHandle> {
            self.seeds.lock().unwrap().push(seed.to_vec());
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            if self.fail {
                return Err(SessionError::Timeout);
            }
            let (sink, stream) = self
                .session
                .lock()
                .unwrap()
                .take()
                .ok_or(SessionError::ConnectionClosed)?;
            Ok(SessionHandle {
                sink: Box::new(sink),
                stream: Box::new(stream),
            })
        }
    }

    /// The remote end of a mock session.
    struct Remote {
        sent: mpsc::UnboundedReceiver<Outgoing>,
        replies: mpsc::UnboundedSender<SessionResult<ReplyChunk>>,
        closed: Arc<AtomicBool>,
    }

    impl Remote {
        fn reply(&self, chunk: ReplyChunk) {
            self.replies.send(Ok(chunk)).unwrap();
        }

        async fn next_sent(&mut self) -> Outgoing {
            tokio::time::timeout(WAIT, self.sent.recv())
                .await
                .expect("nothing forwarded")
                .expect("sink dropped")
        }
    }

    fn mock() -> (Arc<MockConnector>, Remote) {
        mock_with(false, None)
    }

    fn mock_with(stall: bool, gate: Option<Arc<Notify>>) -> (Arc<MockConnector>, Remote) {
        let (sent_tx, sent_rx) = mpsc::unbounded_channel();
        let (reply_tx, reply_rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));

        let connector = MockConnector {
            fail: false,
            gate,
            seeds: std::sync::Mutex::new(Vec::new()),
            session: std::sync::Mutex::new(Some((
                MockSink {
                    sent: sent_tx,
                    closed: closed.clone(),
                    stall,
                },
                MockStream { replies: reply_rx },
            ))),
        };
        let remote = Remote {
            sent: sent_rx,
            replies: reply_tx,
            closed,
        };
        (Arc::new(connector), remote)
    }

    fn failing() -> Arc<MockConnector> {
        Arc::new(MockConnector {
            fail: true,
            gate: None,
            seeds: std::sync::Mutex::new(Vec::new()),
            session: std::sync::Mutex::new(None),
        })
    }

    fn test_config() -> BridgeConfig {
        BridgeConfig {
            output_frame_size: 4,
            put_timeout: Duration::from_millis(200),
            ..BridgeConfig::default()
        }
    }

    fn pcm(samples: &[i16]) -> Vec<u8> {
        samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    fn frame(width: u32, height: u32) -> VideoFrame {
        VideoFrame::new(width, height, vec![90u8; (width * height * 3) as usize])
    }

    async fn wait_for_state(bridge: &MediaSessionBridge, state: SessionState) {
        let mut rx = bridge.subscribe_state();
        tokio::time::timeout(WAIT, async {
            while *rx.borrow_and_update() != state {
                rx.changed().await.unwrap();
            }
        })
        .await
        .unwrap_or_else(|_| panic!("bridge never reached {:?}", state));
    }

    async fn wait_closed(bridge: &MediaSessionBridge) {
        wait_for_state(bridge, SessionState::Closed).await;
    }

    async fn emit(bridge: &MediaSessionBridge) -> Option<AudioFrame> {
        tokio::time::timeout(WAIT, bridge.emit_audio())
            .await
            .expect("emit_audio stalled")
    }

    #[tokio::test]
    async fn test_receive_audio_is_noop_before_connect() {
        let (connector, mut remote) = mock();
        let bridge = MediaSessionBridge::new(test_config(), connector);

        bridge
            .receive_audio(AudioChunk::new(16000, vec![1, 2, 3]))
            .await
            .unwrap();
        assert_eq!(bridge.state(), SessionState::Idle);

        bridge.start().await.unwrap();
        assert_eq!(bridge.state(), SessionState::Active);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(remote.sent.try_recv().is_err());

        bridge.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_while_connecting() {
        let gate = Arc::new(Notify::new());
        let (connector, mut remote) = mock_with(false, Some(gate.clone()));
        let bridge = Arc::new(MediaSessionBridge::new(test_config(), connector));

        let starter = {
            let bridge = bridge.clone();
            tokio::spawn(async move { bridge.start().await })
        };
        wait_for_state(&bridge, SessionState::Connecting).await;

        // not forwarded, the session is not up yet
        bridge
            .receive_audio(AudioChunk::new(16000, vec![5, 6, 7]))
            .await
            .unwrap();
        assert_eq!(bridge.state(), SessionState::Connecting);

        let stopper = {
            let bridge = bridge.clone();
            tokio::spawn(async move { bridge.shutdown().await })
        };
        wait_for_state(&bridge, SessionState::Closing).await;
        gate.notify_one();

        assert!(starter.await.unwrap().is_ok());
        tokio::time::timeout(WAIT, stopper).await.unwrap().unwrap();

        assert_eq!(bridge.state(), SessionState::Closed);
        assert!(remote.closed.load(Ordering::SeqCst));
        assert!(remote.sent.try_recv().is_err());
        assert_eq!(emit(&bridge).await, None);
    }

    #[tokio::test]
    async fn test_audio_forwarded_when_active() {
        let (connector, mut remote) = mock();
        let bridge = MediaSessionBridge::new(test_config(), connector);
        bridge.start().await.unwrap();

        bridge
            .receive_audio(AudioChunk::new(16000, vec![1, -1]))
            .await
            .unwrap();

        match remote.next_sent().await {
            Outgoing::Audio(blob) => {
                assert_eq!(blob.mime_type, "audio/pcm;rate=16000");
                let raw = general_purpose::STANDARD.decode(&blob.data).unwrap();
                assert_eq!(raw, vec![0x01, 0x00, 0xFF, 0xFF]);
            }
            other => panic!("Unexpected message: {:?}", other),
        }

        bridge.shutdown().await;
    }

    #[tokio::test]
    async fn test_rejects_mismatched_sample_rate() {
        let (connector, _remote) = mock();
        let bridge = MediaSessionBridge::new(test_config(), connector);
        bridge.start().await.unwrap();

        let err = bridge
            .receive_audio(AudioChunk::new(44100, vec![0; 8]))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            BridgeError::Encoding(EncodingError::SampleRate {
                expected: 16000,
                actual: 44100
            })
        ));

        bridge.shutdown().await;
    }

    #[tokio::test]
    async fn test_emit_audio_preserves_reply_order() {
        let (connector, remote) = mock();
        let bridge = MediaSessionBridge::new(test_config(), connector);
        bridge.start().await.unwrap();

        let chunks: Vec<Vec<i16>> = (0..6).map(|i| vec![i * 10, i * 10 + 1, i * 10 + 2, i * 10 + 3]).collect();
        for chunk in &chunks {
            remote.reply(ReplyChunk::Audio(pcm(chunk)));
        }

        for chunk in &chunks {
            let frame = emit(&bridge).await.unwrap();
            assert_eq!(&frame.samples, chunk);
            assert_eq!(frame.sample_rate, 24000);
            assert!(!frame.partial);
        }

        bridge.shutdown().await;
    }

    #[tokio::test]
    async fn test_turn_complete_flushes_partial_frame() {
        let (connector, remote) = mock();
        let bridge = MediaSessionBridge::new(test_config(), connector);
        bridge.start().await.unwrap();

        remote.reply(ReplyChunk::Audio(pcm(&[1, 2, 3, 4, 5, 6])));
        remote.reply(ReplyChunk::Control(Control::TurnComplete));

        let full = emit(&bridge).await.unwrap();
        assert_eq!(full.samples, vec![1, 2, 3, 4]);
        assert!(!full.partial);

        let tail = emit(&bridge).await.unwrap();
        assert_eq!(tail.samples, vec![5, 6]);
        assert!(tail.partial);

        bridge.shutdown().await;
    }

    #[tokio::test]
    async fn test_video_throttle_and_local_echo() {
        let (connector, mut remote) = mock();
        let bridge = MediaSessionBridge::new(test_config(), connector);
        bridge.start().await.unwrap();

        let base = Instant::now();
        for t in [0.0, 0.3, 0.6, 1.1, 1.9] {
            bridge
                .receive_video_at(frame(4, 4), None, base + Duration::from_secs_f64(t))
                .await
                .unwrap();
        }

        for _ in 0..2 {
            match remote.next_sent().await {
                Outgoing::Video(blobs) => assert_eq!(blobs.len(), 1),
                other => panic!("Unexpected message: {:?}", other),
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(remote.sent.try_recv().is_err());

        for _ in 0..5 {
            let echoed = tokio::time::timeout(WAIT, bridge.emit_video())
                .await
                .unwrap()
                .unwrap();
            assert_eq!((echoed.width, echoed.height), (4, 4));
        }

        bridge.shutdown().await;
    }

    #[tokio::test]
    async fn test_echo_survives_stalled_session() {
        let (connector, _remote) = mock_with(true, None);
        let config = BridgeConfig {
            inbound_capacity: 1,
            put_timeout: Duration::from_millis(50),
            ..test_config()
        };
        let bridge = MediaSessionBridge::new(config, connector);
        bridge.start().await.unwrap();

        // first burst wedges the writer, second fills the queue
        let base = Instant::now();
        let mut outcomes = Vec::new();
        for t in [0.0, 2.0, 4.0, 4.5] {
            let res = bridge
                .receive_video_at(frame(4, 4), None, base + Duration::from_secs_f64(t))
                .await;
            outcomes.push(match res {
                Ok(()) => "sent",
                Err(BridgeError::QueueTimeout(_)) => "timeout",
                Err(e) => panic!("Unexpected error: {}", e),
            });
        }

        // 4.5 is only 0.5s after 4.0, it is retried because 4.0 never went out
        assert_eq!(outcomes, vec!["sent", "sent", "timeout", "timeout"]);

        for _ in 0..4 {
            let echoed = tokio::time::timeout(WAIT, bridge.emit_video())
                .await
                .unwrap();
            assert!(echoed.is_some());
        }

        bridge.shutdown().await;
        assert_eq!(bridge.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_turn_counter_without_partial_frame() {
        let (connector, remote) = mock();
        let bridge = MediaSessionBridge::new(test_config(), connector);
        bridge.start().await.unwrap();
        let mut turns = bridge.subscribe_turns();

        remote.reply(ReplyChunk::Audio(pcm(&[1, 2, 3, 4])));
        remote.reply(ReplyChunk::Control(Control::TurnComplete));

        tokio::time::timeout(WAIT, turns.changed())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(*turns.borrow(), 1);

        let only = emit(&bridge).await.unwrap();
        assert!(!only.partial);

        remote.reply(ReplyChunk::Control(Control::Interrupted));
        tokio::time::timeout(WAIT, turns.changed())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(*turns.borrow(), 2);

        bridge.shutdown().await;
        assert_eq!(emit(&bridge).await, None);
    }

    #[tokio::test]
    async fn test_still_image_follows_primary_frame() {
        let (connector, mut remote) = mock();
        let bridge = MediaSessionBridge::new(test_config(), connector);
        bridge.start().await.unwrap();

        let still = frame(2, 6);
        bridge.receive_video(frame(8, 2), Some(&still)).await.unwrap();

        match remote.next_sent().await {
            Outgoing::Video(blobs) => {
                let dims: Vec<(u32, u32)> = blobs
                    .iter()
                    .map(|blob| {
                        assert_eq!(blob.mime_type, "image/jpeg");
                        let jpeg = general_purpose::STANDARD.decode(&blob.data).unwrap();
                        let img = image::load_from_memory(&jpeg).unwrap();
                        (img.width(), img.height())
                    })
                    .collect();
                assert_eq!(dims, vec![(8, 2), (2, 6)]);
            }
            other => panic!("Unexpected message: {:?}", other),
        }

        bridge.shutdown().await;
    }

    #[tokio::test]
    async fn test_video_echo_before_connect_and_bad_shape() {
        let (connector, mut remote) = mock();
        let bridge = MediaSessionBridge::new(test_config(), connector);

        bridge.receive_video(frame(2, 2), None).await.unwrap();
        assert_eq!(bridge.emit_video().await, Some(frame(2, 2)));
        assert!(remote.sent.try_recv().is_err());

        let bad = VideoFrame::new(3, 3, vec![0; 5]);
        assert!(matches!(
            bridge.receive_video(bad, None).await,
            Err(BridgeError::Encoding(EncodingError::PixelShape { .. }))
        ));
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let (connector, remote) = mock();
        let bridge = MediaSessionBridge::new(test_config(), connector);
        bridge.start().await.unwrap();

        bridge.shutdown().await;
        assert_eq!(bridge.state(), SessionState::Closed);
        assert!(remote.closed.load(Ordering::SeqCst));

        bridge.shutdown().await;
        assert_eq!(bridge.state(), SessionState::Closed);

        assert_eq!(emit(&bridge).await, None);
        bridge
            .receive_audio(AudioChunk::new(16000, vec![1]))
            .await
            .unwrap();
        bridge.receive_video(frame(2, 2), None).await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_shutdown_waits_for_close() {
        let (connector, remote) = mock();
        let bridge = MediaSessionBridge::new(test_config(), connector);
        bridge.start().await.unwrap();

        tokio::join!(bridge.shutdown(), bridge.shutdown());
        assert_eq!(bridge.state(), SessionState::Closed);
        assert!(remote.closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_shutdown_when_idle() {
        let (connector, _remote) = mock();
        let bridge = MediaSessionBridge::new(test_config(), connector.clone());

        bridge.shutdown().await;
        assert_eq!(bridge.state(), SessionState::Closed);
        assert_eq!(bridge.emit_audio().await, None);

        assert!(matches!(
            bridge.start().await,
            Err(BridgeError::AlreadyStarted(SessionState::Closed))
        ));
        assert!(connector.seeds.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_connect_failure_closes() {
        let bridge = MediaSessionBridge::new(test_config(), failing());

        assert!(matches!(
            bridge.start().await,
            Err(BridgeError::Connect(SessionError::Timeout))
        ));
        assert_eq!(bridge.state(), SessionState::Closed);
        assert_eq!(emit(&bridge).await, None);
        bridge.shutdown().await;
    }

    #[tokio::test]
    async fn test_remote_close_ends_session() {
        let (connector, remote) = mock();
        let bridge = MediaSessionBridge::new(test_config(), connector);
        bridge.start().await.unwrap();

        remote.reply(ReplyChunk::Audio(pcm(&[7, 7, 7, 7, 8])));
        drop(remote.replies);

        wait_closed(&bridge).await;
        assert!(remote.closed.load(Ordering::SeqCst));

        assert_eq!(emit(&bridge).await.unwrap().samples, vec![7, 7, 7, 7]);
        let tail = emit(&bridge).await.unwrap();
        assert!(tail.partial);
        assert_eq!(tail.samples, vec![8]);
        assert_eq!(emit(&bridge).await, None);
    }

    #[tokio::test]
    async fn test_read_error_and_go_away_close_gracefully() {
        let (connector, remote) = mock();
        let bridge = MediaSessionBridge::new(test_config(), connector);
        bridge.start().await.unwrap();
        remote
            .replies
            .send(Err(SessionError::Protocol("bad frame".into())))
            .unwrap();
        wait_closed(&bridge).await;

        let (connector, remote) = mock();
        let bridge = MediaSessionBridge::new(test_config(), connector);
        bridge.start().await.unwrap();
        remote.reply(ReplyChunk::Control(Control::GoAway));
        wait_closed(&bridge).await;
        assert!(remote.closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_writer_failure_closes_session() {
        let (connector, remote) = mock();
        let bridge = MediaSessionBridge::new(test_config(), connector);
        bridge.start().await.unwrap();

        drop(remote.sent);
        bridge
            .receive_audio(AudioChunk::new(16000, vec![1, 2]))
            .await
            .unwrap();

        wait_closed(&bridge).await;
    }

    #[tokio::test]
    async fn test_history_committed_and_reseeded() {
        let (connector, remote) = mock();
        let bridge = MediaSessionBridge::new(test_config(), connector);
        bridge.start().await.unwrap();

        remote.reply(ReplyChunk::Control(Control::InputTranscript("my chest ".into())));
        remote.reply(ReplyChunk::Control(Control::InputTranscript("feels tight".into())));
        remote.reply(ReplyChunk::Control(Control::OutputTranscript("How long?".into())));
        remote.reply(ReplyChunk::Control(Control::TurnComplete));
        // marker frame, proves the turn above was processed
        remote.reply(ReplyChunk::Audio(pcm(&[1, 2, 3, 4])));
        emit(&bridge).await.unwrap();

        assert_eq!(
            bridge.history().await.snapshot(),
            vec![
                Turn::user("my chest feels tight"),
                Turn::assistant("How long?"),
            ]
        );

        bridge.shutdown().await;

        let (next_connector, _next_remote) = mock();
        let next = MediaSessionBridge::with_history(
            test_config(),
            next_connector.clone(),
            bridge.history().await,
        );
        next.start().await.unwrap();
        assert_eq!(
            next_connector.seeds.lock().unwrap()[0],
            vec![
                Turn::user("my chest feels tight"),
                Turn::assistant("How long?"),
            ]
        );
        next.shutdown().await;
    }

    #[tokio::test]
    async fn test_pending_turn_committed_on_teardown() {
        let (connector, remote) = mock();
        let bridge = MediaSessionBridge::new(test_config(), connector);
        bridge.start().await.unwrap();

        remote.reply(ReplyChunk::Text("Goodbye".into()));
        remote.reply(ReplyChunk::Audio(pcm(&[1, 2, 3, 4])));
        emit(&bridge).await.unwrap();

        bridge.shutdown().await;
        assert_eq!(
            bridge.history().await.snapshot(),
            vec![Turn::user(""), Turn::assistant("Goodbye")]
        );
    }
}
