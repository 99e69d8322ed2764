//! Session manager: the connection state machine.
//!
//! One task owns every piece of mutable session state. Caller commands,
//! connection results, inbound events, timer expiries and converted turns all
//! arrive on a single inbox; capture frames arrive on the capture bridge's
//! receiver. Each connection attempt gets a fresh epoch, and anything tagged
//! with an older epoch is discarded on arrival.
//!
//! Converting a finished turn's user text runs on its own task. Turns carry a
//! sequence number and reach the log in that order whatever order their
//! conversions finish in.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use chuzzi_core::config::Config;
use chuzzi_core::error::{ChuzziError, Result};
use chuzzi_core::session::{ConnectConfig, LiveConnection, LiveEvent, LiveSession, LiveTransport};
use chuzzi_core::types::ChatMessage;
use chuzzi_live::TextTransform;
use chuzzi_media::{AudioCaptureBridge, AudioPlaybackScheduler, Forwarded};

use crate::log::ConversationLog;
use crate::retry::{RetryDecision, RetryPolicy};
use crate::status::{ConnectionState, SessionStatus};
use crate::transcription::TranscriptionAggregator;

static NEXT_EPOCH: AtomicU64 = AtomicU64::new(1);

fn next_epoch() -> u64 {
    NEXT_EPOCH.fetch_add(1, Ordering::Relaxed)
}

/// Everything the manager reports to its owner.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionUpdate {
    Status(SessionStatus),
    Recording(bool),
    /// The model is working on, or speaking, a reply.
    Responding(bool),
    /// Running user transcription of the current turn. Empty when cleared.
    UserPartial(String),
    /// Running model transcription of the current turn. Empty when cleared.
    ModelPartial(String),
    /// A finalized message, already appended to the log.
    Message(ChatMessage),
    HistoryCleared,
    /// A user-facing notice; the session keeps running.
    Error(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Start,
    Stop,
    StartRecording,
    StopRecording,
    ClearHistory,
    Shutdown,
}

enum ManagerMsg {
    Command(Command),
    Connected {
        epoch: u64,
        result: Result<Box<dyn LiveSession>>,
    },
    Event {
        epoch: u64,
        event: LiveEvent,
    },
    RetryDue {
        epoch: u64,
    },
    /// Dialing began this long ago without a setup acknowledgement.
    SetupTimeout {
        epoch: u64,
    },
    TurnFinalized {
        seq: u64,
        messages: Vec<ChatMessage>,
    },
}

/// Cloneable control surface for a running [`SessionManager`].
#[derive(Clone)]
pub struct SessionHandle {
    inbox: mpsc::UnboundedSender<ManagerMsg>,
}

impl SessionHandle {
    /// Open the connection. No-op while connecting or open.
    pub fn start(&self) -> Result<()> {
        self.send(Command::Start)
    }

    /// Close the connection and release capture. Idempotent.
    pub fn stop(&self) -> Result<()> {
        self.send(Command::Stop)
    }

    /// Start streaming the microphone, connecting first if needed.
    pub fn start_recording(&self) -> Result<()> {
        self.send(Command::StartRecording)
    }

    /// Stop the microphone; the connection stays up.
    pub fn stop_recording(&self) -> Result<()> {
        self.send(Command::StopRecording)
    }

    pub fn clear_history(&self) -> Result<()> {
        self.send(Command::ClearHistory)
    }

    /// Stop, then end the manager task.
    pub fn shutdown(&self) -> Result<()> {
        self.send(Command::Shutdown)
    }

    fn send(&self, command: Command) -> Result<()> {
        self.inbox
            .send(ManagerMsg::Command(command))
            .map_err(|_| ChuzziError::ChannelClosed)
    }
}

/// Tunables for a [`SessionManager`].
pub struct SessionOptions {
    pub connect: ConnectConfig,
    /// Longest wait from dialing to [`LiveEvent::Opened`].
    pub connect_timeout: Duration,
    pub retry: RetryPolicy,
    pub transform: Option<Arc<dyn TextTransform>>,
    pub transform_timeout: Duration,
}

impl SessionOptions {
    /// Options from config, without a text transform.
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self {
            connect: ConnectConfig::from_config(config),
            connect_timeout: config.connect_timeout(),
            retry: RetryPolicy::from_config(config)?,
            transform: None,
            transform_timeout: config.transform_timeout(),
        })
    }
}

pub struct SessionManager {
    transport: Arc<dyn LiveTransport>,
    connect_config: ConnectConfig,
    connect_timeout: Duration,
    retry: RetryPolicy,
    transform: Option<Arc<dyn TextTransform>>,
    transform_timeout: Duration,

    capture: AudioCaptureBridge,
    playback: AudioPlaybackScheduler,
    aggregator: TranscriptionAggregator,
    log: ConversationLog,

    state: ConnectionState,
    attempt: u32,
    epoch: u64,
    last_status: Option<SessionStatus>,
    session: Option<Box<dyn LiveSession>>,
    pump: Option<CancellationToken>,
    retry_timer: Option<JoinHandle<()>>,
    setup_timer: Option<JoinHandle<()>>,
    recording: bool,
    responding: bool,

    /// Sequence number for the next completed turn.
    next_turn: u64,
    /// Lowest turn not yet emitted; older results are dropped.
    next_to_emit: u64,
    finished_turns: BTreeMap<u64, Vec<ChatMessage>>,

    inbox_tx: mpsc::UnboundedSender<ManagerMsg>,
    inbox: mpsc::UnboundedReceiver<ManagerMsg>,
    updates: mpsc::UnboundedSender<SessionUpdate>,
}

impl SessionManager {
    pub fn new(
        transport: Arc<dyn LiveTransport>,
        capture: AudioCaptureBridge,
        playback: AudioPlaybackScheduler,
        log: ConversationLog,
        options: SessionOptions,
    ) -> (Self, SessionHandle, mpsc::UnboundedReceiver<SessionUpdate>) {
        let (inbox_tx, inbox) = mpsc::unbounded_channel();
        let (updates, updates_rx) = mpsc::unbounded_channel();
        let handle = SessionHandle {
            inbox: inbox_tx.clone(),
        };

        let manager = Self {
            transport,
            connect_config: options.connect,
            connect_timeout: options.connect_timeout,
            retry: options.retry,
            transform: options.transform,
            transform_timeout: options.transform_timeout,
            capture,
            playback,
            aggregator: TranscriptionAggregator::new(),
            log,
            state: ConnectionState::Idle,
            attempt: 0,
            epoch: next_epoch(),
            last_status: None,
            session: None,
            pump: None,
            retry_timer: None,
            setup_timer: None,
            recording: false,
            responding: false,
            next_turn: 0,
            next_to_emit: 0,
            finished_turns: BTreeMap::new(),
            inbox_tx,
            inbox,
            updates,
        };
        (manager, handle, updates_rx)
    }

    /// Messages already in the conversation log.
    pub fn history(&self) -> &[ChatMessage] {
        self.log.entries()
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Run until [`SessionHandle::shutdown`].
    pub async fn run(mut self) {
        info!(transport = self.transport.id(), "Session manager started");
        self.set_state(ConnectionState::Idle);

        loop {
            let step = tokio::select! {
                msg = self.inbox.recv() => Step::Inbox(msg),
                frame = self.capture.next_frame() => Step::Frame(frame),
            };

            match step {
                Step::Inbox(Some(ManagerMsg::Command(Command::Shutdown))) | Step::Inbox(None) => {
                    self.stop().await;
                    self.flush_turns().await;
                    break;
                }
                Step::Inbox(Some(msg)) => self.handle_msg(msg).await,
                Step::Frame(Some(frame)) => self.forward_frame(frame).await,
                Step::Frame(None) => {
                    warn!("Capture device stopped delivering audio");
                    self.stop_capture();
                    self.emit(SessionUpdate::Error("Microphone stopped unexpectedly".into()));
                }
            }
        }

        info!("Session manager stopped");
    }

    async fn handle_msg(&mut self, msg: ManagerMsg) {
        match msg {
            ManagerMsg::Command(command) => self.handle_command(command).await,
            ManagerMsg::Connected { epoch, result } => {
                if epoch != self.epoch {
                    trace!(epoch, current = self.epoch, "Discarding stale connection");
                    if let Ok(session) = result {
                        session.close().await;
                    }
                    return;
                }
                match result {
                    Ok(session) => {
                        debug!(epoch, "Transport connected, awaiting setup ack");
                        self.session = Some(session);
                    }
                    Err(e) => self.handle_failure(e).await,
                }
            }
            ManagerMsg::Event { epoch, event } => {
                if epoch != self.epoch {
                    trace!(epoch, current = self.epoch, ?event, "Discarding stale event");
                    return;
                }
                self.handle_event(event).await;
            }
            ManagerMsg::RetryDue { epoch } => {
                if epoch != self.epoch || self.state != ConnectionState::Reconnecting {
                    trace!(epoch, current = self.epoch, "Discarding stale retry timer");
                    return;
                }
                self.retry_timer = None;
                self.connect();
            }
            ManagerMsg::SetupTimeout { epoch } => {
                if epoch != self.epoch || self.state != ConnectionState::Connecting {
                    trace!(epoch, current = self.epoch, "Discarding stale setup timer");
                    return;
                }
                self.setup_timer = None;
                let waited = self.connect_timeout.as_millis();
                self.handle_failure(ChuzziError::Connection(format!(
                    "setup timed out after {waited} ms"
                )))
                .await;
            }
            ManagerMsg::TurnFinalized { seq, messages } => self.finish_turn(seq, messages).await,
        }
    }

    async fn handle_command(&mut self, command: Command) {
        debug!(?command, state = ?self.state, "Session command");
        match command {
            Command::Start => self.start().await,
            Command::Stop => self.stop().await,
            Command::StartRecording => self.start_recording().await,
            Command::StopRecording => self.stop_recording(),
            Command::ClearHistory => self.clear_history().await,
            // handled by the run loop
            Command::Shutdown => {}
        }
    }

    async fn handle_event(&mut self, event: LiveEvent) {
        match event {
            LiveEvent::Opened => {
                if self.state != ConnectionState::Connecting {
                    debug!(state = ?self.state, "Ignoring duplicate open");
                    return;
                }
                self.cancel_setup_timer();
                self.attempt = 0;
                self.set_state(ConnectionState::Open);
            }
            LiveEvent::UserTranscript(text) => {
                self.set_responding(true);
                let partial = self.aggregator.append_user_fragment(&text).to_string();
                self.emit(SessionUpdate::UserPartial(partial));
            }
            LiveEvent::ModelTranscript(text) => {
                self.set_responding(true);
                let partial = self.aggregator.append_model_fragment(&text).to_string();
                self.emit(SessionUpdate::ModelPartial(partial));
            }
            LiveEvent::Audio(chunk) => {
                self.set_responding(true);
                self.playback.enqueue_or_warn(&chunk);
            }
            LiveEvent::TurnComplete => self.complete_turn().await,
            LiveEvent::Interrupted => {
                self.set_responding(true);
                self.playback.interrupt();
            }
            LiveEvent::Error(message) => {
                self.handle_failure(ChuzziError::Connection(message)).await;
            }
            LiveEvent::Closed { abnormal: true } => {
                self.handle_failure(ChuzziError::Connection("connection closed abnormally".into()))
                    .await;
            }
            LiveEvent::Closed { abnormal: false } => {
                info!("Remote closed the session");
                self.teardown().await;
                self.set_state(ConnectionState::Closed);
            }
        }
    }

    async fn complete_turn(&mut self) {
        let turn = self.aggregator.take_turn();
        self.emit(SessionUpdate::UserPartial(String::new()));
        self.emit(SessionUpdate::ModelPartial(String::new()));

        if !turn.is_empty() {
            let seq = self.next_turn;
            self.next_turn += 1;
            match self.transform.clone() {
                Some(transform) if turn.has_user_text() => {
                    debug!(seq, "Converting user text");
                    let inbox = self.inbox_tx.clone();
                    let timeout = self.transform_timeout;
                    tokio::spawn(async move {
                        let messages = turn.finalize(transform.as_ref(), timeout).await;
                        let _ = inbox.send(ManagerMsg::TurnFinalized { seq, messages });
                    });
                }
                _ => self.finish_turn(seq, turn.into_messages()).await,
            }
        }
        self.set_responding(false);
    }

    /// Emit and log every finished turn that is next in sequence.
    async fn finish_turn(&mut self, seq: u64, messages: Vec<ChatMessage>) {
        if seq < self.next_to_emit {
            debug!(seq, "Discarding turn finished after history was cleared");
            return;
        }
        self.finished_turns.insert(seq, messages);

        let mut ready = Vec::new();
        while let Some(messages) = self.finished_turns.remove(&self.next_to_emit) {
            self.next_to_emit += 1;
            ready.extend(messages);
        }
        for message in &ready {
            self.emit(SessionUpdate::Message(message.clone()));
        }
        if let Err(e) = self.log.append(ready).await {
            self.emit(SessionUpdate::Error(e.to_string()));
        }
    }

    /// Wait for conversions still in flight so their turns reach the log.
    async fn flush_turns(&mut self) {
        if self.next_to_emit == self.next_turn {
            return;
        }
        let pending = self.next_turn - self.next_to_emit;
        debug!(pending, "Waiting for turns still being converted");
        let flushed = tokio::time::timeout(self.transform_timeout, async {
            while self.next_to_emit < self.next_turn {
                match self.inbox.recv().await {
                    Some(ManagerMsg::TurnFinalized { seq, messages }) => {
                        self.finish_turn(seq, messages).await;
                    }
                    Some(_) => {}
                    None => break,
                }
            }
        })
        .await;
        if flushed.is_err() {
            warn!(pending, "Gave up waiting for converted turns");
        }
    }

    async fn start(&mut self) {
        if self.state.is_active() {
            debug!(state = ?self.state, "Already connecting or open");
            return;
        }
        if let Err(e) = self.transport.check_credentials() {
            warn!(error = %e, "Cannot start session");
            self.emit(SessionUpdate::Error(e.to_string()));
            return;
        }
        // A user start while waiting for the timer connects now
        self.cancel_retry_timer();
        self.attempt = 0;
        self.connect();
    }

    async fn stop(&mut self) {
        if matches!(self.state, ConnectionState::Idle | ConnectionState::Closed) {
            return;
        }
        self.teardown().await;
        self.aggregator.reset();
        self.emit(SessionUpdate::UserPartial(String::new()));
        self.emit(SessionUpdate::ModelPartial(String::new()));
        self.attempt = 0;
        self.set_state(ConnectionState::Closed);
    }

    async fn start_recording(&mut self) {
        if self.recording {
            return;
        }
        // Local barge-in
        self.playback.interrupt();

        if !self.state.is_active() {
            self.start().await;
            if !self.state.is_active() {
                return;
            }
        }

        match self.capture.start() {
            Ok(()) => {
                self.recording = true;
                self.emit(SessionUpdate::Recording(true));
            }
            Err(e) => {
                warn!(error = %e, "Could not start recording");
                self.emit(SessionUpdate::Error(e.to_string()));
            }
        }
    }

    fn stop_recording(&mut self) {
        if !self.recording {
            return;
        }
        self.stop_capture();
        let pending = self.aggregator.has_pending_user_text();
        self.set_responding(pending);
    }

    async fn clear_history(&mut self) {
        self.aggregator.reset();
        // Turns still being converted belong to the cleared history
        self.next_to_emit = self.next_turn;
        self.finished_turns.clear();
        self.emit(SessionUpdate::UserPartial(String::new()));
        self.emit(SessionUpdate::ModelPartial(String::new()));
        if let Err(e) = self.log.clear().await {
            self.emit(SessionUpdate::Error(e.to_string()));
        }
        info!("Conversation history cleared");
        self.emit(SessionUpdate::HistoryCleared);
    }

    async fn forward_frame(&mut self, frame: Vec<f32>) {
        let session = match self.state {
            ConnectionState::Open => self.session.as_deref(),
            _ => None,
        };
        let forwarded = self.capture.forward(&frame, session).await;
        match forwarded {
            Ok(Forwarded::Dropped) => trace!("No open session, dropping frame"),
            Ok(_) => {}
            Err(e) => self.handle_failure(e).await,
        }
    }

    /// Transport failure: tear down, then retry or give up.
    async fn handle_failure(&mut self, err: ChuzziError) {
        warn!(error = %err, attempt = self.attempt, state = ?self.state, "Live connection failed");
        self.teardown().await;

        if !err.is_retryable() {
            self.set_state(ConnectionState::Failed);
            self.emit(SessionUpdate::Error(err.to_string()));
            return;
        }

        match self.retry.next(self.attempt) {
            RetryDecision::RetryAfter(delay) => {
                self.attempt += 1;
                self.set_state(ConnectionState::Reconnecting);
                self.schedule_retry(delay);
            }
            RetryDecision::GiveUp => {
                self.set_state(ConnectionState::Failed);
                self.emit(SessionUpdate::Error(format!(
                    "Could not reconnect after {} attempts: {err}",
                    self.retry.max_attempts()
                )));
            }
        }
    }

    fn connect(&mut self) {
        self.epoch = next_epoch();
        let cancel = CancellationToken::new();
        self.pump = Some(cancel.clone());
        self.set_state(ConnectionState::Connecting);

        info!(epoch = self.epoch, attempt = self.attempt, "Connecting live session");
        spawn_connection(
            self.transport.clone(),
            self.connect_config.clone(),
            self.epoch,
            self.inbox_tx.clone(),
            cancel,
        );
        self.cancel_setup_timer();
        self.setup_timer = Some(self.post_after(
            self.connect_timeout,
            ManagerMsg::SetupTimeout { epoch: self.epoch },
        ));
    }

    fn schedule_retry(&mut self, delay: Duration) {
        info!(
            delay_ms = delay.as_millis() as u64,
            attempt = self.attempt,
            max_attempts = self.retry.max_attempts(),
            "Scheduling reconnect"
        );
        self.retry_timer = Some(self.post_after(delay, ManagerMsg::RetryDue { epoch: self.epoch }));
    }

    /// Deliver `msg` to the inbox once `delay` has passed.
    fn post_after(&self, delay: Duration, msg: ManagerMsg) -> JoinHandle<()> {
        let inbox = self.inbox_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = inbox.send(msg);
        })
    }

    fn cancel_retry_timer(&mut self) {
        if let Some(timer) = self.retry_timer.take() {
            timer.abort();
        }
    }

    fn cancel_setup_timer(&mut self) {
        if let Some(timer) = self.setup_timer.take() {
            timer.abort();
        }
    }

    /// Release every per-connection resource and invalidate in-flight callbacks.
    async fn teardown(&mut self) {
        self.epoch = next_epoch();
        if let Some(pump) = self.pump.take() {
            pump.cancel();
        }
        self.cancel_retry_timer();
        self.cancel_setup_timer();
        self.stop_capture();
        self.playback.interrupt();
        self.set_responding(false);
        if let Some(session) = self.session.take() {
            session.close().await;
        }
    }

    fn stop_capture(&mut self) {
        self.capture.stop();
        if self.recording {
            self.recording = false;
            self.emit(SessionUpdate::Recording(false));
        }
    }

    fn set_responding(&mut self, responding: bool) {
        if self.responding != responding {
            self.responding = responding;
            self.emit(SessionUpdate::Responding(responding));
        }
    }

    fn set_state(&mut self, state: ConnectionState) {
        self.state = state;
        let status = SessionStatus {
            state,
            attempt: self.attempt,
            max_attempts: self.retry.max_attempts(),
        };
        if self.last_status == Some(status) {
            return;
        }
        self.last_status = Some(status);
        info!(%status, "Session status");
        self.emit(SessionUpdate::Status(status));
    }

    fn emit(&self, update: SessionUpdate) {
        let _ = self.updates.send(update);
    }
}

enum Step {
    Inbox(Option<ManagerMsg>),
    Frame(Option<Vec<f32>>),
}

/// Connect, then pump events into the inbox until cancelled.
fn spawn_connection(
    transport: Arc<dyn LiveTransport>,
    config: ConnectConfig,
    epoch: u64,
    inbox: mpsc::UnboundedSender<ManagerMsg>,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        let result = tokio::select! {
            _ = cancel.cancelled() => return,
            result = transport.connect(&config) => result,
        };

        let mut events = match result {
            Ok(LiveConnection { session, events }) => {
                let connected = ManagerMsg::Connected {
                    epoch,
                    result: Ok(session),
                };
                if inbox.send(connected).is_err() {
                    return;
                }
                events
            }
            Err(e) => {
                let _ = inbox.send(ManagerMsg::Connected {
                    epoch,
                    result: Err(e),
                });
                return;
            }
        };

        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => event,
            };
            let Some(event) = event else {
                // transport went away without saying goodbye
                let _ = inbox.send(ManagerMsg::Event {
                    epoch,
                    event: LiveEvent::Closed { abnormal: true },
                });
                break;
            };
            if inbox.send(ManagerMsg::Event { epoch, event }).is_err() {
                break;
            }
        }
        trace!(epoch, "Event pump finished");
    });
}
