//! Scripted fakes for driving a `SessionManager` without network or audio hardware.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use chuzzi_core::config::Config;
use chuzzi_core::conversation_store::ConversationStore;
use chuzzi_core::error::{ChuzziError, Result};
use chuzzi_core::session::{ConnectConfig, LiveConnection, LiveEvent, LiveSession, LiveTransport};
use chuzzi_core::types::{ChatMessage, InboundAudioChunk, OutboundAudioChunk};
use chuzzi_live::TextTransform;
use chuzzi_media::{
    AudioCaptureBridge, AudioPlaybackScheduler, CaptureDevice, CaptureStream, OutputDevice,
    PlaybackBuffer, VoiceId,
};
use chuzzi_session::{
    ConnectionState, ConversationLog, SessionHandle, SessionManager, SessionOptions, SessionStatus,
    SessionUpdate,
};

// --- Transport ---

/// What the remote side of one scripted connection sees.
#[derive(Default)]
pub struct RemoteEnd {
    pub sent: Mutex<Vec<OutboundAudioChunk>>,
    pub closed: AtomicBool,
    pub fail_with: Mutex<Option<fn() -> ChuzziError>>,
}

impl RemoteEnd {
    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    pub fn fail_sends(&self, err: fn() -> ChuzziError) {
        *self.fail_with.lock().unwrap() = Some(err);
    }
}

struct FakeSession {
    remote: Arc<RemoteEnd>,
}

#[async_trait]
impl LiveSession for FakeSession {
    async fn send_audio(&self, chunk: &OutboundAudioChunk) -> Result<()> {
        if let Some(err) = *self.remote.fail_with.lock().unwrap() {
            return Err(err());
        }
        self.remote.sent.lock().unwrap().push(chunk.clone());
        Ok(())
    }

    async fn close(&self) {
        self.remote.closed.store(true, Ordering::SeqCst);
    }
}

enum Outcome {
    Fail(ChuzziError),
    /// Dialing never completes.
    Hang,
    Open {
        remote: Arc<RemoteEnd>,
        events: mpsc::UnboundedReceiver<LiveEvent>,
    },
}

/// Handles to a scripted connection that will open.
pub struct OpenScript {
    pub events: mpsc::UnboundedSender<LiveEvent>,
    pub remote: Arc<RemoteEnd>,
}

impl OpenScript {
    pub fn send(&self, event: LiveEvent) {
        self.events.send(event).unwrap();
    }
}

/// Hands out scripted connect outcomes in order; unscripted attempts fail.
#[derive(Default)]
pub struct ScriptedTransport {
    outcomes: Mutex<VecDeque<Outcome>>,
    connects: AtomicUsize,
    key_missing: bool,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn without_key() -> Arc<Self> {
        Arc::new(Self {
            key_missing: true,
            ..Self::default()
        })
    }

    pub fn push_failure(&self, err: ChuzziError) {
        self.outcomes.lock().unwrap().push_back(Outcome::Fail(err));
    }

    pub fn push_hang(&self) {
        self.outcomes.lock().unwrap().push_back(Outcome::Hang);
    }

    pub fn push_open(&self) -> OpenScript {
        let (tx, rx) = mpsc::unbounded_channel();
        let remote = Arc::new(RemoteEnd::default());
        self.outcomes.lock().unwrap().push_back(Outcome::Open {
            remote: remote.clone(),
            events: rx,
        });
        OpenScript { events: tx, remote }
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LiveTransport for ScriptedTransport {
    fn id(&self) -> &str {
        "scripted"
    }

    fn check_credentials(&self) -> Result<()> {
        if self.key_missing {
            return Err(ChuzziError::Config("API key is not set".into()));
        }
        Ok(())
    }

    async fn connect(&self, _config: &ConnectConfig) -> Result<LiveConnection> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let outcome = self.outcomes.lock().unwrap().pop_front();
        match outcome {
            Some(Outcome::Open { remote, events }) => Ok(LiveConnection {
                session: Box::new(FakeSession { remote }),
                events,
            }),
            Some(Outcome::Fail(err)) => Err(err),
            Some(Outcome::Hang) => std::future::pending().await,
            None => Err(ChuzziError::Connection("network unreachable".into())),
        }
    }
}

// --- Devices ---

struct FakeCaptureStream;

impl CaptureStream for FakeCaptureStream {
    fn sample_rate(&self) -> u32 {
        16000
    }
}

#[derive(Default)]
pub struct FakeMic {
    pub deny: AtomicBool,
    sender: Mutex<Option<mpsc::UnboundedSender<Vec<f32>>>>,
}

impl FakeMic {
    /// Deliver one frame; false when nobody is capturing.
    pub fn push(&self, frame: Vec<f32>) -> bool {
        self.sender
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|tx| tx.send(frame).is_ok())
    }
}

impl CaptureDevice for FakeMic {
    fn open(&self, frames: mpsc::UnboundedSender<Vec<f32>>) -> Result<Box<dyn CaptureStream>> {
        if self.deny.load(Ordering::SeqCst) {
            return Err(ChuzziError::Permission("microphone access denied".into()));
        }
        *self.sender.lock().unwrap() = Some(frames);
        Ok(Box::new(FakeCaptureStream))
    }
}

/// Mono 24 kHz output with a hand-driven clock.
#[derive(Default)]
pub struct FakeSpeaker {
    clock: Mutex<f64>,
    next_id: AtomicUsize,
    pub played: Mutex<Vec<(VoiceId, f64)>>,
    pub stopped: Mutex<Vec<VoiceId>>,
}

impl FakeSpeaker {
    pub fn set_clock(&self, t: f64) {
        *self.clock.lock().unwrap() = t;
    }
}

impl OutputDevice for FakeSpeaker {
    fn sample_rate(&self) -> u32 {
        24000
    }

    fn channels(&self) -> u16 {
        1
    }

    fn now(&self) -> f64 {
        *self.clock.lock().unwrap()
    }

    fn play_at(&self, _buffer: PlaybackBuffer, start_at: f64) -> Result<VoiceId> {
        let id = VoiceId(self.next_id.fetch_add(1, Ordering::SeqCst) as u64 + 1);
        self.played.lock().unwrap().push((id, start_at));
        Ok(id)
    }

    fn stop(&self, voice: VoiceId) {
        self.stopped.lock().unwrap().push(voice);
    }
}

/// Base64 PCM16 chunk of `samples` mono samples.
pub fn pcm_chunk(samples: usize, sample_rate: u32) -> InboundAudioChunk {
    let bytes: Vec<u8> = (0..samples).flat_map(|_| 0i16.to_le_bytes()).collect();
    InboundAudioChunk {
        encoded_payload: STANDARD.encode(bytes),
        sample_rate,
        channel_count: 1,
    }
}

// --- Collaborators ---

/// Conversation store kept in memory, optionally failing every write.
#[derive(Default)]
pub struct MemoryStore {
    pub entries: Mutex<Vec<ChatMessage>>,
    pub fail: bool,
    pub saves: AtomicUsize,
}

impl MemoryStore {
    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            fail: true,
            ..Self::default()
        })
    }

    pub fn texts(&self) -> Vec<String> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .map(|m| m.text().to_string())
            .collect()
    }
}

#[async_trait]
impl ConversationStore for MemoryStore {
    async fn load_log(&self) -> Result<Vec<ChatMessage>> {
        Ok(self.entries.lock().unwrap().clone())
    }

    async fn save_log(&self, entries: &[ChatMessage]) -> Result<()> {
        self.saves.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(ChuzziError::Io(std::io::Error::other("read-only filesystem")));
        }
        *self.entries.lock().unwrap() = entries.to_vec();
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.entries.lock().unwrap().clear();
        Ok(())
    }
}

pub struct FailingTransform;

#[async_trait]
impl TextTransform for FailingTransform {
    async fn transform(&self, _text: &str) -> Result<String> {
        Err(ChuzziError::Transform("quota exceeded".into()))
    }
}

/// Upper-cases the text after a delay chosen per input.
pub struct DelayedTransform {
    pub delay: fn(&str) -> Duration,
}

#[async_trait]
impl TextTransform for DelayedTransform {
    async fn transform(&self, text: &str) -> Result<String> {
        tokio::time::sleep((self.delay)(text)).await;
        Ok(text.to_uppercase())
    }
}

// --- Harness ---

pub struct Harness {
    pub handle: SessionHandle,
    pub updates: mpsc::UnboundedReceiver<SessionUpdate>,
    pub seen: Vec<SessionUpdate>,
    pub transport: Arc<ScriptedTransport>,
    pub mic: Arc<FakeMic>,
    pub speaker: Arc<FakeSpeaker>,
    pub task: JoinHandle<()>,
}

pub struct HarnessBuilder {
    transport: Arc<ScriptedTransport>,
    log: ConversationLog,
    transform: Option<Arc<dyn TextTransform>>,
}

impl HarnessBuilder {
    pub fn new(transport: Arc<ScriptedTransport>) -> Self {
        Self {
            transport,
            log: ConversationLog::in_memory(),
            transform: None,
        }
    }

    pub fn store(mut self, store: Arc<dyn ConversationStore>) -> Self {
        self.log = ConversationLog::new(Some(store));
        self
    }

    pub fn transform(mut self, transform: Arc<dyn TextTransform>) -> Self {
        self.transform = Some(transform);
        self
    }

    pub fn spawn(self) -> Harness {
        let mic = Arc::new(FakeMic::default());
        let speaker = Arc::new(FakeSpeaker::default());

        let mut options = SessionOptions::from_config(&Config::default()).unwrap();
        options.transform = self.transform;

        let (manager, handle, updates) = SessionManager::new(
            self.transport.clone(),
            AudioCaptureBridge::new(mic.clone(), 16000),
            AudioPlaybackScheduler::new(speaker.clone()),
            self.log,
            options,
        );

        Harness {
            handle,
            updates,
            seen: Vec::new(),
            transport: self.transport,
            mic,
            speaker,
            task: manager.spawn(),
        }
    }
}

impl Harness {
    pub fn spawn(transport: Arc<ScriptedTransport>) -> Self {
        HarnessBuilder::new(transport).spawn()
    }

    /// Next update, failing the test if none arrives within a minute of
    /// (possibly paused) time.
    pub async fn next(&mut self) -> SessionUpdate {
        let update = tokio::time::timeout(Duration::from_secs(60), self.updates.recv())
            .await
            .expect("timed out waiting for a session update")
            .expect("session manager went away");
        self.seen.push(update.clone());
        update
    }

    /// Skip updates until one matches.
    pub async fn wait_for(&mut self, pred: impl Fn(&SessionUpdate) -> bool) -> SessionUpdate {
        loop {
            let update = self.next().await;
            if pred(&update) {
                return update;
            }
        }
    }

    pub async fn wait_state(&mut self, state: ConnectionState) -> SessionStatus {
        match self
            .wait_for(|u| matches!(u, SessionUpdate::Status(s) if s.state == state))
            .await
        {
            SessionUpdate::Status(status) => status,
            _ => unreachable!(),
        }
    }

    /// Let the manager drain its inbox, then collect whatever it emitted.
    pub async fn settle(&mut self) -> Vec<SessionUpdate> {
        tokio::time::sleep(Duration::from_millis(10)).await;
        let mut out = Vec::new();
        while let Ok(update) = self.updates.try_recv() {
            self.seen.push(update.clone());
            out.push(update);
        }
        out
    }

    pub fn messages(&self) -> Vec<(chuzzi_core::types::Role, String)> {
        self.seen
            .iter()
            .filter_map(|u| match u {
                SessionUpdate::Message(m) => Some((m.role(), m.text().to_string())),
                _ => None,
            })
            .collect()
    }
}
