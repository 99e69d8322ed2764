//! Live session seam: the transport contract the session manager drives.
//!
//! A [`LiveTransport`] opens connections; each connection yields an exclusively
//! owned [`LiveSession`] handle for outbound audio and a receiver of
//! [`LiveEvent`]s delivered in arrival order.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::config::Config;
use crate::error::Result;
use crate::types::{InboundAudioChunk, OutboundAudioChunk};

/// What the remote service should answer with.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResponseModality {
    #[default]
    Audio,
    Text,
}

/// Parameters sent when opening a live connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectConfig {
    pub model: String,
    pub response_modality: ResponseModality,
    pub voice: String,
    pub system_instruction: Option<String>,
    /// Ask the remote to transcribe the user's speech.
    pub input_transcription: bool,
    /// Ask the remote to transcribe its own speech.
    pub output_transcription: bool,
}

impl ConnectConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            model: config.live_model(),
            response_modality: ResponseModality::Audio,
            voice: config.voice(),
            system_instruction: Some(config.system_instruction()),
            input_transcription: true,
            output_transcription: true,
        }
    }
}

/// Everything a live connection can report back.
#[derive(Debug, Clone, PartialEq)]
pub enum LiveEvent {
    /// The remote acknowledged the connection setup.
    Opened,
    UserTranscript(String),
    ModelTranscript(String),
    Audio(InboundAudioChunk),
    TurnComplete,
    /// The user started speaking over the model.
    Interrupted,
    Error(String),
    Closed { abnormal: bool },
}

/// An open connection: the session handle plus its inbound event stream.
pub struct LiveConnection {
    pub session: Box<dyn LiveSession>,
    pub events: mpsc::UnboundedReceiver<LiveEvent>,
}

/// Outbound half of one connection attempt.
#[async_trait]
pub trait LiveSession: Send + Sync {
    /// Push one chunk of microphone audio.
    ///
    /// Returns [`ChuzziError::ChannelClosed`](crate::error::ChuzziError::ChannelClosed)
    /// when the connection is already closing or closed.
    async fn send_audio(&self, chunk: &OutboundAudioChunk) -> Result<()>;

    /// Close the connection. Safe to call more than once.
    async fn close(&self);
}

/// Opens live connections to a remote speech service.
#[async_trait]
pub trait LiveTransport: Send + Sync {
    /// Transport identifier (e.g., "gemini").
    fn id(&self) -> &str;

    /// Fail fast on missing credentials, before any connection attempt.
    fn check_credentials(&self) -> Result<()> {
        Ok(())
    }

    async fn connect(&self, config: &ConnectConfig) -> Result<LiveConnection>;
}
