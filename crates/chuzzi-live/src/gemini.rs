//! Gemini Live transport.
//!
//! Opens a `BidiGenerateContent` WebSocket, sends the setup frame, and splits
//! the socket into a writer task (outbound audio) and a reader task (server
//! frames mapped to [`LiveEvent`]s). Auth is via API key in query parameter.

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{self, Message, protocol::frame::coding::CloseCode};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use chuzzi_core::error::{ChuzziError, Result};
use chuzzi_core::session::{
    ConnectConfig, LiveConnection, LiveEvent, LiveSession, LiveTransport, ResponseModality,
};
use chuzzi_core::types::{InboundAudioChunk, OutboundAudioChunk};

const DEFAULT_BASE_URL: &str = "wss://generativelanguage.googleapis.com";
const LIVE_PATH: &str =
    "/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";
const PLACEHOLDER_KEY: &str = "PLACEHOLDER_API_KEY";
const DEFAULT_OUTPUT_RATE: u32 = 24000;

pub struct GeminiLiveTransport {
    pub base_url: String,
    api_key: Option<String>,
}

impl GeminiLiveTransport {
    pub fn new(api_key: Option<String>, base_url: Option<&str>) -> Self {
        Self {
            base_url: base_url
                .unwrap_or(DEFAULT_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
            api_key,
        }
    }

    fn endpoint(&self, key: &str) -> String {
        format!("{}{LIVE_PATH}?key={key}", self.base_url)
    }

    fn key(&self) -> Result<&str> {
        match self.api_key.as_deref().map(str::trim) {
            Some(key) if !key.is_empty() && key != PLACEHOLDER_KEY => Ok(key),
            _ => Err(ChuzziError::Config(
                "Gemini API key is not set (live.api_key or GEMINI_API_KEY)".into(),
            )),
        }
    }
}

// --- Client frames ---

#[derive(Debug, Serialize)]
struct ClientSetup {
    setup: Setup,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Setup {
    model: String,
    generation_config: GenerationConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    input_audio_transcription: Option<Empty>,
    #[serde(skip_serializing_if = "Option::is_none")]
    output_audio_transcription: Option<Empty>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    response_modalities: Vec<ResponseModality>,
    speech_config: SpeechConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SpeechConfig {
    voice_config: VoiceConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct VoiceConfig {
    prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PrebuiltVoiceConfig {
    voice_name: String,
}

#[derive(Debug, Serialize)]
struct Content {
    parts: Vec<TextPart>,
}

#[derive(Debug, Serialize)]
struct TextPart {
    text: String,
}

#[derive(Debug, Serialize)]
struct Empty {}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ClientRealtimeInput {
    realtime_input: RealtimeInput,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RealtimeInput {
    media_chunks: Vec<MediaChunk>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MediaChunk {
    mime_type: String,
    data: String,
}

fn setup_message(config: &ConnectConfig) -> ClientSetup {
    let model = if config.model.starts_with("models/") {
        config.model.clone()
    } else {
        format!("models/{}", config.model)
    };

    ClientSetup {
        setup: Setup {
            model,
            generation_config: GenerationConfig {
                response_modalities: vec![config.response_modality],
                speech_config: SpeechConfig {
                    voice_config: VoiceConfig {
                        prebuilt_voice_config: PrebuiltVoiceConfig {
                            voice_name: config.voice.clone(),
                        },
                    },
                },
            },
            system_instruction: config.system_instruction.as_ref().map(|text| Content {
                parts: vec![TextPart { text: text.clone() }],
            }),
            input_audio_transcription: config.input_transcription.then_some(Empty {}),
            output_audio_transcription: config.output_transcription.then_some(Empty {}),
        },
    }
}

fn audio_message(chunk: &OutboundAudioChunk) -> ClientRealtimeInput {
    ClientRealtimeInput {
        realtime_input: RealtimeInput {
            media_chunks: vec![MediaChunk {
                mime_type: chunk.mime_type(),
                data: STANDARD.encode(chunk.to_le_bytes()),
            }],
        },
    }
}

// --- Server frames ---

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerMessage {
    #[serde(default)]
    setup_complete: Option<serde_json::Value>,
    #[serde(default)]
    server_content: Option<ServerContent>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerContent {
    #[serde(default)]
    input_transcription: Option<Transcription>,
    #[serde(default)]
    output_transcription: Option<Transcription>,
    #[serde(default)]
    turn_complete: bool,
    #[serde(default)]
    model_turn: Option<ModelTurn>,
    #[serde(default)]
    interrupted: bool,
}

#[derive(Debug, Deserialize)]
struct Transcription {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct ModelTurn {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    #[serde(default)]
    inline_data: Option<InlineData>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    #[serde(default)]
    mime_type: String,
    #[serde(default)]
    data: String,
}

/// Sample rate from a MIME type like `audio/pcm;rate=24000`.
fn rate_from_mime(mime: &str) -> u32 {
    mime.split(';')
        .filter_map(|param| param.trim().strip_prefix("rate="))
        .find_map(|rate| rate.parse().ok())
        .unwrap_or(DEFAULT_OUTPUT_RATE)
}

/// Map one server frame to events, in the order they must be handled.
fn parse_server_message(text: &str) -> Vec<LiveEvent> {
    let msg: ServerMessage = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            debug!(%e, "Ignoring unparseable Gemini frame");
            return Vec::new();
        }
    };

    let mut events = Vec::new();
    if msg.setup_complete.is_some() {
        events.push(LiveEvent::Opened);
    }

    let Some(content) = msg.server_content else {
        return events;
    };

    if let Some(t) = content.input_transcription {
        events.push(LiveEvent::UserTranscript(t.text));
    }
    if let Some(t) = content.output_transcription {
        events.push(LiveEvent::ModelTranscript(t.text));
    }
    if content.turn_complete {
        events.push(LiveEvent::TurnComplete);
    }
    if let Some(turn) = content.model_turn {
        for data in turn.parts.into_iter().filter_map(|p| p.inline_data) {
            if data.data.is_empty() || !data.mime_type.starts_with("audio/") {
                continue;
            }
            events.push(LiveEvent::Audio(InboundAudioChunk {
                sample_rate: rate_from_mime(&data.mime_type),
                encoded_payload: data.data,
                channel_count: 1,
            }));
        }
    }
    if content.interrupted {
        events.push(LiveEvent::Interrupted);
    }
    events
}

fn is_rejection_status(status: u16) -> bool {
    status == 401 || status == 403
}

fn map_connect_error(err: tungstenite::Error) -> ChuzziError {
    if let tungstenite::Error::Http(resp) = &err {
        let status = resp.status().as_u16();
        if is_rejection_status(status) {
            return ChuzziError::Rejected(format!("handshake refused with HTTP {status}"));
        }
    }
    ChuzziError::Connection(format!("failed to open live socket: {err}"))
}

/// Outbound half of an open Gemini Live socket.
pub struct GeminiSession {
    outbound: mpsc::UnboundedSender<Message>,
    cancel: CancellationToken,
}

#[async_trait]
impl LiveSession for GeminiSession {
    async fn send_audio(&self, chunk: &OutboundAudioChunk) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(ChuzziError::ChannelClosed);
        }
        let payload = serde_json::to_string(&audio_message(chunk))?;
        self.outbound
            .send(Message::Text(payload.into()))
            .map_err(|_| ChuzziError::ChannelClosed)
    }

    async fn close(&self) {
        self.cancel.cancel();
    }
}

#[async_trait]
impl LiveTransport for GeminiLiveTransport {
    fn id(&self) -> &str {
        "gemini"
    }

    fn check_credentials(&self) -> Result<()> {
        self.key().map(|_| ())
    }

    async fn connect(&self, config: &ConnectConfig) -> Result<LiveConnection> {
        let key = self.key()?;
        debug!(model = %config.model, base_url = %self.base_url, "Opening Gemini Live socket");

        let (ws, _response) = connect_async(self.endpoint(key))
            .await
            .map_err(map_connect_error)?;
        let (mut sink, mut stream) = ws.split();

        let setup = serde_json::to_string(&setup_message(config))?;
        sink.send(Message::Text(setup.into()))
            .await
            .map_err(|e| ChuzziError::Connection(format!("failed to send setup: {e}")))?;

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        // Writer: outbound frames until closed, then a close handshake
        let writer_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = writer_cancel.cancelled() => {
                        let _ = sink.send(Message::Close(None)).await;
                        let _ = sink.close().await;
                        break;
                    }
                    msg = out_rx.recv() => {
                        let Some(msg) = msg else { break };
                        if let Err(e) = sink.send(msg).await {
                            warn!(%e, "Gemini socket write failed");
                            writer_cancel.cancel();
                            break;
                        }
                    }
                }
            }
            trace!("Gemini writer finished");
        });

        // Reader: server frames to events
        let reader_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    _ = reader_cancel.cancelled() => break,
                    frame = stream.next() => frame,
                };

                let text = match frame {
                    Some(Ok(Message::Text(t))) => t.as_str().to_owned(),
                    Some(Ok(Message::Binary(b))) => match std::str::from_utf8(&b) {
                        Ok(s) => s.to_owned(),
                        Err(_) => {
                            debug!(len = b.len(), "Ignoring non-UTF-8 binary frame");
                            continue;
                        }
                    },
                    Some(Ok(Message::Close(frame))) => {
                        let abnormal = frame.as_ref().is_some_and(|f| f.code != CloseCode::Normal);
                        match &frame {
                            Some(f) => info!(code = %f.code, reason = %f.reason, "Gemini socket closed"),
                            None => info!("Gemini socket closed"),
                        }
                        let _ = event_tx.send(LiveEvent::Closed { abnormal });
                        break;
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        warn!(%e, "Gemini socket read failed");
                        let _ = event_tx.send(LiveEvent::Error(e.to_string()));
                        break;
                    }
                    None => {
                        let _ = event_tx.send(LiveEvent::Closed { abnormal: true });
                        break;
                    }
                };

                for event in parse_server_message(&text) {
                    let _ = event_tx.send(event);
                }
                if event_tx.is_closed() {
                    break;
                }
            }
            reader_cancel.cancel();
            trace!("Gemini reader finished");
        });

        Ok(LiveConnection {
            session: Box::new(GeminiSession {
                outbound: out_tx,
                cancel,
            }),
            events: event_rx,
        })
    }
}
