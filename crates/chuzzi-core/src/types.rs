use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Who produced a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Model,
}

/// One finalized entry of the conversation log.
///
/// Fields are private so a message cannot change after it is created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    role: Role,
    text: String,
    timestamp: DateTime<Utc>,
}

impl ChatMessage {
    pub fn new(role: Role, text: impl Into<String>) -> Self {
        Self::with_timestamp(role, text, Utc::now())
    }

    pub fn with_timestamp(role: Role, text: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            role,
            text: text.into(),
            timestamp,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// Wire encoding of outbound audio.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioEncoding {
    /// Signed 16-bit little-endian PCM.
    #[default]
    Pcm16Le,
}

/// Microphone audio on its way to the remote service.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundAudioChunk {
    pub samples: Vec<i16>,
    pub sample_rate: u32,
    pub encoding: AudioEncoding,
}

impl OutboundAudioChunk {
    pub fn pcm16(samples: Vec<i16>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
            encoding: AudioEncoding::Pcm16Le,
        }
    }

    /// MIME type announced to the remote, e.g. `audio/pcm;rate=16000`.
    pub fn mime_type(&self) -> String {
        match self.encoding {
            AudioEncoding::Pcm16Le => format!("audio/pcm;rate={}", self.sample_rate),
        }
    }

    /// Raw little-endian bytes of the samples.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        self.samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    pub fn duration_ms(&self) -> u64 {
        if self.sample_rate == 0 {
            return 0;
        }
        (self.samples.len() as u64 * 1000) / self.sample_rate as u64
    }
}

/// Synthesized speech received from the remote service, still encoded.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundAudioChunk {
    /// Base64 of little-endian 16-bit PCM.
    pub encoded_payload: String,
    pub sample_rate: u32,
    pub channel_count: u16,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chat_message_serialization() {
        let msg = ChatMessage::new(Role::Model, "Good to hear!");
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["role"], "model");
        assert_eq!(json["text"], "Good to hear!");

        let back: ChatMessage = serde_json::from_value(json).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn test_outbound_chunk_wire_format() {
        let chunk = OutboundAudioChunk::pcm16(vec![1, -2, 256], 16000);
        assert_eq!(chunk.mime_type(), "audio/pcm;rate=16000");
        assert_eq!(chunk.to_le_bytes(), vec![1, 0, 0xfe, 0xff, 0, 1]);
    }

    #[test]
    fn test_outbound_chunk_duration() {
        let chunk = OutboundAudioChunk::pcm16(vec![0; 320], 16000);
        assert_eq!(chunk.duration_ms(), 20);
        let empty_rate = OutboundAudioChunk::pcm16(vec![0; 320], 0);
        assert_eq!(empty_rate.duration_ms(), 0);
    }
}
