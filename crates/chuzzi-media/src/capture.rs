//! Capture bridge: turns microphone frames into outbound wire chunks.
//!
//! The bridge is a live, lossy path: frames that arrive while no open session
//! exists are dropped, never queued.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info};

use chuzzi_core::error::Result;
use chuzzi_core::session::LiveSession;
use chuzzi_core::types::OutboundAudioChunk;

use crate::pcm;

/// A running capture stream. Dropping it releases the input device.
pub trait CaptureStream: Send {
    /// Rate the device actually delivers frames at.
    fn sample_rate(&self) -> u32;
}

/// Source of mono float frames (normalized to -1.0..1.0).
pub trait CaptureDevice: Send + Sync {
    /// Acquire the input device and start delivering frames into `frames`.
    ///
    /// Access problems are reported as `ChuzziError::Permission`.
    fn open(&self, frames: mpsc::UnboundedSender<Vec<f32>>) -> Result<Box<dyn CaptureStream>>;
}

/// What happened to one captured frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Forwarded {
    Sent,
    /// No open session.
    Dropped,
    /// The transport was already closing; the send error was ignored.
    Swallowed,
}

pub struct AudioCaptureBridge {
    device: Arc<dyn CaptureDevice>,
    /// Wire rate expected by the remote service.
    target_rate: u32,
    source_rate: u32,
    stream: Option<Box<dyn CaptureStream>>,
    frames: Option<mpsc::UnboundedReceiver<Vec<f32>>>,
    frames_sent: u64,
    frames_dropped: u64,
    /// Audio handed to the session since `start`.
    sent_ms: u64,
}

impl AudioCaptureBridge {
    pub fn new(device: Arc<dyn CaptureDevice>, target_rate: u32) -> Self {
        Self {
            device,
            target_rate,
            source_rate: target_rate,
            stream: None,
            frames: None,
            frames_sent: 0,
            frames_dropped: 0,
            sent_ms: 0,
        }
    }

    /// Acquire the capture device. No-op if already capturing.
    pub fn start(&mut self) -> Result<()> {
        if self.is_active() {
            return Ok(());
        }

        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        let stream = self.device.open(frame_tx)?;
        self.source_rate = stream.sample_rate();
        self.stream = Some(stream);
        self.frames = Some(frame_rx);
        self.frames_sent = 0;
        self.frames_dropped = 0;
        self.sent_ms = 0;

        info!(
            source_rate = self.source_rate,
            target_rate = self.target_rate,
            "Audio capture started"
        );
        Ok(())
    }

    /// Release the device and discard any frames not yet forwarded.
    pub fn stop(&mut self) {
        let was_active = self.stream.is_some();
        self.stream = None;
        self.frames = None;
        if was_active {
            info!(
                sent = self.frames_sent,
                dropped = self.frames_dropped,
                sent_ms = self.sent_ms,
                "Audio capture stopped"
            );
        }
    }

    pub fn is_active(&self) -> bool {
        self.stream.is_some()
    }

    /// Wait for the next captured frame.
    ///
    /// Pends forever while not capturing, so it can sit in a `select!`.
    pub async fn next_frame(&mut self) -> Option<Vec<f32>> {
        let Some(rx) = self.frames.as_mut() else {
            return std::future::pending().await;
        };
        let frame = rx.recv().await;
        if frame.is_none() {
            // device hung up
            debug!("Capture device closed its frame channel");
            self.frames = None;
        }
        frame
    }

    /// Convert a float frame to the outbound wire chunk.
    pub fn encode(&self, frame: &[f32]) -> OutboundAudioChunk {
        let samples = if self.source_rate == self.target_rate {
            pcm::f32_to_i16(frame)
        } else {
            pcm::f32_to_i16(&pcm::resample_linear(
                frame,
                1,
                self.source_rate,
                self.target_rate,
            ))
        };
        OutboundAudioChunk::pcm16(samples, self.target_rate)
    }

    /// Forward one frame to `session`, or drop it when there is no open session.
    ///
    /// Errors other than a closed channel are returned to the caller.
    pub async fn forward(
        &mut self,
        frame: &[f32],
        session: Option<&dyn LiveSession>,
    ) -> Result<Forwarded> {
        let Some(session) = session else {
            self.frames_dropped += 1;
            return Ok(Forwarded::Dropped);
        };

        let chunk = self.encode(frame);
        match session.send_audio(&chunk).await {
            Ok(()) => {
                self.frames_sent += 1;
                self.sent_ms += chunk.duration_ms();
                Ok(Forwarded::Sent)
            }
            Err(e) if e.is_channel_closed() => {
                debug!("Send on closing channel, ignoring");
                self.frames_dropped += 1;
                Ok(Forwarded::Swallowed)
            }
            Err(e) => Err(e),
        }
    }
}
