//! Gapless playback of synthesized speech chunks.
//!
//! Each decoded chunk is scheduled on the output device clock to start exactly
//! when the previous one ends. A `cursor` tracks the end of the last scheduled
//! buffer; when the device clock has overtaken it (the queue ran dry), the
//! next chunk starts "now" instead of in the past.

use std::collections::HashMap;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use tracing::{debug, info, warn};

use chuzzi_core::error::{ChuzziError, Result};
use chuzzi_core::types::InboundAudioChunk;

use crate::pcm;

/// Handle for one buffer queued on an [`OutputDevice`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VoiceId(pub u64);

/// Interleaved float samples ready for the output device.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackBuffer {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl PlaybackBuffer {
    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels.max(1) as usize
    }

    /// Length in seconds.
    pub fn duration(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frames() as f64 / self.sample_rate as f64
    }
}

/// An audio output with a monotonic clock.
pub trait OutputDevice: Send + Sync {
    fn sample_rate(&self) -> u32;

    fn channels(&self) -> u16;

    /// Current device time in seconds.
    fn now(&self) -> f64;

    /// Queue `buffer` to start at device time `start_at`.
    fn play_at(&self, buffer: PlaybackBuffer, start_at: f64) -> Result<VoiceId>;

    /// Stop a queued or playing buffer. Unknown ids are ignored.
    fn stop(&self, voice: VoiceId);
}

/// Where a chunk landed on the device timeline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledPlayback {
    pub voice: VoiceId,
    pub start: f64,
    pub end: f64,
}

/// Decode a base64 PCM16 chunk into a buffer matching the device format.
pub fn decode_chunk(
    chunk: &InboundAudioChunk,
    device_rate: u32,
    device_channels: u16,
) -> Result<PlaybackBuffer> {
    if chunk.sample_rate == 0 || chunk.channel_count == 0 {
        return Err(ChuzziError::Decode(format!(
            "invalid audio format: {} Hz, {} channels",
            chunk.sample_rate, chunk.channel_count
        )));
    }

    let bytes = STANDARD
        .decode(chunk.encoded_payload.as_bytes())
        .map_err(|e| ChuzziError::Decode(format!("invalid base64 audio: {e}")))?;
    let samples = pcm::i16_to_f32(&pcm::le_bytes_to_i16(&bytes));
    if samples.is_empty() {
        return Err(ChuzziError::Decode("empty audio payload".into()));
    }

    let remixed = pcm::remix(&samples, chunk.channel_count, device_channels);
    let samples = pcm::resample_linear(&remixed, device_channels, chunk.sample_rate, device_rate);

    Ok(PlaybackBuffer {
        samples,
        sample_rate: device_rate,
        channels: device_channels,
    })
}

pub struct AudioPlaybackScheduler {
    device: Arc<dyn OutputDevice>,
    /// Device time at which the last scheduled buffer ends. 0.0 when idle.
    cursor: f64,
    /// Buffers not known to have finished, with their end times.
    active: HashMap<VoiceId, f64>,
}

impl AudioPlaybackScheduler {
    pub fn new(device: Arc<dyn OutputDevice>) -> Self {
        Self {
            device,
            cursor: 0.0,
            active: HashMap::new(),
        }
    }

    /// Decode `chunk` and queue it right after everything already scheduled.
    pub fn enqueue(&mut self, chunk: &InboundAudioChunk) -> Result<ScheduledPlayback> {
        let buffer = decode_chunk(chunk, self.device.sample_rate(), self.device.channels())?;
        let duration = buffer.duration();

        let now = self.device.now();
        self.reap(now);

        let start = now.max(self.cursor);
        let voice = self.device.play_at(buffer, start)?;
        let end = start + duration;
        self.cursor = end;
        self.active.insert(voice, end);

        debug!(
            voice = voice.0,
            start,
            duration,
            queued = self.active.len(),
            "Scheduled playback chunk"
        );
        Ok(ScheduledPlayback { voice, start, end })
    }

    /// Stop everything queued or playing and reset the timeline.
    ///
    /// Returns how many buffers were stopped.
    pub fn interrupt(&mut self) -> usize {
        let stopped = self.active.len();
        for (voice, _) in self.active.drain() {
            self.device.stop(voice);
        }
        self.cursor = 0.0;
        if stopped > 0 {
            info!(stopped, "Playback interrupted");
        }
        stopped
    }

    pub fn cursor(&self) -> f64 {
        self.cursor
    }

    /// Buffers scheduled and not yet known to have finished.
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Decode and enqueue, logging instead of failing. Used on the event path,
    /// where one bad chunk must not tear down the session.
    pub fn enqueue_or_warn(&mut self, chunk: &InboundAudioChunk) -> Option<ScheduledPlayback> {
        match self.enqueue(chunk) {
            Ok(scheduled) => Some(scheduled),
            Err(e) => {
                warn!(error = %e, "Dropping undecodable audio chunk");
                None
            }
        }
    }

    fn reap(&mut self, now: f64) {
        self.active.retain(|_, end| *end > now);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    const EPS: f64 = 1e-9;

    #[derive(Default)]
    struct FakeOutput {
        rate: u32,
        channels: u16,
        clock: Mutex<f64>,
        next_id: Mutex<u64>,
        played: Mutex<Vec<(VoiceId, f64, usize)>>,
        stopped: Mutex<Vec<VoiceId>>,
    }

    impl FakeOutput {
        fn new(rate: u32, channels: u16, clock: f64) -> Arc<Self> {
            Arc::new(Self {
                rate,
                channels,
                clock: Mutex::new(clock),
                ..Self::default()
            })
        }

        fn set_clock(&self, t: f64) {
            *self.clock.lock().unwrap() = t;
        }
    }

    impl OutputDevice for FakeOutput {
        fn sample_rate(&self) -> u32 {
            self.rate
        }

        fn channels(&self) -> u16 {
            self.channels
        }

        fn now(&self) -> f64 {
            *self.clock.lock().unwrap()
        }

        fn play_at(&self, buffer: PlaybackBuffer, start_at: f64) -> Result<VoiceId> {
            let mut next = self.next_id.lock().unwrap();
            *next += 1;
            let id = VoiceId(*next);
            self.played
                .lock()
                .unwrap()
                .push((id, start_at, buffer.samples.len()));
            Ok(id)
        }

        fn stop(&self, voice: VoiceId) {
            self.stopped.lock().unwrap().push(voice);
        }
    }

    fn pcm_chunk(samples: usize, rate: u32, channels: u16) -> InboundAudioChunk {
        let bytes: Vec<u8> = (0..samples)
            .flat_map(|i| ((i % 100) as i16).to_le_bytes())
            .collect();
        InboundAudioChunk {
            encoded_payload: STANDARD.encode(bytes),
            sample_rate: rate,
            channel_count: channels,
        }
    }

    #[test]
    fn test_back_to_back_chunks_are_gapless() {
        let output = FakeOutput::new(24000, 1, 10.0);
        let mut scheduler = AudioPlaybackScheduler::new(output.clone());

        let a = scheduler.enqueue(&pcm_chunk(12000, 24000, 1)).unwrap();
        let b = scheduler.enqueue(&pcm_chunk(7200, 24000, 1)).unwrap();

        assert!((a.start - 10.0).abs() < EPS);
        assert!((b.start - 10.5).abs() < EPS);
        assert!((scheduler.cursor() - 10.8).abs() < 1e-6);
        assert_eq!(scheduler.active_count(), 2);
    }

    #[test]
    fn test_interrupt_stops_everything() {
        let output = FakeOutput::new(24000, 1, 10.0);
        let mut scheduler = AudioPlaybackScheduler::new(output.clone());
        let a = scheduler.enqueue(&pcm_chunk(12000, 24000, 1)).unwrap();
        let b = scheduler.enqueue(&pcm_chunk(7200, 24000, 1)).unwrap();

        output.set_clock(10.2);
        assert_eq!(scheduler.interrupt(), 2);

        let stopped = output.stopped.lock().unwrap().clone();
        assert!(stopped.contains(&a.voice));
        assert!(stopped.contains(&b.voice));
        assert_eq!(scheduler.active_count(), 0);
        assert_eq!(scheduler.cursor(), 0.0);
    }

    #[test]
    fn test_interrupt_when_idle_is_noop() {
        let output = FakeOutput::new(24000, 1, 3.0);
        let mut scheduler = AudioPlaybackScheduler::new(output.clone());
        assert_eq!(scheduler.interrupt(), 0);
        assert!(output.stopped.lock().unwrap().is_empty());
    }

    #[test]
    fn test_catch_up_after_gap() {
        let output = FakeOutput::new(24000, 1, 1.0);
        let mut scheduler = AudioPlaybackScheduler::new(output.clone());
        scheduler.enqueue(&pcm_chunk(2400, 24000, 1)).unwrap();
        assert!((scheduler.cursor() - 1.1).abs() < 1e-6);

        // Queue ran dry; the next chunk starts now, not in the past
        output.set_clock(5.0);
        let next = scheduler.enqueue(&pcm_chunk(2400, 24000, 1)).unwrap();
        assert!((next.start - 5.0).abs() < EPS);
        // The finished buffer was reaped
        assert_eq!(scheduler.active_count(), 1);
    }

    #[test]
    fn test_after_interrupt_starts_at_now() {
        let output = FakeOutput::new(24000, 1, 10.0);
        let mut scheduler = AudioPlaybackScheduler::new(output.clone());
        scheduler.enqueue(&pcm_chunk(12000, 24000, 1)).unwrap();
        output.set_clock(10.2);
        scheduler.interrupt();

        let next = scheduler.enqueue(&pcm_chunk(2400, 24000, 1)).unwrap();
        assert!((next.start - 10.2).abs() < EPS);
    }

    #[test]
    fn test_decode_resamples_and_remixes_to_device() {
        let output = FakeOutput::new(48000, 2, 0.0);
        let mut scheduler = AudioPlaybackScheduler::new(output.clone());
        let scheduled = scheduler.enqueue(&pcm_chunk(2400, 24000, 1)).unwrap();

        // 0.1s of mono 24k becomes 0.1s of stereo 48k
        assert!((scheduled.end - scheduled.start - 0.1).abs() < 1e-6);
        let played = output.played.lock().unwrap();
        assert_eq!(played[0].2, 4800 * 2);
    }

    #[test]
    fn test_decode_errors() {
        let bad_base64 = InboundAudioChunk {
            encoded_payload: "!!not base64!!".into(),
            sample_rate: 24000,
            channel_count: 1,
        };
        assert!(matches!(
            decode_chunk(&bad_base64, 24000, 1),
            Err(ChuzziError::Decode(_))
        ));

        let empty = InboundAudioChunk {
            encoded_payload: String::new(),
            sample_rate: 24000,
            channel_count: 1,
        };
        assert!(matches!(
            decode_chunk(&empty, 24000, 1),
            Err(ChuzziError::Decode(_))
        ));

        let zero_rate = pcm_chunk(10, 0, 1);
        assert!(matches!(
            decode_chunk(&zero_rate, 24000, 1),
            Err(ChuzziError::Decode(_))
        ));
    }

    #[test]
    fn test_enqueue_or_warn_skips_bad_chunk() {
        let output = FakeOutput::new(24000, 1, 0.0);
        let mut scheduler = AudioPlaybackScheduler::new(output.clone());
        let bad = InboundAudioChunk {
            encoded_payload: String::new(),
            sample_rate: 24000,
            channel_count: 1,
        };
        assert!(scheduler.enqueue_or_warn(&bad).is_none());
        assert_eq!(scheduler.active_count(), 0);
        assert_eq!(scheduler.cursor(), 0.0);
    }

    #[test]
    fn test_buffer_duration() {
        let buffer = PlaybackBuffer {
            samples: vec![0.0; 9600],
            sample_rate: 48000,
            channels: 2,
        };
        assert_eq!(buffer.frames(), 4800);
        assert!((buffer.duration() - 0.1).abs() < EPS);
    }
}
