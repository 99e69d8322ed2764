//! Sample-clock mixer behind hardware [`OutputDevice`](crate::OutputDevice)s.
//!
//! Voices are placed at absolute frame positions and summed into whatever
//! buffer the audio callback asks for. The clock only advances as frames are
//! rendered, so it tracks what the listener actually hears.

use crate::playback::VoiceId;

struct Voice {
    id: VoiceId,
    start: u64,
    samples: Vec<f32>,
}

pub struct VoiceMixer {
    sample_rate: u32,
    channels: u16,
    position: u64,
    next_id: u64,
    voices: Vec<Voice>,
}

impl VoiceMixer {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate: sample_rate.max(1),
            channels: channels.max(1),
            position: 0,
            next_id: 1,
            voices: Vec::new(),
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    /// Frames rendered so far.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Clock in seconds.
    pub fn now(&self) -> f64 {
        self.position as f64 / self.sample_rate as f64
    }

    /// Voices still queued or playing.
    pub fn active(&self) -> usize {
        self.voices.len()
    }

    /// Queue interleaved samples to start at `start_at` seconds.
    pub fn schedule(&mut self, samples: Vec<f32>, start_at: f64) -> VoiceId {
        let id = VoiceId(self.next_id);
        self.next_id += 1;
        let start = (start_at.max(0.0) * self.sample_rate as f64).round() as u64;
        self.voices.push(Voice { id, start, samples });
        id
    }

    pub fn stop(&mut self, id: VoiceId) {
        self.voices.retain(|v| v.id != id);
    }

    /// Mix the next `out.len() / channels` frames into `out` and advance the clock.
    pub fn render(&mut self, out: &mut [f32]) {
        let channels = self.channels as usize;
        let frames = out.len() / channels;
        out.fill(0.0);

        for voice in &self.voices {
            let voice_frames = (voice.samples.len() / channels) as u64;
            let end = voice.start + voice_frames;
            let from = voice.start.max(self.position);
            let to = end.min(self.position + frames as u64);
            for pos in from..to {
                let src = (pos - voice.start) as usize * channels;
                let dst = (pos - self.position) as usize * channels;
                for c in 0..channels {
                    out[dst + c] += voice.samples[src + c];
                }
            }
        }
        for sample in out.iter_mut() {
            *sample = sample.clamp(-1.0, 1.0);
        }

        self.position += frames as u64;
        let position = self.position;
        self.voices
            .retain(|v| v.start + (v.samples.len() / channels) as u64 > position);
    }
}
