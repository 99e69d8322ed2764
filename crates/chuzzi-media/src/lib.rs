//! Audio pipelines: microphone capture bridge, gapless playback scheduling,
//! a sample-clock mixer for output devices, and PCM helpers.

pub mod capture;
pub mod mixer;
pub mod pcm;
pub mod playback;

pub use capture::{AudioCaptureBridge, CaptureDevice, CaptureStream, Forwarded};
pub use mixer::VoiceMixer;
pub use playback::{AudioPlaybackScheduler, OutputDevice, PlaybackBuffer, ScheduledPlayback, VoiceId};
