//! Default microphone and speaker, bound through cpal when the
//! `audio-device` feature is enabled.
//!
//! The speaker opens at `audio.output_sample_rate` and `audio.output_channels`
//! when the device advertises that format, and at its default format otherwise.

use std::sync::Arc;

use chuzzi_core::config::AudioConfig;
use chuzzi_media::{CaptureDevice, OutputDevice};

pub const AVAILABLE: bool = cfg!(feature = "audio-device");

#[cfg(feature = "audio-device")]
pub fn open(config: &AudioConfig) -> anyhow::Result<(Arc<dyn CaptureDevice>, Arc<dyn OutputDevice>)> {
    let mic = hw::CpalMicrophone::new(config.frame_size);
    let speaker = hw::CpalSpeaker::open(config)?;
    Ok((Arc::new(mic), Arc::new(speaker)))
}

#[cfg(not(feature = "audio-device"))]
pub fn open(_config: &AudioConfig) -> anyhow::Result<(Arc<dyn CaptureDevice>, Arc<dyn OutputDevice>)> {
    anyhow::bail!("chuzzi was built without audio support; rebuild with `--features audio-device`")
}

/// One output format range a device advertises.
#[cfg(any(test, feature = "audio-device"))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct OutputRange {
    channels: u16,
    min_rate: u32,
    max_rate: u32,
}

/// Position of the first range that can play the configured rate and channel count.
#[cfg(any(test, feature = "audio-device"))]
fn preferred_output(ranges: &[OutputRange], audio: &AudioConfig) -> Option<usize> {
    ranges.iter().position(|r| {
        r.channels == audio.output_channels
            && (r.min_rate..=r.max_rate).contains(&audio.output_sample_rate)
    })
}

#[cfg(feature = "audio-device")]
mod hw {
    use std::sync::mpsc as std_mpsc;
    use std::sync::{Arc, Mutex, MutexGuard};

    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use cpal::{FromSample, Sample, SampleFormat, SizedSample, StreamConfig};
    use tokio::sync::mpsc;
    use tracing::{info, warn};

    use chuzzi_core::config::AudioConfig;
    use chuzzi_core::error::{ChuzziError, Result};
    use chuzzi_media::{CaptureDevice, CaptureStream, OutputDevice, PlaybackBuffer, VoiceId, VoiceMixer, pcm};

    // cpal::Stream is !Send, so every stream lives on its own thread until
    // the owning handle drops the stop sender.
    fn park_stream<F>(name: &str, build: F) -> Result<(u32, u16, std_mpsc::Sender<()>)>
    where
        F: FnOnce() -> Result<(cpal::Stream, u32, u16)> + Send + 'static,
    {
        let (ready_tx, ready_rx) = std_mpsc::sync_channel(1);
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();
        std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || match build() {
                Ok((stream, rate, channels)) => {
                    let _ = ready_tx.send(Ok((rate, channels)));
                    let _ = stop_rx.recv();
                    drop(stream);
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                }
            })?;
        let (rate, channels) = ready_rx
            .recv()
            .map_err(|_| ChuzziError::Device(format!("{name} thread exited")))??;
        Ok((rate, channels, stop_tx))
    }

    fn build_error(e: cpal::BuildStreamError) -> ChuzziError {
        match e {
            cpal::BuildStreamError::DeviceNotAvailable => {
                ChuzziError::Permission("audio device not available".into())
            }
            other => ChuzziError::Device(other.to_string()),
        }
    }

    // --- Microphone ---

    pub struct CpalMicrophone {
        frame_size: usize,
    }

    impl CpalMicrophone {
        pub fn new(frame_size: usize) -> Self {
            Self {
                frame_size: frame_size.max(1),
            }
        }
    }

    struct CpalCaptureStream {
        sample_rate: u32,
        _stop: std_mpsc::Sender<()>,
    }

    impl CaptureStream for CpalCaptureStream {
        fn sample_rate(&self) -> u32 {
            self.sample_rate
        }
    }

    impl CaptureDevice for CpalMicrophone {
        fn open(&self, frames: mpsc::UnboundedSender<Vec<f32>>) -> Result<Box<dyn CaptureStream>> {
            let frame_size = self.frame_size;
            let (sample_rate, _, stop) =
                park_stream("chuzzi-capture", move || build_input(frames, frame_size))?;
            Ok(Box::new(CpalCaptureStream {
                sample_rate,
                _stop: stop,
            }))
        }
    }

    fn build_input(
        frames: mpsc::UnboundedSender<Vec<f32>>,
        frame_size: usize,
    ) -> Result<(cpal::Stream, u32, u16)> {
        let device = cpal::default_host()
            .default_input_device()
            .ok_or_else(|| ChuzziError::Permission("no microphone available".into()))?;
        let supported = device
            .default_input_config()
            .map_err(|e| ChuzziError::Permission(format!("cannot open microphone: {e}")))?;
        let config = supported.config();

        let stream = match supported.sample_format() {
            SampleFormat::F32 => input_stream::<f32>(&device, &config, frames, frame_size),
            SampleFormat::I16 => input_stream::<i16>(&device, &config, frames, frame_size),
            SampleFormat::U16 => input_stream::<u16>(&device, &config, frames, frame_size),
            other => Err(ChuzziError::Device(format!(
                "unsupported microphone sample format {other:?}"
            ))),
        }?;
        stream
            .play()
            .map_err(|e| ChuzziError::Device(e.to_string()))?;

        info!(
            device = %device.name().unwrap_or_else(|_| "unknown".into()),
            sample_rate = config.sample_rate.0,
            channels = config.channels,
            "Microphone open"
        );
        Ok((stream, config.sample_rate.0, config.channels))
    }

    fn input_stream<T>(
        device: &cpal::Device,
        config: &StreamConfig,
        frames: mpsc::UnboundedSender<Vec<f32>>,
        frame_size: usize,
    ) -> Result<cpal::Stream>
    where
        T: SizedSample,
        f32: FromSample<T>,
    {
        let channels = config.channels;
        let mut pending = Vec::with_capacity(frame_size);
        device
            .build_input_stream(
                config,
                move |data: &[T], _: &cpal::InputCallbackInfo| {
                    let samples: Vec<f32> = data.iter().map(|s| s.to_sample::<f32>()).collect();
                    for sample in pcm::remix(&samples, channels, 1) {
                        pending.push(sample);
                        if pending.len() >= frame_size {
                            let frame = std::mem::replace(&mut pending, Vec::with_capacity(frame_size));
                            // receiver gone means capture is being stopped
                            let _ = frames.send(frame);
                        }
                    }
                },
                |err| warn!(error = %err, "Microphone stream error"),
                None,
            )
            .map_err(build_error)
    }

    // --- Speaker ---

    pub struct CpalSpeaker {
        mixer: Arc<Mutex<VoiceMixer>>,
        sample_rate: u32,
        channels: u16,
        _stop: std_mpsc::Sender<()>,
    }

    impl CpalSpeaker {
        pub fn open(audio: &AudioConfig) -> Result<Self> {
            let audio = audio.clone();
            let (ready_tx, ready_rx) = std_mpsc::sync_channel(1);
            let (sample_rate, channels, stop) = park_stream("chuzzi-playback", move || {
                let (stream, mixer, rate, channels) = build_output(&audio)?;
                let _ = ready_tx.send(mixer);
                Ok((stream, rate, channels))
            })?;
            let mixer = ready_rx
                .recv()
                .map_err(|_| ChuzziError::Device("playback thread exited".into()))?;
            Ok(Self {
                mixer,
                sample_rate,
                channels,
                _stop: stop,
            })
        }

        fn mixer(&self) -> MutexGuard<'_, VoiceMixer> {
            self.mixer.lock().unwrap_or_else(|e| e.into_inner())
        }
    }

    impl OutputDevice for CpalSpeaker {
        fn sample_rate(&self) -> u32 {
            self.sample_rate
        }

        fn channels(&self) -> u16 {
            self.channels
        }

        fn now(&self) -> f64 {
            self.mixer().now()
        }

        fn play_at(&self, buffer: PlaybackBuffer, start_at: f64) -> Result<VoiceId> {
            if buffer.sample_rate != self.sample_rate || buffer.channels != self.channels {
                return Err(ChuzziError::Device(format!(
                    "buffer is {} Hz x{}, speaker is {} Hz x{}",
                    buffer.sample_rate, buffer.channels, self.sample_rate, self.channels
                )));
            }
            Ok(self.mixer().schedule(buffer.samples, start_at))
        }

        fn stop(&self, voice: VoiceId) {
            self.mixer().stop(voice);
        }
    }

    /// The configured output format, if the device can play it.
    fn configured_output(
        device: &cpal::Device,
        audio: &AudioConfig,
    ) -> Option<cpal::SupportedStreamConfig> {
        let mut ranges: Vec<cpal::SupportedStreamConfigRange> = device
            .supported_output_configs()
            .ok()?
            .filter(|r| {
                matches!(
                    r.sample_format(),
                    SampleFormat::F32 | SampleFormat::I16 | SampleFormat::U16
                )
            })
            .collect();
        // float first
        ranges.sort_by_key(|r| r.sample_format() != SampleFormat::F32);

        let summary: Vec<super::OutputRange> = ranges
            .iter()
            .map(|r| super::OutputRange {
                channels: r.channels(),
                min_rate: r.min_sample_rate().0,
                max_rate: r.max_sample_rate().0,
            })
            .collect();
        let index = super::preferred_output(&summary, audio)?;
        ranges
            .into_iter()
            .nth(index)
            .map(|r| r.with_sample_rate(cpal::SampleRate(audio.output_sample_rate)))
    }

    fn build_output(
        audio: &AudioConfig,
    ) -> Result<(cpal::Stream, Arc<Mutex<VoiceMixer>>, u32, u16)> {
        let device = cpal::default_host()
            .default_output_device()
            .ok_or_else(|| ChuzziError::Device("no speaker available".into()))?;
        let supported = match configured_output(&device, audio) {
            Some(supported) => supported,
            None => {
                info!(
                    sample_rate = audio.output_sample_rate,
                    channels = audio.output_channels,
                    "Speaker cannot play the configured format, using its default"
                );
                device
                    .default_output_config()
                    .map_err(|e| ChuzziError::Device(format!("cannot open speaker: {e}")))?
            }
        };
        let config = supported.config();
        let mixer = Arc::new(Mutex::new(VoiceMixer::new(
            config.sample_rate.0,
            config.channels,
        )));

        let stream = match supported.sample_format() {
            SampleFormat::F32 => output_stream::<f32>(&device, &config, mixer.clone()),
            SampleFormat::I16 => output_stream::<i16>(&device, &config, mixer.clone()),
            SampleFormat::U16 => output_stream::<u16>(&device, &config, mixer.clone()),
            other => Err(ChuzziError::Device(format!(
                "unsupported speaker sample format {other:?}"
            ))),
        }?;
        stream
            .play()
            .map_err(|e| ChuzziError::Device(e.to_string()))?;

        info!(
            device = %device.name().unwrap_or_else(|_| "unknown".into()),
            sample_rate = config.sample_rate.0,
            channels = config.channels,
            "Speaker open"
        );
        Ok((stream, mixer, config.sample_rate.0, config.channels))
    }

    fn output_stream<T>(
        device: &cpal::Device,
        config: &StreamConfig,
        mixer: Arc<Mutex<VoiceMixer>>,
    ) -> Result<cpal::Stream>
    where
        T: SizedSample + FromSample<f32>,
    {
        let mut scratch = Vec::new();
        device
            .build_output_stream(
                config,
                move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                    scratch.resize(data.len(), 0.0f32);
                    mixer
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .render(&mut scratch);
                    for (out, sample) in data.iter_mut().zip(&scratch) {
                        *out = T::from_sample(*sample);
                    }
                },
                |err| warn!(error = %err, "Speaker stream error"),
                None,
            )
            .map_err(build_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(channels: u16, min_rate: u32, max_rate: u32) -> OutputRange {
        OutputRange {
            channels,
            min_rate,
            max_rate,
        }
    }

    #[test]
    fn test_preferred_output_matches_rate_and_channels() {
        let audio = AudioConfig::default();
        let ranges = [range(2, 8000, 96000), range(1, 44100, 48000), range(1, 8000, 48000)];
        assert_eq!(preferred_output(&ranges, &audio), Some(2));
    }

    #[test]
    fn test_preferred_output_none_falls_back() {
        let audio = AudioConfig {
            output_sample_rate: 24000,
            output_channels: 1,
            ..AudioConfig::default()
        };
        let ranges = [range(2, 44100, 48000), range(1, 44100, 44100)];
        assert_eq!(preferred_output(&ranges, &audio), None);
        assert_eq!(preferred_output(&[], &audio), None);
    }

    #[test]
    fn test_preferred_output_honors_configured_stereo() {
        let audio = AudioConfig {
            output_sample_rate: 48000,
            output_channels: 2,
            ..AudioConfig::default()
        };
        let ranges = [range(1, 48000, 48000), range(2, 48000, 48000)];
        assert_eq!(preferred_output(&ranges, &audio), Some(1));
    }
}
