//! Audio capture via cpal backend.
//!
//! # Design constraints
//!
//! The cpal input callback runs on an OS audio thread at elevated (TIME_CRITICAL on
//! Windows) priority. It **must not**:
//! - Allocate heap memory
//! - Block on a mutex or condvar
//! - Perform I/O
//!
//! Downmix, resample, and i16 quantization all happen inside the callback,
//! but only ever touch pre-allocated buffers owned by the closure — no new
//! allocation occurs once capture is running. The only write into shared
//! state is the ring buffer's lock-free `push`.
//!
//! # Threading note
//!
//! `cpal::Stream` is `!Send` on most platforms (COM on Windows, CoreAudio on macOS).
//! `AudioCapture` therefore must be created and dropped on the same thread.
//! The pipeline accomplishes this by calling `open_default` inside `spawn_blocking`.

pub mod device;
pub mod resample;

#[cfg(feature = "audio-cpal")]
use cpal::{
    traits::{DeviceTrait, StreamTrait},
    SampleFormat, SampleRate, Stream, StreamConfig,
};

use crate::{
    buffering::FrameProducer,
    error::{Error, Result},
};
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};
use tracing::{error, info, warn};

#[cfg(feature = "audio-cpal")]
use resample::RateConverter;

fn quantize_i16(samples: &[f32], out: &mut Vec<i16>) {
    out.clear();
    out.extend(samples.iter().map(|s| (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16));
}

/// Handle to an active audio capture stream.
///
/// **Not `Send`** — `cpal::Stream` is bound to its creation thread on Windows/macOS.
/// Create and drop this type on the same OS thread.
pub struct AudioCapture {
    /// Kept alive so the stream is not dropped prematurely.
    #[cfg(feature = "audio-cpal")]
    _stream: Stream,
    /// Shared flag — set to `false` to signal the callback to no-op.
    running: Arc<AtomicBool>,
    /// Actual capture sample rate reported by the device (Hz).
    pub sample_rate: u32,
    /// Count of short reads from the device, zero-padded to the expected
    /// chunk size to keep downstream frame-index arithmetic aligned.
    underruns: Arc<AtomicU64>,
}

impl AudioCapture {
    pub fn underrun_count(&self) -> u64 {
        self.underruns.load(Ordering::Relaxed)
    }

    /// Open an input device by preferred name, otherwise fall back to
    /// default input device and then first available device.
    ///
    /// `target_rate` and `chunk_frames` configure the resampler fed from the
    /// capture callback: mono f32 is resampled to `target_rate` Hz in
    /// `chunk_frames`-sized blocks, quantized to i16, then pushed into `producer`.
    #[cfg(feature = "audio-cpal")]
    pub fn open_with_preference(
        mut producer: FrameProducer,
        running: Arc<AtomicBool>,
        preferred_device_name: Option<&str>,
        target_rate: u32,
        chunk_frames: usize,
    ) -> Result<Self> {
        use cpal::traits::HostTrait;

        let host = cpal::default_host();
        let mut devices: Vec<(String, cpal::Device)> = host
            .input_devices()
            .map_err(|e| Error::AudioDevice(e.to_string()))?
            .enumerate()
            .map(|(idx, device)| {
                let name = device
                    .name()
                    .unwrap_or_else(|_| format!("Input Device {}", idx + 1));
                (name, device)
            })
            .collect();
        if devices.is_empty() {
            return Err(Error::NoDefaultInputDevice);
        }

        let default_name = host.default_input_device().and_then(|d| d.name().ok());
        let preferred_idx = preferred_device_name.and_then(|preferred| {
            devices
                .iter()
                .position(|(name, _)| name.as_str() == preferred)
        });
        let default_idx = default_name
            .as_deref()
            .and_then(|name| devices.iter().position(|(n, _)| n.as_str() == name));
        let best_non_loopback_idx = devices
            .iter()
            .enumerate()
            .filter(|(_, (name, _))| !device::is_loopback_like_name(name))
            .max_by_key(|(_, (name, _))| device::mic_preference_score(name))
            .map(|(idx, _)| idx);

        if preferred_device_name.is_some() && preferred_idx.is_none() {
            warn!(
                "preferred input device '{}' not found, falling back",
                preferred_device_name.unwrap_or_default()
            );
        }

        let selected_idx = if let Some(idx) = preferred_idx {
            if device::is_loopback_like_name(&devices[idx].0) {
                best_non_loopback_idx.unwrap_or(idx)
            } else {
                idx
            }
        } else if let Some(idx) = default_idx {
            if device::is_loopback_like_name(&devices[idx].0) {
                best_non_loopback_idx.unwrap_or(idx)
            } else {
                idx
            }
        } else if let Some(idx) = best_non_loopback_idx {
            warn!("no default input device, falling back to best available microphone input");
            idx
        } else {
            warn!("no default microphone input device, falling back to first available input");
            0
        };

        let (selected_name, device) = devices.swap_remove(selected_idx);

        info!(device = selected_name.as_str(), "opening input device");

        let supported = device
            .default_input_config()
            .map_err(|e| Error::AudioDevice(e.to_string()))?;

        let capture_rate = supported.sample_rate().0;
        let channels = supported.channels();

        info!(capture_rate, channels, target_rate, chunk_frames, "audio config selected");

        let config = StreamConfig {
            channels,
            sample_rate: SampleRate(capture_rate),
            buffer_size: cpal::BufferSize::Fixed(chunk_frames as u32),
        };

        let underruns = Arc::new(AtomicU64::new(0));

        let running_f32 = Arc::clone(&running);
        let running_i16 = Arc::clone(&running);
        let running_u8 = Arc::clone(&running);
        let underruns_f32 = Arc::clone(&underruns);
        let underruns_i16 = Arc::clone(&underruns);
        let underruns_u8 = Arc::clone(&underruns);

        let resampler = RateConverter::new(capture_rate, target_rate, chunk_frames)
            .map_err(|e| Error::AudioDevice(format!("resampler init: {e}")))?;

        let stream = match supported.sample_format() {
            SampleFormat::F32 => {
                let ch = channels as usize;
                let mut mix_buf: Vec<f32> = Vec::with_capacity(chunk_frames);
                let mut i16_buf: Vec<i16> = Vec::with_capacity(chunk_frames);
                let mut rc = resampler;
                device.build_input_stream(
                    &config,
                    move |data: &[f32], _info| {
                        if !running_f32.load(Ordering::Relaxed) {
                            return;
                        }
                        downmix_into(data, ch, chunk_frames, &mut mix_buf, &underruns_f32);
                        let out = rc.process(&mix_buf);
                        quantize_i16(&out, &mut i16_buf);
                        push_and_warn(&mut producer, &i16_buf);
                    },
                    |err| error!("audio stream error: {err}"),
                    None,
                )
            }

            SampleFormat::I16 => {
                let ch = channels as usize;
                let mut mix_buf: Vec<f32> = Vec::with_capacity(chunk_frames);
                let mut i16_buf: Vec<i16> = Vec::with_capacity(chunk_frames);
                let mut rc = resampler;
                device.build_input_stream(
                    &config,
                    move |data: &[i16], _info| {
                        if !running_i16.load(Ordering::Relaxed) {
                            return;
                        }
                        let frames = data.len() / ch;
                        mix_buf.resize(frames, 0.0);
                        if ch == 1 {
                            for (idx, sample) in data.iter().take(frames).enumerate() {
                                mix_buf[idx] = *sample as f32 / 32768.0;
                            }
                        } else {
                            for f in 0..frames {
                                let mut sum = 0f32;
                                let base = f * ch;
                                for c in 0..ch {
                                    sum += data[base + c] as f32 / 32768.0;
                                }
                                mix_buf[f] = sum / ch as f32;
                            }
                        }
                        if frames < chunk_frames {
                            underruns_i16.fetch_add(1, Ordering::Relaxed);
                            mix_buf.resize(chunk_frames, 0.0);
                        }
                        let out = rc.process(&mix_buf);
                        quantize_i16(&out, &mut i16_buf);
                        push_and_warn(&mut producer, &i16_buf);
                    },
                    |err| error!("audio stream error: {err}"),
                    None,
                )
            }

            SampleFormat::U8 => {
                let ch = channels as usize;
                let mut mix_buf: Vec<f32> = Vec::with_capacity(chunk_frames);
                let mut i16_buf: Vec<i16> = Vec::with_capacity(chunk_frames);
                let mut rc = resampler;
                device.build_input_stream(
                    &config,
                    move |data: &[u8], _info| {
                        if !running_u8.load(Ordering::Relaxed) {
                            return;
                        }
                        let frames = data.len() / ch;
                        mix_buf.resize(frames, 0.0);
                        if ch == 1 {
                            for (idx, sample) in data.iter().take(frames).enumerate() {
                                mix_buf[idx] = (*sample as f32 - 128.0) / 128.0;
                            }
                        } else {
                            for f in 0..frames {
                                let mut sum = 0f32;
                                let base = f * ch;
                                for c in 0..ch {
                                    sum += (data[base + c] as f32 - 128.0) / 128.0;
                                }
                                mix_buf[f] = sum / ch as f32;
                            }
                        }
                        if frames < chunk_frames {
                            underruns_u8.fetch_add(1, Ordering::Relaxed);
                            mix_buf.resize(chunk_frames, 0.0);
                        }
                        let out = rc.process(&mix_buf);
                        quantize_i16(&out, &mut i16_buf);
                        push_and_warn(&mut producer, &i16_buf);
                    },
                    |err| error!("audio stream error: {err}"),
                    None,
                )
            }

            fmt => {
                return Err(Error::AudioStream(format!(
                    "unsupported sample format: {fmt:?}"
                )))
            }
        }
        .map_err(|e| Error::AudioStream(e.to_string()))?;

        stream.play().map_err(|e| Error::AudioStream(e.to_string()))?;

        Ok(Self {
            _stream: stream,
            running,
            sample_rate: target_rate,
            underruns,
        })
    }

    /// Open the system default microphone and push i16 PCM frames at
    /// `target_rate` Hz into `producer`.
    ///
    /// Must be called from the thread that will also drop this value.
    /// In practice this means calling it inside `tokio::task::spawn_blocking`.
    ///
    /// # Errors
    /// Returns `Error::NoDefaultInputDevice` when no microphone is available,
    /// or `Error::AudioStream` if cpal fails to build the stream.
    #[cfg(feature = "audio-cpal")]
    pub fn open_default(
        producer: FrameProducer,
        running: Arc<AtomicBool>,
        target_rate: u32,
        chunk_frames: usize,
    ) -> Result<Self> {
        Self::open_with_preference(producer, running, None, target_rate, chunk_frames)
    }

    /// Stop: signal the callback to no-op on its next invocation.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }
}

/// Downmix an f32 interleaved buffer to mono, zero-padding to `expected_frames`
/// if the device delivered a short read (counted as a device underrun).
#[cfg(feature = "audio-cpal")]
fn downmix_into(
    data: &[f32],
    channels: usize,
    expected_frames: usize,
    out: &mut Vec<f32>,
    underruns: &AtomicU64,
) {
    let frames = data.len() / channels;
    out.resize(frames, 0.0);
    if channels == 1 {
        out.copy_from_slice(&data[..frames]);
    } else {
        for f in 0..frames {
            let base = f * channels;
            let sum: f32 = data[base..base + channels].iter().sum();
            out[f] = sum / channels as f32;
        }
    }
    if frames < expected_frames {
        underruns.fetch_add(1, Ordering::Relaxed);
        out.resize(expected_frames, 0.0);
    }
}

#[cfg(feature = "audio-cpal")]
fn push_and_warn(producer: &mut FrameProducer, samples: &[i16]) {
    let lost = producer.push(samples);
    if lost > 0 {
        warn!("ring buffer full: dropped {lost} samples");
    }
}

/// Stub when the `audio-cpal` feature is disabled.
#[cfg(not(feature = "audio-cpal"))]
impl AudioCapture {
    pub fn open_with_preference(
        _producer: FrameProducer,
        _running: Arc<AtomicBool>,
        _preferred_device_name: Option<&str>,
        _target_rate: u32,
        _chunk_frames: usize,
    ) -> Result<Self> {
        Err(Error::AudioStream(
            "compiled without audio-cpal feature".into(),
        ))
    }

    pub fn open_default(
        producer: FrameProducer,
        running: Arc<AtomicBool>,
        target_rate: u32,
        chunk_frames: usize,
    ) -> Result<Self> {
        Self::open_with_preference(producer, running, None, target_rate, chunk_frames)
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }
}
