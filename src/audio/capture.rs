use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use hound::{WavSpec, WavWriter};
use ringbuf::{
    traits::{Consumer, Observer, Producer, Split},
    HeapCons, HeapRb,
};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::AudioConfig;

/// Fixed capture format: everything downstream works on 16 kHz mono
pub const TARGET_SAMPLE_RATE: u32 = 16_000;

/// Level meter window: power is clamped to [-60 dB, 0 dB] then normalized
const METER_MIN_DB: f32 = -60.0;
const METER_MAX_DB: f32 = 0.0;

/// Handle to one captured utterance on disk
///
/// Owned by the recording session from capture start until it returns to
/// idle; the model runtime only ever reads the file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioHandle {
    /// Path of the temporary WAV file
    pub path: PathBuf,
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
}

impl AudioHandle {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            sample_rate: TARGET_SAMPLE_RATE,
            channels: 1,
            bits_per_sample: 16,
        }
    }
}

/// Capture errors
#[derive(Debug, Error)]
pub enum CaptureError {
    /// The microphone stream could not be started
    #[error("failed to start recording: {0}")]
    StartFailed(String),
}

/// Live level consumer; receives one value in [0, 1] per meter tick
pub type LevelCallback = Arc<dyn Fn(f32) + Send + Sync>;

/// Microphone capture as the session sees it
#[cfg_attr(test, mockall::automock)]
pub trait AudioInput: Send {
    /// Begin capturing; returns the handle of the utterance being recorded
    ///
    /// # Errors
    /// Returns [`CaptureError::StartFailed`] if the stream cannot be resumed
    /// or a capture is already active.
    fn start_recording(&mut self) -> Result<AudioHandle, CaptureError>;

    /// Stop capturing and finalize the WAV file; `None` if nothing was
    /// recording or the file could not be written
    fn stop_recording(&mut self) -> Option<AudioHandle>;

    /// Stop any active capture and delete the temporary file; idempotent
    ///
    /// This is the one path that runs on every exit, so callers invoke it
    /// unconditionally when abandoning a capture.
    fn cleanup(&mut self);
}

/// Trait for controlling audio stream lifecycle
trait StreamControl: Send {
    /// Resume audio stream (activate microphone)
    fn play(&self) -> Result<(), String>;
    /// Pause audio stream (deactivate microphone)
    fn pause(&self) -> Result<(), String>;
}

/// CPAL stream wrapper implementing `StreamControl`
struct CpalStreamControl {
    stream: cpal::Stream,
}

impl StreamControl for CpalStreamControl {
    fn play(&self) -> Result<(), String> {
        self.stream.play().map_err(|e| e.to_string())
    }

    fn pause(&self) -> Result<(), String> {
        self.stream.pause().map_err(|e| e.to_string())
    }
}

// SAFETY: the stream handle is only ever touched from the capture owner's
// thread; cpal streams are !Send purely as an Android restriction.
#[allow(unsafe_code)]
unsafe impl Send for CpalStreamControl {}

/// Drain thread state for one in-flight take
struct ActiveTake {
    drain: std::thread::JoinHandle<(Vec<f32>, HeapCons<f32>)>,
}

/// Audio capture via CPAL with a lock-free ring buffer handoff
///
/// The stream is built once and kept paused; recording toggles it. A drain
/// thread empties the ring buffer on the meter cadence, feeding the level
/// callback and accumulating the raw take, which is resampled to 16 kHz
/// mono and written as 16-bit PCM on stop.
pub struct CpalAudioCapture {
    stream_control: Option<Box<dyn StreamControl>>,
    /// Ring buffer consumer; absent while the drain thread owns it
    consumer: Option<HeapCons<f32>>,
    is_recording: Arc<AtomicBool>,
    device_sample_rate: u32,
    device_channels: u16,
    meter_interval: Duration,
    level_callback: LevelCallback,
    temp_dir: PathBuf,
    active: Option<ActiveTake>,
    /// Path of the current utterance; deleted by `cleanup()`
    current_path: Option<PathBuf>,
}

impl CpalAudioCapture {
    /// Open the default input device and build a paused stream
    ///
    /// # Errors
    /// Returns [`CaptureError::StartFailed`] if no input device is available
    /// or the stream cannot be created.
    pub fn new(
        config: &AudioConfig,
        temp_dir: PathBuf,
        level_callback: LevelCallback,
    ) -> Result<Self, CaptureError> {
        info!("initializing audio capture");

        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or_else(|| CaptureError::StartFailed("no input device available".to_owned()))?;

        let device_name = device.name().unwrap_or_else(|_| "unknown".to_owned());
        info!("using input device: {}", device_name);

        let supported_config = device
            .default_input_config()
            .map_err(|e| CaptureError::StartFailed(format!("no default input config: {e}")))?;

        let device_sample_rate = supported_config.sample_rate();
        let device_channels = supported_config.channels();

        info!(
            "device config: {} Hz, {} channels",
            device_sample_rate, device_channels
        );

        // The drain thread empties the buffer every meter tick, so two
        // seconds of headroom is plenty
        let ring_buffer_capacity =
            (device_sample_rate as usize) * (device_channels as usize) * 2;
        let ring_buffer = HeapRb::<f32>::new(ring_buffer_capacity);
        let (ring_buffer_producer, ring_buffer_consumer) = ring_buffer.split();

        let is_recording = Arc::new(AtomicBool::new(false));

        let is_recording_clone = Arc::clone(&is_recording);
        let mut producer = ring_buffer_producer;

        let stream_config = supported_config.into();
        let stream = device
            .build_input_stream(
                &stream_config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    if is_recording_clone.load(Ordering::Relaxed) {
                        // Lock-free push to ring buffer
                        let pushed = producer.push_slice(data);
                        if pushed < data.len() {
                            warn!("ring buffer full, dropped {} samples", data.len() - pushed);
                        }
                    }
                },
                move |err| {
                    warn!("audio stream error: {}", err);
                },
                None,
            )
            .map_err(|e| CaptureError::StartFailed(format!("failed to build input stream: {e}")))?;

        let stream_control = CpalStreamControl { stream };

        // Start the stream and immediately pause it (mic inactive until the
        // hotkey is pressed)
        stream_control
            .play()
            .and_then(|()| stream_control.pause())
            .map_err(CaptureError::StartFailed)?;
        info!("audio stream initialized (paused)");

        Ok(Self {
            stream_control: Some(Box::new(stream_control)),
            consumer: Some(ring_buffer_consumer),
            is_recording,
            device_sample_rate,
            device_channels,
            meter_interval: Duration::from_millis(config.meter_interval_ms),
            level_callback,
            temp_dir,
            active: None,
            current_path: None,
        })
    }

    fn unique_recording_path(&self) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_nanos());
        self.temp_dir.join(format!("recording_{nanos}.wav"))
    }

    fn spawn_drain_thread(&self, mut consumer: HeapCons<f32>) -> ActiveTake {
        let is_recording = Arc::clone(&self.is_recording);
        let level_callback = Arc::clone(&self.level_callback);
        let interval = self.meter_interval;

        let drain = std::thread::spawn(move || {
            let mut take: Vec<f32> = Vec::new();
            loop {
                std::thread::sleep(interval);

                let mut tick: Vec<f32> = Vec::with_capacity(consumer.occupied_len());
                while let Some(sample) = consumer.try_pop() {
                    tick.push(sample);
                }

                let still_recording = is_recording.load(Ordering::Relaxed);
                if still_recording {
                    level_callback(level_from_samples(&tick));
                }
                take.extend_from_slice(&tick);

                if !still_recording {
                    // Flag cleared: this pass already drained the stragglers
                    break;
                }
            }
            (take, consumer)
        });

        ActiveTake { drain }
    }

    /// Join the drain thread, restore the consumer, return the raw take
    fn finish_take(&mut self, take: ActiveTake) -> Vec<f32> {
        self.is_recording.store(false, Ordering::Relaxed);

        if let Some(stream_control) = &self.stream_control {
            if let Err(e) = stream_control.pause() {
                warn!("failed to pause audio stream: {e}");
            }
        }

        match take.drain.join() {
            Ok((samples, consumer)) => {
                self.consumer = Some(consumer);
                samples
            }
            Err(_) => {
                warn!("drain thread panicked, take lost");
                Vec::new()
            }
        }
    }
}

impl AudioInput for CpalAudioCapture {
    fn start_recording(&mut self) -> Result<AudioHandle, CaptureError> {
        debug!("starting recording");

        if self.active.is_some() {
            return Err(CaptureError::StartFailed("capture already active".to_owned()));
        }

        let mut consumer = self
            .consumer
            .take()
            .ok_or_else(|| CaptureError::StartFailed("ring buffer unavailable".to_owned()))?;
        consumer.clear();

        // Set recording flag BEFORE resuming the stream to avoid a race with
        // the input callback
        self.is_recording.store(true, Ordering::Relaxed);

        if let Some(stream_control) = &self.stream_control {
            if let Err(e) = stream_control.play() {
                self.is_recording.store(false, Ordering::Relaxed);
                self.consumer = Some(consumer);
                return Err(CaptureError::StartFailed(e));
            }
        }

        let path = self.unique_recording_path();
        let handle = AudioHandle::new(path.clone());
        self.current_path = Some(path);
        self.active = Some(self.spawn_drain_thread(consumer));

        info!(path = %handle.path.display(), "recording started");
        Ok(handle)
    }

    fn stop_recording(&mut self) -> Option<AudioHandle> {
        let take = self.active.take()?;
        let raw = self.finish_take(take);

        let mono = downmix_to_mono(&raw, self.device_channels);
        let samples =
            resample_linear(&mono, self.device_sample_rate, TARGET_SAMPLE_RATE);

        let path = self.current_path.clone()?;
        if let Some(parent) = path.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                warn!("failed to create recording directory: {e}");
                return None;
            }
        }

        match write_wav_16bit_mono(&samples, &path) {
            Ok(()) => {
                info!(
                    samples = samples.len(),
                    path = %path.display(),
                    "recording stopped"
                );
                Some(AudioHandle::new(path))
            }
            Err(e) => {
                warn!("failed to write recording: {e}");
                None
            }
        }
    }

    fn cleanup(&mut self) {
        if let Some(take) = self.active.take() {
            let _ = self.finish_take(take);
        }

        if let Some(path) = self.current_path.take() {
            if path.exists() {
                if let Err(e) = std::fs::remove_file(&path) {
                    warn!("failed to delete recording {}: {e}", path.display());
                } else {
                    debug!("deleted recording {}", path.display());
                }
            }
        }
    }
}

/// Average channels into a mono signal
fn downmix_to_mono(samples: &[f32], channels: u16) -> Vec<f32> {
    if channels <= 1 {
        return samples.to_vec();
    }

    let channels_f64 = f64::from(channels);
    samples
        .chunks(channels as usize)
        .map(|frame| {
            let sum: f64 = frame.iter().map(|&s| f64::from(s)).sum();
            // f64 → f32: audio samples are stored as f32, precision sufficient
            #[allow(clippy::cast_possible_truncation)]
            {
                (sum / channels_f64) as f32
            }
        })
        .collect()
}

/// Linear-interpolation resampling between arbitrary rates
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
fn resample_linear(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || samples.is_empty() {
        return samples.to_vec();
    }

    let ratio = f64::from(from_rate) / f64::from(to_rate);
    let output_len_f64 = (samples.len() as f64) / ratio;
    let output_len = if output_len_f64.is_finite() && output_len_f64 >= 0.0 {
        output_len_f64.ceil() as usize
    } else {
        samples.len()
    };

    let mut resampled = Vec::with_capacity(output_len);
    for i in 0..output_len {
        let src_idx_f64 = (i as f64) * ratio;

        let src_idx_floor = if src_idx_f64 >= 0.0 && src_idx_f64 < (usize::MAX as f64) {
            src_idx_f64.floor() as usize
        } else {
            0
        };
        let src_idx_ceil = (src_idx_floor + 1).min(samples.len().saturating_sub(1));
        let fract = src_idx_f64 - src_idx_f64.floor();

        let sample = if src_idx_floor < samples.len() {
            let s1 = f64::from(samples[src_idx_floor]);
            let s2 = f64::from(samples[src_idx_ceil]);
            s1.mul_add(1.0 - fract, s2 * fract) as f32
        } else {
            0.0_f32
        };
        resampled.push(sample);
    }

    resampled
}

/// Normalized level of one meter window
///
/// Mean signal power in dB, clamped to the meter window and mapped linearly
/// onto [0, 1]; an empty window reads as silence.
#[must_use]
pub fn level_from_samples(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }

    let mean_square = samples
        .iter()
        .map(|&s| f64::from(s) * f64::from(s))
        .sum::<f64>()
        / samples.len() as f64;

    // Power in dBFS; -inf for digital silence, clamped below
    #[allow(clippy::cast_possible_truncation)]
    let db = (10.0 * mean_square.log10()) as f32;
    let clamped = db.clamp(METER_MIN_DB, METER_MAX_DB);
    (clamped - METER_MIN_DB) / (METER_MAX_DB - METER_MIN_DB)
}

/// Write 16 kHz mono f32 samples as 16-bit PCM
fn write_wav_16bit_mono(samples: &[f32], path: &Path) -> Result<(), hound::Error> {
    let spec = WavSpec {
        channels: 1,
        sample_rate: TARGET_SAMPLE_RATE,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut writer = WavWriter::create(path, spec)?;
    for &sample in samples {
        #[allow(clippy::cast_possible_truncation)]
        let quantized = (sample.clamp(-1.0, 1.0) * f32::from(i16::MAX)) as i16;
        writer.write_sample(quantized)?;
    }
    writer.finalize()
}
