/// Microphone capture and level metering
pub mod capture;

pub use capture::{AudioHandle, AudioInput, CaptureError, CpalAudioCapture, TARGET_SAMPLE_RATE};
