//! Push-to-talk local dictation pipeline.
//!
//! Hold a global hotkey to capture microphone audio, transcribe it with a
//! locally-resident model, and deliver the text to the active application.

/// Audio capture and level metering
pub mod audio;
/// Configuration management
pub mod config;
/// Transcript phrase corrections
pub mod corrections;
/// Global hotkey observation and edge detection
pub mod input;
/// Model catalog, acquisition and runtime
pub mod model;
/// Text delivery sinks
pub mod output;
/// OS input-permission probing
pub mod permissions;
/// The recording/transcription state machine
pub mod session;
/// Tracing initialization
pub mod telemetry;
