//! Recognizer backends behind the [`RecognizerLoader`] seam.
//!
//! The runtime never constructs a backend directly; it asks the injected
//! loader, so tests substitute scripted recognizers without model files.

use std::path::Path;
use thiserror::Error;
use whisper_rs::{FullParams, SamplingStrategy, WhisperContext, WhisperContextParameters};

use crate::model::catalog::{ModelDescriptor, ModelFamily};

/// Errors from model lookup, loading and decoding
#[derive(Debug, Error)]
pub enum ModelError {
    /// The id is not in the catalog
    #[error("unknown model id: {0}")]
    UnknownModel(String),

    /// `transcribe` was called before a successful `load_model`
    #[error("no transcription model is loaded")]
    NotLoaded,

    /// A required model file is missing; names the first one found missing
    #[error("model file not found: {}", .0.display())]
    ModelNotFound(std::path::PathBuf),

    /// Backend construction failed after file validation passed
    #[error("failed to create recognizer: {0}")]
    RecognizerInit(String),

    /// The captured WAV could not be read
    #[error("failed to read audio file {path}: {source}")]
    AudioRead {
        path: std::path::PathBuf,
        #[source]
        source: hound::Error,
    },

    /// Inference failed
    #[error("decode failed: {0}")]
    DecodeFailed(String),
}

/// A loaded model able to decode one span of 16 kHz mono samples
pub trait Recognizer: Send {
    /// Decode samples to text; whitespace-trimmed, may be empty
    ///
    /// # Errors
    /// Returns [`ModelError::DecodeFailed`] if inference fails.
    fn decode(&mut self, samples: &[f32]) -> Result<String, ModelError>;
}

/// Factory turning a validated model directory into a recognizer
pub trait RecognizerLoader: Send + Sync {
    /// Build a recognizer for `descriptor` from `dir`
    ///
    /// # Errors
    /// Returns [`ModelError::RecognizerInit`] if the backend rejects the
    /// model files.
    fn load(
        &self,
        descriptor: &ModelDescriptor,
        dir: &Path,
        language: Option<&str>,
    ) -> Result<Box<dyn Recognizer>, ModelError>;
}

/// Whisper backend via whisper.cpp bindings
pub struct WhisperRecognizer {
    ctx: WhisperContext,
    threads: i32,
    beam_size: i32,
    language: Option<String>,
}

impl WhisperRecognizer {
    /// Determines sampling strategy based on beam size (pure, testable)
    const fn sampling_strategy(beam_size: i32) -> SamplingStrategy {
        if beam_size > 1 {
            SamplingStrategy::BeamSearch {
                beam_size,
                patience: -1.0,
            }
        } else {
            SamplingStrategy::Greedy { best_of: 1 }
        }
    }

    /// Load the ggml container at `weights`
    ///
    /// # Errors
    /// Returns [`ModelError::RecognizerInit`] on invalid parameters or if
    /// whisper.cpp rejects the file.
    pub fn load(
        weights: &Path,
        threads: usize,
        beam_size: usize,
        language: Option<&str>,
    ) -> Result<Self, ModelError> {
        if threads == 0 {
            return Err(ModelError::RecognizerInit("threads must be > 0".to_owned()));
        }
        if beam_size == 0 {
            return Err(ModelError::RecognizerInit(
                "beam_size must be > 0".to_owned(),
            ));
        }

        // whisper-rs takes i32 for both
        let threads_i32 = i32::try_from(threads)
            .map_err(|_| ModelError::RecognizerInit(format!("threads value too large (max: {})", i32::MAX)))?;
        let beam_size_i32 = i32::try_from(beam_size)
            .map_err(|_| ModelError::RecognizerInit(format!("beam_size value too large (max: {})", i32::MAX)))?;

        let path_str = weights
            .to_str()
            .ok_or_else(|| ModelError::RecognizerInit("model path contains invalid UTF-8".to_owned()))?;

        tracing::info!(
            path = %weights.display(),
            threads = threads,
            beam_size = beam_size,
            language = ?language,
            "loading whisper model"
        );

        let params = WhisperContextParameters::default();
        let ctx = WhisperContext::new_with_params(path_str, params)
            .map_err(|e| ModelError::RecognizerInit(format!("{e:?}")))?;

        tracing::info!("whisper model loaded");

        Ok(Self {
            ctx,
            threads: threads_i32,
            beam_size: beam_size_i32,
            language: language.map(str::to_owned),
        })
    }
}

impl Recognizer for WhisperRecognizer {
    fn decode(&mut self, samples: &[f32]) -> Result<String, ModelError> {
        let _span = tracing::debug_span!("whisper_decode", samples = samples.len()).entered();

        let mut state = self
            .ctx
            .create_state()
            .map_err(|e| ModelError::DecodeFailed(format!("failed to create state: {e:?}")))?;

        let strategy = Self::sampling_strategy(self.beam_size);
        let mut params = FullParams::new(strategy);
        params.set_n_threads(self.threads);
        params.set_print_special(false);
        params.set_print_progress(false);
        params.set_print_realtime(false);
        params.set_print_timestamps(false);
        params.set_language(self.language.as_deref());
        params.set_translate(false);

        let start = std::time::Instant::now();
        state
            .full(params, samples)
            .map_err(|e| ModelError::DecodeFailed(format!("{e:?}")))?;
        let inference_duration = start.elapsed();

        let mut result = String::new();
        for segment in state.as_iter() {
            result.push_str(&segment.to_string());
        }
        let result = result.trim().to_owned();

        tracing::info!(
            segments = state.full_n_segments(),
            text_len = result.len(),
            inference_ms = inference_duration.as_millis(),
            "whisper decode completed"
        );

        Ok(result)
    }
}

// SAFETY: the context is only accessed through &mut self, so the runtime's
// mutex gives exclusive access; whisper-rs contexts are safe to move between
// threads when access is synchronized.
#[allow(unsafe_code)]
unsafe impl Send for WhisperRecognizer {}

/// NeMo transducer backend via transcribe-rs
pub struct ParakeetRecognizer {
    engine: transcribe_rs::engines::parakeet::ParakeetEngine,
}

impl ParakeetRecognizer {
    /// Load the transducer model directory (encoder/decoder/joiner/tokens)
    ///
    /// # Errors
    /// Returns [`ModelError::RecognizerInit`] if the engine rejects the
    /// directory.
    pub fn load(dir: &Path) -> Result<Self, ModelError> {
        use transcribe_rs::engines::parakeet::{ParakeetEngine, ParakeetModelParams};
        use transcribe_rs::TranscriptionEngine;

        tracing::info!(dir = %dir.display(), "loading parakeet model");

        let mut engine = ParakeetEngine::new();
        engine
            .load_model_with_params(dir, ParakeetModelParams::int8())
            .map_err(|e| ModelError::RecognizerInit(e.to_string()))?;

        tracing::info!("parakeet model loaded");
        Ok(Self { engine })
    }
}

impl Recognizer for ParakeetRecognizer {
    fn decode(&mut self, samples: &[f32]) -> Result<String, ModelError> {
        use transcribe_rs::TranscriptionEngine;

        let _span = tracing::debug_span!("parakeet_decode", samples = samples.len()).entered();

        let result = self
            .engine
            .transcribe_samples(samples.to_vec(), None)
            .map_err(|e| ModelError::DecodeFailed(e.to_string()))?;

        Ok(result.text.trim().to_owned())
    }
}

/// Production loader dispatching on the model family
pub struct NativeRecognizerLoader {
    pub threads: usize,
    pub beam_size: usize,
}

impl RecognizerLoader for NativeRecognizerLoader {
    fn load(
        &self,
        descriptor: &ModelDescriptor,
        dir: &Path,
        language: Option<&str>,
    ) -> Result<Box<dyn Recognizer>, ModelError> {
        match descriptor.family {
            ModelFamily::Whisper => {
                let weights_name = descriptor.required_files.first().ok_or_else(|| {
                    ModelError::RecognizerInit(format!(
                        "model {} has no required files",
                        descriptor.id
                    ))
                })?;
                let weights = dir.join(weights_name);
                Ok(Box::new(WhisperRecognizer::load(
                    &weights,
                    self.threads,
                    self.beam_size,
                    language,
                )?))
            }
            ModelFamily::Transducer => Ok(Box::new(ParakeetRecognizer::load(dir)?)),
        }
    }
}
