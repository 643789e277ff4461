//! Loaded-model state and the chunked decode-and-merge path.

use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use tracing::{debug, info};

use crate::audio::AudioHandle;
use crate::model::catalog;
use crate::model::engine::{ModelError, Recognizer, RecognizerLoader};

/// Chunking parameters for long utterances
///
/// Whisper's context window is 30 s; decoding in 25 s chunks with 1 s of
/// trailing overlap keeps each chunk inside it while giving the join
/// heuristic shared words to deduplicate.
#[derive(Debug, Clone, Copy)]
pub struct ChunkPolicy {
    /// Maximum chunk length in seconds; audio at or under this decodes once
    pub max_chunk_secs: f64,
    /// Overlap carried into the next chunk, in seconds
    pub overlap_secs: f64,
    /// Longest word overlap considered by the join heuristic
    pub max_join_overlap_words: usize,
}

impl Default for ChunkPolicy {
    fn default() -> Self {
        Self {
            max_chunk_secs: 25.0,
            overlap_secs: 1.0,
            max_join_overlap_words: 5,
        }
    }
}

/// Snapshot of the runtime's loaded-model state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeState {
    pub loaded_model_id: Option<String>,
    pub loaded_language: Option<String>,
    pub is_loading: bool,
}

struct LoadedModel {
    id: String,
    language: Option<String>,
    recognizer: Box<dyn Recognizer>,
}

/// Owns the loaded recognizer; the session only calls through the contract
pub struct ModelRuntime {
    models_root: PathBuf,
    loader: Box<dyn RecognizerLoader>,
    chunking: ChunkPolicy,
    loaded: Mutex<Option<LoadedModel>>,
    is_loading: AtomicBool,
}

impl ModelRuntime {
    #[must_use]
    pub fn new(
        models_root: PathBuf,
        loader: Box<dyn RecognizerLoader>,
        chunking: ChunkPolicy,
    ) -> Self {
        Self {
            models_root,
            loader,
            chunking,
            loaded: Mutex::new(None),
            is_loading: AtomicBool::new(false),
        }
    }

    /// Load `(id, language)`, a no-op if that exact pair is already loaded
    ///
    /// Validates every required file for the model family before touching
    /// the backend; the first missing file is named in the error.
    ///
    /// # Errors
    /// [`ModelError::UnknownModel`], [`ModelError::ModelNotFound`] or
    /// [`ModelError::RecognizerInit`].
    pub fn load_model(&self, id: &str, language: Option<&str>) -> Result<(), ModelError> {
        let descriptor =
            catalog::find(id).ok_or_else(|| ModelError::UnknownModel(id.to_owned()))?;

        {
            let loaded = self.loaded.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(model) = loaded.as_ref() {
                if model.id == id && model.language.as_deref() == language {
                    debug!(id, ?language, "model already loaded");
                    return Ok(());
                }
            }
        }

        self.is_loading.store(true, Ordering::SeqCst);
        let result = self.load_model_inner(descriptor, id, language);
        self.is_loading.store(false, Ordering::SeqCst);
        result
    }

    fn load_model_inner(
        &self,
        descriptor: &catalog::ModelDescriptor,
        id: &str,
        language: Option<&str>,
    ) -> Result<(), ModelError> {
        let dir = descriptor.directory(&self.models_root);
        for file in descriptor.required_files {
            let path = dir.join(file);
            if !path.exists() {
                return Err(ModelError::ModelNotFound(path));
            }
        }

        info!(id, ?language, dir = %dir.display(), "loading model");

        // Drop the previous model before the backend allocates the new one
        self.unload_model();

        let recognizer = self.loader.load(descriptor, &dir, language)?;

        let mut loaded = self.loaded.lock().unwrap_or_else(PoisonError::into_inner);
        *loaded = Some(LoadedModel {
            id: id.to_owned(),
            language: language.map(str::to_owned),
            recognizer,
        });

        info!(id, "model loaded");
        Ok(())
    }

    /// Drop the loaded model; always succeeds, even with nothing loaded
    pub fn unload_model(&self) {
        let mut loaded = self.loaded.lock().unwrap_or_else(PoisonError::into_inner);
        if loaded.take().is_some() {
            info!("model unloaded");
        }
    }

    /// Current loaded-model snapshot
    pub fn state(&self) -> RuntimeState {
        let loaded = self.loaded.lock().unwrap_or_else(PoisonError::into_inner);
        RuntimeState {
            loaded_model_id: loaded.as_ref().map(|m| m.id.clone()),
            loaded_language: loaded.as_ref().and_then(|m| m.language.clone()),
            is_loading: self.is_loading.load(Ordering::SeqCst),
        }
    }

    /// Transcribe a captured utterance; `None` means no speech was decoded
    ///
    /// Short audio decodes in one call; anything longer than the chunk limit
    /// is decoded in overlapping chunks and joined by the word-overlap
    /// heuristic.
    ///
    /// # Errors
    /// [`ModelError::NotLoaded`], [`ModelError::AudioRead`] or
    /// [`ModelError::DecodeFailed`].
    pub fn transcribe(&self, audio: &AudioHandle) -> Result<Option<String>, ModelError> {
        let mut loaded = self.loaded.lock().unwrap_or_else(PoisonError::into_inner);
        let model = loaded.as_mut().ok_or(ModelError::NotLoaded)?;

        let (samples, sample_rate) = read_wav(&audio.path)?;
        if samples.is_empty() {
            debug!("audio file is empty");
            return Ok(None);
        }

        #[allow(clippy::cast_precision_loss)]
        let duration_secs = samples.len() as f64 / f64::from(sample_rate);
        debug!(
            samples = samples.len(),
            sample_rate,
            duration_secs,
            "transcribing"
        );

        if duration_secs <= self.chunking.max_chunk_secs {
            let text = model.recognizer.decode(&samples)?;
            let text = text.trim();
            return Ok(if text.is_empty() {
                None
            } else {
                Some(text.to_owned())
            });
        }

        let spans = chunk_spans(samples.len(), sample_rate, &self.chunking);
        let mut transcripts: Vec<String> = Vec::with_capacity(spans.len());
        for (index, span) in spans.iter().enumerate() {
            #[allow(clippy::cast_precision_loss)]
            let chunk_secs = span.len() as f64 / f64::from(sample_rate);
            debug!(chunk = index + 1, chunks = spans.len(), chunk_secs, "decoding chunk");

            let text = model.recognizer.decode(&samples[span.clone()])?;
            let text = text.trim();
            if !text.is_empty() {
                transcripts.push(text.to_owned());
            }
        }

        if transcripts.is_empty() {
            return Ok(None);
        }

        let joined =
            join_chunk_transcripts(&transcripts, self.chunking.max_join_overlap_words);
        let joined = joined.trim();
        info!(chunks = spans.len(), text_len = joined.len(), "chunked decode complete");
        Ok(if joined.is_empty() {
            None
        } else {
            Some(joined.to_owned())
        })
    }
}

/// Chunk boundaries: fixed-size windows where each successive chunk starts
/// one overlap before the previous chunk's end
fn chunk_spans(total_samples: usize, sample_rate: u32, policy: &ChunkPolicy) -> Vec<Range<usize>> {
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let chunk = (policy.max_chunk_secs * f64::from(sample_rate)) as usize;
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let overlap = (policy.overlap_secs * f64::from(sample_rate)) as usize;

    let mut spans = Vec::new();
    let mut start = 0_usize;
    loop {
        let end = (start + chunk).min(total_samples);
        spans.push(start..end);
        if end >= total_samples {
            break;
        }
        start = end.saturating_sub(overlap);
    }
    spans
}

/// Join chunk transcripts, deduplicating words shared across the overlap
///
/// For each adjacent pair the largest `n <= max_overlap_words` is found where
/// the previous chunk's last `n` words case-insensitively equal the next
/// chunk's first `n`; those words are dropped from the next chunk. With no
/// match, chunks are joined with a single space. There is no timestamp
/// alignment: a genuinely repeated phrase spanning a boundary merges into one
/// occurrence (see tests).
fn join_chunk_transcripts(transcripts: &[String], max_overlap_words: usize) -> String {
    let Some((first, rest)) = transcripts.split_first() else {
        return String::new();
    };

    let mut result = first.clone();
    let mut prev_words: Vec<&str> = first.split_whitespace().collect();

    for next in rest {
        let next_words: Vec<&str> = next.split_whitespace().collect();
        let limit = max_overlap_words
            .min(prev_words.len())
            .min(next_words.len());

        let mut best_overlap = 0;
        for n in 1..=limit {
            let tail = &prev_words[prev_words.len() - n..];
            let head = &next_words[..n];
            let matches = tail
                .iter()
                .zip(head.iter())
                .all(|(a, b)| a.to_lowercase() == b.to_lowercase());
            if matches {
                best_overlap = n;
            }
        }

        let remainder = next_words[best_overlap..].join(" ");
        if !remainder.is_empty() {
            result.push(' ');
            result.push_str(&remainder);
        }

        prev_words = next_words;
    }

    result.trim().to_owned()
}

/// Read a PCM WAV into f32 mono samples
fn read_wav(path: &Path) -> Result<(Vec<f32>, u32), ModelError> {
    let audio_err = |source: hound::Error| ModelError::AudioRead {
        path: path.to_owned(),
        source,
    };

    let mut reader = hound::WavReader::open(path).map_err(audio_err)?;
    let spec = reader.spec();

    let samples: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Int => {
            let max = f32::from(i16::MAX);
            reader
                .samples::<i16>()
                .map(|s| s.map(|v| f32::from(v) / max))
                .collect::<Result<_, _>>()
                .map_err(audio_err)?
        }
        hound::SampleFormat::Float => reader
            .samples::<f32>()
            .collect::<Result<_, _>>()
            .map_err(audio_err)?,
    };

    Ok((samples, spec.sample_rate))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::catalog::ModelDescriptor;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::time::{SystemTime, UNIX_EPOCH};

    const RATE: u32 = 16_000;

    /// Recognizer returning scripted texts and recording chunk sample counts
    struct ScriptedRecognizer {
        outputs: VecDeque<String>,
        chunk_lengths: Arc<Mutex<Vec<usize>>>,
    }

    impl Recognizer for ScriptedRecognizer {
        fn decode(&mut self, samples: &[f32]) -> Result<String, ModelError> {
            self.chunk_lengths.lock().unwrap().push(samples.len());
            Ok(self.outputs.pop_front().unwrap_or_default())
        }
    }

    struct ScriptedLoader {
        loads: Arc<AtomicUsize>,
        outputs: Mutex<Vec<String>>,
        chunk_lengths: Arc<Mutex<Vec<usize>>>,
    }

    impl RecognizerLoader for ScriptedLoader {
        fn load(
            &self,
            _descriptor: &ModelDescriptor,
            _dir: &Path,
            _language: Option<&str>,
        ) -> Result<Box<dyn Recognizer>, ModelError> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(ScriptedRecognizer {
                outputs: self.outputs.lock().unwrap().clone().into(),
                chunk_lengths: Arc::clone(&self.chunk_lengths),
            }))
        }
    }

    struct Fixture {
        runtime: ModelRuntime,
        loads: Arc<AtomicUsize>,
        chunk_lengths: Arc<Mutex<Vec<usize>>>,
        root: PathBuf,
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.root);
        }
    }

    fn fixture(outputs: &[&str]) -> Fixture {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let root = std::env::temp_dir().join(format!("ptt_runtime_{nanos}"));

        // Satisfy required-file validation for whisper-tiny
        let descriptor = catalog::find("whisper-tiny").unwrap();
        let dir = descriptor.directory(&root);
        std::fs::create_dir_all(&dir).unwrap();
        for file in descriptor.required_files {
            std::fs::write(dir.join(file), b"stub").unwrap();
        }

        let loads = Arc::new(AtomicUsize::new(0));
        let chunk_lengths = Arc::new(Mutex::new(Vec::new()));
        let loader = ScriptedLoader {
            loads: Arc::clone(&loads),
            outputs: Mutex::new(outputs.iter().map(|&s| s.to_owned()).collect()),
            chunk_lengths: Arc::clone(&chunk_lengths),
        };

        Fixture {
            runtime: ModelRuntime::new(root.clone(), Box::new(loader), ChunkPolicy::default()),
            loads,
            chunk_lengths,
            root,
        }
    }

    fn write_audio(root: &Path, secs: f64) -> AudioHandle {
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let count = (secs * f64::from(RATE)) as usize;
        let path = root.join(format!("take_{secs}.wav"));
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: RATE,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(&path, spec).unwrap();
        for i in 0..count {
            #[allow(clippy::cast_precision_loss)]
            let sample = ((i % 100) as f32 / 100.0 - 0.5) * 0.2;
            #[allow(clippy::cast_possible_truncation)]
            writer.write_sample((sample * f32::from(i16::MAX)) as i16).unwrap();
        }
        writer.finalize().unwrap();
        AudioHandle {
            path,
            sample_rate: RATE,
            channels: 1,
            bits_per_sample: 16,
        }
    }

    #[test]
    fn test_load_unknown_model() {
        let f = fixture(&[]);
        let result = f.runtime.load_model("no-such-model", None);
        assert!(matches!(result, Err(ModelError::UnknownModel(ref id)) if id == "no-such-model"));
    }

    #[test]
    fn test_load_twice_same_pair_is_noop() {
        let f = fixture(&[]);
        f.runtime.load_model("whisper-tiny", Some("en")).unwrap();
        f.runtime.load_model("whisper-tiny", Some("en")).unwrap();
        assert_eq!(f.loads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_load_different_language_reloads() {
        let f = fixture(&[]);
        f.runtime.load_model("whisper-tiny", Some("en")).unwrap();
        f.runtime.load_model("whisper-tiny", Some("pl")).unwrap();
        assert_eq!(f.loads.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_missing_required_file_names_first_missing() {
        let f = fixture(&[]);

        // Parakeet dir with only the encoder present: the error must name
        // the decoder, the first file missing in declaration order
        let descriptor = catalog::find("parakeet-v2").unwrap();
        let dir = descriptor.directory(&f.root);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("encoder.int8.onnx"), b"stub").unwrap();

        let result = f.runtime.load_model("parakeet-v2", None);
        match result {
            Err(ModelError::ModelNotFound(path)) => {
                assert!(path.ends_with("decoder.int8.onnx"), "named {}", path.display());
            }
            other => panic!("expected ModelNotFound, got {other:?}"),
        }
    }

    #[test]
    fn test_unload_clears_state_and_is_always_ok() {
        let f = fixture(&[]);
        // Unloading with nothing loaded is fine
        f.runtime.unload_model();

        f.runtime.load_model("whisper-tiny", None).unwrap();
        assert_eq!(
            f.runtime.state().loaded_model_id.as_deref(),
            Some("whisper-tiny")
        );

        f.runtime.unload_model();
        let state = f.runtime.state();
        assert_eq!(state.loaded_model_id, None);
        assert_eq!(state.loaded_language, None);
        assert!(!state.is_loading);
    }

    #[test]
    fn test_transcribe_without_load() {
        let f = fixture(&[]);
        let audio = write_audio(&f.root, 1.0);
        let result = f.runtime.transcribe(&audio);
        assert!(matches!(result, Err(ModelError::NotLoaded)));
    }

    #[test]
    fn test_short_audio_decodes_once() {
        let f = fixture(&["hello world"]);
        f.runtime.load_model("whisper-tiny", None).unwrap();

        let audio = write_audio(&f.root, 10.0);
        let text = f.runtime.transcribe(&audio).unwrap();
        assert_eq!(text.as_deref(), Some("hello world"));
        assert_eq!(f.chunk_lengths.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_boundary_duration_decodes_once() {
        // Exactly the chunk limit still takes the single-decode path
        let f = fixture(&["at the limit"]);
        f.runtime.load_model("whisper-tiny", None).unwrap();

        let audio = write_audio(&f.root, 25.0);
        let text = f.runtime.transcribe(&audio).unwrap();
        assert_eq!(text.as_deref(), Some("at the limit"));
        assert_eq!(f.chunk_lengths.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_forty_seconds_produces_two_chunks_with_overlap() {
        let f = fixture(&["first part", "second part"]);
        f.runtime.load_model("whisper-tiny", None).unwrap();

        let audio = write_audio(&f.root, 40.0);
        let text = f.runtime.transcribe(&audio).unwrap();
        assert_eq!(text.as_deref(), Some("first part second part"));

        // Chunk boundaries [0, 25s) and [24s, 40s)
        let lengths = f.chunk_lengths.lock().unwrap();
        assert_eq!(lengths.len(), 2);
        assert_eq!(lengths[0], 25 * RATE as usize);
        assert_eq!(lengths[1], 16 * RATE as usize);
    }

    #[test]
    fn test_chunked_overlap_words_deduplicated() {
        let f = fixture(&["the quick brown fox jumped", "Fox Jumped over the dog"]);
        f.runtime.load_model("whisper-tiny", None).unwrap();

        let audio = write_audio(&f.root, 40.0);
        let text = f.runtime.transcribe(&audio).unwrap().unwrap();
        assert_eq!(text, "the quick brown fox jumped over the dog");
        assert_eq!(text.matches("jumped").count(), 1);
    }

    #[test]
    fn test_empty_decode_is_no_speech() {
        let f = fixture(&["   "]);
        f.runtime.load_model("whisper-tiny", None).unwrap();

        let audio = write_audio(&f.root, 3.0);
        assert_eq!(f.runtime.transcribe(&audio).unwrap(), None);
    }

    #[test]
    fn test_all_chunks_empty_is_no_speech() {
        let f = fixture(&["", ""]);
        f.runtime.load_model("whisper-tiny", None).unwrap();

        let audio = write_audio(&f.root, 40.0);
        assert_eq!(f.runtime.transcribe(&audio).unwrap(), None);
    }

    #[test]
    fn test_missing_audio_file_is_read_error() {
        let f = fixture(&[]);
        f.runtime.load_model("whisper-tiny", None).unwrap();

        let audio = AudioHandle {
            path: f.root.join("gone.wav"),
            sample_rate: RATE,
            channels: 1,
            bits_per_sample: 16,
        };
        assert!(matches!(
            f.runtime.transcribe(&audio),
            Err(ModelError::AudioRead { .. })
        ));
    }

    // Pure chunking/joining

    #[test]
    fn test_chunk_spans_forty_seconds() {
        let policy = ChunkPolicy::default();
        let spans = chunk_spans(40 * RATE as usize, RATE, &policy);
        assert_eq!(spans.len(), 2);
        assert_eq!(spans[0], 0..25 * RATE as usize);
        assert_eq!(spans[1], 24 * RATE as usize..40 * RATE as usize);
    }

    #[test]
    fn test_chunk_spans_short_audio_single_span() {
        let policy = ChunkPolicy::default();
        let spans = chunk_spans(10 * RATE as usize, RATE, &policy);
        assert_eq!(spans, vec![0..10 * RATE as usize]);
    }

    #[test]
    fn test_chunk_spans_long_audio_all_but_last_full() {
        let policy = ChunkPolicy::default();
        let total = 70 * RATE as usize;
        let spans = chunk_spans(total, RATE, &policy);
        assert_eq!(spans.len(), 3);
        for span in &spans[..spans.len() - 1] {
            assert_eq!(span.len(), 25 * RATE as usize);
        }
        // Consecutive chunks share exactly one second
        for pair in spans.windows(2) {
            assert_eq!(pair[0].end - pair[1].start, RATE as usize);
        }
        assert_eq!(spans.last().unwrap().end, total);
    }

    fn join(chunks: &[&str]) -> String {
        let owned: Vec<String> = chunks.iter().map(|&s| s.to_owned()).collect();
        join_chunk_transcripts(&owned, 5)
    }

    #[test]
    fn test_join_empty_and_single() {
        assert_eq!(join(&[]), "");
        assert_eq!(join(&["only chunk"]), "only chunk");
    }

    #[test]
    fn test_join_no_overlap_uses_space() {
        assert_eq!(join(&["alpha beta", "gamma delta"]), "alpha beta gamma delta");
    }

    #[test]
    fn test_join_picks_largest_overlap() {
        // n=2 matches ("a b"); n=1 and n=3 do not, so two words are dropped
        assert_eq!(join(&["x a b", "a b y"]), "x a b y");
    }

    #[test]
    fn test_join_case_insensitive() {
        assert_eq!(
            join(&["Meet me at Noon", "at noon by the gate"]),
            "Meet me at Noon by the gate"
        );
    }

    #[test]
    fn test_join_overlap_capped_at_five_words() {
        // A six-word true overlap is invisible to the heuristic: no scan
        // length up to five lines up, so the duplicate span survives
        let prev = "x a b c d e f";
        let next = "a b c d e f g";
        assert_eq!(join(&[prev, next]), "x a b c d e f a b c d e f g");
    }

    #[test]
    fn test_join_known_approximation_merges_true_repetition() {
        // The heuristic has no timestamps: a phrase genuinely spoken twice
        // across the boundary collapses into one occurrence
        assert_eq!(join(&["say again say again", "say again done"]), "say again say again done");
    }

    #[test]
    fn test_join_three_chunks() {
        assert_eq!(
            join(&["a b c", "b c d", "c d e"]),
            "a b c d e"
        );
    }
}
