//! Static catalog of downloadable recognition models.
//!
//! Each entry fixes the model's directory name, the files that must exist
//! for a load to succeed, and where the bytes come from. `is_downloaded` is
//! always derived from the filesystem, never persisted.

use std::path::{Path, PathBuf};

/// Recognition-model architecture class, determining the required file set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelFamily {
    /// Whisper encoder/decoder in a single ggml container (vocabulary
    /// embedded), decoded via whisper.cpp
    Whisper,
    /// NeMo transducer: encoder/decoder/joiner plus token table
    Transducer,
}

/// Where a model's bytes come from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelSource {
    /// Compressed archive; extracted into the models root by an external
    /// decompression step, then deleted
    Archive { url: &'static str },
    /// Single weights file placed directly into the model directory
    SingleFile {
        url: &'static str,
        file_name: &'static str,
    },
}

/// One catalog entry
#[derive(Debug, Clone, Copy)]
pub struct ModelDescriptor {
    pub id: &'static str,
    pub display_family: &'static str,
    pub family: ModelFamily,
    /// Directory name under the models root
    pub dir_name: &'static str,
    /// Files that must exist under the model directory for a load
    pub required_files: &'static [&'static str],
    pub source: ModelSource,
}

impl ModelDescriptor {
    /// The model's directory under `models_root`
    #[must_use]
    pub fn directory(&self, models_root: &Path) -> PathBuf {
        models_root.join(self.dir_name)
    }

    /// Whether every required file exists on disk
    #[must_use]
    pub fn is_downloaded(&self, models_root: &Path) -> bool {
        let dir = self.directory(models_root);
        self.required_files.iter().all(|f| dir.join(f).exists())
    }

    /// Download URL of the model source
    #[must_use]
    pub const fn url(&self) -> &'static str {
        match self.source {
            ModelSource::Archive { url } | ModelSource::SingleFile { url, .. } => url,
        }
    }
}

/// All models this build knows how to acquire and load
pub const CATALOG: &[ModelDescriptor] = &[
    ModelDescriptor {
        id: "whisper-tiny",
        display_family: "Whisper",
        family: ModelFamily::Whisper,
        dir_name: "whisper-tiny",
        required_files: &["ggml-tiny.bin"],
        source: ModelSource::SingleFile {
            url: "https://huggingface.co/ggerganov/whisper.cpp/resolve/main/ggml-tiny.bin",
            file_name: "ggml-tiny.bin",
        },
    },
    ModelDescriptor {
        id: "whisper-base",
        display_family: "Whisper",
        family: ModelFamily::Whisper,
        dir_name: "whisper-base",
        required_files: &["ggml-base.bin"],
        source: ModelSource::SingleFile {
            url: "https://huggingface.co/ggerganov/whisper.cpp/resolve/main/ggml-base.bin",
            file_name: "ggml-base.bin",
        },
    },
    ModelDescriptor {
        id: "whisper-small",
        display_family: "Whisper",
        family: ModelFamily::Whisper,
        dir_name: "whisper-small",
        required_files: &["ggml-small.bin"],
        source: ModelSource::SingleFile {
            url: "https://huggingface.co/ggerganov/whisper.cpp/resolve/main/ggml-small.bin",
            file_name: "ggml-small.bin",
        },
    },
    ModelDescriptor {
        id: "whisper-medium",
        display_family: "Whisper",
        family: ModelFamily::Whisper,
        dir_name: "whisper-medium",
        required_files: &["ggml-medium.bin"],
        source: ModelSource::SingleFile {
            url: "https://huggingface.co/ggerganov/whisper.cpp/resolve/main/ggml-medium.bin",
            file_name: "ggml-medium.bin",
        },
    },
    ModelDescriptor {
        id: "parakeet-v2",
        display_family: "Parakeet",
        family: ModelFamily::Transducer,
        dir_name: "sherpa-onnx-nemo-parakeet-tdt-0.6b-v2-int8",
        required_files: &[
            "encoder.int8.onnx",
            "decoder.int8.onnx",
            "joiner.int8.onnx",
            "tokens.txt",
        ],
        source: ModelSource::Archive {
            url: "https://github.com/k2-fsa/sherpa-onnx/releases/download/asr-models/sherpa-onnx-nemo-parakeet-tdt-0.6b-v2-int8.tar.bz2",
        },
    },
    ModelDescriptor {
        id: "parakeet-v3",
        display_family: "Parakeet",
        family: ModelFamily::Transducer,
        dir_name: "sherpa-onnx-nemo-parakeet-tdt-0.6b-v3-int8",
        required_files: &[
            "encoder.int8.onnx",
            "decoder.int8.onnx",
            "joiner.int8.onnx",
            "tokens.txt",
        ],
        source: ModelSource::Archive {
            url: "https://github.com/k2-fsa/sherpa-onnx/releases/download/asr-models/sherpa-onnx-nemo-parakeet-tdt-0.6b-v3-int8.tar.bz2",
        },
    },
];

/// Look up a catalog entry by id
#[must_use]
pub fn find(id: &str) -> Option<&'static ModelDescriptor> {
    CATALOG.iter().find(|d| d.id == id)
}
