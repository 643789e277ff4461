/// Static model catalog
pub mod catalog;
/// Model acquisition pipeline
pub mod download;
/// Recognizer backends
pub mod engine;
/// Loaded-model state and chunked decoding
pub mod runtime;

pub use catalog::{ModelDescriptor, ModelFamily, ModelSource};
pub use download::{DownloadError, ModelDownloader};
pub use engine::{ModelError, NativeRecognizerLoader, Recognizer, RecognizerLoader};
pub use runtime::{ChunkPolicy, ModelRuntime, RuntimeState};
