//! Model acquisition: streaming download, extraction, single-job tracking.
//!
//! At most one download job is active. A new `download()` supersedes the
//! current job: its worker is told to stop and its callbacks are silenced by
//! an epoch check, so a stale completion can never race a newer one.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::model::catalog::{self, ModelDescriptor, ModelSource};

/// Fraction of the progress range used by the network transfer; the tail is
/// reserved for extraction
const MAX_DOWNLOAD_PROGRESS: f64 = 0.94;

/// Download pipeline errors, each independently reportable
#[derive(Debug, Error)]
pub enum DownloadError {
    /// The id is not in the catalog
    #[error("unknown model id: {0}")]
    UnknownModel(String),

    /// The job was cancelled by `cancel_download`
    #[error("download was cancelled")]
    Cancelled,

    /// Connection, HTTP or transfer failure
    #[error("network error: {0}")]
    Network(String),

    /// Directory creation, file write or move failure
    #[error("file system error: {0}")]
    FileSystem(#[from] std::io::Error),

    /// The external extraction step failed; carries the tool's diagnostics
    #[error("failed to extract model archive: {0}")]
    Extraction(String),
}

/// Progress consumer: `(fraction in [0, 1], status message)`
pub type ProgressCallback = Arc<dyn Fn(f64, &str) + Send + Sync>;

/// Completion consumer; receives the final model directory on success
pub type CompletionCallback = Box<dyn FnOnce(Result<PathBuf, DownloadError>) + Send>;

struct DownloaderInner {
    models_root: PathBuf,
    /// Monotonic job epoch; callbacks only fire while their epoch is current
    epoch: AtomicU64,
    /// Cancel flag of the active job, if any
    current_cancel: Mutex<Option<Arc<AtomicBool>>>,
}

impl DownloaderInner {
    fn is_current(&self, epoch: u64) -> bool {
        self.epoch.load(Ordering::SeqCst) == epoch
    }
}

/// Downloads and unpacks model archives, one job at a time
pub struct ModelDownloader {
    inner: Arc<DownloaderInner>,
}

impl ModelDownloader {
    #[must_use]
    pub fn new(models_root: PathBuf) -> Self {
        Self {
            inner: Arc::new(DownloaderInner {
                models_root,
                epoch: AtomicU64::new(0),
                current_cancel: Mutex::new(None),
            }),
        }
    }

    /// Whether every required file of `model_id` exists on disk
    #[must_use]
    pub fn is_model_downloaded(&self, model_id: &str) -> bool {
        catalog::find(model_id)
            .is_some_and(|d| d.is_downloaded(&self.inner.models_root))
    }

    /// Start downloading `model_id`, superseding any active job
    ///
    /// The superseded job's callbacks never fire. This job's callbacks fire
    /// on a worker thread.
    pub fn download(
        &self,
        model_id: &str,
        on_progress: ProgressCallback,
        on_complete: CompletionCallback,
    ) {
        let Some(descriptor) = catalog::find(model_id) else {
            on_complete(Err(DownloadError::UnknownModel(model_id.to_owned())));
            return;
        };
        self.download_descriptor(*descriptor, on_progress, on_complete);
    }

    /// Cancel the active job; its completion fires with
    /// [`DownloadError::Cancelled`]
    pub fn cancel_download(&self) {
        if let Ok(mut slot) = self.inner.current_cancel.lock() {
            if let Some(flag) = slot.take() {
                flag.store(true, Ordering::SeqCst);
                info!("download cancelled");
            }
        }
    }

    /// Catalog-independent entry point (exercised directly by tests)
    pub(crate) fn download_descriptor(
        &self,
        descriptor: ModelDescriptor,
        on_progress: ProgressCallback,
        on_complete: CompletionCallback,
    ) {
        let epoch = self.inner.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let cancelled = Arc::new(AtomicBool::new(false));

        // Supersede: stop the prior worker; its callbacks are silenced by
        // the epoch bump above
        if let Ok(mut slot) = self.inner.current_cancel.lock() {
            if let Some(old) = slot.replace(Arc::clone(&cancelled)) {
                old.store(true, Ordering::SeqCst);
                debug!("superseding active download job");
            }
        }

        let inner = Arc::clone(&self.inner);
        std::thread::spawn(move || {
            let progress: ProgressCallback = {
                let inner = Arc::clone(&inner);
                Arc::new(move |fraction, message: &str| {
                    if inner.is_current(epoch) {
                        on_progress(fraction, message);
                    }
                })
            };

            let result = run_job(&inner, &descriptor, &cancelled, &progress);

            if inner.is_current(epoch) {
                if let Ok(mut slot) = inner.current_cancel.lock() {
                    if slot.as_ref().is_some_and(|f| Arc::ptr_eq(f, &cancelled)) {
                        *slot = None;
                    }
                }
                on_complete(result);
            } else {
                debug!(model = descriptor.id, "download superseded, result discarded");
            }
        });
    }
}

fn run_job(
    inner: &DownloaderInner,
    descriptor: &ModelDescriptor,
    cancelled: &AtomicBool,
    progress: &ProgressCallback,
) -> Result<PathBuf, DownloadError> {
    let model_dir = descriptor.directory(&inner.models_root);

    if descriptor.is_downloaded(&inner.models_root) {
        info!(model = descriptor.id, "model already downloaded");
        progress(1.0, "Model already downloaded");
        return Ok(model_dir);
    }

    std::fs::create_dir_all(&inner.models_root)?;

    let temp_path = inner
        .models_root
        .join(format!("{}.download", descriptor.id));
    let fetched = fetch_to_file(descriptor.url(), &temp_path, cancelled, progress);
    if let Err(e) = fetched {
        let _ = std::fs::remove_file(&temp_path);
        return Err(e);
    }

    match descriptor.source {
        ModelSource::Archive { .. } => {
            let archive_path = inner
                .models_root
                .join(format!("{}.tar.bz2", descriptor.id));
            if archive_path.exists() {
                std::fs::remove_file(&archive_path)?;
            }
            std::fs::rename(&temp_path, &archive_path)?;

            progress(0.95, "Extracting model files...");
            extract_archive(&archive_path, &inner.models_root)?;

            // The archive is never left behind after a successful extraction
            if let Err(e) = std::fs::remove_file(&archive_path) {
                warn!("failed to delete archive {}: {e}", archive_path.display());
            }
        }
        ModelSource::SingleFile { file_name, .. } => {
            std::fs::create_dir_all(&model_dir)?;
            std::fs::rename(&temp_path, model_dir.join(file_name))?;
        }
    }

    info!(model = descriptor.id, dir = %model_dir.display(), "model downloaded");
    progress(1.0, "Download complete");
    Ok(model_dir)
}

/// Stream the URL to `target`, reporting scaled progress and honoring the
/// cancel flag between reads
fn fetch_to_file(
    url: &str,
    target: &Path,
    cancelled: &AtomicBool,
    progress: &ProgressCallback,
) -> Result<(), DownloadError> {
    progress(0.0, "Starting download...");

    let client = reqwest::blocking::Client::builder()
        .connect_timeout(Duration::from_secs(60))
        .timeout(Duration::from_secs(3600))
        .build()
        .map_err(|e| DownloadError::Network(e.to_string()))?;

    let mut response = client
        .get(url)
        .send()
        .map_err(|e| DownloadError::Network(e.to_string()))?;

    if !response.status().is_success() {
        return Err(DownloadError::Network(format!(
            "download failed with status {} from {url}",
            response.status()
        )));
    }

    let total_bytes = response.content_length().filter(|&t| t > 0);
    let mut file = std::fs::File::create(target)?;
    let mut buffer = [0_u8; 64 * 1024];
    let mut downloaded: u64 = 0;

    loop {
        if cancelled.load(Ordering::SeqCst) {
            return Err(DownloadError::Cancelled);
        }

        let read = response
            .read(&mut buffer)
            .map_err(|e| DownloadError::Network(e.to_string()))?;
        if read == 0 {
            break;
        }

        file.write_all(&buffer[..read])?;
        downloaded += read as u64;

        if let Some(total) = total_bytes {
            #[allow(clippy::cast_precision_loss)]
            let fraction = downloaded as f64 / total as f64;
            progress(
                (fraction * 0.95).min(MAX_DOWNLOAD_PROGRESS),
                &format!(
                    "Downloading: {} / {}",
                    format_bytes(downloaded),
                    format_bytes(total)
                ),
            );
        } else {
            progress(0.0, &format!("Downloading: {}", format_bytes(downloaded)));
        }
    }

    file.flush()?;
    Ok(())
}

/// Extract with the external tar tool, capturing its diagnostics
fn extract_archive(archive: &Path, destination: &Path) -> Result<(), DownloadError> {
    let output = std::process::Command::new("tar")
        .arg("xjf")
        .arg(archive)
        .arg("-C")
        .arg(destination)
        .output()
        .map_err(|e| DownloadError::Extraction(e.to_string()))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_owned();
        let diagnostic = if stderr.is_empty() {
            "unknown extraction error".to_owned()
        } else {
            stderr
        };
        return Err(DownloadError::Extraction(diagnostic));
    }

    Ok(())
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    #[allow(clippy::cast_precision_loss)]
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}
