use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;

use whisper_ptt::audio::CpalAudioCapture;
use whisper_ptt::config::Config;
use whisper_ptt::input::{DetectorTuning, HotkeyBinding, HotkeyDetector, HotkeyEvents, RdevObserver};
use whisper_ptt::model::{
    ChunkPolicy, ModelDownloader, ModelRuntime, NativeRecognizerLoader,
};
use whisper_ptt::permissions::InputPermission;
use whisper_ptt::session::{
    AnalyticsSink, RecordingSession, SessionDeps, SessionObserver, SessionState, SessionTiming,
    TextSink,
};
use whisper_ptt::telemetry;

/// Stand-in for the overlay: renders session activity into the log
struct LogObserver;

impl SessionObserver for LogObserver {
    fn on_state_changed(&self, state: &SessionState, message: Option<&str>) {
        match message {
            Some(m) => tracing::info!(state = state.name(), "{m}"),
            None => tracing::info!(state = state.name(), "session state"),
        }
    }

    fn on_level(&self, level: f32) {
        tracing::trace!(level, "input level");
    }

    fn on_notice(&self, message: &str) {
        tracing::warn!("{message}");
    }
}

/// Word-count analytics into the log
struct WordCountAnalytics;

impl AnalyticsSink for WordCountAnalytics {
    fn record_utterance(&self, text: &str, duration_secs: f64) {
        let words = text.split_whitespace().count();
        tracing::info!(words, duration_secs, "utterance recorded");
    }
}

fn text_sink() -> Arc<dyn TextSink> {
    #[cfg(target_os = "macos")]
    {
        Arc::new(whisper_ptt::output::CgEventSink)
    }
    #[cfg(not(target_os = "macos"))]
    {
        Arc::new(whisper_ptt::output::LogOnlySink)
    }
}

fn input_permission() -> Arc<dyn InputPermission> {
    #[cfg(target_os = "macos")]
    {
        Arc::new(whisper_ptt::permissions::MacosInputMonitoring)
    }
    #[cfg(not(target_os = "macos"))]
    {
        Arc::new(whisper_ptt::permissions::Unrestricted)
    }
}

/// Download the configured model if it is not on disk yet
async fn ensure_model(downloader: &ModelDownloader, model_id: &str) -> Result<()> {
    if downloader.is_model_downloaded(model_id) {
        return Ok(());
    }

    println!("Model {model_id} not present, downloading...");
    let (done_tx, done_rx) = std::sync::mpsc::channel();
    downloader.download(
        model_id,
        Arc::new(|fraction, message| {
            tracing::info!(progress = fraction, "{message}");
        }),
        Box::new(move |result| {
            let _ = done_tx.send(result);
        }),
    );

    let result = tokio::task::spawn_blocking(move || done_rx.recv())
        .await
        .context("download wait task failed")?
        .context("download worker dropped its completion")?;
    let dir = result.context("model download failed")?;
    println!("✓ Model ready at {}", dir.display());
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;
    println!("✓ Config loaded from ~/.whisper-ptt.toml");

    telemetry::init(config.telemetry.enabled, &config.telemetry.log_path)?;
    tracing::info!("whisper-ptt starting");

    let models_root = Config::expand_path(&config.model.models_dir)?;
    let downloader = ModelDownloader::new(models_root.clone());
    ensure_model(&downloader, &config.model.id).await?;

    let runtime = Arc::new(ModelRuntime::new(
        models_root,
        Box::new(NativeRecognizerLoader {
            threads: config.model.threads,
            beam_size: config.model.beam_size,
        }),
        ChunkPolicy::default(),
    ));

    {
        let runtime = Arc::clone(&runtime);
        let id = config.model.id.clone();
        let language = config.model.language.clone();
        let loaded = tokio::task::spawn_blocking(move || {
            runtime.load_model(&id, language.as_deref())
        })
        .await
        .context("model load task failed")?;

        // A failed load is not fatal: the session accepts presses and fails
        // fast until configuration or a download fixes it
        match loaded {
            Ok(()) => println!("✓ Model {} loaded", config.model.id),
            Err(e) => {
                tracing::warn!("model load failed: {e}");
                println!("⚠ Model failed to load: {e}");
            }
        }
    }

    let observer: Arc<LogObserver> = Arc::new(LogObserver);

    let level_observer = Arc::clone(&observer);
    let capture = CpalAudioCapture::new(
        &config.audio,
        std::env::temp_dir(),
        Arc::new(move |level| level_observer.on_level(level)),
    )?;
    println!("✓ Audio capture initialized");

    let session = RecordingSession::spawn(SessionDeps {
        capture: Box::new(capture),
        transcriber: runtime,
        observer,
        text_sink: text_sink(),
        analytics: Arc::new(WordCountAnalytics),
        corrections: config.corrections.clone(),
        timing: SessionTiming::default(),
    });

    let binding = HotkeyBinding::resolve(&config.hotkey);
    let detector = HotkeyDetector::new(
        Box::new(RdevObserver::new()),
        input_permission(),
        Arc::new(session.clone()) as Arc<dyn HotkeyEvents>,
        binding,
        DetectorTuning::default(),
    );
    detector.start();
    println!("✓ Hotkey monitoring started ({:?})", binding);

    // Periodic re-verification stands in for an app-activation hook: restores
    // monitoring if the permission was silently revoked
    let activation_detector = detector.clone();
    let activation_check = tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(30));
        loop {
            interval.tick().await;
            activation_detector.ensure_monitoring();
        }
    });

    println!("\nwhisper-ptt is running. Hold the hotkey to dictate. Press Ctrl+C to exit.\n");
    tokio::signal::ctrl_c().await?;

    tracing::info!("shutdown signal received");
    println!("\nShutting down...");
    activation_check.abort();
    detector.stop();
    session.shutdown().await;

    Ok(())
}
