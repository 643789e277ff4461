//! The press → record → transcribe → deliver state machine.
//!
//! All transitions are applied by one actor task draining an unbounded
//! inbox; hotkey callbacks, decode completions and timers only enqueue
//! messages. Decode results and timer expiries carry the epoch they were
//! scheduled under, so anything arriving after the session moved on is
//! dropped instead of re-entering a state it no longer owns.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::audio::{AudioHandle, AudioInput};
use crate::config::CorrectionsConfig;
use crate::corrections;
use crate::input::HotkeyEvents;
use crate::model::{ModelError, ModelRuntime};

/// Session state; exactly one instance lives in the actor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Recording { started_at: Instant },
    Transcribing { audio: AudioHandle },
    Success { text: String },
    Error { message: String },
}

impl SessionState {
    /// Short name for logging
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Recording { .. } => "recording",
            Self::Transcribing { .. } => "transcribing",
            Self::Success { .. } => "success",
            Self::Error { .. } => "error",
        }
    }
}

/// Overlay/status collaborator; purely observational
pub trait SessionObserver: Send + Sync {
    /// Fired on every state transition
    fn on_state_changed(&self, state: &SessionState, message: Option<&str>);

    /// Live input level in [0, 1] while recording
    fn on_level(&self, level: f32) {
        let _ = level;
    }

    /// Out-of-band user-facing notice (permission remediation, downloads)
    fn on_notice(&self, message: &str) {
        let _ = message;
    }
}

/// Output sink: delivers one successful utterance to the active application
pub trait TextSink: Send + Sync {
    fn deliver_text(&self, text: &str);
}

/// Analytics sink, invoked alongside delivery
pub trait AnalyticsSink: Send + Sync {
    fn record_utterance(&self, text: &str, duration_secs: f64);
}

/// Transcription seam the session drives; `None` means no speech
pub trait Transcriber: Send + Sync {
    /// Decode one captured utterance
    ///
    /// # Errors
    /// Propagates [`ModelError`] from load state or inference.
    fn transcribe(&self, audio: &AudioHandle) -> Result<Option<String>, ModelError>;
}

impl Transcriber for ModelRuntime {
    fn transcribe(&self, audio: &AudioHandle) -> Result<Option<String>, ModelError> {
        Self::transcribe(self, audio)
    }
}

/// Display/settle delays of the session
#[derive(Debug, Clone, Copy)]
pub struct SessionTiming {
    /// Success shown before the text is pasted
    pub success_paste_delay: Duration,
    /// Remaining success display after pasting, before returning to idle
    pub success_settle_delay: Duration,
    /// How long a terminal error stays visible before returning to idle
    pub error_display: Duration,
}

impl Default for SessionTiming {
    fn default() -> Self {
        Self {
            success_paste_delay: Duration::from_millis(300),
            success_settle_delay: Duration::from_millis(200),
            error_display: Duration::from_secs(2),
        }
    }
}

/// Everything the session needs, injected
pub struct SessionDeps {
    pub capture: Box<dyn AudioInput>,
    pub transcriber: Arc<dyn Transcriber>,
    pub observer: Arc<dyn SessionObserver>,
    pub text_sink: Arc<dyn TextSink>,
    pub analytics: Arc<dyn AnalyticsSink>,
    pub corrections: CorrectionsConfig,
    pub timing: SessionTiming,
}

enum SessionMsg {
    Press,
    Release,
    DecodeDone {
        epoch: u64,
        result: Result<Option<String>, ModelError>,
        duration_secs: f64,
    },
    Deliver {
        epoch: u64,
    },
    Settle {
        epoch: u64,
    },
    Notice(String),
    Stop,
    Shutdown(tokio::sync::oneshot::Sender<()>),
}

/// Handle to the session actor; cheap to clone
#[derive(Clone)]
pub struct RecordingSession {
    tx: mpsc::UnboundedSender<SessionMsg>,
}

impl RecordingSession {
    /// Spawn the actor task and return its handle
    #[must_use]
    pub fn spawn(deps: SessionDeps) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let actor = SessionActor {
            capture: deps.capture,
            transcriber: deps.transcriber,
            observer: deps.observer,
            text_sink: deps.text_sink,
            analytics: deps.analytics,
            corrections: deps.corrections,
            timing: deps.timing,
            tx: tx.clone(),
            state: SessionState::Idle,
            epoch: 0,
            pending_delivery: None,
        };
        tokio::spawn(actor.run(rx));
        Self { tx }
    }

    /// Hotkey went down
    pub fn press(&self) {
        let _ = self.tx.send(SessionMsg::Press);
    }

    /// Hotkey went up
    pub fn release(&self) {
        let _ = self.tx.send(SessionMsg::Release);
    }

    /// Cancel whatever is in flight and return to idle; safe in any state
    pub fn stop(&self) {
        let _ = self.tx.send(SessionMsg::Stop);
    }

    /// Stop and terminate the actor, waiting for its final cleanup
    pub async fn shutdown(&self) {
        let (ack_tx, ack_rx) = tokio::sync::oneshot::channel();
        if self.tx.send(SessionMsg::Shutdown(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
    }
}

impl HotkeyEvents for RecordingSession {
    fn on_press(&self) {
        self.press();
    }

    fn on_release(&self) {
        self.release();
    }

    fn on_permission_prompt(&self, help: &str) {
        let _ = self.tx.send(SessionMsg::Notice(help.to_owned()));
    }
}

struct SessionActor {
    capture: Box<dyn AudioInput>,
    transcriber: Arc<dyn Transcriber>,
    observer: Arc<dyn SessionObserver>,
    text_sink: Arc<dyn TextSink>,
    analytics: Arc<dyn AnalyticsSink>,
    corrections: CorrectionsConfig,
    timing: SessionTiming,
    tx: mpsc::UnboundedSender<SessionMsg>,
    state: SessionState,
    /// Bumped whenever the session returns to idle; stale completions and
    /// timers compare against it and are dropped
    epoch: u64,
    /// Corrected text and utterance duration awaiting delivery
    pending_delivery: Option<(String, f64)>,
}

impl SessionActor {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<SessionMsg>) {
        while let Some(msg) = rx.recv().await {
            match msg {
                SessionMsg::Press => self.handle_press(),
                SessionMsg::Release => self.handle_release(),
                SessionMsg::DecodeDone {
                    epoch,
                    result,
                    duration_secs,
                } => {
                    if epoch == self.epoch {
                        self.handle_decode_done(result, duration_secs);
                    } else {
                        debug!("stale decode completion dropped");
                    }
                }
                SessionMsg::Deliver { epoch } => {
                    if epoch == self.epoch {
                        self.handle_deliver();
                    }
                }
                SessionMsg::Settle { epoch } => {
                    if epoch == self.epoch {
                        self.return_to_idle();
                    }
                }
                SessionMsg::Notice(message) => self.observer.on_notice(&message),
                SessionMsg::Stop => self.handle_stop(),
                SessionMsg::Shutdown(ack) => {
                    self.handle_stop();
                    info!("session shut down");
                    let _ = ack.send(());
                    break;
                }
            }
        }
    }

    fn handle_press(&mut self) {
        if !matches!(self.state, SessionState::Idle) {
            debug!(state = self.state.name(), "press ignored");
            return;
        }

        match self.capture.start_recording() {
            Ok(handle) => {
                debug!(path = %handle.path.display(), "capture started");
                self.set_state(
                    SessionState::Recording {
                        started_at: Instant::now(),
                    },
                    None,
                );
            }
            Err(e) => {
                // Straight to the error display, never the recording visuals
                warn!("capture failed to start: {e}");
                self.capture.cleanup();
                self.enter_error("Failed to start recording".to_owned());
            }
        }
    }

    fn handle_release(&mut self) {
        let started_at = match self.state {
            SessionState::Recording { started_at } => started_at,
            _ => {
                debug!(state = self.state.name(), "release ignored");
                return;
            }
        };
        let duration_secs = started_at.elapsed().as_secs_f64();

        match self.capture.stop_recording() {
            Some(audio) => {
                self.set_state(
                    SessionState::Transcribing {
                        audio: audio.clone(),
                    },
                    None,
                );
                self.spawn_decode(audio, duration_secs);
            }
            None => self.enter_error("No recording to process".to_owned()),
        }
    }

    fn spawn_decode(&self, audio: AudioHandle, duration_secs: f64) {
        let epoch = self.epoch;
        let transcriber = Arc::clone(&self.transcriber);
        let tx = self.tx.clone();

        tokio::task::spawn_blocking(move || {
            let result = transcriber.transcribe(&audio);
            let _ = tx.send(SessionMsg::DecodeDone {
                epoch,
                result,
                duration_secs,
            });
        });
    }

    fn handle_decode_done(
        &mut self,
        result: Result<Option<String>, ModelError>,
        duration_secs: f64,
    ) {
        if !matches!(self.state, SessionState::Transcribing { .. }) {
            debug!(state = self.state.name(), "decode completion ignored");
            return;
        }

        match result {
            Ok(Some(text)) => {
                let trimmed = text.trim();
                if trimmed.is_empty() {
                    self.enter_error("No speech detected".to_owned());
                    return;
                }

                let corrected = corrections::apply_corrections(trimmed, &self.corrections);
                info!(
                    text_len = corrected.len(),
                    duration_secs, "utterance transcribed"
                );
                self.pending_delivery = Some((corrected.clone(), duration_secs));
                self.set_state(SessionState::Success { text: corrected }, None);
                self.schedule(
                    self.timing.success_paste_delay,
                    SessionMsg::Deliver { epoch: self.epoch },
                );
            }
            Ok(None) => self.enter_error("No speech detected".to_owned()),
            Err(e) => {
                warn!("decode failed: {e}");
                self.enter_error(e.to_string());
            }
        }
    }

    fn handle_deliver(&mut self) {
        if !matches!(self.state, SessionState::Success { .. }) {
            return;
        }

        if let Some((text, duration_secs)) = self.pending_delivery.take() {
            self.text_sink.deliver_text(&text);
            self.analytics.record_utterance(&text, duration_secs);
        }

        self.schedule(
            self.timing.success_settle_delay,
            SessionMsg::Settle { epoch: self.epoch },
        );
    }

    fn handle_stop(&mut self) {
        debug!(state = self.state.name(), "session stop");
        self.return_to_idle();
    }

    fn enter_error(&mut self, message: String) {
        self.set_state(
            SessionState::Error {
                message: message.clone(),
            },
            Some(&message),
        );
        self.schedule(
            self.timing.error_display,
            SessionMsg::Settle { epoch: self.epoch },
        );
    }

    /// Cancel capture, drop pending work, invalidate in-flight completions
    fn return_to_idle(&mut self) {
        self.capture.cleanup();
        self.pending_delivery = None;
        self.epoch += 1;

        if !matches!(self.state, SessionState::Idle) {
            self.set_state(SessionState::Idle, None);
        }
    }

    fn set_state(&mut self, state: SessionState, message: Option<&str>) {
        debug!(from = self.state.name(), to = state.name(), "session transition");
        self.state = state;
        self.observer.on_state_changed(&self.state, message);
    }

    fn schedule(&self, delay: Duration, msg: SessionMsg) {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(msg);
        });
    }
}
