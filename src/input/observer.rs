//! Raw global-input observation behind an injectable trait.
//!
//! The detector consumes [`RawInputEvent`]s and never touches the OS monitor
//! directly, so tests can drive it with synthesized events. The production
//! backend is [`RdevObserver`], a listener thread translating `rdev` events
//! into the macOS virtual key-code space used throughout the crate.

use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Live modifier state at the time of an input event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Modifiers {
    pub control: bool,
    pub option: bool,
    pub command: bool,
    pub shift: bool,
    pub function: bool,
}

impl Modifiers {
    /// No modifiers held
    pub const NONE: Self = Self {
        control: false,
        option: false,
        command: false,
        shift: false,
        function: false,
    };

    /// Whether every modifier set in `other` is also set in `self`
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        (!other.control || self.control)
            && (!other.option || self.option)
            && (!other.command || self.command)
            && (!other.shift || self.shift)
            && (!other.function || self.function)
    }

    /// The modifiers relevant for combo matching (fn is not part of chords)
    #[must_use]
    pub const fn chord(self) -> Self {
        Self {
            function: false,
            ..self
        }
    }
}

/// Well-known virtual key codes (macOS virtual key space)
pub mod key_code {
    pub const RIGHT_COMMAND: u16 = 54;
    pub const LEFT_COMMAND: u16 = 55;
    pub const LEFT_SHIFT: u16 = 56;
    pub const LEFT_OPTION: u16 = 58;
    pub const LEFT_CONTROL: u16 = 59;
    pub const RIGHT_SHIFT: u16 = 60;
    pub const RIGHT_OPTION: u16 = 61;
    pub const RIGHT_CONTROL: u16 = 62;
    pub const FUNCTION: u16 = 63;
}

/// One raw input event delivered by the OS monitor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawInputEvent {
    /// Non-modifier key pressed; `modifiers` is the live set at key-down
    KeyDown { code: u16, modifiers: Modifiers },
    /// Non-modifier key released
    KeyUp { code: u16, modifiers: Modifiers },
    /// A modifier key changed state; `modifiers` is the resulting set and
    /// `code` identifies which physical key changed (left/right variants
    /// have distinct codes)
    FlagsChanged { code: u16, modifiers: Modifiers },
}

/// Observer installation errors
#[derive(Debug, Error)]
pub enum ObserverError {
    /// The OS refused the global monitor (missing permission, no display
    /// server, not in the input group, ...)
    #[error("failed to install global input monitor: {0}")]
    InstallFailed(String),
}

/// Handler invoked on the observer's delivery thread for every raw event
pub type EventHandler = Box<dyn FnMut(RawInputEvent) + Send>;

/// OS-level global input monitor
///
/// `install` replaces any previous handler, so observers never deliver an
/// event twice. Implementations must treat the handler as fire-and-forget:
/// it only records edges and enqueues work.
pub trait HotkeyObserver: Send {
    /// Install `handler` as the active event consumer
    ///
    /// # Errors
    /// Returns [`ObserverError::InstallFailed`] if the OS monitor cannot be
    /// started.
    fn install(&mut self, handler: EventHandler) -> Result<(), ObserverError>;

    /// Stop delivering events; idempotent
    fn uninstall(&mut self);
}

/// Per-physical-key modifier tracking so releasing one of two held shifts
/// keeps the flag set
#[derive(Debug, Default, Clone, Copy)]
struct ModifierKeys {
    l_control: bool,
    r_control: bool,
    l_shift: bool,
    r_shift: bool,
    l_option: bool,
    r_option: bool,
    l_command: bool,
    r_command: bool,
    function: bool,
}

impl ModifierKeys {
    const fn flags(self) -> Modifiers {
        Modifiers {
            control: self.l_control || self.r_control,
            option: self.l_option || self.r_option,
            command: self.l_command || self.r_command,
            shift: self.l_shift || self.r_shift,
            function: self.function,
        }
    }

    /// Apply a modifier key transition; returns its virtual key code
    fn apply(&mut self, key: rdev::Key, down: bool) -> Option<u16> {
        use rdev::Key;
        let code = match key {
            Key::ControlLeft => {
                self.l_control = down;
                key_code::LEFT_CONTROL
            }
            Key::ControlRight => {
                self.r_control = down;
                key_code::RIGHT_CONTROL
            }
            Key::ShiftLeft => {
                self.l_shift = down;
                key_code::LEFT_SHIFT
            }
            Key::ShiftRight => {
                self.r_shift = down;
                key_code::RIGHT_SHIFT
            }
            Key::Alt => {
                self.l_option = down;
                key_code::LEFT_OPTION
            }
            Key::AltGr => {
                self.r_option = down;
                key_code::RIGHT_OPTION
            }
            Key::MetaLeft => {
                self.l_command = down;
                key_code::LEFT_COMMAND
            }
            Key::MetaRight => {
                self.r_command = down;
                key_code::RIGHT_COMMAND
            }
            Key::Function => {
                self.function = down;
                key_code::FUNCTION
            }
            _ => return None,
        };
        Some(code)
    }
}

/// Map a non-modifier rdev key to its macOS virtual key code
#[allow(clippy::too_many_lines)]
fn plain_key_code(key: rdev::Key) -> Option<u16> {
    use rdev::Key;
    let code = match key {
        Key::KeyA => 0,
        Key::KeyS => 1,
        Key::KeyD => 2,
        Key::KeyF => 3,
        Key::KeyH => 4,
        Key::KeyG => 5,
        Key::KeyZ => 6,
        Key::KeyX => 7,
        Key::KeyC => 8,
        Key::KeyV => 9,
        Key::KeyB => 11,
        Key::KeyQ => 12,
        Key::KeyW => 13,
        Key::KeyE => 14,
        Key::KeyR => 15,
        Key::KeyY => 16,
        Key::KeyT => 17,
        Key::Num1 => 18,
        Key::Num2 => 19,
        Key::Num3 => 20,
        Key::Num4 => 21,
        Key::Num6 => 22,
        Key::Num5 => 23,
        Key::Equal => 24,
        Key::Num9 => 25,
        Key::Num7 => 26,
        Key::Minus => 27,
        Key::Num8 => 28,
        Key::Num0 => 29,
        Key::RightBracket => 30,
        Key::KeyO => 31,
        Key::KeyU => 32,
        Key::LeftBracket => 33,
        Key::KeyI => 34,
        Key::KeyP => 35,
        Key::Return => 36,
        Key::KeyL => 37,
        Key::KeyJ => 38,
        Key::Quote => 39,
        Key::KeyK => 40,
        Key::SemiColon => 41,
        Key::BackSlash => 42,
        Key::Comma => 43,
        Key::Slash => 44,
        Key::KeyN => 45,
        Key::KeyM => 46,
        Key::Dot => 47,
        Key::Tab => 48,
        Key::Space => 49,
        Key::BackQuote => 50,
        Key::Backspace => 51,
        Key::Escape => 53,
        _ => return None,
    };
    Some(code)
}

/// Production observer: one `rdev::listen` thread for the process lifetime
///
/// `rdev::listen` cannot be torn down once started, so uninstall clears the
/// handler slot and the thread keeps draining events into the void until a
/// new handler is installed. This preserves the "no duplicate delivery"
/// guarantee: at most one handler is live at any time.
pub struct RdevObserver {
    handler: Arc<Mutex<Option<EventHandler>>>,
    listener_running: bool,
}

impl RdevObserver {
    #[must_use]
    pub fn new() -> Self {
        Self {
            handler: Arc::new(Mutex::new(None)),
            listener_running: false,
        }
    }

    fn spawn_listener(&mut self) -> Result<(), ObserverError> {
        let handler = Arc::clone(&self.handler);
        let (startup_tx, startup_rx) = mpsc::channel::<String>();

        std::thread::spawn(move || {
            let mut keys = ModifierKeys::default();
            let callback = move |event: rdev::Event| {
                let raw = match event.event_type {
                    rdev::EventType::KeyPress(key) => keys.apply(key, true).map_or_else(
                        || {
                            plain_key_code(key).map(|code| RawInputEvent::KeyDown {
                                code,
                                modifiers: keys.flags(),
                            })
                        },
                        |code| {
                            Some(RawInputEvent::FlagsChanged {
                                code,
                                modifiers: keys.flags(),
                            })
                        },
                    ),
                    rdev::EventType::KeyRelease(key) => keys.apply(key, false).map_or_else(
                        || {
                            plain_key_code(key).map(|code| RawInputEvent::KeyUp {
                                code,
                                modifiers: keys.flags(),
                            })
                        },
                        |code| {
                            Some(RawInputEvent::FlagsChanged {
                                code,
                                modifiers: keys.flags(),
                            })
                        },
                    ),
                    _ => None,
                };

                if let Some(raw) = raw {
                    if let Ok(mut slot) = handler.lock() {
                        if let Some(active) = slot.as_mut() {
                            active(raw);
                        }
                    }
                }
            };

            // listen() blocks for the rest of the process on success
            if let Err(e) = rdev::listen(callback) {
                let _ = startup_tx.send(format!("{e:?}"));
            }
        });

        // listen() only returns on failure; no error within the grace window
        // means the monitor is up
        match startup_rx.recv_timeout(Duration::from_millis(300)) {
            Ok(e) => Err(ObserverError::InstallFailed(e)),
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(ObserverError::InstallFailed(
                "input monitor thread terminated unexpectedly".to_owned(),
            )),
            Err(mpsc::RecvTimeoutError::Timeout) => {
                self.listener_running = true;
                Ok(())
            }
        }
    }
}

impl Default for RdevObserver {
    fn default() -> Self {
        Self::new()
    }
}

impl HotkeyObserver for RdevObserver {
    fn install(&mut self, handler: EventHandler) -> Result<(), ObserverError> {
        if let Ok(mut slot) = self.handler.lock() {
            *slot = Some(handler);
        }

        if self.listener_running {
            debug!("input monitor already running, handler replaced");
            return Ok(());
        }

        self.spawn_listener().inspect_err(|e| {
            warn!("input monitor startup failed: {e}");
            if let Ok(mut slot) = self.handler.lock() {
                *slot = None;
            }
        })
    }

    fn uninstall(&mut self) {
        if let Ok(mut slot) = self.handler.lock() {
            *slot = None;
        }
    }
}
