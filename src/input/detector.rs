//! Debounced hotkey edge detection over the raw input observer.
//!
//! The observer callback only runs the pure [`EdgeState`] machine and hands
//! detected edges to [`HotkeyEvents`]; all heavy work happens elsewhere.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::HotkeyConfig;
use crate::input::observer::{
    key_code, EventHandler, HotkeyObserver, Modifiers, ObserverError, RawInputEvent,
};
use crate::permissions::{InputPermission, REMEDIATION_HELP};

/// Resolved hotkey binding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HotkeyBinding {
    /// Hold the right Option/Alt key
    RightAlt,
    /// Hold the right Command key
    RightCommand,
    /// Double-press the fn key and hold the second press
    FnDoublePress,
    /// Hold a regular key with an exact modifier set
    Combo { key_code: u16, modifiers: Modifiers },
    /// No-op binding; configuration was missing or malformed
    Disabled,
}

impl HotkeyBinding {
    /// Resolve the raw config, degrading malformed entries to [`Self::Disabled`]
    #[must_use]
    pub fn resolve(config: &HotkeyConfig) -> Self {
        match config.mode.as_str() {
            "right_alt" => Self::RightAlt,
            "right_command" => Self::RightCommand,
            "fn_double_press" => Self::FnDoublePress,
            "combo" => Self::resolve_combo(config),
            other => {
                warn!("unknown hotkey mode '{}', hotkey disabled", other);
                Self::Disabled
            }
        }
    }

    fn resolve_combo(config: &HotkeyConfig) -> Self {
        let Some(code) = config.key.as_deref().and_then(parse_key_name) else {
            warn!(
                "unrecognized combo key {:?}, hotkey disabled",
                config.key.as_deref().unwrap_or("<missing>")
            );
            return Self::Disabled;
        };

        let Some(modifiers) = parse_modifier_names(&config.modifiers) else {
            warn!(
                "unrecognized combo modifiers {:?}, hotkey disabled",
                config.modifiers
            );
            return Self::Disabled;
        };

        Self::Combo {
            key_code: code,
            modifiers,
        }
    }
}

/// Map a configured key name to its virtual key code
fn parse_key_name(name: &str) -> Option<u16> {
    let code = match name.to_ascii_uppercase().as_str() {
        "A" => 0,
        "S" => 1,
        "D" => 2,
        "F" => 3,
        "H" => 4,
        "G" => 5,
        "Z" => 6,
        "X" => 7,
        "C" => 8,
        "V" => 9,
        "B" => 11,
        "Q" => 12,
        "W" => 13,
        "E" => 14,
        "R" => 15,
        "Y" => 16,
        "T" => 17,
        "1" => 18,
        "2" => 19,
        "3" => 20,
        "4" => 21,
        "6" => 22,
        "5" => 23,
        "9" => 25,
        "7" => 26,
        "8" => 28,
        "0" => 29,
        "O" => 31,
        "U" => 32,
        "I" => 34,
        "P" => 35,
        "RETURN" | "ENTER" => 36,
        "L" => 37,
        "J" => 38,
        "K" => 40,
        "N" => 45,
        "M" => 46,
        "TAB" => 48,
        "SPACE" => 49,
        "ESCAPE" => 53,
        _ => return None,
    };
    Some(code)
}

/// Parse modifier names; `None` if any name is unrecognized
fn parse_modifier_names(names: &[String]) -> Option<Modifiers> {
    let mut modifiers = Modifiers::NONE;
    for name in names {
        match name.as_str() {
            "Control" | "Ctrl" => modifiers.control = true,
            "Option" | "Alt" => modifiers.option = true,
            "Command" | "Super" => modifiers.command = true,
            "Shift" => modifiers.shift = true,
            _ => return None,
        }
    }
    Some(modifiers)
}

/// A debounced press or release of the configured trigger
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HotkeyEdge {
    Press,
    Release,
}

/// Timing knobs for detection and permission recovery
#[derive(Debug, Clone, Copy)]
pub struct DetectorTuning {
    /// Max gap between fn presses to count as a double-press
    pub double_press_window: Duration,
    /// Interval between permission re-checks while denied
    pub poll_interval: Duration,
    /// Failed polls before the remediation prompt fires (once)
    pub polls_before_prompt: u32,
}

impl Default for DetectorTuning {
    fn default() -> Self {
        Self {
            double_press_window: Duration::from_millis(400),
            poll_interval: Duration::from_secs(1),
            polls_before_prompt: 3,
        }
    }
}

/// Pure edge-detection state machine
///
/// Fed every raw event; emits at most one edge per event. Owns the debounce
/// state (pressed flag, fn double-press timestamp) and nothing else.
#[derive(Debug)]
pub struct EdgeState {
    binding: HotkeyBinding,
    double_press_window: Duration,
    pressed: bool,
    last_fn_press: Option<Instant>,
}

impl EdgeState {
    #[must_use]
    pub const fn new(binding: HotkeyBinding, double_press_window: Duration) -> Self {
        Self {
            binding,
            double_press_window,
            pressed: false,
            last_fn_press: None,
        }
    }

    /// Feed one raw event; returns the debounced edge if one occurred
    pub fn on_event(&mut self, event: RawInputEvent, now: Instant) -> Option<HotkeyEdge> {
        match self.binding {
            HotkeyBinding::Disabled => None,
            HotkeyBinding::RightAlt => self.on_modifier_hold(event, key_code::RIGHT_OPTION),
            HotkeyBinding::RightCommand => self.on_modifier_hold(event, key_code::RIGHT_COMMAND),
            HotkeyBinding::FnDoublePress => self.on_fn_event(event, now),
            HotkeyBinding::Combo {
                key_code: code,
                modifiers,
            } => self.on_combo_event(event, code, modifiers),
        }
    }

    /// Plain modifier hold: edges come from flags changes of one specific
    /// physical key, so the left-hand variant never triggers
    fn on_modifier_hold(&mut self, event: RawInputEvent, want_code: u16) -> Option<HotkeyEdge> {
        let RawInputEvent::FlagsChanged { code, modifiers } = event else {
            return None;
        };
        if code != want_code {
            return None;
        }

        let is_down = match want_code {
            key_code::RIGHT_OPTION => modifiers.option,
            key_code::RIGHT_COMMAND => modifiers.command,
            _ => return None,
        };

        self.flag_edge(is_down)
    }

    fn on_fn_event(&mut self, event: RawInputEvent, now: Instant) -> Option<HotkeyEdge> {
        let RawInputEvent::FlagsChanged { code, modifiers } = event else {
            return None;
        };
        if code != key_code::FUNCTION {
            return None;
        }

        if modifiers.function && !self.pressed {
            // Second press inside the window starts the hold; a lone tap
            // only arms the window
            if self
                .last_fn_press
                .is_some_and(|last| now.duration_since(last) < self.double_press_window)
            {
                self.pressed = true;
                self.last_fn_press = None;
                return Some(HotkeyEdge::Press);
            }
            self.last_fn_press = Some(now);
            return None;
        }

        if !modifiers.function && self.pressed {
            self.pressed = false;
            return Some(HotkeyEdge::Release);
        }

        None
    }

    fn on_combo_event(
        &mut self,
        event: RawInputEvent,
        want_code: u16,
        want_modifiers: Modifiers,
    ) -> Option<HotkeyEdge> {
        match event {
            RawInputEvent::KeyDown { code, modifiers } => {
                // Press only on an exact modifier match at key-down
                if code == want_code && modifiers.chord() == want_modifiers && !self.pressed {
                    self.pressed = true;
                    return Some(HotkeyEdge::Press);
                }
                None
            }
            RawInputEvent::KeyUp { code, .. } => {
                if code == want_code && self.pressed {
                    self.pressed = false;
                    return Some(HotkeyEdge::Release);
                }
                None
            }
            RawInputEvent::FlagsChanged { modifiers, .. } => {
                // Releasing any required modifier before the key ends the hold,
                // so out-of-order release cannot leave a stuck press
                if self.pressed && !modifiers.chord().contains(want_modifiers) {
                    self.pressed = false;
                    return Some(HotkeyEdge::Release);
                }
                None
            }
        }
    }

    fn flag_edge(&mut self, is_down: bool) -> Option<HotkeyEdge> {
        if is_down && !self.pressed {
            self.pressed = true;
            Some(HotkeyEdge::Press)
        } else if !is_down && self.pressed {
            self.pressed = false;
            Some(HotkeyEdge::Release)
        } else {
            None
        }
    }
}

/// Consumer of debounced hotkey edges and permission escalations
pub trait HotkeyEvents: Send + Sync {
    /// The trigger went down; must not block
    fn on_press(&self);
    /// The trigger went up; must not block
    fn on_release(&self);
    /// Permission stayed denied through the poll budget; fired at most once
    fn on_permission_prompt(&self, help: &str);
}

/// Global hotkey detector: permission acquisition plus edge delivery
///
/// Cheap to clone; all clones drive the same monitor.
#[derive(Clone)]
pub struct HotkeyDetector {
    inner: Arc<DetectorInner>,
}

impl HotkeyDetector {
    #[must_use]
    pub fn new(
        observer: Box<dyn HotkeyObserver>,
        permission: Arc<dyn InputPermission>,
        events: Arc<dyn HotkeyEvents>,
        binding: HotkeyBinding,
        tuning: DetectorTuning,
    ) -> Self {
        Self {
            inner: Arc::new(DetectorInner {
                observer: Mutex::new(observer),
                permission,
                events,
                binding,
                tuning,
                running: AtomicBool::new(false),
                prompt_shown: AtomicBool::new(false),
                poll_task: Mutex::new(None),
            }),
        }
    }

    /// Start monitoring; idempotent
    ///
    /// Tears down any active monitor first so no duplicate events can be
    /// delivered. If the input permission is missing, requests it and polls
    /// until granted, then re-attempts automatically.
    pub fn start(&self) {
        DetectorInner::start(&self.inner);
    }

    /// Stop monitoring and permission polling; safe to call repeatedly
    pub fn stop(&self) {
        self.inner.stop();
    }

    /// Full stop + start
    pub fn restart(&self) {
        self.inner.stop();
        DetectorInner::start(&self.inner);
    }

    /// Re-verify permission and restart monitoring if it was silently revoked
    ///
    /// Intended to be called from an app-activation hook.
    pub fn ensure_monitoring(&self) {
        DetectorInner::ensure_monitoring(&self.inner);
    }

    /// Whether the observer is currently installed
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }
}

struct DetectorInner {
    observer: Mutex<Box<dyn HotkeyObserver>>,
    permission: Arc<dyn InputPermission>,
    events: Arc<dyn HotkeyEvents>,
    binding: HotkeyBinding,
    tuning: DetectorTuning,
    running: AtomicBool,
    prompt_shown: AtomicBool,
    poll_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl DetectorInner {
    fn start(this: &Arc<Self>) {
        this.cancel_poll();
        this.teardown_observer();

        if !this.permission.is_granted() {
            info!("input permission not granted, requesting and polling");
            this.permission.request();
            Self::spawn_permission_poll(this);
            return;
        }

        match this.install_observer() {
            Ok(()) => {
                this.running.store(true, Ordering::SeqCst);
                info!(binding = ?this.binding, "hotkey monitoring started");
            }
            Err(e) => {
                // Installation failures behave like a denied permission:
                // recoverable via the poll loop, never fatal
                warn!("failed to install input monitor: {e}");
                Self::spawn_permission_poll(this);
            }
        }
    }

    fn stop(&self) {
        self.cancel_poll();
        self.teardown_observer();
        debug!("hotkey monitoring stopped");
    }

    fn ensure_monitoring(this: &Arc<Self>) {
        if this.running.load(Ordering::SeqCst) && this.permission.is_granted() {
            return;
        }
        if this.poll_active() && !this.permission.is_granted() {
            return;
        }
        info!("monitoring not healthy, restarting");
        Self::start(this);
    }

    fn install_observer(&self) -> Result<(), ObserverError> {
        let events = Arc::clone(&self.events);
        let mut edge = EdgeState::new(self.binding, self.tuning.double_press_window);

        let handler: EventHandler = Box::new(move |event| {
            match edge.on_event(event, Instant::now()) {
                Some(HotkeyEdge::Press) => events.on_press(),
                Some(HotkeyEdge::Release) => events.on_release(),
                None => {}
            }
        });

        let mut observer = self
            .observer
            .lock()
            .map_err(|_| ObserverError::InstallFailed("observer lock poisoned".to_owned()))?;
        observer.install(handler)
    }

    fn teardown_observer(&self) {
        if let Ok(mut observer) = self.observer.lock() {
            observer.uninstall();
        }
        self.running.store(false, Ordering::SeqCst);
    }

    fn spawn_permission_poll(this: &Arc<Self>) {
        let detector = Arc::clone(this);
        let handle = tokio::spawn(async move {
            let mut failed_polls = 0_u32;
            loop {
                tokio::time::sleep(detector.tuning.poll_interval).await;

                if detector.permission.is_granted() {
                    info!("input permission granted, restarting monitoring");
                    Self::start(&detector);
                    break;
                }

                failed_polls += 1;
                if failed_polls == detector.tuning.polls_before_prompt
                    && !detector.prompt_shown.swap(true, Ordering::SeqCst)
                {
                    warn!(
                        polls = failed_polls,
                        "input permission still denied, prompting for remediation"
                    );
                    detector.events.on_permission_prompt(REMEDIATION_HELP);
                }
            }
        });

        if let Ok(mut slot) = this.poll_task.lock() {
            if let Some(old) = slot.replace(handle) {
                old.abort();
            }
        }
    }

    fn cancel_poll(&self) {
        if let Ok(mut slot) = self.poll_task.lock() {
            if let Some(task) = slot.take() {
                task.abort();
            }
        }
    }

    fn poll_active(&self) -> bool {
        self.poll_task
            .lock()
            .map(|slot| slot.as_ref().is_some_and(|task| !task.is_finished()))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    const RIGHT_ALT_DOWN: RawInputEvent = RawInputEvent::FlagsChanged {
        code: key_code::RIGHT_OPTION,
        modifiers: Modifiers {
            option: true,
            ..Modifiers::NONE
        },
    };
    const RIGHT_ALT_UP: RawInputEvent = RawInputEvent::FlagsChanged {
        code: key_code::RIGHT_OPTION,
        modifiers: Modifiers::NONE,
    };

    fn fn_event(down: bool) -> RawInputEvent {
        RawInputEvent::FlagsChanged {
            code: key_code::FUNCTION,
            modifiers: Modifiers {
                function: down,
                ..Modifiers::NONE
            },
        }
    }

    fn hotkey_config(mode: &str, key: Option<&str>, modifiers: &[&str]) -> HotkeyConfig {
        HotkeyConfig {
            mode: mode.to_owned(),
            key: key.map(str::to_owned),
            modifiers: modifiers.iter().map(|&m| m.to_owned()).collect(),
        }
    }

    #[test]
    fn test_resolve_simple_modes() {
        assert_eq!(
            HotkeyBinding::resolve(&hotkey_config("right_alt", None, &[])),
            HotkeyBinding::RightAlt
        );
        assert_eq!(
            HotkeyBinding::resolve(&hotkey_config("right_command", None, &[])),
            HotkeyBinding::RightCommand
        );
        assert_eq!(
            HotkeyBinding::resolve(&hotkey_config("fn_double_press", None, &[])),
            HotkeyBinding::FnDoublePress
        );
    }

    #[test]
    fn test_resolve_combo() {
        let binding =
            HotkeyBinding::resolve(&hotkey_config("combo", Some("Z"), &["Control", "Option"]));
        assert_eq!(
            binding,
            HotkeyBinding::Combo {
                key_code: 6,
                modifiers: Modifiers {
                    control: true,
                    option: true,
                    ..Modifiers::NONE
                }
            }
        );
    }

    #[test]
    fn test_malformed_config_degrades_to_disabled() {
        // Unknown mode
        assert_eq!(
            HotkeyBinding::resolve(&hotkey_config("triple_click", None, &[])),
            HotkeyBinding::Disabled
        );
        // Unknown key name
        assert_eq!(
            HotkeyBinding::resolve(&hotkey_config("combo", Some("Hyper"), &["Control"])),
            HotkeyBinding::Disabled
        );
        // Missing key
        assert_eq!(
            HotkeyBinding::resolve(&hotkey_config("combo", None, &["Control"])),
            HotkeyBinding::Disabled
        );
        // Unknown modifier name
        assert_eq!(
            HotkeyBinding::resolve(&hotkey_config("combo", Some("Z"), &["Control", "Cokebottle"])),
            HotkeyBinding::Disabled
        );
    }

    #[test]
    fn test_disabled_binding_is_noop() {
        let mut edge = EdgeState::new(HotkeyBinding::Disabled, Duration::from_millis(400));
        let now = Instant::now();
        assert_eq!(edge.on_event(RIGHT_ALT_DOWN, now), None);
        assert_eq!(edge.on_event(RIGHT_ALT_UP, now), None);
    }

    #[test]
    fn test_right_alt_press_release() {
        let mut edge = EdgeState::new(HotkeyBinding::RightAlt, Duration::from_millis(400));
        let now = Instant::now();

        assert_eq!(edge.on_event(RIGHT_ALT_DOWN, now), Some(HotkeyEdge::Press));
        // Repeated flags with the key still down: no second press
        assert_eq!(edge.on_event(RIGHT_ALT_DOWN, now), None);
        assert_eq!(edge.on_event(RIGHT_ALT_UP, now), Some(HotkeyEdge::Release));
        assert_eq!(edge.on_event(RIGHT_ALT_UP, now), None);
    }

    #[test]
    fn test_right_alt_ignores_left_option() {
        let mut edge = EdgeState::new(HotkeyBinding::RightAlt, Duration::from_millis(400));
        let left_down = RawInputEvent::FlagsChanged {
            code: key_code::LEFT_OPTION,
            modifiers: Modifiers {
                option: true,
                ..Modifiers::NONE
            },
        };
        assert_eq!(edge.on_event(left_down, Instant::now()), None);
    }

    #[test]
    fn test_right_command_press_release() {
        let mut edge = EdgeState::new(HotkeyBinding::RightCommand, Duration::from_millis(400));
        let now = Instant::now();
        let down = RawInputEvent::FlagsChanged {
            code: key_code::RIGHT_COMMAND,
            modifiers: Modifiers {
                command: true,
                ..Modifiers::NONE
            },
        };
        let up = RawInputEvent::FlagsChanged {
            code: key_code::RIGHT_COMMAND,
            modifiers: Modifiers::NONE,
        };
        assert_eq!(edge.on_event(down, now), Some(HotkeyEdge::Press));
        assert_eq!(edge.on_event(up, now), Some(HotkeyEdge::Release));
    }

    #[test]
    fn test_fn_double_press_within_window() {
        let window = Duration::from_millis(400);
        let mut edge = EdgeState::new(HotkeyBinding::FnDoublePress, window);
        let t0 = Instant::now();

        // First tap arms the window
        assert_eq!(edge.on_event(fn_event(true), t0), None);
        assert_eq!(edge.on_event(fn_event(false), t0 + Duration::from_millis(50)), None);

        // Second press inside the window starts the hold
        assert_eq!(
            edge.on_event(fn_event(true), t0 + Duration::from_millis(200)),
            Some(HotkeyEdge::Press)
        );
        assert_eq!(
            edge.on_event(fn_event(false), t0 + Duration::from_millis(900)),
            Some(HotkeyEdge::Release)
        );
    }

    #[test]
    fn test_fn_single_tap_outside_window_discarded() {
        let window = Duration::from_millis(400);
        let mut edge = EdgeState::new(HotkeyBinding::FnDoublePress, window);
        let t0 = Instant::now();

        assert_eq!(edge.on_event(fn_event(true), t0), None);
        assert_eq!(edge.on_event(fn_event(false), t0 + Duration::from_millis(50)), None);

        // Past the window: this press only re-arms, no edge
        assert_eq!(
            edge.on_event(fn_event(true), t0 + Duration::from_millis(600)),
            None
        );
        assert_eq!(
            edge.on_event(fn_event(false), t0 + Duration::from_millis(650)),
            None
        );

        // But a quick follow-up now triggers
        assert_eq!(
            edge.on_event(fn_event(true), t0 + Duration::from_millis(800)),
            Some(HotkeyEdge::Press)
        );
    }

    const COMBO_MODS: Modifiers = Modifiers {
        control: true,
        option: true,
        ..Modifiers::NONE
    };

    fn combo_edge() -> EdgeState {
        EdgeState::new(
            HotkeyBinding::Combo {
                key_code: 6,
                modifiers: COMBO_MODS,
            },
            Duration::from_millis(400),
        )
    }

    #[test]
    fn test_combo_exact_match_press_and_keyup_release() {
        let mut edge = combo_edge();
        let now = Instant::now();

        let down = RawInputEvent::KeyDown {
            code: 6,
            modifiers: COMBO_MODS,
        };
        let up = RawInputEvent::KeyUp {
            code: 6,
            modifiers: COMBO_MODS,
        };
        assert_eq!(edge.on_event(down, now), Some(HotkeyEdge::Press));
        // Re-entrant key-down while held is ignored
        assert_eq!(edge.on_event(down, now), None);
        assert_eq!(edge.on_event(up, now), Some(HotkeyEdge::Release));
    }

    #[test]
    fn test_combo_superset_modifiers_do_not_match() {
        let mut edge = combo_edge();
        let with_shift = Modifiers {
            shift: true,
            ..COMBO_MODS
        };
        let down = RawInputEvent::KeyDown {
            code: 6,
            modifiers: with_shift,
        };
        assert_eq!(edge.on_event(down, Instant::now()), None);
    }

    #[test]
    fn test_combo_modifier_lift_releases_first() {
        let mut edge = combo_edge();
        let now = Instant::now();

        let down = RawInputEvent::KeyDown {
            code: 6,
            modifiers: COMBO_MODS,
        };
        assert_eq!(edge.on_event(down, now), Some(HotkeyEdge::Press));

        // User lifts Control before the key: release fires immediately
        let ctrl_lifted = RawInputEvent::FlagsChanged {
            code: key_code::LEFT_CONTROL,
            modifiers: Modifiers {
                option: true,
                ..Modifiers::NONE
            },
        };
        assert_eq!(edge.on_event(ctrl_lifted, now), Some(HotkeyEdge::Release));

        // The straggling key-up is then a no-op
        let up = RawInputEvent::KeyUp {
            code: 6,
            modifiers: Modifiers::NONE,
        };
        assert_eq!(edge.on_event(up, now), None);
    }

    #[test]
    fn test_combo_wrong_key_code_ignored() {
        let mut edge = combo_edge();
        let down = RawInputEvent::KeyDown {
            code: 7,
            modifiers: COMBO_MODS,
        };
        assert_eq!(edge.on_event(down, Instant::now()), None);
    }

    // Detector-level tests with scripted doubles

    #[derive(Default)]
    struct ObserverState {
        handler: Option<EventHandler>,
        installs: usize,
        uninstalls: usize,
    }

    #[derive(Clone, Default)]
    struct ScriptedObserver(Arc<Mutex<ObserverState>>);

    impl ScriptedObserver {
        fn send(&self, event: RawInputEvent) {
            let mut state = self.0.lock().unwrap();
            if let Some(handler) = state.handler.as_mut() {
                handler(event);
            }
        }

        fn installs(&self) -> usize {
            self.0.lock().unwrap().installs
        }

        fn uninstalls(&self) -> usize {
            self.0.lock().unwrap().uninstalls
        }
    }

    impl HotkeyObserver for ScriptedObserver {
        fn install(&mut self, handler: EventHandler) -> Result<(), ObserverError> {
            let mut state = self.0.lock().unwrap();
            state.handler = Some(handler);
            state.installs += 1;
            Ok(())
        }

        fn uninstall(&mut self) {
            let mut state = self.0.lock().unwrap();
            state.handler = None;
            state.uninstalls += 1;
        }
    }

    #[derive(Default)]
    struct RecordingEvents {
        presses: AtomicUsize,
        releases: AtomicUsize,
        prompts: AtomicUsize,
    }

    impl HotkeyEvents for RecordingEvents {
        fn on_press(&self) {
            self.presses.fetch_add(1, Ordering::SeqCst);
        }

        fn on_release(&self) {
            self.releases.fetch_add(1, Ordering::SeqCst);
        }

        fn on_permission_prompt(&self, _help: &str) {
            self.prompts.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct TogglePermission(AtomicBool);

    impl InputPermission for TogglePermission {
        fn is_granted(&self) -> bool {
            self.0.load(Ordering::SeqCst)
        }

        fn request(&self) {}
    }

    fn fast_tuning() -> DetectorTuning {
        DetectorTuning {
            double_press_window: Duration::from_millis(400),
            poll_interval: Duration::from_millis(10),
            polls_before_prompt: 3,
        }
    }

    #[tokio::test]
    async fn test_start_installs_and_delivers_edges() {
        let observer = ScriptedObserver::default();
        let events = Arc::new(RecordingEvents::default());
        let detector = HotkeyDetector::new(
            Box::new(observer.clone()),
            Arc::new(TogglePermission(AtomicBool::new(true))),
            Arc::clone(&events) as Arc<dyn HotkeyEvents>,
            HotkeyBinding::RightAlt,
            fast_tuning(),
        );

        detector.start();
        assert!(detector.is_running());
        assert_eq!(observer.installs(), 1);

        observer.send(RIGHT_ALT_DOWN);
        observer.send(RIGHT_ALT_UP);
        assert_eq!(events.presses.load(Ordering::SeqCst), 1);
        assert_eq!(events.releases.load(Ordering::SeqCst), 1);

        detector.stop();
        assert!(!detector.is_running());
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let observer = ScriptedObserver::default();
        let events = Arc::new(RecordingEvents::default());
        let detector = HotkeyDetector::new(
            Box::new(observer.clone()),
            Arc::new(TogglePermission(AtomicBool::new(true))),
            Arc::clone(&events) as Arc<dyn HotkeyEvents>,
            HotkeyBinding::RightAlt,
            fast_tuning(),
        );

        detector.start();
        detector.start();

        // Second start fully tears down before reinstalling
        assert_eq!(observer.installs(), 2);
        assert!(observer.uninstalls() >= 2);
        assert!(detector.is_running());

        // Debounce state was reset, edges still flow exactly once
        observer.send(RIGHT_ALT_DOWN);
        assert_eq!(events.presses.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_permission_poll_prompts_once_then_recovers() {
        let observer = ScriptedObserver::default();
        let events = Arc::new(RecordingEvents::default());
        let permission = Arc::new(TogglePermission(AtomicBool::new(false)));
        let detector = HotkeyDetector::new(
            Box::new(observer.clone()),
            Arc::clone(&permission) as Arc<dyn InputPermission>,
            Arc::clone(&events) as Arc<dyn HotkeyEvents>,
            HotkeyBinding::RightAlt,
            fast_tuning(),
        );

        detector.start();
        assert!(!detector.is_running());
        assert_eq!(observer.installs(), 0);

        // Let well over polls_before_prompt polls fail: prompt fires once
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(events.prompts.load(Ordering::SeqCst), 1);

        // Grant: the poll loop re-attempts start automatically
        permission.0.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(detector.is_running());
        assert_eq!(observer.installs(), 1);
    }

    #[tokio::test]
    async fn test_ensure_monitoring_noop_when_healthy() {
        let observer = ScriptedObserver::default();
        let detector = HotkeyDetector::new(
            Box::new(observer.clone()),
            Arc::new(TogglePermission(AtomicBool::new(true))),
            Arc::new(RecordingEvents::default()) as Arc<dyn HotkeyEvents>,
            HotkeyBinding::RightAlt,
            fast_tuning(),
        );

        detector.start();
        detector.ensure_monitoring();
        // Healthy monitoring is not reinstalled
        assert_eq!(observer.installs(), 1);
    }

    #[tokio::test]
    async fn test_ensure_monitoring_restarts_after_revocation() {
        let observer = ScriptedObserver::default();
        let permission = Arc::new(TogglePermission(AtomicBool::new(true)));
        let detector = HotkeyDetector::new(
            Box::new(observer.clone()),
            Arc::clone(&permission) as Arc<dyn InputPermission>,
            Arc::new(RecordingEvents::default()) as Arc<dyn HotkeyEvents>,
            HotkeyBinding::RightAlt,
            fast_tuning(),
        );

        detector.start();
        assert!(detector.is_running());

        // Silent revocation: the activation hook notices and goes back to polling
        permission.0.store(false, Ordering::SeqCst);
        detector.ensure_monitoring();
        assert!(!detector.is_running());

        // Re-grant: polling restores monitoring
        permission.0.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(detector.is_running());
    }
}
