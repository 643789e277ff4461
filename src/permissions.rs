//! OS permission probing for global input monitoring.
//!
//! The detector never talks to the OS directly; it polls an injected
//! [`InputPermission`] so tests can script grant/revoke sequences.

/// Gate for the OS-level permission required to observe global input
pub trait InputPermission: Send + Sync {
    /// Whether the permission is currently granted
    fn is_granted(&self) -> bool;

    /// Trigger the OS permission request flow (prompt, settings deep-link)
    fn request(&self);
}

/// Permission gate for platforms without an input-monitoring gate
///
/// Linux/Windows input access is governed outside the process (e.g. the
/// `input` group); there is nothing to poll, so this always reports granted.
pub struct Unrestricted;

impl InputPermission for Unrestricted {
    fn is_granted(&self) -> bool {
        true
    }

    fn request(&self) {}
}

/// macOS Input Monitoring permission, probed via `CGEventSource`
#[cfg(target_os = "macos")]
pub struct MacosInputMonitoring;

#[cfg(target_os = "macos")]
impl InputPermission for MacosInputMonitoring {
    fn is_granted(&self) -> bool {
        use core_graphics::event_source::{CGEventSource, CGEventSourceStateID};

        // Creating a HIDSystemState source requires Input Monitoring
        CGEventSource::new(CGEventSourceStateID::HIDSystemState).is_ok()
    }

    fn request(&self) {
        use core_graphics::event::CGEvent;
        use core_graphics::event_source::{CGEventSource, CGEventSourceStateID};

        tracing::info!("requesting input monitoring permission");

        // Attempting to create an event triggers the system prompt the first
        // time and is a no-op once the user has decided either way.
        if let Ok(source) = CGEventSource::new(CGEventSourceStateID::HIDSystemState) {
            let _ = CGEvent::new_keyboard_event(source, 0, true);
        }
    }
}

/// Human-readable remediation instructions for a denied input permission
pub const REMEDIATION_HELP: &str = "Input monitoring permission denied. Enable it in \
System Settings \u{2192} Privacy & Security \u{2192} Input Monitoring, add and enable this \
app, then restart monitoring.";
