/// Hotkey edge detection and permission recovery
pub mod detector;
/// Raw global-input observation
pub mod observer;

pub use detector::{DetectorTuning, HotkeyBinding, HotkeyDetector, HotkeyEdge, HotkeyEvents};
pub use observer::{HotkeyObserver, Modifiers, RawInputEvent, RdevObserver};
