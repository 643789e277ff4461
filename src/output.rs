//! Text delivery sinks.
//!
//! The session only knows the [`crate::session::TextSink`] capability; the
//! platform-specific delivery lives here.

use tracing::info;

use crate::session::TextSink;

/// Preview of delivered text for logging (truncated, UTF-8 safe)
#[must_use]
pub fn text_preview(text: &str) -> String {
    if text.len() > 50 {
        let mut end = 47.min(text.len());
        while end > 0 && !text.is_char_boundary(end) {
            end -= 1;
        }
        if end == 0 {
            return "...".to_owned();
        }
        format!("{}...", &text[..end])
    } else {
        text.to_owned()
    }
}

/// Delivery via synthesized keyboard events (macOS)
///
/// Posts one keyboard event carrying the whole string as its Unicode
/// payload, which types at the current cursor position. Some targets
/// (secure input fields) silently ignore posted events.
#[cfg(target_os = "macos")]
pub struct CgEventSink;

#[cfg(target_os = "macos")]
impl TextSink for CgEventSink {
    fn deliver_text(&self, text: &str) {
        use core_graphics::event::{CGEvent, CGEventTapLocation};
        use core_graphics::event_source::{CGEventSource, CGEventSourceStateID};

        if text.is_empty() {
            return;
        }

        let Ok(source) = CGEventSource::new(CGEventSourceStateID::HIDSystemState) else {
            tracing::error!("failed to create event source - input permission may be revoked");
            return;
        };
        let Ok(event) = CGEvent::new_keyboard_event(source, 0, true) else {
            tracing::error!("failed to create keyboard event");
            return;
        };

        // encode_utf16 on &str always produces valid UTF-16
        let utf16: Vec<u16> = text.encode_utf16().collect();
        event.set_string_from_utf16_unchecked(&utf16);
        event.post(CGEventTapLocation::HID);

        info!(
            text_len = text.len(),
            text_preview = %text_preview(text),
            "text delivered at cursor"
        );
    }
}

/// Fallback sink that only logs; used where no delivery backend exists
pub struct LogOnlySink;

impl TextSink for LogOnlySink {
    fn deliver_text(&self, text: &str) {
        info!(
            text_len = text.len(),
            text_preview = %text_preview(text),
            "transcript ready (no delivery backend on this platform)"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preview_short_text_unchanged() {
        assert_eq!(text_preview("hello"), "hello");
        assert_eq!(text_preview(""), "");
    }

    #[test]
    fn test_preview_exactly_fifty_chars() {
        let text = "a".repeat(50);
        assert_eq!(text_preview(&text), text);
    }

    #[test]
    fn test_preview_long_text_truncated() {
        let text = "a".repeat(100);
        let preview = text_preview(&text);
        assert!(preview.len() <= 50);
        assert!(preview.ends_with("..."));
    }

    #[test]
    fn test_preview_respects_char_boundaries() {
        let text = "\u{1f44b}".repeat(30);
        let preview = text_preview(&text);
        assert!(preview.ends_with("..."));
        assert!(preview.len() < text.len());
    }
}
