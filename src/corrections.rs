use crate::config::CorrectionsConfig;
use tracing::{debug, info};

/// Apply configured phrase corrections to a transcript
///
/// Performs case-insensitive fuzzy matching of the whole transcript against
/// the configured phrases. The best match at or above the threshold replaces
/// the transcript; otherwise it passes through unchanged.
pub fn apply_corrections(text: &str, config: &CorrectionsConfig) -> String {
    if !config.enabled || config.entries.is_empty() {
        return text.to_owned();
    }

    let normalized_text = text.to_lowercase();
    let mut best_match: Option<(&str, f64)> = None;

    for (phrase, replacement) in &config.entries {
        let normalized_phrase = phrase.to_lowercase();
        let similarity = strsim::jaro_winkler(&normalized_text, &normalized_phrase);

        debug!(
            phrase = phrase,
            similarity = %similarity,
            threshold = %config.threshold,
            "correction match check"
        );

        if similarity >= config.threshold
            && best_match.is_none_or(|(_, best_score)| similarity > best_score)
        {
            best_match = Some((replacement.as_str(), similarity));
        }
    }

    if let Some((replacement, score)) = best_match {
        info!(
            original = text,
            replacement = replacement,
            similarity = %score,
            "correction applied"
        );
        replacement.to_owned()
    } else {
        text.to_owned()
    }
}
