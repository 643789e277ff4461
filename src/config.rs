use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub hotkey: HotkeyConfig,
    pub audio: AudioConfig,
    pub model: ModelConfig,
    #[serde(default)]
    pub corrections: CorrectionsConfig,
    pub telemetry: TelemetryConfig,
}

/// Raw hotkey settings as written in the config file.
///
/// `mode` selects the binding kind; `key`/`modifiers` are only consulted for
/// `mode = "combo"`. Resolution (including degrading unrecognized names to a
/// disabled binding) happens in [`crate::input::HotkeyBinding::resolve`].
#[derive(Debug, Deserialize, Clone)]
pub struct HotkeyConfig {
    /// One of: `right_alt`, `right_command`, `fn_double_press`, `combo`.
    pub mode: String,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub modifiers: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AudioConfig {
    /// Cadence of the live level meter in milliseconds.
    pub meter_interval_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ModelConfig {
    /// Catalog id of the selected model (e.g. "whisper-base", "parakeet-v2").
    pub id: String,
    /// Language hint for Whisper models; `None` means auto-detect.
    #[serde(default)]
    pub language: Option<String>,
    /// Root directory holding one subdirectory per downloaded model.
    pub models_dir: String,
    pub threads: usize,
    pub beam_size: usize,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct CorrectionsConfig {
    pub enabled: bool,
    #[serde(default = "default_threshold")]
    pub threshold: f64,
    #[serde(default)]
    pub entries: HashMap<String, String>,
}

const fn default_threshold() -> f64 {
    0.85
}

#[derive(Debug, Deserialize, Clone)]
pub struct TelemetryConfig {
    pub enabled: bool,
    pub log_path: String,
}

impl Config {
    /// Load config from ~/.whisper-ptt.toml, creating a default on first run
    ///
    /// # Errors
    /// Returns error if the file cannot be read or parsed.
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;

        if !config_path.exists() {
            Self::create_default(&config_path).context("failed to create default config")?;
        }

        let contents = fs::read_to_string(&config_path).context("failed to read config file")?;

        let config: Self = toml::from_str(&contents).context("failed to parse config TOML")?;

        Ok(config)
    }

    fn config_path() -> Result<PathBuf> {
        let home = std::env::var("HOME").context("HOME environment variable not set")?;
        Ok(PathBuf::from(home).join(".whisper-ptt.toml"))
    }

    fn create_default(path: &PathBuf) -> Result<()> {
        let default_config = r#"[hotkey]
# right_alt | right_command | fn_double_press | combo
mode = "right_alt"
# combo mode only:
# key = "Z"
# modifiers = ["Control", "Option"]

[audio]
meter_interval_ms = 50

[model]
id = "whisper-base"
models_dir = "~/.whisper-ptt/models"
threads = 4
beam_size = 5

[corrections]
enabled = false
threshold = 0.85

[corrections.entries]

[telemetry]
enabled = true
log_path = "~/.whisper-ptt/whisper-ptt.log"
"#;
        fs::write(path, default_config).context("failed to write default config")?;
        Ok(())
    }

    /// Expand ~ in paths to home directory
    ///
    /// # Errors
    /// Returns error if HOME is unset for a path that needs it.
    pub fn expand_path(path: &str) -> Result<PathBuf> {
        if let Some(stripped) = path.strip_prefix("~/") {
            let home = std::env::var("HOME").context("HOME environment variable not set")?;
            Ok(PathBuf::from(home).join(stripped))
        } else {
            Ok(PathBuf::from(path))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_path_with_tilde() {
        let home = std::env::var("HOME").unwrap();
        let result = Config::expand_path("~/models").unwrap();
        assert_eq!(result, PathBuf::from(home).join("models"));
    }

    #[test]
    fn test_expand_path_absolute() {
        let result = Config::expand_path("/var/lib/models").unwrap();
        assert_eq!(result, PathBuf::from("/var/lib/models"));
    }

    #[test]
    fn test_parse_minimal_config() {
        let toml_str = r#"
[hotkey]
mode = "fn_double_press"

[audio]
meter_interval_ms = 50

[model]
id = "parakeet-v2"
models_dir = "/tmp/models"
threads = 4
beam_size = 1

[telemetry]
enabled = false
log_path = "/tmp/ptt.log"
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.hotkey.mode, "fn_double_press");
        assert!(config.hotkey.key.is_none());
        assert!(config.hotkey.modifiers.is_empty());
        assert_eq!(config.model.id, "parakeet-v2");
        assert!(config.model.language.is_none());
        assert!(!config.corrections.enabled);
        assert!((config.corrections.threshold - 0.85).abs() < f64::EPSILON);
    }

    #[test]
    fn test_parse_combo_config() {
        let toml_str = r#"
[hotkey]
mode = "combo"
key = "Z"
modifiers = ["Control", "Option"]

[audio]
meter_interval_ms = 50

[model]
id = "whisper-small"
language = "en"
models_dir = "~/.whisper-ptt/models"
threads = 8
beam_size = 5

[corrections]
enabled = true
threshold = 0.9

[corrections.entries]
"new line" = "\n"

[telemetry]
enabled = true
log_path = "~/.whisper-ptt/whisper-ptt.log"
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.hotkey.key.as_deref(), Some("Z"));
        assert_eq!(config.hotkey.modifiers.len(), 2);
        assert_eq!(config.model.language.as_deref(), Some("en"));
        assert_eq!(config.corrections.entries.len(), 1);
    }
}
