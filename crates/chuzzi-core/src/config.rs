//! Configuration loading and validation.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

const DEFAULT_LIVE_MODEL: &str = "gemini-2.0-flash-exp";
const DEFAULT_VOICE: &str = "Zephyr";
const DEFAULT_API_KEY_ENV: &str = "GEMINI_API_KEY";
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 15_000;
const DEFAULT_SYSTEM_INSTRUCTION: &str = "You are Chuzzi, a warm and playful voice companion. \
Keep your replies short and conversational, and answer in the language the user speaks.";

/// Top-level Chuzzi configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub live: Option<LiveConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio: Option<AudioConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub transform: Option<TransformConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub history: Option<HistoryConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,
}

/// Remote live-speech service settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LiveConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Environment variable holding the API key (default: `GEMINI_API_KEY`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
    /// WebSocket base URL (default: `wss://generativelanguage.googleapis.com`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<String>,
    /// Longest wait from dialing to the setup acknowledgement (default: 15000).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connect_timeout_ms: Option<u64>,
}

impl LiveConfig {
    /// Resolve the API key: check `api_key` first, then the `api_key_env` variable.
    pub fn resolve_api_key(&self) -> Option<String> {
        let env = self
            .api_key_env
            .clone()
            .or_else(|| Some(DEFAULT_API_KEY_ENV.to_string()));
        resolve_secret_field(&self.api_key, &env)
    }
}

/// Reconnection schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before each reconnect, indexed by attempt.
    #[serde(default = "default_delays_ms")]
    pub delays_ms: Vec<u64>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            delays_ms: default_delays_ms(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_delays_ms() -> Vec<u64> {
    vec![1000, 3000, 5000]
}

/// Audio formats on both sides of the session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioConfig {
    /// Microphone rate sent to the remote (default: 16000).
    #[serde(default = "default_input_sample_rate")]
    pub input_sample_rate: u32,
    /// Speaker rate to open (default: 24000). Falls back to the device
    /// default when the speaker cannot play it.
    #[serde(default = "default_output_sample_rate")]
    pub output_sample_rate: u32,
    /// Speaker channel count to open, with the same fallback (default: 1).
    #[serde(default = "default_output_channels")]
    pub output_channels: u16,
    /// Samples per capture frame.
    #[serde(default = "default_frame_size")]
    pub frame_size: usize,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            input_sample_rate: default_input_sample_rate(),
            output_sample_rate: default_output_sample_rate(),
            output_channels: default_output_channels(),
            frame_size: default_frame_size(),
        }
    }
}

fn default_input_sample_rate() -> u32 {
    16000
}

fn default_output_sample_rate() -> u32 {
    24000
}

fn default_output_channels() -> u16 {
    1
}

fn default_frame_size() -> usize {
    512
}

/// Script conversion applied to finalized user text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default = "default_transform_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_transform_timeout_ms() -> u64 {
    8000
}

/// Conversation log persistence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// History file (default: `~/.chuzzi/history.json`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log format: "plain" (default) or "json".
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log level override (trace/debug/info/warn/error).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,

    /// Per-crate log level overrides (e.g. "chuzzi_session=debug").
    #[serde(default)]
    pub filters: Vec<String>,

    /// Output target: "stderr" (default) or "stdout".
    #[serde(default = "default_log_output")]
    pub output: String,
}

fn default_log_format() -> String {
    "plain".into()
}

fn default_log_output() -> String {
    "stderr".into()
}

/// Resolve a secret: check the direct value first, then the env-var reference.
pub fn resolve_secret_field(direct: &Option<String>, env_var: &Option<String>) -> Option<String> {
    if let Some(val) = direct {
        if !val.is_empty() {
            return Some(val.clone());
        }
    }
    if let Some(env) = env_var {
        if let Ok(val) = std::env::var(env) {
            if !val.is_empty() {
                return Some(val);
            }
        }
    }
    None
}

/// Substitute `${ENV_VAR}` patterns in a string with their environment variable values.
fn substitute_env_vars(input: &str) -> String {
    let re = match regex::Regex::new(r"\$\{([^}]+)\}") {
        Ok(re) => re,
        Err(_) => return input.to_string(),
    };
    re.replace_all(input, |caps: &regex::Captures| {
        let var_name = &caps[1];
        std::env::var(var_name).unwrap_or_default()
    })
    .into_owned()
}

impl Config {
    /// Load config from a JSON5 file, substituting `${ENV_VAR}` references.
    pub fn load(path: &Path) -> crate::error::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path).map_err(crate::error::ChuzziError::Io)?;

        // Substitute ${ENV_VAR} references before parsing
        let substituted = substitute_env_vars(&raw);

        let config: Config = json5::from_str(&substituted)
            .map_err(|e| crate::error::ChuzziError::Config(e.to_string()))?;

        Ok(config)
    }

    /// Default config file path.
    pub fn config_path() -> PathBuf {
        data_dir().join("config.json")
    }

    /// Resolved API key for the live service, if any.
    pub fn api_key(&self) -> Option<String> {
        self.live
            .clone()
            .unwrap_or_default()
            .resolve_api_key()
    }

    pub fn live_base_url(&self) -> Option<String> {
        self.live.as_ref().and_then(|l| l.base_url.clone())
    }

    pub fn live_model(&self) -> String {
        self.live
            .as_ref()
            .and_then(|l| l.model.clone())
            .unwrap_or_else(|| DEFAULT_LIVE_MODEL.to_string())
    }

    pub fn voice(&self) -> String {
        self.live
            .as_ref()
            .and_then(|l| l.voice.clone())
            .unwrap_or_else(|| DEFAULT_VOICE.to_string())
    }

    pub fn system_instruction(&self) -> String {
        self.live
            .as_ref()
            .and_then(|l| l.system_instruction.clone())
            .unwrap_or_else(|| DEFAULT_SYSTEM_INSTRUCTION.to_string())
    }

    /// Bound on the whole opening handshake, setup acknowledgement included.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(
            self.live
                .as_ref()
                .and_then(|l| l.connect_timeout_ms)
                .unwrap_or(DEFAULT_CONNECT_TIMEOUT_MS),
        )
    }

    pub fn retry(&self) -> RetryConfig {
        self.retry.clone().unwrap_or_default()
    }

    /// Reconnect delays as durations, indexed by attempt.
    pub fn retry_delays(&self) -> Vec<Duration> {
        self.retry()
            .delays_ms
            .into_iter()
            .map(Duration::from_millis)
            .collect()
    }

    pub fn audio(&self) -> AudioConfig {
        self.audio.clone().unwrap_or_default()
    }

    /// Whether finalized user text goes through the script conversion step.
    pub fn transform_enabled(&self) -> bool {
        self.transform.as_ref().is_none_or(|t| t.enabled)
    }

    pub fn transform_model(&self) -> String {
        self.transform
            .as_ref()
            .and_then(|t| t.model.clone())
            .unwrap_or_else(|| DEFAULT_LIVE_MODEL.to_string())
    }

    pub fn transform_timeout(&self) -> Duration {
        Duration::from_millis(
            self.transform
                .as_ref()
                .map(|t| t.timeout_ms)
                .unwrap_or_else(default_transform_timeout_ms),
        )
    }

    pub fn history_enabled(&self) -> bool {
        self.history.as_ref().is_none_or(|h| h.enabled)
    }

    /// Resolve the history file path.
    pub fn history_path(&self) -> PathBuf {
        self.history
            .as_ref()
            .and_then(|h| h.path.as_ref())
            .map(|p| {
                let expanded = shellexpand::tilde(p);
                PathBuf::from(expanded.as_ref())
            })
            .unwrap_or_else(|| data_dir().join("history.json"))
    }

    /// Get a config value by dotted path (e.g. "retry.max_attempts", "live.voice").
    pub fn get_path(&self, path: &str) -> Option<serde_json::Value> {
        let json = serde_json::to_value(self).ok()?;
        let mut current = &json;
        for segment in path.split('.') {
            current = current.get(segment)?;
        }
        Some(current.clone())
    }

    /// Validate config, returning (warnings, errors).
    pub fn validate(&self) -> (Vec<String>, Vec<String>) {
        let mut warnings = Vec::new();
        let mut errors = Vec::new();

        if self.api_key().is_none() {
            warnings.push("Live service has no API key configured".to_string());
        }

        if self.connect_timeout().is_zero() {
            errors.push("live.connect_timeout_ms cannot be 0".to_string());
        }

        let retry = self.retry();
        if (retry.delays_ms.len() as u64) < retry.max_attempts as u64 {
            errors.push(format!(
                "retry.delays_ms has {} entries but max_attempts is {}",
                retry.delays_ms.len(),
                retry.max_attempts
            ));
        }

        let audio = self.audio();
        if audio.input_sample_rate == 0 || audio.output_sample_rate == 0 {
            errors.push("Audio sample rates cannot be 0".to_string());
        }
        if audio.output_channels == 0 {
            errors.push("audio.output_channels cannot be 0".to_string());
        }
        if audio.frame_size == 0 {
            errors.push("audio.frame_size cannot be 0".to_string());
        }

        if self.transform_enabled() && self.transform_timeout().is_zero() {
            warnings.push("transform.timeout_ms is 0; user text will never be converted".to_string());
        }

        (warnings, errors)
    }

    /// Save config to a file.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, json)?;
        Ok(())
    }
}

/// Base directory for Chuzzi data: `~/.chuzzi/`
pub fn data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".chuzzi")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_var_substitution() {
        // SAFETY: test-only, variable name unique to this test
        unsafe { std::env::set_var("TEST_CHUZZI_KEY", "key-123") };
        let input = r#"{"key": "${TEST_CHUZZI_KEY}", "other": "plain"}"#;
        let result = substitute_env_vars(input);
        assert!(result.contains("key-123"));
        assert!(result.contains("plain"));
        unsafe { std::env::remove_var("TEST_CHUZZI_KEY") };
    }

    #[test]
    fn test_env_var_missing() {
        let input = r#"{"key": "${NONEXISTENT_VAR_CHUZZI_TEST}"}"#;
        let result = substitute_env_vars(input);
        assert!(result.contains(r#""""#)); // empty string
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.live_model(), "gemini-2.0-flash-exp");
        assert_eq!(config.voice(), "Zephyr");
        assert_eq!(config.connect_timeout(), Duration::from_secs(15));
        assert_eq!(config.retry().max_attempts, 3);
        assert_eq!(
            config.retry_delays(),
            vec![
                Duration::from_millis(1000),
                Duration::from_millis(3000),
                Duration::from_millis(5000)
            ]
        );
        assert_eq!(config.audio().input_sample_rate, 16000);
        assert_eq!(config.audio().output_sample_rate, 24000);
        assert!(config.transform_enabled());
        assert!(config.history_enabled());
        assert!(config.history_path().ends_with("history.json"));
    }

    #[test]
    fn test_live_resolve_api_key() {
        // SAFETY: test-only, variable name unique to this test
        unsafe { std::env::set_var("TEST_CHUZZI_API_KEY", "from-env") };
        let live = LiveConfig {
            api_key_env: Some("TEST_CHUZZI_API_KEY".into()),
            ..LiveConfig::default()
        };
        assert_eq!(live.resolve_api_key(), Some("from-env".into()));

        let live2 = LiveConfig {
            api_key: Some("direct-key".into()),
            api_key_env: Some("TEST_CHUZZI_API_KEY".into()),
            ..LiveConfig::default()
        };
        // Direct key takes priority
        assert_eq!(live2.resolve_api_key(), Some("direct-key".into()));
        unsafe { std::env::remove_var("TEST_CHUZZI_API_KEY") };
    }

    #[test]
    fn test_partial_sections_use_defaults() {
        let json_str = r#"{
            retry: { max_attempts: 5, delays_ms: [100, 200, 300, 400, 500] },
            audio: { output_sample_rate: 48000 },
            transform: { enabled: false },
        }"#;
        let config: Config = json5::from_str(json_str).unwrap();
        assert_eq!(config.retry().max_attempts, 5);
        assert_eq!(config.retry_delays().len(), 5);
        let audio = config.audio();
        assert_eq!(audio.output_sample_rate, 48000);
        assert_eq!(audio.input_sample_rate, 16000);
        assert_eq!(audio.frame_size, 512);
        assert!(!config.transform_enabled());
        assert_eq!(config.transform_timeout(), Duration::from_millis(8000));
    }

    #[test]
    fn test_logging_config_defaults() {
        // Deserialize an empty logging config to get the serde defaults
        let json_str = r#"{ "logging": {} }"#;
        let config: Config = json5::from_str(json_str).unwrap();
        let logging = config.logging.expect("logging should be present");
        assert_eq!(logging.format, "plain");
        assert!(logging.level.is_none());
        assert_eq!(logging.output, "stderr");
        assert!(logging.filters.is_empty());
    }

    #[test]
    fn test_logging_config_filters() {
        let json_str = r#"{
            "logging": {
                "format": "json",
                "filters": ["chuzzi_session=debug", "chuzzi_live=trace"]
            }
        }"#;
        let config: Config = json5::from_str(json_str).unwrap();
        let logging = config.logging.expect("logging should be present");
        assert_eq!(logging.format, "json");
        assert_eq!(logging.filters.len(), 2);
        assert_eq!(logging.filters[1], "chuzzi_live=trace");
    }

    #[test]
    fn test_validate_missing_api_key_warns() {
        let config = Config {
            live: Some(LiveConfig {
                api_key_env: Some("NONEXISTENT_CHUZZI_KEY_VAR".into()),
                ..LiveConfig::default()
            }),
            ..Config::default()
        };
        let (warnings, errors) = config.validate();
        assert!(
            warnings.iter().any(|w| w.to_lowercase().contains("key")),
            "Expected a warning about the missing API key, got: {warnings:?}"
        );
        assert!(errors.is_empty(), "unexpected errors: {errors:?}");
    }

    #[test]
    fn test_validate_short_delay_schedule_errors() {
        let config = Config {
            retry: Some(RetryConfig {
                max_attempts: 4,
                delays_ms: vec![1000, 2000],
            }),
            audio: Some(AudioConfig {
                output_channels: 0,
                ..AudioConfig::default()
            }),
            ..Config::default()
        };
        let (_warnings, errors) = config.validate();
        assert!(errors.iter().any(|e| e.contains("delays_ms")), "got: {errors:?}");
        assert!(errors.iter().any(|e| e.contains("output_channels")), "got: {errors:?}");
    }

    #[test]
    fn test_connect_timeout_override_and_zero() {
        let config: Config = json5::from_str("{ live: { connect_timeout_ms: 2500 } }").unwrap();
        assert_eq!(config.connect_timeout(), Duration::from_millis(2500));
        assert!(config.validate().1.is_empty());

        let zero: Config = json5::from_str("{ live: { connect_timeout_ms: 0 } }").unwrap();
        let (_warnings, errors) = zero.validate();
        assert!(errors.iter().any(|e| e.contains("connect_timeout_ms")), "got: {errors:?}");
    }

    #[test]
    fn test_get_path_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let config = Config {
            live: Some(LiveConfig {
                voice: Some("Puck".into()),
                ..LiveConfig::default()
            }),
            ..Config::default()
        };
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.voice(), "Puck");
        assert_eq!(loaded.get_path("live.voice"), Some(serde_json::json!("Puck")));
        assert_eq!(loaded.get_path("live.missing"), None);
    }

    #[test]
    fn test_load_missing_file_is_default() {
        let config = Config::load(Path::new("/nonexistent/chuzzi/config.json")).unwrap();
        assert!(config.live.is_none());
    }
}
