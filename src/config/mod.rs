//! Configuration: JSON file at `~/.calendar-assistant/config.json` plus
//! environment overrides.
//!
//! Misconfigured cache capacities never fail the load; they fall back to
//! [`DEFAULT_CLIENT_CACHE_SIZE`] / [`DEFAULT_TOOL_CACHE_SIZE`] with a warning.

pub mod watcher;

use std::path::{Path, PathBuf};

use chrono::{FixedOffset, Offset, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::error::{CalendarError, Result};

/// Fallback capacity for the backend response cache.
pub const DEFAULT_CLIENT_CACHE_SIZE: i64 = 128;

/// Fallback capacity for the event query cache.
pub const DEFAULT_TOOL_CACHE_SIZE: i64 = 256;

/// Default model for the Gemini backend.
pub const DEFAULT_MODEL: &str = "gemini-2.0-flash";

/// Europe/Rome standard time.
pub const DEFAULT_UTC_OFFSET_MINUTES: i32 = 60;

/// Cache tier switches and capacities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Backend response (fingerprint) cache on/off.
    pub client_enabled: bool,
    /// Backend response cache capacity. `<= 0` disables writes.
    #[serde(deserialize_with = "lenient_client_capacity")]
    pub client_max_entries: i64,
    /// Event query cache on/off.
    pub tool_enabled: bool,
    /// Event query cache capacity. `<= 0` disables writes.
    #[serde(deserialize_with = "lenient_tool_capacity")]
    pub tool_max_entries: i64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            client_enabled: true,
            client_max_entries: DEFAULT_CLIENT_CACHE_SIZE,
            tool_enabled: true,
            tool_max_entries: DEFAULT_TOOL_CACHE_SIZE,
        }
    }
}

/// Telemetry switches.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Emit cache-hit and turn-summary events.
    pub enabled: bool,
    /// Log as JSON lines instead of human-readable text.
    pub json_logs: bool,
}

/// Agent loop limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Maximum chat/tool rounds per turn.
    pub max_steps: usize,
    /// Maximum REPL turns per session.
    pub max_turns: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_steps: 8,
            max_turns: 15,
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Event file location. `None` means `~/.calendar-assistant/events.json`.
    pub db_path: Option<PathBuf>,
    /// Tools answer with JSON payloads instead of prose.
    pub structured_output: bool,
    /// Offset applied to timestamps that carry none.
    pub timezone_offset_minutes: i32,
    /// Add a few demo events when the store starts empty.
    pub seed_demo_events: bool,
    pub cache: CacheConfig,
    pub telemetry: TelemetryConfig,
    pub agent: AgentConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            api_key: None,
            db_path: None,
            structured_output: false,
            timezone_offset_minutes: DEFAULT_UTC_OFFSET_MINUTES,
            seed_demo_events: true,
            cache: CacheConfig::default(),
            telemetry: TelemetryConfig::default(),
            agent: AgentConfig::default(),
        }
    }
}

impl Config {
    /// `~/.calendar-assistant`
    pub fn dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".calendar-assistant")
    }

    /// `~/.calendar-assistant/config.json`
    pub fn path() -> PathBuf {
        Self::dir().join("config.json")
    }

    /// Load from the default path, then apply environment overrides.
    pub fn load() -> Result<Self> {
        Self::load_from_path(&Self::path())
    }

    /// Load from `path` (missing file = defaults), then apply environment
    /// overrides so reloads see the same precedence as startup.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let mut config = match std::fs::read_to_string(path) {
            Ok(data) => serde_json::from_str::<Config>(&data).map_err(|e| {
                CalendarError::Config(format!("{}: {}", path.display(), e))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Config::default(),
            Err(e) => return Err(e.into()),
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply overrides from the process environment.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|name| std::env::var(name).ok());
    }

    /// Apply overrides from an arbitrary lookup (the environment in
    /// production, a map in tests).
    pub fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(model) = lookup("MODEL").filter(|m| !m.trim().is_empty()) {
            self.model = model.trim().to_string();
        }
        if let Some(key) = lookup("GEMINI_API_KEY")
            .or_else(|| lookup("GOOGLE_API_KEY"))
            .filter(|k| !k.is_empty())
        {
            self.api_key = Some(key);
        }
        if let Some(path) = lookup("CALENDAR_DB_PATH").filter(|p| !p.is_empty()) {
            self.db_path = Some(PathBuf::from(path));
        }
        if let Some(v) = lookup("CALENDAR_STRUCTURED_OUTPUT") {
            self.structured_output = env_truthy(&v);
        }
        if let Some(v) = lookup("CALENDAR_CLIENT_CACHE_ENABLED") {
            self.cache.client_enabled = env_truthy(&v);
        }
        if let Some(v) = lookup("CALENDAR_CLIENT_CACHE_SIZE") {
            self.cache.client_max_entries = parse_capacity(&v, DEFAULT_CLIENT_CACHE_SIZE);
        }
        if let Some(v) = lookup("CALENDAR_TOOL_CACHE_ENABLED") {
            self.cache.tool_enabled = env_truthy(&v);
        }
        if let Some(v) = lookup("CALENDAR_TOOL_CACHE_SIZE") {
            self.cache.tool_max_entries = parse_capacity(&v, DEFAULT_TOOL_CACHE_SIZE);
        }
        if let Some(v) = lookup("CALENDAR_TRACING") {
            self.telemetry.enabled = env_truthy(&v);
        }
        if let Some(v) = lookup("CALENDAR_UTC_OFFSET_MINUTES") {
            match v.trim().parse::<i32>() {
                Ok(minutes) => self.timezone_offset_minutes = minutes,
                Err(_) => warn!(value = %v, "Ignoring non-numeric CALENDAR_UTC_OFFSET_MINUTES"),
            }
        }
    }

    /// Resolved event file path.
    pub fn db_path(&self) -> PathBuf {
        self.db_path
            .clone()
            .unwrap_or_else(|| Self::dir().join("events.json"))
    }

    /// Offset used to normalize timestamps that carry none.
    ///
    /// Out-of-range offsets fall back to UTC.
    pub fn timezone(&self) -> FixedOffset {
        self.timezone_offset_minutes
            .checked_mul(60)
            .and_then(FixedOffset::east_opt)
            .unwrap_or_else(|| {
                warn!(
                    minutes = self.timezone_offset_minutes,
                    "Invalid UTC offset, using UTC"
                );
                Utc.fix()
            })
    }
}

/// `1`, `true` and `yes` (any case, surrounding whitespace ignored) are truthy.
pub fn env_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes"
    )
}

/// Parse a cache capacity, falling back to `default` on non-numeric input.
pub fn parse_capacity(raw: &str, default: i64) -> i64 {
    match raw.trim().parse::<i64>() {
        Ok(n) => n,
        Err(_) => {
            warn!(value = %raw, default, "Non-numeric cache capacity, using default");
            default
        }
    }
}

fn capacity_from_value(value: &Value, default: i64) -> i64 {
    match value {
        Value::Number(n) => n.as_i64().unwrap_or_else(|| {
            warn!(value = %n, default, "Cache capacity out of range, using default");
            default
        }),
        Value::String(s) => parse_capacity(s, default),
        other => {
            warn!(value = %other, default, "Invalid cache capacity, using default");
            default
        }
    }
}

fn lenient_client_capacity<'de, D>(deserializer: D) -> std::result::Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(capacity_from_value(&value, DEFAULT_CLIENT_CACHE_SIZE))
}

fn lenient_tool_capacity<'de, D>(deserializer: D) -> std::result::Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(capacity_from_value(&value, DEFAULT_TOOL_CACHE_SIZE))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn overrides(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_cache_config_defaults() {
        let cfg = CacheConfig::default();
        assert!(cfg.client_enabled);
        assert!(cfg.tool_enabled);
        assert_eq!(cfg.client_max_entries, 128);
        assert_eq!(cfg.tool_max_entries, 256);
    }

    #[test]
    fn test_telemetry_disabled_by_default() {
        assert!(!Config::default().telemetry.enabled);
    }

    #[test]
    fn test_env_truthy() {
        assert!(env_truthy("1"));
        assert!(env_truthy("TRUE"));
        assert!(env_truthy(" yes "));
        assert!(!env_truthy("0"));
        assert!(!env_truthy("false"));
        assert!(!env_truthy(""));
    }

    #[test]
    fn test_parse_capacity_falls_back_on_garbage() {
        assert_eq!(parse_capacity("64", 128), 64);
        assert_eq!(parse_capacity("-3", 128), -3);
        assert_eq!(parse_capacity("lots", 128), 128);
        assert_eq!(parse_capacity("", 7), 7);
    }

    #[test]
    fn test_overrides_toggle_cache_layers_independently() {
        let mut cfg = Config::default();
        cfg.apply_overrides_from(overrides(&[
            ("CALENDAR_CLIENT_CACHE_ENABLED", "0"),
            ("CALENDAR_TOOL_CACHE_ENABLED", "1"),
            ("CALENDAR_TRACING", "true"),
        ]));
        assert!(!cfg.cache.client_enabled);
        assert!(cfg.cache.tool_enabled);
        assert!(cfg.telemetry.enabled);
    }

    #[test]
    fn test_overrides_non_numeric_size_uses_default() {
        let mut cfg = Config::default();
        cfg.cache.client_max_entries = 5;
        cfg.apply_overrides_from(overrides(&[("CALENDAR_CLIENT_CACHE_SIZE", "big")]));
        assert_eq!(cfg.cache.client_max_entries, DEFAULT_CLIENT_CACHE_SIZE);
    }

    #[test]
    fn test_overrides_api_key_prefers_gemini_key() {
        let mut cfg = Config::default();
        cfg.apply_overrides_from(overrides(&[
            ("GOOGLE_API_KEY", "google"),
            ("GEMINI_API_KEY", "gemini"),
        ]));
        assert_eq!(cfg.api_key.as_deref(), Some("gemini"));
    }

    #[test]
    fn test_file_capacity_accepts_strings_and_garbage() {
        let json = r#"{"cache": {"client_max_entries": "32", "tool_max_entries": "many"}}"#;
        let cfg: Config = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.cache.client_max_entries, 32);
        assert_eq!(cfg.cache.tool_max_entries, DEFAULT_TOOL_CACHE_SIZE);
        assert!(cfg.cache.client_enabled, "unspecified fields keep defaults");
    }

    #[test]
    fn test_load_from_missing_path_is_default_shape() {
        let tmp = tempfile::TempDir::new().unwrap();
        let cfg = Config::load_from_path(&tmp.path().join("absent.json")).unwrap();
        assert_eq!(cfg.agent, AgentConfig::default());
    }

    #[test]
    fn test_load_from_corrupt_path_errors() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("config.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            Config::load_from_path(&path),
            Err(CalendarError::Config(_))
        ));
    }

    #[test]
    fn test_timezone_default_is_plus_one() {
        let tz = Config::default().timezone();
        assert_eq!(tz.local_minus_utc(), 3600);
    }

    #[test]
    fn test_timezone_out_of_range_falls_back_to_utc() {
        let cfg = Config {
            timezone_offset_minutes: 100_000,
            ..Default::default()
        };
        assert_eq!(cfg.timezone().local_minus_utc(), 0);
    }
}
