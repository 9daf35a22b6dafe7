/// Monitor configuration, read from the environment (after `.env` is loaded).
use std::path::PathBuf;
use std::time::Duration;

use url::Url;

use crate::errors::{TubewatchError, TubewatchResult};

pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:5000/";
pub const DEFAULT_HIDE_DELAY_MS: u64 = 5000;
pub const DEFAULT_RETRY_MS: u64 = 3000;

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Origin used to resolve relative download hrefs.
    pub base_url: Url,
    /// How long the surface stays visible after a completion payload.
    pub hide_delay: Duration,
    /// Initial reconnect delay for the progress stream.
    pub retry_delay: Duration,
    /// Where the native transfer saves files. `None` disables it.
    pub save_dir: Option<PathBuf>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            base_url: Url::parse(DEFAULT_BASE_URL).expect("default base URL is valid"),
            hide_delay: Duration::from_millis(DEFAULT_HIDE_DELAY_MS),
            retry_delay: Duration::from_millis(DEFAULT_RETRY_MS),
            save_dir: None,
        }
    }
}

impl MonitorConfig {
    /// Read `TUBEWATCH_*` variables, falling back to defaults.
    pub fn from_env() -> TubewatchResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from any key lookup. Unparseable durations fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> TubewatchResult<Self> {
        let base_url = match lookup("TUBEWATCH_BASE_URL") {
            Some(raw) => parse_base_url(&raw)?,
            None => Url::parse(DEFAULT_BASE_URL).expect("default base URL is valid"),
        };
        let hide_delay_ms: u64 = lookup("TUBEWATCH_HIDE_DELAY_MS")
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(DEFAULT_HIDE_DELAY_MS);
        let retry_ms: u64 = lookup("TUBEWATCH_RETRY_MS")
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(DEFAULT_RETRY_MS);
        let save_dir = lookup("TUBEWATCH_SAVE_DIR")
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .map(PathBuf::from);

        Ok(Self {
            base_url,
            hide_delay: Duration::from_millis(hide_delay_ms),
            retry_delay: Duration::from_millis(retry_ms),
            save_dir,
        })
    }
}

/// Parse a server origin, adding the trailing slash `Url::join` needs.
pub fn parse_base_url(raw: &str) -> TubewatchResult<Url> {
    let raw = raw.trim();
    let normalized = if raw.ends_with('/') {
        raw.to_string()
    } else {
        format!("{}/", raw)
    };
    Url::parse(&normalized)
        .map_err(|e| TubewatchError::Config(format!("TUBEWATCH_BASE_URL '{}': {}", raw, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = MonitorConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.base_url.as_str(), DEFAULT_BASE_URL);
        assert_eq!(config.hide_delay, Duration::from_millis(5000));
        assert_eq!(config.retry_delay, Duration::from_millis(3000));
        assert!(config.save_dir.is_none());
    }

    #[test]
    fn test_overrides() {
        let config = MonitorConfig::from_lookup(lookup(&[
            ("TUBEWATCH_BASE_URL", "http://media.local:8080"),
            ("TUBEWATCH_HIDE_DELAY_MS", "250"),
            ("TUBEWATCH_RETRY_MS", "nope"),
            ("TUBEWATCH_SAVE_DIR", "./downloads"),
        ]))
        .unwrap();
        assert_eq!(config.base_url.as_str(), "http://media.local:8080/");
        assert_eq!(config.hide_delay, Duration::from_millis(250));
        assert_eq!(config.retry_delay, Duration::from_millis(DEFAULT_RETRY_MS));
        assert_eq!(config.save_dir, Some(PathBuf::from("./downloads")));
    }

    #[test]
    fn test_bad_base_url() {
        let err = MonitorConfig::from_lookup(lookup(&[("TUBEWATCH_BASE_URL", "not a url")])).unwrap_err();
        assert!(matches!(err, TubewatchError::Config(_)));
    }
}
