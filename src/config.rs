//! Runtime configuration for the pollers and the HTTP transport.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Configuration shared by every poller built from one transport.
///
/// All fields have defaults, so a TOML file only needs the keys it changes:
///
/// ```toml
/// base_url = "http://127.0.0.1:5601"
/// data_source_id = "f2b1c6"
/// trace_interval_ms = 5000
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollerConfig {
    /// Base URL of the investigation API (e.g. `http://127.0.0.1:5601`).
    pub base_url: String,
    /// Routes requests to a specific backing data source; `None` means default.
    pub data_source_id: Option<String>,
    pub message_interval_ms: u64,
    pub memory_interval_ms: u64,
    pub trace_interval_ms: u64,
    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self::new("http://127.0.0.1:5601")
    }
}

impl PollerConfig {
    /// Create a config with sensible defaults.
    ///
    /// - message / memory / trace interval: 5 s
    /// - connect_timeout: 3 s
    /// - request_timeout: 10 s
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            data_source_id: None,
            message_interval_ms: 5_000,
            memory_interval_ms: 5_000,
            trace_interval_ms: 5_000,
            connect_timeout_ms: 3_000,
            request_timeout_ms: 10_000,
        }
    }

    /// Parse and validate a TOML document.
    ///
    /// # Errors
    /// [`ConfigError::Parse`] on malformed TOML, [`ConfigError::Invalid`] when
    /// [`validate`](Self::validate) rejects the values.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let cfg: PollerConfig = toml::from_str(s)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Read, parse and validate a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.base_url.trim().is_empty() {
            return Err(ConfigError::Invalid("base_url must not be empty".into()));
        }
        for (name, value) in [
            ("message_interval_ms", self.message_interval_ms),
            ("memory_interval_ms", self.memory_interval_ms),
            ("trace_interval_ms", self.trace_interval_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be > 0")));
            }
        }
        Ok(())
    }

    pub fn message_interval(&self) -> Duration {
        Duration::from_millis(self.message_interval_ms)
    }

    pub fn memory_interval(&self) -> Duration {
        Duration::from_millis(self.memory_interval_ms)
    }

    pub fn trace_interval(&self) -> Duration {
        Duration::from_millis(self.trace_interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn config_new_has_default_intervals() {
        let cfg = PollerConfig::new("http://localhost:5601");
        assert_eq!(cfg.trace_interval(), Duration::from_secs(5));
        assert_eq!(cfg.message_interval(), Duration::from_secs(5));
        assert_eq!(cfg.memory_interval(), Duration::from_secs(5));
        assert_eq!(cfg.connect_timeout(), Duration::from_secs(3));
        assert_eq!(cfg.request_timeout(), Duration::from_secs(10));
        assert!(cfg.data_source_id.is_none());
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let cfg = PollerConfig::from_toml_str(
            r#"
            base_url = "http://dashboards:5601"
            data_source_id = "ds-1"
            trace_interval_ms = 2500
            "#,
        )
        .unwrap();
        assert_eq!(cfg.base_url, "http://dashboards:5601");
        assert_eq!(cfg.data_source_id.as_deref(), Some("ds-1"));
        assert_eq!(cfg.trace_interval(), Duration::from_millis(2500));
        assert_eq!(cfg.memory_interval_ms, 5_000);
    }

    #[test]
    fn zero_interval_is_rejected() {
        let err = PollerConfig::from_toml_str("memory_interval_ms = 0").unwrap_err();
        assert!(err.to_string().contains("memory_interval_ms"), "{err}");
    }

    #[test]
    fn empty_base_url_is_rejected() {
        let err = PollerConfig::from_toml_str(r#"base_url = "  ""#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn malformed_toml_is_parse_error() {
        let err = PollerConfig::from_toml_str("base_url = ").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn load_reads_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "base_url = \"http://from-file:5601\"").unwrap();
        let cfg = PollerConfig::load(file.path()).unwrap();
        assert_eq!(cfg.base_url, "http://from-file:5601");
    }

    #[test]
    fn load_missing_file_is_io_error() {
        let err = PollerConfig::load("/definitely/not/here.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
