//! Error types shared by the pollers, the HTTP transport and config loading.

use std::path::PathBuf;

/// Errors that can occur while fetching agent state.
///
/// Each variant carries enough context to diagnose the failure without
/// needing to inspect the originating error directly.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PollError {
    /// A TCP-level connection could not be established.
    #[error("Connection failed to {url}: {detail}")]
    Connect { url: String, detail: String },
    /// The remote server replied with a non-2xx HTTP status code.
    #[error("HTTP {status} from {url}")]
    Http { status: u16, url: String },
    /// Response body could not be parsed as the expected JSON structure.
    #[error("JSON parse error on field '{field}': {detail}")]
    Json { field: String, detail: String },
    /// The request was cancelled through its abort signal.
    #[error("request aborted: {reason}")]
    Aborted { reason: String },
}

impl PollError {
    /// `true` for cancellation, which callers treat as silent.
    pub fn is_abort(&self) -> bool {
        matches!(self, PollError::Aborted { .. })
    }
}

/// Errors raised while loading a [`PollerConfig`](crate::config::PollerConfig).
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}
