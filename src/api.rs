//! Request capability consumed by the pollers, plus its HTTP implementation.
//!
//! Pollers only see the [`AgentApi`] trait. [`HttpAgentApi`] talks to the
//! investigation API with `reqwest`; tests plug in scripted fakes instead.

use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use reqwest::Url;
use serde::de::DeserializeOwned;

use crate::abort::AbortSignal;
use crate::config::PollerConfig;
use crate::error::PollError;
use crate::types::{AgentMessage, MessageSearchResponse, TraceRecord, TrackedId};

/// Fetch the top-level (parent interaction) message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRequest {
    pub memory_container_id: TrackedId,
    pub message_id: TrackedId,
    pub data_source_id: Option<String>,
}

/// Fetch executor-memory messages starting at `next_token`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryRequest {
    pub memory_container_id: TrackedId,
    pub executor_memory_id: TrackedId,
    pub next_token: usize,
    pub data_source_id: Option<String>,
}

/// Fetch trace records for one message starting at `next_token`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceRequest {
    pub memory_container_id: TrackedId,
    pub executor_memory_id: TrackedId,
    pub message_id: TrackedId,
    pub next_token: usize,
    pub data_source_id: Option<String>,
}

/// Backend operations the pollers depend on.
///
/// Every call carries an [`AbortSignal`]; implementations must resolve with
/// [`PollError::Aborted`] once it fires.
pub trait AgentApi: Send + Sync + 'static {
    fn get_message(
        &self,
        req: MessageRequest,
        signal: AbortSignal,
    ) -> BoxFuture<'_, Result<MessageSearchResponse, PollError>>;

    fn list_memory_messages(
        &self,
        req: MemoryRequest,
        signal: AbortSignal,
    ) -> BoxFuture<'_, Result<Vec<AgentMessage>, PollError>>;

    fn list_traces(
        &self,
        req: TraceRequest,
        signal: AbortSignal,
    ) -> BoxFuture<'_, Result<Vec<TraceRecord>, PollError>>;
}

const API_ROOT: [&str; 3] = ["api", "investigation", "memory_containers"];

/// `reqwest`-backed [`AgentApi`]. Use [`HttpAgentApiBuilder`] for construction.
#[derive(Debug, Clone)]
pub struct HttpAgentApi {
    base_url: String,
    client: reqwest::Client,
}

impl HttpAgentApi {
    pub fn builder(base_url: impl Into<String>) -> HttpAgentApiBuilder {
        HttpAgentApiBuilder::new(base_url)
    }

    /// Build a client from the transport fields of `config`.
    pub fn from_config(config: &PollerConfig) -> Self {
        HttpAgentApiBuilder::new(config.base_url.clone())
            .connect_timeout(config.connect_timeout())
            .request_timeout(config.request_timeout())
            .build()
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(
        &self,
        segments: &[&str],
        next_token: Option<usize>,
        data_source_id: Option<&str>,
    ) -> Result<Url, PollError> {
        let mut url = Url::parse(&self.base_url).map_err(|e| PollError::Connect {
            url: self.base_url.clone(),
            detail: e.to_string(),
        })?;
        url.path_segments_mut()
            .map_err(|()| PollError::Connect {
                url: self.base_url.clone(),
                detail: "base url cannot carry a path".into(),
            })?
            .pop_if_empty()
            .extend(API_ROOT)
            .extend(segments);
        {
            let mut query = url.query_pairs_mut();
            if let Some(token) = next_token {
                query.append_pair("nextToken", &token.to_string());
            }
            if let Some(id) = data_source_id {
                query.append_pair("dataSourceId", id);
            }
        }
        if url.query() == Some("") {
            url.set_query(None);
        }
        Ok(url)
    }

    /// GET `url` and decode the JSON body.
    ///
    /// # Returns
    /// - `Err(PollError::Connect)` when the TCP connection fails.
    /// - `Err(PollError::Http)` when the server replies with a non-2xx code.
    /// - `Err(PollError::Json)` when the body cannot be parsed.
    async fn get_json<T: DeserializeOwned>(&self, url: Url, field: &str) -> Result<T, PollError> {
        let bytes = self.get_bytes(url).await?;
        serde_json::from_slice::<T>(&bytes).map_err(|e| PollError::Json {
            field: field.into(),
            detail: e.to_string(),
        })
    }

    async fn get_bytes(&self, url: Url) -> Result<Vec<u8>, PollError> {
        let resp = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| PollError::Connect {
                url: url.to_string(),
                detail: e.to_string(),
            })?;

        if !resp.status().is_success() {
            return Err(PollError::Http {
                status: resp.status().as_u16(),
                url: url.to_string(),
            });
        }

        resp.bytes()
            .await
            .map(|b| b.to_vec())
            .map_err(|e| PollError::Json {
                field: "body".into(),
                detail: e.to_string(),
            })
    }

    /// Decode a list returned either bare or wrapped under `field`.
    async fn get_list<T: DeserializeOwned>(&self, url: Url, field: &str) -> Result<Vec<T>, PollError> {
        let bytes = self.get_bytes(url).await?;
        decode_list(&bytes, field)
    }
}

/// Accept both `[ ... ]` and `{ "<field>": [ ... ] }`.
pub(crate) fn decode_list<T: DeserializeOwned>(bytes: &[u8], field: &str) -> Result<Vec<T>, PollError> {
    if let Ok(list) = serde_json::from_slice::<Vec<T>>(bytes) {
        return Ok(list);
    }

    let value: serde_json::Value = serde_json::from_slice(bytes).map_err(|e| PollError::Json {
        field: field.into(),
        detail: e.to_string(),
    })?;

    let inner = value.get(field).cloned().ok_or_else(|| PollError::Json {
        field: field.into(),
        detail: "missing list field".into(),
    })?;
    serde_json::from_value::<Vec<T>>(inner).map_err(|e| PollError::Json {
        field: field.into(),
        detail: e.to_string(),
    })
}

impl AgentApi for HttpAgentApi {
    fn get_message(
        &self,
        req: MessageRequest,
        signal: AbortSignal,
    ) -> BoxFuture<'_, Result<MessageSearchResponse, PollError>> {
        async move {
            let url = self.url(
                &[req.memory_container_id.as_str(), "messages", req.message_id.as_str()],
                None,
                req.data_source_id.as_deref(),
            )?;
            signal.guard(self.get_json(url, "hits")).await
        }
        .boxed()
    }

    fn list_memory_messages(
        &self,
        req: MemoryRequest,
        signal: AbortSignal,
    ) -> BoxFuture<'_, Result<Vec<AgentMessage>, PollError>> {
        async move {
            let url = self.url(
                &[
                    req.memory_container_id.as_str(),
                    "memories",
                    req.executor_memory_id.as_str(),
                    "messages",
                ],
                Some(req.next_token),
                req.data_source_id.as_deref(),
            )?;
            signal.guard(self.get_list(url, "messages")).await
        }
        .boxed()
    }

    fn list_traces(
        &self,
        req: TraceRequest,
        signal: AbortSignal,
    ) -> BoxFuture<'_, Result<Vec<TraceRecord>, PollError>> {
        async move {
            let url = self.url(
                &[
                    req.memory_container_id.as_str(),
                    "memories",
                    req.executor_memory_id.as_str(),
                    "messages",
                    req.message_id.as_str(),
                    "traces",
                ],
                Some(req.next_token),
                req.data_source_id.as_deref(),
            )?;
            signal.guard(self.get_list(url, "traces")).await
        }
        .boxed()
    }
}

/// Builder for [`HttpAgentApi`].
///
/// # Example
/// ```rust,ignore
/// let api = HttpAgentApi::builder("http://127.0.0.1:5601")
///     .request_timeout(Duration::from_secs(20))
///     .build();
/// ```
#[derive(Debug, Clone)]
pub struct HttpAgentApiBuilder {
    base_url: String,
    connect_timeout: Duration,
    request_timeout: Duration,
}

impl HttpAgentApiBuilder {
    pub fn new(base_url: impl Into<String>) -> Self {
        let defaults = PollerConfig::default();
        Self {
            base_url: base_url.into(),
            connect_timeout: defaults.connect_timeout(),
            request_timeout: defaults.request_timeout(),
        }
    }

    /// Override the TCP connect timeout (default 3 s).
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Override the per-request timeout (default 10 s).
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn build(self) -> HttpAgentApi {
        // reqwest::Client::builder() can fail in extreme environments, but
        // unwrap_or_default() falls back to a default client instead of panicking.
        let client = reqwest::Client::builder()
            .connect_timeout(self.connect_timeout)
            .timeout(self.request_timeout)
            .build()
            .unwrap_or_default();

        HttpAgentApi {
            base_url: self.base_url,
            client,
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    fn api() -> HttpAgentApi {
        HttpAgentApi::builder("http://localhost:5601/").build()
    }

    #[test]
    fn builder_keeps_base_url() {
        let api = HttpAgentApi::builder("http://127.0.0.1:4000")
            .connect_timeout(Duration::from_secs(1))
            .request_timeout(Duration::from_secs(5))
            .build();
        assert_eq!(api.base_url(), "http://127.0.0.1:4000");
    }

    #[test]
    fn from_config_uses_config_base_url() {
        let cfg = PollerConfig::new("http://dashboards:5601");
        assert_eq!(HttpAgentApi::from_config(&cfg).base_url(), "http://dashboards:5601");
    }

    #[test]
    fn trace_url_carries_cursor_and_data_source() {
        let url = api()
            .url(&["c1", "memories", "e1", "messages", "m1", "traces"], Some(4), Some("ds"))
            .unwrap();
        assert_eq!(
            url.as_str(),
            "http://localhost:5601/api/investigation/memory_containers/c1/memories/e1/messages/m1/traces?nextToken=4&dataSourceId=ds"
        );
    }

    #[test]
    fn message_url_without_query() {
        let url = api().url(&["c1", "messages", "p1"], None, None).unwrap();
        assert_eq!(
            url.as_str(),
            "http://localhost:5601/api/investigation/memory_containers/c1/messages/p1"
        );
    }

    #[test]
    fn url_segments_are_escaped() {
        let url = api().url(&["c/1", "messages", "a b"], None, None).unwrap();
        assert!(url.as_str().ends_with("/c%2F1/messages/a%20b"), "{url}");
    }

    #[test]
    fn invalid_base_url_is_connect_error() {
        let api = HttpAgentApi::builder("not a url").build();
        let err = api.url(&["c"], None, None).unwrap_err();
        assert!(matches!(err, PollError::Connect { .. }));
    }

    #[test]
    fn decode_list_accepts_bare_and_wrapped() {
        let bare: Vec<TraceRecord> = decode_list(br#"[{"message_id":"t1"}]"#, "traces").unwrap();
        assert_eq!(bare.len(), 1);
        let wrapped: Vec<TraceRecord> =
            decode_list(br#"{"traces":[{"message_id":"t1"},{"message_id":"t2"}]}"#, "traces").unwrap();
        assert_eq!(wrapped.len(), 2);
    }

    #[test]
    fn decode_list_rejects_missing_field() {
        let err = decode_list::<TraceRecord>(br#"{"other":[]}"#, "traces").unwrap_err();
        assert!(matches!(err, PollError::Json { ref field, .. } if field == "traces"));
    }

    #[tokio::test]
    async fn aborted_signal_short_circuits_http_call() {
        let ctl = crate::abort::AbortController::new();
        ctl.abort("Component unmount");
        let req = MessageRequest {
            memory_container_id: "c1".into(),
            message_id: "p1".into(),
            data_source_id: None,
        };
        let err = api().get_message(req, ctl.signal()).await.unwrap_err();
        assert_eq!(err, PollError::Aborted { reason: "Component unmount".into() });
    }
}
