//! Wire types for agent messages, executor memory messages and trace records.
//!
//! These mirror the JSON the investigation API returns. Unknown fields are
//! ignored so the pollers stay forward-compatible with backend additions.

use serde::{Deserialize, Serialize};

/// Identifier of a message, memory container or executor-memory session.
pub type TrackedId = String;

/// One message in an executor memory (a single plan/execute step).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentMessage {
    pub message_id: TrackedId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub create_time: Option<String>,
}

impl AgentMessage {
    /// `true` once the step has produced a non-empty response.
    pub fn has_response(&self) -> bool {
        self.response.as_deref().is_some_and(|r| !r.is_empty())
    }
}

/// One trace entry (LLM call or tool execution) recorded under a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceRecord {
    pub message_id: TrackedId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    /// `"LLM"` for model calls, otherwise the tool name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub create_time: Option<String>,
}

impl TraceRecord {
    pub fn is_from_llm(&self) -> bool {
        self.origin
            .as_deref()
            .is_some_and(|o| o.eq_ignore_ascii_case("llm"))
    }
}

/// Search response for the top-level (parent interaction) message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageSearchResponse {
    #[serde(default)]
    pub hits: MessageHits,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageHits {
    #[serde(default)]
    pub hits: Vec<MessageHit>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageHit {
    #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "_source", default)]
    pub source: MessageSource,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageSource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structured_data: Option<StructuredData>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Structured output of the agent; `response` is the final answer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StructuredData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl MessageSearchResponse {
    /// The structured final answer from the first hit, if present and non-empty.
    pub fn final_response(&self) -> Option<&str> {
        self.hits
            .hits
            .first()?
            .source
            .structured_data
            .as_ref()?
            .response
            .as_deref()
            .filter(|r| !r.is_empty())
    }

    /// Convenience constructor for a single-hit response.
    pub fn with_final_response(response: Option<&str>) -> Self {
        Self {
            hits: MessageHits {
                hits: vec![MessageHit {
                    id: None,
                    source: MessageSource {
                        structured_data: Some(StructuredData {
                            response: response.map(str::to_string),
                            extra: Default::default(),
                        }),
                        extra: Default::default(),
                    },
                }],
            },
        }
    }
}

/// `true` while the top-level message has no final answer yet.
pub fn final_answer_absent(message: Option<&MessageSearchResponse>) -> bool {
    message.and_then(MessageSearchResponse::final_response).is_none()
}
