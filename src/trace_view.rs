//! Presentation model for accumulated trace records.
//!
//! Turns raw [`TraceRecord`]s into numbered steps with titles, durations and
//! classified bodies (JSON, markdown, plain text). Rendering itself is left to
//! the consumer.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde_json::Value;
use tracing::warn;

use crate::types::{AgentMessage, TraceRecord};

/// Classified content of one trace field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceBody {
    /// Valid JSON object/array, pretty-printed.
    Json(String),
    Markdown(String),
    Text(String),
    /// Field was absent or empty; carries the placeholder to show.
    Missing(&'static str),
}

impl TraceBody {
    pub fn as_text(&self) -> &str {
        match self {
            TraceBody::Json(s) | TraceBody::Markdown(s) | TraceBody::Text(s) => s,
            TraceBody::Missing(fallback) => fallback,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceSection {
    pub label: String,
    pub body: TraceBody,
    pub initially_open: bool,
}

/// One numbered step of the trace view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceStep {
    /// 1-based.
    pub number: usize,
    pub title: String,
    pub duration: Option<String>,
    pub from_llm: bool,
    pub sections: Vec<TraceSection>,
}

/// Classify `text`: JSON first, then markdown, then plain text.
///
/// Only JSON objects and arrays become [`TraceBody::Json`]. Scalars such as
/// `42` or `"done"` parse as JSON too but stay text, since pretty-printing
/// them changes nothing and quoting a bare string would only add noise.
pub fn render_trace_text(text: Option<&str>, fallback: &'static str) -> TraceBody {
    let text = match text {
        Some(t) if !t.is_empty() => t,
        _ => return TraceBody::Missing(fallback),
    };

    if let Ok(json @ (Value::Object(_) | Value::Array(_))) = serde_json::from_str::<Value>(text) {
        if let Ok(pretty) = serde_json::to_string_pretty(&json) {
            return TraceBody::Json(pretty);
        }
    }

    if is_markdown_text(text) {
        TraceBody::Markdown(text.to_string())
    } else {
        TraceBody::Text(text.to_string())
    }
}

/// Cheap structural check for markdown: headings, lists, quotes, fences,
/// tables, emphasis or links.
pub fn is_markdown_text(text: &str) -> bool {
    let block = text.lines().map(str::trim_start).any(|line| {
        let heading = line.starts_with('#') && line.trim_start_matches('#').starts_with(' ');
        let bullet = ["- ", "* ", "+ ", "> "].iter().any(|p| line.starts_with(p));
        let ordered = line
            .split_once(". ")
            .is_some_and(|(n, _)| !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()));
        let table = line.starts_with('|') && line.contains("---");
        heading || bullet || ordered || table || line.starts_with("```")
    });
    block || text.contains("**") || text.contains("](")
}

/// Parse a trace `create_time`: RFC 3339, naive ISO (assumed UTC) or epoch
/// milliseconds.
pub fn parse_create_time(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(naive.and_utc());
    }
    raw.parse::<i64>()
        .ok()
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
}

/// Human-readable gap: `850ms`, `42s`, `3m 5s`, `1h 0m 12s`.
pub fn format_time_gap(gap: chrono::Duration) -> String {
    let total_ms = gap.num_milliseconds().unsigned_abs();
    if total_ms < 1_000 {
        return format!("{total_ms}ms");
    }
    let secs = total_ms / 1_000;
    let (h, m, s) = (secs / 3_600, (secs % 3_600) / 60, secs % 60);
    if h > 0 {
        format!("{h}h {m}m {s}s")
    } else if m > 0 {
        format!("{m}m {s}s")
    } else {
        format!("{s}s")
    }
}

fn gap_between(from: Option<&str>, to: Option<&str>) -> Option<String> {
    let from = parse_create_time(from?)?;
    let to = parse_create_time(to?)?;
    Some(format_time_gap(to - from))
}

/// Parse an LLM response that looks like a JSON object. A parse failure is
/// logged and the response is treated as plain text.
fn parse_llm_response(response: &str) -> Option<Value> {
    if !response.trim_start().starts_with('{') {
        return None;
    }
    match serde_json::from_str(response) {
        Ok(v) => Some(v),
        Err(e) => {
            warn!(error = %e, "failed to parse LLM trace response as JSON");
            None
        }
    }
}

fn tool_use_reason(json: &Value) -> Option<&str> {
    if json.get("stopReason").and_then(Value::as_str) != Some("tool_use") {
        return None;
    }
    json.pointer("/output/message/content/0/text")
        .and_then(Value::as_str)
        .filter(|t| !t.is_empty())
}

/// `create_time` of `message_id` in the executor memory, the reference point
/// for the first step's duration.
pub fn message_create_time<'a>(executor_messages: &'a [AgentMessage], message_id: &str) -> Option<&'a str> {
    executor_messages
        .iter()
        .find(|m| m.message_id == message_id)
        .and_then(|m| m.create_time.as_deref())
}

/// Build the step list for `traces`. The first step's duration is measured
/// from `message_create_time`, later ones from the previous trace.
pub fn build_steps(traces: &[TraceRecord], message_create_time: Option<&str>) -> Vec<TraceStep> {
    traces
        .iter()
        .enumerate()
        .map(|(i, record)| {
            let previous = match i {
                0 => message_create_time,
                _ => traces[i - 1].create_time.as_deref(),
            };
            let duration = gap_between(previous, record.create_time.as_deref());
            let origin = record.origin.as_deref().unwrap_or("tool");
            let from_llm = record.is_from_llm();

            let (headline, sections) = if from_llm {
                llm_step(record)
            } else {
                tool_step(record, origin)
            };

            let mut title = format!("Step {} - {headline}", i + 1);
            if let Some(d) = &duration {
                title.push_str(&format!(" Duration ({d})"));
            }

            TraceStep {
                number: i + 1,
                title,
                duration,
                from_llm,
                sections,
            }
        })
        .collect()
}

fn llm_step(record: &TraceRecord) -> (String, Vec<TraceSection>) {
    let parsed = record.response.as_deref().and_then(parse_llm_response);
    let reason = parsed
        .as_ref()
        .and_then(tool_use_reason)
        .map(str::to_string)
        .or_else(|| record.input.clone())
        .unwrap_or_default();

    let content = parsed
        .as_ref()
        .and_then(|v| v.pointer("/output/message/content"))
        .map(Value::to_string);
    let text = content.as_deref().or(record.response.as_deref());

    let section = TraceSection {
        label: "LLM response".into(),
        body: render_trace_text(text, "No response"),
        initially_open: true,
    };
    (reason, vec![section])
}

fn tool_step(record: &TraceRecord, origin: &str) -> (String, Vec<TraceSection>) {
    let response_missing = record.response.as_deref().map_or(true, str::is_empty);
    let sections = vec![
        TraceSection {
            label: format!("{origin} input"),
            body: render_trace_text(record.input.as_deref(), "No input"),
            initially_open: true,
        },
        TraceSection {
            label: format!("{origin} response"),
            body: render_trace_text(record.response.as_deref(), "No response"),
            initially_open: response_missing,
        },
    ];
    (format!("Execute {origin}"), sections)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn record(origin: &str, input: Option<&str>, response: Option<&str>, at: &str) -> TraceRecord {
        TraceRecord {
            message_id: format!("t-{at}"),
            input: input.map(str::to_string),
            response: response.map(str::to_string),
            origin: Some(origin.into()),
            create_time: Some(at.into()),
        }
    }

    #[rstest]
    #[case("# Findings\nsomething", true)]
    #[case("- one\n- two", true)]
    #[case("1. first\n2. second", true)]
    #[case("see [docs](http://x)", true)]
    #[case("**bold** claim", true)]
    #[case("```\ncode\n```", true)]
    #[case("| a | b |\n|---|---|", true)]
    #[case("plain sentence. nothing else", false)]
    #[case("#hashtag", false)]
    fn markdown_heuristic(#[case] text: &str, #[case] expected: bool) {
        assert_eq!(is_markdown_text(text), expected, "{text:?}");
    }

    #[test]
    fn render_prefers_json() {
        let body = render_trace_text(Some(r#"{"index":"logs","size":10}"#), "No input");
        match body {
            TraceBody::Json(pretty) => assert!(pretty.contains("\n  \"index\": \"logs\"")),
            other => panic!("expected json, got {other:?}"),
        }
    }

    #[rstest]
    #[case("42")]
    #[case("\"done\"")]
    #[case("true")]
    fn render_scalar_json_is_text(#[case] text: &str) {
        assert_eq!(render_trace_text(Some(text), "x"), TraceBody::Text(text.into()));
    }

    #[test]
    fn first_step_measured_from_executor_message() {
        let executor = vec![
            AgentMessage {
                message_id: "m0".into(),
                input: None,
                response: None,
                create_time: Some("2025-03-01T09:00:00Z".into()),
            },
            AgentMessage {
                message_id: "m1".into(),
                input: None,
                response: None,
                create_time: Some("2025-03-01T10:00:00Z".into()),
            },
        ];
        assert_eq!(message_create_time(&executor, "m1"), Some("2025-03-01T10:00:00Z"));
        assert_eq!(message_create_time(&executor, "missing"), None);

        let traces = vec![record("PPLTool", None, Some("ok"), "2025-03-01T10:00:07Z")];
        let steps = build_steps(&traces, message_create_time(&executor, "m1"));
        assert_eq!(steps[0].duration.as_deref(), Some("7s"));
    }

    #[test]
    fn render_missing_uses_fallback() {
        assert_eq!(render_trace_text(None, "No input"), TraceBody::Missing("No input"));
        assert_eq!(render_trace_text(Some(""), "No response").as_text(), "No response");
    }

    #[rstest]
    #[case(850, "850ms")]
    #[case(42_000, "42s")]
    #[case(185_000, "3m 5s")]
    #[case(3_612_000, "1h 0m 12s")]
    fn time_gap_format(#[case] ms: i64, #[case] expected: &str) {
        assert_eq!(format_time_gap(chrono::Duration::milliseconds(ms)), expected);
    }

    #[test]
    fn create_time_formats() {
        let a = parse_create_time("2025-03-01T10:00:00Z").unwrap();
        let b = parse_create_time("2025-03-01T10:00:00.000").unwrap();
        let c = parse_create_time("1740823200000").unwrap();
        assert_eq!(a, b);
        assert_eq!(a, c);
        assert!(parse_create_time("yesterday").is_none());
    }

    #[test]
    fn tool_use_text_becomes_reason() {
        let response = r#"{"stopReason":"tool_use","output":{"message":{"content":[{"text":"Query the error logs"},{"toolUse":{"name":"PPLTool"}}]}}}"#;
        let traces = vec![record("LLM", Some("raw prompt"), Some(response), "2025-03-01T10:00:02Z")];
        let steps = build_steps(&traces, Some("2025-03-01T10:00:00Z"));

        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].title, "Step 1 - Query the error logs Duration (2s)");
        assert!(steps[0].from_llm);
        assert!(matches!(steps[0].sections[0].body, TraceBody::Json(_)));
    }

    #[test]
    fn malformed_llm_json_falls_back_to_text() {
        let traces = vec![record("llm", Some("prompt"), Some("{not json"), "2025-03-01T10:00:00Z")];
        let steps = build_steps(&traces, None);

        assert_eq!(steps[0].title, "Step 1 - prompt");
        assert_eq!(steps[0].sections[0].body, TraceBody::Text("{not json".into()));
        assert!(steps[0].duration.is_none());
    }

    #[test]
    fn tool_steps_have_input_and_response_sections() {
        let traces = vec![
            record("LLM", Some("plan"), Some("ok"), "2025-03-01T10:00:00Z"),
            record("PPLTool", Some(r#"{"query":"source=logs"}"#), None, "2025-03-01T10:01:05Z"),
        ];
        let steps = build_steps(&traces, None);

        assert_eq!(steps[1].number, 2);
        assert_eq!(steps[1].title, "Step 2 - Execute PPLTool Duration (1m 5s)");
        let labels: Vec<&str> = steps[1].sections.iter().map(|s| s.label.as_str()).collect();
        assert_eq!(labels, vec!["PPLTool input", "PPLTool response"]);
        assert_eq!(steps[1].sections[1].body, TraceBody::Missing("No response"));
        assert!(steps[1].sections[1].initially_open);
    }
}
