//! Stub [`AgentApi`] shared by the external tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;

use notebook_pollers::{
    AbortSignal, AgentApi, AgentMessage, MemoryRequest, MessageRequest, MessageSearchResponse,
    PollError, TraceRecord, TraceRequest,
};

/// Pops one scripted result per call; an exhausted script answers with an
/// empty value. Every call waits `latency` and honours its abort signal.
#[derive(Default)]
pub struct StubApi {
    pub latency: Duration,
    messages: Mutex<VecDeque<MessageSearchResponse>>,
    memory: Mutex<VecDeque<Vec<AgentMessage>>>,
    traces: Mutex<VecDeque<Vec<TraceRecord>>>,
    pub message_log: Mutex<Vec<MessageRequest>>,
    pub memory_log: Mutex<Vec<MemoryRequest>>,
    pub trace_log: Mutex<Vec<TraceRequest>>,
}

impl StubApi {
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency,
            ..Default::default()
        }
    }

    pub fn message(&self, resp: MessageSearchResponse) -> &Self {
        self.messages.lock().unwrap().push_back(resp);
        self
    }

    pub fn memory_page(&self, page: Vec<AgentMessage>) -> &Self {
        self.memory.lock().unwrap().push_back(page);
        self
    }

    pub fn trace_page(&self, page: Vec<TraceRecord>) -> &Self {
        self.traces.lock().unwrap().push_back(page);
        self
    }

    pub fn memory_tokens(&self) -> Vec<usize> {
        self.memory_log.lock().unwrap().iter().map(|r| r.next_token).collect()
    }

    pub fn trace_tokens(&self) -> Vec<usize> {
        self.trace_log.lock().unwrap().iter().map(|r| r.next_token).collect()
    }

    fn answer<T: Default + Send + 'static>(
        &self,
        queue: &Mutex<VecDeque<T>>,
        signal: AbortSignal,
    ) -> BoxFuture<'static, Result<T, PollError>> {
        let latency = self.latency;
        let next = queue.lock().unwrap().pop_front().unwrap_or_default();
        async move {
            signal
                .guard(async move {
                    tokio::time::sleep(latency).await;
                    Ok(next)
                })
                .await
        }
        .boxed()
    }
}

impl AgentApi for StubApi {
    fn get_message(
        &self,
        req: MessageRequest,
        signal: AbortSignal,
    ) -> BoxFuture<'_, Result<MessageSearchResponse, PollError>> {
        self.message_log.lock().unwrap().push(req);
        self.answer(&self.messages, signal)
    }

    fn list_memory_messages(
        &self,
        req: MemoryRequest,
        signal: AbortSignal,
    ) -> BoxFuture<'_, Result<Vec<AgentMessage>, PollError>> {
        self.memory_log.lock().unwrap().push(req);
        self.answer(&self.memory, signal)
    }

    fn list_traces(
        &self,
        req: TraceRequest,
        signal: AbortSignal,
    ) -> BoxFuture<'_, Result<Vec<TraceRecord>, PollError>> {
        self.trace_log.lock().unwrap().push(req);
        self.answer(&self.traces, signal)
    }
}

pub fn message(id: &str) -> AgentMessage {
    AgentMessage {
        message_id: id.into(),
        input: None,
        response: None,
        create_time: None,
    }
}

pub fn answered(id: &str, response: &str) -> AgentMessage {
    AgentMessage {
        response: Some(response.into()),
        ..message(id)
    }
}

pub fn trace(id: &str) -> TraceRecord {
    TraceRecord {
        message_id: id.into(),
        input: Some("input".into()),
        response: None,
        origin: Some("LLM".into()),
        create_time: None,
    }
}
