//! Polling and state-synchronization core for AI-agent investigations.
//!
//! Three pollers keep a consumer in sync with a long-running agent:
//!
//! - [`MessagePoller`] follows the top-level message until its final answer
//!   appears.
//! - [`MemoryPoller`] incrementally collects the executor memory's messages.
//! - [`TraceAccumulator`] collects the trace records of one executor step.
//!
//! Each exposes its state through `tokio::sync::watch` receivers. All network
//! access goes through the [`AgentApi`] trait; [`HttpAgentApi`] is the
//! `reqwest` implementation.

pub mod abort;
pub mod api;
pub mod cli;
pub mod config;
pub mod error;
pub mod memory;
pub mod message;
pub mod observable;
pub mod session;
pub mod task;
pub mod trace;
pub mod trace_view;
pub mod types;

pub use abort::{AbortController, AbortSignal};
pub use api::{AgentApi, HttpAgentApi, HttpAgentApiBuilder, MemoryRequest, MessageRequest, TraceRequest};
pub use config::PollerConfig;
pub use error::{ConfigError, PollError};
pub use memory::{merge_messages, MemoryPoller, MemorySetup, MemoryTarget};
pub use message::{MessagePoller, MessageSetup};
pub use observable::Observable;
pub use session::{
    active_memory, investigation_status, InvestigationSession, InvestigationSnapshot,
    InvestigationStatus, MemoryRef,
};
pub use trace::{should_load, TraceAccumulator, TraceTarget};
pub use trace_view::{
    build_steps, message_create_time, render_trace_text, TraceBody, TraceSection, TraceStep,
};
pub use types::{
    final_answer_absent, AgentMessage, MessageSearchResponse, TraceRecord, TrackedId,
};
