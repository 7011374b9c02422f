//! Investigation session: wires the message and executor-memory pollers for
//! the memory an investigation is currently showing, and hands out trace
//! accumulators for individual steps.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::api::AgentApi;
use crate::config::PollerConfig;
use crate::memory::{MemoryPoller, MemorySetup, MemoryTarget};
use crate::message::{MessagePoller, MessageSetup};
use crate::trace::{TraceAccumulator, TraceTarget};
use crate::types::{final_answer_absent, TrackedId};

/// Identifiers of one investigation run's agent memory.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryRef {
    #[serde(default)]
    pub memory_container_id: Option<TrackedId>,
    #[serde(default)]
    pub executor_memory_id: Option<TrackedId>,
    /// Top-level interaction carrying the final answer.
    #[serde(default)]
    pub parent_interaction_id: Option<TrackedId>,
}

/// The bits of notebook state a session is derived from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvestigationSnapshot {
    pub is_investigating: bool,
    #[serde(default)]
    pub running_memory: Option<MemoryRef>,
    #[serde(default)]
    pub history_memory: Option<MemoryRef>,
    #[serde(default)]
    pub investigation_error: bool,
    #[serde(default)]
    pub hypothesis_count: usize,
    #[serde(default)]
    pub data_source_id: Option<String>,
}

/// Running memory while investigating, otherwise the last completed one.
pub fn active_memory(snapshot: &InvestigationSnapshot) -> Option<&MemoryRef> {
    if snapshot.is_investigating {
        snapshot.running_memory.as_ref()
    } else {
        snapshot.history_memory.as_ref()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvestigationStatus {
    Failed,
    UnderInvestigation,
    Completed,
    NoHypotheses,
}

impl InvestigationStatus {
    pub fn label(self) -> &'static str {
        match self {
            InvestigationStatus::Failed => "Investigation failed and showing previous hypotheses",
            InvestigationStatus::UnderInvestigation => "Under investigation",
            InvestigationStatus::Completed => "Investigation completed",
            InvestigationStatus::NoHypotheses => "No hypotheses",
        }
    }
}

impl std::fmt::Display for InvestigationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

pub fn investigation_status(snapshot: &InvestigationSnapshot) -> InvestigationStatus {
    if snapshot.investigation_error {
        InvestigationStatus::Failed
    } else if snapshot.is_investigating || snapshot.history_memory.is_none() {
        InvestigationStatus::UnderInvestigation
    } else if snapshot.hypothesis_count > 0 {
        InvestigationStatus::Completed
    } else {
        InvestigationStatus::NoHypotheses
    }
}

/// Live pollers for the active memory of one investigation.
///
/// Dropping the session stops both pollers.
pub struct InvestigationSession {
    api: Arc<dyn AgentApi>,
    config: PollerConfig,
    memory_container_id: TrackedId,
    executor_memory_id: TrackedId,
    data_source_id: Option<String>,
    message: Arc<MessagePoller>,
    executor_memory: Arc<MemoryPoller>,
}

impl std::fmt::Debug for InvestigationSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvestigationSession")
            .field("memory_container_id", &self.memory_container_id)
            .field("executor_memory_id", &self.executor_memory_id)
            .field("data_source_id", &self.data_source_id)
            .field("message", &self.message)
            .field("executor_memory", &self.executor_memory)
            .finish_non_exhaustive()
    }
}

impl InvestigationSession {
    /// Build the pollers for the active memory.
    ///
    /// Returns `None` when the active memory lacks a container or executor id.
    /// Polling only starts when the parent interaction id is known. Must be
    /// called within a Tokio runtime.
    pub fn open(
        api: Arc<dyn AgentApi>,
        snapshot: &InvestigationSnapshot,
        config: &PollerConfig,
    ) -> Option<Self> {
        let memory = active_memory(snapshot)?;
        let memory_container_id = memory.memory_container_id.clone()?;
        let executor_memory_id = memory.executor_memory_id.clone()?;
        let data_source_id = snapshot
            .data_source_id
            .clone()
            .or_else(|| config.data_source_id.clone());

        let message = Arc::new(
            MessagePoller::new(Arc::clone(&api), memory_container_id.clone())
                .with_interval(config.message_interval()),
        );

        let is_investigating = snapshot.is_investigating;
        let message_rx = message.subscribe();
        let executor_memory = Arc::new(
            MemoryPoller::new(
                Arc::clone(&api),
                MemoryTarget {
                    memory_container_id: memory_container_id.clone(),
                    executor_memory_id: executor_memory_id.clone(),
                },
                move || is_investigating && final_answer_absent(message_rx.borrow().as_ref()),
            )
            .with_interval(config.memory_interval()),
        );

        match &memory.parent_interaction_id {
            Some(parent) => {
                message.setup(MessageSetup {
                    message_id: parent.clone(),
                    data_source_id: data_source_id.clone(),
                });
                executor_memory.setup(MemorySetup {
                    data_source_id: data_source_id.clone(),
                });
                info!(
                    container = %memory_container_id,
                    executor = %executor_memory_id,
                    parent = %parent,
                    is_investigating,
                    "investigation session polling"
                );
            }
            None => debug!(
                container = %memory_container_id,
                "no parent interaction yet, session idle"
            ),
        }

        Some(Self {
            api,
            config: config.clone(),
            memory_container_id,
            executor_memory_id,
            data_source_id,
            message,
            executor_memory,
        })
    }

    pub fn message(&self) -> &Arc<MessagePoller> {
        &self.message
    }

    pub fn executor_memory(&self) -> &Arc<MemoryPoller> {
        &self.executor_memory
    }

    /// Start accumulating traces for one executor step.
    pub fn open_trace(&self, message_id: impl Into<TrackedId>) -> TraceAccumulator {
        let acc = TraceAccumulator::new(
            Arc::clone(&self.api),
            self.message.subscribe(),
            self.executor_memory.subscribe_messages(),
        )
        .with_interval(self.config.trace_interval());
        acc.open(TraceTarget {
            message_id: message_id.into(),
            memory_container_id: self.memory_container_id.clone(),
            executor_memory_id: self.executor_memory_id.clone(),
            data_source_id: self.data_source_id.clone(),
        });
        acc
    }

    pub fn close(&self) {
        self.message.stop("Component cleanup");
        self.executor_memory.stop("Component unmount");
    }
}

impl Drop for InvestigationSession {
    fn drop(&mut self) {
        self.close();
    }
}
