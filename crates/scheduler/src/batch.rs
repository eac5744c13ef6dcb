//! The seam between the scheduler and whatever computes a segment.

use std::fmt;

use async_trait::async_trait;
use audience_core::{RuleId, SegmentRow};
use audience_segmentation::PlanStep;
use serde::Serialize;
use uuid::Uuid;

/// Everything a batch engine needs to compute one rule's segment.
#[derive(Debug, Clone, Serialize)]
pub struct BatchRequest {
    pub job_id: Uuid,
    pub rule_id: RuleId,
    pub step: PlanStep,
    /// Connection string of the raw transaction store.
    pub data_source: String,
    /// Where the engine writes its result rows.
    pub output_destination: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskHandle {
    pub task_id: String,
    pub job_id: Uuid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Infrastructure hiccup; the job may be retried.
    Transient,
    /// The work itself is broken; retrying cannot help.
    Structural,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl BatchFailure {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Transient,
            message: message.into(),
        }
    }

    pub fn structural(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Structural,
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind == FailureKind::Transient
    }
}

impl fmt::Display for BatchFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            FailureKind::Transient => "transient",
            FailureKind::Structural => "structural",
        };
        write!(f, "{kind} failure: {}", self.message)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TaskStatus {
    Running,
    Succeeded(Vec<SegmentRow>),
    Failed(BatchFailure),
}

#[async_trait]
pub trait BatchEngine: Send + Sync {
    async fn submit(&self, request: BatchRequest) -> Result<TaskHandle, BatchFailure>;

    /// Non-blocking status check. Once a terminal status has been returned
    /// the handle is released.
    async fn poll(&self, handle: &TaskHandle) -> TaskStatus;

    /// Abandon a task. Unknown or finished handles are ignored.
    async fn terminate(&self, handle: &TaskHandle);

    fn name(&self) -> &'static str;
}
