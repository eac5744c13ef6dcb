use thiserror::Error;
use uuid::Uuid;

use crate::types::RuleId;

pub type AudienceResult<T> = Result<T, AudienceError>;

#[derive(Error, Debug)]
pub enum AudienceError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Dependency cycle: rule {rule_id} would depend on itself via {path:?}")]
    Cycle { rule_id: RuleId, path: Vec<RuleId> },

    #[error("Rule {rule_id} already has job {job_id} in flight")]
    SchedulerBusy { rule_id: RuleId, job_id: Uuid },

    #[error("Work queue is full ({capacity} jobs)")]
    QueueFull { capacity: usize },

    #[error("Batch submission error: {0}")]
    SparkSubmission(String),

    #[error("Materialization error: {0}")]
    Materialization(String),

    #[error("Rule {0} not found")]
    RuleNotFound(RuleId),

    #[error("Job {0} not found")]
    JobNotFound(Uuid),

    #[error("Invalid job transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AudienceError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Errors the caller caused and should fix, as opposed to runtime failures.
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            Self::Validation(_) | Self::Cycle { .. } | Self::RuleNotFound(_) | Self::JobNotFound(_)
        )
    }
}

impl From<config::ConfigError> for AudienceError {
    fn from(e: config::ConfigError) -> Self {
        Self::Config(e.to_string())
    }
}
