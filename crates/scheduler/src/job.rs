use audience_core::{AudienceError, AudienceResult, RuleId, TriggerKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed | JobState::Cancelled)
    }

    /// Queued and running jobs hold their rule's in-flight slot.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, JobState::Queued | JobState::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        }
    }
}

/// A single permitted lifecycle edge.
#[derive(Debug, Clone, Copy)]
struct JobTransition {
    from: JobState,
    to: JobState,
}

const TRANSITIONS: &[JobTransition] = &[
    // Queued ->
    JobTransition { from: JobState::Queued, to: JobState::Running },
    JobTransition { from: JobState::Queued, to: JobState::Cancelled },
    // a dependency failed before this job could be dispatched
    JobTransition { from: JobState::Queued, to: JobState::Failed },
    // Running ->
    JobTransition { from: JobState::Running, to: JobState::Succeeded },
    JobTransition { from: JobState::Running, to: JobState::Failed },
    // Failed -> (retry)
    JobTransition { from: JobState::Failed, to: JobState::Queued },
];

pub fn can_transition(from: JobState, to: JobState) -> bool {
    TRANSITIONS.iter().any(|t| t.from == from && t.to == to)
}

/// One execution of a rule's materialization, across all its retry
/// attempts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaterializationJob {
    pub id: Uuid,
    pub rule_id: RuleId,
    pub trigger: TriggerKind,
    pub state: JobState,
    /// Number of batch submissions made so far.
    pub attempts: u32,
    pub max_attempts: u32,
    /// Dependencies whose jobs must commit before this one is dispatched.
    pub waiting_on: Vec<RuleId>,
    pub error: Option<String>,
    pub row_count: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub next_attempt_at: Option<DateTime<Utc>>,
}

impl MaterializationJob {
    pub fn new(rule_id: RuleId, trigger: TriggerKind, max_attempts: u32) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            rule_id,
            trigger,
            state: JobState::Queued,
            attempts: 0,
            max_attempts: max_attempts.max(1),
            waiting_on: Vec::new(),
            error: None,
            row_count: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
            next_attempt_at: None,
        }
    }

    /// Move to `to`, stamping the lifecycle timestamps. Edges outside the
    /// transition table are rejected and leave the job untouched.
    pub fn transition(&mut self, to: JobState) -> AudienceResult<()> {
        if !can_transition(self.state, to) {
            return Err(AudienceError::InvalidTransition {
                from: self.state.as_str().to_string(),
                to: to.as_str().to_string(),
            });
        }
        let now = Utc::now();
        match to {
            JobState::Running => {
                self.attempts += 1;
                self.next_attempt_at = None;
                self.started_at.get_or_insert(now);
            }
            JobState::Queued => {
                self.finished_at = None;
            }
            JobState::Succeeded => {
                self.error = None;
                self.finished_at = Some(now);
            }
            JobState::Failed | JobState::Cancelled => {
                self.finished_at = Some(now);
            }
        }
        self.state = to;
        self.updated_at = now;
        Ok(())
    }

    pub fn attempts_remaining(&self) -> bool {
        self.attempts < self.max_attempts
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path() {
        let mut job = MaterializationJob::new(3, TriggerKind::Manual, 3);
        assert_eq!(job.state, JobState::Queued);
        job.transition(JobState::Running).unwrap();
        assert_eq!(job.attempts, 1);
        assert!(job.started_at.is_some());
        job.transition(JobState::Succeeded).unwrap();
        assert!(job.is_terminal());
        assert!(job.finished_at.is_some());
    }

    #[test]
    fn test_retry_cycle() {
        let mut job = MaterializationJob::new(1, TriggerKind::Scheduled, 2);
        job.transition(JobState::Running).unwrap();
        job.transition(JobState::Failed).unwrap();
        assert!(job.attempts_remaining());
        job.transition(JobState::Queued).unwrap();
        assert!(job.finished_at.is_none());
        job.transition(JobState::Running).unwrap();
        assert_eq!(job.attempts, 2);
        assert!(!job.attempts_remaining());
    }

    #[test]
    fn test_invalid_transitions_rejected() {
        let mut job = MaterializationJob::new(1, TriggerKind::Manual, 1);
        let err = job.transition(JobState::Succeeded).unwrap_err();
        assert!(matches!(err, AudienceError::InvalidTransition { .. }));
        assert_eq!(job.state, JobState::Queued);

        job.transition(JobState::Running).unwrap();
        assert!(job.transition(JobState::Cancelled).is_err());
        job.transition(JobState::Succeeded).unwrap();
        assert!(job.transition(JobState::Queued).is_err());
        assert!(job.transition(JobState::Running).is_err());
    }

    #[test]
    fn test_cancelled_is_final() {
        let mut job = MaterializationJob::new(1, TriggerKind::Manual, 1);
        job.transition(JobState::Cancelled).unwrap();
        for to in [JobState::Queued, JobState::Running, JobState::Failed, JobState::Succeeded] {
            assert!(!can_transition(JobState::Cancelled, to));
        }
    }

    #[test]
    fn test_in_flight_states() {
        assert!(JobState::Queued.is_in_flight());
        assert!(JobState::Running.is_in_flight());
        assert!(!JobState::Failed.is_in_flight());
        assert_eq!(serde_json::to_string(&JobState::Succeeded).unwrap(), "\"succeeded\"");
    }
}
