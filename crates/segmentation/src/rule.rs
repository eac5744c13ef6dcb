//! Rule definitions as stored by the registry and as supplied by callers.

use audience_core::{DateRange, RuleId, Schedule, SetOperation};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::condition::ConditionNode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleStatus {
    #[default]
    Active,
    Inactive,
}

/// Who decided a rule's `depends_on`/`operation`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencySource {
    #[default]
    Resolved,
    /// Set by a human through `set_dependencies`; kept across updates
    /// while it stays valid.
    Override,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleDefinition {
    pub id: RuleId,
    pub name: String,
    pub description: Option<String>,
    /// Canonical condition tree.
    pub condition: ConditionNode,
    pub schedule: Option<Schedule>,
    pub window: DateRange,
    /// Bumped whenever the condition or the window changes. A published
    /// segment only stands for the revision it was built from.
    #[serde(default = "first_revision")]
    pub revision: u64,
    pub depends_on: Vec<RuleId>,
    pub operation: Option<SetOperation>,
    /// Predicate applied on top of the combined dependencies.
    pub residual: Option<ConditionNode>,
    /// Human-readable form of `residual`.
    pub extra_predicate: Option<String>,
    pub dependency_source: DependencySource,
    pub status: RuleStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn first_revision() -> u64 {
    1
}

impl RuleDefinition {
    pub fn is_active(&self) -> bool {
        self.status == RuleStatus::Active
    }

    pub fn output_table(&self) -> String {
        audience_core::types::output_table_name(self.id)
    }
}

/// Payload for creating a rule. `condition` is the raw JSON tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewRule {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub condition: serde_json::Value,
    #[serde(default)]
    pub schedule: Option<String>,
    #[serde(default)]
    pub window: DateRange,
    #[serde(default)]
    pub status: RuleStatus,
}

/// Partial update. `schedule: Some(None)` clears the schedule.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleUpdate {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub condition: Option<serde_json::Value>,
    #[serde(default)]
    pub schedule: Option<Option<String>>,
    #[serde(default)]
    pub window: Option<DateRange>,
}
