use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Rule identifiers are dense integers assigned by the rule registry.
/// Lower ids win deterministic tie-breaks.
pub type RuleId = u64;

/// Prefix of every published segment table.
pub const OUTPUT_TABLE_PREFIX: &str = "segment_output_";

/// Canonical output table of a rule. One table per rule.
pub fn output_table_name(rule_id: RuleId) -> String {
    format!("{OUTPUT_TABLE_PREFIX}{rule_id}")
}

/// Staging table a single job writes into before the swap.
pub fn staging_table_name(prefix: &str, rule_id: RuleId, job_id: Uuid) -> String {
    format!("{prefix}{rule_id}_{}", job_id.simple())
}

/// Default catalog name of a rule's segment.
pub fn segment_name(rule_id: RuleId) -> String {
    format!("segment_{rule_id}")
}

/// Inclusive date window a rule's transactions are drawn from. Either end
/// may be open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    #[serde(default)]
    pub start: Option<NaiveDate>,
    #[serde(default)]
    pub end: Option<NaiveDate>,
}

impl DateRange {
    pub fn new(start: Option<NaiveDate>, end: Option<NaiveDate>) -> Self {
        Self { start, end }
    }

    pub fn unbounded() -> Self {
        Self::default()
    }

    pub fn is_valid(&self) -> bool {
        match (self.start, self.end) {
            (Some(s), Some(e)) => s <= e,
            _ => true,
        }
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start.map_or(true, |s| date >= s) && self.end.map_or(true, |e| date <= e)
    }

    pub fn overlaps(&self, other: &DateRange) -> bool {
        let starts_before_other_ends = match (self.start, other.end) {
            (Some(s), Some(e)) => s <= e,
            _ => true,
        };
        let other_starts_before_self_ends = match (other.start, self.end) {
            (Some(s), Some(e)) => s <= e,
            _ => true,
        };
        starts_before_other_ends && other_starts_before_self_ends
    }
}

/// Set operation combining a rule's dependencies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SetOperation {
    Intersection,
    Union,
}

impl SetOperation {
    /// SQL set operator keyword.
    pub fn sql_keyword(&self) -> &'static str {
        match self {
            SetOperation::Intersection => "INTERSECT",
            SetOperation::Union => "UNION",
        }
    }
}

impl std::fmt::Display for SetOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SetOperation::Intersection => f.write_str("INTERSECTION"),
            SetOperation::Union => f.write_str("UNION"),
        }
    }
}

impl std::str::FromStr for SetOperation {
    type Err = crate::AudienceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "INTERSECTION" | "INTERSECT" | "AND" => Ok(SetOperation::Intersection),
            "UNION" | "OR" => Ok(SetOperation::Union),
            other => Err(crate::AudienceError::validation(format!(
                "unknown set operation '{other}'"
            ))),
        }
    }
}

/// What caused a materialization job to be enqueued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Scheduled,
    Manual,
}

/// One row of a published segment: a user and their in-window activity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentRow {
    pub user_id: i64,
    pub total_transactions: u64,
    pub total_spent: f64,
    pub transaction_types: Vec<String>,
}

/// A raw UPI or credit-card transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub user_id: i64,
    pub amount: f64,
    pub transaction_date: NaiveDate,
    pub category: String,
    pub city_tier: i64,
    pub transaction_type: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> Option<NaiveDate> {
        NaiveDate::from_ymd_opt(y, m, day)
    }

    #[test]
    fn test_date_range_overlap() {
        let q1 = DateRange::new(d(2024, 1, 1), d(2024, 3, 31));
        let q2 = DateRange::new(d(2024, 4, 1), d(2024, 6, 30));
        let h1 = DateRange::new(d(2024, 1, 1), d(2024, 6, 30));

        assert!(!q1.overlaps(&q2));
        assert!(q1.overlaps(&h1));
        assert!(h1.overlaps(&q2));
        assert!(q1.overlaps(&DateRange::unbounded()));
        assert!(DateRange::new(None, d(2024, 4, 1)).overlaps(&q2));
    }

    #[test]
    fn test_date_range_contains_and_validity() {
        let r = DateRange::new(d(2024, 1, 1), d(2024, 1, 31));
        assert!(r.contains(NaiveDate::from_ymd_opt(2024, 1, 31).unwrap()));
        assert!(!r.contains(NaiveDate::from_ymd_opt(2024, 2, 1).unwrap()));
        assert!(!DateRange::new(d(2024, 2, 1), d(2024, 1, 1)).is_valid());
    }

    #[test]
    fn test_set_operation_parsing() {
        assert_eq!(
            "intersection".parse::<SetOperation>().unwrap(),
            SetOperation::Intersection
        );
        assert_eq!("UNION".parse::<SetOperation>().unwrap(), SetOperation::Union);
        assert!("DIFFERENCE".parse::<SetOperation>().is_err());
        assert_eq!(
            serde_json::to_string(&SetOperation::Intersection).unwrap(),
            "\"INTERSECTION\""
        );
    }

    #[test]
    fn test_table_names() {
        assert_eq!(output_table_name(7), "segment_output_7");
        let job = Uuid::nil();
        assert_eq!(
            staging_table_name("staging_", 7, job),
            "staging_7_00000000000000000000000000000000"
        );
    }
}
