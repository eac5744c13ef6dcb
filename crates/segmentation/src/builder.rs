//! Rule builder: fluent API for constructing new rules.

use chrono::NaiveDate;
use serde_json::{json, Value};

use audience_core::DateRange;

use crate::rule::{NewRule, RuleStatus};

pub struct RuleBuilder {
    name: String,
    description: Option<String>,
    conditions: Vec<Value>,
    logic: &'static str,
    raw: Option<Value>,
    schedule: Option<String>,
    window: DateRange,
    status: RuleStatus,
}

impl RuleBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            conditions: Vec::new(),
            logic: "AND",
            raw: None,
            schedule: None,
            window: DateRange::unbounded(),
            status: RuleStatus::Active,
        }
    }

    pub fn description(mut self, desc: impl Into<String>) -> Self {
        self.description = Some(desc.into());
        self
    }

    /// Combine the top-level conditions with OR instead of AND.
    pub fn with_or(mut self) -> Self {
        self.logic = "OR";
        self
    }

    /// Push a single comparison.
    pub fn when(mut self, field: &str, operator: &str, value: Value) -> Self {
        self.conditions.push(cond(field, operator, value));
        self
    }

    pub fn city_tier(self, tier: i64) -> Self {
        self.when("city_tier", "=", json!(tier))
    }

    pub fn category(self, category: &str) -> Self {
        self.when("category", "=", json!(category))
    }

    pub fn min_total_spend(self, amount: f64) -> Self {
        self.when("total_spend", ">", json!(amount))
    }

    pub fn min_transactions(self, count: u64) -> Self {
        self.when("transaction_count", ">=", json!(count))
    }

    /// Push a nested group built with [`all_of`] / [`any_of`].
    pub fn group(mut self, group: Value) -> Self {
        self.conditions.push(group);
        self
    }

    /// Use a complete raw tree, ignoring anything pushed with `when`.
    pub fn condition(mut self, raw: Value) -> Self {
        self.raw = Some(raw);
        self
    }

    pub fn schedule(mut self, schedule: impl Into<String>) -> Self {
        self.schedule = Some(schedule.into());
        self
    }

    pub fn window(mut self, start: Option<NaiveDate>, end: Option<NaiveDate>) -> Self {
        self.window = DateRange::new(start, end);
        self
    }

    pub fn inactive(mut self) -> Self {
        self.status = RuleStatus::Inactive;
        self
    }

    pub fn build(self) -> NewRule {
        let condition = match self.raw {
            Some(raw) => raw,
            None => json!({ "logic": self.logic, "children": self.conditions }),
        };
        NewRule {
            name: self.name,
            description: self.description,
            condition,
            schedule: self.schedule,
            window: self.window,
            status: self.status,
        }
    }
}

pub fn cond(field: &str, operator: &str, value: Value) -> Value {
    json!({ "field": field, "operator": operator, "value": value })
}

pub fn all_of(children: Vec<Value>) -> Value {
    json!({ "logic": "AND", "children": children })
}

pub fn any_of(children: Vec<Value>) -> Value {
    json!({ "logic": "OR", "children": children })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::ConditionParser;

    #[test]
    fn test_builder_produces_parseable_tree() {
        let rule = RuleBuilder::new("tier1 travel")
            .city_tier(1)
            .group(any_of(vec![
                cond("category", "=", json!("Travel")),
                cond("category", "=", json!("Dining")),
            ]))
            .schedule("DAILY")
            .build();
        assert_eq!(rule.schedule.as_deref(), Some("DAILY"));
        let model = ConditionParser::default().normalize(&rule.condition).unwrap();
        assert_eq!(model.dnf.len(), 2);
    }

    #[test]
    fn test_raw_condition_wins() {
        let rule = RuleBuilder::new("raw")
            .city_tier(2)
            .condition(cond("amount", ">", json!(10)))
            .build();
        assert_eq!(rule.condition["field"], "amount");
    }
}
