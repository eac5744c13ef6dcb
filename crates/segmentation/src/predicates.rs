//! User-level predicate evaluation over raw transactions.
//!
//! A transaction-scope comparison holds for a user when any of the user's
//! in-window transactions satisfies it; aggregate comparisons are tested
//! against the user's totals.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use audience_core::{DateRange, SegmentRow, TransactionRecord};

use crate::condition::{Comparison, ConditionNode, ConditionValue, Field, Logic, Operator, Scalar};

/// A user's in-window transactions with precomputed aggregates.
#[derive(Debug, Clone)]
pub struct UserActivity<'a> {
    pub user_id: i64,
    pub transactions: Vec<&'a TransactionRecord>,
    pub total_spent: f64,
}

impl<'a> UserActivity<'a> {
    pub fn transaction_count(&self) -> u64 {
        self.transactions.len() as u64
    }

    pub fn to_segment_row(&self) -> SegmentRow {
        let types: BTreeSet<&str> = self
            .transactions
            .iter()
            .map(|t| t.transaction_type.as_str())
            .collect();
        SegmentRow {
            user_id: self.user_id,
            total_transactions: self.transaction_count(),
            total_spent: self.total_spent,
            transaction_types: types.into_iter().map(str::to_string).collect(),
        }
    }
}

/// Group records falling inside `window` by user, ordered by user id.
pub fn group_by_user<'a>(
    records: &'a [TransactionRecord],
    window: &DateRange,
) -> BTreeMap<i64, UserActivity<'a>> {
    let mut users: BTreeMap<i64, UserActivity<'a>> = BTreeMap::new();
    for record in records.iter().filter(|r| window.contains(r.transaction_date)) {
        let entry = users.entry(record.user_id).or_insert_with(|| UserActivity {
            user_id: record.user_id,
            transactions: Vec::new(),
            total_spent: 0.0,
        });
        entry.transactions.push(record);
        entry.total_spent += record.amount;
    }
    users
}

pub fn matches_user(node: &ConditionNode, user: &UserActivity<'_>) -> bool {
    match node {
        ConditionNode::Comparison(c) => matches_comparison(c, user),
        ConditionNode::Group {
            logic: Logic::And,
            children,
        } => children.iter().all(|child| matches_user(child, user)),
        ConditionNode::Group {
            logic: Logic::Or,
            children,
        } => children.iter().any(|child| matches_user(child, user)),
    }
}

fn matches_comparison(c: &Comparison, user: &UserActivity<'_>) -> bool {
    match c.field {
        Field::TotalSpend => compare_values(
            &Scalar::Number(user.total_spent),
            c.operator,
            &c.value,
        ),
        Field::TransactionCount => compare_values(
            &Scalar::Integer(user.transaction_count() as i64),
            c.operator,
            &c.value,
        ),
        _ => user
            .transactions
            .iter()
            .filter_map(|t| transaction_value(c.field, t))
            .any(|actual| compare_values(&actual, c.operator, &c.value)),
    }
}

fn transaction_value(field: Field, record: &TransactionRecord) -> Option<Scalar> {
    let value = match field {
        Field::CityTier => Scalar::Integer(record.city_tier),
        Field::Category => Scalar::Text(record.category.clone()),
        Field::TransactionType => Scalar::Text(record.transaction_type.clone()),
        Field::Amount => Scalar::Number(record.amount),
        Field::TransactionDate => Scalar::Date(record.transaction_date),
        Field::TotalSpend | Field::TransactionCount => return None,
    };
    Some(value)
}

pub fn compare_values(actual: &Scalar, operator: Operator, expected: &ConditionValue) -> bool {
    match (operator, expected) {
        (Operator::In, ConditionValue::List(items)) => {
            items.iter().any(|e| scalar_cmp(actual, e) == Some(Ordering::Equal))
        }
        (_, ConditionValue::Single(e)) => {
            let Some(ord) = scalar_cmp(actual, e) else {
                return false;
            };
            match operator {
                Operator::Eq | Operator::In => ord == Ordering::Equal,
                Operator::Ne => ord != Ordering::Equal,
                Operator::Lt => ord == Ordering::Less,
                Operator::Le => ord != Ordering::Greater,
                Operator::Gt => ord == Ordering::Greater,
                Operator::Ge => ord != Ordering::Less,
            }
        }
        _ => false,
    }
}

fn scalar_cmp(a: &Scalar, b: &Scalar) -> Option<Ordering> {
    match (a, b) {
        (Scalar::Text(x), Scalar::Text(y)) => Some(x.cmp(y)),
        (Scalar::Date(x), Scalar::Date(y)) => Some(x.cmp(y)),
        (Scalar::Integer(x), Scalar::Integer(y)) => Some(x.cmp(y)),
        _ => a.as_f64()?.partial_cmp(&b.as_f64()?),
    }
}

/// Evaluate a condition directly over raw records: the scan path for a
/// rule with no dependencies.
pub fn scan(
    records: &[TransactionRecord],
    window: &DateRange,
    predicate: &ConditionNode,
) -> Vec<SegmentRow> {
    group_by_user(records, window)
        .values()
        .filter(|user| matches_user(predicate, user))
        .map(UserActivity::to_segment_row)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::ConditionParser;
    use chrono::NaiveDate;
    use serde_json::json;

    fn tx(user_id: i64, amount: f64, day: u32, category: &str, tier: i64, kind: &str) -> TransactionRecord {
        TransactionRecord {
            user_id,
            amount,
            transaction_date: NaiveDate::from_ymd_opt(2024, 3, day).unwrap(),
            category: category.to_string(),
            city_tier: tier,
            transaction_type: kind.to_string(),
        }
    }

    fn records() -> Vec<TransactionRecord> {
        vec![
            tx(1, 800.0, 1, "Travel", 1, "UPI"),
            tx(1, 400.0, 2, "Dining", 1, "CREDIT_CARD"),
            tx(2, 50.0, 3, "Groceries", 2, "UPI"),
            tx(3, 2000.0, 20, "Travel", 3, "CREDIT_CARD"),
        ]
    }

    fn predicate(raw: serde_json::Value) -> ConditionNode {
        ConditionParser::default().normalize(&raw).unwrap().root
    }

    #[test]
    fn test_transaction_scope_is_any_match() {
        let recs = records();
        let rows = scan(
            &recs,
            &DateRange::unbounded(),
            &predicate(json!({"field": "category", "value": "Dining"})),
        );
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].user_id, 1);
        assert_eq!(rows[0].total_transactions, 2);
        assert_eq!(rows[0].transaction_types, vec!["CREDIT_CARD", "UPI"]);
    }

    #[test]
    fn test_aggregate_scope_uses_user_totals() {
        let recs = records();
        let high = predicate(json!([
            {"field": "city_tier", "value": 1},
            {"field": "total_spend", "operator": ">", "value": 1000}
        ]));
        let rows = scan(&recs, &DateRange::unbounded(), &high);
        assert_eq!(rows.iter().map(|r| r.user_id).collect::<Vec<_>>(), vec![1]);
        assert!((rows[0].total_spent - 1200.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_window_filters_before_aggregation() {
        let recs = records();
        let window = DateRange::new(NaiveDate::from_ymd_opt(2024, 3, 2), NaiveDate::from_ymd_opt(2024, 3, 10));
        let rows = scan(
            &recs,
            &window,
            &predicate(json!({"field": "total_spend", "operator": ">=", "value": 400})),
        );
        assert_eq!(rows.iter().map(|r| r.user_id).collect::<Vec<_>>(), vec![1]);
        assert_eq!(rows[0].total_transactions, 1);
    }

    #[test]
    fn test_compare_values_handles_mixed_numeric() {
        assert!(compare_values(
            &Scalar::Number(3.0),
            Operator::Ge,
            &ConditionValue::Single(Scalar::Integer(3))
        ));
        assert!(compare_values(
            &Scalar::Text("UPI".into()),
            Operator::In,
            &ConditionValue::List(vec![Scalar::Text("CREDIT_CARD".into()), Scalar::Text("UPI".into())])
        ));
        assert!(!compare_values(
            &Scalar::Text("UPI".into()),
            Operator::Gt,
            &ConditionValue::Single(Scalar::Integer(1))
        ));
    }
}
