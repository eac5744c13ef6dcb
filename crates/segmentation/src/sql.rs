//! SQL generation for plan steps.
//!
//! Every query reads the UPI and credit-card raw tables through an
//! `all_transactions` CTE, narrows them to the rule's window, and returns one
//! row per user with `total_transactions`, `total_spent` and
//! `transaction_types`.

use audience_core::config::RawTablesConfig;
use audience_core::DateRange;

use crate::parser::render_predicate;
use crate::planner::{DependencyInput, SegmentQuery};

const PROJECTION: &str = "SELECT user_id, COUNT(*) AS total_transactions, SUM(amount) AS total_spent, \
GROUP_CONCAT(DISTINCT transaction_type) AS transaction_types";

#[derive(Debug, Clone)]
pub struct SqlRenderer {
    upi_table: String,
    credit_card_table: String,
}

impl SqlRenderer {
    pub fn new(raw_tables: &RawTablesConfig) -> Self {
        Self {
            upi_table: raw_tables.upi.clone(),
            credit_card_table: raw_tables.credit_card.clone(),
        }
    }

    pub fn render(&self, query: &SegmentQuery, window: &DateRange) -> String {
        let mut sql = self.base_ctes(window);
        match query {
            SegmentQuery::Scan { predicate } => {
                sql.push('\n');
                sql.push_str(PROJECTION);
                sql.push_str("\nFROM windowed\nGROUP BY user_id\nHAVING ");
                sql.push_str(&render_predicate(predicate));
            }
            SegmentQuery::Compose {
                operation,
                inputs,
                residual,
            } => {
                let mut parts: Vec<String> = inputs.iter().map(member_select).collect();
                if let Some(residual) = residual {
                    parts.push(format!(
                        "SELECT user_id FROM windowed GROUP BY user_id HAVING {}",
                        render_predicate(residual)
                    ));
                }
                let joiner = format!("\n    {}\n    ", operation.sql_keyword());
                sql.push_str(",\nsegment_members AS (\n    ");
                sql.push_str(&parts.join(&joiner));
                sql.push_str("\n)\n");
                sql.push_str(PROJECTION);
                sql.push_str(
                    "\nFROM windowed\nWHERE user_id IN (SELECT user_id FROM segment_members)\nGROUP BY user_id",
                );
            }
        }
        sql
    }

    fn base_ctes(&self, window: &DateRange) -> String {
        let mut filters = Vec::new();
        if let Some(start) = window.start {
            filters.push(format!("transaction_date >= '{}'", start.format("%Y-%m-%d")));
        }
        if let Some(end) = window.end {
            filters.push(format!("transaction_date <= '{}'", end.format("%Y-%m-%d")));
        }
        let where_clause = if filters.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", filters.join(" AND "))
        };
        format!(
            "WITH all_transactions AS (\n    \
             SELECT user_id, amount, transaction_date, category, city_tier, 'UPI' AS transaction_type FROM {upi}\n    \
             UNION ALL\n    \
             SELECT user_id, amount, transaction_date, category, city_tier, 'CREDIT_CARD' AS transaction_type FROM {cc}\n\
             ),\n\
             windowed AS (\n    SELECT * FROM all_transactions{where_clause}\n)",
            upi = self.upi_table,
            cc = self.credit_card_table,
        )
    }
}

impl Default for SqlRenderer {
    fn default() -> Self {
        Self::new(&RawTablesConfig::default())
    }
}

fn member_select(input: &DependencyInput) -> String {
    format!("SELECT user_id FROM {}", input.table)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::ConditionParser;
    use audience_core::SetOperation;
    use chrono::NaiveDate;
    use serde_json::json;

    #[test]
    fn test_scan_query_shape() {
        let predicate = ConditionParser::default()
            .normalize(&json!({"field": "city_tier", "value": 1}))
            .unwrap()
            .root;
        let window = DateRange::new(NaiveDate::from_ymd_opt(2024, 1, 1), None);
        let sql = SqlRenderer::default().render(&SegmentQuery::Scan { predicate }, &window);
        assert!(sql.starts_with("WITH all_transactions AS ("));
        assert!(sql.contains("FROM upi_transactions_raw"));
        assert!(sql.contains("FROM credit_card_transactions_raw"));
        assert!(sql.contains("SELECT * FROM all_transactions WHERE transaction_date >= '2024-01-01'\n"));
        assert!(sql.ends_with("HAVING MAX(CASE WHEN city_tier = 1 THEN 1 ELSE 0 END) = 1"));
    }

    #[test]
    fn test_compose_query_reads_output_tables() {
        let residual = ConditionParser::default()
            .normalize(&json!({"field": "total_spend", "operator": ">", "value": 1000}))
            .unwrap()
            .root;
        let query = SegmentQuery::Compose {
            operation: SetOperation::Intersection,
            inputs: vec![DependencyInput {
                rule_id: 1,
                table: "segment_output_1".to_string(),
            }],
            residual: Some(residual),
        };
        let sql = SqlRenderer::default().render(&query, &DateRange::unbounded());
        assert!(sql.contains("SELECT * FROM all_transactions\n"));
        assert!(sql.contains(
            "SELECT user_id FROM segment_output_1\n    INTERSECT\n    SELECT user_id FROM windowed GROUP BY user_id HAVING SUM(amount) > 1000"
        ));
        assert!(sql.ends_with("WHERE user_id IN (SELECT user_id FROM segment_members)\nGROUP BY user_id"));
    }
}
