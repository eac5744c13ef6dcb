//! Synthetic transactions and a starter rule set for local runs.

use audience_core::TransactionRecord;
use audience_segmentation::builder::{any_of, cond};
use audience_segmentation::{NewRule, RuleBuilder};
use chrono::{Duration, NaiveDate};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::json;

const CATEGORIES: &[&str] = &["Food", "Travel", "Groceries", "Electronics", "Fashion", "Fuel"];

/// `per_user` transactions for each of `users` users over the first half
/// of 2024. The same seed always yields the same data.
pub fn synthetic_transactions(users: i64, per_user: usize, seed: u64) -> Vec<TransactionRecord> {
    let mut rng = StdRng::seed_from_u64(seed);
    let Some(start) = NaiveDate::from_ymd_opt(2024, 1, 1) else {
        return Vec::new();
    };
    let mut records = Vec::with_capacity(users.max(0) as usize * per_user);
    for user_id in 1..=users {
        // users mostly shop in their home tier
        let home_tier = rng.gen_range(1..=3);
        for _ in 0..rng.gen_range(1..=per_user.max(1)) {
            let city_tier = if rng.gen_bool(0.85) { home_tier } else { rng.gen_range(1..=3) };
            let category = CATEGORIES[rng.gen_range(0..CATEGORIES.len())];
            let transaction_type = if rng.gen_bool(0.6) { "UPI" } else { "CREDIT_CARD" };
            let amount = (rng.gen_range(20.0..2500.0_f64) * 100.0).round() / 100.0;
            records.push(TransactionRecord {
                user_id,
                amount,
                transaction_date: start + Duration::days(rng.gen_range(0..182)),
                category: category.to_string(),
                city_tier,
                transaction_type: transaction_type.to_string(),
            });
        }
    }
    records
}

/// Rules exercising both reuse shapes: a narrowing chain and a union of
/// category segments.
pub fn starter_rules() -> Vec<NewRule> {
    vec![
        RuleBuilder::new("Tier 1 shoppers")
            .city_tier(1)
            .schedule("DAILY")
            .build(),
        RuleBuilder::new("Tier 1 high spenders")
            .description("Tier 1 users spending over 5000")
            .city_tier(1)
            .min_total_spend(5000.0)
            .schedule("DAILY")
            .build(),
        RuleBuilder::new("Travel buyers").category("Travel").schedule("HOURLY").build(),
        RuleBuilder::new("Grocery buyers")
            .category("Groceries")
            .schedule("HOURLY")
            .build(),
        RuleBuilder::new("Travel or groceries")
            .condition(any_of(vec![
                cond("category", "=", json!("Travel")),
                cond("category", "=", json!("Groceries")),
            ]))
            .schedule("DAILY")
            .build(),
        RuleBuilder::new("Frequent card users")
            .when("transaction_type", "=", json!("CREDIT_CARD"))
            .min_transactions(3)
            .build(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generation_is_deterministic() {
        let a = synthetic_transactions(50, 8, 7);
        let b = synthetic_transactions(50, 8, 7);
        assert_eq!(a, b);
        assert!(a.iter().all(|t| (1..=3).contains(&t.city_tier)));
        assert!(a.iter().all(|t| t.amount > 0.0));
    }

    #[test]
    fn test_starter_rules_resolve_into_reuse() {
        let engine = audience_segmentation::SegmentationEngine::default();
        let created: Vec<_> = starter_rules()
            .into_iter()
            .map(|r| engine.create_rule(r).unwrap())
            .collect();
        assert_eq!(created[1].depends_on, vec![created[0].id]);
        assert_eq!(created[4].depends_on, vec![created[2].id, created[3].id]);
        assert!(engine.graph_is_acyclic());
    }
}
