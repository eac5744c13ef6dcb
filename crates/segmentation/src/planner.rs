//! Orders rules so dependencies materialize before their dependents and
//! turns each rule into an executable plan step.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap};

use audience_core::types::output_table_name;
use audience_core::{AudienceError, AudienceResult, DateRange, RuleId, SetOperation};
use serde::Serialize;

use crate::condition::ConditionNode;
use crate::rule::RuleDefinition;
use crate::sql::SqlRenderer;

/// A dependency's published table, read instead of its raw predicate.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DependencyInput {
    pub rule_id: RuleId,
    pub table: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SegmentQuery {
    /// Predicate over raw transactions.
    Scan { predicate: ConditionNode },
    /// Set operation over dependency output tables, optionally combined
    /// with a residual scan.
    Compose {
        operation: SetOperation,
        inputs: Vec<DependencyInput>,
        residual: Option<ConditionNode>,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct PlanStep {
    pub rule_id: RuleId,
    pub output_table: String,
    pub window: DateRange,
    pub depends_on: Vec<RuleId>,
    pub query: SegmentQuery,
    pub sql: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct MaterializationPlan {
    pub order: Vec<RuleId>,
    pub steps: Vec<PlanStep>,
}

#[derive(Debug, Clone, Default)]
pub struct ExecutionPlanner {
    sql: SqlRenderer,
}

impl ExecutionPlanner {
    pub fn new(sql: SqlRenderer) -> Self {
        Self { sql }
    }

    /// Topological order over `depends_on`, ties broken by ascending id.
    /// Dependencies outside `rules` are treated as already satisfied.
    pub fn order(&self, rules: &BTreeMap<RuleId, Vec<RuleId>>) -> AudienceResult<Vec<RuleId>> {
        let mut remaining: BTreeMap<RuleId, usize> = BTreeMap::new();
        let mut dependents: BTreeMap<RuleId, Vec<RuleId>> = BTreeMap::new();
        for (&id, deps) in rules {
            let inside: BTreeSet<RuleId> = deps
                .iter()
                .copied()
                .filter(|d| rules.contains_key(d))
                .collect();
            remaining.insert(id, inside.len());
            for dep in inside {
                dependents.entry(dep).or_default().push(id);
            }
        }

        let mut ready: BinaryHeap<Reverse<RuleId>> = remaining
            .iter()
            .filter(|(_, &n)| n == 0)
            .map(|(&id, _)| Reverse(id))
            .collect();
        let mut order = Vec::with_capacity(rules.len());
        while let Some(Reverse(id)) = ready.pop() {
            order.push(id);
            for &dependent in dependents.get(&id).into_iter().flatten() {
                if let Some(n) = remaining.get_mut(&dependent) {
                    *n -= 1;
                    if *n == 0 {
                        ready.push(Reverse(dependent));
                    }
                }
            }
        }

        if order.len() < rules.len() {
            let emitted: BTreeSet<RuleId> = order.iter().copied().collect();
            return Err(find_cycle(rules, &emitted));
        }
        Ok(order)
    }

    /// Order `rules` and build a step for each.
    pub fn plan(&self, rules: &[&RuleDefinition]) -> AudienceResult<MaterializationPlan> {
        let relation: BTreeMap<RuleId, Vec<RuleId>> = rules
            .iter()
            .map(|r| (r.id, r.depends_on.clone()))
            .collect();
        let order = self.order(&relation)?;
        let by_id: BTreeMap<RuleId, &RuleDefinition> = rules.iter().map(|r| (r.id, *r)).collect();
        let steps = order
            .iter()
            .filter_map(|id| by_id.get(id))
            .map(|rule| self.step(rule))
            .collect();
        Ok(MaterializationPlan { order, steps })
    }

    pub fn step(&self, rule: &RuleDefinition) -> PlanStep {
        let query = match (rule.operation, rule.depends_on.is_empty()) {
            (Some(operation), false) => SegmentQuery::Compose {
                operation,
                inputs: rule
                    .depends_on
                    .iter()
                    .map(|&dep| DependencyInput {
                        rule_id: dep,
                        table: output_table_name(dep),
                    })
                    .collect(),
                residual: rule.residual.clone(),
            },
            _ => SegmentQuery::Scan {
                predicate: rule.condition.clone(),
            },
        };
        let sql = self.sql.render(&query, &rule.window);
        PlanStep {
            rule_id: rule.id,
            output_table: rule.output_table(),
            window: rule.window,
            depends_on: rule.depends_on.clone(),
            query,
            sql,
        }
    }
}

fn find_cycle(rules: &BTreeMap<RuleId, Vec<RuleId>>, emitted: &BTreeSet<RuleId>) -> AudienceError {
    let stuck: BTreeSet<RuleId> = rules
        .keys()
        .copied()
        .filter(|id| !emitted.contains(id))
        .collect();
    let Some(&start) = stuck.iter().next() else {
        return AudienceError::validation("dependency ordering failed");
    };
    // Every stuck rule has at least one stuck dependency, so this walk
    // must revisit a rule.
    let mut path = vec![start];
    let mut cursor = start;
    loop {
        let next = rules
            .get(&cursor)
            .into_iter()
            .flatten()
            .copied()
            .filter(|d| stuck.contains(d))
            .min();
        let Some(next) = next else {
            return AudienceError::Cycle {
                rule_id: start,
                path,
            };
        };
        if let Some(pos) = path.iter().position(|&p| p == next) {
            let mut cycle = path.split_off(pos);
            cycle.push(next);
            return AudienceError::Cycle {
                rule_id: next,
                path: cycle,
            };
        }
        path.push(next);
        cursor = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn relation(edges: &[(RuleId, &[RuleId])]) -> BTreeMap<RuleId, Vec<RuleId>> {
        edges.iter().map(|(id, deps)| (*id, deps.to_vec())).collect()
    }

    #[test]
    fn test_dependencies_come_first() {
        let planner = ExecutionPlanner::default();
        let order = planner
            .order(&relation(&[(5, &[3, 4]), (4, &[]), (3, &[1]), (2, &[]), (1, &[])]))
            .unwrap();
        assert_eq!(order, vec![1, 2, 3, 4, 5]);

        let order = planner
            .order(&relation(&[(1, &[7]), (7, &[]), (3, &[])]))
            .unwrap();
        assert_eq!(order, vec![3, 7, 1]);
    }

    #[test]
    fn test_outside_dependencies_are_ignored() {
        let order = ExecutionPlanner::default()
            .order(&relation(&[(4, &[99]), (2, &[4])]))
            .unwrap();
        assert_eq!(order, vec![4, 2]);
    }

    #[test]
    fn test_cycle_is_reported_with_path() {
        let err = ExecutionPlanner::default()
            .order(&relation(&[(1, &[2]), (2, &[3]), (3, &[1]), (4, &[])]))
            .unwrap_err();
        match err {
            AudienceError::Cycle { path, .. } => assert_eq!(path, vec![1, 2, 3, 1]),
            other => panic!("expected cycle, got {other:?}"),
        }
    }
}
