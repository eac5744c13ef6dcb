//! Finds reusable segments for a rule by comparing DNF clause sets.
//!
//! Two reuse shapes are recognised:
//! - INTERSECTION: another rule's single clause is contained in every clause
//!   of the target, so the target is that segment further filtered by the
//!   atoms left over.
//! - UNION: another rule's clauses are a subset of the target's clauses, so
//!   the target is that segment plus the remaining clauses.

use std::cmp::Ordering;

use audience_core::config::ResolverConfig;
use audience_core::{AudienceError, AudienceResult, DateRange, RuleId, SetOperation};
use serde::Serialize;
use tracing::debug;

use crate::condition::{Clause, ConditionNode, Dnf};
use crate::graph::DependencyGraph;

/// One edge of the dependency DAG as exposed to callers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DependencyEdge {
    pub rule_id: RuleId,
    pub depends_on_rule_id: RuleId,
    pub operation: SetOperation,
    pub extra_predicate: Option<String>,
}

/// Outcome of resolving one rule.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Resolution {
    pub depends_on: Vec<RuleId>,
    pub operation: Option<SetOperation>,
    /// Predicate applied on top of the combined dependencies. `None` means
    /// the dependencies alone define the segment (or there are none).
    pub residual: Option<ConditionNode>,
}

impl Resolution {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn has_dependencies(&self) -> bool {
        !self.depends_on.is_empty()
    }

    pub fn extra_predicate(&self) -> Option<String> {
        self.residual.as_ref().map(|r| r.to_string())
    }

    pub fn edges(&self, rule_id: RuleId) -> Vec<DependencyEdge> {
        let Some(operation) = self.operation else {
            return Vec::new();
        };
        let extra_predicate = self.extra_predicate();
        self.depends_on
            .iter()
            .map(|&dep| DependencyEdge {
                rule_id,
                depends_on_rule_id: dep,
                operation,
                extra_predicate: extra_predicate.clone(),
            })
            .collect()
    }
}

/// A rule the resolver may reuse.
#[derive(Debug, Clone, Copy)]
pub struct ReuseCandidate<'a> {
    pub rule_id: RuleId,
    pub dnf: &'a Dnf,
    pub window: &'a DateRange,
    pub estimated_size: Option<u64>,
}

/// The rule being resolved.
#[derive(Debug, Clone, Copy)]
pub struct ResolveTarget<'a> {
    pub rule_id: RuleId,
    pub dnf: &'a Dnf,
    pub window: &'a DateRange,
}

#[derive(Debug, Clone)]
struct Scored<'a> {
    candidate: ReuseCandidate<'a>,
    operation: SetOperation,
    shared: usize,
}

#[derive(Debug, Clone)]
pub struct DependencyResolver {
    config: ResolverConfig,
}

impl DependencyResolver {
    pub fn new(config: ResolverConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    /// Pick the best reuse for `target` among `candidates` (the other active
    /// rules). Candidates that already depend on the target, directly or
    /// not, are skipped so the result can always be committed.
    ///
    /// Windows only have to overlap. A composed segment keeps just the users
    /// with transactions in the target's own window and re-aggregates their
    /// spend and counts over that window, so a wider dependency window can
    /// never leak rows from outside it. Dependency membership itself is
    /// taken as built: a user who qualified for the dependency only on
    /// transactions outside the target's window still passes through an
    /// INTERSECTION or UNION when they have other in-window activity. Rules
    /// that must not accept that share the same window with their
    /// dependencies, or pin a raw scan through an override.
    pub fn resolve(
        &self,
        target: ResolveTarget<'_>,
        candidates: &[ReuseCandidate<'_>],
        graph: &DependencyGraph,
    ) -> Resolution {
        let mut scored: Vec<Scored<'_>> = candidates
            .iter()
            .filter(|c| c.rule_id != target.rule_id)
            .filter(|c| c.window.overlaps(target.window))
            .filter(|c| !graph.depends_on_transitively(c.rule_id, target.rule_id))
            .filter_map(|c| score(target.dnf, *c))
            .filter(|s| s.shared >= self.config.min_shared_predicates.max(1))
            .collect();

        if scored.is_empty() {
            debug!(rule_id = target.rule_id, "No reusable segment found");
            return Resolution::none();
        }

        scored.sort_by(|a, b| self.rank(a, b));
        let top = scored[0].clone();
        let mut chosen = vec![top.candidate];

        if self.config.allow_multiple_dependencies {
            for next in scored.iter().skip(1).filter(|s| s.operation == top.operation) {
                let independent = chosen.iter().all(|c| match top.operation {
                    SetOperation::Intersection => single(c.dnf)
                        .zip(single(next.candidate.dnf))
                        .is_some_and(|(a, b)| a.is_disjoint(b)),
                    SetOperation::Union => c
                        .dnf
                        .clauses()
                        .iter()
                        .all(|clause| !next.candidate.dnf.contains_clause(clause)),
                });
                if independent {
                    chosen.push(next.candidate);
                }
            }
        }

        let mut depends_on: Vec<RuleId> = chosen.iter().map(|c| c.rule_id).collect();
        depends_on.sort_unstable();
        let dep_dnfs: Vec<&Dnf> = chosen.iter().map(|c| c.dnf).collect();
        let residual = compute_residual(top.operation, target.dnf, &dep_dnfs);

        debug!(
            rule_id = target.rule_id,
            ?depends_on,
            operation = %top.operation,
            shared = top.shared,
            "Resolved segment reuse"
        );

        Resolution {
            depends_on,
            operation: Some(top.operation),
            residual: residual.to_node(),
        }
    }

    fn rank(&self, a: &Scored<'_>, b: &Scored<'_>) -> Ordering {
        let by_shared = b.shared.cmp(&a.shared);
        let by_size = if self.config.prefer_smaller_tables {
            match (a.candidate.estimated_size, b.candidate.estimated_size) {
                (Some(x), Some(y)) => x.cmp(&y),
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            }
        } else {
            Ordering::Equal
        };
        by_shared
            .then(by_size)
            .then(a.candidate.rule_id.cmp(&b.candidate.rule_id))
    }
}

impl Default for DependencyResolver {
    fn default() -> Self {
        Self::new(ResolverConfig::default())
    }
}

fn single(dnf: &Dnf) -> Option<&Clause> {
    dnf.single_clause()
}

fn score<'a>(target: &Dnf, candidate: ReuseCandidate<'a>) -> Option<Scored<'a>> {
    if let Some(cb) = candidate.dnf.single_clause() {
        if !cb.is_empty() && target.clauses().iter().all(|c| cb.is_subset(c)) {
            return Some(Scored {
                candidate,
                operation: SetOperation::Intersection,
                shared: cb.len(),
            });
        }
    }
    if target.len() >= 2
        && candidate.dnf.clauses().iter().all(|c| target.contains_clause(c))
    {
        return Some(Scored {
            candidate,
            operation: SetOperation::Union,
            shared: candidate.dnf.atom_count(),
        });
    }
    None
}

/// Residual left after combining `deps` with `operation`, assuming the
/// combination has already been validated.
fn compute_residual(operation: SetOperation, target: &Dnf, deps: &[&Dnf]) -> Dnf {
    match operation {
        SetOperation::Intersection => {
            let covered: Clause = deps
                .iter()
                .filter_map(|d| d.single_clause())
                .flat_map(|c| c.iter().cloned())
                .collect();
            let stripped: Vec<Clause> = target
                .clauses()
                .iter()
                .map(|c| c.difference(&covered).cloned().collect())
                .collect();
            Dnf::from_clauses(stripped)
        }
        SetOperation::Union => {
            let uncovered: Vec<Clause> = target
                .clauses()
                .iter()
                .filter(|c| !deps.iter().any(|d| d.contains_clause(c)))
                .cloned()
                .collect();
            Dnf::from_clauses(uncovered)
        }
    }
}

/// Check that `target` can be derived from `deps` with `operation` and
/// return the residual predicate.
///
/// INTERSECTION needs the target to imply every dependency; UNION needs
/// every dependency to imply the target.
pub fn residual_for(
    operation: SetOperation,
    target: &Dnf,
    deps: &[(RuleId, &Dnf)],
) -> AudienceResult<Option<ConditionNode>> {
    for (dep_id, dep) in deps {
        let sound = match operation {
            SetOperation::Intersection => target
                .clauses()
                .iter()
                .all(|c| dep.clauses().iter().any(|d| d.is_subset(c))),
            SetOperation::Union => dep
                .clauses()
                .iter()
                .all(|d| target.clauses().iter().any(|c| c.is_subset(d))),
        };
        if !sound {
            return Err(AudienceError::validation(format!(
                "rule {dep_id} cannot be combined with {operation} to produce this condition"
            )));
        }
    }
    let dnfs: Vec<&Dnf> = deps.iter().map(|(_, d)| *d).collect();
    Ok(compute_residual(operation, target, &dnfs).to_node())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::ConditionParser;
    use serde_json::json;

    fn dnf(raw: serde_json::Value) -> Dnf {
        ConditionParser::default().normalize(&raw).unwrap().dnf
    }

    fn candidate<'a>(id: RuleId, dnf: &'a Dnf, window: &'a DateRange) -> ReuseCandidate<'a> {
        ReuseCandidate {
            rule_id: id,
            dnf,
            window,
            estimated_size: None,
        }
    }

    fn graph_with(ids: &[RuleId]) -> DependencyGraph {
        let mut g = DependencyGraph::new();
        for &id in ids {
            g.add_rule(id);
        }
        g
    }

    #[test]
    fn test_intersection_with_extra_predicate() {
        let w = DateRange::unbounded();
        let a = dnf(json!({"field": "city_tier", "operator": "=", "value": 1}));
        let b = dnf(json!({"logic": "AND", "children": [
            {"field": "city_tier", "operator": "=", "value": 1},
            {"field": "total_spend", "operator": ">", "value": 1000}
        ]}));
        let resolver = DependencyResolver::default();
        let res = resolver.resolve(
            ResolveTarget { rule_id: 2, dnf: &b, window: &w },
            &[candidate(1, &a, &w)],
            &graph_with(&[1, 2]),
        );
        assert_eq!(res.depends_on, vec![1]);
        assert_eq!(res.operation, Some(SetOperation::Intersection));
        assert_eq!(res.extra_predicate().as_deref(), Some("total_spend > 1000"));

        let edges = res.edges(2);
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].depends_on_rule_id, 1);
    }

    #[test]
    fn test_superset_rule_does_not_depend_on_subset() {
        let w = DateRange::unbounded();
        let a = dnf(json!({"field": "city_tier", "operator": "=", "value": 1}));
        let b = dnf(json!([
            {"field": "city_tier", "value": 1},
            {"field": "total_spend", "operator": ">", "value": 1000}
        ]));
        let res = DependencyResolver::default().resolve(
            ResolveTarget { rule_id: 1, dnf: &a, window: &w },
            &[candidate(2, &b, &w)],
            &graph_with(&[1, 2]),
        );
        assert_eq!(res, Resolution::none());
    }

    #[test]
    fn test_union_of_two_segments() {
        let w = DateRange::unbounded();
        let c = dnf(json!({"field": "category", "value": "Travel"}));
        let d = dnf(json!({"field": "category", "value": "Groceries"}));
        let e = dnf(json!({"logic": "OR", "children": [
            {"field": "category", "value": "Travel"},
            {"field": "category", "value": "Groceries"}
        ]}));
        let res = DependencyResolver::default().resolve(
            ResolveTarget { rule_id: 5, dnf: &e, window: &w },
            &[candidate(3, &c, &w), candidate(4, &d, &w)],
            &graph_with(&[3, 4, 5]),
        );
        assert_eq!(res.depends_on, vec![3, 4]);
        assert_eq!(res.operation, Some(SetOperation::Union));
        assert_eq!(res.residual, None);
    }

    #[test]
    fn test_union_keeps_uncovered_clause_as_residual() {
        let w = DateRange::unbounded();
        let c = dnf(json!({"field": "category", "value": "Travel"}));
        let e = dnf(json!({"logic": "OR", "children": [
            {"field": "category", "value": "Travel"},
            {"field": "amount", "operator": ">", "value": 500}
        ]}));
        let res = DependencyResolver::default().resolve(
            ResolveTarget { rule_id: 2, dnf: &e, window: &w },
            &[candidate(1, &c, &w)],
            &graph_with(&[1, 2]),
        );
        assert_eq!(res.operation, Some(SetOperation::Union));
        assert_eq!(res.extra_predicate().as_deref(), Some("amount > 500"));
    }

    #[test]
    fn test_ranking_prefers_most_shared_then_size_then_id() {
        let w = DateRange::unbounded();
        let tier = dnf(json!({"field": "city_tier", "value": 1}));
        let tier_upi = dnf(json!([
            {"field": "city_tier", "value": 1},
            {"field": "transaction_type", "value": "UPI"}
        ]));
        let tier_upi_copy = tier_upi.clone();
        let target = dnf(json!([
            {"field": "city_tier", "value": 1},
            {"field": "transaction_type", "value": "UPI"},
            {"field": "amount", "operator": ">", "value": 10}
        ]));
        let resolver = DependencyResolver::new(ResolverConfig {
            allow_multiple_dependencies: false,
            ..ResolverConfig::default()
        });
        let g = graph_with(&[1, 2, 3, 9]);

        let mut big = candidate(2, &tier_upi, &w);
        big.estimated_size = Some(500);
        let mut small = candidate(3, &tier_upi_copy, &w);
        small.estimated_size = Some(20);
        let res = resolver.resolve(
            ResolveTarget { rule_id: 9, dnf: &target, window: &w },
            &[candidate(1, &tier, &w), big, small],
            &g,
        );
        assert_eq!(res.depends_on, vec![3]);

        let res = resolver.resolve(
            ResolveTarget { rule_id: 9, dnf: &target, window: &w },
            &[candidate(1, &tier, &w), candidate(3, &tier_upi_copy, &w), candidate(2, &tier_upi, &w)],
            &g,
        );
        assert_eq!(res.depends_on, vec![2]);
    }

    #[test]
    fn test_multiple_independent_intersections() {
        let w = DateRange::unbounded();
        let tier = dnf(json!({"field": "city_tier", "value": 1}));
        let travel = dnf(json!({"field": "category", "value": "Travel"}));
        let target = dnf(json!([
            {"field": "city_tier", "value": 1},
            {"field": "category", "value": "Travel"},
            {"field": "total_spend", "operator": ">", "value": 100}
        ]));
        let res = DependencyResolver::default().resolve(
            ResolveTarget { rule_id: 3, dnf: &target, window: &w },
            &[candidate(1, &tier, &w), candidate(2, &travel, &w)],
            &graph_with(&[1, 2, 3]),
        );
        assert_eq!(res.depends_on, vec![1, 2]);
        assert_eq!(res.extra_predicate().as_deref(), Some("total_spend > 100"));
    }

    #[test]
    fn test_non_overlapping_windows_are_skipped() {
        let q1 = DateRange::new(chrono::NaiveDate::from_ymd_opt(2024, 1, 1), chrono::NaiveDate::from_ymd_opt(2024, 3, 31));
        let q2 = DateRange::new(chrono::NaiveDate::from_ymd_opt(2024, 4, 1), chrono::NaiveDate::from_ymd_opt(2024, 6, 30));
        let a = dnf(json!({"field": "city_tier", "value": 1}));
        let b = dnf(json!([{"field": "city_tier", "value": 1}, {"field": "amount", "operator": ">", "value": 5}]));
        let res = DependencyResolver::default().resolve(
            ResolveTarget { rule_id: 2, dnf: &b, window: &q2 },
            &[candidate(1, &a, &q1)],
            &graph_with(&[1, 2]),
        );
        assert!(!res.has_dependencies());
    }

    #[test]
    fn test_candidates_depending_on_target_are_skipped() {
        let w = DateRange::unbounded();
        let a = dnf(json!({"field": "city_tier", "value": 1}));
        let b = dnf(json!([{"field": "city_tier", "value": 1}, {"field": "amount", "operator": ">", "value": 5}]));
        let mut g = graph_with(&[1, 2]);
        g.set_dependencies(1, &[2], Some(SetOperation::Intersection)).unwrap();
        let res = DependencyResolver::default().resolve(
            ResolveTarget { rule_id: 2, dnf: &b, window: &w },
            &[candidate(1, &a, &w)],
            &g,
        );
        assert!(!res.has_dependencies());
    }

    #[test]
    fn test_residual_for_validates_soundness() {
        let a = dnf(json!({"field": "city_tier", "value": 1}));
        let b = dnf(json!([{"field": "city_tier", "value": 1}, {"field": "amount", "operator": ">", "value": 5}]));
        let residual = residual_for(SetOperation::Intersection, &b, &[(1, &a)]).unwrap();
        assert_eq!(residual.map(|r| r.to_string()).as_deref(), Some("amount > 5"));

        assert!(residual_for(SetOperation::Intersection, &a, &[(2, &b)]).is_err());
        assert!(residual_for(SetOperation::Union, &b, &[(1, &a)]).is_err());
        assert_eq!(residual_for(SetOperation::Union, &a, &[(2, &b)]).unwrap().map(|r| r.to_string()).as_deref(), Some("city_tier = 1"));
    }
}
