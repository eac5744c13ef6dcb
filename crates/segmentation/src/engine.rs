//! Rule registry: the entry point the CRUD layer calls on create/update.
//!
//! Every mutation works on a copy of the registry and is committed only when
//! normalization, resolution and the cycle check all succeed.

use std::collections::BTreeMap;

use audience_core::config::{RawTablesConfig, ResolverConfig};
use audience_core::{AppConfig, AudienceError, AudienceResult, RuleId, Schedule, SetOperation};
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{info, warn};

use crate::condition::{ConditionModel, ConditionNode};
use crate::graph::DependencyGraph;
use crate::parser::{render_predicate, ConditionParser};
use crate::planner::{ExecutionPlanner, MaterializationPlan, PlanStep};
use crate::resolver::{
    residual_for, DependencyEdge, DependencyResolver, Resolution, ResolveTarget, ReuseCandidate,
};
use crate::rule::{DependencySource, NewRule, RuleDefinition, RuleStatus, RuleUpdate};
use crate::sql::SqlRenderer;

#[derive(Debug, Clone)]
struct RegisteredRule {
    definition: RuleDefinition,
    model: ConditionModel,
}

#[derive(Debug, Clone)]
struct Registry {
    rules: BTreeMap<RuleId, RegisteredRule>,
    graph: DependencyGraph,
    next_id: RuleId,
}

impl Default for Registry {
    fn default() -> Self {
        Self {
            rules: BTreeMap::new(),
            graph: DependencyGraph::new(),
            next_id: 1,
        }
    }
}

impl Registry {
    fn get(&self, id: RuleId) -> AudienceResult<&RegisteredRule> {
        self.rules.get(&id).ok_or(AudienceError::RuleNotFound(id))
    }

    fn get_mut(&mut self, id: RuleId) -> AudienceResult<&mut RegisteredRule> {
        self.rules.get_mut(&id).ok_or(AudienceError::RuleNotFound(id))
    }

    fn relation(&self) -> BTreeMap<RuleId, Vec<RuleId>> {
        self.rules
            .iter()
            .map(|(&id, r)| (id, r.definition.depends_on.clone()))
            .collect()
    }

    fn ensure_unique_name(&self, name: &str, except: Option<RuleId>) -> AudienceResult<()> {
        let taken = self
            .rules
            .values()
            .any(|r| Some(r.definition.id) != except && r.definition.name == name);
        if taken {
            return Err(AudienceError::validation(format!(
                "a rule named '{name}' already exists"
            )));
        }
        Ok(())
    }
}

/// Canonical form of a raw condition, as returned by the normalize preview.
#[derive(Debug, Clone, Serialize)]
pub struct NormalizedCondition {
    pub condition: ConditionNode,
    pub display: String,
    pub dnf: Vec<Vec<String>>,
    pub predicate_sql: String,
}

pub struct SegmentationEngine {
    registry: RwLock<Registry>,
    parser: ConditionParser,
    resolver: DependencyResolver,
    planner: ExecutionPlanner,
    size_hints: DashMap<RuleId, u64>,
}

impl SegmentationEngine {
    pub fn new(resolver: ResolverConfig, raw_tables: &RawTablesConfig) -> Self {
        Self {
            registry: RwLock::new(Registry::default()),
            parser: ConditionParser::from_config(&resolver),
            resolver: DependencyResolver::new(resolver),
            planner: ExecutionPlanner::new(SqlRenderer::new(raw_tables)),
            size_hints: DashMap::new(),
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(config.resolver.clone(), &config.raw_tables)
    }

    pub fn parser(&self) -> &ConditionParser {
        &self.parser
    }

    // ─── Mutations ──────────────────────────────────────────────────────

    pub fn create_rule(&self, new: NewRule) -> AudienceResult<RuleDefinition> {
        let name = new.name.trim().to_string();
        if name.is_empty() {
            return Err(AudienceError::validation("rule name must not be empty"));
        }
        if !new.window.is_valid() {
            return Err(AudienceError::validation("window start is after window end"));
        }
        let schedule = Schedule::parse(new.schedule.as_deref())?;
        let model = self.parser.normalize(&new.condition)?;

        let mut guard = self.registry.write();
        let mut work = guard.clone();
        work.ensure_unique_name(&name, None)?;

        let id = work.next_id;
        work.next_id += 1;
        let now = Utc::now();
        let definition = RuleDefinition {
            id,
            name,
            description: new.description,
            condition: model.root.clone(),
            schedule,
            window: new.window,
            revision: 1,
            depends_on: Vec::new(),
            operation: None,
            residual: None,
            extra_predicate: None,
            dependency_source: DependencySource::Resolved,
            status: new.status,
            created_at: now,
            updated_at: now,
        };
        work.rules.insert(id, RegisteredRule { definition, model });
        work.graph.add_rule(id);

        self.resolve_into(&mut work, id)?;
        self.reconcile(&mut work, id)?;
        debug_assert!(work.graph.is_acyclic());

        let created = work.get(id)?.definition.clone();
        *guard = work;
        info!(
            rule_id = id,
            name = %created.name,
            depends_on = ?created.depends_on,
            operation = ?created.operation,
            "Rule created"
        );
        Ok(created)
    }

    pub fn update_rule(&self, id: RuleId, update: RuleUpdate) -> AudienceResult<RuleDefinition> {
        let model = update
            .condition
            .as_ref()
            .map(|raw| self.parser.normalize(raw))
            .transpose()?;
        let schedule = update
            .schedule
            .as_ref()
            .map(|s| Schedule::parse(s.as_deref()))
            .transpose()?;

        let mut guard = self.registry.write();
        let mut work = guard.clone();
        if let Some(name) = &update.name {
            let name = name.trim();
            if name.is_empty() {
                return Err(AudienceError::validation("rule name must not be empty"));
            }
            work.ensure_unique_name(name, Some(id))?;
        }

        {
            let rule = work.get_mut(id)?;
            let def = &mut rule.definition;
            if let Some(name) = update.name {
                def.name = name.trim().to_string();
            }
            if let Some(description) = update.description {
                def.description = Some(description);
            }
            if let Some(schedule) = schedule {
                def.schedule = schedule;
            }
            let mut changed = false;
            if let Some(window) = update.window {
                if !window.is_valid() {
                    return Err(AudienceError::validation("window start is after window end"));
                }
                changed |= def.window != window;
                def.window = window;
            }
            if let Some(model) = model {
                changed |= def.condition != model.root;
                def.condition = model.root.clone();
                rule.model = model;
            }
            if changed {
                rule.definition.revision += 1;
            }
            rule.definition.updated_at = Utc::now();
        }

        self.refresh(&mut work, id)?;
        self.reconcile(&mut work, id)?;

        let updated = work.get(id)?.definition.clone();
        *guard = work;
        info!(rule_id = id, depends_on = ?updated.depends_on, "Rule updated");
        Ok(updated)
    }

    /// Human override of a rule's dependencies. An empty list pins the rule
    /// to a raw scan.
    pub fn set_dependencies(
        &self,
        id: RuleId,
        depends_on: Vec<RuleId>,
        operation: Option<SetOperation>,
    ) -> AudienceResult<RuleDefinition> {
        let mut guard = self.registry.write();
        let mut work = guard.clone();
        work.get(id)?;

        let mut deps = depends_on;
        deps.sort_unstable();
        deps.dedup();

        let (operation, residual) = if deps.is_empty() {
            (None, None)
        } else {
            let operation = operation.ok_or_else(|| {
                AudienceError::validation("an operation is required when depends_on is not empty")
            })?;
            let residual = self.validate_dependencies(&work, id, &deps, operation)?;
            (Some(operation), residual)
        };

        work.graph.set_dependencies(id, &deps, operation)?;
        let rule = work.get_mut(id)?;
        apply_dependencies(
            &mut rule.definition,
            deps,
            operation,
            residual,
            DependencySource::Override,
        );
        let updated = rule.definition.clone();
        *guard = work;
        info!(rule_id = id, depends_on = ?updated.depends_on, operation = ?updated.operation, "Dependencies overridden");
        Ok(updated)
    }

    pub fn set_status(&self, id: RuleId, status: RuleStatus) -> AudienceResult<RuleDefinition> {
        let mut guard = self.registry.write();
        let mut work = guard.clone();
        {
            let def = &mut work.get_mut(id)?.definition;
            if def.status == status {
                return Ok(def.clone());
            }
            def.status = status;
            def.updated_at = Utc::now();
        }
        if status == RuleStatus::Active {
            self.reconcile(&mut work, id)?;
        }
        let updated = work.get(id)?.definition.clone();
        *guard = work;
        info!(rule_id = id, status = ?status, "Rule status changed");
        Ok(updated)
    }

    /// Remove a rule. Rejected while other rules depend on it.
    pub fn delete_rule(&self, id: RuleId) -> AudienceResult<RuleDefinition> {
        let mut guard = self.registry.write();
        guard.get(id)?;
        let dependents = guard.graph.dependents(id);
        if !dependents.is_empty() {
            return Err(AudienceError::validation(format!(
                "rule {id} is used by rules {dependents:?}"
            )));
        }
        guard.graph.remove_rule(id);
        let removed = guard.rules.remove(&id).ok_or(AudienceError::RuleNotFound(id))?;
        self.size_hints.remove(&id);
        info!(rule_id = id, "Rule deleted");
        Ok(removed.definition)
    }

    /// Published row count of a rule's segment; used to rank reuse
    /// candidates.
    pub fn record_segment_size(&self, id: RuleId, rows: u64) {
        self.size_hints.insert(id, rows);
    }

    // ─── Reads ──────────────────────────────────────────────────────────

    pub fn get_rule(&self, id: RuleId) -> AudienceResult<RuleDefinition> {
        Ok(self.registry.read().get(id)?.definition.clone())
    }

    pub fn list_rules(&self) -> Vec<RuleDefinition> {
        self.registry
            .read()
            .rules
            .values()
            .map(|r| r.definition.clone())
            .collect()
    }

    pub fn dependency_edges(&self) -> Vec<DependencyEdge> {
        self.registry
            .read()
            .rules
            .values()
            .flat_map(|r| {
                let def = &r.definition;
                Resolution {
                    depends_on: def.depends_on.clone(),
                    operation: def.operation,
                    residual: def.residual.clone(),
                }
                .edges(def.id)
            })
            .collect()
    }

    pub fn graph_is_acyclic(&self) -> bool {
        self.registry.read().graph.is_acyclic()
    }

    /// Materialization plan for every active rule and whatever it depends on.
    pub fn plan(&self) -> AudienceResult<MaterializationPlan> {
        let registry = self.registry.read();
        let mut included: BTreeMap<RuleId, &RuleDefinition> = BTreeMap::new();
        let mut pending: Vec<RuleId> = registry
            .rules
            .values()
            .filter(|r| r.definition.is_active())
            .map(|r| r.definition.id)
            .collect();
        while let Some(id) = pending.pop() {
            if included.contains_key(&id) {
                continue;
            }
            if let Some(rule) = registry.rules.get(&id) {
                included.insert(id, &rule.definition);
                pending.extend(rule.definition.depends_on.iter().copied());
            }
        }
        let rules: Vec<&RuleDefinition> = included.into_values().collect();
        self.planner.plan(&rules)
    }

    pub fn plan_step(&self, id: RuleId) -> AudienceResult<PlanStep> {
        let registry = self.registry.read();
        Ok(self.planner.step(&registry.get(id)?.definition))
    }

    /// Topological order of every registered rule.
    pub fn materialization_order(&self) -> AudienceResult<Vec<RuleId>> {
        let relation = self.registry.read().relation();
        self.planner.order(&relation)
    }

    pub fn normalize_preview(&self, raw: &serde_json::Value) -> AudienceResult<NormalizedCondition> {
        let model = self.parser.normalize(raw)?;
        Ok(NormalizedCondition {
            display: model.root.to_string(),
            predicate_sql: render_predicate(&model.root),
            dnf: model
                .dnf
                .clauses()
                .iter()
                .map(|clause| clause.iter().map(|c| c.to_string()).collect())
                .collect(),
            condition: model.root,
        })
    }

    // ─── Resolution ─────────────────────────────────────────────────────

    fn resolve_into(&self, work: &mut Registry, id: RuleId) -> AudienceResult<()> {
        let resolution = {
            let target = work.get(id)?;
            let candidates: Vec<ReuseCandidate<'_>> = work
                .rules
                .values()
                .filter(|r| r.definition.id != id && r.definition.is_active())
                .map(|r| ReuseCandidate {
                    rule_id: r.definition.id,
                    dnf: &r.model.dnf,
                    window: &r.definition.window,
                    estimated_size: self.size_hints.get(&r.definition.id).map(|s| *s),
                })
                .collect();
            self.resolver.resolve(
                ResolveTarget {
                    rule_id: id,
                    dnf: &target.model.dnf,
                    window: &target.definition.window,
                },
                &candidates,
                &work.graph,
            )
        };

        work.graph
            .set_dependencies(id, &resolution.depends_on, resolution.operation)?;
        let def = &mut work.get_mut(id)?.definition;
        apply_dependencies(
            def,
            resolution.depends_on,
            resolution.operation,
            resolution.residual,
            DependencySource::Resolved,
        );
        Ok(())
    }

    /// Re-derive one rule's dependencies after something it may rely on
    /// changed. Overrides and inactive rules keep their edges while those
    /// stay sound.
    fn refresh(&self, work: &mut Registry, id: RuleId) -> AudienceResult<()> {
        let (keep_current, deps, operation) = {
            let def = &work.get(id)?.definition;
            (
                def.dependency_source == DependencySource::Override || !def.is_active(),
                def.depends_on.clone(),
                def.operation,
            )
        };
        if keep_current {
            let Some(operation) = operation.filter(|_| !deps.is_empty()) else {
                return Ok(());
            };
            match self.validate_dependencies(work, id, &deps, operation) {
                Ok(residual) => {
                    let def = &mut work.get_mut(id)?.definition;
                    def.extra_predicate = residual.as_ref().map(|r| r.to_string());
                    def.residual = residual;
                    return Ok(());
                }
                Err(e) => {
                    warn!(rule_id = id, error = %e, "Kept dependencies are no longer valid, re-resolving");
                }
            }
        }
        self.resolve_into(work, id)
    }

    /// Refresh every rule except `changed` in dependency order.
    fn reconcile(&self, work: &mut Registry, changed: RuleId) -> AudienceResult<()> {
        let order = self.planner.order(&work.relation())?;
        for id in order.into_iter().filter(|&id| id != changed) {
            self.refresh(work, id)?;
        }
        Ok(())
    }

    fn validate_dependencies(
        &self,
        work: &Registry,
        id: RuleId,
        deps: &[RuleId],
        operation: SetOperation,
    ) -> AudienceResult<Option<ConditionNode>> {
        let target = work.get(id)?;
        let mut dep_dnfs = Vec::with_capacity(deps.len());
        for &dep in deps {
            if dep == id {
                return Err(AudienceError::Cycle {
                    rule_id: id,
                    path: vec![id, id],
                });
            }
            let rule = work.get(dep)?;
            if !rule.definition.window.overlaps(&target.definition.window) {
                return Err(AudienceError::validation(format!(
                    "rule {dep} covers a date window that does not overlap rule {id}"
                )));
            }
            dep_dnfs.push((dep, &rule.model.dnf));
        }
        residual_for(operation, &target.model.dnf, &dep_dnfs)
    }
}

impl Default for SegmentationEngine {
    fn default() -> Self {
        Self::new(ResolverConfig::default(), &RawTablesConfig::default())
    }
}

fn apply_dependencies(
    def: &mut RuleDefinition,
    depends_on: Vec<RuleId>,
    operation: Option<SetOperation>,
    residual: Option<ConditionNode>,
    source: DependencySource,
) {
    def.operation = if depends_on.is_empty() { None } else { operation };
    def.depends_on = depends_on;
    def.extra_predicate = residual.as_ref().map(|r| r.to_string());
    def.residual = residual;
    def.dependency_source = source;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{any_of, cond, RuleBuilder};
    use crate::planner::SegmentQuery;
    use audience_core::DateRange;
    use chrono::NaiveDate;
    use serde_json::json;

    fn tier1() -> NewRule {
        RuleBuilder::new("tier1").city_tier(1).build()
    }

    fn tier1_high_spend() -> NewRule {
        RuleBuilder::new("tier1 high spend")
            .city_tier(1)
            .min_total_spend(1000.0)
            .build()
    }

    #[test]
    fn test_subset_rule_intersects_existing_segment() {
        let engine = SegmentationEngine::default();
        let a = engine.create_rule(tier1()).unwrap();
        let b = engine.create_rule(tier1_high_spend()).unwrap();

        assert!(a.depends_on.is_empty());
        assert_eq!(b.depends_on, vec![a.id]);
        assert_eq!(b.operation, Some(SetOperation::Intersection));
        assert_eq!(b.extra_predicate.as_deref(), Some("total_spend > 1000"));

        let step = engine.plan_step(b.id).unwrap();
        match step.query {
            SegmentQuery::Compose { inputs, .. } => {
                assert_eq!(inputs[0].table, "segment_output_1")
            }
            other => panic!("expected composed query, got {other:?}"),
        }
    }

    #[test]
    fn test_union_of_category_rules() {
        let engine = SegmentationEngine::default();
        let c = engine
            .create_rule(RuleBuilder::new("travel").category("Travel").build())
            .unwrap();
        let d = engine
            .create_rule(RuleBuilder::new("groceries").category("Groceries").build())
            .unwrap();
        let e = engine
            .create_rule(
                RuleBuilder::new("travel or groceries")
                    .condition(any_of(vec![
                        cond("category", "=", json!("Travel")),
                        cond("category", "=", json!("Groceries")),
                    ]))
                    .build(),
            )
            .unwrap();
        assert_eq!(e.depends_on, vec![c.id, d.id]);
        assert_eq!(e.operation, Some(SetOperation::Union));
        assert_eq!(e.extra_predicate, None);
        assert_eq!(engine.dependency_edges().len(), 2);
    }

    #[test]
    fn test_membership_list_reuses_category_rules() {
        let engine = SegmentationEngine::default();
        let c = engine
            .create_rule(RuleBuilder::new("travel").category("Travel").build())
            .unwrap();
        let d = engine
            .create_rule(RuleBuilder::new("groceries").category("Groceries").build())
            .unwrap();
        let e = engine
            .create_rule(
                RuleBuilder::new("travel or groceries")
                    .condition(cond("category", "IN", json!(["Travel", "Groceries"])))
                    .build(),
            )
            .unwrap();
        assert_eq!(e.depends_on, vec![c.id, d.id]);
        assert_eq!(e.operation, Some(SetOperation::Union));
        assert_eq!(e.extra_predicate, None);
    }

    #[test]
    fn test_existing_rule_reuses_later_subset() {
        let engine = SegmentationEngine::default();
        let b = engine.create_rule(tier1_high_spend()).unwrap();
        assert!(b.depends_on.is_empty());
        let a = engine.create_rule(tier1()).unwrap();
        let b = engine.get_rule(b.id).unwrap();
        assert_eq!(b.depends_on, vec![a.id]);
        assert_eq!(engine.materialization_order().unwrap(), vec![a.id, b.id]);
    }

    #[test]
    fn test_invalid_condition_is_rejected() {
        let engine = SegmentationEngine::default();
        let err = engine
            .create_rule(RuleBuilder::new("bad").when("shoe_size", "=", json!(9)).build())
            .unwrap_err();
        assert!(matches!(err, AudienceError::Validation(_)));
        assert!(engine.list_rules().is_empty());
    }

    #[test]
    fn test_duplicate_name_and_bad_schedule() {
        let engine = SegmentationEngine::default();
        engine.create_rule(tier1()).unwrap();
        assert!(engine.create_rule(tier1()).is_err());
        let err = engine
            .create_rule(RuleBuilder::new("x").city_tier(2).schedule("fortnightly").build())
            .unwrap_err();
        assert!(matches!(err, AudienceError::Validation(_)));
        let err = engine
            .create_rule(RuleBuilder::new("y").city_tier(2).schedule("every 1000000000d").build())
            .unwrap_err();
        assert!(matches!(err, AudienceError::Validation(_)));
        assert_eq!(engine.list_rules().len(), 1);
    }

    #[test]
    fn test_override_cycle_is_rejected() {
        let engine = SegmentationEngine::default();
        let a = engine.create_rule(tier1()).unwrap();
        let b = engine.create_rule(tier1_high_spend()).unwrap();
        let err = engine
            .set_dependencies(a.id, vec![b.id], Some(SetOperation::Union))
            .unwrap_err();
        assert!(matches!(err, AudienceError::Cycle { .. }), "{err:?}");
        assert!(engine.get_rule(a.id).unwrap().depends_on.is_empty());
        assert!(engine.graph_is_acyclic());
    }

    #[test]
    fn test_unsound_override_is_rejected() {
        let engine = SegmentationEngine::default();
        let a = engine.create_rule(tier1()).unwrap();
        let c = engine
            .create_rule(RuleBuilder::new("travel").category("Travel").build())
            .unwrap();
        let err = engine
            .set_dependencies(c.id, vec![a.id], Some(SetOperation::Intersection))
            .unwrap_err();
        assert!(matches!(err, AudienceError::Validation(_)));
    }

    #[test]
    fn test_override_to_raw_scan_survives_updates() {
        let engine = SegmentationEngine::default();
        engine.create_rule(tier1()).unwrap();
        let b = engine.create_rule(tier1_high_spend()).unwrap();
        let b = engine.set_dependencies(b.id, vec![], None).unwrap();
        assert!(b.depends_on.is_empty());
        assert_eq!(b.dependency_source, DependencySource::Override);

        engine
            .create_rule(RuleBuilder::new("tier2").city_tier(2).build())
            .unwrap();
        assert!(engine.get_rule(b.id).unwrap().depends_on.is_empty());
    }

    #[test]
    fn test_update_re_resolves_dependents() {
        let engine = SegmentationEngine::default();
        let a = engine.create_rule(tier1()).unwrap();
        let b = engine.create_rule(tier1_high_spend()).unwrap();
        assert_eq!(b.depends_on, vec![a.id]);

        engine
            .update_rule(
                a.id,
                RuleUpdate {
                    condition: Some(cond("city_tier", "=", json!(2))),
                    ..RuleUpdate::default()
                },
            )
            .unwrap();
        let b = engine.get_rule(b.id).unwrap();
        assert!(b.depends_on.is_empty());
        assert_eq!(b.operation, None);
    }

    #[test]
    fn test_revision_tracks_condition_and_window() {
        let engine = SegmentationEngine::default();
        let a = engine.create_rule(tier1()).unwrap();
        assert_eq!(a.revision, 1);

        let renamed = engine
            .update_rule(
                a.id,
                RuleUpdate {
                    name: Some("tier one users".into()),
                    condition: Some(cond("city_tier", "=", json!(1))),
                    ..RuleUpdate::default()
                },
            )
            .unwrap();
        assert_eq!(renamed.revision, 1);

        let narrowed = engine
            .update_rule(
                a.id,
                RuleUpdate {
                    condition: Some(json!([
                        {"field": "city_tier", "operator": "=", "value": 1},
                        {"field": "category", "operator": "=", "value": "Groceries"}
                    ])),
                    ..RuleUpdate::default()
                },
            )
            .unwrap();
        assert_eq!(narrowed.revision, 2);

        let rewindowed = engine
            .update_rule(
                a.id,
                RuleUpdate {
                    window: Some(DateRange::new(NaiveDate::from_ymd_opt(2024, 1, 1), None)),
                    ..RuleUpdate::default()
                },
            )
            .unwrap();
        assert_eq!(rewindowed.revision, 3);
    }

    #[test]
    fn test_delete_is_blocked_by_dependents() {
        let engine = SegmentationEngine::default();
        let a = engine.create_rule(tier1()).unwrap();
        let b = engine.create_rule(tier1_high_spend()).unwrap();
        assert!(matches!(engine.delete_rule(a.id), Err(AudienceError::Validation(_))));
        engine.delete_rule(b.id).unwrap();
        engine.delete_rule(a.id).unwrap();
        assert!(matches!(engine.get_rule(a.id), Err(AudienceError::RuleNotFound(_))));
    }

    #[test]
    fn test_inactive_rules_are_not_reused() {
        let engine = SegmentationEngine::default();
        let a = engine.create_rule(RuleBuilder::new("tier1").city_tier(1).inactive().build()).unwrap();
        let b = engine.create_rule(tier1_high_spend()).unwrap();
        assert!(b.depends_on.is_empty());

        engine.set_status(a.id, RuleStatus::Active).unwrap();
        assert_eq!(engine.get_rule(b.id).unwrap().depends_on, vec![a.id]);

        engine.set_status(a.id, RuleStatus::Inactive).unwrap();
        assert_eq!(engine.get_rule(b.id).unwrap().depends_on, vec![a.id]);
    }

    #[test]
    fn test_disjoint_windows_prevent_reuse() {
        let engine = SegmentationEngine::default();
        let q1 = (NaiveDate::from_ymd_opt(2024, 1, 1), NaiveDate::from_ymd_opt(2024, 3, 31));
        let q2 = (NaiveDate::from_ymd_opt(2024, 4, 1), NaiveDate::from_ymd_opt(2024, 6, 30));
        engine
            .create_rule(RuleBuilder::new("q1 tier1").city_tier(1).window(q1.0, q1.1).build())
            .unwrap();
        let b = engine
            .create_rule(
                RuleBuilder::new("q2 tier1 spend")
                    .city_tier(1)
                    .min_total_spend(1000.0)
                    .window(q2.0, q2.1)
                    .build(),
            )
            .unwrap();
        assert!(b.depends_on.is_empty());
    }

    #[test]
    fn test_graph_stays_acyclic_over_many_insertions() {
        let engine = SegmentationEngine::default();
        let atoms = [
            cond("city_tier", "=", json!(1)),
            cond("category", "=", json!("Travel")),
            cond("total_spend", ">", json!(500)),
            cond("transaction_type", "=", json!("UPI")),
        ];
        // Every non-empty combination, in a scrambled order.
        let mut masks: Vec<u32> = (1..16).collect();
        masks.sort_by_key(|m| (m * 7) % 16);
        for mask in masks {
            let children: Vec<_> = atoms
                .iter()
                .enumerate()
                .filter(|(i, _)| mask & (1 << i) != 0)
                .map(|(_, a)| a.clone())
                .collect();
            engine
                .create_rule(RuleBuilder::new(format!("combo {mask}")).condition(json!(children)).build())
                .unwrap();
            assert!(engine.graph_is_acyclic());
        }
        let plan = engine.plan().unwrap();
        assert_eq!(plan.order.len(), 15);
        for (pos, id) in plan.order.iter().enumerate() {
            let rule = engine.get_rule(*id).unwrap();
            for dep in &rule.depends_on {
                assert!(plan.order[..pos].contains(dep));
            }
        }
        // Each multi-atom rule reuses something.
        for rule in engine.list_rules() {
            if rule.condition.atom_count() > 1 {
                assert!(!rule.depends_on.is_empty(), "{} recomputes from raw", rule.name);
            }
        }
    }

    #[test]
    fn test_normalize_preview() {
        let engine = SegmentationEngine::default();
        let preview = engine
            .normalize_preview(&json!([
                {"field": "total_spend", "operator": ">", "value": 1000},
                {"field": "city_tier", "value": 1}
            ]))
            .unwrap();
        assert_eq!(preview.display, "city_tier = 1 AND total_spend > 1000");
        assert_eq!(preview.dnf, vec![vec!["city_tier = 1".to_string(), "total_spend > 1000".to_string()]]);
        assert!(preview.predicate_sql.contains("SUM(amount) > 1000"));
    }
}
