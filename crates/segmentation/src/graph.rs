//! Rule dependency DAG. An edge `a -> b` means rule `a` is derived from
//! rule `b`'s published segment. Every edge is checked for reachability
//! before it is committed, so the graph never holds a cycle.

use std::collections::{BTreeSet, HashMap, VecDeque};

use audience_core::{AudienceError, AudienceResult, RuleId, SetOperation};
use petgraph::algo::{has_path_connecting, is_cyclic_directed};
use petgraph::graphmap::DiGraphMap;
use petgraph::Direction;

#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    graph: DiGraphMap<RuleId, SetOperation>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_rule(&mut self, rule_id: RuleId) {
        self.graph.add_node(rule_id);
    }

    pub fn remove_rule(&mut self, rule_id: RuleId) {
        self.graph.remove_node(rule_id);
    }

    pub fn contains(&self, rule_id: RuleId) -> bool {
        self.graph.contains_node(rule_id)
    }

    /// Direct dependencies, ascending.
    pub fn dependencies(&self, rule_id: RuleId) -> Vec<RuleId> {
        self.neighbors(rule_id, Direction::Outgoing)
    }

    /// Rules that directly depend on `rule_id`, ascending.
    pub fn dependents(&self, rule_id: RuleId) -> Vec<RuleId> {
        self.neighbors(rule_id, Direction::Incoming)
    }

    fn neighbors(&self, rule_id: RuleId, direction: Direction) -> Vec<RuleId> {
        if !self.graph.contains_node(rule_id) {
            return Vec::new();
        }
        let set: BTreeSet<RuleId> = self
            .graph
            .neighbors_directed(rule_id, direction)
            .collect();
        set.into_iter().collect()
    }

    /// True when `from` reaches `to` through one or more edges.
    pub fn depends_on_transitively(&self, from: RuleId, to: RuleId) -> bool {
        if from == to || !self.contains(from) || !self.contains(to) {
            return false;
        }
        has_path_connecting(&self.graph, from, to, None)
    }

    /// Every rule that reaches `rule_id`, ascending.
    pub fn transitive_dependents(&self, rule_id: RuleId) -> Vec<RuleId> {
        let mut seen = BTreeSet::new();
        let mut queue: VecDeque<RuleId> = self.dependents(rule_id).into();
        while let Some(next) = queue.pop_front() {
            if seen.insert(next) {
                queue.extend(self.dependents(next));
            }
        }
        seen.into_iter().collect()
    }

    /// Shortest dependency chain from `from` to `to`, both included.
    pub fn path(&self, from: RuleId, to: RuleId) -> Option<Vec<RuleId>> {
        if !self.contains(from) || !self.contains(to) {
            return None;
        }
        let mut parent: HashMap<RuleId, RuleId> = HashMap::new();
        let mut queue = VecDeque::from([from]);
        while let Some(node) = queue.pop_front() {
            if node == to {
                let mut path = vec![to];
                let mut cursor = to;
                while let Some(&p) = parent.get(&cursor) {
                    path.push(p);
                    cursor = p;
                }
                path.reverse();
                return Some(path);
            }
            for next in self.dependencies(node) {
                if next != from && !parent.contains_key(&next) {
                    parent.insert(next, node);
                    queue.push_back(next);
                }
            }
        }
        None
    }

    /// Fails with `Cycle` if making `rule_id` depend on any of `deps` would
    /// close a loop.
    pub fn check_acyclic(&self, rule_id: RuleId, deps: &[RuleId]) -> AudienceResult<()> {
        for &dep in deps {
            if dep == rule_id {
                return Err(AudienceError::Cycle {
                    rule_id,
                    path: vec![rule_id, rule_id],
                });
            }
            if let Some(back) = self.path(dep, rule_id) {
                let mut path = vec![rule_id];
                path.extend(back);
                return Err(AudienceError::Cycle { rule_id, path });
            }
        }
        Ok(())
    }

    /// Replace `rule_id`'s outgoing edges after a reachability check.
    pub fn set_dependencies(
        &mut self,
        rule_id: RuleId,
        deps: &[RuleId],
        operation: Option<SetOperation>,
    ) -> AudienceResult<()> {
        self.check_acyclic(rule_id, deps)?;
        self.add_rule(rule_id);
        for old in self.dependencies(rule_id) {
            self.graph.remove_edge(rule_id, old);
        }
        let operation = operation.unwrap_or(SetOperation::Intersection);
        for &dep in deps {
            self.graph.add_edge(rule_id, dep, operation);
        }
        Ok(())
    }

    pub fn is_acyclic(&self) -> bool {
        !is_cyclic_directed(&self.graph)
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph(edges: &[(RuleId, RuleId)]) -> DependencyGraph {
        let mut g = DependencyGraph::new();
        for &(a, b) in edges {
            g.add_rule(a);
            g.add_rule(b);
        }
        for &(a, b) in edges {
            let mut deps = g.dependencies(a);
            deps.push(b);
            g.set_dependencies(a, &deps, Some(SetOperation::Intersection)).unwrap();
        }
        g
    }

    #[test]
    fn test_reachability() {
        let g = graph(&[(3, 2), (2, 1)]);
        assert!(g.depends_on_transitively(3, 1));
        assert!(!g.depends_on_transitively(1, 3));
        assert_eq!(g.transitive_dependents(1), vec![2, 3]);
        assert_eq!(g.path(3, 1), Some(vec![3, 2, 1]));
    }

    #[test]
    fn test_rejects_cycle_with_path() {
        let mut g = graph(&[(3, 2), (2, 1)]);
        let err = g.set_dependencies(1, &[3], Some(SetOperation::Union)).unwrap_err();
        match err {
            AudienceError::Cycle { rule_id, path } => {
                assert_eq!(rule_id, 1);
                assert_eq!(path, vec![1, 3, 2, 1]);
            }
            other => panic!("expected cycle, got {other:?}"),
        }
        assert!(g.is_acyclic());
        assert!(g.dependencies(1).is_empty());
    }

    #[test]
    fn test_self_dependency_rejected() {
        let mut g = graph(&[]);
        g.add_rule(4);
        assert!(matches!(
            g.set_dependencies(4, &[4], None),
            Err(AudienceError::Cycle { .. })
        ));
    }

    #[test]
    fn test_set_dependencies_replaces_edges() {
        let mut g = graph(&[(3, 1), (3, 2)]);
        g.set_dependencies(3, &[2], None).unwrap();
        assert_eq!(g.dependencies(3), vec![2]);
        assert_eq!(g.dependents(1), Vec::<RuleId>::new());
        assert_eq!(g.edge_count(), 1);
    }
}
