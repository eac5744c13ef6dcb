//! Rule-to-segment resolution: condition normalization, segment reuse
//! detection, dependency DAG and materialization planning.

pub mod builder;
pub mod condition;
pub mod engine;
pub mod graph;
pub mod parser;
pub mod planner;
pub mod predicates;
pub mod resolver;
pub mod rule;
pub mod sql;

pub use builder::RuleBuilder;
pub use condition::{ConditionModel, ConditionNode, Dnf};
pub use engine::{NormalizedCondition, SegmentationEngine};
pub use graph::DependencyGraph;
pub use parser::ConditionParser;
pub use planner::{DependencyInput, ExecutionPlanner, MaterializationPlan, PlanStep, SegmentQuery};
pub use resolver::{DependencyEdge, DependencyResolver, Resolution};
pub use rule::{DependencySource, NewRule, RuleDefinition, RuleStatus, RuleUpdate};
pub use sql::SqlRenderer;
