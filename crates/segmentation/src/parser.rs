//! Validates raw condition trees, normalizes them into [`ConditionModel`]s,
//! and renders them as executable predicates.

use std::collections::BTreeSet;

use audience_core::config::ResolverConfig;
use audience_core::{AudienceError, AudienceResult};
use chrono::NaiveDate;
use serde_json::Value;
use tracing::debug;

use crate::condition::{
    Clause, Comparison, ConditionModel, ConditionNode, ConditionValue, Dnf, Field, FieldScope,
    Logic, Operator, Scalar, ValueKind,
};

/// Accepted transaction types, upper-cased.
const TRANSACTION_TYPES: [&str; 2] = ["UPI", "CREDIT_CARD"];

#[derive(Debug, Clone)]
pub struct ConditionParser {
    max_dnf_clauses: usize,
}

impl ConditionParser {
    pub fn new(max_dnf_clauses: usize) -> Self {
        Self {
            max_dnf_clauses: max_dnf_clauses.max(1),
        }
    }

    pub fn from_config(config: &ResolverConfig) -> Self {
        Self::new(config.max_dnf_clauses)
    }

    /// Parse, validate and normalize a raw JSON condition tree.
    pub fn normalize(&self, raw: &Value) -> AudienceResult<ConditionModel> {
        let tree = parse_tree(raw)?;
        self.normalize_tree(tree)
    }

    /// Normalize an already-typed tree (e.g. one built programmatically).
    pub fn normalize_tree(&self, tree: ConditionNode) -> AudienceResult<ConditionModel> {
        validate(&tree)?;
        let root = canonicalize(tree);
        let dnf = to_dnf(&root, self.max_dnf_clauses)?;
        debug!(clauses = dnf.len(), atoms = dnf.atom_count(), condition = %root, "Condition normalized");
        Ok(ConditionModel { root, dnf })
    }
}

impl Default for ConditionParser {
    fn default() -> Self {
        Self::from_config(&ResolverConfig::default())
    }
}

// ─── Parsing ────────────────────────────────────────────────────────────

/// Parse a raw JSON tree into a typed (not yet canonical) condition tree.
///
/// Accepts `{"field", "operator", "value"}` leaves, `{"logic", "children"}`
/// groups, and a bare array as an implicit AND group.
pub fn parse_tree(raw: &Value) -> AudienceResult<ConditionNode> {
    match raw {
        Value::Array(items) => parse_group(Logic::And, items),
        Value::Object(map) if map.contains_key("field") => parse_comparison(raw),
        Value::Object(map) if map.contains_key("logic") || map.contains_key("children") => {
            let logic = match map.get("logic").and_then(Value::as_str) {
                Some(l) if l.eq_ignore_ascii_case("and") => Logic::And,
                Some(l) if l.eq_ignore_ascii_case("or") => Logic::Or,
                Some(other) => {
                    return Err(AudienceError::validation(format!(
                        "unknown group logic '{other}'"
                    )))
                }
                None => return Err(AudienceError::validation("group is missing 'logic'")),
            };
            let children = map
                .get("children")
                .and_then(Value::as_array)
                .ok_or_else(|| AudienceError::validation("group 'children' must be an array"))?;
            parse_group(logic, children)
        }
        other => Err(AudienceError::validation(format!(
            "expected a condition or group, got {other}"
        ))),
    }
}

fn parse_group(logic: Logic, items: &[Value]) -> AudienceResult<ConditionNode> {
    if items.is_empty() {
        return Err(AudienceError::validation(format!(
            "{} group must have at least one child",
            logic.keyword()
        )));
    }
    let children = items.iter().map(parse_tree).collect::<AudienceResult<Vec<_>>>()?;
    Ok(ConditionNode::Group { logic, children })
}

fn parse_comparison(raw: &Value) -> AudienceResult<ConditionNode> {
    let name = raw
        .get("field")
        .and_then(Value::as_str)
        .ok_or_else(|| AudienceError::validation("condition 'field' must be a string"))?;
    let value = raw
        .get("value")
        .filter(|v| !v.is_null())
        .ok_or_else(|| AudienceError::validation(format!("condition on '{name}' has no value")))?;
    let operator = match raw.get("operator") {
        None | Some(Value::Null) => Operator::Eq,
        Some(Value::String(s)) => Operator::from_symbol(s)
            .ok_or_else(|| AudienceError::validation(format!("unknown operator '{s}'")))?,
        Some(other) => {
            return Err(AudienceError::validation(format!(
                "operator must be a string, got {other}"
            )))
        }
    };

    // Legacy flat-list pseudo-fields.
    let (field, operator) = match name {
        "start_date" => (Field::TransactionDate, Operator::Ge),
        "end_date" => (Field::TransactionDate, Operator::Le),
        "min_transactions" => (Field::TransactionCount, Operator::Ge),
        _ => {
            let field = Field::from_name(name)
                .ok_or_else(|| AudienceError::validation(format!("unknown field '{name}'")))?;
            (field, operator)
        }
    };

    if !field.allows(operator) {
        return Err(AudienceError::validation(format!(
            "operator '{operator}' is not supported on text field '{field}'"
        )));
    }

    let value = if operator == Operator::In {
        let items = value.as_array().ok_or_else(|| {
            AudienceError::validation(format!("IN on '{field}' requires an array value"))
        })?;
        if items.is_empty() {
            return Err(AudienceError::validation(format!(
                "IN on '{field}' requires at least one value"
            )));
        }
        ConditionValue::List(
            items
                .iter()
                .map(|v| parse_scalar(field, v))
                .collect::<AudienceResult<Vec<_>>>()?,
        )
    } else {
        ConditionValue::Single(parse_scalar(field, value)?)
    };

    Ok(ConditionNode::Comparison(Comparison::new(field, operator, value)))
}

fn parse_scalar(field: Field, raw: &Value) -> AudienceResult<Scalar> {
    let mismatch = || {
        AudienceError::validation(format!(
            "value {raw} does not match the type of field '{field}'"
        ))
    };
    let scalar = match field.kind() {
        ValueKind::Integer => Scalar::Integer(raw.as_i64().ok_or_else(mismatch)?),
        ValueKind::Number => {
            let n = raw.as_f64().filter(|n| n.is_finite()).ok_or_else(mismatch)?;
            Scalar::number(n)
        }
        ValueKind::Text => {
            let s = raw.as_str().map(str::trim).filter(|s| !s.is_empty()).ok_or_else(mismatch)?;
            if field == Field::TransactionType {
                Scalar::Text(s.to_ascii_uppercase())
            } else {
                Scalar::Text(s.to_string())
            }
        }
        ValueKind::Date => {
            let s = raw.as_str().ok_or_else(mismatch)?;
            let date = NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").map_err(|_| mismatch())?;
            Scalar::Date(date)
        }
    };
    check_domain(field, &scalar)?;
    Ok(scalar)
}

fn check_domain(field: Field, value: &Scalar) -> AudienceResult<()> {
    match (field, value) {
        (Field::CityTier, Scalar::Integer(tier)) if *tier < 1 => Err(AudienceError::validation(
            format!("city_tier must be >= 1, got {tier}"),
        )),
        (Field::TransactionCount, Scalar::Integer(n)) if *n < 0 => Err(
            AudienceError::validation(format!("transaction_count must be >= 0, got {n}")),
        ),
        (Field::TransactionType, Scalar::Text(t)) if !TRANSACTION_TYPES.contains(&t.as_str()) => {
            Err(AudienceError::validation(format!(
                "transaction_type must be one of {TRANSACTION_TYPES:?}, got '{t}'"
            )))
        }
        _ => Ok(()),
    }
}

/// Structural validation for typed trees that did not come through
/// [`parse_tree`].
pub fn validate(node: &ConditionNode) -> AudienceResult<()> {
    match node {
        ConditionNode::Group { logic, children } => {
            if children.is_empty() {
                return Err(AudienceError::validation(format!(
                    "{} group must have at least one child",
                    logic.keyword()
                )));
            }
            children.iter().try_for_each(validate)
        }
        ConditionNode::Comparison(c) => {
            if !c.field.allows(c.operator) {
                return Err(AudienceError::validation(format!(
                    "operator '{}' is not supported on text field '{}'",
                    c.operator, c.field
                )));
            }
            let values: Vec<&Scalar> = match (&c.value, c.operator) {
                (ConditionValue::List(items), Operator::In) if !items.is_empty() => {
                    items.iter().collect()
                }
                (ConditionValue::Single(s), op) if op != Operator::In => vec![s],
                _ => {
                    return Err(AudienceError::validation(format!(
                        "value shape does not match operator '{}' on '{}'",
                        c.operator, c.field
                    )))
                }
            };
            for value in values {
                let ok = matches!(
                    (c.field.kind(), value),
                    (ValueKind::Integer, Scalar::Integer(_))
                        | (ValueKind::Number, Scalar::Number(_))
                        | (ValueKind::Text, Scalar::Text(_))
                        | (ValueKind::Date, Scalar::Date(_))
                );
                if !ok {
                    return Err(AudienceError::validation(format!(
                        "value {value} does not match the type of field '{}'",
                        c.field
                    )));
                }
                check_domain(c.field, value)?;
            }
            Ok(())
        }
    }
}

// ─── Canonicalization ───────────────────────────────────────────────────

/// Flatten same-logic groups, sort and de-duplicate siblings, and collapse
/// single-child groups. Idempotent.
pub fn canonicalize(node: ConditionNode) -> ConditionNode {
    match node {
        ConditionNode::Comparison(c) => ConditionNode::Comparison(canonical_comparison(c)),
        ConditionNode::Group { logic, children } => {
            let mut flat = Vec::with_capacity(children.len());
            for child in children {
                match canonicalize(child) {
                    ConditionNode::Group {
                        logic: inner,
                        children: grandchildren,
                    } if inner == logic => flat.extend(grandchildren),
                    other => flat.push(other),
                }
            }
            flat.sort();
            flat.dedup();
            if flat.len() == 1 {
                flat.remove(0)
            } else {
                ConditionNode::Group {
                    logic,
                    children: flat,
                }
            }
        }
    }
}

fn canonical_comparison(mut c: Comparison) -> Comparison {
    if let ConditionValue::List(items) = &mut c.value {
        items.sort();
        items.dedup();
        if items.len() == 1 {
            let only = items.remove(0);
            c.operator = Operator::Eq;
            c.value = ConditionValue::Single(only);
        }
    }
    c
}

// ─── DNF ────────────────────────────────────────────────────────────────

/// Convert a tree to disjunctive normal form, failing when the expansion
/// exceeds `max_clauses`.
///
/// Membership lists are split into one equality clause per value, so
/// `category IN (a, b)` and `category = a OR category = b` reduce to the same
/// clauses. When splitting would exceed the limit, lists stay single atoms
/// and only that expansion is held to the limit.
pub fn to_dnf(node: &ConditionNode, max_clauses: usize) -> AudienceResult<Dnf> {
    let clauses = match expand(node, max_clauses, true) {
        Ok(clauses) => clauses,
        Err(_) => expand(node, max_clauses, false)?,
    };
    Ok(Dnf::from_clauses(clauses))
}

fn expand(
    node: &ConditionNode,
    max_clauses: usize,
    split_lists: bool,
) -> AudienceResult<Vec<Clause>> {
    let too_large = || {
        AudienceError::validation(format!(
            "condition expands to more than {max_clauses} DNF clauses"
        ))
    };
    match node {
        ConditionNode::Comparison(Comparison {
            field,
            operator: Operator::In,
            value: ConditionValue::List(items),
        }) if split_lists => {
            if items.len() > max_clauses {
                return Err(too_large());
            }
            Ok(items
                .iter()
                .map(|item| {
                    let value = ConditionValue::Single(item.clone());
                    BTreeSet::from([Comparison::new(*field, Operator::Eq, value)])
                })
                .collect())
        }
        ConditionNode::Comparison(c) => Ok(vec![BTreeSet::from([c.clone()])]),
        ConditionNode::Group {
            logic: Logic::Or,
            children,
        } => {
            let mut clauses = Vec::new();
            for child in children {
                clauses.extend(expand(child, max_clauses, split_lists)?);
                if clauses.len() > max_clauses {
                    return Err(too_large());
                }
            }
            Ok(Dnf::from_clauses(clauses).clauses().to_vec())
        }
        ConditionNode::Group {
            logic: Logic::And,
            children,
        } => {
            let mut acc: Vec<Clause> = vec![Clause::new()];
            for child in children {
                let child_clauses = expand(child, max_clauses, split_lists)?;
                if acc.len().saturating_mul(child_clauses.len()) > max_clauses {
                    return Err(too_large());
                }
                let mut product = Vec::with_capacity(acc.len() * child_clauses.len());
                for left in &acc {
                    for right in &child_clauses {
                        product.push(left.union(right).cloned().collect::<Clause>());
                    }
                }
                acc = Dnf::from_clauses(product).clauses().to_vec();
            }
            Ok(acc)
        }
    }
}

// ─── Rendering ──────────────────────────────────────────────────────────

/// Render a tree as a predicate over per-user aggregates, suitable for a
/// `HAVING` clause of a query grouped by `user_id`.
///
/// Transaction-scope comparisons hold when any of the user's rows match;
/// aggregate comparisons test `SUM(amount)` / `COUNT(*)`.
pub fn render_predicate(node: &ConditionNode) -> String {
    match node {
        ConditionNode::Comparison(c) => render_atom(c),
        ConditionNode::Group { logic, children } => {
            let separator = format!(" {} ", logic.keyword());
            children
                .iter()
                .map(|child| match child {
                    ConditionNode::Group { .. } => format!("({})", render_predicate(child)),
                    ConditionNode::Comparison(c) => render_atom(c),
                })
                .collect::<Vec<_>>()
                .join(&separator)
        }
    }
}

fn render_atom(c: &Comparison) -> String {
    match c.field.scope() {
        FieldScope::Transaction => format!(
            "MAX(CASE WHEN {} {} {} THEN 1 ELSE 0 END) = 1",
            c.field.name(),
            c.operator.symbol(),
            c.value.to_sql()
        ),
        FieldScope::Aggregate => {
            let expr = match c.field {
                Field::TransactionCount => "COUNT(*)",
                _ => "SUM(amount)",
            };
            format!("{expr} {} {}", c.operator.symbol(), c.value.to_sql())
        }
    }
}
