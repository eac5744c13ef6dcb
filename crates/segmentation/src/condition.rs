//! Canonical representation of a rule's filter logic.
//!
//! A condition tree is a closed sum of [`Comparison`] leaves and AND/OR
//! [`ConditionNode::Group`]s. Trees produced by the parser are canonical:
//! same-logic groups are flattened, children are sorted and de-duplicated,
//! and single-child groups collapse into their child, so two semantically
//! identical trees compare equal with `==`.

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;
use std::hash::{Hash, Hasher};

use chrono::NaiveDate;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Known transaction/user attributes a comparison may reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    CityTier,
    Category,
    TransactionType,
    Amount,
    TransactionDate,
    TotalSpend,
    TransactionCount,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Integer,
    Number,
    Text,
    Date,
}

/// Whether a comparison is tested per transaction (holds if any in-window
/// transaction matches) or against a per-user aggregate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldScope {
    Transaction,
    Aggregate,
}

impl Field {
    pub const ALL: [Field; 7] = [
        Field::CityTier,
        Field::Category,
        Field::TransactionType,
        Field::Amount,
        Field::TransactionDate,
        Field::TotalSpend,
        Field::TransactionCount,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Field::CityTier => "city_tier",
            Field::Category => "category",
            Field::TransactionType => "transaction_type",
            Field::Amount => "amount",
            Field::TransactionDate => "transaction_date",
            Field::TotalSpend => "total_spend",
            Field::TransactionCount => "transaction_count",
        }
    }

    pub fn from_name(name: &str) -> Option<Field> {
        Field::ALL.into_iter().find(|f| f.name() == name)
    }

    pub fn kind(&self) -> ValueKind {
        match self {
            Field::CityTier | Field::TransactionCount => ValueKind::Integer,
            Field::Amount | Field::TotalSpend => ValueKind::Number,
            Field::Category | Field::TransactionType => ValueKind::Text,
            Field::TransactionDate => ValueKind::Date,
        }
    }

    pub fn scope(&self) -> FieldScope {
        match self {
            Field::TotalSpend | Field::TransactionCount => FieldScope::Aggregate,
            _ => FieldScope::Transaction,
        }
    }

    /// Text fields only support equality and membership.
    pub fn allows(&self, operator: Operator) -> bool {
        match self.kind() {
            ValueKind::Text => matches!(operator, Operator::Eq | Operator::Ne | Operator::In),
            _ => true,
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Operator {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
}

impl Operator {
    pub fn symbol(&self) -> &'static str {
        match self {
            Operator::Eq => "=",
            Operator::Ne => "!=",
            Operator::Lt => "<",
            Operator::Le => "<=",
            Operator::Gt => ">",
            Operator::Ge => ">=",
            Operator::In => "IN",
        }
    }

    pub fn from_symbol(symbol: &str) -> Option<Operator> {
        match symbol.trim() {
            "=" | "==" => Some(Operator::Eq),
            "!=" | "<>" => Some(Operator::Ne),
            "<" => Some(Operator::Lt),
            "<=" => Some(Operator::Le),
            ">" => Some(Operator::Gt),
            ">=" => Some(Operator::Ge),
            s if s.eq_ignore_ascii_case("in") => Some(Operator::In),
            _ => None,
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

/// A single typed comparison value.
#[derive(Debug, Clone)]
pub enum Scalar {
    Integer(i64),
    Number(f64),
    Text(String),
    Date(NaiveDate),
}

impl Scalar {
    /// Numbers are stored with `-0.0` folded into `0.0` so equality and
    /// hashing agree.
    pub fn number(value: f64) -> Scalar {
        Scalar::Number(if value == 0.0 { 0.0 } else { value })
    }

    fn rank(&self) -> u8 {
        match self {
            Scalar::Integer(_) => 0,
            Scalar::Number(_) => 1,
            Scalar::Text(_) => 2,
            Scalar::Date(_) => 3,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Scalar::Integer(i) => Some(*i as f64),
            Scalar::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Scalar::Integer(i) => serde_json::Value::from(*i),
            Scalar::Number(n) => serde_json::Value::from(*n),
            Scalar::Text(s) => serde_json::Value::from(s.as_str()),
            Scalar::Date(d) => serde_json::Value::from(d.format("%Y-%m-%d").to_string()),
        }
    }

    /// SQL literal.
    pub fn to_sql(&self) -> String {
        match self {
            Scalar::Integer(i) => i.to_string(),
            Scalar::Number(n) => n.to_string(),
            Scalar::Text(s) => format!("'{}'", s.replace('\'', "''")),
            Scalar::Date(d) => format!("'{}'", d.format("%Y-%m-%d")),
        }
    }
}

impl PartialEq for Scalar {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Scalar {}

impl PartialOrd for Scalar {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scalar {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Scalar::Integer(a), Scalar::Integer(b)) => a.cmp(b),
            (Scalar::Number(a), Scalar::Number(b)) => a.total_cmp(b),
            (Scalar::Text(a), Scalar::Text(b)) => a.cmp(b),
            (Scalar::Date(a), Scalar::Date(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl Hash for Scalar {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.rank().hash(state);
        match self {
            Scalar::Integer(i) => i.hash(state),
            Scalar::Number(n) => n.to_bits().hash(state),
            Scalar::Text(s) => s.hash(state),
            Scalar::Date(d) => d.hash(state),
        }
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Integer(i) => write!(f, "{i}"),
            Scalar::Number(n) => write!(f, "{n}"),
            Scalar::Text(s) => write!(f, "\"{s}\""),
            Scalar::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ConditionValue {
    Single(Scalar),
    /// Sorted, de-duplicated, non-empty list for `IN`.
    List(Vec<Scalar>),
}

impl ConditionValue {
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            ConditionValue::Single(s) => s.to_json(),
            ConditionValue::List(items) => {
                serde_json::Value::Array(items.iter().map(Scalar::to_json).collect())
            }
        }
    }

    pub fn to_sql(&self) -> String {
        match self {
            ConditionValue::Single(s) => s.to_sql(),
            ConditionValue::List(items) => format!(
                "({})",
                items.iter().map(Scalar::to_sql).collect::<Vec<_>>().join(", ")
            ),
        }
    }
}

impl fmt::Display for ConditionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConditionValue::Single(s) => write!(f, "{s}"),
            ConditionValue::List(items) => {
                let parts: Vec<String> = items.iter().map(|s| s.to_string()).collect();
                write!(f, "[{}]", parts.join(", "))
            }
        }
    }
}

/// Atomic predicate. Field order, then operator, then value is the
/// canonical sort key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Comparison {
    pub field: Field,
    pub operator: Operator,
    pub value: ConditionValue,
}

impl Comparison {
    pub fn new(field: Field, operator: Operator, value: ConditionValue) -> Self {
        Self {
            field,
            operator,
            value,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "field": self.field.name(),
            "operator": self.operator.symbol(),
            "value": self.value.to_json(),
        })
    }
}

impl fmt::Display for Comparison {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.field, self.operator, self.value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Logic {
    And,
    Or,
}

impl Logic {
    pub fn keyword(&self) -> &'static str {
        match self {
            Logic::And => "AND",
            Logic::Or => "OR",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ConditionNode {
    Comparison(Comparison),
    Group {
        logic: Logic,
        children: Vec<ConditionNode>,
    },
}

impl ConditionNode {
    pub fn comparison(field: Field, operator: Operator, value: Scalar) -> Self {
        ConditionNode::Comparison(Comparison::new(field, operator, ConditionValue::Single(value)))
    }

    pub fn and(children: Vec<ConditionNode>) -> Self {
        ConditionNode::Group {
            logic: Logic::And,
            children,
        }
    }

    pub fn or(children: Vec<ConditionNode>) -> Self {
        ConditionNode::Group {
            logic: Logic::Or,
            children,
        }
    }

    /// Number of comparison leaves.
    pub fn atom_count(&self) -> usize {
        match self {
            ConditionNode::Comparison(_) => 1,
            ConditionNode::Group { children, .. } => children.iter().map(|c| c.atom_count()).sum(),
        }
    }

    /// Persisted JSON form, round-trippable through the parser.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            ConditionNode::Comparison(c) => c.to_json(),
            ConditionNode::Group { logic, children } => serde_json::json!({
                "logic": logic.keyword(),
                "children": children.iter().map(|c| c.to_json()).collect::<Vec<_>>(),
            }),
        }
    }
}

impl fmt::Display for ConditionNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConditionNode::Comparison(c) => write!(f, "{c}"),
            ConditionNode::Group { logic, children } => {
                let separator = format!(" {} ", logic.keyword());
                let parts: Vec<String> = children
                    .iter()
                    .map(|c| match c {
                        ConditionNode::Group { .. } => format!("({c})"),
                        ConditionNode::Comparison(_) => c.to_string(),
                    })
                    .collect();
                f.write_str(&parts.join(&separator))
            }
        }
    }
}

impl Serialize for ConditionNode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ConditionNode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = serde_json::Value::deserialize(deserializer)?;
        crate::parser::parse_tree(&raw).map_err(serde::de::Error::custom)
    }
}

/// A conjunction of atomic comparisons.
pub type Clause = BTreeSet<Comparison>;

/// Disjunctive normal form: an OR of AND-clauses. Clauses are kept sorted,
/// de-duplicated and absorbed (no clause is a superset of another).
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Dnf {
    clauses: Vec<Clause>,
}

impl Dnf {
    /// Builds a DNF from arbitrary clauses, applying absorption and
    /// canonical ordering.
    pub fn from_clauses(clauses: Vec<Clause>) -> Dnf {
        let mut clauses = clauses;
        clauses.sort_by(|a, b| a.len().cmp(&b.len()).then_with(|| a.cmp(b)));
        clauses.dedup();

        let mut kept: Vec<Clause> = Vec::with_capacity(clauses.len());
        for clause in clauses {
            if !kept.iter().any(|k| k.is_subset(&clause)) {
                kept.push(clause);
            }
        }
        kept.sort();
        Dnf { clauses: kept }
    }

    pub fn clauses(&self) -> &[Clause] {
        &self.clauses
    }

    pub fn len(&self) -> usize {
        self.clauses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    /// The single clause when the DNF is a pure conjunction.
    pub fn single_clause(&self) -> Option<&Clause> {
        match self.clauses.as_slice() {
            [only] => Some(only),
            _ => None,
        }
    }

    pub fn atom_count(&self) -> usize {
        self.clauses.iter().map(|c| c.len()).sum()
    }

    pub fn contains_clause(&self, clause: &Clause) -> bool {
        self.clauses.binary_search(clause).is_ok()
    }

    /// Rebuilds a canonical condition tree from the clauses.
    pub fn to_node(&self) -> Option<ConditionNode> {
        let mut disjuncts: Vec<ConditionNode> = self
            .clauses
            .iter()
            .filter(|c| !c.is_empty())
            .map(|clause| {
                let mut atoms: Vec<ConditionNode> =
                    clause.iter().cloned().map(ConditionNode::Comparison).collect();
                if atoms.len() == 1 {
                    atoms.remove(0)
                } else {
                    ConditionNode::and(atoms)
                }
            })
            .collect();
        match disjuncts.len() {
            0 => None,
            1 => disjuncts.pop(),
            _ => {
                disjuncts.sort();
                Some(ConditionNode::or(disjuncts))
            }
        }
    }
}

/// A validated, normalized condition tree together with its DNF.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConditionModel {
    pub root: ConditionNode,
    pub dnf: Dnf,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn atom(field: Field, op: Operator, value: Scalar) -> Comparison {
        Comparison::new(field, op, ConditionValue::Single(value))
    }

    #[test]
    fn test_field_names_round_trip() {
        for field in Field::ALL {
            assert_eq!(Field::from_name(field.name()), Some(field));
        }
        assert_eq!(Field::from_name("favourite_colour"), None);
    }

    #[test]
    fn test_text_fields_reject_ordering_operators() {
        assert!(Field::Category.allows(Operator::In));
        assert!(!Field::Category.allows(Operator::Gt));
        assert!(Field::Amount.allows(Operator::Ge));
    }

    #[test]
    fn test_scalar_ordering_is_total() {
        assert_eq!(Scalar::number(-0.0), Scalar::number(0.0));
        assert!(Scalar::Integer(5) < Scalar::Number(1.0));
        assert!(Scalar::Text("a".into()) < Scalar::Text("b".into()));
    }

    #[test]
    fn test_dnf_absorption() {
        let a = atom(Field::CityTier, Operator::Eq, Scalar::Integer(1));
        let b = atom(Field::TotalSpend, Operator::Gt, Scalar::number(1000.0));
        let dnf = Dnf::from_clauses(vec![
            Clause::from([a.clone(), b.clone()]),
            Clause::from([a.clone()]),
            Clause::from([a.clone()]),
        ]);
        assert_eq!(dnf.len(), 1);
        assert_eq!(dnf.single_clause(), Some(&Clause::from([a])));
    }

    #[test]
    fn test_display_nests_groups() {
        let node = ConditionNode::and(vec![
            ConditionNode::comparison(Field::CityTier, Operator::Eq, Scalar::Integer(1)),
            ConditionNode::or(vec![
                ConditionNode::comparison(
                    Field::Category,
                    Operator::Eq,
                    Scalar::Text("Travel".into()),
                ),
                ConditionNode::comparison(
                    Field::Category,
                    Operator::Eq,
                    Scalar::Text("Groceries".into()),
                ),
            ]),
        ]);
        assert_eq!(
            node.to_string(),
            "city_tier = 1 AND (category = \"Travel\" OR category = \"Groceries\")"
        );
        assert_eq!(node.atom_count(), 3);
    }
}
