//! Broadcast filter predicates.
//!
//! A filter is a conjunction of clauses evaluated against a candidate
//! connection's attributes. Every clause that cannot be decided (missing
//! field, type-incompatible comparison, unrecognized operator) evaluates to
//! no-match rather than match-all, so a malformed filter can only narrow a
//! broadcast, never widen it.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Comparison operators for filter clauses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOp {
    Equals,
    NotEquals,
    In,
    NotIn,
    Contains,
    GreaterThan,
    LessThan,
    /// Any operator name this build does not recognize. Never matches.
    #[serde(other)]
    Unknown,
}

/// A single filter clause.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterExpr {
    /// Attribute name looked up on the candidate.
    pub field: String,
    /// Comparison operator.
    pub op: FilterOp,
    /// Operand. `In`/`NotIn` expect an array here.
    pub value: Value,
}

impl FilterExpr {
    #[must_use]
    pub fn new(field: impl Into<String>, op: FilterOp, value: Value) -> Self {
        Self {
            field: field.into(),
            op,
            value,
        }
    }

    /// Evaluate this clause against a candidate's attributes.
    ///
    /// `attrs` must be a JSON object; anything else fails the clause, as
    /// does a field the candidate doesn't carry.
    #[must_use]
    pub fn matches(&self, attrs: &Value) -> bool {
        let Some(actual) = attrs.get(&self.field) else {
            return false;
        };

        match self.op {
            FilterOp::Equals => actual == &self.value,
            FilterOp::NotEquals => actual != &self.value,
            FilterOp::In => match self.value.as_array() {
                Some(candidates) => candidates.contains(actual),
                None => false,
            },
            FilterOp::NotIn => match self.value.as_array() {
                Some(candidates) => !candidates.contains(actual),
                None => false,
            },
            FilterOp::Contains => match (actual, &self.value) {
                (Value::String(haystack), Value::String(needle)) => haystack.contains(needle),
                (Value::Array(items), needle) => items.contains(needle),
                _ => false,
            },
            FilterOp::GreaterThan => match (actual.as_f64(), self.value.as_f64()) {
                (Some(a), Some(b)) => a > b,
                _ => false,
            },
            FilterOp::LessThan => match (actual.as_f64(), self.value.as_f64()) {
                (Some(a), Some(b)) => a < b,
                _ => false,
            },
            FilterOp::Unknown => false,
        }
    }
}

/// Evaluate a conjunction of clauses. An empty slice matches everything.
#[must_use]
pub fn matches_all(filters: &[FilterExpr], attrs: &Value) -> bool {
    filters.iter().all(|f| f.matches(attrs))
}
