//! Compiled constraints: the predicates alpha and beta nodes evaluate.
//!
//! Constraint compilation is outside the engine. Whatever produces them hands
//! over [`AlphaConstraint`] (one fact) and [`BetaConstraint`] (a partial match
//! plus one fact) objects. Both may fail; a failure is reported as an
//! evaluation error to the fire-loop caller and never silently skipped.
//! Constraints must not mutate working memory.

use crate::declaration::Match;
use crate::types::{Fact, FactValue, Operator};
use anyhow::Result;
use std::fmt;
use std::sync::Arc;

/// Single-fact predicate evaluated by alpha nodes
pub trait AlphaConstraint: Send + Sync {
    fn is_allowed(&self, fact: &Fact) -> Result<bool>;

    /// Structural identity. Two constraints with equal keys are
    /// interchangeable, which lets rules share the alpha node.
    fn share_key(&self) -> Option<String> {
        None
    }
}

/// Predicate over a partial match and a right-input fact
pub trait BetaConstraint: Send + Sync {
    fn is_allowed(&self, left: &Match, right: &Fact) -> Result<bool>;

    /// Equality index usable to narrow candidates before `is_allowed` runs
    fn index(&self) -> Option<JoinIndex> {
        None
    }

    /// Declarations this constraint reads from the left match
    fn required_declarations(&self) -> Vec<String> {
        Vec::new()
    }

    fn share_key(&self) -> Option<String> {
        None
    }
}

/// Whether two shared constraints may stand in for each other
pub(crate) fn same_alpha(a: &Arc<dyn AlphaConstraint>, b: &Arc<dyn AlphaConstraint>) -> bool {
    if std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ()) {
        return true;
    }
    matches!((a.share_key(), b.share_key()), (Some(x), Some(y)) if x == y)
}

pub(crate) fn same_beta(a: &Arc<dyn BetaConstraint>, b: &Arc<dyn BetaConstraint>) -> bool {
    if std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ()) {
        return true;
    }
    matches!((a.share_key(), b.share_key()), (Some(x), Some(y)) if x == y)
}

/// Equality join between a left declaration and a right field
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinIndex {
    pub left_declaration: String,
    pub right_field: String,
}

impl JoinIndex {
    pub fn left_key(&self, left: &Match) -> Option<FactValue> {
        left.value(&self.left_declaration).map(FactValue::index_key)
    }

    pub fn right_key(&self, right: &Fact) -> Option<FactValue> {
        right.get_field(&self.right_field).map(FactValue::index_key)
    }
}

/// `field <op> value` on a single fact
#[derive(Debug, Clone, PartialEq)]
pub struct FieldConstraint {
    pub field: String,
    pub operator: Operator,
    pub value: FactValue,
}

impl FieldConstraint {
    pub fn new(field: impl Into<String>, operator: Operator, value: impl Into<FactValue>) -> Self {
        Self { field: field.into(), operator, value: value.into() }
    }
}

impl AlphaConstraint for FieldConstraint {
    fn is_allowed(&self, fact: &Fact) -> Result<bool> {
        Ok(fact
            .get_field(&self.field)
            .is_some_and(|actual| test_condition(actual, self.operator, &self.value)))
    }

    fn share_key(&self) -> Option<String> {
        Some(format!("{} {} {:?}", self.field, self.operator, self.value))
    }
}

impl fmt::Display for FieldConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.field, self.operator, self.value)
    }
}

/// `right.field <op> left declaration`
///
/// The declaration must be a field declaration bound by an earlier pattern.
/// Equality conditions also act as the node's join index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinCondition {
    pub right_field: String,
    pub operator: Operator,
    pub left_declaration: String,
}

impl JoinCondition {
    pub fn new(
        right_field: impl Into<String>,
        operator: Operator,
        left_declaration: impl Into<String>,
    ) -> Self {
        Self {
            right_field: right_field.into(),
            operator,
            left_declaration: left_declaration.into(),
        }
    }
}

impl BetaConstraint for JoinCondition {
    fn is_allowed(&self, left: &Match, right: &Fact) -> Result<bool> {
        let (Some(right_value), Some(left_value)) =
            (right.get_field(&self.right_field), left.value(&self.left_declaration))
        else {
            return Ok(false);
        };
        Ok(test_condition(right_value, self.operator, left_value))
    }

    fn index(&self) -> Option<JoinIndex> {
        (self.operator == Operator::Equal).then(|| JoinIndex {
            left_declaration: self.left_declaration.clone(),
            right_field: self.right_field.clone(),
        })
    }

    fn required_declarations(&self) -> Vec<String> {
        vec![self.left_declaration.clone()]
    }

    fn share_key(&self) -> Option<String> {
        Some(format!("{} {} ${}", self.right_field, self.operator, self.left_declaration))
    }
}

/// Closure-backed alpha constraint
pub struct AlphaFn<F>(F);

impl<F> AlphaFn<F>
where
    F: Fn(&Fact) -> Result<bool> + Send + Sync,
{
    pub fn new(predicate: F) -> Self {
        Self(predicate)
    }
}

impl<F> AlphaConstraint for AlphaFn<F>
where
    F: Fn(&Fact) -> Result<bool> + Send + Sync,
{
    fn is_allowed(&self, fact: &Fact) -> Result<bool> {
        (self.0)(fact)
    }
}

/// Closure-backed beta constraint
pub struct BetaFn<F> {
    predicate: F,
    declarations: Vec<String>,
}

impl<F> BetaFn<F>
where
    F: Fn(&Match, &Fact) -> Result<bool> + Send + Sync,
{
    pub fn new(predicate: F) -> Self {
        Self { predicate, declarations: Vec::new() }
    }

    /// Declare which left declarations the closure reads, so rule attach can
    /// reject references to names that are never bound.
    #[must_use]
    pub fn reading(mut self, declarations: &[&str]) -> Self {
        self.declarations = declarations.iter().map(|d| (*d).to_string()).collect();
        self
    }
}

impl<F> BetaConstraint for BetaFn<F>
where
    F: Fn(&Match, &Fact) -> Result<bool> + Send + Sync,
{
    fn is_allowed(&self, left: &Match, right: &Fact) -> Result<bool> {
        (self.predicate)(left, right)
    }

    fn required_declarations(&self) -> Vec<String> {
        self.declarations.clone()
    }
}

/// Compare a fact value against an expected value.
///
/// Integers and floats compare numerically across types. Mismatched types
/// never satisfy a condition. `Contains` works on strings and lists.
pub fn test_condition(fact_value: &FactValue, operator: Operator, expected_value: &FactValue) -> bool {
    use {FactValue::*, Operator::*};

    match (fact_value, expected_value, operator) {
        (List(items), expected, Contains) => {
            items.iter().any(|item| test_condition(item, Equal, expected))
        }
        (List(_), _, _) | (_, List(_), _) => match operator {
            Equal => fact_value == expected_value,
            NotEqual => fact_value != expected_value,
            _ => false,
        },

        (Integer(a), Integer(b), op) => match op {
            Equal => a == b,
            NotEqual => a != b,
            GreaterThan => a > b,
            LessThan => a < b,
            GreaterThanOrEqual => a >= b,
            LessThanOrEqual => a <= b,
            Contains => false,
        },

        (Float(a), Float(b), op) => match op {
            Equal => a == b,
            NotEqual => a != b,
            GreaterThan => a > b,
            LessThan => a < b,
            GreaterThanOrEqual => a >= b,
            LessThanOrEqual => a <= b,
            Contains => false,
        },

        // Cross-numeric equality is exact, matching the join index key
        (Integer(a), Float(b), Equal) | (Float(b), Integer(a), Equal) => {
            FactValue::exact_integer(*b) == Some(*a)
        }
        (Integer(a), Float(b), NotEqual) | (Float(b), Integer(a), NotEqual) => {
            FactValue::exact_integer(*b) != Some(*a)
        }

        // Cross-numeric ordering (Integer vs Float)
        #[allow(clippy::cast_precision_loss)]
        (Integer(a), Float(_), _) => test_condition(&Float(*a as f64), operator, expected_value),
        #[allow(clippy::cast_precision_loss)]
        (Float(_), Integer(b), _) => test_condition(fact_value, operator, &Float(*b as f64)),

        (String(a), String(b), op) => match op {
            Equal => a == b,
            NotEqual => a != b,
            GreaterThan => a > b,
            LessThan => a < b,
            GreaterThanOrEqual => a >= b,
            LessThanOrEqual => a <= b,
            Contains => a.contains(b.as_str()),
        },

        (Boolean(a), Boolean(b), op) => match op {
            Equal => a == b,
            NotEqual => a != b,
            _ => false,
        },

        (Null, Null, Equal) => true,
        (Null, _, NotEqual) | (_, Null, NotEqual) => true,

        // Type mismatch
        _ => false,
    }
}
