//! Rule definitions handed to the network builder.
//!
//! A rule is an ordered list of condition elements plus a consequence, either
//! an action or an async send. This is the interface a rule-language front end
//! targets; the builder turns it into shared network nodes.
//!
//! ```ignore
//! let rule = RuleDefinition::new("bigger")
//!     .pattern(Pattern::new("A").bind_field("v", "value"))
//!     .pattern(Pattern::new("B").bind_field("w", "value").join_on("value", Operator::GreaterThan, "v"))
//!     .then(|m, ctx| {
//!         ctx.globals().append("log", format!("{},{}", m.value("v").unwrap(), m.value("w").unwrap()));
//!         Ok(())
//!     });
//! ```

use crate::accumulate::Accumulator;
use crate::action::{Action, ActionContext, ActionFn};
use crate::constraint::{AlphaConstraint, AlphaFn, BetaConstraint, BetaFn, FieldConstraint, JoinCondition};
use crate::declaration::Match;
use crate::exchange::{AsyncComputation, ComputeFn, SendFilter};
use crate::types::{Fact, FactValue, Operator};
use std::sync::Arc;

/// Field holding the value of an accumulate result fact
pub const RESULT_FIELD: &str = "result";
/// Object type of accumulate result facts
pub const RESULT_KIND: &str = "AccumulateResult";
/// Field holding the payload of an async message fact
pub const MESSAGE_VALUE_FIELD: &str = "value";

/// One object pattern: a fact kind, single-fact filters, join constraints
/// against earlier patterns, and the declarations it binds
#[derive(Clone)]
pub struct Pattern {
    pub(crate) kind: String,
    pub(crate) bindings: Vec<(String, Option<String>)>,
    pub(crate) alpha: Vec<Arc<dyn AlphaConstraint>>,
    pub(crate) beta: Vec<Arc<dyn BetaConstraint>>,
}

impl Pattern {
    pub fn new(kind: impl Into<String>) -> Self {
        Self { kind: kind.into(), bindings: Vec::new(), alpha: Vec::new(), beta: Vec::new() }
    }

    /// Bind the whole fact
    #[must_use]
    pub fn bind(mut self, name: impl Into<String>) -> Self {
        self.bindings.push((name.into(), None));
        self
    }

    /// Bind one field of the fact
    #[must_use]
    pub fn bind_field(mut self, name: impl Into<String>, field: impl Into<String>) -> Self {
        self.bindings.push((name.into(), Some(field.into())));
        self
    }

    #[must_use]
    pub fn filter(self, constraint: impl AlphaConstraint + 'static) -> Self {
        self.filter_shared(Arc::new(constraint))
    }

    /// Reusing the same `Arc` across rules lets them share the alpha node
    #[must_use]
    pub fn filter_shared(mut self, constraint: Arc<dyn AlphaConstraint>) -> Self {
        self.alpha.push(constraint);
        self
    }

    #[must_use]
    pub fn filter_fn<F>(self, predicate: F) -> Self
    where
        F: Fn(&Fact) -> anyhow::Result<bool> + Send + Sync + 'static,
    {
        self.filter(AlphaFn::new(predicate))
    }

    /// `field <op> value`
    #[must_use]
    pub fn field(self, field: &str, operator: Operator, value: impl Into<FactValue>) -> Self {
        self.filter(FieldConstraint::new(field, operator, value))
    }

    #[must_use]
    pub fn join(self, constraint: impl BetaConstraint + 'static) -> Self {
        self.join_shared(Arc::new(constraint))
    }

    #[must_use]
    pub fn join_shared(mut self, constraint: Arc<dyn BetaConstraint>) -> Self {
        self.beta.push(constraint);
        self
    }

    /// Closure join reading the listed declarations
    #[must_use]
    pub fn join_fn<F>(self, reads: &[&str], predicate: F) -> Self
    where
        F: Fn(&Match, &Fact) -> anyhow::Result<bool> + Send + Sync + 'static,
    {
        self.join(BetaFn::new(predicate).reading(reads))
    }

    /// `field <op> $declaration`
    #[must_use]
    pub fn join_on(self, field: &str, operator: Operator, declaration: &str) -> Self {
        self.join(JoinCondition::new(field, operator, declaration))
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }
}

/// Aggregate over the facts matching a source pattern
#[derive(Clone)]
pub struct AccumulateSpec {
    pub(crate) source: Pattern,
    pub(crate) accumulator: Arc<dyn Accumulator>,
    pub(crate) binding: Option<String>,
    pub(crate) filter: Option<Arc<dyn AlphaConstraint>>,
}

impl AccumulateSpec {
    pub fn new(source: Pattern, accumulator: impl Accumulator + 'static) -> Self {
        Self::shared(source, Arc::new(accumulator))
    }

    pub fn shared(source: Pattern, accumulator: Arc<dyn Accumulator>) -> Self {
        Self { source, accumulator, binding: None, filter: None }
    }

    /// Bind the aggregate value
    #[must_use]
    pub fn bind(mut self, name: impl Into<String>) -> Self {
        self.binding = Some(name.into());
        self
    }

    /// Only propagate when the aggregate satisfies `<op> value`
    #[must_use]
    pub fn having(mut self, operator: Operator, value: impl Into<FactValue>) -> Self {
        self.filter = Some(Arc::new(FieldConstraint::new(RESULT_FIELD, operator, value)));
        self
    }

    /// Custom result filter; it sees a fact whose `result` field is the aggregate
    #[must_use]
    pub fn having_constraint(mut self, constraint: Arc<dyn AlphaConstraint>) -> Self {
        self.filter = Some(constraint);
        self
    }
}

/// Subscription to async messages published under `message_id`
#[derive(Clone)]
pub struct ReceiveSpec {
    pub(crate) message_id: String,
    pub(crate) binding: Option<String>,
    pub(crate) constraints: Vec<Arc<dyn BetaConstraint>>,
}

impl ReceiveSpec {
    pub fn new(message_id: impl Into<String>) -> Self {
        Self { message_id: message_id.into(), binding: None, constraints: Vec::new() }
    }

    /// Bind the message value
    #[must_use]
    pub fn bind(mut self, name: impl Into<String>) -> Self {
        self.binding = Some(name.into());
        self
    }

    /// Constraint between the match so far and the message; the message is a
    /// fact with a single `value` field
    #[must_use]
    pub fn filter(mut self, constraint: impl BetaConstraint + 'static) -> Self {
        self.constraints.push(Arc::new(constraint));
        self
    }

    #[must_use]
    pub fn filter_fn<F>(self, reads: &[&str], predicate: F) -> Self
    where
        F: Fn(&Match, &Fact) -> anyhow::Result<bool> + Send + Sync + 'static,
    {
        self.filter(BetaFn::new(predicate).reading(reads))
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }
}

/// Async-send consequence: publish each value `computation(match)` yields
/// under `message_id`, after the send filter
#[derive(Clone)]
pub struct SendSpec {
    pub(crate) message_id: String,
    pub(crate) computation: Arc<dyn AsyncComputation>,
    pub(crate) filter: SendFilter,
}

impl SendSpec {
    /// One value per match
    pub fn new<F>(message_id: impl Into<String>, computation: F) -> Self
    where
        F: Fn(&Match) -> anyhow::Result<FactValue> + Send + Sync + 'static,
    {
        Self::many(message_id, move |source| computation(source).map(|value| vec![value]))
    }

    /// Any number of values per match; each one becomes its own message
    pub fn many<F>(message_id: impl Into<String>, computation: F) -> Self
    where
        F: Fn(&Match) -> anyhow::Result<Vec<FactValue>> + Send + Sync + 'static,
    {
        Self::shared(message_id, Arc::new(ComputeFn::new(computation)))
    }

    pub fn shared(message_id: impl Into<String>, computation: Arc<dyn AsyncComputation>) -> Self {
        Self { message_id: message_id.into(), computation, filter: SendFilter::default() }
    }

    /// Only publish values whose message fact passes `constraint`; the fact
    /// has a single `value` field
    #[must_use]
    pub fn filter(mut self, constraint: impl AlphaConstraint + 'static) -> Self {
        self.filter.alpha.push(Arc::new(constraint));
        self
    }

    /// `value <op> constant`
    #[must_use]
    pub fn having(self, operator: Operator, value: impl Into<FactValue>) -> Self {
        self.filter(FieldConstraint::new(MESSAGE_VALUE_FIELD, operator, value))
    }

    /// Constraint between the sending match and a value's message fact
    #[must_use]
    pub fn join(mut self, constraint: impl BetaConstraint + 'static) -> Self {
        self.filter.constraints.push(Arc::new(constraint));
        self
    }

    #[must_use]
    pub fn join_fn<F>(self, reads: &[&str], predicate: F) -> Self
    where
        F: Fn(&Match, &Fact) -> anyhow::Result<bool> + Send + Sync + 'static,
    {
        self.join(BetaFn::new(predicate).reading(reads))
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }
}

#[derive(Clone)]
pub enum ConditionElement {
    Pattern(Pattern),
    Not(Pattern),
    Exists(Pattern),
    Accumulate(AccumulateSpec),
    Receive(ReceiveSpec),
}

impl ConditionElement {
    pub fn name(&self) -> &'static str {
        match self {
            ConditionElement::Pattern(_) => "pattern",
            ConditionElement::Not(_) => "not",
            ConditionElement::Exists(_) => "exists",
            ConditionElement::Accumulate(_) => "accumulate",
            ConditionElement::Receive(_) => "receive",
        }
    }
}

#[derive(Clone)]
pub enum Consequence {
    Action(Arc<dyn Action>),
    Send(SendSpec),
}

/// Ordered conditions plus a consequence
#[derive(Clone)]
pub struct RuleDefinition {
    pub(crate) name: String,
    pub(crate) salience: i32,
    pub(crate) conditions: Vec<ConditionElement>,
    pub(crate) consequence: Option<Consequence>,
}

impl RuleDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), salience: 0, conditions: Vec::new(), consequence: None }
    }

    #[must_use]
    pub fn salience(mut self, salience: i32) -> Self {
        self.salience = salience;
        self
    }

    #[must_use]
    pub fn pattern(mut self, pattern: Pattern) -> Self {
        self.conditions.push(ConditionElement::Pattern(pattern));
        self
    }

    #[must_use]
    pub fn not(mut self, pattern: Pattern) -> Self {
        self.conditions.push(ConditionElement::Not(pattern));
        self
    }

    #[must_use]
    pub fn exists(mut self, pattern: Pattern) -> Self {
        self.conditions.push(ConditionElement::Exists(pattern));
        self
    }

    #[must_use]
    pub fn accumulate(mut self, spec: AccumulateSpec) -> Self {
        self.conditions.push(ConditionElement::Accumulate(spec));
        self
    }

    #[must_use]
    pub fn receive(mut self, spec: ReceiveSpec) -> Self {
        self.conditions.push(ConditionElement::Receive(spec));
        self
    }

    #[must_use]
    pub fn then<F>(self, action: F) -> Self
    where
        F: Fn(&Match, &mut ActionContext<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.then_action(Arc::new(ActionFn::new(action)))
    }

    #[must_use]
    pub fn then_action(mut self, action: Arc<dyn Action>) -> Self {
        self.consequence = Some(Consequence::Action(action));
        self
    }

    /// Replace the action with an async send; a rule has one consequence
    #[must_use]
    pub fn send(mut self, spec: SendSpec) -> Self {
        self.consequence = Some(Consequence::Send(spec));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn conditions(&self) -> &[ConditionElement] {
        &self.conditions
    }
}
