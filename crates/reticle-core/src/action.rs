//! Rule consequences and the mutation handle they receive.

use crate::declaration::Match;
use crate::error::ReticleResult;
use crate::session::{Globals, WorkingMemory};
use crate::types::{Fact, FactId, PartitionId};
use tracing::debug;

/// Side-effecting callback run when a rule fires
pub trait Action: Send + Sync {
    fn execute(&self, source: &Match, context: &mut ActionContext<'_>) -> anyhow::Result<()>;
}

/// Closure-backed action
pub struct ActionFn<F>(F);

impl<F> ActionFn<F>
where
    F: Fn(&Match, &mut ActionContext<'_>) -> anyhow::Result<()> + Send + Sync,
{
    pub fn new(action: F) -> Self {
        Self(action)
    }
}

impl<F> Action for ActionFn<F>
where
    F: Fn(&Match, &mut ActionContext<'_>) -> anyhow::Result<()> + Send + Sync,
{
    fn execute(&self, source: &Match, context: &mut ActionContext<'_>) -> anyhow::Result<()> {
        (self.0)(source, context)
    }
}

/// What an action may do to the session while it runs.
///
/// Mutations are queued as propagation entries; they are applied once the
/// action returns, in the order the action issued them.
pub struct ActionContext<'a> {
    memory: &'a WorkingMemory,
    rule_name: &'a str,
    partition: PartitionId,
}

impl<'a> ActionContext<'a> {
    pub(crate) fn new(memory: &'a WorkingMemory, rule_name: &'a str, partition: PartitionId) -> Self {
        Self { memory, rule_name, partition }
    }

    pub fn insert(&mut self, fact: Fact) -> ReticleResult<FactId> {
        self.memory.insert(fact)
    }

    pub fn update(&mut self, fact_id: FactId, fact: Fact) -> ReticleResult<()> {
        self.memory.update(fact_id, fact)
    }

    pub fn retract(&mut self, fact_id: FactId) -> ReticleResult<()> {
        self.memory.retract(fact_id)
    }

    /// Stop the current fire loop at its next iteration boundary
    pub fn halt(&mut self) {
        debug!(rule = %self.rule_name, "Halt requested by action");
        self.memory.halt();
    }

    pub fn globals(&self) -> &Globals {
        &self.memory.globals
    }

    pub fn rule_name(&self) -> &str {
        self.rule_name
    }

    pub fn partition(&self) -> PartitionId {
        self.partition
    }
}
