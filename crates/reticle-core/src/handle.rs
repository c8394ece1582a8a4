//! Fact handles: the identity of a fact while it sits in working memory.

use crate::types::{Fact, FactId};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Identity wrapper for one fact.
///
/// Cloning is cheap; the fact payload is shared. An update produces a new
/// handle with the same `id`, a higher `recency` and the new payload.
#[derive(Debug, Clone)]
pub struct FactHandle {
    id: FactId,
    recency: u64,
    fact: Arc<Fact>,
}

impl FactHandle {
    pub fn id(&self) -> FactId {
        self.id
    }

    pub fn recency(&self) -> u64 {
        self.recency
    }

    pub fn fact(&self) -> &Fact {
        &self.fact
    }

    pub fn shared_fact(&self) -> Arc<Fact> {
        Arc::clone(&self.fact)
    }

    pub fn kind(&self) -> &str {
        &self.fact.kind
    }

    /// Whether the engine created this fact rather than the application
    pub fn is_engine_owned(&self) -> bool {
        self.id >= ENGINE_ID_BASE
    }
}

impl PartialEq for FactHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.recency == other.recency
    }
}

impl Eq for FactHandle {}

impl fmt::Display for FactHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}:{}", self.id, self.fact)
    }
}

/// First id of the range reserved for engine-owned handles
pub const ENGINE_ID_BASE: FactId = 1 << 63;

/// Allocates fact ids and recency stamps for one session.
///
/// User facts number densely from 1. Engine-owned facts (the initial fact,
/// accumulate results and async messages) take ids from
/// [`ENGINE_ID_BASE`] up, so they never shift the user sequence.
#[derive(Debug, Default)]
pub struct FactHandleFactory {
    next_id: AtomicU64,
    next_engine_id: AtomicU64,
    next_recency: AtomicU64,
}

impl FactHandleFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle for a freshly inserted fact
    pub fn new_handle(&self, fact: Fact) -> FactHandle {
        FactHandle {
            id: self.next_id.fetch_add(1, Ordering::Relaxed) + 1,
            recency: self.next_recency(),
            fact: Arc::new(fact),
        }
    }

    /// Handle for a fact the engine creates for itself. It never enters the
    /// live fact table.
    pub fn engine_handle(&self, fact: Fact) -> FactHandle {
        FactHandle {
            id: ENGINE_ID_BASE + self.next_engine_id.fetch_add(1, Ordering::Relaxed),
            recency: self.next_recency(),
            fact: Arc::new(fact),
        }
    }

    /// Handle replacing `previous` after an update; keeps the id
    pub fn updated(&self, previous: &FactHandle, fact: Fact) -> FactHandle {
        FactHandle { id: previous.id, recency: self.next_recency(), fact: Arc::new(fact) }
    }

    fn next_recency(&self) -> u64 {
        self.next_recency.fetch_add(1, Ordering::Relaxed) + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FactValue;

    #[test]
    fn test_update_keeps_id_and_bumps_recency() {
        let factory = FactHandleFactory::new();
        let first = factory.new_handle(Fact::new("A").with_field("value", 1));
        let second = factory.new_handle(Fact::new("A").with_field("value", 2));
        assert_ne!(first.id(), second.id());

        let updated = factory.updated(&first, Fact::new("A").with_field("value", 3));
        assert_eq!(updated.id(), first.id());
        assert!(updated.recency() > second.recency());
        assert_ne!(updated, first);
        assert_eq!(updated.fact().get_field("value"), Some(&FactValue::Integer(3)));
    }

    #[test]
    fn test_engine_handles_leave_user_ids_dense() {
        let factory = FactHandleFactory::new();
        let initial = factory.engine_handle(Fact::new("InitialFact"));
        let first = factory.new_handle(Fact::new("A"));
        let result = factory.engine_handle(Fact::new("AccumulateResult"));
        let second = factory.new_handle(Fact::new("A"));

        assert_eq!((first.id(), second.id()), (1, 2));
        assert!(initial.is_engine_owned() && result.is_engine_owned());
        assert!(!first.is_engine_owned());
        assert_ne!(initial.id(), result.id());
        assert!(factory.updated(&result, Fact::new("AccumulateResult")).is_engine_owned());
        assert!(second.recency() > result.recency());
    }
}
