//! Partition agenda and conflict resolution
//!
//! Activations are ordered by:
//!
//! 1. **Salience**, highest first
//! 2. **Rule declaration order**, earliest declared first
//! 3. **Insertion order**, oldest activation first
//!
//! There is at most one pending activation per complete match (terminal
//! tuple). Firing removes the activation but the tuple stays in the terminal
//! memory, so a match fires once until it is updated or re-created.

use crate::tuple::TupleId;
use crate::types::RuleId;
use ahash::AHashMap;
use std::cmp::{Ordering, Reverse};
use std::collections::BTreeMap;
use tracing::trace;

/// A scheduled firing of one rule for one complete match
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Activation {
    pub rule: RuleId,
    pub tuple: TupleId,
    pub salience: i32,
    pub seq: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct AgendaKey {
    salience: Reverse<i32>,
    rule: RuleId,
    seq: u64,
}

impl Ord for AgendaKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.salience
            .cmp(&other.salience)
            .then_with(|| self.rule.cmp(&other.rule))
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

impl PartialOrd for AgendaKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Default)]
pub struct Agenda {
    queue: BTreeMap<AgendaKey, Activation>,
    by_tuple: AHashMap<TupleId, AgendaKey>,
    next_seq: u64,
}

impl Agenda {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `rule` for the match ending at `tuple`. Returns false when
    /// that match already has a pending activation.
    pub fn add(&mut self, rule: RuleId, salience: i32, tuple: TupleId) -> bool {
        if self.by_tuple.contains_key(&tuple) {
            return false;
        }
        self.next_seq += 1;
        let key = AgendaKey { salience: Reverse(salience), rule, seq: self.next_seq };
        self.queue.insert(key, Activation { rule, tuple, salience, seq: self.next_seq });
        self.by_tuple.insert(tuple, key);
        trace!(rule, tuple, salience, "Activation created");
        true
    }

    pub fn cancel(&mut self, tuple: TupleId) -> Option<Activation> {
        let key = self.by_tuple.remove(&tuple)?;
        let activation = self.queue.remove(&key);
        if activation.is_some() {
            trace!(tuple, "Activation cancelled");
        }
        activation
    }

    pub fn contains(&self, tuple: TupleId) -> bool {
        self.by_tuple.contains_key(&tuple)
    }

    /// Remove and return the best activation whose rule passes `linked`.
    /// Activations of unlinked rules stay queued.
    pub fn pop_next(&mut self, mut linked: impl FnMut(RuleId) -> bool) -> Option<Activation> {
        let key = self.queue.iter().find(|(_, a)| linked(a.rule)).map(|(key, _)| *key)?;
        let activation = self.queue.remove(&key)?;
        self.by_tuple.remove(&activation.tuple);
        Some(activation)
    }

    /// Pending activations in firing order
    pub fn iter(&self) -> impl Iterator<Item = &Activation> {
        self.queue.values()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
        self.by_tuple.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_salience_then_declaration_then_insertion() {
        let mut agenda = Agenda::new();
        agenda.add(2, 0, 10);
        agenda.add(1, 0, 11);
        agenda.add(1, 0, 12);
        agenda.add(3, 5, 13);

        let order: Vec<TupleId> = std::iter::from_fn(|| agenda.pop_next(|_| true))
            .map(|a| a.tuple)
            .collect();
        assert_eq!(order, vec![13, 11, 12, 10]);
    }

    #[test]
    fn test_one_activation_per_match() {
        let mut agenda = Agenda::new();
        assert!(agenda.add(0, 0, 1));
        assert!(!agenda.add(0, 0, 1));
        assert_eq!(agenda.len(), 1);
        assert!(agenda.cancel(1).is_some());
        assert!(agenda.cancel(1).is_none());
        assert!(agenda.is_empty());
    }

    #[test]
    fn test_unlinked_rules_are_skipped_not_dropped() {
        let mut agenda = Agenda::new();
        agenda.add(0, 10, 1);
        agenda.add(1, 0, 2);

        let fired = agenda.pop_next(|rule| rule != 0).unwrap();
        assert_eq!(fired.tuple, 2);
        assert!(agenda.contains(1));
        assert!(agenda.pop_next(|rule| rule != 0).is_none());
        assert_eq!(agenda.len(), 1);
    }
}
