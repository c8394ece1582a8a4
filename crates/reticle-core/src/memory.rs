//! Per-node memories
//!
//! Every memory is owned by one (node, partition) pair and only touched by
//! the thread evaluating that partition. Beta memories index both inputs by
//! the node's join key when it has one; candidates are always returned in
//! insertion order so that propagation stays deterministic.

use crate::exchange::MessageKey;
use crate::handle::FactHandle;
use crate::tuple::{TupleId, TupleSets};
use crate::types::{FactId, FactValue};
use ahash::{AHashMap, AHashSet};
use std::collections::{BTreeMap, BTreeSet, VecDeque};

/// A fact's entry on the right input of a beta node
#[derive(Debug, Clone)]
pub struct RightTuple {
    pub seq: u64,
    pub handle: FactHandle,
    pub key: Option<FactValue>,
    /// Left tuples this fact currently matches
    pub matched: BTreeSet<TupleId>,
}

#[derive(Debug, Default)]
pub struct RightMemory {
    tuples: BTreeMap<u64, RightTuple>,
    by_fact: AHashMap<FactId, u64>,
    index: AHashMap<FactValue, BTreeSet<u64>>,
    next_seq: u64,
}

impl RightMemory {
    pub fn insert(&mut self, handle: FactHandle, key: Option<FactValue>) -> u64 {
        self.next_seq += 1;
        let seq = self.next_seq;
        if let Some(key) = &key {
            self.index.entry(key.clone()).or_default().insert(seq);
        }
        self.by_fact.insert(handle.id(), seq);
        self.tuples.insert(seq, RightTuple { seq, handle, key, matched: BTreeSet::new() });
        seq
    }

    pub fn remove(&mut self, fact_id: FactId) -> Option<RightTuple> {
        let seq = self.by_fact.remove(&fact_id)?;
        let tuple = self.tuples.remove(&seq)?;
        if let Some(key) = &tuple.key {
            remove_from_index(&mut self.index, key, seq);
        }
        Some(tuple)
    }

    /// Replace the handle of a stored fact, moving it between index buckets
    pub fn replace(&mut self, handle: FactHandle, key: Option<FactValue>) -> Option<u64> {
        let seq = *self.by_fact.get(&handle.id())?;
        let tuple = self.tuples.get_mut(&seq)?;
        if tuple.key != key {
            if let Some(old) = tuple.key.take() {
                remove_from_index(&mut self.index, &old, seq);
            }
            if let Some(new) = &key {
                self.index.entry(new.clone()).or_default().insert(seq);
            }
            tuple.key = key;
        }
        tuple.handle = handle;
        Some(seq)
    }

    pub fn get(&self, seq: u64) -> Option<&RightTuple> {
        self.tuples.get(&seq)
    }

    pub fn get_mut(&mut self, seq: u64) -> Option<&mut RightTuple> {
        self.tuples.get_mut(&seq)
    }

    /// Right tuples a left tuple with `key` may match, in insertion order
    pub fn candidates(&self, indexed: bool, key: Option<&FactValue>) -> Vec<u64> {
        if !indexed {
            return self.tuples.keys().copied().collect();
        }
        key.and_then(|k| self.index.get(k))
            .map(|bucket| bucket.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.tuples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tuples.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
pub struct LeftEntry {
    pub key: Option<FactValue>,
    /// Sequence numbers of matching right tuples
    pub matched: BTreeSet<u64>,
}

#[derive(Debug, Default)]
pub struct LeftMemory {
    tuples: BTreeMap<TupleId, LeftEntry>,
    index: AHashMap<FactValue, BTreeSet<TupleId>>,
}

impl LeftMemory {
    pub fn insert(&mut self, id: TupleId, entry: LeftEntry) {
        if let Some(key) = &entry.key {
            self.index.entry(key.clone()).or_default().insert(id);
        }
        self.tuples.insert(id, entry);
    }

    pub fn remove(&mut self, id: TupleId) -> Option<LeftEntry> {
        let entry = self.tuples.remove(&id)?;
        if let Some(key) = &entry.key {
            remove_from_index(&mut self.index, key, id);
        }
        Some(entry)
    }

    pub fn rekey(&mut self, id: TupleId, key: Option<FactValue>) {
        let Some(entry) = self.tuples.get_mut(&id) else {
            return;
        };
        if entry.key == key {
            return;
        }
        if let Some(old) = entry.key.take() {
            remove_from_index(&mut self.index, &old, id);
        }
        if let Some(new) = &key {
            self.index.entry(new.clone()).or_default().insert(id);
        }
        entry.key = key;
    }

    pub fn get(&self, id: TupleId) -> Option<&LeftEntry> {
        self.tuples.get(&id)
    }

    pub fn get_mut(&mut self, id: TupleId) -> Option<&mut LeftEntry> {
        self.tuples.get_mut(&id)
    }

    pub fn candidates(&self, indexed: bool, key: Option<&FactValue>) -> Vec<TupleId> {
        if !indexed {
            return self.tuples.keys().copied().collect();
        }
        key.and_then(|k| self.index.get(k))
            .map(|bucket| bucket.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.tuples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tuples.is_empty()
    }
}

fn remove_from_index<T: Ord>(
    index: &mut AHashMap<FactValue, BTreeSet<T>>,
    key: &FactValue,
    id: T,
) {
    if let Some(bucket) = index.get_mut(key) {
        bucket.remove(&id);
        if bucket.is_empty() {
            index.remove(key);
        }
    }
}

/// Staged right-input work of one beta node
#[derive(Debug, Default, Clone)]
pub struct RightSets {
    pub inserts: Vec<FactHandle>,
    pub updates: Vec<FactHandle>,
    pub deletes: Vec<FactId>,
}

impl RightSets {
    pub fn stage_insert(&mut self, handle: FactHandle) {
        self.inserts.push(handle);
    }

    /// A pending insert absorbs the update
    pub fn stage_update(&mut self, handle: FactHandle) {
        if let Some(pending) = self.inserts.iter_mut().find(|h| h.id() == handle.id()) {
            *pending = handle;
        } else if let Some(pending) = self.updates.iter_mut().find(|h| h.id() == handle.id()) {
            *pending = handle;
        } else {
            self.updates.push(handle);
        }
    }

    /// A pending insert is cancelled outright; a pending update becomes a delete
    pub fn stage_delete(&mut self, fact_id: FactId) {
        if let Some(pos) = self.inserts.iter().position(|h| h.id() == fact_id) {
            self.inserts.remove(pos);
            return;
        }
        self.updates.retain(|h| h.id() != fact_id);
        self.deletes.push(fact_id);
    }

    pub fn is_empty(&self) -> bool {
        self.inserts.is_empty() && self.updates.is_empty() && self.deletes.is_empty()
    }

    pub fn has_deferred(&self) -> bool {
        !self.inserts.is_empty() || !self.updates.is_empty()
    }
}

/// The most recent message keys a receive node has applied, oldest first
#[derive(Debug, Default)]
pub struct MessageWindow {
    keys: AHashSet<MessageKey>,
    order: VecDeque<MessageKey>,
}

impl MessageWindow {
    /// Record `key`; false when it is already in the window. The oldest key
    /// is forgotten once more than `capacity` are held.
    pub fn insert(&mut self, key: MessageKey, capacity: usize) -> bool {
        if !self.keys.insert(key) {
            return false;
        }
        self.order.push_back(key);
        while self.order.len() > capacity.max(1) {
            if let Some(oldest) = self.order.pop_front() {
                self.keys.remove(&oldest);
            }
        }
        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Memory of join, not, exists, accumulate and async-receive nodes
#[derive(Debug, Default)]
pub struct BetaMemory {
    pub left: LeftMemory,
    pub right: RightMemory,
    pub staged_left: TupleSets,
    pub staged_right: RightSets,
    /// Right facts in memory plus staged inserts minus staged deletes
    pub right_count: usize,
    /// Async messages recently applied, for idempotent delivery
    pub seen: MessageWindow,
    /// Last aggregate per left tuple
    pub results: AHashMap<TupleId, FactValue>,
}

impl BetaMemory {
    pub fn has_deferred(&self) -> bool {
        self.staged_left.has_deferred() || self.staged_right.has_deferred()
    }
}

/// Memory of terminal and async-send nodes: the complete matches they hold
#[derive(Debug, Default)]
pub struct SinkMemory {
    pub tuples: BTreeSet<TupleId>,
    pub staged: TupleSets,
}

/// Memory of a left input adapter: how many facts currently enter through it
#[derive(Debug, Default)]
pub struct AdapterMemory {
    pub facts: usize,
}

#[derive(Debug)]
pub enum NodeMemory {
    Adapter(AdapterMemory),
    Beta(BetaMemory),
    Sink(SinkMemory),
}

impl NodeMemory {
    pub fn staged_left_mut(&mut self) -> Option<&mut TupleSets> {
        match self {
            NodeMemory::Beta(memory) => Some(&mut memory.staged_left),
            NodeMemory::Sink(memory) => Some(&mut memory.staged),
            NodeMemory::Adapter(_) => None,
        }
    }

    pub fn as_beta_mut(&mut self) -> Option<&mut BetaMemory> {
        match self {
            NodeMemory::Beta(memory) => Some(memory),
            _ => None,
        }
    }

    pub fn as_adapter_mut(&mut self) -> Option<&mut AdapterMemory> {
        match self {
            NodeMemory::Adapter(memory) => Some(memory),
            _ => None,
        }
    }

    pub fn has_deferred(&self) -> bool {
        match self {
            NodeMemory::Beta(memory) => memory.has_deferred(),
            NodeMemory::Sink(memory) => memory.staged.has_deferred(),
            NodeMemory::Adapter(_) => false,
        }
    }

    pub fn has_staged(&self) -> bool {
        match self {
            NodeMemory::Beta(memory) => {
                !memory.staged_left.is_empty() || !memory.staged_right.is_empty()
            }
            NodeMemory::Sink(memory) => !memory.staged.is_empty(),
            NodeMemory::Adapter(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::FactHandleFactory;
    use crate::types::Fact;

    #[test]
    fn test_right_memory_index_follows_updates() {
        let factory = FactHandleFactory::new();
        let first = factory.new_handle(Fact::new("B").with_field("k", 1));
        let second = factory.new_handle(Fact::new("B").with_field("k", 1));
        let mut memory = RightMemory::default();
        let s1 = memory.insert(first.clone(), Some(FactValue::Integer(1)));
        let s2 = memory.insert(second, Some(FactValue::Integer(1)));

        assert_eq!(memory.candidates(true, Some(&FactValue::Integer(1))), vec![s1, s2]);
        assert_eq!(memory.candidates(false, None), vec![s1, s2]);

        let moved = factory.updated(&first, Fact::new("B").with_field("k", 2));
        assert_eq!(memory.replace(moved, Some(FactValue::Integer(2))), Some(s1));
        assert_eq!(memory.candidates(true, Some(&FactValue::Integer(1))), vec![s2]);
        assert_eq!(memory.candidates(true, Some(&FactValue::Integer(2))), vec![s1]);
        assert!(memory.candidates(true, None).is_empty());
    }

    #[test]
    fn test_message_window_forgets_oldest_keys() {
        let key = |tuple| MessageKey { session: uuid::Uuid::nil(), send_node: 4, tuple, index: 0 };
        let mut window = MessageWindow::default();
        assert!(window.insert(key(1), 2));
        assert!(!window.insert(key(1), 2));
        assert!(window.insert(key(2), 2));
        assert!(window.insert(key(3), 2));
        assert_eq!(window.len(), 2);
        // key 1 fell out of the window, keys 2 and 3 are still held
        assert!(!window.insert(key(3), 2));
        assert!(window.insert(key(1), 2));
        assert!(window.insert(key(2), 2));
    }

    #[test]
    fn test_right_sets_cancellation() {
        let factory = FactHandleFactory::new();
        let handle = factory.new_handle(Fact::new("B"));
        let mut sets = RightSets::default();
        sets.stage_insert(handle.clone());
        sets.stage_update(factory.updated(&handle, Fact::new("B").with_field("x", 1)));
        assert_eq!(sets.inserts.len(), 1);
        assert!(sets.updates.is_empty());
        sets.stage_delete(handle.id());
        assert!(sets.is_empty());

        sets.stage_update(handle.clone());
        sets.stage_delete(handle.id());
        assert!(sets.updates.is_empty());
        assert_eq!(sets.deletes, vec![handle.id()]);
    }
}
