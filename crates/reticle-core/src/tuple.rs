//! Left tuples and the per-partition tuple arena.
//!
//! A left tuple is one partial match sitting in the left input of exactly one
//! node (`sink`). Tuples reference their parent and children by id. A child
//! is created per (match, sink) when a node propagates, so the chain from a
//! tuple up to its root spells out the facts of the match level by level.

use crate::handle::FactHandle;
use crate::types::{FactId, NodeId};
use ahash::AHashMap;
use std::collections::BTreeSet;

/// Tuple identifier, unique within a partition and never reused
pub type TupleId = u64;

/// Staging state of a tuple in its sink's left input
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Stage {
    #[default]
    None,
    Insert,
    Update,
    Delete,
}

/// How the node that created a tuple derived it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TupleContext {
    /// Created by a left input adapter from an inserted fact
    Root,
    /// Join child for the right tuple with this sequence number
    Right(u64),
    /// Receive child for the async message fact with this id
    Message(FactId),
    /// Produced by not, exists or accumulate
    Derived,
}

#[derive(Debug, Clone)]
pub struct LeftTuple {
    pub id: TupleId,
    pub parent: Option<TupleId>,
    /// Fact contributed at this level; `None` for not/exists levels
    pub handle: Option<FactHandle>,
    pub sink: NodeId,
    pub children: Vec<TupleId>,
    pub stage: Stage,
    pub context: TupleContext,
}

/// Owner of every live tuple of one partition
#[derive(Debug, Default)]
pub struct TupleArena {
    tuples: AHashMap<TupleId, LeftTuple>,
    next_id: TupleId,
}

impl TupleArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(
        &mut self,
        parent: Option<TupleId>,
        handle: Option<FactHandle>,
        sink: NodeId,
        context: TupleContext,
    ) -> TupleId {
        self.next_id += 1;
        let id = self.next_id;
        self.tuples.insert(
            id,
            LeftTuple {
                id,
                parent,
                handle,
                sink,
                children: Vec::new(),
                stage: Stage::None,
                context,
            },
        );
        if let Some(parent) = parent.and_then(|p| self.tuples.get_mut(&p)) {
            parent.children.push(id);
        }
        id
    }

    pub fn get(&self, id: TupleId) -> Option<&LeftTuple> {
        self.tuples.get(&id)
    }

    pub fn get_mut(&mut self, id: TupleId) -> Option<&mut LeftTuple> {
        self.tuples.get_mut(&id)
    }

    pub fn remove(&mut self, id: TupleId) -> Option<LeftTuple> {
        self.tuples.remove(&id)
    }

    /// Unlink a tuple from its parent's child list
    pub fn detach(&mut self, id: TupleId) {
        let Some(parent) = self.tuples.get(&id).and_then(|t| t.parent) else {
            return;
        };
        if let Some(parent) = self.tuples.get_mut(&parent) {
            parent.children.retain(|child| *child != id);
        }
    }

    /// Handles along the chain from the root down to `id`
    pub fn chain(&self, id: TupleId) -> Vec<Option<FactHandle>> {
        let mut handles = Vec::new();
        let mut cursor = Some(id);
        while let Some(tuple) = cursor.and_then(|t| self.tuples.get(&t)) {
            handles.push(tuple.handle.clone());
            cursor = tuple.parent;
        }
        handles.reverse();
        handles
    }

    pub fn len(&self) -> usize {
        self.tuples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tuples.is_empty()
    }
}

/// Staged left-input work of one node, processed as a batch
#[derive(Debug, Default, Clone)]
pub struct TupleSets {
    pub inserts: BTreeSet<TupleId>,
    pub updates: BTreeSet<TupleId>,
    pub deletes: BTreeSet<TupleId>,
}

impl TupleSets {
    pub fn is_empty(&self) -> bool {
        self.inserts.is_empty() && self.updates.is_empty() && self.deletes.is_empty()
    }

    /// Work that waits for a linked path
    pub fn has_deferred(&self) -> bool {
        !self.inserts.is_empty() || !self.updates.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::FactHandleFactory;
    use crate::types::Fact;

    #[test]
    fn test_chain_walks_root_to_leaf() {
        let factory = FactHandleFactory::new();
        let a = factory.new_handle(Fact::new("A"));
        let b = factory.new_handle(Fact::new("B"));

        let mut arena = TupleArena::new();
        let root = arena.create(None, Some(a.clone()), 2, TupleContext::Root);
        let blocked = arena.create(Some(root), None, 3, TupleContext::Derived);
        let leaf = arena.create(Some(blocked), Some(b.clone()), 4, TupleContext::Right(1));

        let chain = arena.chain(leaf);
        assert_eq!(chain.len(), 3);
        assert_eq!(chain[0].as_ref().map(FactHandle::id), Some(a.id()));
        assert!(chain[1].is_none());
        assert_eq!(chain[2].as_ref().map(FactHandle::id), Some(b.id()));
        assert_eq!(arena.get(root).unwrap().children, vec![blocked]);

        arena.detach(blocked);
        assert!(arena.get(root).unwrap().children.is_empty());
    }

    #[test]
    fn test_ids_are_never_reused() {
        let mut arena = TupleArena::new();
        let first = arena.create(None, None, 1, TupleContext::Root);
        arena.remove(first);
        let second = arena.create(None, None, 1, TupleContext::Root);
        assert!(second > first);
        assert_eq!(arena.len(), 1);
    }
}
