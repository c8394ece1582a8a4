//! Partition evaluation
//!
//! A partition owns the memories, tuples, agenda and link state of the rules
//! assigned to it. Work arrives as propagation entries on its queue and is
//! applied in two steps:
//!
//! 1. [`PartitionState::execute`] runs the alpha network for the entry's fact
//!    and stages left and right input changes on the reached nodes. Link bits
//!    flip here, as inputs go empty or non-empty.
//! 2. [`PartitionState::evaluate`] processes staged nodes in ascending id
//!    order, which is topological. Nodes with no linked path only apply their
//!    deletes; their inserts and updates wait until a path through them links.
//!
//! Firing pops the best activation whose path is linked and runs its action.
//! Everything here is touched only by the thread bound as owner.

use crate::action::ActionContext;
use crate::agenda::Agenda;
use crate::declaration::Match;
use crate::error::{ReticleError, ReticleResult};
use crate::exchange::{AsyncMessage, MessageCoordinator, MessageKey, WorkerPool, message_fact};
use crate::handle::FactHandle;
use crate::memory::{AdapterMemory, BetaMemory, LeftEntry, NodeMemory, SinkMemory};
use crate::network::{Network, Node, NodeKind};
use crate::propagation::PropagationEntry;
use crate::rule::{RESULT_FIELD, RESULT_KIND};
use crate::segment::{PathId, PathMemory, SegmentId, SegmentMemory};
use crate::session::WorkingMemory;
use crate::tuple::{Stage, TupleArena, TupleContext, TupleId};
use crate::types::{Fact, FactId, FactValue, NodeId, PartitionId, RuleId};
use ahash::AHashMap;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::{self, ThreadId};
use tracing::{debug, trace, warn};

/// Where one fact entered this partition
#[derive(Debug, Default)]
struct FactRefs {
    /// Adapter and the root tuples it created, one per adapter sink
    roots: Vec<(NodeId, Vec<TupleId>)>,
    /// Beta nodes holding the fact on their right input
    rights: Vec<NodeId>,
}

impl FactRefs {
    fn is_empty(&self) -> bool {
        self.roots.is_empty() && self.rights.is_empty()
    }

    fn contains(&self, node: NodeId) -> bool {
        self.roots.iter().any(|(adapter, _)| *adapter == node) || self.rights.contains(&node)
    }
}

/// Which children of a left tuple must be refreshed besides creations and deletions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Touch {
    None,
    /// The left tuple itself changed
    All,
    /// The right fact with this sequence number changed
    Right(u64),
}

/// Counters of one partition
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PartitionStats {
    pub entries: u64,
    pub evaluations: u64,
    pub fired: u64,
    pub links: u64,
    pub unlinks: u64,
    pub tuples: usize,
    pub activations: usize,
}

/// A pending activation as reported to callers
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActivationInfo {
    pub rule: String,
    pub salience: i32,
    pub partition: PartitionId,
    pub fact_ids: Vec<FactId>,
}

/// Shared stop conditions of one fire call across its partition loops
#[derive(Debug)]
pub(crate) struct FireControl {
    until_halt: bool,
    remaining: Option<AtomicUsize>,
    aborted: AtomicBool,
    /// Latched by the first loop that observes quiescence; entries arriving
    /// afterwards are left for the next fire call
    settled: AtomicBool,
}

impl FireControl {
    pub(crate) fn new(limit: Option<usize>, until_halt: bool) -> Self {
        Self {
            until_halt,
            remaining: limit.map(AtomicUsize::new),
            aborted: AtomicBool::new(false),
            settled: AtomicBool::new(false),
        }
    }

    fn settle_if_quiescent(&self, memory: &WorkingMemory) -> bool {
        if self.until_halt {
            return false;
        }
        if self.settled.load(Ordering::SeqCst) || memory.tracker.is_quiescent() {
            self.settled.store(true, Ordering::SeqCst);
            return true;
        }
        false
    }

    pub(crate) fn until_halt(&self) -> bool {
        self.until_halt
    }

    /// Claim one firing against the limit
    fn reserve(&self) -> bool {
        match &self.remaining {
            None => true,
            Some(remaining) => remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok(),
        }
    }

    fn exhausted(&self) -> bool {
        self.remaining.as_ref().is_some_and(|r| r.load(Ordering::SeqCst) == 0)
    }

    pub(crate) fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
    }

    fn should_stop(&self, memory: &WorkingMemory) -> bool {
        self.aborted.load(Ordering::SeqCst)
            || self.exhausted()
            || memory.is_halted()
            || memory.is_disposed()
    }
}

fn new_memory(kind: &NodeKind) -> NodeMemory {
    match kind {
        NodeKind::LeftInputAdapter => NodeMemory::Adapter(AdapterMemory::default()),
        NodeKind::Terminal { .. } | NodeKind::AsyncSend { .. } => {
            NodeMemory::Sink(SinkMemory::default())
        }
        _ => NodeMemory::Beta(BetaMemory::default()),
    }
}

pub struct PartitionState {
    id: PartitionId,
    network: Arc<Network>,
    memory: Arc<WorkingMemory>,
    memories: AHashMap<NodeId, NodeMemory>,
    arena: TupleArena,
    fact_refs: AHashMap<FactId, FactRefs>,
    agenda: Agenda,
    segments: AHashMap<SegmentId, SegmentMemory>,
    paths: AHashMap<PathId, PathMemory>,
    dirty: BTreeSet<NodeId>,
    /// Nodes holding inserts or updates that wait for a linked path
    deferred: BTreeSet<NodeId>,
    /// Receive children created by async messages, dropped once the
    /// partition runs out of work
    delivered: Vec<TupleId>,
    owner: Option<ThreadId>,
    failure: Option<ReticleError>,
    stats: PartitionStats,
}

impl PartitionState {
    pub(crate) fn new(id: PartitionId, network: Arc<Network>, memory: Arc<WorkingMemory>) -> Self {
        let layouts = network.layouts();
        let segments: AHashMap<SegmentId, SegmentMemory> = layouts
            .segments
            .iter()
            .filter(|s| s.partition == id)
            .map(|s| (s.id, SegmentMemory::new(s)))
            .collect();
        let mut paths: AHashMap<PathId, PathMemory> = layouts
            .paths
            .iter()
            .filter(|p| p.partition == id)
            .map(|p| (p.id, PathMemory::new(p)))
            .collect();
        for (path, memory) in &mut paths {
            for (position, segment) in layouts.paths[*path].segments.iter().enumerate() {
                if segments.get(segment).is_some_and(SegmentMemory::is_linked) {
                    memory.link_segment(position as u32);
                }
            }
        }
        debug!(partition = id, segments = segments.len(), paths = paths.len(), "Partition created");

        Self {
            id,
            network,
            memory,
            memories: AHashMap::new(),
            arena: TupleArena::new(),
            fact_refs: AHashMap::new(),
            agenda: Agenda::new(),
            segments,
            paths,
            dirty: BTreeSet::new(),
            deferred: BTreeSet::new(),
            delivered: Vec::new(),
            owner: None,
            failure: None,
            stats: PartitionStats::default(),
        }
    }

    pub fn id(&self) -> PartitionId {
        self.id
    }

    pub(crate) fn bind_owner(&mut self) {
        self.owner = Some(thread::current().id());
    }

    pub(crate) fn release_owner(&mut self) {
        self.owner = None;
    }

    fn ensure_owner(&self) -> ReticleResult<()> {
        match self.owner {
            Some(owner) if owner != thread::current().id() => Err(ReticleError::concurrency(
                self.id,
                format!("Partition {} is owned by another evaluation thread", self.id),
            )),
            _ => Ok(()),
        }
    }

    fn record_failure(&mut self, error: ReticleError) {
        if self.failure.is_none() {
            warn!(partition = self.id, error = %error, "Evaluation failure recorded");
            self.failure = Some(error);
        }
    }

    fn take_failure(&mut self) -> ReticleResult<()> {
        self.failure.take().map_or(Ok(()), Err)
    }

    /// Apply one queued entry: run the alpha network and stage node inputs
    pub fn execute(&mut self, entry: PropagationEntry) -> ReticleResult<()> {
        self.ensure_owner()?;
        self.stats.entries += 1;
        trace!(partition = self.id, entry = entry.name(), "Executing propagation entry");
        match entry {
            PropagationEntry::Insert { handle } => self.insert_fact(handle),
            PropagationEntry::Update { previous, current } => self.update_fact(&previous, current),
            PropagationEntry::Delete { handle } => {
                self.delete_fact(handle.id());
                Ok(())
            }
            PropagationEntry::AsyncReceive { node, message } => {
                // earlier entries must reach the memory the message is matched against
                self.evaluate()?;
                self.receive(node, message);
                self.take_failure()
            }
            PropagationEntry::AsyncError { error } => Err(error),
            PropagationEntry::Halt => Ok(()),
        }
    }

    fn insert_fact(&mut self, handle: FactHandle) -> ReticleResult<()> {
        let entries = self.reach_entries(&handle);
        let mut refs = FactRefs::default();
        for node in entries {
            self.attach(node, &handle, &mut refs);
        }
        if !refs.is_empty() {
            self.fact_refs.insert(handle.id(), refs);
        }
        self.take_failure()
    }

    fn update_fact(&mut self, previous: &FactHandle, current: FactHandle) -> ReticleResult<()> {
        trace!(
            partition = self.id,
            fact = current.id(),
            from = previous.recency(),
            to = current.recency(),
            "Updating fact"
        );
        let old = self.fact_refs.remove(&current.id()).unwrap_or_default();
        let entries = self.reach_entries(&current);
        let mut refs = FactRefs::default();

        for (adapter, roots) in old.roots {
            if entries.contains(&adapter) {
                for root in &roots {
                    if let Some(tuple) = self.arena.get_mut(*root) {
                        tuple.handle = Some(current.clone());
                    }
                    self.stage_left_update(*root);
                }
                refs.roots.push((adapter, roots));
            } else {
                self.leave_adapter(adapter, &roots);
            }
        }
        for node in old.rights {
            if entries.contains(&node) {
                self.stage_right_update(node, current.clone());
                refs.rights.push(node);
            } else {
                self.stage_right_delete(node, current.id());
            }
        }
        for node in entries {
            if !refs.contains(node) {
                self.attach(node, &current, &mut refs);
            }
        }
        if !refs.is_empty() {
            self.fact_refs.insert(current.id(), refs);
        }
        self.take_failure()
    }

    fn delete_fact(&mut self, fact_id: FactId) {
        let Some(refs) = self.fact_refs.remove(&fact_id) else {
            return;
        };
        for (adapter, roots) in refs.roots {
            self.leave_adapter(adapter, &roots);
        }
        for node in refs.rights {
            self.stage_right_delete(node, fact_id);
        }
    }

    /// Match a message against the receive node's left memory as it is now.
    /// The message itself is not kept; later left tuples never see it.
    fn receive(&mut self, node_id: NodeId, message: AsyncMessage) {
        let network = Arc::clone(&self.network);
        let Some(node) = network.node(node_id).filter(|n| matches!(n.kind, NodeKind::AsyncReceive { .. }))
        else {
            self.record_failure(ReticleError::internal_component(
                "partition",
                format!("Node {node_id} is not an async receive node"),
            ));
            return;
        };
        let window = network.config().message_dedup_window;
        if !self.beta_memory(node_id).seen.insert(message.key, window) {
            debug!(partition = self.id, node = node_id, message_id = %message.message_id, "Duplicate async message ignored");
            return;
        }
        let handle = self.memory.handles.engine_handle(message_fact(&message.message_id, message.value));
        let Some(NodeMemory::Beta(memory)) = self.memories.remove(&node_id) else {
            return;
        };

        let (indexed, key) = right_key(node, &handle);
        let mut matched = 0;
        for tuple in memory.left.candidates(indexed, key.as_ref()) {
            let source = self.left_match(node, tuple);
            if !self.beta_allows(node, &source, &handle) {
                continue;
            }
            matched += 1;
            for sink in &node.left_sinks {
                let context = TupleContext::Message(handle.id());
                let child = self.arena.create(Some(tuple), Some(handle.clone()), *sink, context);
                self.stage_left_insert(child);
                self.delivered.push(child);
            }
        }
        self.memories.insert(node_id, NodeMemory::Beta(memory));
        trace!(partition = self.id, node = node_id, fact = handle.id(), matched, "Async message applied");
    }

    /// Retract what delivered messages produced. Returns whether there was
    /// anything to retract.
    fn expire_messages(&mut self) -> bool {
        if self.delivered.is_empty() {
            return false;
        }
        let delivered = std::mem::take(&mut self.delivered);
        trace!(partition = self.id, tuples = delivered.len(), "Expiring async message matches");
        for tuple in delivered {
            self.stage_left_delete(tuple);
        }
        true
    }

    /// Adapters and right inputs of this partition that accept the fact
    fn reach_entries(&mut self, handle: &FactHandle) -> Vec<NodeId> {
        let network = Arc::clone(&self.network);
        let Some(root) = network.object_type(handle.kind()) else {
            return Vec::new();
        };
        let mut entries = Vec::new();
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            let node = &network.nodes()[id];
            match &node.kind {
                NodeKind::ObjectType { .. } => {}
                NodeKind::Alpha { constraint } => match constraint.is_allowed(handle.fact()) {
                    Ok(true) => {}
                    Ok(false) => continue,
                    Err(err) => {
                        let error = ReticleError::evaluation(
                            network.rule_name_of(id),
                            id,
                            vec![handle.id()],
                            &err,
                        );
                        self.record_failure(error);
                        continue;
                    }
                },
                _ => {
                    if node.partition == Some(self.id) {
                        entries.push(id);
                    }
                    continue;
                }
            }
            for sink in &node.object_sinks {
                let next = &network.nodes()[*sink];
                let relevant = match next.partition {
                    Some(partition) => partition == self.id,
                    None => next.reach.contains(&self.id),
                };
                if relevant {
                    stack.push(*sink);
                }
            }
        }
        entries.sort_unstable();
        entries
    }

    fn attach(&mut self, node: NodeId, handle: &FactHandle, refs: &mut FactRefs) {
        if matches!(self.network.nodes()[node].kind, NodeKind::LeftInputAdapter) {
            let roots = self.enter_adapter(node, handle);
            refs.roots.push((node, roots));
        } else {
            self.stage_right_insert(node, handle.clone());
            refs.rights.push(node);
        }
    }

    fn enter_adapter(&mut self, node: NodeId, handle: &FactHandle) -> Vec<TupleId> {
        let facts = match self.memory_of(node) {
            NodeMemory::Adapter(adapter) => {
                adapter.facts += 1;
                adapter.facts
            }
            _ => unreachable!("node {node} is not a left input adapter"),
        };
        if facts == 1 {
            self.link_node(node);
        }
        let network = Arc::clone(&self.network);
        network.nodes()[node]
            .left_sinks
            .iter()
            .map(|sink| {
                let root = self.arena.create(None, Some(handle.clone()), *sink, TupleContext::Root);
                self.stage_left_insert(root);
                root
            })
            .collect()
    }

    fn leave_adapter(&mut self, node: NodeId, roots: &[TupleId]) {
        let facts = match self.memories.get_mut(&node) {
            Some(NodeMemory::Adapter(adapter)) => {
                assert!(adapter.facts > 0, "left input adapter {node} count underflow");
                adapter.facts -= 1;
                adapter.facts
            }
            _ => panic!("left input adapter {node} has no memory"),
        };
        if facts == 0 {
            self.unlink_node(node);
        }
        for root in roots {
            self.stage_left_delete(*root);
        }
    }

    fn memory_of(&mut self, node: NodeId) -> &mut NodeMemory {
        let network = &self.network;
        self.memories.entry(node).or_insert_with(|| new_memory(&network.nodes()[node].kind))
    }

    fn beta_memory(&mut self, node: NodeId) -> &mut BetaMemory {
        match self.memory_of(node) {
            NodeMemory::Beta(memory) => memory,
            _ => unreachable!("node {node} is not a beta node"),
        }
    }

    fn stage_left_insert(&mut self, tuple: TupleId) {
        let Some(sink) = self.arena.get_mut(tuple).map(|t| {
            t.stage = Stage::Insert;
            t.sink
        }) else {
            return;
        };
        if let Some(staged) = self.memory_of(sink).staged_left_mut() {
            staged.inserts.insert(tuple);
        }
        self.dirty.insert(sink);
    }

    fn stage_left_update(&mut self, tuple: TupleId) {
        let Some(t) = self.arena.get_mut(tuple) else {
            return;
        };
        // A pending insert or update already reads the latest handles
        if t.stage != Stage::None {
            return;
        }
        t.stage = Stage::Update;
        let sink = t.sink;
        if let Some(staged) = self.memory_of(sink).staged_left_mut() {
            staged.updates.insert(tuple);
        }
        self.dirty.insert(sink);
    }

    fn stage_left_delete(&mut self, tuple: TupleId) {
        let Some((stage, sink)) = self.arena.get(tuple).map(|t| (t.stage, t.sink)) else {
            return;
        };
        self.arena.detach(tuple);
        match stage {
            Stage::Delete => return,
            Stage::Insert => {
                // never reached its sink, so it has no children or memory entry
                if let Some(staged) = self.memory_of(sink).staged_left_mut() {
                    staged.inserts.remove(&tuple);
                }
                self.arena.remove(tuple);
                trace!(partition = self.id, tuple, "Pending tuple insert cancelled");
                return;
            }
            Stage::Update => {
                if let Some(staged) = self.memory_of(sink).staged_left_mut() {
                    staged.updates.remove(&tuple);
                }
            }
            Stage::None => {}
        }
        if let Some(t) = self.arena.get_mut(tuple) {
            t.stage = Stage::Delete;
        }
        if let Some(staged) = self.memory_of(sink).staged_left_mut() {
            staged.deletes.insert(tuple);
        }
        self.dirty.insert(sink);
    }

    fn stage_right_insert(&mut self, node: NodeId, handle: FactHandle) {
        let has_bit = self.network.nodes()[node].kind.has_link_bit();
        let memory = self.beta_memory(node);
        memory.staged_right.stage_insert(handle);
        memory.right_count += 1;
        let count = memory.right_count;
        if has_bit && count == 1 {
            self.link_node(node);
        }
        self.dirty.insert(node);
    }

    fn stage_right_update(&mut self, node: NodeId, handle: FactHandle) {
        self.beta_memory(node).staged_right.stage_update(handle);
        self.dirty.insert(node);
    }

    fn stage_right_delete(&mut self, node: NodeId, fact_id: FactId) {
        let has_bit = self.network.nodes()[node].kind.has_link_bit();
        let memory = self.beta_memory(node);
        memory.staged_right.stage_delete(fact_id);
        assert!(memory.right_count > 0, "right input count underflow on node {node}");
        memory.right_count -= 1;
        let count = memory.right_count;
        if has_bit && count == 0 {
            self.unlink_node(node);
        }
        self.dirty.insert(node);
    }

    fn link_node(&mut self, node: NodeId) {
        let network = Arc::clone(&self.network);
        let layouts = network.layouts();
        let Some((segment, position)) = layouts.node_segment[node] else {
            return;
        };
        let Some(memory) = self.segments.get_mut(&segment) else {
            return;
        };
        if !memory.link_node(position) {
            return;
        }
        self.stats.links += 1;
        debug!(partition = self.id, segment, node, "Segment linked");
        for (path, position) in &layouts.segments[segment].paths {
            if let Some(path_memory) = self.paths.get_mut(path) {
                if path_memory.link_segment(*position) {
                    debug!(partition = self.id, rule = layouts.paths[*path].rule, "Path linked");
                    self.dirty.append(&mut self.deferred);
                }
            }
        }
    }

    fn unlink_node(&mut self, node: NodeId) {
        let network = Arc::clone(&self.network);
        let layouts = network.layouts();
        let Some((segment, position)) = layouts.node_segment[node] else {
            return;
        };
        let Some(memory) = self.segments.get_mut(&segment) else {
            return;
        };
        if !memory.unlink_node(position) {
            return;
        }
        self.stats.unlinks += 1;
        debug!(partition = self.id, segment, node, "Segment unlinked");
        for (path, position) in &layouts.segments[segment].paths {
            if let Some(path_memory) = self.paths.get_mut(path) {
                if path_memory.unlink_segment(*position) {
                    debug!(partition = self.id, rule = layouts.paths[*path].rule, "Path unlinked");
                }
            }
        }
    }

    fn node_linked(&self, node: NodeId) -> bool {
        self.network.layouts().node_paths[node]
            .iter()
            .any(|path| self.paths.get(path).is_some_and(PathMemory::is_linked))
    }

    /// Whether the path of `rule` is linked in this partition
    pub fn is_rule_linked(&self, rule: RuleId) -> bool {
        self.paths.get(&rule).is_some_and(PathMemory::is_linked)
    }

    /// Process every staged node in ascending id order
    pub fn evaluate(&mut self) -> ReticleResult<()> {
        self.ensure_owner()?;
        let network = Arc::clone(&self.network);
        while let Some(id) = self.dirty.pop_first() {
            let node = &network.nodes()[id];
            let linked = self.node_linked(id);
            self.stats.evaluations += 1;
            match &node.kind {
                NodeKind::Terminal { rule } => self.evaluate_terminal(id, *rule, linked),
                NodeKind::AsyncSend { .. } => self.evaluate_send(node, linked),
                kind if kind.is_beta() => self.evaluate_beta(node, linked),
                _ => {}
            }
        }
        self.take_failure()
    }

    fn evaluate_beta(&mut self, node: &Node, linked: bool) {
        let Some(NodeMemory::Beta(mut memory)) = self.memories.remove(&node.id) else {
            return;
        };
        let mut left = std::mem::take(&mut memory.staged_left);
        let mut right = std::mem::take(&mut memory.staged_right);

        for fact_id in std::mem::take(&mut right.deletes) {
            self.right_delete(node, &mut memory, fact_id);
        }
        for tuple in std::mem::take(&mut left.deletes) {
            self.left_delete(&mut memory, tuple);
        }
        if linked {
            for tuple in std::mem::take(&mut left.updates) {
                self.left_update(node, &mut memory, tuple);
            }
            for handle in std::mem::take(&mut right.updates) {
                self.right_update(node, &mut memory, handle);
            }
            for tuple in std::mem::take(&mut left.inserts) {
                self.left_insert(node, &mut memory, tuple);
            }
            for handle in std::mem::take(&mut right.inserts) {
                self.right_insert(node, &mut memory, handle);
            }
        } else if left.has_deferred() || right.has_deferred() {
            trace!(partition = self.id, node = node.id, "Deferring staged work on unlinked node");
            memory.staged_left = left;
            memory.staged_right = right;
            self.deferred.insert(node.id);
        }
        self.memories.insert(node.id, NodeMemory::Beta(memory));
    }

    fn left_match(&self, node: &Node, tuple: TupleId) -> Match {
        Match::new(self.arena.chain(tuple), Arc::clone(&node.declarations))
    }

    fn beta_allows(&mut self, node: &Node, left: &Match, right: &FactHandle) -> bool {
        let Some(beta) = node.kind.beta() else {
            return true;
        };
        for constraint in &beta.constraints {
            match constraint.is_allowed(left, right.fact()) {
                Ok(true) => {}
                Ok(false) => return false,
                Err(err) => {
                    let mut fact_ids = left.fact_ids();
                    if !right.is_engine_owned() {
                        fact_ids.push(right.id());
                    }
                    let error = ReticleError::evaluation(
                        self.network.rule_name_of(node.id),
                        node.id,
                        fact_ids,
                        &err,
                    );
                    self.record_failure(error);
                    return false;
                }
            }
        }
        true
    }

    fn right_delete(&mut self, node: &Node, memory: &mut BetaMemory, fact_id: FactId) {
        let Some(right) = memory.right.remove(fact_id) else {
            return;
        };
        for tuple in &right.matched {
            if let Some(entry) = memory.left.get_mut(*tuple) {
                entry.matched.remove(&right.seq);
            }
            self.sync_left(node, memory, *tuple, Touch::None);
        }
    }

    fn left_delete(&mut self, memory: &mut BetaMemory, tuple: TupleId) {
        if let Some(entry) = memory.left.remove(tuple) {
            for seq in entry.matched {
                if let Some(right) = memory.right.get_mut(seq) {
                    right.matched.remove(&tuple);
                }
            }
        }
        memory.results.remove(&tuple);
        self.delete_tuple(tuple);
    }

    /// Stage deletes for a processed tuple's children and free it
    fn delete_tuple(&mut self, tuple: TupleId) {
        let children = self.arena.get(tuple).map(|t| t.children.clone()).unwrap_or_default();
        for child in children {
            self.stage_left_delete(child);
        }
        self.arena.remove(tuple);
    }

    fn left_update(&mut self, node: &Node, memory: &mut BetaMemory, tuple: TupleId) {
        if let Some(t) = self.arena.get_mut(tuple) {
            t.stage = Stage::None;
        }
        let Some(old) = memory.left.get(tuple).map(|e| e.matched.clone()) else {
            return;
        };
        let source = self.left_match(node, tuple);
        let (indexed, key) = left_key(node, &source);
        memory.left.rekey(tuple, key.clone());

        let mut matched = BTreeSet::new();
        for seq in memory.right.candidates(indexed, key.as_ref()) {
            let Some(handle) = memory.right.get(seq).map(|r| r.handle.clone()) else {
                continue;
            };
            if self.beta_allows(node, &source, &handle) {
                matched.insert(seq);
            }
        }
        for seq in old.difference(&matched) {
            if let Some(right) = memory.right.get_mut(*seq) {
                right.matched.remove(&tuple);
            }
        }
        for seq in matched.difference(&old) {
            if let Some(right) = memory.right.get_mut(*seq) {
                right.matched.insert(tuple);
            }
        }
        if let Some(entry) = memory.left.get_mut(tuple) {
            entry.matched = matched;
        }
        self.sync_left(node, memory, tuple, Touch::All);
    }

    fn right_update(&mut self, node: &Node, memory: &mut BetaMemory, handle: FactHandle) {
        let (indexed, key) = right_key(node, &handle);
        let Some(seq) = memory.right.replace(handle.clone(), key.clone()) else {
            return;
        };
        let old = memory.right.get(seq).map(|r| r.matched.clone()).unwrap_or_default();

        let mut matched = BTreeSet::new();
        for tuple in memory.left.candidates(indexed, key.as_ref()) {
            let source = self.left_match(node, tuple);
            if self.beta_allows(node, &source, &handle) {
                matched.insert(tuple);
            }
        }
        if let Some(right) = memory.right.get_mut(seq) {
            right.matched = matched.clone();
        }
        for tuple in old.union(&matched).copied().collect::<Vec<_>>() {
            let was = old.contains(&tuple);
            let is = matched.contains(&tuple);
            if let Some(entry) = memory.left.get_mut(tuple) {
                if is {
                    entry.matched.insert(seq);
                } else {
                    entry.matched.remove(&seq);
                }
            }
            let touch = if was && is { Touch::Right(seq) } else { Touch::None };
            self.sync_left(node, memory, tuple, touch);
        }
    }

    fn left_insert(&mut self, node: &Node, memory: &mut BetaMemory, tuple: TupleId) {
        match self.arena.get_mut(tuple) {
            Some(t) => t.stage = Stage::None,
            None => return,
        }
        let source = self.left_match(node, tuple);
        let (indexed, key) = left_key(node, &source);

        let mut matched = BTreeSet::new();
        for seq in memory.right.candidates(indexed, key.as_ref()) {
            let Some(handle) = memory.right.get(seq).map(|r| r.handle.clone()) else {
                continue;
            };
            if self.beta_allows(node, &source, &handle) {
                matched.insert(seq);
            }
        }
        for seq in &matched {
            if let Some(right) = memory.right.get_mut(*seq) {
                right.matched.insert(tuple);
            }
        }
        memory.left.insert(tuple, LeftEntry { key, matched });
        self.sync_left(node, memory, tuple, Touch::None);
    }

    fn right_insert(&mut self, node: &Node, memory: &mut BetaMemory, handle: FactHandle) {
        let (indexed, key) = right_key(node, &handle);
        let seq = memory.right.insert(handle.clone(), key.clone());
        for tuple in memory.left.candidates(indexed, key.as_ref()) {
            let source = self.left_match(node, tuple);
            if !self.beta_allows(node, &source, &handle) {
                continue;
            }
            if let Some(right) = memory.right.get_mut(seq) {
                right.matched.insert(tuple);
            }
            if let Some(entry) = memory.left.get_mut(tuple) {
                entry.matched.insert(seq);
            }
            self.sync_left(node, memory, tuple, Touch::None);
        }
    }

    /// Reconcile the children of a left tuple with its current matches
    fn sync_left(&mut self, node: &Node, memory: &mut BetaMemory, tuple: TupleId, touch: Touch) {
        let Some(entry) = memory.left.get(tuple) else {
            return;
        };
        if matches!(node.kind, NodeKind::AsyncReceive { .. }) {
            if touch == Touch::All {
                self.recheck_messages(node, tuple);
            }
            return;
        }
        let mut refresh = false;
        let mut result: Option<Fact> = None;
        let mut desired: Vec<(TupleContext, Option<FactHandle>)> = match &node.kind {
            NodeKind::Join(_) => entry
                .matched
                .iter()
                .filter_map(|seq| {
                    memory.right.get(*seq).map(|r| (TupleContext::Right(*seq), Some(r.handle.clone())))
                })
                .collect(),
            NodeKind::Not(_) if entry.matched.is_empty() => vec![(TupleContext::Derived, None)],
            NodeKind::Exists(_) if !entry.matched.is_empty() => vec![(TupleContext::Derived, None)],
            NodeKind::Not(_) | NodeKind::Exists(_) => Vec::new(),
            NodeKind::Accumulate { accumulator, filter, .. } => {
                let facts: Vec<&Fact> = entry
                    .matched
                    .iter()
                    .filter_map(|seq| memory.right.get(*seq))
                    .map(|r| r.handle.fact())
                    .collect();
                let value = match accumulator.accumulate(&facts) {
                    Ok(value) => value,
                    Err(err) => {
                        let error = ReticleError::evaluation(
                            self.network.rule_name_of(node.id),
                            node.id,
                            self.chain_fact_ids(tuple),
                            &err,
                        );
                        self.record_failure(error);
                        return;
                    }
                };
                let fact = Fact::new(RESULT_KIND).with_field(RESULT_FIELD, value.clone());
                let passes = match filter {
                    None => true,
                    Some(filter) => match filter.is_allowed(&fact) {
                        Ok(passes) => passes,
                        Err(err) => {
                            let error = ReticleError::evaluation(
                                self.network.rule_name_of(node.id),
                                node.id,
                                self.chain_fact_ids(tuple),
                                &err,
                            );
                            self.record_failure(error);
                            false
                        }
                    },
                };
                refresh = memory.results.get(&tuple) != Some(&value);
                memory.results.insert(tuple, value);
                if passes {
                    result = Some(fact);
                    vec![(TupleContext::Derived, None)]
                } else {
                    Vec::new()
                }
            }
            _ => return,
        };

        let children: Vec<(TupleId, NodeId, TupleContext, Option<FactHandle>)> = self
            .arena
            .get(tuple)
            .map(|t| t.children.clone())
            .unwrap_or_default()
            .into_iter()
            .filter_map(|child| self.arena.get(child))
            .map(|child| (child.id, child.sink, child.context, child.handle.clone()))
            .collect();

        if let Some(fact) = result {
            let previous = children.iter().find_map(|child| child.3.clone());
            let handle = match previous {
                Some(previous) if refresh || touch == Touch::All => {
                    self.memory.handles.updated(&previous, fact)
                }
                Some(previous) => previous,
                None => self.memory.handles.engine_handle(fact),
            };
            for slot in &mut desired {
                slot.1 = Some(handle.clone());
            }
        }

        for sink in &node.left_sinks {
            for (context, handle) in &desired {
                let existing = children.iter().find(|c| c.1 == *sink && c.2 == *context);
                match existing {
                    Some(child) => {
                        let stale = refresh
                            || match touch {
                                Touch::All => true,
                                Touch::Right(seq) => *context == TupleContext::Right(seq),
                                Touch::None => false,
                            };
                        if stale {
                            if let Some(t) = self.arena.get_mut(child.0) {
                                t.handle = handle.clone();
                            }
                            self.stage_left_update(child.0);
                        }
                    }
                    None => {
                        let child = self.arena.create(Some(tuple), handle.clone(), *sink, *context);
                        self.stage_left_insert(child);
                    }
                }
            }
        }
        for child in &children {
            if !desired.iter().any(|(context, _)| *context == child.2) {
                self.stage_left_delete(child.0);
            }
        }
    }

    /// An updated left tuple keeps the message children it still satisfies
    fn recheck_messages(&mut self, node: &Node, tuple: TupleId) {
        let children: Vec<(TupleId, Option<FactHandle>)> = self
            .arena
            .get(tuple)
            .map(|t| t.children.clone())
            .unwrap_or_default()
            .into_iter()
            .filter_map(|child| self.arena.get(child).map(|c| (c.id, c.handle.clone())))
            .collect();
        if children.is_empty() {
            return;
        }
        let source = self.left_match(node, tuple);
        for (child, handle) in children {
            match handle {
                Some(handle) if self.beta_allows(node, &source, &handle) => self.stage_left_update(child),
                _ => self.stage_left_delete(child),
            }
        }
    }

    fn chain_fact_ids(&self, tuple: TupleId) -> Vec<FactId> {
        self.arena
            .chain(tuple)
            .iter()
            .flatten()
            .filter(|h| !h.is_engine_owned())
            .map(FactHandle::id)
            .collect()
    }

    fn evaluate_terminal(&mut self, node: NodeId, rule: RuleId, linked: bool) {
        let Some(NodeMemory::Sink(mut memory)) = self.memories.remove(&node) else {
            return;
        };
        let mut staged = std::mem::take(&mut memory.staged);
        for tuple in std::mem::take(&mut staged.deletes) {
            memory.tuples.remove(&tuple);
            self.agenda.cancel(tuple);
            self.arena.remove(tuple);
        }
        if linked {
            let salience = self.network.rules().get(rule).map_or(0, |r| r.salience);
            for tuple in std::mem::take(&mut staged.updates) {
                if let Some(t) = self.arena.get_mut(tuple) {
                    t.stage = Stage::None;
                }
                // an updated match fires again
                self.agenda.add(rule, salience, tuple);
            }
            for tuple in std::mem::take(&mut staged.inserts) {
                if let Some(t) = self.arena.get_mut(tuple) {
                    t.stage = Stage::None;
                }
                memory.tuples.insert(tuple);
                self.agenda.add(rule, salience, tuple);
            }
        } else if staged.has_deferred() {
            memory.staged = staged;
            self.deferred.insert(node);
        }
        self.memories.insert(node, NodeMemory::Sink(memory));
    }

    fn evaluate_send(&mut self, node: &Node, linked: bool) {
        let Some(NodeMemory::Sink(mut memory)) = self.memories.remove(&node.id) else {
            return;
        };
        let mut staged = std::mem::take(&mut memory.staged);
        for tuple in std::mem::take(&mut staged.deletes) {
            memory.tuples.remove(&tuple);
            self.arena.remove(tuple);
        }
        if linked {
            // the message key is per match, so an update cannot produce a new message
            for tuple in std::mem::take(&mut staged.updates) {
                if let Some(t) = self.arena.get_mut(tuple) {
                    t.stage = Stage::None;
                }
            }
            for tuple in std::mem::take(&mut staged.inserts) {
                if let Some(t) = self.arena.get_mut(tuple) {
                    t.stage = Stage::None;
                }
                memory.tuples.insert(tuple);
                self.dispatch(node, tuple);
            }
        } else if staged.has_deferred() {
            memory.staged = staged;
            self.deferred.insert(node.id);
        }
        self.memories.insert(node.id, NodeMemory::Sink(memory));
    }

    /// Hand a match to the worker pool; every result that passes the send
    /// filter comes back as its own message
    fn dispatch(&self, node: &Node, tuple: TupleId) {
        let NodeKind::AsyncSend { message_id, computation, filter } = &node.kind else {
            return;
        };
        let source = self.left_match(node, tuple);
        let session = self.memory.id;
        let send_node = node.id;
        let memory = Arc::clone(&self.memory);
        let computation = Arc::clone(computation);
        let filter = filter.clone();
        let message_id = message_id.clone();
        let rule = self.network.rule_name_of(node.id).unwrap_or_default().to_string();
        let partition = self.id;

        memory.tracker.submitted();
        debug!(partition, node = node.id, tuple, message_id = %message_id, "Async computation submitted");
        WorkerPool::spawn(self.network.config().async_workers, move || {
            let outcome = computation
                .compute(&source)
                .and_then(|values| filter.select(&message_id, &source, values));
            if memory.is_disposed() {
                warn!(message_id = %message_id, "Dropping async result for a disposed session");
            } else {
                match outcome {
                    Ok(selected) => {
                        trace!(message_id = %message_id, results = selected.len(), "Publishing async results");
                        for (index, value) in selected {
                            let key = MessageKey { session, send_node, tuple, index };
                            let message = AsyncMessage { message_id: message_id.clone(), key, value };
                            MessageCoordinator::global().propagate(message);
                        }
                    }
                    Err(err) => {
                        warn!(message_id = %message_id, rule = %rule, error = %err, "Async computation failed");
                        let error = ReticleError::async_delivery(&message_id, &rule, format!("{err:#}"));
                        memory.enqueue(partition, PropagationEntry::AsyncError { error });
                    }
                }
            }
            memory.tracker.completed();
        });
    }

    fn has_ready_activation(&self) -> bool {
        self.agenda.iter().any(|a| self.is_rule_linked(a.rule))
    }

    /// Fire the best activation on a linked path; false when there is none
    pub fn fire_next(&mut self) -> ReticleResult<bool> {
        self.ensure_owner()?;
        let network = Arc::clone(&self.network);
        let paths = &self.paths;
        let Some(activation) =
            self.agenda.pop_next(|rule| paths.get(&rule).is_some_and(PathMemory::is_linked))
        else {
            return Ok(false);
        };
        let rule = network.rules().get(activation.rule).ok_or_else(|| {
            ReticleError::internal_component("partition", format!("Unknown rule {}", activation.rule))
        })?;
        let Some(action) = &rule.action else {
            return Err(ReticleError::internal_component(
                "partition",
                format!("Rule '{}' has no action to fire", rule.name),
            ));
        };

        let source = Match::new(self.arena.chain(activation.tuple), Arc::clone(&rule.declarations));
        debug!(partition = self.id, rule = %rule.name, tuple = activation.tuple, "Firing rule");
        let mut context = ActionContext::new(&self.memory, &rule.name, self.id);
        let outcome = action.execute(&source, &mut context);
        self.stats.fired += 1;
        outcome.map_err(|err| {
            ReticleError::evaluation(Some(&rule.name), rule.end, source.fact_ids(), &err)
        })?;
        Ok(true)
    }

    /// Partition fire loop. Returns the number of rules fired here.
    pub(crate) fn run(&mut self, control: &FireControl) -> ReticleResult<usize> {
        self.bind_owner();
        let mut active = true;
        let result = self.run_loop(control, &mut active);
        if active {
            self.memory.tracker.sleep();
        }
        self.release_owner();
        if let Err(error) = &result {
            debug!(partition = self.id, error = %error, "Partition loop aborted");
            control.abort();
        }
        result
    }

    fn run_loop(&mut self, control: &FireControl, active: &mut bool) -> ReticleResult<usize> {
        let memory = Arc::clone(&self.memory);
        let poll = self.network.config().idle_poll();
        let mut fired = 0;
        loop {
            if control.should_stop(&memory) {
                break;
            }
            while let Some(entry) = memory.queue(self.id).try_pop() {
                if !*active {
                    memory.tracker.wake();
                    *active = true;
                }
                let outcome = self.execute(entry.entry);
                memory.tracker.completed();
                outcome?;
            }
            self.evaluate()?;
            if control.should_stop(&memory) {
                break;
            }
            if self.has_ready_activation() {
                if !control.reserve() {
                    break;
                }
                if self.fire_next()? {
                    fired += 1;
                }
                continue;
            }

            if self.expire_messages() {
                continue;
            }
            if *active {
                memory.tracker.sleep();
                *active = false;
            }
            if control.settle_if_quiescent(&memory) {
                break;
            }
            if let Some(entry) = memory.queue(self.id).pop_timeout(poll) {
                memory.tracker.wake();
                *active = true;
                let outcome = self.execute(entry.entry);
                memory.tracker.completed();
                outcome?;
            }
        }
        trace!(partition = self.id, fired, "Partition loop finished");
        Ok(fired)
    }

    /// Drain the queue and evaluate without firing. Returns whether any
    /// entry was executed.
    pub(crate) fn settle(&mut self) -> ReticleResult<bool> {
        self.bind_owner();
        let result = self.settle_inner();
        self.release_owner();
        result
    }

    fn settle_inner(&mut self) -> ReticleResult<bool> {
        let memory = Arc::clone(&self.memory);
        let mut executed = false;
        while let Some(entry) = memory.queue(self.id).try_pop() {
            executed = true;
            let outcome = self.execute(entry.entry);
            memory.tracker.completed();
            outcome?;
        }
        self.evaluate()?;
        Ok(executed)
    }

    /// Activations on linked paths, in firing order
    pub fn activations(&self) -> Vec<ActivationInfo> {
        self.agenda
            .iter()
            .filter(|a| self.is_rule_linked(a.rule))
            .map(|a| ActivationInfo {
                rule: self.network.rules().get(a.rule).map(|r| r.name.clone()).unwrap_or_default(),
                salience: a.salience,
                partition: self.id,
                fact_ids: self.chain_fact_ids(a.tuple),
            })
            .collect()
    }

    pub fn ready_activations(&self) -> usize {
        self.agenda.iter().filter(|a| self.is_rule_linked(a.rule)).count()
    }

    pub fn stats(&self) -> PartitionStats {
        PartitionStats { tuples: self.arena.len(), activations: self.agenda.len(), ..self.stats }
    }

    /// Drop every memory; used when the session is disposed
    pub(crate) fn clear(&mut self) {
        self.memories.clear();
        self.arena = TupleArena::new();
        self.fact_refs.clear();
        self.agenda.clear();
        self.dirty.clear();
        self.deferred.clear();
        self.delivered.clear();
        debug!(partition = self.id, "Partition memories cleared");
    }
}

fn left_key(node: &Node, source: &Match) -> (bool, Option<FactValue>) {
    match node.kind.beta().and_then(|b| b.index.as_ref()) {
        Some(index) => (true, index.left_key(source)),
        None => (false, None),
    }
}

fn right_key(node: &Node, handle: &FactHandle) -> (bool, Option<FactValue>) {
    match node.kind.beta().and_then(|b| b.index.as_ref()) {
        Some(index) => (true, index.right_key(handle.fact())),
        None => (false, None),
    }
}
