//! Sessions: working memory plus the fire loop over one network
//!
//! A [`Session`] holds the facts inserted into it and one [`PartitionState`]
//! per used partition. Inserts, updates and retracts only enqueue propagation
//! entries; partitions apply them when rules fire or when the session is
//! settled. With more than one partition each fire call runs every partition
//! loop on its own scoped thread and returns once all of them are quiescent.

use crate::error::{ReticleError, ReticleResult};
use crate::exchange::MessageCoordinator;
use crate::handle::{FactHandle, FactHandleFactory};
use crate::network::Network;
use crate::partition::{ActivationInfo, FireControl, PartitionState, PartitionStats};
use crate::propagation::{PropagationEntry, PropagationQueue, QuiescenceTracker, Sequenced};
use crate::types::{Fact, FactId, FactValue, INITIAL_FACT_KIND, PartitionId};
use dashmap::DashMap;
use serde::Serialize;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use std::thread;
use tracing::{debug, error, info, instrument, trace, warn};
use uuid::Uuid;

/// Named values shared between actions and the caller
#[derive(Debug, Default)]
pub struct Globals {
    values: DashMap<String, FactValue>,
}

impl Globals {
    pub fn get(&self, name: &str) -> Option<FactValue> {
        self.values.get(name).map(|entry| entry.value().clone())
    }

    pub fn set(&self, name: impl Into<String>, value: impl Into<FactValue>) {
        self.values.insert(name.into(), value.into());
    }

    /// Push onto the list stored under `name`, creating it when absent. A
    /// scalar already stored there becomes the first list element.
    pub fn append(&self, name: impl Into<String>, value: impl Into<FactValue>) {
        let value = value.into();
        let mut entry = self.values.entry(name.into()).or_insert_with(|| FactValue::List(Vec::new()));
        match entry.value_mut() {
            FactValue::List(items) => items.push(value),
            other => {
                let first = std::mem::replace(other, FactValue::Null);
                *other = FactValue::List(vec![first, value]);
            }
        }
    }

    pub fn remove(&self, name: &str) -> Option<FactValue> {
        self.values.remove(name).map(|(_, value)| value)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// State shared by a session, its partitions, actions and async workers
pub struct WorkingMemory {
    pub(crate) id: Uuid,
    network: Arc<Network>,
    pub(crate) handles: FactHandleFactory,
    live: DashMap<FactId, FactHandle>,
    queues: Vec<PropagationQueue>,
    pub(crate) tracker: QuiescenceTracker,
    pub(crate) globals: Globals,
    halted: AtomicBool,
    /// Halt requested while nothing was firing
    halt_pending: AtomicBool,
    firing: AtomicBool,
    disposed: AtomicBool,
    /// Set once partition state is found corrupted; the session stays stopped
    poisoned: AtomicBool,
    seq: AtomicU64,
}

impl WorkingMemory {
    fn new(network: Arc<Network>, partitions: usize) -> (Self, FactHandle) {
        let handles = FactHandleFactory::new();
        let initial = handles.engine_handle(Fact::new(INITIAL_FACT_KIND));
        let memory = Self {
            id: Uuid::new_v4(),
            network,
            handles,
            live: DashMap::new(),
            queues: (0..partitions).map(|_| PropagationQueue::new()).collect(),
            tracker: QuiescenceTracker::default(),
            globals: Globals::default(),
            halted: AtomicBool::new(false),
            halt_pending: AtomicBool::new(false),
            firing: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            poisoned: AtomicBool::new(false),
            seq: AtomicU64::new(0),
        };
        (memory, initial)
    }

    fn ensure_live(&self, operation: &str) -> ReticleResult<()> {
        if self.poisoned.load(Ordering::SeqCst) {
            return Err(ReticleError::internal_component(
                "session",
                format!("Cannot {operation}: the session stopped after a partition failure"),
            ));
        }
        if self.is_disposed() {
            return Err(ReticleError::session(operation, "Session has been disposed"));
        }
        Ok(())
    }

    pub fn insert(&self, fact: Fact) -> ReticleResult<FactId> {
        self.ensure_live("insert")?;
        let handle = self.handles.new_handle(fact);
        let fact_id = handle.id();
        self.live.insert(fact_id, handle.clone());
        trace!(session = %self.id, fact = fact_id, kind = %handle.kind(), "Fact inserted");
        let kind = handle.kind().to_string();
        self.broadcast(&kind, PropagationEntry::Insert { handle });
        Ok(fact_id)
    }

    /// Replace the payload of a live fact. The object type cannot change.
    pub fn update(&self, fact_id: FactId, fact: Fact) -> ReticleResult<()> {
        self.ensure_live("update")?;
        let previous = self
            .live
            .get(&fact_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| ReticleError::unknown_fact("update", fact_id))?;
        if previous.kind() != fact.kind {
            return Err(ReticleError::session(
                "update",
                format!(
                    "Fact {fact_id} is a '{}' and cannot become a '{}'",
                    previous.kind(),
                    fact.kind
                ),
            ));
        }
        let current = self.handles.updated(&previous, fact);
        self.live.insert(fact_id, current.clone());
        trace!(session = %self.id, fact = fact_id, recency = current.recency(), "Fact updated");
        let kind = current.kind().to_string();
        self.broadcast(&kind, PropagationEntry::Update { previous, current });
        Ok(())
    }

    pub fn retract(&self, fact_id: FactId) -> ReticleResult<()> {
        self.ensure_live("retract")?;
        let (_, handle) = self
            .live
            .remove(&fact_id)
            .ok_or_else(|| ReticleError::unknown_fact("retract", fact_id))?;
        trace!(session = %self.id, fact = fact_id, "Fact retracted");
        let kind = handle.kind().to_string();
        self.broadcast(&kind, PropagationEntry::Delete { handle });
        Ok(())
    }

    fn broadcast(&self, kind: &str, entry: PropagationEntry) {
        for partition in self.network.partitions_for(kind) {
            self.enqueue(*partition, entry.clone());
        }
    }

    /// Queue an entry for one partition. Pending is raised before the push.
    pub(crate) fn enqueue(&self, partition: PartitionId, entry: PropagationEntry) {
        let Some(queue) = self.queues.get(partition) else {
            warn!(session = %self.id, partition, entry = entry.name(), "Dropping entry for unknown partition");
            return;
        };
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        self.tracker.submitted();
        queue.push(Sequenced { seq, entry });
    }

    pub(crate) fn queue(&self, partition: PartitionId) -> &PropagationQueue {
        &self.queues[partition]
    }

    /// Stop the running fire call. With nothing firing the halt is kept for
    /// the next fire call, which honours it only if it is `fire_until_halt`.
    pub fn halt(&self) {
        // latched before reading `firing` so a fire call starting now sees it
        self.halt_pending.store(true, Ordering::SeqCst);
        if !self.firing.load(Ordering::SeqCst) {
            debug!(session = %self.id, "Halt latched for the next fire call");
            return;
        }
        self.halted.store(true, Ordering::SeqCst);
        for partition in 0..self.queues.len() {
            self.enqueue(partition, PropagationEntry::Halt);
        }
        debug!(session = %self.id, "Halt requested");
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Stop the session for good after its partition state became unreliable
    fn poison(&self, partition: PartitionId) -> ReticleError {
        if !self.poisoned.swap(true, Ordering::SeqCst) {
            error!(session = %self.id, partition, "Partition state corrupted, stopping session");
            self.disposed.store(true, Ordering::SeqCst);
            self.halted.store(true, Ordering::SeqCst);
            MessageCoordinator::global().deregister_session(self.id);
        }
        ReticleError::internal_component(
            "session",
            format!("Partition {partition} panicked mid-evaluation; the session is stopped"),
        )
    }

    pub fn is_firing(&self) -> bool {
        self.firing.load(Ordering::SeqCst)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }
}

/// Clears the halt and firing flags when a fire call ends, however it ends.
/// A halt never outlives the call it stopped.
struct FiringGuard<'a>(&'a WorkingMemory);

impl Drop for FiringGuard<'_> {
    fn drop(&mut self) {
        self.0.halted.store(false, Ordering::SeqCst);
        self.0.halt_pending.store(false, Ordering::SeqCst);
        self.0.firing.store(false, Ordering::SeqCst);
    }
}

/// Snapshot of session counters
#[derive(Debug, Clone, Serialize)]
pub struct SessionStats {
    pub session: Uuid,
    pub facts: usize,
    pub pending: usize,
    pub partitioned: bool,
    pub partitions: Vec<PartitionStats>,
}

impl SessionStats {
    pub fn fired(&self) -> u64 {
        self.partitions.iter().map(|p| p.fired).sum()
    }
}

/// Working memory and evaluation state over one network
pub struct Session {
    network: Arc<Network>,
    memory: Arc<WorkingMemory>,
    partitions: Vec<Mutex<PartitionState>>,
}

impl Session {
    #[instrument(skip(network))]
    pub fn new(network: Arc<Network>) -> ReticleResult<Self> {
        network.config().validate()?;
        let count = network.used_partitions().max(1);
        let (memory, initial) = WorkingMemory::new(Arc::clone(&network), count);
        let memory = Arc::new(memory);
        let partitions = (0..count)
            .map(|id| Mutex::new(PartitionState::new(id, Arc::clone(&network), Arc::clone(&memory))))
            .collect();

        for receiver in network.receivers() {
            let weak = Arc::downgrade(&memory);
            let (node, partition) = (receiver.node, receiver.partition);
            MessageCoordinator::global().register_receiver(
                &receiver.message_id,
                memory.id,
                node,
                move |message| {
                    if let Some(memory) = weak.upgrade() {
                        if !memory.is_disposed() {
                            memory.enqueue(partition, PropagationEntry::AsyncReceive { node, message });
                        }
                    }
                },
            );
        }
        memory.broadcast(INITIAL_FACT_KIND, PropagationEntry::Insert { handle: initial });

        info!(
            session = %memory.id,
            partitions = count,
            partitioned = network.is_partitioned(),
            rules = network.rules().len(),
            "Session created"
        );
        Ok(Self { network, memory, partitions })
    }

    pub fn id(&self) -> Uuid {
        self.memory.id
    }

    pub fn network(&self) -> &Arc<Network> {
        &self.network
    }

    pub fn insert(&self, fact: Fact) -> ReticleResult<FactId> {
        self.memory.insert(fact)
    }

    pub fn update(&self, fact_id: FactId, fact: Fact) -> ReticleResult<()> {
        self.memory.update(fact_id, fact)
    }

    pub fn retract(&self, fact_id: FactId) -> ReticleResult<()> {
        self.memory.retract(fact_id)
    }

    /// Current payload of a live fact
    pub fn fact(&self, fact_id: FactId) -> Option<Arc<Fact>> {
        self.memory.live.get(&fact_id).map(|entry| entry.value().shared_fact())
    }

    /// Live application facts
    pub fn fact_count(&self) -> usize {
        self.memory.live.len()
    }

    pub fn globals(&self) -> &Globals {
        &self.memory.globals
    }

    pub fn is_partitioned(&self) -> bool {
        self.network.is_partitioned()
    }

    pub fn used_partitions(&self) -> usize {
        self.partitions.len()
    }

    pub fn is_firing(&self) -> bool {
        self.memory.is_firing()
    }

    pub fn is_disposed(&self) -> bool {
        self.memory.is_disposed()
    }

    /// Fire until no linked activation is left and every queue is drained.
    /// Returns the number of rules fired.
    pub fn fire_all_rules(&self) -> ReticleResult<usize> {
        self.fire(FireControl::new(None, false))
    }

    /// As [`Session::fire_all_rules`], stopping after `max` firings in total
    pub fn fire_all_rules_with_limit(&self, max: usize) -> ReticleResult<usize> {
        self.fire(FireControl::new(Some(max), false))
    }

    /// Keep evaluating, waiting for new work when idle, until [`Session::halt`]
    pub fn fire_until_halt(&self) -> ReticleResult<usize> {
        self.fire(FireControl::new(None, true))
    }

    pub fn halt(&self) {
        self.memory.halt();
    }

    #[instrument(skip(self, control), fields(session = %self.memory.id))]
    fn fire(&self, control: FireControl) -> ReticleResult<usize> {
        self.memory.ensure_live("fire")?;
        if self
            .memory
            .firing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(ReticleError::concurrent_firing(
                "Another fire call is already running on this session",
            ));
        }
        let _firing = FiringGuard(&self.memory);
        if self.memory.halt_pending.swap(false, Ordering::SeqCst) {
            let honoured = control.until_halt();
            self.memory.halted.store(honoured, Ordering::SeqCst);
            debug!(honoured, "Consumed halt requested before the fire call");
        }

        let mut guards = self.lock_all()?;
        self.memory.tracker.start(guards.len());
        debug!(partitions = guards.len(), pending = self.memory.tracker.pending(), "Fire call started");

        let fired = match guards.as_mut_slice() {
            [single] => single.run(&control)?,
            many => self.fire_parallel(many, &control)?,
        };
        info!(fired, halted = self.memory.is_halted(), "Fire call finished");
        Ok(fired)
    }

    fn fire_parallel(
        &self,
        guards: &mut [MutexGuard<'_, PartitionState>],
        control: &FireControl,
    ) -> ReticleResult<usize> {
        thread::scope(|scope| {
            let mut handles = Vec::with_capacity(guards.len());
            let mut first_error: Option<ReticleError> = None;

            let memory: &WorkingMemory = &self.memory;
            for guard in guards.iter_mut() {
                let state: &mut PartitionState = guard;
                let id = state.id();
                let spawned = thread::Builder::new()
                    .name(format!("reticle-partition-{id}"))
                    .spawn_scoped(scope, move || {
                        panic::catch_unwind(AssertUnwindSafe(|| state.run(control))).unwrap_or_else(
                            |_| {
                                control.abort();
                                Err(memory.poison(id))
                            },
                        )
                    });
                match spawned {
                    Ok(handle) => handles.push(handle),
                    Err(err) => {
                        // this loop never starts, so it never reports idle on its own
                        self.memory.tracker.sleep();
                        control.abort();
                        first_error.get_or_insert(ReticleError::concurrency(
                            id,
                            format!("Failed to spawn partition thread: {err}"),
                        ));
                    }
                }
            }

            let mut total = 0;
            for handle in handles {
                match handle.join() {
                    Ok(Ok(fired)) => total += fired,
                    Ok(Err(error)) => {
                        first_error.get_or_insert(error);
                    }
                    Err(_) => {
                        first_error.get_or_insert(ReticleError::internal("Partition thread panicked"));
                    }
                }
            }
            first_error.map_or(Ok(total), Err)
        })
    }

    /// Apply every queued entry and evaluate without firing. Returns the
    /// number of activations whose path is linked.
    #[instrument(skip(self), fields(session = %self.memory.id))]
    pub fn settle(&self) -> ReticleResult<usize> {
        self.memory.ensure_live("settle")?;
        if self.memory.is_firing() {
            return Err(ReticleError::concurrent_firing("Cannot settle while rules are firing"));
        }
        let mut guards = self.lock_all()?;
        loop {
            let mut executed = false;
            for guard in guards.iter_mut() {
                executed |= guard.settle()?;
            }
            if !executed {
                break;
            }
        }
        Ok(guards.iter().map(|guard| guard.ready_activations()).sum())
    }

    /// Pending activations on linked paths, per partition in firing order
    pub fn activations(&self) -> ReticleResult<Vec<ActivationInfo>> {
        Ok(self.lock_all()?.iter().flat_map(|guard| guard.activations()).collect())
    }

    pub fn is_rule_linked(&self, name: &str) -> ReticleResult<bool> {
        let rule = self
            .network
            .rule(name)
            .ok_or_else(|| ReticleError::session("is_rule_linked", format!("Unknown rule '{name}'")))?;
        let guard = self.lock_partition(rule.partition)?;
        Ok(guard.is_rule_linked(rule.id))
    }

    pub fn stats(&self) -> ReticleResult<SessionStats> {
        let partitions = self.lock_all()?.iter().map(|guard| guard.stats()).collect();
        Ok(SessionStats {
            session: self.memory.id,
            facts: self.fact_count(),
            pending: self.memory.tracker.pending(),
            partitioned: self.network.is_partitioned(),
            partitions,
        })
    }

    fn lock_partition(&self, id: PartitionId) -> ReticleResult<MutexGuard<'_, PartitionState>> {
        let partition = self.partitions.get(id).ok_or_else(|| {
            ReticleError::internal_component("session", format!("Unknown partition {id}"))
        })?;
        match partition.try_lock() {
            Ok(guard) => Ok(guard),
            Err(TryLockError::Poisoned(_)) => Err(self.memory.poison(id)),
            Err(TryLockError::WouldBlock) => Err(ReticleError::concurrency(
                id,
                format!("Partition {id} is being evaluated by another thread"),
            )),
        }
    }

    fn lock_all(&self) -> ReticleResult<Vec<MutexGuard<'_, PartitionState>>> {
        (0..self.partitions.len()).map(|id| self.lock_partition(id)).collect()
    }

    /// Release receivers and memories. Running fire calls stop at their next
    /// iteration; later calls fail with a session error.
    pub fn dispose(&self) {
        if self.memory.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        MessageCoordinator::global().deregister_session(self.memory.id);
        self.memory.halted.store(true, Ordering::SeqCst);
        for partition in &self.partitions {
            if let Ok(mut guard) = partition.try_lock() {
                guard.clear();
            }
        }
        info!(session = %self.memory.id, "Session disposed");
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.memory.id)
            .field("partitions", &self.partitions.len())
            .field("facts", &self.fact_count())
            .field("firing", &self.is_firing())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::rule::{Pattern, RuleDefinition};
    use crate::types::Operator;

    fn single(rules: Vec<RuleDefinition>) -> Session {
        let network = Network::from_rules(&EngineConfig::single_threaded(), rules).unwrap();
        Session::new(Arc::new(network)).unwrap()
    }

    fn counter(name: &str, kind: &str) -> RuleDefinition {
        let global = name.to_string();
        RuleDefinition::new(name).pattern(Pattern::new(kind).bind("f")).then(move |_, ctx| {
            ctx.globals().append(global.clone(), 1);
            Ok(())
        })
    }

    #[test]
    fn test_globals_append_wraps_scalars() {
        let globals = Globals::default();
        globals.append("log", "a");
        globals.append("log", "b");
        assert_eq!(
            globals.get("log"),
            Some(FactValue::List(vec![FactValue::from("a"), FactValue::from("b")]))
        );

        globals.set("n", 1);
        globals.append("n", 2);
        assert_eq!(globals.get("n"), Some(FactValue::List(vec![1.into(), 2.into()])));
        assert_eq!(globals.remove("n"), Some(FactValue::List(vec![1.into(), 2.into()])));
        assert_eq!(globals.len(), 1);
    }

    #[test]
    fn test_insert_update_retract_lifecycle() {
        let session = single(vec![counter("seen", "A")]);
        let id = session.insert(Fact::new("A").with_field("v", 1)).unwrap();
        assert_eq!(session.fact_count(), 1);

        session.update(id, Fact::new("A").with_field("v", 2)).unwrap();
        assert_eq!(session.fact(id).unwrap().get_field("v"), Some(&FactValue::Integer(2)));

        let err = session.update(id, Fact::new("B")).unwrap_err();
        assert!(matches!(err, ReticleError::Session { .. }));

        session.retract(id).unwrap();
        assert_eq!(session.fact_count(), 0);
        assert!(matches!(session.retract(id), Err(ReticleError::Session { fact_id: Some(_), .. })));
    }

    #[test]
    fn test_fire_all_rules_fires_each_match_once() {
        let session = single(vec![counter("seen", "A")]);
        for v in 0..3 {
            session.insert(Fact::new("A").with_field("v", v)).unwrap();
        }
        assert_eq!(session.settle().unwrap(), 3);
        assert_eq!(session.fire_all_rules().unwrap(), 3);
        assert_eq!(session.fire_all_rules().unwrap(), 0);
        assert_eq!(
            session.globals().get("seen"),
            Some(FactValue::List(vec![1.into(), 1.into(), 1.into()]))
        );
    }

    #[test]
    fn test_fire_limit_leaves_remaining_activations() {
        let session = single(vec![counter("seen", "A")]);
        for v in 0..5 {
            session.insert(Fact::new("A").with_field("v", v)).unwrap();
        }
        assert_eq!(session.fire_all_rules_with_limit(2).unwrap(), 2);
        assert_eq!(session.settle().unwrap(), 3);
        assert_eq!(session.fire_all_rules().unwrap(), 3);
    }

    #[test]
    fn test_salience_orders_firing() {
        let high = RuleDefinition::new("high").salience(10).pattern(Pattern::new("A").bind("a")).then(
            |_, ctx| {
                ctx.globals().append("order", "high");
                Ok(())
            },
        );
        let low = RuleDefinition::new("low").pattern(Pattern::new("A").bind("a")).then(|_, ctx| {
            ctx.globals().append("order", "low");
            Ok(())
        });
        let session = single(vec![low, high]);
        session.insert(Fact::new("A")).unwrap();
        session.fire_all_rules().unwrap();
        assert_eq!(
            session.globals().get("order"),
            Some(FactValue::List(vec!["high".into(), "low".into()]))
        );
    }

    #[test]
    fn test_action_inserts_chain_within_one_fire_call() {
        let derive = RuleDefinition::new("derive")
            .pattern(Pattern::new("A").bind_field("v", "v").field("v", Operator::GreaterThan, 0))
            .then(|m, ctx| {
                let v = m.value("v").cloned().unwrap_or(FactValue::Null);
                ctx.insert(Fact::new("B").with_field("v", v))?;
                Ok(())
            });
        let session = single(vec![derive, counter("derived", "B")]);
        session.insert(Fact::new("A").with_field("v", 4)).unwrap();
        assert_eq!(session.fire_all_rules().unwrap(), 2);
        assert_eq!(session.fact_count(), 2);
    }

    #[test]
    fn test_halt_outside_fire_only_stops_fire_until_halt() {
        let session = single(vec![counter("seen", "A")]);
        session.halt();
        session.insert(Fact::new("A")).unwrap();
        assert_eq!(session.fire_all_rules().unwrap(), 1, "fire_all_rules discards the latched halt");

        session.insert(Fact::new("A")).unwrap();
        session.halt();
        assert_eq!(session.fire_until_halt().unwrap(), 0);
        assert!(!session.memory.is_halted());
        assert_eq!(session.fire_all_rules().unwrap(), 1);
    }

    #[test]
    fn test_panicking_action_stops_the_session() {
        let rule = RuleDefinition::new("boom").pattern(Pattern::new("A")).then(|_, _| panic!("action blew up"));
        let session = single(vec![rule, counter("seen", "B")]);
        session.insert(Fact::new("A")).unwrap();

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| session.fire_all_rules()));
        assert!(outcome.is_err());
        assert!(!session.is_firing());

        assert!(matches!(session.fire_all_rules(), Err(ReticleError::Internal { .. })));
        assert!(session.is_disposed());
        assert!(matches!(session.insert(Fact::new("B")), Err(ReticleError::Internal { .. })));
        assert!(matches!(session.settle(), Err(ReticleError::Internal { .. })));
        assert!(session.stats().is_err());
    }

    #[test]
    fn test_dispose_rejects_later_calls() {
        let session = single(vec![counter("seen", "A")]);
        session.dispose();
        session.dispose();
        assert!(session.is_disposed());
        assert!(matches!(session.insert(Fact::new("A")), Err(ReticleError::Session { .. })));
        assert!(session.fire_all_rules().is_err());
    }

    #[test]
    fn test_partition_touched_by_foreign_thread_is_rejected() {
        let session = single(vec![counter("seen", "A")]);
        let mut guard = session.lock_partition(0).unwrap();
        guard.bind_owner();
        let state: &mut PartitionState = &mut guard;
        let result = thread::scope(|scope| scope.spawn(|| state.evaluate()).join().unwrap());
        assert!(matches!(result, Err(ReticleError::ConcurrencyViolation { partition: Some(0), .. })));
        guard.release_owner();
        assert!(guard.evaluate().is_ok());

        drop(guard);
        assert!(session.lock_partition(0).is_ok());
    }

    #[test]
    fn test_initial_fact_is_hidden_and_protected() {
        let session = single(vec![counter("seen", "A")]);
        assert_eq!(session.fact_count(), 0);
        assert!(session.retract(1).is_err());
        assert!(session.retract(crate::handle::ENGINE_ID_BASE).is_err());

        // the first application fact still gets id 1
        assert_eq!(session.insert(Fact::new("A")).unwrap(), 1);
        session.retract(1).unwrap();
    }
}
