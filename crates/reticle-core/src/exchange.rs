//! Async send/receive exchange
//!
//! An async-send node hands a snapshot of its match to the process-wide
//! worker pool and returns immediately. The computation yields any number of
//! values; each value that passes the send node's filter is published under
//! an application-chosen message id to the process-wide
//! [`MessageCoordinator`]. The coordinator only forwards a message to
//! receivers registered by the session that sent it. A receiver turns the
//! message into a propagation entry on the queue of the partition owning the
//! async-receive node, so applying it is a separate, ordered step.

use crate::constraint::{AlphaConstraint, BetaConstraint};
use crate::declaration::Match;
use crate::rule::MESSAGE_VALUE_FIELD;
use crate::types::{Fact, FactValue, NodeId};
use dashmap::DashMap;
use std::sync::{Arc, OnceLock};
use tracing::{debug, trace, warn};
use uuid::Uuid;

/// Computation offloaded by an async-send node. Must be pure: it sees a
/// snapshot of the match and only returns values.
pub trait AsyncComputation: Send + Sync {
    fn compute(&self, source: &Match) -> anyhow::Result<Vec<FactValue>>;
}

/// Closure-backed async computation
pub struct ComputeFn<F>(F);

impl<F> ComputeFn<F>
where
    F: Fn(&Match) -> anyhow::Result<Vec<FactValue>> + Send + Sync,
{
    pub fn new(compute: F) -> Self {
        Self(compute)
    }
}

impl<F> AsyncComputation for ComputeFn<F>
where
    F: Fn(&Match) -> anyhow::Result<Vec<FactValue>> + Send + Sync,
{
    fn compute(&self, source: &Match) -> anyhow::Result<Vec<FactValue>> {
        (self.0)(source)
    }
}

/// The fact a message value is seen as by filters and receive constraints
pub fn message_fact(message_id: &str, value: FactValue) -> Fact {
    Fact::new(message_id).with_field(MESSAGE_VALUE_FIELD, value)
}

/// Conditions a computed value must meet before it is published
#[derive(Clone, Default)]
pub struct SendFilter {
    pub(crate) alpha: Vec<Arc<dyn AlphaConstraint>>,
    pub(crate) constraints: Vec<Arc<dyn BetaConstraint>>,
}

impl SendFilter {
    pub fn is_empty(&self) -> bool {
        self.alpha.is_empty() && self.constraints.is_empty()
    }

    pub fn allows(&self, source: &Match, message: &Fact) -> anyhow::Result<bool> {
        for constraint in &self.alpha {
            if !constraint.is_allowed(message)? {
                return Ok(false);
            }
        }
        for constraint in &self.constraints {
            if !constraint.is_allowed(source, message)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Values worth publishing, with their position in the computed output.
    /// Null values carry nothing and are skipped.
    pub fn select(
        &self,
        message_id: &str,
        source: &Match,
        values: Vec<FactValue>,
    ) -> anyhow::Result<Vec<(usize, FactValue)>> {
        let mut selected = Vec::with_capacity(values.len());
        for (index, value) in values.into_iter().enumerate() {
            if value.is_null() {
                trace!(message_id, index, "Skipping null async result");
                continue;
            }
            if self.is_empty() || self.allows(source, &message_fact(message_id, value.clone()))? {
                selected.push((index, value));
            }
        }
        Ok(selected)
    }
}

/// Identity of one produced message: the sending session, node and match,
/// and the position of the value in the computation's output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageKey {
    pub session: Uuid,
    pub send_node: NodeId,
    pub tuple: u64,
    pub index: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AsyncMessage {
    pub message_id: String,
    pub key: MessageKey,
    pub value: FactValue,
}

type Deliver = Arc<dyn Fn(AsyncMessage) + Send + Sync>;

#[derive(Clone)]
struct Subscription {
    session: Uuid,
    node: NodeId,
    deliver: Deliver,
}

/// Process-wide registry of async receivers, keyed by message id
pub struct MessageCoordinator {
    receivers: DashMap<String, Vec<Subscription>>,
}

impl MessageCoordinator {
    fn new() -> Self {
        Self { receivers: DashMap::new() }
    }

    pub fn global() -> &'static MessageCoordinator {
        static COORDINATOR: OnceLock<MessageCoordinator> = OnceLock::new();
        COORDINATOR.get_or_init(MessageCoordinator::new)
    }

    pub fn register_receiver(
        &self,
        message_id: &str,
        session: Uuid,
        node: NodeId,
        deliver: impl Fn(AsyncMessage) + Send + Sync + 'static,
    ) {
        debug!(message_id, %session, node, "Registering async receiver");
        self.receivers.entry(message_id.to_string()).or_default().push(Subscription {
            session,
            node,
            deliver: Arc::new(deliver),
        });
    }

    /// Drop every receiver registered by `session`
    pub fn deregister_session(&self, session: Uuid) {
        self.receivers.retain(|_, subscriptions| {
            subscriptions.retain(|s| s.session != session);
            !subscriptions.is_empty()
        });
        debug!(%session, "Deregistered async receivers");
    }

    /// Deliver a message to the receivers of its id that belong to the
    /// sending session; returns how many got it
    pub fn propagate(&self, message: AsyncMessage) -> usize {
        let subscriptions: Vec<Subscription> = self
            .receivers
            .get(&message.message_id)
            .map(|entry| {
                entry.value().iter().filter(|s| s.session == message.key.session).cloned().collect()
            })
            .unwrap_or_default();
        if subscriptions.is_empty() {
            warn!(
                message_id = %message.message_id,
                session = %message.key.session,
                "Async message has no receiver in its session"
            );
            return 0;
        }
        for subscription in &subscriptions {
            trace!(
                message_id = %message.message_id,
                session = %subscription.session,
                node = subscription.node,
                "Delivering async message"
            );
            (subscription.deliver)(message.clone());
        }
        subscriptions.len()
    }

    /// Receivers of `message_id` across all sessions
    pub fn receiver_count(&self, message_id: &str) -> usize {
        self.receivers.get(message_id).map_or(0, |entry| entry.value().len())
    }
}

/// Process-wide pool running async-send computations
pub struct WorkerPool;

impl WorkerPool {
    fn pool(workers: usize) -> Option<&'static rayon::ThreadPool> {
        static POOL: OnceLock<Option<rayon::ThreadPool>> = OnceLock::new();
        POOL.get_or_init(|| {
            match rayon::ThreadPoolBuilder::new()
                .num_threads(workers)
                .thread_name(|i| format!("reticle-async-{i}"))
                .build()
            {
                Ok(pool) => Some(pool),
                Err(err) => {
                    warn!(error = %err, "Falling back to the rayon global pool for async work");
                    None
                }
            }
        })
        .as_ref()
    }

    /// Run `job` on the pool. The pool is sized by the first caller.
    pub fn spawn(workers: usize, job: impl FnOnce() + Send + 'static) {
        match Self::pool(workers) {
            Some(pool) => pool.spawn(job),
            None => rayon::spawn(job),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constraint::{AlphaFn, BetaFn, FieldConstraint};
    use crate::declaration::Declarations;
    use crate::handle::FactHandleFactory;
    use crate::types::Operator;
    use serial_test::serial;
    use std::sync::Mutex;
    use std::sync::mpsc;

    fn message(id: &str, session: Uuid, value: i64) -> AsyncMessage {
        AsyncMessage {
            message_id: id.to_string(),
            key: MessageKey { session, send_node: 1, tuple: 1, index: 0 },
            value: FactValue::Integer(value),
        }
    }

    #[test]
    #[serial]
    fn test_propagate_stays_inside_the_sending_session() {
        let coordinator = MessageCoordinator::global();
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for session in [first, second] {
            let seen = Arc::clone(&seen);
            coordinator.register_receiver("unit-exchange", session, 3, move |m| {
                seen.lock().unwrap().push((session, m.value));
            });
        }
        assert_eq!(coordinator.receiver_count("unit-exchange"), 2);
        assert_eq!(coordinator.propagate(message("unit-exchange", first, 4)), 1);
        assert_eq!(coordinator.propagate(message("unit-exchange", second, 5)), 1);
        assert_eq!(coordinator.propagate(message("unit-exchange", Uuid::new_v4(), 6)), 0);

        coordinator.deregister_session(first);
        assert_eq!(coordinator.propagate(message("unit-exchange", first, 7)), 0);
        coordinator.deregister_session(second);
        assert_eq!(coordinator.receiver_count("unit-exchange"), 0);

        let seen = seen.lock().unwrap();
        assert_eq!(*seen, vec![(first, FactValue::Integer(4)), (second, FactValue::Integer(5))]);
    }

    #[test]
    fn test_select_applies_filters_and_keeps_positions() {
        let factory = FactHandleFactory::new();
        let mut declarations = Declarations::new();
        declarations.declare("limit", 0, Some("limit")).unwrap();
        let source = Match::new(
            vec![Some(factory.new_handle(Fact::new("Limit").with_field("limit", 10)))],
            Arc::new(declarations),
        );
        let filter = SendFilter {
            alpha: vec![Arc::new(FieldConstraint::new(MESSAGE_VALUE_FIELD, Operator::GreaterThan, 0))],
            constraints: vec![Arc::new(BetaFn::new(|m: &Match, f: &Fact| {
                Ok(f.get_field(MESSAGE_VALUE_FIELD) < m.value("limit"))
            }))],
        };
        let values = vec![
            FactValue::Integer(3),
            FactValue::Integer(-1),
            FactValue::Null,
            FactValue::Integer(12),
            FactValue::Integer(9),
        ];
        let selected = filter.select("quotes", &source, values).unwrap();
        assert_eq!(selected, vec![(0, FactValue::Integer(3)), (4, FactValue::Integer(9))]);

        let failing = SendFilter {
            alpha: vec![Arc::new(AlphaFn::new(|_: &Fact| anyhow::bail!("filter exploded")))],
            constraints: Vec::new(),
        };
        assert!(failing.select("quotes", &source, vec![FactValue::Integer(1)]).is_err());
        assert!(SendFilter::default().select("quotes", &source, Vec::new()).unwrap().is_empty());
    }

    #[test]
    fn test_worker_pool_runs_jobs() {
        let (tx, rx) = mpsc::channel();
        WorkerPool::spawn(2, move || {
            tx.send(42).unwrap();
        });
        assert_eq!(rx.recv_timeout(std::time::Duration::from_secs(5)).unwrap(), 42);
    }
}
