//! Propagation entries, per-partition queues and quiescence tracking.
//!
//! Every mutation of a partition goes through its queue: external inserts,
//! updates and retracts, facts inserted by rule actions on other partitions,
//! async messages and async failures. A partition executes its entries
//! strictly in enqueue order.

use crate::error::ReticleError;
use crate::exchange::AsyncMessage;
use crate::handle::FactHandle;
use crate::types::NodeId;
use crossbeam::channel::{Receiver, RecvTimeoutError, Sender, TryRecvError, unbounded};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Queued unit of partition work
#[derive(Debug, Clone)]
pub enum PropagationEntry {
    Insert { handle: FactHandle },
    Update { previous: FactHandle, current: FactHandle },
    Delete { handle: FactHandle },
    AsyncReceive { node: NodeId, message: AsyncMessage },
    AsyncError { error: ReticleError },
    /// Wakes a blocked loop so it observes the halt flag
    Halt,
}

impl PropagationEntry {
    pub fn name(&self) -> &'static str {
        match self {
            PropagationEntry::Insert { .. } => "insert",
            PropagationEntry::Update { .. } => "update",
            PropagationEntry::Delete { .. } => "delete",
            PropagationEntry::AsyncReceive { .. } => "async_receive",
            PropagationEntry::AsyncError { .. } => "async_error",
            PropagationEntry::Halt => "halt",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Sequenced {
    pub seq: u64,
    pub entry: PropagationEntry,
}

/// Unbounded multi-producer FIFO owned by one partition
#[derive(Debug)]
pub struct PropagationQueue {
    sender: Sender<Sequenced>,
    receiver: Receiver<Sequenced>,
}

impl Default for PropagationQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl PropagationQueue {
    pub fn new() -> Self {
        let (sender, receiver) = unbounded();
        Self { sender, receiver }
    }

    pub fn push(&self, entry: Sequenced) {
        // The receiver lives as long as the queue, so sending cannot fail.
        let _ = self.sender.send(entry);
    }

    pub fn try_pop(&self) -> Option<Sequenced> {
        match self.receiver.try_recv() {
            Ok(entry) => Some(entry),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }

    pub fn pop_timeout(&self, timeout: Duration) -> Option<Sequenced> {
        match self.receiver.recv_timeout(timeout) {
            Ok(entry) => Some(entry),
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => None,
        }
    }

    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }
}

/// Global counters deciding when a multi-partition fire loop may stop.
///
/// `pending` counts queued entries plus in-flight async computations. It is
/// raised before an entry is pushed and lowered only after the entry has
/// executed. `active` counts partition loops that are not idle; a loop wakes
/// before lowering `pending` for the entry that woke it. The session is
/// quiescent when both reach zero.
#[derive(Debug, Default)]
pub struct QuiescenceTracker {
    pending: AtomicUsize,
    active: AtomicUsize,
}

impl QuiescenceTracker {
    pub fn submitted(&self) {
        self.pending.fetch_add(1, Ordering::SeqCst);
    }

    pub fn completed(&self) {
        let previous = self.pending.fetch_sub(1, Ordering::SeqCst);
        assert!(previous > 0, "propagation pending counter underflow");
    }

    pub fn start(&self, loops: usize) {
        self.active.store(loops, Ordering::SeqCst);
    }

    pub fn wake(&self) {
        self.active.fetch_add(1, Ordering::SeqCst);
    }

    pub fn sleep(&self) {
        let previous = self.active.fetch_sub(1, Ordering::SeqCst);
        assert!(previous > 0, "active partition counter underflow");
    }

    pub fn is_quiescent(&self) -> bool {
        self.pending.load(Ordering::SeqCst) == 0 && self.active.load(Ordering::SeqCst) == 0
    }

    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_is_fifo() {
        let queue = PropagationQueue::new();
        for seq in 1..=3 {
            queue.push(Sequenced { seq, entry: PropagationEntry::Halt });
        }
        assert_eq!(queue.len(), 3);
        let order: Vec<u64> = std::iter::from_fn(|| queue.try_pop()).map(|s| s.seq).collect();
        assert_eq!(order, vec![1, 2, 3]);
        assert!(queue.pop_timeout(Duration::from_millis(1)).is_none());
    }

    #[test]
    fn test_quiescence_requires_idle_loops_and_no_pending_work() {
        let tracker = QuiescenceTracker::default();
        tracker.start(2);
        tracker.submitted();
        tracker.sleep();
        tracker.sleep();
        assert!(!tracker.is_quiescent());

        tracker.wake();
        tracker.completed();
        assert!(!tracker.is_quiescent());
        tracker.sleep();
        assert!(tracker.is_quiescent());
    }
}
