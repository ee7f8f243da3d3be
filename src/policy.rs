use crate::{node::DependableObject, probe::Probe, sync::Arc};
use crossbeam_channel::{unbounded, Receiver, Sender};

/// Scheduler and probe handles threaded through every call that can release
/// or complete nodes.
///
/// The core never reaches for process-wide state; whoever drives it (the
/// [`Runtime`](crate::runtime::Runtime), a test harness) passes its context
/// down explicitly.
#[derive(Clone, Copy)]
pub struct DispatchCtx<'a> {
    /// Scheduling policy receiving ready nodes and edge advisories.
    pub policy: &'a dyn SchedulePolicy,
    /// Instrumentation observer; defaults to a no-op.
    pub probe: &'a dyn Probe,
}

/// Capability set the dependency core requires from a scheduler.
///
/// Implementations differ only in how they order ready nodes; the core
/// interacts exclusively through these three operations.
pub trait SchedulePolicy: Send + Sync {
    /// Advisory notification for one edge event on `target`.
    ///
    /// Fired with `is_new_edge` set when an edge is installed (then `source`
    /// is the edge source) and cleared on the decrement path (then `source`
    /// is the finished predecessor, absent for pure bookkeeping decrements).
    /// May stash per-node state via
    /// [`DependableObject::set_scheduler_data`]; must not block on an object
    /// lock owned by the caller.
    fn at_successor(
        &self,
        _target: &DependableObject,
        _source: Option<&DependableObject>,
        _is_new_edge: bool,
        _remaining_preds: usize,
    ) {
    }

    /// Hand a ready node into the runnable structure.
    ///
    /// Must be non-blocking and thread-safe; called from submitters and from
    /// finishing workers alike.
    fn submit(&self, ready: Arc<DependableObject>);

    /// Current ready-queue backlog, consulted by admission control.
    fn queue_size(&self) -> usize {
        0
    }
}

/// First-in first-out policy over an unbounded channel.
///
/// The sending half is the policy; worker threads block on cloned receivers.
pub struct FifoPolicy {
    tx: Sender<Arc<DependableObject>>,
    rx: Receiver<Arc<DependableObject>>,
}

impl FifoPolicy {
    /// Create an empty ready queue.
    #[must_use]
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        Self { tx, rx }
    }

    /// A receiving handle for a worker thread.
    #[must_use]
    pub fn receiver(&self) -> Receiver<Arc<DependableObject>> {
        self.rx.clone()
    }
}

impl Default for FifoPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl SchedulePolicy for FifoPolicy {
    fn submit(&self, ready: Arc<DependableObject>) {
        // Unbounded send never blocks; a send after every receiver is gone
        // means the runtime is tearing down and the node can be dropped.
        let _ = self.tx.send(ready);
    }

    fn queue_size(&self) -> usize {
        self.tx.len()
    }
}
