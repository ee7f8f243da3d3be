use crate::{
    access::{AccessDescriptor, Region},
    policy::DispatchCtx,
    sync::{fence, lock, wait_on, Arc, AtomicBool, AtomicU8, AtomicUsize, Condvar, Mutex, Ordering},
    types::{IndexSet, NodeId},
    work::Work,
};
use core::{any::Any, mem};
use derive_more::Debug;
use serde::Serialize;
use std::collections::VecDeque;
use tracing::trace;

/// Classification of a graph edge, mirrored by the task-graph dump.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum EdgeKind {
    /// Parent/child structural link (cohort membership).
    Nesting,
    /// Ordering demanded by a taskwait or barrier.
    Synchronization,
    /// Data ordering derived from access overlap.
    Dependency,
}

/// Data-dependence flavor of a [`EdgeKind::Dependency`] edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum DepType {
    /// Read after write.
    True,
    /// Write after read.
    Anti,
    /// Write after write.
    Output,
    /// Into a concurrent pool member.
    InConcurrent,
    /// Out of a concurrent pool.
    OutConcurrent,
    /// Into a commutative pool member.
    InCommutative,
    /// Out of a commutative pool.
    OutCommutative,
    /// Into an any-mode pool member.
    InAny,
    /// Out of an any-mode pool.
    OutAny,
}

/// Role of a node, as reported by the task-graph dump.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum NodeKind {
    /// The permanent ancestor tracking the live cohort.
    Root,
    /// A regular unit of user work.
    Task,
    /// Synchronization sink for the submitting scope.
    Taskwait,
    /// Synchronization sink for the whole team.
    Barrier,
    /// Sink collecting a concurrent pool.
    Concurrent,
    /// Sink collecting a commutative pool.
    Commutative,
}

/// Lifecycle of a [`DependableObject`].
///
/// Transitions only ever move rightwards; a violated transition is a
/// programming error and panics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum LifeState {
    /// Created, linkage in progress.
    Unsubmitted = 0,
    /// All edges installed; waiting for predecessors to drain.
    Submitted = 1,
    /// Zero unresolved predecessors; handed to (or eligible for) the scheduler.
    Ready = 2,
    /// User work executing.
    Running = 3,
    /// Work complete; successors notified.
    Finished = 4,
    /// Unlinked and unreferenced; storage may be reclaimed.
    Reaped = 5,
}

impl LifeState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Unsubmitted,
            1 => Self::Submitted,
            2 => Self::Ready,
            3 => Self::Running,
            4 => Self::Finished,
            5 => Self::Reaped,
            _ => unreachable!("LifeState::from_u8"),
        }
    }
}

/// A forward link: the source node gates `target`.
pub(crate) struct Edge {
    pub(crate) target: Arc<DependableObject>,
    pub(crate) kind: EdgeKind,
    pub(crate) dep: Option<DepType>,
    pub(crate) range: Option<Region>,
}

#[derive(Default)]
struct Links {
    /// Ids of nodes whose completion this node awaits. Back-links only; the
    /// owning handles live in the predecessors' successor edges.
    predecessors: IndexSet<NodeId>,
    /// Forward edges. These hold the only strong handles along graph
    /// direction, so ownership is acyclic exactly like the graph itself.
    successors: Vec<Edge>,
}

#[derive(Default)]
struct Completion {
    finished: bool,
}

/// Dispatch gate carried by pool sinks.
///
/// Commutative members funnel through `engaged`: at most one holds the gate,
/// the rest park and are handed the gate as holders finish. Concurrent pools
/// share the sink for edge bookkeeping but never engage the gate.
struct PoolGate {
    exclusive: bool,
    engaged: AtomicBool,
    parked: Mutex<VecDeque<Arc<DependableObject>>>,
}

/// A node in the dynamic task graph.
///
/// Wraps one unit of user work (or none, for synchronization sinks), carries
/// the predecessor counter that gates release, and owns the forward edges to
/// the nodes it releases on completion.
#[derive(Debug)]
#[repr(align(128))]
pub struct DependableObject {
    id: NodeId,
    kind: NodeKind,
    #[debug(skip)]
    work: Option<Box<dyn Work>>,
    #[debug(skip)]
    accesses: Box<[AccessDescriptor]>,
    #[debug(skip)]
    state: AtomicU8,
    #[debug(skip)]
    num_predecessors: AtomicUsize,
    #[debug(skip)]
    references: AtomicUsize,
    #[debug(skip)]
    submitted: AtomicBool,
    #[debug(skip)]
    needs_submission: AtomicBool,
    #[debug(skip)]
    aborted: AtomicBool,
    /// The object lock of the edge-insertion protocol.
    #[debug(skip)]
    links: Mutex<Links>,
    #[debug(skip)]
    completion: Mutex<Completion>,
    #[debug(skip)]
    completion_cv: Condvar,
    /// Pool sinks this node is a member of, ascending by id.
    #[debug(skip)]
    pools: Mutex<Vec<Arc<DependableObject>>>,
    #[debug(skip)]
    gate: Option<PoolGate>,
    #[debug(skip)]
    scheduler_data: Mutex<Option<Box<dyn Any + Send>>>,
}

impl DependableObject {
    fn build(
        id: NodeId,
        kind: NodeKind,
        work: Option<Box<dyn Work>>,
        accesses: Box<[AccessDescriptor]>,
    ) -> Arc<Self> {
        let gate = matches!(kind, NodeKind::Concurrent | NodeKind::Commutative).then(|| PoolGate {
            exclusive: matches!(kind, NodeKind::Commutative),
            engaged: AtomicBool::new(false),
            parked: Mutex::new(VecDeque::new()),
        });
        Arc::new(Self {
            id,
            kind,
            work,
            accesses,
            state: AtomicU8::new(LifeState::Unsubmitted as u8),
            num_predecessors: AtomicUsize::new(0),
            references: AtomicUsize::new(0),
            submitted: AtomicBool::new(false),
            needs_submission: AtomicBool::new(false),
            aborted: AtomicBool::new(false),
            links: Mutex::new(Links::default()),
            completion: Mutex::new(Completion::default()),
            completion_cv: Condvar::new(),
            pools: Mutex::new(Vec::new()),
            gate,
            scheduler_data: Mutex::new(None),
        })
    }

    pub(crate) fn new_task(
        id: NodeId,
        work: Box<dyn Work>,
        accesses: Box<[AccessDescriptor]>,
    ) -> Arc<Self> {
        Self::build(id, NodeKind::Task, Some(work), accesses)
    }

    pub(crate) fn new_sink(id: NodeId, kind: NodeKind) -> Arc<Self> {
        debug_assert!(!matches!(kind, NodeKind::Task));
        Self::build(id, kind, None, Box::new([]))
    }

    /// Identifier, unique within the owning domain.
    #[must_use]
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Role of this node in the graph.
    #[must_use]
    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> LifeState {
        LifeState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Whether this node is a universal sink for its cohort.
    #[must_use]
    pub fn waits(&self) -> bool {
        matches!(
            self.kind,
            NodeKind::Root | NodeKind::Taskwait | NodeKind::Barrier
        )
    }

    /// Unresolved predecessor count.
    #[must_use]
    pub fn num_predecessors(&self) -> usize {
        self.num_predecessors.load(Ordering::Acquire)
    }

    /// Whether linkage has completed and the node may release.
    #[must_use]
    pub fn is_submitted(&self) -> bool {
        self.submitted.load(Ordering::Acquire)
    }

    /// Whether the node is eligible for release (not disarmed).
    #[must_use]
    pub fn needs_submission(&self) -> bool {
        self.needs_submission.load(Ordering::Acquire)
    }

    /// Whether the node reached [`LifeState::Finished`] (or beyond).
    #[must_use]
    pub fn is_finished(&self) -> bool {
        matches!(self.state(), LifeState::Finished | LifeState::Reaped)
    }

    /// Whether the node finished with the abort flag set.
    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    /// The wrapped user work, if any.
    #[must_use]
    pub fn work(&self) -> Option<&dyn Work> {
        self.work.as_deref()
    }

    /// Access declarations, in submission order.
    #[must_use]
    pub fn accesses(&self) -> &[AccessDescriptor] {
        &self.accesses
    }

    /// Accesses that observe prior contents.
    pub fn read_accesses(&self) -> impl Iterator<Item = &AccessDescriptor> {
        self.accesses.iter().filter(|access| access.mode.reads())
    }

    /// Accesses that may mutate their region.
    pub fn write_accesses(&self) -> impl Iterator<Item = &AccessDescriptor> {
        self.accesses.iter().filter(|access| access.mode.writes())
    }

    /// Attach an opaque per-policy payload.
    pub fn set_scheduler_data(&self, data: Box<dyn Any + Send>) {
        *lock(&self.scheduler_data) = Some(data);
    }

    /// Detach the per-policy payload, if any.
    pub fn take_scheduler_data(&self) -> Option<Box<dyn Any + Send>> {
        lock(&self.scheduler_data).take()
    }

    /// Register an external hold that blocks reaping.
    pub fn increase_references(&self) {
        self.references.fetch_add(1, Ordering::Relaxed);
    }

    /// Drop an external hold; returns the remaining count.
    pub fn decrease_references(&self) -> usize {
        let previous = self.references.fetch_sub(1, Ordering::AcqRel);
        assert!(
            previous > 0,
            "DependableObject::decrease_references: underflow"
        );
        previous - 1
    }

    /// Count of external holds.
    #[must_use]
    pub fn references(&self) -> usize {
        self.references.load(Ordering::Acquire)
    }

    fn try_transition(&self, from: LifeState, to: LifeState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn transition_expect(&self, from: LifeState, to: LifeState) {
        assert!(
            self.try_transition(from, to),
            "DependableObject::transition: invalid {from:?} -> {to:?} for node {}",
            self.id
        );
    }

    /// Install the forward edge `self -> target`, incrementing the target's
    /// predecessor count.
    ///
    /// Returns `false` without side effects when the edge would duplicate an
    /// existing `(target, kind, dep, range)` entry, or when `self` already
    /// finished and therefore imposes no ordering.
    ///
    /// Locking: the source object lock is held across the whole insertion and
    /// the target lock is taken inside it. Edges always point from an
    /// earlier-submitted node to a later one, so this source-before-target
    /// order is cycle-free.
    pub(crate) fn add_successor(
        self: &Arc<Self>,
        target: &Arc<Self>,
        kind: EdgeKind,
        dep: Option<DepType>,
        range: Option<Region>,
        ctx: DispatchCtx<'_>,
    ) -> bool {
        assert_ne!(
            self.id, target.id,
            "DependableObject::add_successor: self edge"
        );
        let mut links = lock(&self.links);
        if self.is_finished() {
            return false;
        }
        let duplicate = links.successors.iter().any(|edge| {
            edge.target.id == target.id
                && edge.kind == kind
                && edge.dep == dep
                && edge.range == range
        });
        if duplicate {
            return false;
        }
        links.successors.push(Edge {
            target: Arc::clone(target),
            kind,
            dep,
            range,
        });
        {
            let mut target_links = lock(&target.links);
            target_links.predecessors.insert(self.id);
        }
        let remaining = target.num_predecessors.fetch_add(1, Ordering::Relaxed) + 1;
        trace!(
            source = self.id.get(),
            target = target.id.get(),
            ?kind,
            ?dep,
            remaining,
            "edge installed"
        );
        ctx.probe.on_edge_created(self, target, kind, dep, range);
        ctx.policy.at_successor(target, Some(self), true, remaining);
        true
    }

    /// Record membership in a pool collected by `sink`.
    pub(crate) fn join_pool(&self, sink: &Arc<DependableObject>) {
        let mut pools = lock(&self.pools);
        if pools.iter().any(|member_of| member_of.id == sink.id) {
            return;
        }
        pools.push(Arc::clone(sink));
        pools.sort_unstable_by_key(|member_of| member_of.id);
    }

    fn enable_submission(&self) {
        self.needs_submission.store(true, Ordering::Release);
    }

    /// Disarm a reusable sink so it can be submitted again.
    ///
    /// Only meaningful for nodes that already finished (the Root between
    /// barriers); regular tasks are submitted exactly once.
    pub(crate) fn disable_submission(&self) {
        let mut completion = lock(&self.completion);
        completion.finished = false;
        self.aborted.store(false, Ordering::Relaxed);
        self.submitted.store(false, Ordering::Release);
        self.needs_submission.store(false, Ordering::Release);
        self.state
            .store(LifeState::Unsubmitted as u8, Ordering::Release);
    }

    /// Publish the node as fully linked and attempt release.
    ///
    /// The `submitted` latch is stored with release ordering; the matching
    /// acquire sits on the decrement path so a racing predecessor observes the
    /// linkage complete. Submitting twice is fatal.
    pub(crate) fn mark_submitted(self: &Arc<Self>, ctx: DispatchCtx<'_>) {
        self.enable_submission();
        self.transition_expect(LifeState::Unsubmitted, LifeState::Submitted);
        self.submitted.store(true, Ordering::Release);
        ctx.probe.on_state_change(self, LifeState::Submitted);
        self.maybe_release(ctx);
    }

    /// Drop one unresolved predecessor.
    ///
    /// `finished` names the completed predecessor on the cascade path; it is
    /// absent for batch bookkeeping. With `batch` set the release check is
    /// deferred to a later explicit [`Self::maybe_release`], letting a caller
    /// that drains many edges emit a single notification.
    pub(crate) fn decrease_predecessors(
        self: &Arc<Self>,
        finished: Option<&Arc<Self>>,
        batch: bool,
        ctx: DispatchCtx<'_>,
    ) -> usize {
        let previous = self.num_predecessors.fetch_sub(1, Ordering::Relaxed);
        assert!(
            previous > 0,
            "DependableObject::decrease_predecessors: underflow on node {}",
            self.id
        );
        let remaining = previous - 1;
        ctx.policy
            .at_successor(self, finished.map(|pred| &**pred), false, remaining);
        if remaining == 0 {
            // Pairs with the release fence the finishing predecessor emitted
            // before its decrement loop.
            fence(Ordering::Acquire);
            if !batch {
                self.maybe_release(ctx);
            }
        }
        remaining
    }

    /// Release the node to the scheduler if it is submitted and has no
    /// unresolved predecessors. Idempotent; exactly one caller wins the
    /// `Submitted -> Ready` transition.
    pub(crate) fn maybe_release(self: &Arc<Self>, ctx: DispatchCtx<'_>) {
        if !self.submitted.load(Ordering::Acquire) {
            return;
        }
        if self.num_predecessors.load(Ordering::Acquire) != 0 {
            return;
        }
        if !self.try_transition(LifeState::Submitted, LifeState::Ready) {
            return;
        }
        trace!(node = self.id.get(), kind = ?self.kind, "ready");
        ctx.probe.on_state_change(self, LifeState::Ready);
        self.dependencies_satisfied(ctx);
    }

    fn dependencies_satisfied(self: &Arc<Self>, ctx: DispatchCtx<'_>) {
        if self.work.is_none() {
            // Sinks carry no user work: RUNNING is instantaneous.
            self.begin(ctx);
            self.finish(false, ctx);
            return;
        }
        if !self.acquire_gates(None, ctx) {
            return;
        }
        ctx.policy.submit(Arc::clone(self));
    }

    /// Mark the node as dispatched. Called by the executing worker right
    /// before invoking the work.
    pub fn begin(self: &Arc<Self>, ctx: DispatchCtx<'_>) {
        self.transition_expect(LifeState::Ready, LifeState::Running);
        ctx.probe.on_state_change(self, LifeState::Running);
        ctx.probe.on_task_begin(self);
    }

    /// Complete the node and cascade releases to its successors.
    ///
    /// The successor list is drained under the object lock together with the
    /// state change, so a concurrent [`Self::add_successor`] either sees the
    /// node unfinished and links, or sees it finished and skips. Each drained
    /// edge removes this node from the target's back-links, forwards the
    /// completion to the target's work, and decrements the target once per
    /// edge, which keeps "live edges in == predecessor count" exact even for
    /// pairs linked by more than one dependence kind.
    pub fn finish(self: &Arc<Self>, aborted: bool, ctx: DispatchCtx<'_>) {
        let drained = {
            let mut links = lock(&self.links);
            if aborted {
                self.aborted.store(true, Ordering::Relaxed);
            }
            self.transition_expect(LifeState::Running, LifeState::Finished);
            mem::take(&mut links.successors)
        };
        trace!(node = self.id.get(), aborted, successors = drained.len(), "finished");
        ctx.probe.on_state_change(self, LifeState::Finished);
        ctx.probe.on_task_end(self, aborted);
        {
            let mut completion = lock(&self.completion);
            completion.finished = true;
            self.completion_cv.notify_all();
        }
        self.release_gates(ctx);
        if !drained.is_empty() {
            // Publish everything the finished work wrote before any successor
            // can observe a zero predecessor count.
            fence(Ordering::Release);
        }
        for edge in &drained {
            let target = &edge.target;
            {
                let mut target_links = lock(&target.links);
                target_links.predecessors.swap_remove(&self.id);
            }
            if let (Some(target_work), Some(own_work)) = (target.work.as_deref(), self.work.as_deref())
            {
                target_work.predecessor_finished(own_work);
            }
            target.decrease_predecessors(Some(self), false, ctx);
        }
    }

    /// Block until the node finishes; returns the abort flag.
    ///
    /// Used by taskwait and barrier callers; the worker thread parks on the
    /// node's completion condition variable.
    pub fn wait_for_completion(&self) -> bool {
        let mut completion = lock(&self.completion);
        while !completion.finished {
            completion = wait_on(&self.completion_cv, completion);
        }
        self.aborted.load(Ordering::Acquire)
    }

    /// Reap the node if it is finished, unreferenced, and fully unlinked.
    pub(crate) fn try_reap(&self) -> bool {
        if self.state() != LifeState::Finished || self.references.load(Ordering::Acquire) != 0 {
            return false;
        }
        {
            let links = lock(&self.links);
            assert!(
                links.successors.is_empty(),
                "DependableObject::try_reap: successors survive completion on node {}",
                self.id
            );
            if !links.predecessors.is_empty() {
                return false;
            }
        }
        self.try_transition(LifeState::Finished, LifeState::Reaped)
    }

    /// Acquire every exclusive pool gate this node is a member of, ascending
    /// by sink id. `granted` names a gate handed over by a finishing member,
    /// which is already owned.
    ///
    /// On any contended gate the node parks there, every gate taken so far is
    /// handed back, and `false` is returned; the node is re-dispatched when
    /// the contended gate is handed to it. Nothing is ever held while
    /// waiting, so members of several pools cannot deadlock.
    fn acquire_gates(self: &Arc<Self>, granted: Option<NodeId>, ctx: DispatchCtx<'_>) -> bool {
        let pools = lock(&self.pools).clone();
        let mut held: Vec<&Arc<DependableObject>> = Vec::new();
        for sink in &pools {
            let Some(gate) = sink.gate.as_ref() else {
                continue;
            };
            if !gate.exclusive {
                continue;
            }
            if granted == Some(sink.id) {
                held.push(sink);
                continue;
            }
            let mut parked = lock(&gate.parked);
            if gate
                .engaged
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                drop(parked);
                held.push(sink);
            } else {
                parked.push_back(Arc::clone(self));
                drop(parked);
                for taken in held {
                    taken.leave_gate(ctx);
                }
                trace!(node = self.id.get(), gate = sink.id.get(), "parked on pool gate");
                return false;
            }
        }
        true
    }

    fn release_gates(self: &Arc<Self>, ctx: DispatchCtx<'_>) {
        let pools = lock(&self.pools).clone();
        for sink in &pools {
            sink.leave_gate(ctx);
        }
    }

    /// Release this sink's gate, handing it to the next parked member if any.
    fn leave_gate(&self, ctx: DispatchCtx<'_>) {
        let Some(gate) = self.gate.as_ref() else {
            return;
        };
        if !gate.exclusive {
            return;
        }
        let next = {
            let mut parked = lock(&gate.parked);
            match parked.pop_front() {
                Some(next) => Some(next),
                None => {
                    gate.engaged.store(false, Ordering::Release);
                    None
                }
            }
        };
        if let Some(next) = next {
            // The gate stays engaged; ownership passes to the parked member.
            if next.acquire_gates(Some(self.id), ctx) {
                ctx.policy.submit(Arc::clone(&next));
            }
        }
    }

    /// Snapshot of the outgoing edges, for observers.
    pub(crate) fn successor_edges(&self) -> Vec<(NodeId, EdgeKind, Option<DepType>, Option<Region>)> {
        lock(&self.links)
            .successors
            .iter()
            .map(|edge| (edge.target.id, edge.kind, edge.dep, edge.range))
            .collect()
    }
}
