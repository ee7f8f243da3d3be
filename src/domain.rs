pub(crate) mod region_map;
mod resolve;

pub use resolve::SubmitError;

use crate::{
    access::{AccessDescriptor, Region},
    node::{DependableObject, EdgeKind, NodeKind},
    policy::DispatchCtx,
    sync::{lock, Arc, AtomicU64, Mutex, Ordering},
    types::{IndexMap, NodeId},
    work::Work,
};
use region_map::RegionMap;
use std::collections::{BTreeMap, VecDeque};
use tracing::{debug, trace};

pub(crate) struct DomainState {
    pub(crate) region_map: RegionMap,
    pub(crate) objects: BTreeMap<u64, Region>,
}

/// Maintains the mapping from memory regions to their last producer and
/// reader set, and derives ordering edges for submitted tasks.
///
/// All region-map mutation happens under the domain lock, held across one
/// task's entire access registration and never across a scheduler call.
pub struct DependencyDomain {
    next_id: AtomicU64,
    /// The domain lock.
    pub(crate) state: Mutex<DomainState>,
    /// Every node created in this domain that has not been reaped.
    live: Mutex<IndexMap<NodeId, Arc<DependableObject>>>,
    /// Finished nodes awaiting cleanup once external references drop.
    finished: Mutex<VecDeque<Arc<DependableObject>>>,
    /// Pool sinks whose pools have been closed; reaped once their members
    /// drain.
    closed_sinks: Mutex<Vec<Arc<DependableObject>>>,
    pub(crate) strict_objects: bool,
}

impl DependencyDomain {
    /// An empty domain. With `strict_objects` set, submissions must land
    /// inside regions previously attached via [`Self::register_object`].
    #[must_use]
    pub fn new(strict_objects: bool) -> Self {
        Self {
            next_id: AtomicU64::new(0),
            state: Mutex::new(DomainState {
                region_map: RegionMap::new(),
                objects: BTreeMap::new(),
            }),
            live: Mutex::new(IndexMap::default()),
            finished: Mutex::new(VecDeque::new()),
            closed_sinks: Mutex::new(Vec::new()),
            strict_objects,
        }
    }

    fn alloc_id(&self) -> NodeId {
        let raw = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        NodeId::new(raw).expect("DependencyDomain::alloc_id: id space exhausted")
    }

    /// Build an unsubmitted task node owning `accesses`. The node holds no
    /// edges until [`Self::submit`] resolves it.
    #[must_use]
    pub fn create_task(
        &self,
        work: Box<dyn Work>,
        accesses: Vec<AccessDescriptor>,
    ) -> Arc<DependableObject> {
        DependableObject::new_task(self.alloc_id(), work, accesses.into_boxed_slice())
    }

    pub(crate) fn create_sink(&self, kind: NodeKind) -> Arc<DependableObject> {
        let sink = DependableObject::new_sink(self.alloc_id(), kind);
        self.enroll(&sink);
        sink
    }

    pub(crate) fn enroll(&self, node: &Arc<DependableObject>) {
        lock(&self.live).insert(node.id(), Arc::clone(node));
    }

    /// Attach user memory regions so subsequent accesses can intersect them.
    ///
    /// Each region's base address must be fresh; duplicates are rejected
    /// rather than silently replaced.
    pub fn register_object(&self, regions: &[Region]) -> Result<(), SubmitError> {
        let mut state = lock(&self.state);
        for &region in regions {
            if state.objects.contains_key(&region.start) {
                return Err(SubmitError::ObjectExists(region.start));
            }
        }
        for &region in regions {
            state.objects.insert(region.start, region);
        }
        Ok(())
    }

    /// Detach the object registered at `base`.
    pub fn unregister_object(&self, base: u64) -> Result<(), SubmitError> {
        let mut state = lock(&self.state);
        state
            .objects
            .remove(&base)
            .map(|_| ())
            .ok_or(SubmitError::UnknownObject(base))
    }

    /// Build and submit a taskwait sink gated on every region active in this
    /// domain: its predecessors are all outstanding writers, readers, and
    /// pools, so its completion means the scope has drained.
    ///
    /// Open pools are closed in the process; the caller blocks on the
    /// returned node's completion.
    pub fn taskwait_node(&self, ctx: DispatchCtx<'_>) -> Arc<DependableObject> {
        let waiter = self.create_sink(NodeKind::Taskwait);
        let mut to_close = Vec::new();
        {
            let mut state = lock(&self.state);
            for record in state.region_map.records_mut() {
                record.displace_pool(&mut to_close);
                let range = Some(record.region);
                if let Some(writer) = record.last_writer.clone() {
                    writer.add_successor(&waiter, EdgeKind::Synchronization, None, range, ctx);
                }
                for reader in record.last_readers.values() {
                    reader.add_successor(&waiter, EdgeKind::Synchronization, None, range, ctx);
                }
            }
        }
        for sink in to_close {
            self.close_pool_sink(sink, ctx);
        }
        trace!(
            waiter = waiter.id().get(),
            predecessors = waiter.num_predecessors(),
            "taskwait armed"
        );
        waiter.mark_submitted(ctx);
        waiter
    }

    /// Build and submit a barrier sink gated on every live node in the
    /// domain, regardless of which regions it touches. Returns the sink and
    /// the number of edges installed; zero means the domain was already
    /// quiescent at the snapshot.
    ///
    /// Nodes that already finished impose no ordering and are skipped, as
    /// are pool sinks whose pools are still open (a pool racing the barrier
    /// belongs to the next epoch; its members link individually).
    pub fn barrier_node(&self, ctx: DispatchCtx<'_>) -> (Arc<DependableObject>, usize) {
        let barrier = self.create_sink(NodeKind::Barrier);
        let mut installed = 0;
        for node in self.live_nodes() {
            if node.id() == barrier.id() || matches!(node.kind(), NodeKind::Root) {
                continue;
            }
            if matches!(node.kind(), NodeKind::Concurrent | NodeKind::Commutative)
                && !node.is_submitted()
            {
                continue;
            }
            if node.add_successor(&barrier, EdgeKind::Synchronization, None, None, ctx) {
                installed += 1;
            }
        }
        trace!(
            barrier = barrier.id().get(),
            predecessors = installed,
            "barrier armed"
        );
        barrier.mark_submitted(ctx);
        (barrier, installed)
    }

    /// Close every open pool, collapsing each into its sink.
    pub fn close_all_pools(&self, ctx: DispatchCtx<'_>) {
        let mut to_close = Vec::new();
        {
            let mut state = lock(&self.state);
            for record in state.region_map.records_mut() {
                record.displace_pool(&mut to_close);
            }
        }
        for sink in to_close {
            self.close_pool_sink(sink, ctx);
        }
    }

    /// Submit a displaced pool sink so it can complete once its members
    /// drain, and keep it for reaping. Must be called without the domain
    /// lock: completion may cascade into the scheduler.
    pub(crate) fn close_pool_sink(&self, sink: Arc<DependableObject>, ctx: DispatchCtx<'_>) {
        sink.mark_submitted(ctx);
        lock(&self.closed_sinks).push(sink);
    }

    /// Queue a finished node for cleanup.
    pub fn retire(&self, node: &Arc<DependableObject>) {
        debug_assert!(node.is_finished(), "DependencyDomain::retire: node not finished");
        lock(&self.finished).push_back(Arc::clone(node));
    }

    /// Pop one node awaiting cleanup; an empty queue yields `None`.
    fn next_finished(&self) -> Option<Arc<DependableObject>> {
        lock(&self.finished).pop_front()
    }

    /// Reap finished nodes whose external references have dropped: unlink
    /// them from the region map and forget them. Still-referenced nodes are
    /// requeued.
    pub fn reap(&self) {
        let mut requeue = Vec::new();
        while let Some(node) = self.next_finished() {
            if node.try_reap() {
                self.forget(&node);
            } else {
                requeue.push(node);
            }
        }
        if !requeue.is_empty() {
            lock(&self.finished).extend(requeue);
        }
        let sinks = std::mem::take(&mut *lock(&self.closed_sinks));
        let mut keep = Vec::new();
        for sink in sinks {
            if sink.try_reap() {
                self.forget(&sink);
            } else {
                keep.push(sink);
            }
        }
        if !keep.is_empty() {
            lock(&self.closed_sinks).extend(keep);
        }
    }

    fn forget(&self, node: &Arc<DependableObject>) {
        debug!(node = node.id().get(), kind = ?node.kind(), "reaped");
        lock(&self.live).swap_remove(&node.id());
        lock(&self.state).region_map.purge_node(node.id());
    }

    /// Snapshot of every live node, for observers.
    #[must_use]
    pub fn live_nodes(&self) -> Vec<Arc<DependableObject>> {
        lock(&self.live).values().cloned().collect()
    }
}
