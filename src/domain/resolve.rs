use crate::{
    access::{AccessMode, Region},
    domain::{
        region_map::{PoolClass, PoolRecord},
        DependencyDomain, DomainState,
    },
    node::{DepType, DependableObject, EdgeKind, NodeKind},
    policy::DispatchCtx,
    sync::{lock, Arc},
};
use thiserror::Error;
use tracing::debug;

/// Error returned by [`DependencyDomain::submit`] and the object-registration
/// calls.
///
/// Submission errors unwind synchronously at the submitter: the whole access
/// batch is validated before any edge is installed, so a rejected submission
/// leaves the graph untouched.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum SubmitError {
    /// Tasks must declare at least one access.
    #[error("access list is empty")]
    EmptyAccessList,
    /// Strict domains reject accesses outside every registered object.
    #[error("access to {0:?} is outside every registered object")]
    UnregisteredRegion(Region),
    /// An object is already registered at this base address.
    #[error("object at base {0:#x} is already registered")]
    ObjectExists(u64),
    /// No object is registered at this base address.
    #[error("no object registered at base {0:#x}")]
    UnknownObject(u64),
}

/// Map the natural dependence type through the edge source: edges leaving a
/// pool sink report the pool flavor instead.
fn dep_from_source(source: &DependableObject, natural: DepType) -> DepType {
    match source.kind() {
        NodeKind::Concurrent => DepType::OutConcurrent,
        NodeKind::Commutative => DepType::OutCommutative,
        _ => natural,
    }
}

impl DependencyDomain {
    /// Register the node's accesses and install every data-ordering edge
    /// with previously submitted tasks, then publish the node as submitted
    /// and attempt release.
    ///
    /// Edges are derived per access in declaration order; within one access
    /// the tie-break is write-after-write, then write-after-read, then
    /// read-after-write, and overlapping records are visited in ascending
    /// region order. Re-deriving an edge that already exists is a no-op, so
    /// redundant overlap never double-counts a predecessor.
    ///
    /// The domain lock is held across the whole registration but never across
    /// a scheduler call: pool sinks displaced by this task are submitted, and
    /// the node itself released, only after the lock drops.
    pub fn submit(
        &self,
        node: &Arc<DependableObject>,
        ctx: DispatchCtx<'_>,
    ) -> Result<(), SubmitError> {
        if node.accesses().is_empty() {
            return Err(SubmitError::EmptyAccessList);
        }
        let mut to_close = Vec::new();
        {
            let mut state = lock(&self.state);
            // Validate the whole batch first: registration below cannot fail,
            // so a rejected submission installs nothing.
            if self.strict_objects {
                for access in node.accesses() {
                    let covered = state
                        .objects
                        .values()
                        .any(|object| object.contains(&access.region));
                    if !covered {
                        return Err(SubmitError::UnregisteredRegion(access.region));
                    }
                }
            }
            self.enroll(node);
            for access in node.accesses() {
                if access.region.is_empty() {
                    // A zero-length access intersects nothing.
                    continue;
                }
                match access.mode {
                    AccessMode::In => {
                        self.resolve_input(&mut state, node, access.region, ctx, &mut to_close);
                    }
                    AccessMode::Out => {
                        self.resolve_output(&mut state, node, access.region, false, ctx, &mut to_close);
                    }
                    AccessMode::InOut => {
                        self.resolve_output(&mut state, node, access.region, true, ctx, &mut to_close);
                    }
                    AccessMode::Concurrent | AccessMode::Commutative | AccessMode::Any => {
                        self.resolve_pooled(&mut state, node, access.mode, access.region, ctx, &mut to_close);
                    }
                }
            }
        }
        for sink in to_close {
            self.close_pool_sink(sink, ctx);
        }
        debug!(
            node = node.id().get(),
            accesses = node.accesses().len(),
            predecessors = node.num_predecessors(),
            "task linked"
        );
        node.mark_submitted(ctx);
        Ok(())
    }

    /// Read access: a true dependence on each overlapping record's writer,
    /// then join the record's reader set.
    fn resolve_input(
        &self,
        state: &mut DomainState,
        node: &Arc<DependableObject>,
        region: Region,
        ctx: DispatchCtx<'_>,
        to_close: &mut Vec<Arc<DependableObject>>,
    ) {
        for key in state.region_map.align(region) {
            let record = state.region_map.record_mut(key);
            record.displace_pool(to_close);
            let overlap = record.region;
            if let Some(writer) = record.last_writer.clone() {
                if writer.id() != node.id() {
                    writer.add_successor(
                        node,
                        EdgeKind::Dependency,
                        Some(dep_from_source(&writer, DepType::True)),
                        Some(overlap),
                        ctx,
                    );
                }
            }
            record.last_readers.insert(node.id(), Arc::clone(node));
        }
    }

    /// Write access: order after the previous writer and every reader, then
    /// become the record's writer. An inout additionally carries the true
    /// dependence from the displaced writer.
    fn resolve_output(
        &self,
        state: &mut DomainState,
        node: &Arc<DependableObject>,
        region: Region,
        inout: bool,
        ctx: DispatchCtx<'_>,
        to_close: &mut Vec<Arc<DependableObject>>,
    ) {
        for key in state.region_map.align(region) {
            let record = state.region_map.record_mut(key);
            record.displace_pool(to_close);
            let overlap = record.region;
            if let Some(writer) = record.last_writer.clone() {
                if writer.id() != node.id() {
                    writer.add_successor(
                        node,
                        EdgeKind::Dependency,
                        Some(dep_from_source(&writer, DepType::Output)),
                        Some(overlap),
                        ctx,
                    );
                }
            }
            for reader in record.last_readers.values() {
                if reader.id() != node.id() {
                    reader.add_successor(
                        node,
                        EdgeKind::Dependency,
                        Some(dep_from_source(reader, DepType::Anti)),
                        Some(overlap),
                        ctx,
                    );
                }
            }
            if inout {
                if let Some(writer) = record.last_writer.clone() {
                    if writer.id() != node.id() {
                        writer.add_successor(
                            node,
                            EdgeKind::Dependency,
                            Some(dep_from_source(&writer, DepType::True)),
                            Some(overlap),
                            ctx,
                        );
                    }
                }
            }
            record.last_writer = Some(Arc::clone(node));
            record.last_readers.clear();
        }
    }

    /// Pooled access: join (or open) the record's pool sink instead of
    /// serializing against matching peers. Members order individually
    /// against the record's writer and readers; the sink inherits ordering
    /// towards everything submitted after the pool.
    fn resolve_pooled(
        &self,
        state: &mut DomainState,
        node: &Arc<DependableObject>,
        mode: AccessMode,
        region: Region,
        ctx: DispatchCtx<'_>,
        to_close: &mut Vec<Arc<DependableObject>>,
    ) {
        let class = match mode {
            AccessMode::Commutative => PoolClass::Commutative,
            _ => PoolClass::Concurrent,
        };
        let (dep_in, dep_out) = match mode {
            AccessMode::Concurrent => (DepType::InConcurrent, DepType::OutConcurrent),
            AccessMode::Commutative => (DepType::InCommutative, DepType::OutCommutative),
            AccessMode::Any => (DepType::InAny, DepType::OutAny),
            _ => unreachable!("DependencyDomain::resolve_pooled: non-pooled mode"),
        };
        for key in state.region_map.align(region) {
            let record = state.region_map.record_mut(key);
            let matching = record
                .pool
                .as_ref()
                .is_some_and(|pool| pool.class == class);
            if !matching {
                record.displace_pool(to_close);
                let sink_kind = match class {
                    PoolClass::Commutative => NodeKind::Commutative,
                    PoolClass::Concurrent => NodeKind::Concurrent,
                };
                let sink = self.create_sink(sink_kind);
                record.pool = Some(PoolRecord { class, sink });
            }
            let sink = Arc::clone(&record.pool.as_ref().expect("resolve_pooled: pool just set").sink);
            let overlap = record.region;
            if let Some(writer) = record.last_writer.clone() {
                if writer.id() != node.id() {
                    writer.add_successor(
                        node,
                        EdgeKind::Dependency,
                        Some(dep_from_source(&writer, dep_in)),
                        Some(overlap),
                        ctx,
                    );
                }
            }
            for reader in record.last_readers.values() {
                if reader.id() != node.id() {
                    reader.add_successor(
                        node,
                        EdgeKind::Dependency,
                        Some(dep_from_source(reader, DepType::Anti)),
                        Some(overlap),
                        ctx,
                    );
                }
            }
            node.add_successor(&sink, EdgeKind::Dependency, Some(dep_out), Some(overlap), ctx);
            node.join_pool(&sink);
        }
    }
}
