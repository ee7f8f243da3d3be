use crate::{
    access::Region,
    node::{DepType, DependableObject, EdgeKind, LifeState},
};

/// Instrumentation hook points of the dependency core.
///
/// Every method defaults to a no-op so observers implement only what they
/// consume. Callbacks may run under object locks; implementations must not
/// re-enter the core.
pub trait Probe: Send + Sync {
    /// An edge was installed between two live nodes.
    fn on_edge_created(
        &self,
        _source: &DependableObject,
        _target: &DependableObject,
        _kind: EdgeKind,
        _dep: Option<DepType>,
        _range: Option<Region>,
    ) {
    }

    /// A node moved to a new lifecycle state.
    fn on_state_change(&self, _node: &DependableObject, _state: LifeState) {}

    /// A worker is about to run the node's work.
    fn on_task_begin(&self, _node: &DependableObject) {}

    /// The node's work completed.
    fn on_task_end(&self, _node: &DependableObject, _aborted: bool) {}
}

/// The default observer: ignores everything.
pub struct NoopProbe;

impl Probe for NoopProbe {}
