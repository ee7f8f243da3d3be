use crate::{
    access::Region,
    domain::DependencyDomain,
    node::{DepType, EdgeKind, NodeKind},
    types::{HashMap, NodeId},
};
use serde::Serialize;

/// One declared input/output of a task, with the original's inclusive end
/// address convention.
#[derive(Debug, Clone, Serialize)]
pub struct IoRecord {
    /// Whether the access observes prior contents.
    pub is_input: bool,
    /// Whether the access may mutate the region.
    pub is_output: bool,
    /// First byte of the region.
    pub start_address: u64,
    /// Last byte of the region (inclusive).
    pub end_address: u64,
    /// Region length in bytes.
    pub size: u64,
}

/// One edge of the captured graph.
#[derive(Debug, Clone, Serialize)]
pub struct EdgeRecord {
    /// Source node id.
    pub source: u64,
    /// Target node id.
    pub target: u64,
    /// Structural classification.
    pub kind: EdgeKind,
    /// Dependence flavor; absent for nesting and synchronization edges.
    pub dep_type: Option<DepType>,
    /// Overlapping region the edge was derived from, if any.
    pub data_range: Option<Region>,
}

/// One node of the captured graph.
#[derive(Debug, Clone, Serialize)]
pub struct NodeRecord {
    /// Node id.
    pub wd_id: u64,
    /// Identifier of the function the node's work executes; zero for sinks.
    pub func_id: u64,
    /// Node role.
    pub node_type: NodeKind,
    /// Indices into [`GraphDump::edges`] of incoming edges.
    pub entry_edges: Vec<usize>,
    /// Indices into [`GraphDump::edges`] of outgoing edges.
    pub exit_edges: Vec<usize>,
    /// Declared accesses.
    pub io_accesses: Vec<IoRecord>,
}

/// Snapshot of the live task graph, in the record format consumed by
/// downstream graph tooling.
#[derive(Debug, Clone, Serialize)]
pub struct GraphDump {
    /// Captured nodes.
    pub nodes: Vec<NodeRecord>,
    /// Captured edges.
    pub edges: Vec<EdgeRecord>,
}

impl GraphDump {
    /// Capture the domain's live graph.
    ///
    /// Holds a reference on every captured node for the duration of the walk
    /// so none is reaped mid-capture. Each node's edge list is read under its
    /// own object lock; the capture as a whole is not atomic with respect to
    /// concurrent submission.
    #[must_use]
    pub fn capture(domain: &DependencyDomain) -> Self {
        let live = domain.live_nodes();
        for node in &live {
            node.increase_references();
        }

        let index: HashMap<NodeId, usize> = live
            .iter()
            .enumerate()
            .map(|(position, node)| (node.id(), position))
            .collect();
        let mut nodes: Vec<NodeRecord> = live
            .iter()
            .map(|node| NodeRecord {
                wd_id: node.id().get(),
                func_id: node.work().map_or(0, |work| work.func_id()),
                node_type: node.kind(),
                entry_edges: Vec::new(),
                exit_edges: Vec::new(),
                io_accesses: node
                    .accesses()
                    .iter()
                    .map(|access| IoRecord {
                        is_input: access.mode.reads(),
                        is_output: access.mode.writes(),
                        start_address: access.region.start,
                        end_address: access.region.end.saturating_sub(1),
                        size: access.region.len(),
                    })
                    .collect(),
            })
            .collect();

        let mut edges = Vec::new();
        for node in &live {
            for (target_id, kind, dep, range) in node.successor_edges() {
                let Some(&target_position) = index.get(&target_id) else {
                    continue;
                };
                let source_position = index[&node.id()];
                // Cohort edges run task -> Root internally; the dump renders
                // nesting parent -> child, as downstream tooling expects.
                let (source_position, target_position) =
                    if kind == EdgeKind::Nesting && live[target_position].kind() == NodeKind::Root {
                        (target_position, source_position)
                    } else {
                        (source_position, target_position)
                    };
                let edge_position = edges.len();
                edges.push(EdgeRecord {
                    source: nodes[source_position].wd_id,
                    target: nodes[target_position].wd_id,
                    kind,
                    dep_type: dep,
                    data_range: range,
                });
                nodes[source_position].exit_edges.push(edge_position);
                nodes[target_position].entry_edges.push(edge_position);
            }
        }

        for node in &live {
            node.decrease_references();
        }
        Self { nodes, edges }
    }

    /// Serialize the capture as pretty-printed JSON.
    ///
    /// # Errors
    /// Propagates serialization failures.
    pub fn to_json_string(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}
