//! Dependency-driven task runtime with fine-grained, lock-ordered
//! synchronization.
//!
//! This crate accepts user work together with byte-range access
//! declarations, derives a dynamic task graph from memory overlap, and
//! releases tasks to a scheduling policy as their predecessors complete. It:
//! - Maintains a region map of commit records (last writer, current readers)
//!   and splits records on partial overlap so each sub-region orders
//!   independently.
//! - Links task nodes with typed edges (true, anti, output, pool variants)
//!   created under a strict source-before-target lock order, which is
//!   cycle-free because edges always point from earlier submissions to later
//!   ones.
//! - Publishes a node's `submitted` latch with release ordering and pairs it
//!   with acquire on the predecessor-decrement path, so a task is never
//!   released with its linkage half-installed.
//! - Collects concurrent and commutative accesses into per-region pools:
//!   members order only against non-matching accesses, and commutative
//!   members additionally funnel through a dispatch gate so at most one runs
//!   at a time, in no particular order.
//!
//! Key modules:
//! - `access`: byte ranges and access modes declared by tasks.
//! - `domain`: the region map and the overlap-resolution algorithm.
//! - `node`: the task-graph node and its lifecycle state machine.
//! - `policy`: the scheduler capability boundary and a FIFO implementation.
//! - `work`: the interface user work exposes to the core.
//! - `runtime`: the context object tying a domain, a policy, and worker
//!   threads together.
//! - `dump`: task-graph snapshots in the record format downstream tooling
//!   consumes.
//!
//! Quick start:
//! 1. Create a [`Runtime`] with a [`RuntimeConfig`].
//! 2. Submit closures wrapped via [`work::from_fn`] together with
//!    [`AccessDescriptor`]s describing what they read and write.
//! 3. Overlapping submissions run in dependency order; disjoint ones run in
//!    parallel. Call [`Runtime::taskwait`] to drain the scope.
//!
//! ```
//! use depflow::{work, AccessDescriptor, AccessMode, Runtime, RuntimeConfig};
//!
//! let runtime = Runtime::new(RuntimeConfig::default());
//! let producer = runtime
//!     .submit_task(
//!         Box::new(work::from_fn(|| { /* write the buffer */ })),
//!         vec![AccessDescriptor::new(0x1000, 64, AccessMode::Out)],
//!     )
//!     .unwrap();
//! let consumer = runtime
//!     .submit_task(
//!         Box::new(work::from_fn(|| { /* read the buffer */ })),
//!         vec![AccessDescriptor::new(0x1000, 64, AccessMode::In)],
//!     )
//!     .unwrap();
//! runtime.taskwait();
//! assert!(producer.is_finished() && consumer.is_finished());
//! runtime.shutdown();
//! ```
//!
//! The runtime guarantees that when a task runs, everything it declared as
//! input has been produced, with the appropriate happens-before relations;
//! a finishing task publishes its writes with a release fence before
//! decrementing its successors.

/// Byte ranges and access declarations.
pub mod access;
/// Runtime tuning knobs.
pub mod config;
/// The dependency domain: region map, overlap resolution, reaping.
///
/// Exposes [`DependencyDomain`](domain::DependencyDomain) with the `submit`
/// operation that installs all data-ordering edges for a task, and the
/// taskwait/pool-closing machinery built on top of it.
pub mod domain;
/// Task-graph snapshots for downstream tooling.
pub mod dump;
/// The task-graph node: predecessor counting, lifecycle states, completion
/// signalling, pool gates.
pub mod node;
/// The scheduler capability boundary (`at_successor`, `submit`,
/// `queue_size`) and the built-in FIFO policy.
pub mod policy;
/// Instrumentation hook points with no-op defaults.
pub mod probe;
/// The runtime context and worker pool.
pub mod runtime;
mod sync;
/// Common identifier and map aliases.
pub mod types;
/// The user-work boundary.
pub mod work;

pub use access::{AccessDescriptor, AccessMode, Region};
pub use config::RuntimeConfig;
pub use domain::{DependencyDomain, SubmitError};
pub use dump::GraphDump;
pub use node::{DepType, DependableObject, EdgeKind, LifeState, NodeKind};
pub use policy::{DispatchCtx, FifoPolicy, SchedulePolicy};
pub use probe::{NoopProbe, Probe};
pub use runtime::{Handle, Runtime, TaskHandle};
pub use work::{Work, WorkError};
