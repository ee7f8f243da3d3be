use core::num::NonZeroU64;
use indexmap::{IndexMap as _IndexMap, IndexSet as _IndexSet};
use rustc_hash::FxBuildHasher;
use std::collections::HashMap as _HashMap;

/// Unique identifier of a node in the task graph.
///
/// Monotonically assigned within a
/// [`DependencyDomain`](crate::domain::DependencyDomain); never reused for the
/// lifetime of the domain.
pub type NodeId = NonZeroU64;

pub(crate) type HashMap<K, V> = _HashMap<K, V, FxBuildHasher>;
/// `IndexMap` type with fast hasher.
pub type IndexMap<K, V> = _IndexMap<K, V, FxBuildHasher>;
pub(crate) type IndexSet<T> = _IndexSet<T, FxBuildHasher>;
