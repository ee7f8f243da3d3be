use crate::{
    access::Region,
    node::DependableObject,
    sync::Arc,
    types::{IndexMap, NodeId},
};
use std::collections::BTreeMap;

/// Pool flavor recorded on a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PoolClass {
    Concurrent,
    Commutative,
}

/// An open pool on a region: matching accesses join `sink` instead of
/// serializing against each other.
#[derive(Clone)]
pub(crate) struct PoolRecord {
    pub(crate) class: PoolClass,
    pub(crate) sink: Arc<DependableObject>,
}

/// Region-map entry tracking the most recent writer and the current reader
/// set for one byte range. Records never overlap each other.
pub(crate) struct CommitRecord {
    pub(crate) region: Region,
    pub(crate) last_writer: Option<Arc<DependableObject>>,
    pub(crate) last_readers: IndexMap<NodeId, Arc<DependableObject>>,
    pub(crate) pool: Option<PoolRecord>,
}

impl CommitRecord {
    fn empty(region: Region) -> Self {
        Self {
            region,
            last_writer: None,
            last_readers: IndexMap::default(),
            pool: None,
        }
    }

    fn is_idle(&self) -> bool {
        self.last_writer.is_none() && self.last_readers.is_empty() && self.pool.is_none()
    }

    /// Close an open pool on this record, if any.
    ///
    /// The sink collapses the pool: it becomes the record's writer, so any
    /// later access orders against the whole pool through it. The sink is
    /// appended to `to_close` (once, even when it spans several records) for
    /// submission after the domain lock drops.
    pub(crate) fn displace_pool(&mut self, to_close: &mut Vec<Arc<DependableObject>>) {
        if let Some(pool) = self.pool.take() {
            self.last_writer = Some(Arc::clone(&pool.sink));
            self.last_readers.clear();
            if to_close.iter().all(|sink| sink.id() != pool.sink.id()) {
                to_close.push(pool.sink);
            }
        }
    }
}

/// Mapping from region start to commit record, mutated only under the domain
/// lock. Keys ascend, which fixes the order overlapping records are visited
/// in during resolution.
pub(crate) struct RegionMap {
    records: BTreeMap<u64, CommitRecord>,
}

impl RegionMap {
    pub(crate) fn new() -> Self {
        Self {
            records: BTreeMap::new(),
        }
    }

    pub(crate) fn record_mut(&mut self, key: u64) -> &mut CommitRecord {
        self.records
            .get_mut(&key)
            .expect("RegionMap::record_mut: stale key")
    }

    pub(crate) fn records_mut(&mut self) -> impl Iterator<Item = &mut CommitRecord> {
        self.records.values_mut()
    }

    /// Split records at the boundaries of `region` and materialize empty
    /// records over uncovered gaps, so that afterwards `region` is exactly
    /// tiled. Returns the tile keys, ascending.
    ///
    /// Exact matches need no work; partial overlap forces the split here so
    /// each sub-region carries its own writer and reader set.
    pub(crate) fn align(&mut self, region: Region) -> Vec<u64> {
        assert!(!region.is_empty(), "RegionMap::align: empty region");
        // A record straddling the left boundary.
        if let Some((&key, record)) = self.records.range(..region.start).next_back() {
            if record.region.end > region.start {
                self.split_at(key, region.start);
            }
        }
        // A record straddling the right boundary (possibly the right half of
        // the previous split).
        if let Some((&key, record)) = self.records.range(..region.end).next_back() {
            if record.region.end > region.end {
                self.split_at(key, region.end);
            }
        }
        let existing: Vec<(u64, u64)> = self
            .records
            .range(region.start..region.end)
            .map(|(&key, record)| (key, record.region.end))
            .collect();
        let mut keys = Vec::with_capacity(existing.len() + 1);
        let mut cursor = region.start;
        for (key, end) in existing {
            if cursor < key {
                let gap = Region {
                    start: cursor,
                    end: key,
                };
                self.records.insert(cursor, CommitRecord::empty(gap));
                keys.push(cursor);
            }
            keys.push(key);
            cursor = end;
        }
        if cursor < region.end {
            let gap = Region {
                start: cursor,
                end: region.end,
            };
            self.records.insert(cursor, CommitRecord::empty(gap));
            keys.push(cursor);
        }
        keys
    }

    fn split_at(&mut self, key: u64, at: u64) {
        let mut record = self
            .records
            .remove(&key)
            .expect("RegionMap::split_at: stale key");
        assert!(
            record.region.start < at && at < record.region.end,
            "RegionMap::split_at: boundary outside record"
        );
        let right = CommitRecord {
            region: Region {
                start: at,
                end: record.region.end,
            },
            last_writer: record.last_writer.clone(),
            last_readers: record.last_readers.clone(),
            pool: record.pool.clone(),
        };
        record.region.end = at;
        self.records.insert(key, record);
        self.records.insert(at, right);
    }

    /// Drop every reference to a reaped node and discard records that become
    /// idle.
    pub(crate) fn purge_node(&mut self, id: NodeId) {
        for record in self.records.values_mut() {
            if record
                .last_writer
                .as_ref()
                .is_some_and(|writer| writer.id() == id)
            {
                record.last_writer = None;
            }
            record.last_readers.swap_remove(&id);
            if record.pool.as_ref().is_some_and(|pool| pool.sink.id() == id) {
                record.pool = None;
            }
        }
        self.records.retain(|_, record| !record.is_idle());
    }
}
