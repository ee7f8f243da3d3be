use std::{num::NonZeroUsize, thread::available_parallelism};

/// Runtime tuning knobs.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Worker threads dispatching ready tasks. Zero spawns no built-in
    /// workers; ready tasks are then driven externally.
    pub workers: usize,
    /// Ready-queue backlog at which submission throttles. Zero disables
    /// admission control.
    pub max_ready_backlog: usize,
    /// Reject accesses that fall outside every registered object.
    pub strict_objects: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            workers: available_parallelism().map_or(1, NonZeroUsize::get),
            max_ready_backlog: 0,
            strict_objects: false,
        }
    }
}
