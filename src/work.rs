use thiserror::Error;

/// Failure surfaced by user work.
///
/// A failing task still finishes from the dependency core's point of view;
/// the error only flips the abort flag that completion waiters observe.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum WorkError {
    /// The work reported a failure.
    #[error("task aborted: {0}")]
    Aborted(String),
    /// The work panicked; the panic was caught at the worker boundary.
    #[error("task panicked")]
    Panicked,
}

/// The unit of user work wrapped by a task node.
///
/// Opaque to the dependency core except through this interface: the worker
/// thread calls [`Work::run`] once the node is dispatched, and the core
/// forwards completion notifications between linked nodes.
pub trait Work: Send + Sync {
    /// Blocking execution entry point, invoked by the worker thread.
    fn run(&self) -> Result<(), WorkError>;

    /// Observe that the given predecessor's work just completed.
    ///
    /// Called once per resolved edge, before the predecessor count drops.
    fn predecessor_finished(&self, _predecessor: &dyn Work) {}

    /// Heuristic resource footprint, for accounting policies.
    fn size(&self) -> usize {
        0
    }

    /// Stable identifier of the function this work executes, surfaced by the
    /// task-graph dump.
    fn func_id(&self) -> u64 {
        0
    }
}

/// Adapter turning a closure into [`Work`].
pub struct FnWork<F> {
    f: F,
}

impl<F> FnWork<F>
where
    F: Fn() -> Result<(), WorkError> + Send + Sync,
{
    /// Wrap a fallible closure.
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F> Work for FnWork<F>
where
    F: Fn() -> Result<(), WorkError> + Send + Sync,
{
    fn run(&self) -> Result<(), WorkError> {
        (self.f)()
    }
}

/// Wrap an infallible closure as [`Work`].
pub fn from_fn<F>(f: F) -> FnWork<impl Fn() -> Result<(), WorkError> + Send + Sync>
where
    F: Fn() + Send + Sync,
{
    FnWork::new(move || {
        f();
        Ok(())
    })
}
