use crate::{
    access::{AccessDescriptor, Region},
    config::RuntimeConfig,
    domain::{DependencyDomain, SubmitError},
    dump::GraphDump,
    node::{DependableObject, EdgeKind, NodeKind},
    policy::{DispatchCtx, FifoPolicy, SchedulePolicy},
    probe::{NoopProbe, Probe},
    sync::{lock, thread, Arc, AtomicBool, Mutex, Ordering},
    work::Work,
};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use derive_more::Deref;
use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    time::Duration,
};
use tracing::{debug, warn};

/// How often parked workers re-check the stop flag.
const WORKER_POLL: Duration = Duration::from_millis(10);

struct RuntimeInner {
    domain: DependencyDomain,
    policy: Arc<dyn SchedulePolicy>,
    probe: Arc<dyn Probe>,
    root: Arc<DependableObject>,
    config: RuntimeConfig,
    stop: AtomicBool,
    /// Serializes concurrent barriers so the Root re-arm stays well-ordered.
    barrier_gate: Mutex<()>,
}

impl RuntimeInner {
    fn build(
        config: RuntimeConfig,
        policy: Arc<dyn SchedulePolicy>,
        probe: Arc<dyn Probe>,
    ) -> Self {
        let domain = DependencyDomain::new(config.strict_objects);
        let root = domain.create_sink(NodeKind::Root);
        Self {
            domain,
            policy,
            probe,
            root,
            config,
            stop: AtomicBool::new(false),
            barrier_gate: Mutex::new(()),
        }
    }

    fn ctx(&self) -> DispatchCtx<'_> {
        DispatchCtx {
            policy: &*self.policy,
            probe: &*self.probe,
        }
    }

    /// Spin until the ready queue falls below the admission bound.
    fn throttle(&self) {
        let limit = self.config.max_ready_backlog;
        if limit == 0 {
            return;
        }
        while self.policy.queue_size() >= limit {
            thread::yield_now();
        }
    }

    /// Enroll the task in the Root cohort via a nesting edge task -> Root.
    ///
    /// The edge is skipped when the task already finished: nothing is left
    /// for the cohort to account for.
    fn enroll_root(&self, node: &Arc<DependableObject>, ctx: DispatchCtx<'_>) {
        node.add_successor(&self.root, EdgeKind::Nesting, None, None, ctx);
    }

    fn submit_task(
        &self,
        work: Box<dyn Work>,
        accesses: Vec<AccessDescriptor>,
    ) -> Result<TaskHandle, SubmitError> {
        self.throttle();
        let ctx = self.ctx();
        let node = self.domain.create_task(work, accesses);
        self.domain.submit(&node, ctx)?;
        self.enroll_root(&node, ctx);
        Ok(TaskHandle::new(node))
    }

    fn taskwait(&self) {
        let ctx = self.ctx();
        let waiter = self.domain.taskwait_node(ctx);
        waiter.increase_references();
        waiter.wait_for_completion();
        waiter.decrease_references();
        self.domain.retire(&waiter);
        self.domain.reap();
    }

    /// Repeatedly arm barrier sinks until a round observes a quiescent
    /// domain, so work submitted by draining tasks is drained too.
    fn barrier(&self) {
        let _serialized = lock(&self.barrier_gate);
        let ctx = self.ctx();
        loop {
            self.domain.close_all_pools(ctx);
            let (barrier, installed) = self.domain.barrier_node(ctx);
            barrier.increase_references();
            barrier.wait_for_completion();
            barrier.decrease_references();
            self.domain.retire(&barrier);
            self.domain.reap();
            if installed == 0 {
                break;
            }
        }
    }

    /// Arm the Root sink and wait for the whole cohort to drain, then
    /// disarm it for reuse. The Root's completion implies every enrolled
    /// task has finished.
    fn drain_cohort(&self) {
        let _serialized = lock(&self.barrier_gate);
        let ctx = self.ctx();
        self.domain.close_all_pools(ctx);
        self.root.increase_references();
        self.root.mark_submitted(ctx);
        self.root.wait_for_completion();
        self.root.disable_submission();
        self.root.decrease_references();
        self.domain.reap();
    }

    fn run_node(&self, node: &Arc<DependableObject>) {
        let ctx = self.ctx();
        node.begin(ctx);
        let outcome = node
            .work()
            .map(|work| catch_unwind(AssertUnwindSafe(|| work.run())));
        let aborted = match outcome {
            None | Some(Ok(Ok(()))) => false,
            Some(Ok(Err(error))) => {
                debug!(node = node.id().get(), %error, "task aborted");
                true
            }
            Some(Err(_panic)) => {
                warn!(node = node.id().get(), "task panicked");
                true
            }
        };
        node.finish(aborted, ctx);
        self.domain.retire(node);
        self.domain.reap();
    }
}

fn worker_loop(inner: &RuntimeInner, ready: &Receiver<Arc<DependableObject>>) {
    loop {
        match ready.recv_timeout(WORKER_POLL) {
            Ok(node) => inner.run_node(&node),
            Err(RecvTimeoutError::Timeout) => {
                if inner.stop.load(Ordering::Acquire) && ready.is_empty() {
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}

/// External hold on a submitted task.
///
/// Keeps the node alive (it is not reaped while any handle exists) and
/// dereferences to it, so completion state and
/// [`wait_for_completion`](DependableObject::wait_for_completion) are
/// available directly.
#[derive(Debug, Deref)]
pub struct TaskHandle {
    #[deref]
    node: Arc<DependableObject>,
}

impl TaskHandle {
    fn new(node: Arc<DependableObject>) -> Self {
        node.increase_references();
        Self { node }
    }
}

impl Clone for TaskHandle {
    fn clone(&self) -> Self {
        Self::new(Arc::clone(&self.node))
    }
}

impl Drop for TaskHandle {
    fn drop(&mut self) {
        self.node.decrease_references();
    }
}

/// Cloneable handle to a running [`Runtime`].
///
/// Lets task bodies submit nested work or taskwait from inside a worker;
/// blocking calls block the worker thread they run on.
#[derive(Clone)]
pub struct Handle {
    inner: Arc<RuntimeInner>,
}

impl Handle {
    /// See [`Runtime::submit_task`].
    pub fn submit_task(
        &self,
        work: Box<dyn Work>,
        accesses: Vec<AccessDescriptor>,
    ) -> Result<TaskHandle, SubmitError> {
        self.inner.submit_task(work, accesses)
    }

    /// See [`Runtime::taskwait`].
    pub fn taskwait(&self) {
        self.inner.taskwait();
    }

    /// See [`Runtime::barrier`].
    pub fn barrier(&self) {
        self.inner.barrier();
    }

    /// See [`Runtime::execute_now`].
    pub fn execute_now(&self, node: &Arc<DependableObject>) {
        self.inner.run_node(node);
    }
}

/// The runtime context: one dependency domain, a scheduling policy, and the
/// worker threads that drive ready tasks.
///
/// Every public entry point threads this context down into the core; the
/// library keeps no process-wide state.
pub struct Runtime {
    inner: Arc<RuntimeInner>,
    workers: Vec<thread::JoinHandle<()>>,
}

impl Runtime {
    /// Runtime with the built-in FIFO policy and `config.workers` worker
    /// threads.
    #[must_use]
    pub fn new(config: RuntimeConfig) -> Self {
        let policy = FifoPolicy::new();
        let ready = policy.receiver();
        let inner = Arc::new(RuntimeInner::build(
            config,
            Arc::new(policy),
            Arc::new(NoopProbe),
        ));
        let workers = (0..inner.config.workers)
            .map(|_| {
                let inner = Arc::clone(&inner);
                let ready = ready.clone();
                thread::spawn(move || worker_loop(&inner, &ready))
            })
            .collect();
        Self { inner, workers }
    }

    /// Runtime driven by an external scheduler: `policy` receives ready
    /// nodes and no built-in workers are spawned. The driver runs nodes via
    /// [`Self::execute_now`].
    #[must_use]
    pub fn with_scheduler(
        config: RuntimeConfig,
        policy: Arc<dyn SchedulePolicy>,
        probe: Arc<dyn Probe>,
    ) -> Self {
        let inner = Arc::new(RuntimeInner::build(config, policy, probe));
        Self {
            inner,
            workers: Vec::new(),
        }
    }

    /// A cloneable handle usable from inside task bodies.
    #[must_use]
    pub fn handle(&self) -> Handle {
        Handle {
            inner: Arc::clone(&self.inner),
        }
    }

    /// The underlying dependency domain.
    #[must_use]
    pub fn domain(&self) -> &DependencyDomain {
        &self.inner.domain
    }

    /// Submit one unit of work with its access declarations.
    ///
    /// On return all ordering edges with previously submitted tasks are in
    /// place and the task is released to the scheduler as soon as its
    /// predecessors drain (immediately, if it has none).
    ///
    /// # Errors
    /// Rejected submissions install nothing; see [`SubmitError`].
    pub fn submit_task(
        &self,
        work: Box<dyn Work>,
        accesses: Vec<AccessDescriptor>,
    ) -> Result<TaskHandle, SubmitError> {
        self.inner.submit_task(work, accesses)
    }

    /// Block until every task submitted so far in this domain has finished.
    pub fn taskwait(&self) {
        self.inner.taskwait();
    }

    /// Block until every task in the team has finished, including work
    /// submitted by tasks that finish while the barrier drains.
    pub fn barrier(&self) {
        self.inner.barrier();
    }

    /// Attach user memory regions; see
    /// [`DependencyDomain::register_object`].
    ///
    /// # Errors
    /// See [`SubmitError`].
    pub fn register_object(&self, regions: &[Region]) -> Result<(), SubmitError> {
        self.inner.domain.register_object(regions)
    }

    /// Detach the object registered at `base`.
    ///
    /// # Errors
    /// See [`SubmitError`].
    pub fn unregister_object(&self, base: u64) -> Result<(), SubmitError> {
        self.inner.domain.unregister_object(base)
    }

    /// Run a ready node on the calling thread: used by external scheduler
    /// drivers paired with [`Self::with_scheduler`].
    pub fn execute_now(&self, node: &Arc<DependableObject>) {
        self.inner.run_node(node);
    }

    /// Capture the live task graph.
    #[must_use]
    pub fn dump(&self) -> GraphDump {
        GraphDump::capture(&self.inner.domain)
    }

    /// Drain outstanding work, stop the workers, and join them.
    pub fn shutdown(mut self) {
        self.inner.drain_cohort();
        self.join_workers();
    }

    fn join_workers(&mut self) {
        self.inner.stop.store(true, Ordering::Release);
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

impl Drop for Runtime {
    /// Stops workers once the ready queue empties. Outstanding submissions
    /// are not awaited; call [`Self::shutdown`] (or a barrier) first to
    /// drain.
    fn drop(&mut self) {
        self.join_workers();
    }
}
