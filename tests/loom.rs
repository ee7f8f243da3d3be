#![allow(missing_docs)]
#![cfg(feature = "loom")]

use depflow::{
    work, AccessDescriptor, AccessMode, DependableObject, DependencyDomain, DispatchCtx,
    NoopProbe, SchedulePolicy, WorkError,
};
use loom::sync::{Arc, Mutex};

/// Policy that records every released node instead of running it.
struct CollectPolicy {
    released: Mutex<Vec<Arc<DependableObject>>>,
}

impl CollectPolicy {
    fn new() -> Self {
        Self {
            released: Mutex::new(Vec::new()),
        }
    }

    fn count_of(&self, id: depflow::types::NodeId) -> usize {
        self.released
            .lock()
            .unwrap()
            .iter()
            .filter(|node| node.id() == id)
            .count()
    }
}

impl SchedulePolicy for CollectPolicy {
    fn submit(&self, ready: Arc<DependableObject>) {
        self.released.lock().unwrap().push(ready);
    }
}

fn out(base: u64) -> Vec<AccessDescriptor> {
    vec![AccessDescriptor::new(base, 8, AccessMode::Out)]
}

fn input(base: u64) -> Vec<AccessDescriptor> {
    vec![AccessDescriptor::new(base, 8, AccessMode::In)]
}

#[test]
fn loom_submit_vs_finish_releases_reader_exactly_once() {
    // A writer finishing races a reader being submitted against the same
    // region. Whichever side observes the other first, the reader must be
    // released to the policy exactly once, and only after its linkage is
    // fully published.
    loom::model(|| {
        let domain = Arc::new(DependencyDomain::new(false));
        let policy = Arc::new(CollectPolicy::new());

        let writer = domain.create_task(Box::new(work::from_fn(|| {})), out(64));
        {
            let probe = NoopProbe;
            let ctx = DispatchCtx {
                policy: &*policy,
                probe: &probe,
            };
            domain.submit(&writer, ctx).unwrap();
        }
        assert_eq!(policy.count_of(writer.id()), 1);

        let finisher = {
            let policy = Arc::clone(&policy);
            let writer = Arc::clone(&writer);
            loom::thread::spawn(move || {
                let probe = NoopProbe;
                let ctx = DispatchCtx {
                    policy: &*policy,
                    probe: &probe,
                };
                writer.begin(ctx);
                writer.finish(false, ctx);
            })
        };
        let submitter = {
            let policy = Arc::clone(&policy);
            let domain = Arc::clone(&domain);
            loom::thread::spawn(move || {
                let probe = NoopProbe;
                let ctx = DispatchCtx {
                    policy: &*policy,
                    probe: &probe,
                };
                let reader = domain.create_task(Box::new(work::from_fn(|| {})), input(64));
                domain.submit(&reader, ctx).unwrap();
                reader
            })
        };
        finisher.join().unwrap();
        let reader = submitter.join().unwrap();

        assert_eq!(policy.count_of(reader.id()), 1);
        assert_eq!(reader.num_predecessors(), 0);
    });
}

#[test]
fn loom_racing_predecessors_release_shared_successor_once() {
    // Two writers of disjoint regions finish on separate threads; a reader
    // of both regions must be released exactly once, by whichever finisher
    // performs the last decrement.
    loom::model(|| {
        let domain = Arc::new(DependencyDomain::new(false));
        let policy = Arc::new(CollectPolicy::new());
        let probe = NoopProbe;
        let ctx = DispatchCtx {
            policy: &*policy,
            probe: &probe,
        };

        let first = domain.create_task(Box::new(work::from_fn(|| {})), out(64));
        domain.submit(&first, ctx).unwrap();
        let second = domain.create_task(Box::new(work::from_fn(|| {})), out(128));
        domain.submit(&second, ctx).unwrap();
        let reader = domain.create_task(
            Box::new(work::from_fn(|| {})),
            vec![
                AccessDescriptor::new(64, 8, AccessMode::In),
                AccessDescriptor::new(128, 8, AccessMode::In),
            ],
        );
        domain.submit(&reader, ctx).unwrap();
        assert_eq!(reader.num_predecessors(), 2);

        let spawn_finisher = |node: &Arc<DependableObject>| {
            let policy = Arc::clone(&policy);
            let node = Arc::clone(node);
            loom::thread::spawn(move || {
                let probe = NoopProbe;
                let ctx = DispatchCtx {
                    policy: &*policy,
                    probe: &probe,
                };
                node.begin(ctx);
                node.finish(false, ctx);
            })
        };
        let left = spawn_finisher(&first);
        let right = spawn_finisher(&second);
        left.join().unwrap();
        right.join().unwrap();

        assert_eq!(policy.count_of(reader.id()), 1);
        assert_eq!(reader.num_predecessors(), 0);
    });
}

#[test]
fn loom_wait_for_completion_observes_abort_flag() {
    loom::model(|| {
        let domain = Arc::new(DependencyDomain::new(false));
        let policy = Arc::new(CollectPolicy::new());
        let probe = NoopProbe;
        let ctx = DispatchCtx {
            policy: &*policy,
            probe: &probe,
        };

        let failing = domain.create_task(
            Box::new(work::FnWork::new(|| {
                Err(WorkError::Aborted("broken".into()))
            })),
            out(64),
        );
        domain.submit(&failing, ctx).unwrap();

        let finisher = {
            let policy = Arc::clone(&policy);
            let failing = Arc::clone(&failing);
            loom::thread::spawn(move || {
                let probe = NoopProbe;
                let ctx = DispatchCtx {
                    policy: &*policy,
                    probe: &probe,
                };
                failing.begin(ctx);
                failing.finish(true, ctx);
            })
        };
        let waiter = {
            let failing = Arc::clone(&failing);
            loom::thread::spawn(move || failing.wait_for_completion())
        };
        finisher.join().unwrap();
        let aborted = waiter.join().unwrap();

        assert!(aborted);
        assert!(failing.is_finished());
    });
}
