#![allow(missing_docs)]
#![cfg(not(feature = "loom"))]

use depflow::{
    work, AccessDescriptor, AccessMode, DepType, DependableObject, EdgeKind, NodeKind, NoopProbe,
    Runtime, RuntimeConfig, SchedulePolicy, SubmitError, Work, WorkError,
};
use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc, Barrier, Mutex,
};
use std::time::Duration;

fn config(workers: usize) -> RuntimeConfig {
    RuntimeConfig {
        workers,
        ..RuntimeConfig::default()
    }
}

fn logger(log: &Arc<Mutex<Vec<&'static str>>>, label: &'static str) -> Box<dyn Work> {
    let log = Arc::clone(log);
    Box::new(work::from_fn(move || {
        log.lock().unwrap().push(label);
    }))
}

fn position(log: &[&str], label: &str) -> usize {
    log.iter()
        .position(|&entry| entry == label)
        .unwrap_or_else(|| panic!("{label} never ran"))
}

#[test]
fn raw_writer_completes_before_overlapping_reader() {
    // A writes [0, 64); B reads [32, 96). One true dependence A -> B.
    let runtime = Runtime::new(config(2));
    let log = Arc::new(Mutex::new(Vec::new()));
    let writer = runtime
        .submit_task(
            logger(&log, "A"),
            vec![AccessDescriptor::new(0x1000, 64, AccessMode::Out)],
        )
        .unwrap();
    assert!(writer.needs_submission());
    let reader = runtime
        .submit_task(
            logger(&log, "B"),
            vec![AccessDescriptor::new(0x1020, 64, AccessMode::In)],
        )
        .unwrap();
    runtime.taskwait();

    let log = log.lock().unwrap();
    assert!(position(&log, "A") < position(&log, "B"));
    assert!(writer.is_finished() && !writer.is_aborted());
    assert!(reader.is_finished() && !reader.is_aborted());
    runtime.shutdown();
}

#[test]
fn war_then_waw_chain_runs_in_submission_order() {
    // A reads, B writes, C writes the same range: A -> B (anti), B -> C
    // (output).
    let runtime = Runtime::new(config(4));
    let log = Arc::new(Mutex::new(Vec::new()));
    for (label, mode) in [
        ("A", AccessMode::In),
        ("B", AccessMode::Out),
        ("C", AccessMode::Out),
    ] {
        runtime
            .submit_task(
                logger(&log, label),
                vec![AccessDescriptor::new(0x2000, 64, mode)],
            )
            .unwrap();
    }
    runtime.taskwait();

    let log = log.lock().unwrap();
    assert!(position(&log, "A") < position(&log, "B"));
    assert!(position(&log, "B") < position(&log, "C"));
    runtime.shutdown();
}

#[test]
fn disjoint_writers_run_concurrently() {
    // No overlap, no edges: both tasks must be in flight at the same time to
    // get past the rendezvous.
    let runtime = Runtime::new(config(2));
    let rendezvous = Arc::new(Barrier::new(2));
    for base in [0x3000u64, 0x3080] {
        let rendezvous = Arc::clone(&rendezvous);
        runtime
            .submit_task(
                Box::new(work::from_fn(move || {
                    rendezvous.wait();
                })),
                vec![AccessDescriptor::new(base, 64, AccessMode::Out)],
            )
            .unwrap();
    }
    runtime.taskwait();
    runtime.shutdown();
}

#[test]
fn commutative_pool_is_mutually_exclusive_and_ordered_against_outsiders() {
    let runtime = Runtime::new(config(4));
    let writer_done = Arc::new(AtomicBool::new(false));
    let members_done = Arc::new(AtomicUsize::new(0));
    let active = Arc::new(AtomicUsize::new(0));
    let max_active = Arc::new(AtomicUsize::new(0));
    let violations = Arc::new(AtomicUsize::new(0));

    {
        let writer_done = Arc::clone(&writer_done);
        runtime
            .submit_task(
                Box::new(work::from_fn(move || {
                    std::thread::sleep(Duration::from_millis(5));
                    writer_done.store(true, Ordering::SeqCst);
                })),
                vec![AccessDescriptor::new(0x4000, 64, AccessMode::Out)],
            )
            .unwrap();
    }
    for _ in 0..3 {
        let writer_done = Arc::clone(&writer_done);
        let members_done = Arc::clone(&members_done);
        let active = Arc::clone(&active);
        let max_active = Arc::clone(&max_active);
        let violations = Arc::clone(&violations);
        runtime
            .submit_task(
                Box::new(work::from_fn(move || {
                    if !writer_done.load(Ordering::SeqCst) {
                        violations.fetch_add(1, Ordering::SeqCst);
                    }
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    max_active.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(5));
                    active.fetch_sub(1, Ordering::SeqCst);
                    members_done.fetch_add(1, Ordering::SeqCst);
                })),
                vec![AccessDescriptor::new(0x4000, 64, AccessMode::Commutative)],
            )
            .unwrap();
    }
    {
        let members_done = Arc::clone(&members_done);
        let violations = Arc::clone(&violations);
        runtime
            .submit_task(
                Box::new(work::from_fn(move || {
                    if members_done.load(Ordering::SeqCst) != 3 {
                        violations.fetch_add(1, Ordering::SeqCst);
                    }
                })),
                vec![AccessDescriptor::new(0x4000, 64, AccessMode::Out)],
            )
            .unwrap();
    }
    runtime.taskwait();

    assert_eq!(violations.load(Ordering::SeqCst), 0);
    assert_eq!(members_done.load(Ordering::SeqCst), 3);
    assert_eq!(max_active.load(Ordering::SeqCst), 1, "pool members overlapped");
    runtime.shutdown();
}

#[test]
fn concurrent_pool_members_overlap() {
    // Concurrent members share the region without mutual exclusion; the
    // rendezvous only completes if both run at once.
    let runtime = Runtime::new(config(2));
    let rendezvous = Arc::new(Barrier::new(2));
    for _ in 0..2 {
        let rendezvous = Arc::clone(&rendezvous);
        runtime
            .submit_task(
                Box::new(work::from_fn(move || {
                    rendezvous.wait();
                })),
                vec![AccessDescriptor::new(0x5000, 64, AccessMode::Concurrent)],
            )
            .unwrap();
    }
    runtime.taskwait();
    runtime.shutdown();
}

#[test]
fn taskwait_drains_all_outstanding_writers() {
    let runtime = Runtime::new(config(4));
    let done = Arc::new(AtomicUsize::new(0));
    for index in 0..10u64 {
        let done = Arc::clone(&done);
        runtime
            .submit_task(
                Box::new(work::from_fn(move || {
                    done.fetch_add(1, Ordering::SeqCst);
                })),
                vec![AccessDescriptor::new(
                    0x6000 + index * 0x100,
                    64,
                    AccessMode::Out,
                )],
            )
            .unwrap();
    }
    runtime.taskwait();
    assert_eq!(done.load(Ordering::SeqCst), 10);
    runtime.shutdown();
}

#[test]
fn partial_overlap_splits_the_commit_record() {
    // Structural check with no workers: nothing runs, the graph stays put.
    let runtime = Runtime::new(config(0));
    let writer = runtime
        .submit_task(
            logger(&Arc::new(Mutex::new(Vec::new())), "A"),
            vec![AccessDescriptor::new(0x100, 100, AccessMode::Out)],
        )
        .unwrap();
    let reader = runtime
        .submit_task(
            logger(&Arc::new(Mutex::new(Vec::new())), "B"),
            vec![AccessDescriptor::new(0x132, 100, AccessMode::In)],
        )
        .unwrap();
    // Touches only the writer's un-read prefix: depends on A, not on B.
    let prefix_writer = runtime
        .submit_task(
            logger(&Arc::new(Mutex::new(Vec::new())), "C"),
            vec![AccessDescriptor::new(0x100, 50, AccessMode::Out)],
        )
        .unwrap();
    // Touches only the reader's tail beyond A: depends on B alone.
    let tail_writer = runtime
        .submit_task(
            logger(&Arc::new(Mutex::new(Vec::new())), "D"),
            vec![AccessDescriptor::new(0x178, 28, AccessMode::Out)],
        )
        .unwrap();

    let dump = runtime.dump();
    let deps: Vec<_> = dump
        .edges
        .iter()
        .filter(|edge| edge.kind == EdgeKind::Dependency)
        .collect();

    let raw: Vec<_> = deps
        .iter()
        .filter(|edge| edge.source == writer.id().get() && edge.target == reader.id().get())
        .collect();
    assert_eq!(raw.len(), 1);
    assert_eq!(raw[0].dep_type, Some(DepType::True));
    let range = raw[0].data_range.unwrap();
    assert_eq!((range.start, range.end), (0x132, 0x164));

    let into_prefix: Vec<_> = deps
        .iter()
        .filter(|edge| edge.target == prefix_writer.id().get())
        .collect();
    assert_eq!(into_prefix.len(), 1);
    assert_eq!(into_prefix[0].source, writer.id().get());
    assert_eq!(into_prefix[0].dep_type, Some(DepType::Output));

    let into_tail: Vec<_> = deps
        .iter()
        .filter(|edge| edge.target == tail_writer.id().get())
        .collect();
    assert_eq!(into_tail.len(), 1);
    assert_eq!(into_tail[0].source, reader.id().get());
    assert_eq!(into_tail[0].dep_type, Some(DepType::Anti));
}

#[test]
fn duplicate_accesses_install_a_single_edge() {
    let runtime = Runtime::new(config(0));
    let writer = runtime
        .submit_task(
            Box::new(work::from_fn(|| {})),
            vec![AccessDescriptor::new(0x7000, 64, AccessMode::Out)],
        )
        .unwrap();
    let reader = runtime
        .submit_task(
            Box::new(work::from_fn(|| {})),
            vec![
                AccessDescriptor::new(0x7000, 64, AccessMode::In),
                AccessDescriptor::new(0x7000, 64, AccessMode::In),
            ],
        )
        .unwrap();
    assert_eq!(reader.num_predecessors(), 1);

    let dump = runtime.dump();
    let raw = dump
        .edges
        .iter()
        .filter(|edge| {
            edge.source == writer.id().get()
                && edge.target == reader.id().get()
                && edge.kind == EdgeKind::Dependency
        })
        .count();
    assert_eq!(raw, 1);
}

#[test]
fn aborting_writer_does_not_poison_readers() {
    let runtime = Runtime::new(config(2));
    let reader_ran = Arc::new(AtomicBool::new(false));
    let writer = runtime
        .submit_task(
            Box::new(work::FnWork::new(|| {
                Err(WorkError::Aborted("checksum mismatch".into()))
            })),
            vec![AccessDescriptor::new(0x8000, 64, AccessMode::Out)],
        )
        .unwrap();
    let reader = {
        let reader_ran = Arc::clone(&reader_ran);
        runtime
            .submit_task(
                Box::new(work::from_fn(move || {
                    reader_ran.store(true, Ordering::SeqCst);
                })),
                vec![AccessDescriptor::new(0x8000, 64, AccessMode::In)],
            )
            .unwrap()
    };
    runtime.taskwait();

    assert!(writer.is_finished() && writer.is_aborted());
    assert!(reader.is_finished() && !reader.is_aborted());
    assert!(reader_ran.load(Ordering::SeqCst));
    runtime.shutdown();
}

#[test]
fn panicking_task_finishes_with_abort_flag() {
    let runtime = Runtime::new(config(2));
    let panicker = runtime
        .submit_task(
            Box::new(work::from_fn(|| panic!("boom"))),
            vec![AccessDescriptor::new(0x9000, 64, AccessMode::Out)],
        )
        .unwrap();
    runtime.taskwait();
    assert!(panicker.is_finished() && panicker.is_aborted());
    assert!(panicker.wait_for_completion());
    runtime.shutdown();
}

#[test]
fn barrier_drains_each_epoch() {
    let runtime = Runtime::new(config(2));
    let done = Arc::new(AtomicUsize::new(0));
    for epoch in 0..2u64 {
        for index in 0..4u64 {
            let done = Arc::clone(&done);
            runtime
                .submit_task(
                    Box::new(work::from_fn(move || {
                        done.fetch_add(1, Ordering::SeqCst);
                    })),
                    vec![AccessDescriptor::new(
                        0xA000 + index * 0x100,
                        64,
                        AccessMode::Out,
                    )],
                )
                .unwrap();
        }
        runtime.barrier();
        assert_eq!(done.load(Ordering::SeqCst) as u64, (epoch + 1) * 4);
    }
    runtime.shutdown();
}

#[test]
fn nested_submission_counts_toward_the_barrier() {
    let runtime = Runtime::new(config(2));
    let handle = runtime.handle();
    let nested_ran = Arc::new(AtomicBool::new(false));
    {
        let nested_ran = Arc::clone(&nested_ran);
        runtime
            .submit_task(
                Box::new(work::from_fn(move || {
                    let nested_ran = Arc::clone(&nested_ran);
                    handle
                        .submit_task(
                            Box::new(work::from_fn(move || {
                                nested_ran.store(true, Ordering::SeqCst);
                            })),
                            vec![AccessDescriptor::new(0xB100, 64, AccessMode::Out)],
                        )
                        .unwrap();
                })),
                vec![AccessDescriptor::new(0xB000, 64, AccessMode::Out)],
            )
            .unwrap();
    }
    runtime.barrier();
    assert!(nested_ran.load(Ordering::SeqCst));
    runtime.shutdown();
}

#[test]
fn strict_domain_rejects_unregistered_accesses() {
    let runtime = Runtime::new(RuntimeConfig {
        workers: 1,
        strict_objects: true,
        ..RuntimeConfig::default()
    });
    let stray = runtime.submit_task(
        Box::new(work::from_fn(|| {})),
        vec![AccessDescriptor::new(0xC000, 64, AccessMode::Out)],
    );
    assert_eq!(
        stray.unwrap_err(),
        SubmitError::UnregisteredRegion(depflow::Region::new(0xC000, 64))
    );

    runtime
        .register_object(&[depflow::Region::new(0xC000, 4096)])
        .unwrap();
    assert_eq!(
        runtime
            .register_object(&[depflow::Region::new(0xC000, 64)])
            .unwrap_err(),
        SubmitError::ObjectExists(0xC000)
    );

    runtime
        .submit_task(
            Box::new(work::from_fn(|| {})),
            vec![AccessDescriptor::new(0xC000, 64, AccessMode::Out)],
        )
        .unwrap();
    runtime.taskwait();

    assert_eq!(
        runtime.unregister_object(0xD000).unwrap_err(),
        SubmitError::UnknownObject(0xD000)
    );
    runtime.unregister_object(0xC000).unwrap();
    runtime.shutdown();
}

#[test]
fn empty_access_list_is_rejected() {
    let runtime = Runtime::new(config(0));
    let outcome = runtime.submit_task(Box::new(work::from_fn(|| {})), vec![]);
    assert_eq!(outcome.unwrap_err(), SubmitError::EmptyAccessList);
}

struct TrackedWork {
    id: u64,
    seen: Arc<Mutex<Vec<u64>>>,
}

impl Work for TrackedWork {
    fn run(&self) -> Result<(), WorkError> {
        Ok(())
    }

    fn predecessor_finished(&self, predecessor: &dyn Work) {
        self.seen.lock().unwrap().push(predecessor.func_id());
    }

    fn func_id(&self) -> u64 {
        self.id
    }
}

#[test]
fn successors_observe_which_predecessor_finished() {
    let runtime = Runtime::new(config(2));
    let seen = Arc::new(Mutex::new(Vec::new()));
    runtime
        .submit_task(
            Box::new(TrackedWork {
                id: 11,
                seen: Arc::clone(&seen),
            }),
            vec![AccessDescriptor::new(0xE000, 64, AccessMode::Out)],
        )
        .unwrap();
    runtime
        .submit_task(
            Box::new(TrackedWork {
                id: 22,
                seen: Arc::clone(&seen),
            }),
            vec![AccessDescriptor::new(0xE000, 64, AccessMode::In)],
        )
        .unwrap();
    runtime.taskwait();
    assert_eq!(*seen.lock().unwrap(), vec![11]);
    runtime.shutdown();
}

#[derive(Default)]
struct CollectPolicy {
    ready: Mutex<Vec<Arc<DependableObject>>>,
    new_edges: AtomicUsize,
}

impl CollectPolicy {
    fn pop(&self) -> Option<Arc<DependableObject>> {
        let mut ready = self.ready.lock().unwrap();
        if ready.is_empty() {
            None
        } else {
            Some(ready.remove(0))
        }
    }
}

impl SchedulePolicy for CollectPolicy {
    fn at_successor(
        &self,
        _target: &DependableObject,
        _source: Option<&DependableObject>,
        is_new_edge: bool,
        _remaining_preds: usize,
    ) {
        if is_new_edge {
            self.new_edges.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn submit(&self, ready: Arc<DependableObject>) {
        self.ready.lock().unwrap().push(ready);
    }
}

#[test]
fn external_scheduler_drives_release_order() {
    let policy = Arc::new(CollectPolicy::default());
    let policy_handle: Arc<dyn SchedulePolicy> = policy.clone();
    let runtime = Runtime::with_scheduler(config(0), policy_handle, Arc::new(NoopProbe));

    let writer = runtime
        .submit_task(
            Box::new(work::from_fn(|| {})),
            vec![AccessDescriptor::new(0xF000, 64, AccessMode::Out)],
        )
        .unwrap();
    let reader = runtime
        .submit_task(
            Box::new(work::from_fn(|| {})),
            vec![AccessDescriptor::new(0xF000, 64, AccessMode::In)],
        )
        .unwrap();

    // One data edge plus each task's cohort edge to the Root.
    assert_eq!(policy.new_edges.load(Ordering::SeqCst), 3);

    let first = policy.pop().expect("writer should be ready");
    assert_eq!(first.id(), writer.id());
    assert!(policy.pop().is_none(), "reader released early");

    runtime.execute_now(&first);
    let second = policy.pop().expect("reader should be ready after writer");
    assert_eq!(second.id(), reader.id());
    runtime.execute_now(&second);
    assert!(reader.is_finished());
}

#[test]
fn dump_renders_root_nesting_and_io_records() {
    let runtime = Runtime::new(config(0));
    let task = runtime
        .submit_task(
            Box::new(work::from_fn(|| {})),
            vec![AccessDescriptor::new(0x1_0000, 128, AccessMode::InOut)],
        )
        .unwrap();

    let dump = runtime.dump();
    let root = dump
        .nodes
        .iter()
        .find(|node| node.node_type == NodeKind::Root)
        .expect("root missing from dump");
    let nesting: Vec<_> = dump
        .edges
        .iter()
        .filter(|edge| edge.kind == EdgeKind::Nesting)
        .collect();
    assert_eq!(nesting.len(), 1);
    assert_eq!(nesting[0].source, root.wd_id);
    assert_eq!(nesting[0].target, task.id().get());

    let record = dump
        .nodes
        .iter()
        .find(|node| node.wd_id == task.id().get())
        .unwrap();
    assert_eq!(record.io_accesses.len(), 1);
    let io = &record.io_accesses[0];
    assert!(io.is_input && io.is_output);
    assert_eq!(io.start_address, 0x1_0000);
    assert_eq!(io.end_address, 0x1_0000 + 127);
    assert_eq!(io.size, 128);

    let json = dump.to_json_string().unwrap();
    assert!(json.contains("\"wd_id\""));
}
