//! End-to-end scenarios driven through the public producer / tracker API.

use std::{
    sync::{
        Arc, Barrier,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use tiered_progress::{Aggregate, NodeState, ProgressError, Total, TrackerBuilder};

/// Incremental discovery: a project of two sized files, then a file of unknown
/// size, then that size becoming known.
#[test]
fn incremental_discovery() {
    let (tracker, sender) = TrackerBuilder::new().build();
    let monitor = tracker.monitor();
    let producer = sender.producer();

    let project = producer.create(None, Total::Unknown, "project").unwrap();
    let a = project.create_child(Total::Known(10), "a").unwrap();
    let b = project.create_child(Total::Known(10), "b").unwrap();
    a.advance(10).unwrap();
    b.advance(10).unwrap();
    tracker.pump();

    let agg = monitor.aggregate(project.id()).unwrap();
    assert_eq!((agg.completed, agg.total), (20, Total::Known(20)));
    assert!(agg.is_complete());

    let c = project.create_child(Total::Unknown, "c").unwrap();
    tracker.pump();
    let agg = monitor.aggregate(project.id()).unwrap();
    assert_eq!((agg.completed, agg.total), (20, Total::Unknown));
    assert!(agg.fraction().unwrap() < 1.0);

    c.revise_total(Total::Known(5)).unwrap();
    c.advance(5).unwrap();
    tracker.pump();
    let agg = monitor.aggregate(project.id()).unwrap();
    assert_eq!((agg.completed, agg.total), (25, Total::Known(25)));

    let snap = monitor.snapshot(project.id()).unwrap();
    assert_eq!(snap.children().len(), 3);
    assert!(snap.children().iter().all(|child| child.state() == NodeState::Completed));
}

/// Two producers on separate threads, each advancing its own leaf 1000 times.
#[test]
fn concurrent_producers() {
    const PER_PRODUCER: u64 = 1000;

    let (tracker, sender) = TrackerBuilder::new().with_capacity(64).build();
    let monitor = tracker.monitor();
    let root = tracker
        .with_tree_mut(|tree| tree.add_node(None, Total::Unknown, "root"))
        .unwrap();

    let owner = thread::spawn(move || tracker.run());
    let barrier = Arc::new(Barrier::new(2));

    let workers: Vec<_> = (0..2)
        .map(|i| {
            let producer = sender.producer();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let leaf = producer
                    .create(Some(root), Total::Known(PER_PRODUCER), format!("leaf-{i}"))
                    .unwrap();
                barrier.wait();
                for _ in 0..PER_PRODUCER {
                    leaf.advance(1).unwrap();
                }
            })
        })
        .collect();
    drop(sender);

    for worker in workers {
        worker.join().unwrap();
    }
    let report = owner.join().unwrap();

    assert_eq!(report.applied, 2 + 2 * PER_PRODUCER as usize);
    assert!(report.rejected.is_empty());
    let agg = monitor.aggregate(root).unwrap();
    assert_eq!(agg.completed, 2 * PER_PRODUCER);
    assert_eq!(agg.total, Total::Known(2 * PER_PRODUCER));
    assert!(agg.is_complete());
}

/// A renderer snapshotting in a loop while batches land never sees a root that
/// disagrees with its children, nor one that goes backwards.
#[test]
fn snapshots_stay_consistent_under_load() {
    const PRODUCERS: u64 = 4;
    const PER_PRODUCER: u64 = 500;

    let (tracker, sender) = TrackerBuilder::new().with_capacity(16).build();
    let monitor = tracker.monitor();
    let root = tracker
        .with_tree_mut(|tree| tree.add_node(None, Total::Unknown, "root"))
        .unwrap();

    let stop = Arc::new(AtomicBool::new(false));
    let reader = {
        let monitor = monitor.clone();
        let stop = Arc::clone(&stop);
        thread::spawn(move || {
            let mut seen = 0;
            let mut snapshots = 0usize;
            loop {
                let done = stop.load(Ordering::Acquire);
                let tree = monitor.snapshot_all();
                let snap = tree.find(root).unwrap();
                let agg = snap.aggregate();
                if !snap.children().is_empty() {
                    let summed: Aggregate =
                        snap.children().iter().map(|child| child.aggregate()).sum();
                    assert_eq!(agg, summed);
                }
                assert!(agg.completed >= seen, "root went from {seen} to {}", agg.completed);
                seen = agg.completed;
                snapshots += 1;
                if done {
                    return snapshots;
                }
            }
        })
    };

    let owner = thread::spawn(move || tracker.run());
    let workers: Vec<_> = (0..PRODUCERS)
        .map(|i| {
            let producer = sender.producer();
            thread::spawn(move || {
                let leaf = producer
                    .create(Some(root), Total::Known(PER_PRODUCER), format!("leaf-{i}"))
                    .unwrap();
                for _ in 0..PER_PRODUCER {
                    leaf.advance(1).unwrap();
                }
            })
        })
        .collect();
    drop(sender);

    for worker in workers {
        worker.join().unwrap();
    }
    let report = owner.join().unwrap();
    stop.store(true, Ordering::Release);
    assert!(reader.join().unwrap() > 0);

    assert!(report.rejected.is_empty());
    let agg = monitor.aggregate(root).unwrap();
    assert_eq!(agg.completed, PRODUCERS * PER_PRODUCER);
    assert!(agg.is_complete());
}

/// Removing a child drops its contribution from every ancestor.
#[test]
fn removal_exclusion() {
    let (tracker, sender) = TrackerBuilder::new().build();
    let monitor = tracker.monitor();
    let producer = sender.producer();

    let root = producer.create(None, Total::Unknown, "root").unwrap();
    let kept = root.create_child(Total::Known(200), "kept").unwrap();
    let dropped = root.create_child(Total::Known(100), "dropped").unwrap();
    kept.advance(100).unwrap();
    dropped.advance(50).unwrap();
    tracker.pump();

    let agg = monitor.aggregate(root.id()).unwrap();
    assert_eq!((agg.completed, agg.total), (150, Total::Known(300)));

    dropped.remove().unwrap();
    // Events for a removed node are rejected, not applied.
    dropped.advance(1).unwrap();
    let report = tracker.pump();
    assert!(matches!(
        report.rejected.as_slice(),
        [rejected] if matches!(rejected.error, ProgressError::UnknownNode(_))
    ));

    let agg = monitor.aggregate(root.id()).unwrap();
    assert_eq!((agg.completed, agg.total), (100, Total::Known(200)));
    assert_eq!(
        monitor.snapshot(dropped.id()).unwrap().state(),
        NodeState::Removed
    );
}

/// Estimation scales known child totals up to the announced child count.
#[test]
fn estimate_from_partial_discovery() {
    let (tracker, sender) = TrackerBuilder::new().build();
    let monitor = tracker.monitor();
    let producer = sender.producer();

    let batch = producer.create(None, Total::Unknown, "batch").unwrap();
    batch.expect_children(4).unwrap();
    let first = batch.create_child(Total::Known(30), "first").unwrap();
    let _second = batch.create_child(Total::Unknown, "second").unwrap();
    first.advance(30).unwrap();
    tracker.pump();

    assert_eq!(monitor.aggregate(batch.id()).unwrap().total, Total::Unknown);
    assert_eq!(monitor.estimate(batch.id()).unwrap(), Some(120));
}

/// Failed units are reported next to completed ones and settle the node.
#[test]
fn failures_settle_without_completing() {
    let (tracker, sender) = TrackerBuilder::new().build();
    let monitor = tracker.monitor();
    let producer = sender.producer();

    let job = producer.create(None, Total::Known(10), "job").unwrap();
    job.advance(7).unwrap();
    job.fail(3).unwrap();
    tracker.pump();

    let agg = monitor.aggregate(job.id()).unwrap();
    assert_eq!((agg.completed, agg.failed), (7, 3));
    assert!(agg.is_settled());
    assert!(!agg.is_complete());
    assert_eq!(monitor.snapshot(job.id()).unwrap().state(), NodeState::Failed);
    assert!(monitor.is_all_settled());
}

/// A saturated channel pushes back on producers instead of dropping events.
#[test]
fn backpressure_surfaces_to_producers() {
    let (tracker, sender) = TrackerBuilder::new()
        .with_capacity(3)
        .with_submit_timeout(Duration::from_millis(10))
        .build();
    let producer = sender.producer();

    let task = producer.create(None, Total::Unknown, "task").unwrap();
    task.advance(1).unwrap();
    task.advance(1).unwrap();
    let err = task.advance(1).unwrap_err();
    assert!(err.is_retryable());

    tracker.pump();
    task.advance(1).unwrap();
    tracker.pump();
    assert_eq!(tracker.monitor().aggregate(task.id()).unwrap().completed, 3);
}

/// Once the owner is gone producers see a closed channel; applied state survives
/// in any monitor still held.
#[test]
fn owner_gone_closes_channel() {
    let (tracker, sender) = TrackerBuilder::new().build();
    let monitor = tracker.monitor();
    let task = sender.producer().create(None, Total::Known(4), "task").unwrap();
    task.advance(2).unwrap();
    tracker.pump();
    drop(tracker);

    assert!(matches!(task.advance(1), Err(ProgressError::ChannelClosed)));
    assert_eq!(monitor.aggregate(task.id()).unwrap().completed, 2);
}
