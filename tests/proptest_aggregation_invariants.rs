//! Property-based tests for the aggregation engine.
//!
//! 1. **Bound**: `completed + failed <= total` holds for a known total under any
//!    sequence of advance/fail/revise calls, and a rejected call leaves the node
//!    untouched.
//!
//! 2. **Order independence**: a parent's aggregate does not depend on the order
//!    in which its children were added, nor on how they are grouped under
//!    intermediate nodes.
//!
//! 3. **Unknown contagion**: one unknown leaf makes every ancestor unknown; once
//!    every leaf is known the root total is the exact sum.
//!
//! 4. **Idempotence**: replaying an already applied event stream changes nothing.

use proptest::prelude::*;
use tiered_progress::{
    Aggregate, ApplyOutcome, Event, EventOp, NodeId, ProducerId, ProgressTree, Total,
};

// ── Strategies ──────────────────────────────────────────────────────────

#[derive(Clone, Debug)]
enum Op {
    Advance(u64),
    Fail(u64),
    Revise(u64),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0u64..40).prop_map(Op::Advance),
        2 => (0u64..20).prop_map(Op::Fail),
        1 => (0u64..200).prop_map(Op::Revise),
    ]
}

/// A leaf described by its total and the work recorded on it.
#[derive(Clone, Debug)]
struct Leaf {
    total: Option<u64>,
    completed: u64,
    failed: u64,
}

fn leaf() -> impl Strategy<Value = Leaf> {
    (prop::option::weighted(0.8, 0u64..1_000), 0u64..1_000, 0u64..1_000).prop_map(
        |(total, a, b)| match total {
            Some(total) => {
                let completed = a.min(total);
                let failed = b.min(total - completed);
                Leaf {
                    total: Some(total),
                    completed,
                    failed,
                }
            }
            None => Leaf {
                total: None,
                completed: a,
                failed: b,
            },
        },
    )
}

// ── Helpers ─────────────────────────────────────────────────────────────

fn add_leaf(tree: &mut ProgressTree, parent: NodeId, leaf: &Leaf) -> NodeId {
    let id = tree.add_node(Some(parent), Total::from(leaf.total), "leaf").unwrap();
    tree.advance(id, leaf.completed).unwrap();
    tree.mark_failed(id, leaf.failed).unwrap();
    id
}

/// Builds `root -> leaves` in the given order and returns the root aggregate.
fn flat(leaves: &[Leaf]) -> Aggregate {
    let mut tree = ProgressTree::new();
    let root = tree.add_node(None, Total::Unknown, "root").unwrap();
    for leaf in leaves {
        add_leaf(&mut tree, root, leaf);
    }
    tree.aggregate(root).unwrap()
}

/// Builds `root -> group -> leaves[..split]` plus `root -> leaves[split..]`.
fn grouped(leaves: &[Leaf], split: usize) -> Aggregate {
    let mut tree = ProgressTree::new();
    let root = tree.add_node(None, Total::Unknown, "root").unwrap();
    let group = tree.add_node(Some(root), Total::Unknown, "group").unwrap();
    let (inner, outer) = leaves.split_at(split.min(leaves.len()));
    for leaf in inner {
        add_leaf(&mut tree, group, leaf);
    }
    for leaf in outer {
        add_leaf(&mut tree, root, leaf);
    }
    if inner.is_empty() {
        tree.remove_node(group).unwrap();
    }
    tree.aggregate(root).unwrap()
}

// ── Properties ──────────────────────────────────────────────────────────

proptest! {
    #[test]
    fn bound_holds_under_any_op_sequence(
        initial in 0u64..200,
        ops in prop::collection::vec(op(), 1..60),
    ) {
        let mut tree = ProgressTree::new();
        let id = tree.add_node(None, Total::Known(initial), "leaf").unwrap();

        for op in ops {
            let before = tree.node(id).map(|n| (n.total(), n.completed(), n.failed())).unwrap();
            let result = match op {
                Op::Advance(amount) => tree.advance(id, amount),
                Op::Fail(amount) => tree.mark_failed(id, amount),
                Op::Revise(total) => tree.revise_total(id, Total::Known(total)),
            };
            let after = tree.node(id).map(|n| (n.total(), n.completed(), n.failed())).unwrap();

            if result.is_err() {
                prop_assert_eq!(before, after, "rejected call must not mutate");
            }
            let Total::Known(total) = after.0 else {
                panic!("revisions only ever set known totals");
            };
            prop_assert!(after.1 + after.2 <= total);
        }
    }

    #[test]
    fn aggregation_is_order_independent(
        leaves in prop::collection::vec(leaf(), 0..24),
        split in 0usize..24,
    ) {
        let expected = flat(&leaves);

        let reversed: Vec<Leaf> = leaves.iter().rev().cloned().collect();
        prop_assert_eq!(flat(&reversed), expected);

        let mut rotated = leaves.clone();
        if !rotated.is_empty() {
            let mid = split % rotated.len();
            rotated.rotate_left(mid);
        }
        prop_assert_eq!(flat(&rotated), expected);

        prop_assert_eq!(grouped(&leaves, split), expected);

        let summed: Aggregate = leaves
            .iter()
            .map(|l| Aggregate::leaf(Total::from(l.total), l.completed, l.failed))
            .sum();
        if leaves.is_empty() {
            // A childless root reports its own (unknown) total.
            prop_assert_eq!(expected.total, Total::Unknown);
        } else {
            prop_assert_eq!(summed, expected);
        }
    }

    #[test]
    fn unknown_is_contagious_until_resolved(
        known in prop::collection::vec(0u64..500, 0..10),
        unknown_work in 0u64..500,
        extra in 0u64..100,
    ) {
        let mut tree = ProgressTree::new();
        let root = tree.add_node(None, Total::Unknown, "root").unwrap();
        let mid = tree.add_node(Some(root), Total::Unknown, "mid").unwrap();
        for total in &known {
            tree.add_node(Some(root), Total::Known(*total), "known").unwrap();
        }
        let pending = tree.add_node(Some(mid), Total::Unknown, "pending").unwrap();
        tree.advance(pending, unknown_work).unwrap();

        prop_assert_eq!(tree.aggregate(mid).unwrap().total, Total::Unknown);
        prop_assert_eq!(tree.aggregate(root).unwrap().total, Total::Unknown);
        if let Some(fraction) = tree.aggregate(root).unwrap().fraction() {
            prop_assert!(fraction < 1.0);
        }

        tree.revise_total(pending, Total::Known(unknown_work + extra)).unwrap();
        let expected: u64 = known.iter().sum::<u64>() + unknown_work + extra;
        prop_assert_eq!(tree.aggregate(root).unwrap().total, Total::Known(expected));
        prop_assert_eq!(tree.aggregate(root).unwrap().completed, unknown_work);
    }

    #[test]
    fn replaying_a_stream_is_a_no_op(
        advances in prop::collection::vec(0u64..50, 0..40),
        replay_from in 0usize..40,
    ) {
        let producer = ProducerId::new(3);
        let node = NodeId::new(producer, 1);
        let mut events = vec![Event {
            producer,
            sequence: 1,
            node,
            op: EventOp::Create { parent: None, total: Total::Unknown, label: "stream".into() },
        }];
        events.extend(advances.iter().enumerate().map(|(i, amount)| Event {
            producer,
            sequence: i as u64 + 2,
            node,
            op: EventOp::Advance(*amount),
        }));

        let mut tree = ProgressTree::new();
        for event in &events {
            prop_assert_eq!(tree.apply(event).unwrap(), ApplyOutcome::Applied);
        }
        let once = tree.aggregate(node).unwrap();

        let start = replay_from.min(events.len());
        for event in &events[start..] {
            prop_assert_eq!(tree.apply(event).unwrap(), ApplyOutcome::Duplicate);
        }
        prop_assert_eq!(tree.aggregate(node).unwrap(), once);
        prop_assert_eq!(once.completed, advances.iter().sum::<u64>());
        prop_assert_eq!(tree.watermark(producer), events.len() as u64);
    }
}
